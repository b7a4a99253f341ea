//! basE91 binary-to-text encoding
//!
//! The tracker packs every binary payload (image fragments, track points, log
//! backlogs) into APRS frames using basE91. The encoder keeps a little-endian
//! bit queue and emits 13 or 14 bits at a time as two base-91 digits (least
//! significant digit first). 13 bits are used whenever the 13-bit value is
//! above 88, because then the two digits can't be confused with a 14-bit
//! value. The final partial group is flushed as one or two digits.
//!
//! - [basE91 project page][1]
//!
//! [1]: https://base91.sourceforge.net/

pub const ALPHABET: &[u8; 91] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789!#$%&()*+,./:;<=>?@[]^_`{|}~\"";

/// Marks bytes that are not part of the alphabet in [`DECODE_TABLE`].
const INVALID: u8 = 0xff;

const DECODE_TABLE: [u8; 256] = {
    let mut table = [INVALID; 256];
    let mut i = 0;
    while i < ALPHABET.len() {
        table[ALPHABET[i] as usize] = i as u8;
        i += 1;
    }
    table
};

#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum DecodeError {
    #[error("invalid base91 symbol {symbol:?} at position {position}")]
    InvalidSymbol { symbol: char, position: usize },
}

/// Returns the digit value of `symbol`, if it's part of the alphabet.
pub fn digit(symbol: u8) -> Option<u8> {
    let value = DECODE_TABLE[usize::from(symbol)];
    (value != INVALID).then_some(value)
}

pub fn encode(data: &[u8]) -> String {
    let mut output = String::with_capacity(encoded_len(data.len()));
    let mut queue: u32 = 0;
    let mut num_bits: u32 = 0;

    let mut push = |value: u32| output.push(char::from(ALPHABET[value as usize]));

    for byte in data {
        queue |= u32::from(*byte) << num_bits;
        num_bits += 8;

        if num_bits > 13 {
            let mut value = queue & 8191;

            if value > 88 {
                queue >>= 13;
                num_bits -= 13;
            }
            else {
                value = queue & 16383;
                queue >>= 14;
                num_bits -= 14;
            }

            push(value % 91);
            push(value / 91);
        }
    }

    if num_bits > 0 {
        push(queue % 91);
        if num_bits > 7 || queue > 90 {
            push(queue / 91);
        }
    }

    output
}

pub fn decode(input: &str) -> Result<Vec<u8>, DecodeError> {
    let mut output = Vec::with_capacity(input.len() * 14 / 16 + 1);
    let mut queue: u32 = 0;
    let mut num_bits: u32 = 0;
    let mut pending: Option<u32> = None;

    for (position, symbol) in input.bytes().enumerate() {
        let value = u32::from(digit(symbol).ok_or_else(|| {
            DecodeError::InvalidSymbol {
                // the input is a str, so anything outside ASCII is reported as the
                // replacement character instead of a partial UTF-8 sequence.
                symbol: if symbol.is_ascii() {
                    char::from(symbol)
                }
                else {
                    char::REPLACEMENT_CHARACTER
                },
                position,
            }
        })?);

        match pending.take() {
            None => pending = Some(value),
            Some(low) => {
                let value = low + value * 91;
                queue |= value << num_bits;
                num_bits += if value & 8191 > 88 { 13 } else { 14 };

                loop {
                    output.push(queue as u8);
                    queue >>= 8;
                    num_bits -= 8;
                    if num_bits <= 7 {
                        break;
                    }
                }
            }
        }
    }

    if let Some(low) = pending {
        output.push((queue | low << num_bits) as u8);
    }

    Ok(output)
}

/// Upper bound of the encoded length for `len` input bytes.
pub fn encoded_len(len: usize) -> usize {
    (len * 16).div_ceil(13)
}
