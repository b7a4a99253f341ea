//! Callsign compaction
//!
//! SSDV packets identify the sender with a callsign packed into 32 bits. Each
//! character is one base-40 digit, least significant digit first:
//!
//! | digit  | character |
//! |--------|-----------|
//! | 0      | `-`       |
//! | 1..=10 | `0`..=`9` |
//! | 11..=13| `-`       |
//! | 14..=39| `A`..=`Z` |
//!
//! Six characters fit (`40^6 - 1 < 2^32`), so APRS callsigns with an SSID have
//! to be folded into six characters first, see [`fold_ssid`].

const MAX_LENGTH: usize = 6;

#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
#[error("callsign too long to compact: {callsign}")]
pub struct CallsignTooLong {
    pub callsign: String,
}

pub fn encode(callsign: &str) -> Result<u32, CallsignTooLong> {
    if callsign.len() > MAX_LENGTH {
        return Err(CallsignTooLong {
            callsign: callsign.to_owned(),
        });
    }

    Ok(callsign.bytes().rev().fold(0, |code, c| {
        let digit = match c {
            b'A'..=b'Z' => c - 51,
            b'a'..=b'z' => c - 83,
            b'0'..=b'9' => c - 47,
            _ => 0,
        };
        code * 40 + u32::from(digit)
    }))
}

pub fn decode(mut code: u32) -> String {
    let mut callsign = String::with_capacity(MAX_LENGTH);

    while code > 0 {
        let digit = (code % 40) as u8;
        callsign.push(match digit {
            0 => '-',
            1..=10 => char::from(47 + digit),
            11..=13 => '-',
            _ => char::from(51 + digit),
        });
        code /= 40;
    }

    callsign
}

/// Folds a `CALL-SSID` into at most six characters.
///
/// - no SSID: the first six characters of the call
/// - call shorter than 5 characters: call and the first two SSID characters
/// - call with 5 characters: call and the last SSID character
/// - otherwise the first six characters of the call, dropping the SSID
pub fn fold_ssid(callsign: &str) -> String {
    fn truncated(s: &str, n: usize) -> &str {
        s.char_indices().nth(n).map_or(s, |(i, _)| &s[..i])
    }

    // anything after a second dash is ignored
    let mut parts = callsign.split('-');
    let call = parts.next().unwrap_or_default();

    match parts.next().map(|ssid| (call, ssid)) {
        None => truncated(callsign, MAX_LENGTH).to_owned(),
        Some((call, ssid)) if call.len() < 5 => format!("{call}{}", truncated(ssid, 2)),
        Some((call, ssid)) if call.len() < 6 => {
            match ssid.chars().last() {
                Some(last) => format!("{call}{last}"),
                None => call.to_owned(),
            }
        }
        Some((call, _)) => truncated(call, MAX_LENGTH).to_owned(),
    }
}

/// [`fold_ssid`] followed by [`encode`].
pub fn compact(callsign: &str) -> u32 {
    // fold_ssid never produces more than six characters
    encode(&fold_ssid(callsign)).unwrap_or_default()
}
