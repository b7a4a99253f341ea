//! SSDV image fragments
//!
//! Trackers send their camera images as [SSDV][1] packets, but never the full
//! 256 bytes of it. Each firmware generation strips a different set of fields
//! which we have to put back before the packets can be decoded or uploaded:
//!
//! | generation | marker | length | contents                                          |
//! |------------|--------|--------|---------------------------------------------------|
//! | compact    | `{{I`  | 174    | image id, packet id (BE), 171 data bytes          |
//! | half       | `{{H`  | 90/89  | image id, packet id (BE), half index, 86/85 bytes |
//! | full       | `{{I`  | 219    | SSDV packet without sync byte, CRC and FEC        |
//! | legacy     | `!`    | 214    | like full, without packet type and callsign       |
//!
//! All lengths are after base91 decoding. The FEC trailer is always zero
//! padding; the SSDV decoder accepts that.
//!
//! [1]: https://ukhas.org.uk/doku.php?id=guides:ssdv

pub mod reassembler;
pub mod render;

use std::fmt::Display;

use bytes::{
    BufMut,
    Bytes,
    BytesMut,
};
use crc::{
    CRC_32_ISO_HDLC,
    Crc,
};

use crate::{
    aprs::ImagePayload,
    base91,
    callsign,
};

pub const SSDV_PACKET_LENGTH: usize = 256;

const SYNC: u8 = 0x55;
/// Packet type: normal mode, no FEC.
const PACKET_TYPE_NOFEC: u8 = 0x66;
/// Packet type used by the compact generation.
const PACKET_TYPE_COMPACT: u8 = 0x68;

pub const COMPACT_DATA_LENGTH: usize = 171;
const COMPACT_LENGTH: usize = 3 + COMPACT_DATA_LENGTH;
const FULL_LENGTH: usize = 219;
const LEGACY_LENGTH: usize = 214;
const HALF_HEADER_LENGTH: usize = 4;
const FIRST_HALF_DATA_LENGTH: usize = 86;
const SECOND_HALF_DATA_LENGTH: usize = COMPACT_DATA_LENGTH - FIRST_HALF_DATA_LENGTH;

/// CRC-32 as used by zlib, which is what SSDV uses.
const CRC32: Crc<u32> = Crc::<u32>::new(&CRC_32_ISO_HDLC);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Generation {
    Compact,
    Half,
    Full,
    Legacy,
}

impl Display for Generation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Generation::Compact => "compact",
            Generation::Half => "half",
            Generation::Full => "full",
            Generation::Legacy => "legacy",
        };
        write!(f, "{name}")
    }
}

#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum FragmentError {
    #[error("base91 error")]
    Base91(#[from] base91::DecodeError),
    #[error("unexpected {generation} fragment length: {actual}")]
    UnexpectedLength {
        generation: Generation,
        actual: usize,
    },
    #[error("half index {index} doesn't match a {length} byte half-fragment")]
    InvalidHalf { index: u8, length: usize },
}

/// A complete SSDV packet, 256 bytes.
#[derive(Clone, PartialEq, Eq)]
pub struct SsdvPacket(Bytes);

impl SsdvPacket {
    /// Sync byte, `body`, CRC-32 over `body` and zero padding.
    fn from_body(body: &[u8]) -> Self {
        let mut buffer = BytesMut::with_capacity(SSDV_PACKET_LENGTH);
        buffer.put_u8(SYNC);
        buffer.put_slice(body);
        buffer.put_u32(CRC32.checksum(body));
        buffer.resize(SSDV_PACKET_LENGTH, 0);
        Self(buffer.freeze())
    }

    fn compact(callsign: u32, image_id: u8, packet_id: u16, data: &[u8]) -> Self {
        let mut body = BytesMut::with_capacity(8 + data.len());
        body.put_u8(PACKET_TYPE_COMPACT);
        body.put_u32(callsign);
        body.put_u8(image_id);
        body.put_u16(packet_id);
        body.put_slice(data);
        Self::from_body(&body)
    }

    /// Wraps stored packet bytes, e.g. from the database.
    pub fn from_bytes(bytes: impl Into<Bytes>) -> Option<Self> {
        let bytes = bytes.into();
        (bytes.len() == SSDV_PACKET_LENGTH && bytes[0] == SYNC).then_some(Self(bytes))
    }

    pub fn callsign(&self) -> u32 {
        u32::from_be_bytes([self.0[2], self.0[3], self.0[4], self.0[5]])
    }

    pub fn image_id(&self) -> u8 {
        self.0[6]
    }

    pub fn packet_id(&self) -> u16 {
        u16::from_be_bytes([self.0[7], self.0[8]])
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn to_bytes(&self) -> Bytes {
        self.0.clone()
    }

    pub fn to_hex(&self) -> String {
        hex::encode(&self.0)
    }
}

impl std::fmt::Debug for SsdvPacket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SsdvPacket")
            .field("callsign", &callsign::decode(self.callsign()))
            .field("image_id", &self.image_id())
            .field("packet_id", &self.packet_id())
            .finish()
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Fragment {
    pub image_id: u8,
    pub packet_id: u16,
    pub body: FragmentBody,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum FragmentBody {
    Packet(SsdvPacket),
    /// One half of a compact packet's data. Needs its sibling before it can be
    /// turned into a packet, see [`Fragment::join_halves`].
    Half { index: u8, data: Bytes },
}

impl Fragment {
    /// Decodes a classified image payload. `sender` is needed to restore the
    /// callsign, which most generations don't transmit.
    pub fn parse(payload: &ImagePayload, sender: &str) -> Result<Self, FragmentError> {
        let data = base91::decode(payload.encoded())?;

        match payload {
            ImagePayload::Modern(_) if data.len() == COMPACT_LENGTH => {
                let image_id = data[0];
                let packet_id = u16::from_be_bytes([data[1], data[2]]);
                Ok(Self {
                    image_id,
                    packet_id,
                    body: FragmentBody::Packet(SsdvPacket::compact(
                        callsign::compact(sender),
                        image_id,
                        packet_id,
                        &data[3..],
                    )),
                })
            }
            ImagePayload::Modern(_) if data.len() == FULL_LENGTH => {
                let packet = SsdvPacket::from_body(&data);
                Ok(Self {
                    image_id: packet.image_id(),
                    packet_id: packet.packet_id(),
                    body: FragmentBody::Packet(packet),
                })
            }
            ImagePayload::Modern(_) => {
                Err(FragmentError::UnexpectedLength {
                    generation: if data.len() > COMPACT_LENGTH {
                        Generation::Full
                    }
                    else {
                        Generation::Compact
                    },
                    actual: data.len(),
                })
            }
            ImagePayload::Half(_) => Self::parse_half(data),
            ImagePayload::Legacy(_) => {
                if data.len() != LEGACY_LENGTH {
                    return Err(FragmentError::UnexpectedLength {
                        generation: Generation::Legacy,
                        actual: data.len(),
                    });
                }

                let mut body = BytesMut::with_capacity(5 + data.len());
                body.put_u8(PACKET_TYPE_NOFEC);
                body.put_u32(callsign::compact(sender));
                body.put_slice(&data);
                let packet = SsdvPacket::from_body(&body);

                Ok(Self {
                    image_id: packet.image_id(),
                    packet_id: packet.packet_id(),
                    body: FragmentBody::Packet(packet),
                })
            }
        }
    }

    fn parse_half(data: Vec<u8>) -> Result<Self, FragmentError> {
        if data.len() != HALF_HEADER_LENGTH + FIRST_HALF_DATA_LENGTH
            && data.len() != HALF_HEADER_LENGTH + SECOND_HALF_DATA_LENGTH
        {
            return Err(FragmentError::UnexpectedLength {
                generation: Generation::Half,
                actual: data.len(),
            });
        }

        let index = data[3];
        let expected_length = match index {
            0 => FIRST_HALF_DATA_LENGTH,
            1 => SECOND_HALF_DATA_LENGTH,
            _ => 0,
        };
        if data.len() - HALF_HEADER_LENGTH != expected_length {
            return Err(FragmentError::InvalidHalf {
                index,
                length: data.len(),
            });
        }

        let mut data = Bytes::from(data);
        let header = data.split_to(HALF_HEADER_LENGTH);

        Ok(Self {
            image_id: header[0],
            packet_id: u16::from_be_bytes([header[1], header[2]]),
            body: FragmentBody::Half { index, data },
        })
    }

    /// Builds the compact packet from both halves of its data.
    pub fn join_halves(
        sender: &str,
        image_id: u8,
        packet_id: u16,
        first: &[u8],
        second: &[u8],
    ) -> SsdvPacket {
        let mut data = Vec::with_capacity(COMPACT_DATA_LENGTH);
        data.extend_from_slice(first);
        data.extend_from_slice(second);
        SsdvPacket::compact(callsign::compact(sender), image_id, packet_id, &data)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use bytes::BufMut;

    use crate::{
        aprs::ImagePayload,
        base91,
        callsign,
        image::{
            CRC32,
            COMPACT_DATA_LENGTH,
            Fragment,
            FragmentBody,
            FragmentError,
            Generation,
            SSDV_PACKET_LENGTH,
            SsdvPacket,
        },
    };

    /// A base91 encoded compact fragment with recognizable data.
    pub fn compact_payload(image_id: u8, packet_id: u16, fill: u8) -> ImagePayload {
        let mut data = vec![image_id];
        data.put_u16(packet_id);
        data.extend(std::iter::repeat_n(fill, COMPACT_DATA_LENGTH));
        ImagePayload::Modern(base91::encode(&data))
    }

    pub fn half_payload(image_id: u8, packet_id: u16, index: u8, fill: u8) -> ImagePayload {
        let mut data = vec![image_id];
        data.put_u16(packet_id);
        data.put_u8(index);
        data.extend(std::iter::repeat_n(fill, if index == 0 { 86 } else { 85 }));
        ImagePayload::Half(base91::encode(&data))
    }

    fn packet(fragment: &Fragment) -> &SsdvPacket {
        match &fragment.body {
            FragmentBody::Packet(packet) => packet,
            body => panic!("not a complete packet: {body:?}"),
        }
    }

    #[test]
    fn it_synthesizes_compact_packets() {
        let fragment = Fragment::parse(&compact_payload(3, 0x0102, 0xaa), "DL7AD-11").unwrap();
        assert_eq!(fragment.image_id, 3);
        assert_eq!(fragment.packet_id, 0x0102);

        let packet = packet(&fragment);
        let bytes = packet.as_bytes();
        assert_eq!(bytes.len(), SSDV_PACKET_LENGTH);
        assert_eq!(bytes[..2], [0x55, 0x68]);
        assert_eq!(packet.callsign(), callsign::encode("DL7AD1").unwrap());
        assert_eq!(packet.image_id(), 3);
        assert_eq!(packet.packet_id(), 0x0102);
        assert!(bytes[9..180].iter().all(|b| *b == 0xaa));

        let crc = CRC32.checksum(&bytes[1..180]);
        assert_eq!(bytes[180..184], crc.to_be_bytes());
        assert!(bytes[184..].iter().all(|b| *b == 0));
    }

    #[test]
    fn it_uses_the_zlib_crc() {
        // crc32 of "123456789" as computed by zlib
        assert_eq!(CRC32.checksum(b"123456789"), 0xcbf4_3926);
    }

    #[test]
    fn it_restores_full_and_legacy_packets() {
        let mut full = vec![0x67, 0, 0, 0, 1, 9, 0x00, 0x2a];
        full.resize(219, 0x11);
        let fragment =
            Fragment::parse(&ImagePayload::Modern(base91::encode(&full)), "DL7AD").unwrap();
        assert_eq!((fragment.image_id, fragment.packet_id), (9, 42));
        let bytes = packet(&fragment).as_bytes();
        assert_eq!(bytes[0], 0x55);
        assert_eq!(bytes[1..220], full[..]);
        assert_eq!(bytes[220..224], CRC32.checksum(&full).to_be_bytes());

        let mut legacy = vec![7, 0x01, 0x00];
        legacy.resize(214, 0x22);
        let fragment =
            Fragment::parse(&ImagePayload::Legacy(base91::encode(&legacy)), "DL7AD").unwrap();
        assert_eq!((fragment.image_id, fragment.packet_id), (7, 256));
        let packet = packet(&fragment);
        assert_eq!(packet.as_bytes()[1], 0x66);
        assert_eq!(packet.callsign(), callsign::encode("DL7AD").unwrap());
        assert_eq!(packet.as_bytes().len(), SSDV_PACKET_LENGTH);
    }

    #[test]
    fn it_joins_halves_into_the_compact_packet() {
        let first = Fragment::parse(&half_payload(1, 5, 0, 0xaa), "DL7AD").unwrap();
        let second = Fragment::parse(&half_payload(1, 5, 1, 0xaa), "DL7AD").unwrap();

        let (FragmentBody::Half { index: 0, data: a }, FragmentBody::Half { index: 1, data: b }) =
            (&first.body, &second.body)
        else {
            panic!("not two halves");
        };
        assert_eq!((a.len(), b.len()), (86, 85));

        let joined = Fragment::join_halves("DL7AD", 1, 5, a, b);
        let whole = Fragment::parse(&compact_payload(1, 5, 0xaa), "DL7AD").unwrap();
        assert_eq!(&joined, packet(&whole));
    }

    #[test]
    fn it_rejects_unexpected_lengths() {
        let short = ImagePayload::Modern(base91::encode(&[0; 100]));
        assert_eq!(
            Fragment::parse(&short, "DL7AD"),
            Err(FragmentError::UnexpectedLength {
                generation: Generation::Compact,
                actual: 100
            })
        );

        let legacy = ImagePayload::Legacy(base91::encode(&[0; 213]));
        assert!(matches!(
            Fragment::parse(&legacy, "DL7AD"),
            Err(FragmentError::UnexpectedLength {
                generation: Generation::Legacy,
                ..
            })
        ));

        // second half length with first half index
        let mut half = vec![1, 0, 5, 0];
        half.resize(89, 0);
        assert_eq!(
            Fragment::parse(&ImagePayload::Half(base91::encode(&half)), "DL7AD"),
            Err(FragmentError::InvalidHalf {
                index: 0,
                length: 89
            })
        );
    }

    #[test]
    fn it_round_trips_stored_packets() {
        let fragment = Fragment::parse(&compact_payload(3, 7, 0x42), "DL7AD").unwrap();
        let packet = packet(&fragment);
        assert_eq!(SsdvPacket::from_bytes(packet.to_bytes()).as_ref(), Some(packet));
        assert_eq!(SsdvPacket::from_bytes(vec![0x55; 10]), None);
        assert_eq!(packet.to_hex().len(), 2 * SSDV_PACKET_LENGTH);
    }
}
