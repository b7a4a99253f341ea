//! APRS frame classification
//!
//! Frames arrive as TNC2 monitor lines: `SENDER>DEST,PATH1,PATH2:PAYLOAD`.
//! Only frames addressed to [`DESTINATION`] are ours. Depending on the tracker
//! firmware generation the payload type is identified by a different marker:
//!
//! - `!`, `=`: compressed position without timestamp (or a legacy image, see
//!   below)
//! - `/`, `@`: compressed position with `HHMMSSh` timestamp
//! - `{{I`: image fragment, `{{H`: image half-fragment, `{{L`: log backlog
//!
//! The very first firmware sent images right after a `!`. Those frames are
//! told apart from positions by their length.
//!
//! Classification is a pure function. Lines that don't match are reported as
//! `None`, because the channel is noisy and a bad line is not an error.

use std::{
    fmt::Display,
    sync::LazyLock,
};

use regex::Regex;

/// APRS destination used by Pecan trackers (`APExxx` is reserved for
/// experimental devices).
pub const DESTINATION: &str = "APECAN";

/// A compressed position is always 13 symbols long: symbol table, 4 latitude,
/// 4 longitude, symbol code, 2 altitude and the compression type.
pub const COMPRESSED_POSITION_LENGTH: usize = 13;

/// Below this many symbols a `!` payload is a position, not a legacy image.
const LEGACY_IMAGE_MIN_SYMBOLS: usize = 200;

/// `|` + sequence + 5 channels (two symbols each) + `|`
const TELEMETRY_LENGTH: usize = 14;

static FRAME_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"^(?:.*\s)?(?P<sender>[A-Za-z0-9]{1,6}(?:-[A-Za-z0-9]{1,2})?)>APECAN(?P<path>(?:,[^,:]+)*):(?P<payload>.*)$",
    )
    .expect("invalid frame regex")
});

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Envelope {
    pub sender: String,
    pub path: Vec<String>,
    /// Last element of the path, or the local station if the frame didn't
    /// carry a path.
    pub receiver: String,
    pub payload: Payload,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Payload {
    Position(PositionReport),
    Image(ImagePayload),
    Log(String),
    /// Addressed to us, but with a payload marker we don't know.
    Unrecognized { marker: String },
}

impl Payload {
    pub fn kind(&self) -> &'static str {
        match self {
            Payload::Position(_) => "position",
            Payload::Image(_) => "image",
            Payload::Log(_) => "log",
            Payload::Unrecognized { .. } => "unrecognized",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PositionReport {
    pub timestamp: Option<Hhmmss>,
    /// The 13 symbols of the compressed position.
    pub compressed: String,
    /// Everything between the compressed position and the telemetry block.
    /// Newer firmware puts a base91 encoded track point here.
    pub comment: String,
    /// The 12 symbols between the `|` delimiters, if present.
    pub telemetry: Option<String>,
}

/// base91 encoded image payloads, tagged by firmware generation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ImagePayload {
    /// `{{I`
    Modern(String),
    /// `{{H`
    Half(String),
    /// `!` followed by a SSDV body
    Legacy(String),
}

impl ImagePayload {
    pub fn encoded(&self) -> &str {
        match self {
            ImagePayload::Modern(s) | ImagePayload::Half(s) | ImagePayload::Legacy(s) => s,
        }
    }
}

/// Time of day as sent in a position header (`HHMMSSh`). Always UTC.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Hhmmss {
    pub hour: u8,
    pub minute: u8,
    pub second: u8,
}

impl Hhmmss {
    /// Parses the 7 characters `HHMMSSh`.
    pub fn parse(s: &str) -> Option<Self> {
        let bytes = s.as_bytes();
        if bytes.len() != 7 || bytes[6] != b'h' || !bytes[..6].iter().all(u8::is_ascii_digit) {
            return None;
        }

        let pair = |i: usize| (bytes[i] - b'0') * 10 + (bytes[i + 1] - b'0');
        let (hour, minute, second) = (pair(0), pair(2), pair(4));

        (hour < 24 && minute < 60 && second < 60).then_some(Self {
            hour,
            minute,
            second,
        })
    }
}

impl Display for Hhmmss {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:02}:{:02}:{:02}", self.hour, self.minute, self.second)
    }
}

/// Classifies a raw line.
///
/// `local_call` is used as the receiver if the frame carries no path, which
/// is what a local TNC prints for frames it heard directly.
pub fn classify(line: &str, local_call: &str) -> Option<Envelope> {
    let line = line.trim_end_matches(['\r', '\n']);
    let captures = FRAME_REGEX.captures(line)?;

    let sender = captures.name("sender")?.as_str().to_owned();
    let path: Vec<String> = captures
        .name("path")
        .map(|m| m.as_str())
        .unwrap_or_default()
        .split(',')
        .filter(|element| !element.is_empty())
        .map(|element| element.trim_end_matches('*').to_owned())
        .collect();
    let receiver = path
        .last()
        .cloned()
        .unwrap_or_else(|| local_call.to_owned());

    let payload = classify_payload(captures.name("payload")?.as_str())?;

    Some(Envelope {
        sender,
        path,
        receiver,
        payload,
    })
}

fn classify_payload(payload: &str) -> Option<Payload> {
    if let Some(rest) = payload.strip_prefix("{{") {
        let marker = rest.get(..1)?;
        let body = rest[1..].to_owned();
        if body.is_empty() {
            // cut off right after the marker
            return None;
        }

        return Some(match marker {
            "I" => Payload::Image(ImagePayload::Modern(body)),
            "H" => Payload::Image(ImagePayload::Half(body)),
            "L" => Payload::Log(body),
            _ => {
                Payload::Unrecognized {
                    marker: format!("{{{{{marker}"),
                }
            }
        });
    }

    let marker = payload.get(..1)?;
    let rest = &payload[1..];

    match marker {
        "!" | "=" => {
            if rest.len() >= LEGACY_IMAGE_MIN_SYMBOLS {
                Some(Payload::Image(ImagePayload::Legacy(rest.to_owned())))
            }
            else {
                classify_position(None, rest).map(Payload::Position)
            }
        }
        "/" | "@" => {
            let timestamp = Hhmmss::parse(rest.get(..7)?)?;
            classify_position(Some(timestamp), &rest[7..]).map(Payload::Position)
        }
        _ => {
            Some(Payload::Unrecognized {
                marker: marker.to_owned(),
            })
        }
    }
}

fn classify_position(timestamp: Option<Hhmmss>, s: &str) -> Option<PositionReport> {
    let compressed = s.get(..COMPRESSED_POSITION_LENGTH)?;
    let rest = &s[COMPRESSED_POSITION_LENGTH..];

    let (comment, telemetry) = split_telemetry(rest);

    Some(PositionReport {
        timestamp,
        compressed: compressed.to_owned(),
        comment: comment.to_owned(),
        telemetry: telemetry.map(ToOwned::to_owned),
    })
}

/// Splits a trailing `|SSAABBCCDDEE|` telemetry block from the comment.
///
/// The comment itself might be base91 and thus contain `|`, so we only look at
/// the fixed-size tail.
fn split_telemetry(s: &str) -> (&str, Option<&str>) {
    if s.len() >= TELEMETRY_LENGTH && s.ends_with('|') {
        let start = s.len() - TELEMETRY_LENGTH;
        if let Some(tail) = s.get(start..) {
            if tail.starts_with('|') {
                return (&s[..start], Some(&tail[1..TELEMETRY_LENGTH - 1]));
            }
        }
    }

    (s, None)
}
