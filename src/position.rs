//! Position and telemetry decoding
//!
//! # Compressed position
//!
//! ```text
//! T YYYY XXXX C AA S
//! ```
//!
//! `T`/`C` are the APRS symbol table and code, `YYYY`/`XXXX` latitude and
//! longitude as 4-digit base-91 numbers (each symbol minus 33, most significant
//! first), `AA` the altitude as 2-digit base-91 number and `S` the compression
//! type byte, which carries the GPS fix flag in bit 5.
//!
//! - [APRS 1.0.1 spec, chapter 9][1]
//!
//! # Track point
//!
//! Newer firmware sends its whole track point as base91 in the position
//! comment. It's a packed little-endian struct, see [`TrackPoint`].
//!
//! [1]: http://www.aprs.org/doc/APRS101.PDF

use bitflags::bitflags;
use bytes::Buf;
use chrono::{
    DateTime,
    Days,
    NaiveTime,
    Utc,
};
use serde::{
    Deserialize,
    Serialize,
};

use crate::{
    aprs::{
        COMPRESSED_POSITION_LENGTH,
        Hhmmss,
        PositionReport,
    },
    base91,
};

/// Offset of base-91 digits in compressed positions and telemetry.
const DIGIT_OFFSET: u8 = 33;

const LATITUDE_SCALE: f64 = 380926.0;
const LONGITUDE_SCALE: f64 = 190463.0;
const ALTITUDE_BASE: f64 = 1.002;
const FEET_PER_METER: f64 = 3.281;

/// Bit 5 of the compression type: GPS fix is current.
const GPS_FIX_CURRENT: u8 = 0b0010_0000;

const LOG_RECORD_LENGTH: usize = 10;
/// Erased flash reads as all ones.
const LOG_RECORD_UNSET: u32 = 0xffff_ffff;

#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum DecodeError {
    #[error("invalid compressed position symbol {symbol:?} at {position}")]
    InvalidSymbol { symbol: char, position: usize },
    #[error("compressed position must be {COMPRESSED_POSITION_LENGTH} symbols, got {actual}")]
    InvalidLength { actual: usize },
    #[error("unexpected payload length: {actual} bytes is not a multiple of {multiple_of}")]
    UnexpectedLength { actual: usize, multiple_of: usize },
    #[error("base91 error")]
    Base91(#[from] base91::DecodeError),
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct CompressedPosition {
    /// Degrees, north positive.
    pub latitude: f64,
    /// Degrees, east positive.
    pub longitude: f64,
    /// Meters
    pub altitude: f64,
    pub gps_fix: bool,
}

impl CompressedPosition {
    pub fn decode(s: &str) -> Result<Self, DecodeError> {
        let bytes = s.as_bytes();
        if bytes.len() != COMPRESSED_POSITION_LENGTH {
            return Err(DecodeError::InvalidLength {
                actual: bytes.len(),
            });
        }

        let digits = |range: std::ops::Range<usize>| -> Result<u32, DecodeError> {
            let start = range.start;
            bytes[range]
                .iter()
                .enumerate()
                .try_fold(0u32, |value, (i, symbol)| {
                    Ok(value * 91 + u32::from(digit(*symbol, start + i)?))
                })
        };

        let ye = digits(1..5)?;
        let xe = digits(5..9)?;
        let ze = digits(10..12)?;
        let status = digit(bytes[12], 12)?;

        Ok(Self {
            latitude: 90.0 - f64::from(ye) / LATITUDE_SCALE,
            longitude: f64::from(xe) / LONGITUDE_SCALE - 180.0,
            altitude: decode_altitude(ze),
            gps_fix: status & GPS_FIX_CURRENT != 0,
        })
    }
}

fn digit(symbol: u8, position: usize) -> Result<u8, DecodeError> {
    symbol
        .checked_sub(DIGIT_OFFSET)
        .filter(|value| *value < 91)
        .ok_or(DecodeError::InvalidSymbol {
            symbol: char::from(symbol),
            position,
        })
}

/// The altitude is encoded logarithmically in feet: `1.002^value` feet.
pub fn decode_altitude(value: u32) -> f64 {
    ALTITUDE_BASE.powf(f64::from(value)) / FEET_PER_METER
}

/// Resolves a time of day against `now`.
///
/// Trackers only send the time of day. If that lies in the future, the packet
/// was sampled yesterday.
pub fn resolve_time_of_day(time: Hhmmss, now: DateTime<Utc>) -> DateTime<Utc> {
    let time_of_day = NaiveTime::from_hms_opt(time.hour.into(), time.minute.into(), time.second.into())
        .unwrap_or_default();
    let resolved = now.date_naive().and_time(time_of_day).and_utc();

    if resolved > now {
        resolved
            .checked_sub_days(Days::new(1))
            .unwrap_or(resolved)
    }
    else {
        resolved
    }
}

/// The `|SSAABBCCDDEE|` telemetry block: sequence and 5 analog channels.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TelemetryChannels {
    pub sequence: u16,
    pub values: [u16; 5],
}

impl TelemetryChannels {
    /// Symbols between the pipes.
    pub const LENGTH: usize = 12;

    pub fn decode(s: &str) -> Result<Self, DecodeError> {
        let bytes = s.as_bytes();
        if bytes.len() != Self::LENGTH {
            return Err(DecodeError::InvalidLength {
                actual: bytes.len(),
            });
        }

        let mut values = [0u16; 6];
        for (i, value) in values.iter_mut().enumerate() {
            let high = digit(bytes[2 * i], 2 * i)?;
            let low = digit(bytes[2 * i + 1], 2 * i + 1)?;
            *value = u16::from(high) * 91 + u16::from(low);
        }

        Ok(Self {
            sequence: values[0],
            values: [values[1], values[2], values[3], values[4], values[5]],
        })
    }
}

/// Track point as sampled by the tracker.
///
/// 72 bytes, packed, little-endian. Units as sent by the tracker, see the
/// accessor methods for physical values.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackPoint {
    /// Solar voltage in mV
    pub adc_vsol: u16,
    /// Battery voltage in mV
    pub adc_vbat: u16,
    pub pac_vsol: u16,
    pub pac_vbat: u16,
    pub pac_pbat: i16,
    pub pac_psol: i16,
    pub light_intensity: u16,

    pub gps_lock: GpsLock,
    pub gps_sats: u8,
    /// Time to first fix in seconds
    pub gps_ttff: u8,
    /// Position DOP in 0.05 per unit
    pub gps_pdop: u8,
    /// Meters
    pub gps_alt: u16,
    /// 10^-7 degrees
    pub gps_lat: i32,
    /// 10^-7 degrees
    pub gps_lon: i32,

    /// Air pressure in 0.1 Pa: on-board, external 1, external 2
    pub sen_press: [u32; 3],
    /// Temperature in 0.01 °C
    pub sen_temp: [i16; 3],
    /// Relative humidity in %
    pub sen_hum: [u8; 3],

    /// 0.01 °C
    pub stm32_temp: i16,
    /// 0.01 °C
    pub si4464_temp: i16,

    pub reset: u16,
    /// Monotonic record id
    pub id: u32,
    /// Unix timestamp of the GPS fix
    pub gps_time: u32,
    /// Seconds since boot
    pub sys_time: u32,
    pub sys_error: u32,
}

impl TrackPoint {
    pub const LENGTH: usize = 72;

    pub fn decode(mut buffer: &[u8]) -> Option<Self> {
        if buffer.len() != Self::LENGTH {
            return None;
        }

        let adc_vsol = buffer.get_u16_le();
        let adc_vbat = buffer.get_u16_le();
        let pac_vsol = buffer.get_u16_le();
        let pac_vbat = buffer.get_u16_le();
        let pac_pbat = buffer.get_i16_le();
        let pac_psol = buffer.get_i16_le();
        let light_intensity = buffer.get_u16_le();
        let gps_lock = GpsLock::from_u8(buffer.get_u8());
        let gps_sats = buffer.get_u8();
        let gps_ttff = buffer.get_u8();
        let gps_pdop = buffer.get_u8();
        let gps_alt = buffer.get_u16_le();
        let gps_lat = buffer.get_i32_le();
        let gps_lon = buffer.get_i32_le();
        let sen_press = [buffer.get_u32_le(), buffer.get_u32_le(), buffer.get_u32_le()];
        let sen_temp = [buffer.get_i16_le(), buffer.get_i16_le(), buffer.get_i16_le()];
        let sen_hum = [buffer.get_u8(), buffer.get_u8(), buffer.get_u8()];
        buffer.advance(1); // padding
        let stm32_temp = buffer.get_i16_le();
        let si4464_temp = buffer.get_i16_le();
        let reset = buffer.get_u16_le();
        let id = buffer.get_u32_le();
        let gps_time = buffer.get_u32_le();
        let sys_time = buffer.get_u32_le();
        let sys_error = buffer.get_u32_le();

        Some(Self {
            adc_vsol,
            adc_vbat,
            pac_vsol,
            pac_vbat,
            pac_pbat,
            pac_psol,
            light_intensity,
            gps_lock,
            gps_sats,
            gps_ttff,
            gps_pdop,
            gps_alt,
            gps_lat,
            gps_lon,
            sen_press,
            sen_temp,
            sen_hum,
            stm32_temp,
            si4464_temp,
            reset,
            id,
            gps_time,
            sys_time,
            sys_error,
        })
    }

    pub fn latitude(&self) -> f64 {
        f64::from(self.gps_lat) / 1e7
    }

    pub fn longitude(&self) -> f64 {
        f64::from(self.gps_lon) / 1e7
    }

    pub fn pressure_pa(&self, sensor: usize) -> Option<f64> {
        self.sen_press
            .get(sensor)
            .map(|raw| f64::from(*raw) / 10.0)
    }

    pub fn temperature_celsius(&self, sensor: usize) -> Option<f64> {
        self.sen_temp
            .get(sensor)
            .map(|raw| f64::from(*raw) / 100.0)
    }

    pub fn gps_time(&self) -> Option<DateTime<Utc>> {
        (self.gps_time != 0)
            .then(|| DateTime::from_timestamp(self.gps_time.into(), 0))
            .flatten()
    }

    pub fn errors(&self) -> SystemErrors {
        SystemErrors::from_bits_retain(self.sys_error)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum GpsLock {
    /// Locked, GPS switched off afterwards
    Locked1,
    /// Locked, GPS kept on
    Locked2,
    Loss,
    LowBattery1,
    LowBattery2,
    /// Position was taken from the log after power-up
    FromLog,
    Off,
    Error,
    Unknown(u8),
}

impl GpsLock {
    pub fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Locked1,
            1 => Self::Locked2,
            2 => Self::Loss,
            3 => Self::LowBattery1,
            4 => Self::LowBattery2,
            5 => Self::FromLog,
            6 => Self::Off,
            7 => Self::Error,
            _ => Self::Unknown(value),
        }
    }

    pub fn is_locked(&self) -> bool {
        matches!(self, Self::Locked1 | Self::Locked2)
    }
}

bitflags! {
    /// `sys_error` of a track point.
    ///
    /// Bits 3-4 (PAC1720), 5-7 (OV5640) and 8-13 (BME280, 2 bits each) are
    /// status codes, use the accessor methods for those.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct SystemErrors: u32 {
        const I2C1 = 1 << 0;
        const I2C2 = 1 << 1;
        const GPS = 1 << 2;
    }
}

impl SystemErrors {
    pub fn pac1720_status(&self) -> u8 {
        ((self.bits() >> 3) & 0b11) as u8
    }

    pub fn ov5640_status(&self) -> u8 {
        ((self.bits() >> 5) & 0b111) as u8
    }

    /// `sensor`: 0 on-board, 1 and 2 external.
    pub fn bme280_status(&self, sensor: u8) -> SensorStatus {
        match (self.bits() >> (8 + 2 * u32::from(sensor.min(2)))) & 0b11 {
            0 => SensorStatus::Ok,
            1 => SensorStatus::Fail,
            2 => SensorStatus::NotFitted,
            _ => SensorStatus::Unknown,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SensorStatus {
    Ok,
    Fail,
    NotFitted,
    Unknown,
}

/// A fully decoded position report.
#[derive(Clone, Debug, PartialEq)]
pub struct Position {
    pub time: DateTime<Utc>,
    pub latitude: f64,
    pub longitude: f64,
    /// Meters
    pub altitude: f64,
    pub gps_fix: bool,
    pub comment: Option<String>,
    pub telemetry: Option<TelemetryChannels>,
    pub track_point: Option<TrackPoint>,
}

impl Position {
    pub fn decode(report: &PositionReport, received: DateTime<Utc>) -> Result<Self, DecodeError> {
        let compressed = CompressedPosition::decode(&report.compressed)?;

        let telemetry = report
            .telemetry
            .as_deref()
            .map(TelemetryChannels::decode)
            .transpose()?;

        // the comment is either a base91 encoded track point or free text
        let track_point = base91::decode(&report.comment)
            .ok()
            .and_then(|bytes| TrackPoint::decode(&bytes));
        let comment = (track_point.is_none() && !report.comment.is_empty())
            .then(|| report.comment.clone());

        let time = match (report.timestamp, track_point.and_then(|tp| tp.gps_time())) {
            (Some(time_of_day), _) => resolve_time_of_day(time_of_day, received),
            (None, Some(gps_time)) => gps_time,
            (None, None) => received,
        };

        Ok(Self {
            time,
            latitude: compressed.latitude,
            longitude: compressed.longitude,
            altitude: compressed.altitude,
            gps_fix: compressed.gps_fix,
            comment,
            telemetry,
            track_point,
        })
    }
}

/// A record from a log backlog transmission.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct LogRecord {
    pub time: DateTime<Utc>,
    pub latitude: f64,
    pub longitude: f64,
    /// Meters
    pub altitude: u16,
}

/// Decodes a base91 log backlog into its records.
///
/// Each record is 10 bytes: `time u32, lat u16, lon u16, alt u16`, all
/// little-endian. Unset records are skipped.
pub fn decode_log(encoded: &str) -> Result<Vec<LogRecord>, DecodeError> {
    let data = base91::decode(encoded)?;
    if data.is_empty() || data.len() % LOG_RECORD_LENGTH != 0 {
        return Err(DecodeError::UnexpectedLength {
            actual: data.len(),
            multiple_of: LOG_RECORD_LENGTH,
        });
    }

    Ok(data
        .chunks_exact(LOG_RECORD_LENGTH)
        .filter_map(|mut chunk| {
            let time = chunk.get_u32_le();
            let latitude = chunk.get_u16_le();
            let longitude = chunk.get_u16_le();
            let altitude = chunk.get_u16_le();

            if time == LOG_RECORD_UNSET {
                return None;
            }

            Some(LogRecord {
                time: DateTime::from_timestamp(time.into(), 0)?,
                latitude: f64::from(latitude) * 180.0 / 65536.0 - 90.0,
                longitude: f64::from(longitude) * 360.0 / 65536.0 - 180.0,
                altitude,
            })
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use approx::assert_abs_diff_eq;
    use bytes::BufMut;
    use chrono::{
        DateTime,
        TimeZone,
        Utc,
    };

    use crate::{
        aprs::{
            Hhmmss,
            Payload,
            PositionReport,
            classify,
        },
        base91,
        position::{
            CompressedPosition,
            DecodeError,
            GpsLock,
            Position,
            SensorStatus,
            SystemErrors,
            TelemetryChannels,
            TrackPoint,
            decode_altitude,
            decode_log,
            resolve_time_of_day,
        },
    };

    #[test]
    fn it_decodes_the_north_pole() {
        // all digits zero: ye = 0, xe = 0, ze = 0
        let position = CompressedPosition::decode("/!!!!!!!!O!!!").unwrap();
        assert_eq!(position.latitude, 90.0);
        assert_eq!(position.longitude, -180.0);
        assert_eq!(position.altitude, 1.0 / 3.281);
        assert!(!position.gps_fix);
    }

    #[test]
    fn it_decodes_a_hand_encoded_position() {
        // latitude 52.5: 380926 * 37.5 = 14284725 = 18 * 91^3 + 87 * 91^2
        // longitude 13.5: trunc(190463 * 193.5) = 36854590 = 48 * 91^3 + 82 * 91^2 + 45 * 91 + 45
        // altitude: 50 * 91 + 60 = 4610
        // compression type: fix current
        let position = CompressedPosition::decode("/3x!!QsNNOS]A").unwrap();
        assert_eq!(position.latitude, 52.5);
        assert_abs_diff_eq!(position.longitude, 13.5, epsilon = 1e-5);
        assert_abs_diff_eq!(position.altitude, 3049.2289, epsilon = 1e-3);
        assert!(position.gps_fix);
    }

    #[test]
    fn it_decodes_the_altitude_with_a_real_power() {
        for value in [0, 1, 4610, 90 * 91 + 90] {
            assert_eq!(
                decode_altitude(value),
                1.002f64.powf(f64::from(value)) / 3.281
            );
        }
    }

    #[test]
    fn it_rejects_out_of_range_symbols() {
        assert_eq!(
            CompressedPosition::decode("/ !!!!!!!O!!!"),
            Err(DecodeError::InvalidSymbol {
                symbol: ' ',
                position: 1
            })
        );
        assert!(matches!(
            CompressedPosition::decode("/!!!!"),
            Err(DecodeError::InvalidLength { actual: 5 })
        ));
    }

    #[test]
    fn it_rolls_future_times_back_to_yesterday() {
        let now = Utc.with_ymd_and_hms(2024, 6, 2, 0, 30, 0).unwrap();

        let earlier = Hhmmss {
            hour: 0,
            minute: 10,
            second: 0,
        };
        assert_eq!(
            resolve_time_of_day(earlier, now),
            Utc.with_ymd_and_hms(2024, 6, 2, 0, 10, 0).unwrap()
        );

        let later = Hhmmss {
            hour: 23,
            minute: 59,
            second: 59,
        };
        assert_eq!(
            resolve_time_of_day(later, now),
            Utc.with_ymd_and_hms(2024, 6, 1, 23, 59, 59).unwrap()
        );
    }

    #[test]
    fn it_decodes_telemetry_channels() {
        // sequence 91 + 1 = 92, then 0, 1, 2, 90, 91*90 + 90
        let telemetry = TelemetryChannels::decode("\"\"!!!\"!#!{{{").unwrap();
        assert_eq!(telemetry.sequence, 92);
        assert_eq!(telemetry.values, [0, 1, 2, 90, 90 * 91 + 90]);

        let error = TelemetryChannels::decode("\"\"!!!\"!#!{{{!!").unwrap_err();
        assert!(matches!(error, DecodeError::InvalidLength { actual: 14 }));
    }

    fn track_point_bytes() -> Vec<u8> {
        let mut buffer = Vec::with_capacity(TrackPoint::LENGTH);
        buffer.put_u16_le(3100); // adc_vsol
        buffer.put_u16_le(4012); // adc_vbat
        buffer.put_u16_le(3090);
        buffer.put_u16_le(4000);
        buffer.put_i16_le(-250); // pac_pbat
        buffer.put_i16_le(120);
        buffer.put_u16_le(777);
        buffer.put_u8(1); // gps_lock
        buffer.put_u8(9);
        buffer.put_u8(42);
        buffer.put_u8(30);
        buffer.put_u16_le(11873);
        buffer.put_i32_le(525_000_000);
        buffer.put_i32_le(-1_350_000_000);
        buffer.put_u32_le(1_013_250);
        buffer.put_u32_le(0);
        buffer.put_u32_le(0);
        buffer.put_i16_le(-4_250);
        buffer.put_i16_le(0);
        buffer.put_i16_le(0);
        buffer.put_u8(12);
        buffer.put_u8(0);
        buffer.put_u8(0);
        buffer.put_u8(0); // padding
        buffer.put_i16_le(2_133);
        buffer.put_i16_le(-1_050);
        buffer.put_u16_le(3); // reset
        buffer.put_u32_le(4711); // id
        buffer.put_u32_le(1_717_286_400); // gps_time: 2024-06-02T00:00:00Z
        buffer.put_u32_le(86_400);
        buffer.put_u32_le(0b10_0000_0000_0101);
        assert_eq!(buffer.len(), TrackPoint::LENGTH);
        buffer
    }

    #[test]
    fn it_decodes_a_track_point() {
        let track_point = TrackPoint::decode(&track_point_bytes()).unwrap();

        assert_eq!(track_point.adc_vbat, 4012);
        assert_eq!(track_point.pac_pbat, -250);
        assert_eq!(track_point.gps_lock, GpsLock::Locked2);
        assert!(track_point.gps_lock.is_locked());
        assert_eq!(track_point.gps_alt, 11873);
        assert_eq!(track_point.latitude(), 52.5);
        assert_eq!(track_point.longitude(), -135.0);
        assert_eq!(track_point.pressure_pa(0), Some(101325.0));
        assert_eq!(track_point.temperature_celsius(0), Some(-42.5));
        assert_eq!(track_point.si4464_temp, -1050);
        assert_eq!(track_point.reset, 3);
        assert_eq!(track_point.id, 4711);
        assert_eq!(
            track_point.gps_time(),
            Some(Utc.with_ymd_and_hms(2024, 6, 2, 0, 0, 0).unwrap())
        );

        let errors = track_point.errors();
        assert!(errors.contains(SystemErrors::I2C1 | SystemErrors::GPS));
        assert!(!errors.contains(SystemErrors::I2C2));
        assert_eq!(errors.bme280_status(0), SensorStatus::Ok);
        assert_eq!(errors.bme280_status(1), SensorStatus::Ok);
        assert_eq!(errors.bme280_status(2), SensorStatus::NotFitted);

        assert_eq!(TrackPoint::decode(&track_point_bytes()[1..]), None);
    }

    #[test]
    fn it_takes_the_clock_from_the_track_point() {
        let received = Utc.with_ymd_and_hms(2024, 6, 2, 0, 5, 0).unwrap();
        let report = PositionReport {
            timestamp: None,
            compressed: "/3x!!QsNNOS]A".to_owned(),
            comment: base91::encode(&track_point_bytes()),
            telemetry: Some("!\"!!!\"!#!$!%".to_owned()),
        };

        let position = Position::decode(&report, received).unwrap();
        assert_eq!(position.time, Utc.with_ymd_and_hms(2024, 6, 2, 0, 0, 0).unwrap());
        assert_eq!(position.comment, None);
        assert_eq!(position.track_point.unwrap().id, 4711);
        assert_eq!(position.telemetry.unwrap().sequence, 1);

        let report = PositionReport {
            timestamp: None,
            comment: "hello from the stratosphere".to_owned(),
            telemetry: None,
            ..report
        };
        let position = Position::decode(&report, received).unwrap();
        assert_eq!(position.time, received);
        assert_eq!(position.comment.as_deref(), Some("hello from the stratosphere"));
        assert!(position.track_point.is_none());
    }

    #[test]
    fn it_decodes_a_position_as_sent_by_the_tracker() {
        let line = format!(
            "DL7AD-12>APECAN,qAR,DB0XYZ-10:!/3x!!QsNNOS]A{}|!\"!#!$!%!&!'|",
            base91::encode(&track_point_bytes())
        );
        let report = match classify(&line, "N0CALL").unwrap().payload {
            Payload::Position(report) => report,
            payload => panic!("not a position: {payload:?}"),
        };

        let received = Utc.with_ymd_and_hms(2024, 6, 2, 0, 5, 0).unwrap();
        let position = Position::decode(&report, received).unwrap();
        assert_eq!(
            position.telemetry,
            Some(TelemetryChannels {
                sequence: 1,
                values: [2, 3, 4, 5, 6],
            })
        );
        assert_eq!(position.track_point.unwrap().id, 4711);
        assert_eq!(position.comment, None);
        assert_eq!(position.time, Utc.with_ymd_and_hms(2024, 6, 2, 0, 0, 0).unwrap());
    }

    #[test]
    fn it_decodes_a_log_backlog() {
        let mut data = Vec::new();
        for (time, lat, lon, alt) in [
            (1_717_286_400u32, 32768u16, 32768u16, 1200u16),
            (0xffff_ffff, 0, 0, 0),
            (1_717_286_460, 0, 49152, 35000),
        ] {
            data.put_u32_le(time);
            data.put_u16_le(lat);
            data.put_u16_le(lon);
            data.put_u16_le(alt);
        }

        let records = decode_log(&base91::encode(&data)).unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].time, DateTime::from_timestamp(1_717_286_400, 0).unwrap());
        assert_eq!(records[0].latitude, 0.0);
        assert_eq!(records[0].longitude, 0.0);
        assert_eq!(records[0].altitude, 1200);
        assert_eq!(records[1].latitude, -90.0);
        assert_eq!(records[1].longitude, 90.0);

        assert!(matches!(
            decode_log(&base91::encode(&data[..25])),
            Err(DecodeError::UnexpectedLength { actual: 25, .. })
        ));
    }
}
