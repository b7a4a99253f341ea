//! # Ground station for Pecan balloon trackers
//!
//! Receives APRS frames from a TNC, stdin or APRS-IS, decodes positions, log
//! backlogs and SSDV image fragments, stores them in SQLite, renders images
//! with the `ssdv` decoder and uploads packets to an SSDV server.

pub mod aprs;
pub mod base91;
pub mod callsign;
pub mod database;
pub mod forward;
pub mod image;
pub mod pipeline;
pub mod position;
pub mod source;
pub mod util;
