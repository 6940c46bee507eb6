use chrono::{DateTime, Utc};
use tracing::debug;

use super::{fixed, fraction_micros, timestamp, FieldDecoder};
use crate::codec::{Column, Layout, TimeSource};
use crate::config::SensorConfig;
use crate::framing::RawFrame;
use crate::prelude::*;
use crate::record::DecodedRecord;

/// Decoder for POS-1 overhauser magnetometer frames.
///
/// A frame is whitespace separated ASCII, NUL terminated and padded to a fixed length:
/// ```text
/// 48456123 +- 00012 [00] 01-31-20 14:37:39.61
/// ```
/// Field intensity and its standard deviation are reported in pT, followed by an
/// error code and the GPS date (`MM-DD-YY`) and time of the sample.
#[derive(Debug, Clone, Copy, Default)]
pub struct Pos1Decoder;

impl Pos1Decoder {
    const CHANNELS: [(&'static str, &'static str); 2] = [("f", "nT"), ("df", "nT")];

    fn parse(frame: &RawFrame, sensor_id: &str, received: DateTime<Utc>) -> Result<DecodedRecord> {
        let text = String::from_utf8_lossy(&frame.data);
        let tokens: Vec<&str> = text.trim_matches('\0').split_whitespace().collect();
        if tokens.len() < 6 {
            return Err(Error::Decode(format!(
                "expected at least 6 fields, got {}",
                tokens.len()
            )));
        }

        let intensity = parse_pt(tokens[0], "intensity")?;
        let sigma = parse_pt(tokens[2], "sigma")?;
        let err_code: i32 = tokens[3]
            .trim_start_matches('[')
            .trim_end_matches(']')
            .parse()
            .map_err(|_| Error::Decode(format!("invalid error code {:?}", tokens[3])))?;
        let gps_time = parse_gps_time(tokens[4], tokens[5])?;

        if intensity <= 0.0 {
            return Err(Error::Decode(format!(
                "non-positive field intensity {intensity}"
            )));
        }

        Ok(DecodedRecord::new(sensor_id, gps_time, received)
            .with_channel("f", intensity, "nT")
            .with_channel("df", sigma, "nT")
            .with_status(err_code))
    }
}

/// Parse a pT value into nT.
fn parse_pt(s: &str, what: &str) -> Result<f64> {
    match s.parse::<f64>() {
        Ok(v) if v.is_finite() => Ok(v / 1000.0),
        _ => Err(Error::Decode(format!("invalid {what} {s:?}"))),
    }
}

// MM-DD-YY HH:MM:SS.ss
fn parse_gps_time(date: &str, time: &str) -> Result<DateTime<Utc>> {
    let bad = || Error::Decode(format!("invalid timestamp {date:?} {time:?}"));
    let (d, t) = (date.as_bytes(), time.as_bytes());
    if d.len() != 8 || d[2] != b'-' || d[5] != b'-' {
        return Err(bad());
    }
    if t.len() < 8 || t[2] != b':' || t[5] != b':' {
        return Err(bad());
    }
    let micros = match time.get(8..) {
        Some("") => 0,
        Some(frac) => frac
            .strip_prefix('.')
            .and_then(fraction_micros)
            .ok_or_else(bad)?,
        None => return Err(bad()),
    };

    (|| {
        timestamp(
            fixed(date, 6..8)?,
            fixed(date, 0..2)?,
            fixed(date, 3..5)?,
            fixed(time, 0..2)?,
            fixed(time, 3..5)?,
            fixed(time, 6..8)?,
            micros,
        )
    })()
    .ok_or_else(bad)
}

impl FieldDecoder for Pos1Decoder {
    fn decode(
        &self,
        frame: &RawFrame,
        config: &SensorConfig,
        received: DateTime<Utc>,
    ) -> DecodedRecord {
        match Self::parse(frame, &config.sensor_id, received) {
            Ok(rec) => rec,
            Err(err) => {
                debug!(offset = frame.offset, "POS1 frame decode failed: {err}");
                let reason = err.to_string();
                DecodedRecord::invalid(&config.sensor_id, received, &Self::CHANNELS, reason)
            }
        }
    }

    fn layout(&self) -> Layout {
        Layout::new(vec![
            Column::Time {
                source: TimeSource::Receipt,
                key: None,
            },
            Column::Channel {
                key: "f",
                name: "f",
                unit: "nT",
                factor: 1000,
                pack: 'L',
            },
            Column::Channel {
                key: "df",
                name: "df",
                unit: "nT",
                factor: 1000,
                pack: 'L',
            },
            Column::Status {
                key: "var1",
                name: "var1",
            },
            Column::Time {
                source: TimeSource::Device,
                key: Some(("sectime", "GPStime")),
            },
        ])
    }
}
