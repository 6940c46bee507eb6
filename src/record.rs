use std::collections::BTreeMap;
use std::fmt::Display;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::timesync::DriftStatus;

/// A calibrated physical value and its unit.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Measurement {
    pub value: f64,
    pub unit: &'static str,
}

impl Measurement {
    #[must_use]
    pub fn new(value: f64, unit: &'static str) -> Self {
        Measurement { value, unit }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum Validity {
    Valid,
    /// Decoding failed for the contained reason. Channel values are zeroed.
    Invalid(String),
}

/// A single decoded instrument sample.
///
/// A record is either fully decoded, with every channel of its layout present and
/// [Validity::Valid], or explicitly [Validity::Invalid]. Invalid records are never
/// published.
#[derive(Debug, Clone, Serialize)]
pub struct DecodedRecord {
    pub sensor_id: String,
    /// Time reported by the instrument, if it could be decoded.
    pub device_time: Option<DateTime<Utc>>,
    /// Host time at which the bytes of this record were received.
    pub received: DateTime<Utc>,
    pub channels: BTreeMap<String, Measurement>,
    /// Instrument status or error code.
    pub status: i32,
    pub validity: Validity,
    /// Synchronization state observed when this record was received.
    pub sync: DriftStatus,
}

impl DecodedRecord {
    /// Create a valid record with no channels.
    pub fn new(sensor_id: &str, device_time: DateTime<Utc>, received: DateTime<Utc>) -> Self {
        DecodedRecord {
            sensor_id: sensor_id.to_string(),
            device_time: Some(device_time),
            received,
            channels: BTreeMap::new(),
            status: 0,
            validity: Validity::Valid,
            sync: DriftStatus::Ok,
        }
    }

    /// Create an invalid record with every named channel zeroed.
    pub fn invalid(
        sensor_id: &str,
        received: DateTime<Utc>,
        channels: &[(&str, &'static str)],
        reason: impl Into<String>,
    ) -> Self {
        DecodedRecord {
            sensor_id: sensor_id.to_string(),
            device_time: None,
            received,
            channels: channels
                .iter()
                .map(|(name, unit)| (name.to_string(), Measurement::new(0.0, unit)))
                .collect(),
            status: 0,
            validity: Validity::Invalid(reason.into()),
            sync: DriftStatus::Ok,
        }
    }

    pub fn with_channel(mut self, name: &str, value: f64, unit: &'static str) -> Self {
        self.channels
            .insert(name.to_string(), Measurement::new(value, unit));
        self
    }

    pub fn with_status(mut self, status: i32) -> Self {
        self.status = status;
        self
    }

    #[must_use]
    pub fn is_valid(&self) -> bool {
        self.validity == Validity::Valid
    }

    #[must_use]
    pub fn value(&self, channel: &str) -> Option<f64> {
        self.channels.get(channel).map(|m| m.value)
    }

    /// Time to use for time-sensitive output: the device time while synchronization is
    /// ok, otherwise the host receipt time.
    #[must_use]
    pub fn sample_time(&self) -> DateTime<Utc> {
        match (self.sync, self.device_time) {
            (DriftStatus::Ok, Some(t)) => t,
            _ => self.received,
        }
    }
}

impl Display for DecodedRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "DecodedRecord{{sensor={}, device_time={:?}, channels={}, valid={}}}",
            self.sensor_id,
            self.device_time,
            self.channels.len(),
            self.is_valid()
        )
    }
}
