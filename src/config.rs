//! Session and sensor configuration.
//!
//! Configuration is supplied once when a sensor pipeline is constructed and is read-only
//! afterwards. It can be deserialized from JSON or built in code.
//!
//! ```
//! use magstream::config::{Device, SensorConfig};
//!
//! let sensor = SensorConfig::builder()
//!     .sensor_id("POS1_N432_0001")
//!     .device(Device::Pos1)
//!     .stack(3)
//!     .build();
//! assert!(sensor.validate().is_ok());
//! ```
use std::io::Read;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use typed_builder::TypedBuilder;

use crate::decoder::{FieldDecoder, ObsDaqDecoder, Pos1Decoder};
use crate::framing::{DelimitedAssembler, FixedLengthAssembler, FrameAssembler};
use crate::prelude::*;

/// Publish quality-of-service level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(from = "i64", into = "u8")]
pub enum QoS {
    #[default]
    AtMostOnce,
    AtLeastOnce,
    ExactlyOnce,
}

impl From<i64> for QoS {
    /// Values outside 0..=2 clamp to [QoS::AtMostOnce].
    fn from(level: i64) -> Self {
        match level {
            1 => QoS::AtLeastOnce,
            2 => QoS::ExactlyOnce,
            _ => QoS::AtMostOnce,
        }
    }
}

impl From<QoS> for u8 {
    fn from(qos: QoS) -> Self {
        match qos {
            QoS::AtMostOnce => 0,
            QoS::AtLeastOnce => 1,
            QoS::ExactlyOnce => 2,
        }
    }
}

/// Supported instrument families.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Device {
    /// POS-1 overhauser magnetometer; fixed length NUL terminated ASCII frames.
    Pos1,
    /// ObsDAQ 24-bit data logger behind a PalmAcq; `\r` terminated hex lines.
    ObsDaq,
}

impl Device {
    /// POS-1 frame length in bytes, including the NUL terminator.
    pub const POS1_FRAME_LEN: usize = 44;
    /// Typical POS-1 delay between its GPS stamped time and host receipt.
    pub const POS1_GPS_OFFSET: f64 = 6.2;

    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Device::Pos1 => "POS1",
            Device::ObsDaq => "ObsDAQ",
        }
    }

    /// Frame assembler for this device's stream format.
    #[must_use]
    pub fn assembler(&self) -> Box<dyn FrameAssembler> {
        match self {
            Device::Pos1 => Box::new(FixedLengthAssembler::new(Self::POS1_FRAME_LEN)),
            Device::ObsDaq => Box::new(DelimitedAssembler::new(
                b'\r',
                ObsDaqDecoder::MARKER.as_bytes(),
            )),
        }
    }

    /// Field decoder for this device, configured for `sensor`.
    #[must_use]
    pub fn decoder(&self, sensor: &SensorConfig) -> Box<dyn FieldDecoder> {
        match self {
            Device::Pos1 => Box::new(Pos1Decoder),
            Device::ObsDaq => Box::new(ObsDaqDecoder::new(sensor.supplement)),
        }
    }

    /// Expected device-to-host time offset in seconds.
    #[must_use]
    pub fn default_drift_offset(&self) -> f64 {
        match self {
            Device::Pos1 => Self::POS1_GPS_OFFSET,
            Device::ObsDaq => 0.0,
        }
    }
}

/// Serial transport parameters. Not interpreted here; carried for the transport.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SerialParams {
    pub port: String,
    pub baudrate: u32,
    #[serde(default = "default_parity")]
    pub parity: String,
    #[serde(default = "default_bytesize")]
    pub bytesize: u8,
    #[serde(default = "default_stopbits")]
    pub stopbits: u8,
}

fn default_parity() -> String {
    "N".to_string()
}
fn default_bytesize() -> u8 {
    8
}
fn default_stopbits() -> u8 {
    1
}

/// Calibration constants applied by the field decoder.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TypedBuilder)]
pub struct Calibration {
    /// Full-scale input range (gain) of the converter.
    #[serde(default = "one")]
    #[builder(default = 1.0)]
    pub gain: f64,
    #[serde(default = "one")]
    #[builder(default = 1.0)]
    pub scale_x: f64,
    #[serde(default = "one")]
    #[builder(default = 1.0)]
    pub scale_y: f64,
    #[serde(default = "one")]
    #[builder(default = 1.0)]
    pub scale_z: f64,
}

fn one() -> f64 {
    1.0
}

impl Default for Calibration {
    fn default() -> Self {
        Calibration::builder().build()
    }
}

/// Time synchronization monitoring parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TypedBuilder)]
pub struct DriftConfig {
    /// Expected propagation offset in seconds. Defaults to the device's typical offset.
    #[serde(default)]
    #[builder(default, setter(strip_option))]
    pub offset: Option<f64>,
    /// Drift, in seconds, beyond which synchronization is degraded.
    #[serde(default = "default_threshold")]
    #[builder(default = 3.0)]
    pub threshold: f64,
    /// Number of samples retained for the delay estimate.
    #[serde(default = "default_window")]
    #[builder(default = 1000)]
    pub window: usize,
}

fn default_threshold() -> f64 {
    3.0
}
fn default_window() -> usize {
    1000
}

impl Default for DriftConfig {
    fn default() -> Self {
        DriftConfig::builder().build()
    }
}

/// Configuration of a single attached instrument.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TypedBuilder)]
pub struct SensorConfig {
    #[serde(rename = "sensorid")]
    #[builder(setter(into))]
    pub sensor_id: String,
    pub device: Device,
    /// Number of records batched into one publish.
    #[serde(default = "default_stack")]
    #[builder(default = 1)]
    pub stack: usize,
    /// Number of single record publishes between metadata announcements.
    #[serde(default = "default_meta_interval")]
    #[builder(default = 10)]
    pub meta_interval: u32,
    #[serde(default)]
    #[builder(default, setter(strip_option))]
    pub serial: Option<SerialParams>,
    #[serde(default)]
    #[builder(default)]
    pub calibration: Calibration,
    #[serde(default)]
    #[builder(default)]
    pub drift: DriftConfig,
    /// Decode and publish the ObsDAQ auxiliary supplement channels.
    #[serde(default)]
    #[builder(default)]
    pub supplement: bool,

    // Identification attributes published once per session
    #[serde(default, rename = "pierid")]
    #[builder(default, setter(strip_option, into))]
    pub pier: Option<String>,
    #[serde(default, rename = "sensorgroup")]
    #[builder(default, setter(strip_option, into))]
    pub group: Option<String>,
    #[serde(default, rename = "sensordesc")]
    #[builder(default, setter(strip_option, into))]
    pub description: Option<String>,
    #[serde(default, rename = "ptime")]
    #[builder(default, setter(strip_option, into))]
    pub time_protocol: Option<String>,
}

fn default_stack() -> usize {
    1
}
fn default_meta_interval() -> u32 {
    10
}

impl SensorConfig {
    /// # Errors
    /// [Error::Config] describing the first invalid value.
    pub fn validate(&self) -> Result<()> {
        if self.sensor_id.is_empty() {
            return Err(Error::Config("sensor id must not be empty".to_string()));
        }
        if self.sensor_id.contains('/') {
            return Err(Error::Config(format!(
                "sensor id {:?} must not contain '/'",
                self.sensor_id
            )));
        }
        if self.stack == 0 {
            return Err(Error::Config("stack must be at least 1".to_string()));
        }
        if self.meta_interval == 0 {
            return Err(Error::Config("meta interval must be at least 1".to_string()));
        }
        let cal = &self.calibration;
        if [cal.gain, cal.scale_x, cal.scale_y, cal.scale_z]
            .iter()
            .any(|v| !v.is_finite())
        {
            return Err(Error::Config(format!(
                "calibration constants must be finite: {cal:?}"
            )));
        }
        let threshold = self.drift.threshold;
        if !threshold.is_finite() || threshold < 0.0 {
            return Err(Error::Config(format!(
                "drift threshold must be finite and non-negative, got {threshold}"
            )));
        }
        if let Some(offset) = self.drift.offset {
            if !offset.is_finite() {
                return Err(Error::Config("drift offset must be finite".to_string()));
            }
        }
        Ok(())
    }

    #[must_use]
    pub fn drift_offset(&self) -> f64 {
        self.drift
            .offset
            .unwrap_or_else(|| self.device.default_drift_offset())
    }
}

/// Configuration shared by all sensors of one station.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TypedBuilder)]
pub struct SessionConfig {
    #[builder(setter(into))]
    pub station: String,
    #[serde(default, rename = "mqttqos")]
    #[builder(default)]
    pub qos: QoS,
    #[serde(default)]
    #[builder(default)]
    pub debug: bool,
    /// Directory passed to the storage writer. No records are stored when unset.
    #[serde(default, rename = "bufferdirectory")]
    #[builder(default, setter(strip_option, into))]
    pub buffer_directory: Option<PathBuf>,
    #[serde(default)]
    #[builder(default)]
    pub sensors: Vec<SensorConfig>,
}

impl SessionConfig {
    /// # Errors
    /// [Error::Json] if `dat` is not valid configuration JSON, [Error::Config] if any
    /// value is invalid.
    pub fn from_json(dat: &str) -> Result<Self> {
        let config: SessionConfig = serde_json::from_str(dat)?;
        config.validate()?;
        Ok(config)
    }

    /// # Errors
    /// See [Self::from_json].
    pub fn from_reader(reader: impl Read) -> Result<Self> {
        let config: SessionConfig = serde_json::from_reader(reader)?;
        config.validate()?;
        Ok(config)
    }

    /// # Errors
    /// [Error::Config] for an empty station or any invalid sensor.
    pub fn validate(&self) -> Result<()> {
        if self.station.is_empty() || self.station.contains('/') {
            return Err(Error::Config(format!(
                "invalid station id {:?}",
                self.station
            )));
        }
        for sensor in &self.sensors {
            sensor.validate()?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use test_case::test_case;

    use super::*;

    #[test_case(0, QoS::AtMostOnce)]
    #[test_case(1, QoS::AtLeastOnce)]
    #[test_case(2, QoS::ExactlyOnce)]
    #[test_case(3, QoS::AtMostOnce; "too large clamps")]
    #[test_case(-1, QoS::AtMostOnce; "negative clamps")]
    fn qos_from_level(level: i64, expected: QoS) {
        assert_eq!(QoS::from(level), expected);
    }

    #[test]
    fn session_from_json() {
        let dat = r#"{
            "station": "WIC",
            "mqttqos": 5,
            "bufferdirectory": "/srv/buffer",
            "sensors": [
                {"sensorid": "POS1_N432_0001", "device": "pos1", "stack": 3},
                {
                    "sensorid": "OBSDAQ_01",
                    "device": "obsdaq",
                    "supplement": true,
                    "serial": {"port": "/dev/ttyUSB0", "baudrate": 57600},
                    "calibration": {"gain": 10.0, "scale_x": 0.5},
                    "drift": {"threshold": 1.5}
                }
            ]
        }"#;

        let config = SessionConfig::from_json(dat).unwrap();

        assert_eq!(config.station, "WIC");
        assert_eq!(config.qos, QoS::AtMostOnce);
        assert!(!config.debug);
        assert_eq!(config.buffer_directory, Some(PathBuf::from("/srv/buffer")));

        let pos1 = &config.sensors[0];
        assert_eq!(pos1.device, Device::Pos1);
        assert_eq!(pos1.stack, 3);
        assert_eq!(pos1.meta_interval, 10);
        assert_eq!(pos1.calibration, Calibration::default());
        assert!((pos1.drift_offset() - 6.2).abs() < f64::EPSILON);

        let obsdaq = &config.sensors[1];
        assert!(obsdaq.supplement);
        assert_eq!(obsdaq.stack, 1);
        assert_eq!(obsdaq.serial.as_ref().unwrap().baudrate, 57600);
        assert_eq!(obsdaq.serial.as_ref().unwrap().parity, "N");
        assert!((obsdaq.calibration.gain - 10.0).abs() < f64::EPSILON);
        assert!((obsdaq.calibration.scale_y - 1.0).abs() < f64::EPSILON);
        assert!((obsdaq.drift.threshold - 1.5).abs() < f64::EPSILON);
        assert_eq!(obsdaq.drift.window, 1000);
        assert!(obsdaq.drift_offset().abs() < f64::EPSILON);
    }

    #[test]
    fn invalid_json_is_error() {
        assert!(matches!(
            SessionConfig::from_json("{\"station\": 1}"),
            Err(Error::Json(_))
        ));
    }

    #[test]
    fn validate_rejects_bad_sensor_ids() {
        for id in ["", "a/b"] {
            let sensor = SensorConfig::builder()
                .sensor_id(id)
                .device(Device::Pos1)
                .build();
            assert!(matches!(sensor.validate(), Err(Error::Config(_))), "{id:?}");
        }
    }

    #[test]
    fn validate_rejects_zero_stack_and_nan_calibration() {
        let sensor = SensorConfig::builder()
            .sensor_id("S1")
            .device(Device::ObsDaq)
            .stack(0)
            .build();
        assert!(sensor.validate().is_err());

        let sensor = SensorConfig::builder()
            .sensor_id("S1")
            .device(Device::ObsDaq)
            .calibration(Calibration::builder().gain(f64::NAN).build())
            .build();
        assert!(sensor.validate().is_err());
    }

    #[test_case(f64::NAN; "nan")]
    #[test_case(f64::INFINITY; "infinite")]
    #[test_case(-1.0; "negative")]
    fn validate_rejects_bad_drift_threshold(threshold: f64) {
        let sensor = SensorConfig::builder()
            .sensor_id("S1")
            .device(Device::Pos1)
            .drift(DriftConfig::builder().threshold(threshold).build())
            .build();
        assert!(matches!(sensor.validate(), Err(Error::Config(_))));
    }

    #[test]
    fn validate_accepts_zero_drift_threshold() {
        let sensor = SensorConfig::builder()
            .sensor_id("S1")
            .device(Device::Pos1)
            .drift(DriftConfig::builder().threshold(0.0).build())
            .build();
        assert!(sensor.validate().is_ok());
    }

    #[test]
    fn session_rejects_invalid_sensor() {
        let dat = r#"{"station": "WIC", "sensors": [{"sensorid": "", "device": "pos1"}]}"#;
        assert!(matches!(
            SessionConfig::from_json(dat),
            Err(Error::Config(_))
        ));
    }
}
