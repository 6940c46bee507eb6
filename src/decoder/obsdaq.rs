use chrono::{DateTime, Utc};
use tracing::debug;

use super::{fixed, parse_hex_signed, timestamp, FieldDecoder};
use crate::codec::{Column, Layout, TimeSource};
use crate::config::SensorConfig;
use crate::framing::RawFrame;
use crate::prelude::*;
use crate::record::DecodedRecord;

/// ADC counts to fraction of full-scale for 24-bit samples.
const COUNTS_TO_FULL_SCALE: f64 = 1.0 / (1u32 << 23) as f64;

/// Number of hex digits of one 24-bit sample.
const SAMPLE_DIGITS: usize = 6;
/// Number of hex digits of one 16-bit supplement field.
const AUX_DIGITS: usize = 4;

/// An auxiliary supplement channel, `value = raw * scale + offset`.
struct Aux {
    key: &'static str,
    name: &'static str,
    unit: &'static str,
    scale: f64,
    offset: f64,
}

const AUX: [Aux; 5] = [
    Aux {
        key: "var1",
        name: "Vcc",
        unit: "V",
        scale: 2.6622e-3,
        offset: 9.15,
    },
    Aux {
        key: "t2",
        name: "Telec",
        unit: "degC",
        scale: 1.0 / 128.0,
        offset: 0.0,
    },
    Aux {
        key: "var3",
        name: "sup1",
        unit: "V",
        scale: 1.0 / 8000.0,
        offset: 0.0,
    },
    Aux {
        key: "var4",
        name: "sup2",
        unit: "V",
        scale: 1.0 / 8000.0,
        offset: 0.0,
    },
    Aux {
        key: "var5",
        name: "sup3",
        unit: "V",
        scale: 1.0 / 8000.0,
        offset: 0.0,
    },
];

const XYZ: [(&str, &str); 3] = [("x", "X"), ("y", "Y"), ("z", "Z")];

/// Decoder for ObsDAQ 24-bit data logger lines received through a PalmAcq.
///
/// ```text
/// :R,00,YYMMDD.hhmmss.sss,*xxxxxxyyyyyyzzzzzzt[:vvvvttttppppqqqqrrrr]
/// :R,00,200131.143739.617,*0259FEFFF1BFFFFCEDL:04AC11CC000B000B000B
/// ```
/// The three components are 24-bit two's-complement hex values, `t` is the trigger
/// flag and the optional block after `:` holds five 16-bit supplement fields.
#[derive(Debug, Clone, Copy, Default)]
pub struct ObsDaqDecoder {
    supplement: bool,
}

impl ObsDaqDecoder {
    /// Leading marker of a data line.
    pub const MARKER: &'static str = ":R";

    /// Create a decoder. With `supplement` the auxiliary channels become part of the
    /// layout and lines without a supplement block are invalid.
    pub fn new(supplement: bool) -> Self {
        ObsDaqDecoder { supplement }
    }

    fn channels(&self) -> Vec<(&'static str, &'static str)> {
        let mut channels: Vec<_> = XYZ.iter().map(|(key, _)| (*key, "nT")).collect();
        if self.supplement {
            channels.extend(AUX.iter().map(|aux| (aux.key, aux.unit)));
        }
        channels
    }

    fn parse(
        &self,
        frame: &RawFrame,
        config: &SensorConfig,
        received: DateTime<Utc>,
    ) -> Result<DecodedRecord> {
        let line = std::str::from_utf8(&frame.data)
            .map_err(|_| Error::Decode("line is not ASCII".to_string()))?;
        if !line.starts_with(Self::MARKER) {
            return Err(Error::Decode(format!("missing {} marker", Self::MARKER)));
        }
        let fields: Vec<&str> = line.split(',').collect();
        if fields.len() < 4 {
            return Err(Error::Decode(format!(
                "expected 4 fields, got {}",
                fields.len()
            )));
        }

        let device_time = parse_time(fields[2])
            .ok_or_else(|| Error::Decode(format!("invalid timestamp {:?}", fields[2])))?;

        let (samples, supplement) = match fields[3].split_once(':') {
            Some((samples, supplement)) => (samples, Some(supplement)),
            None => (fields[3], None),
        };
        let samples = samples
            .strip_prefix('*')
            .ok_or_else(|| Error::Decode(format!("expected sample block, got {samples:?}")))?;
        // three samples followed by exactly one trigger flag letter
        let flag = samples.as_bytes().get(XYZ.len() * SAMPLE_DIGITS);
        if samples.len() != XYZ.len() * SAMPLE_DIGITS + 1
            || !flag.is_some_and(u8::is_ascii_uppercase)
        {
            return Err(Error::Decode(format!(
                "expected samples and trigger flag, got {samples:?}"
            )));
        }

        let cal = &config.calibration;
        let scales = [cal.scale_x, cal.scale_y, cal.scale_z];
        let mut rec = DecodedRecord::new(&config.sensor_id, device_time, received);
        for (idx, ((key, _), scale)) in XYZ.iter().zip(scales).enumerate() {
            let raw = hex_field(samples, idx, SAMPLE_DIGITS)?;
            let value = f64::from(raw) * COUNTS_TO_FULL_SCALE * cal.gain * scale;
            rec = rec.with_channel(key, value, "nT");
        }

        if self.supplement {
            let supplement = supplement
                .ok_or_else(|| Error::Decode("missing supplement block".to_string()))?;
            for (idx, aux) in AUX.iter().enumerate() {
                let raw = hex_field(supplement, idx, AUX_DIGITS)?;
                rec = rec.with_channel(aux.key, f64::from(raw) * aux.scale + aux.offset, aux.unit);
            }
        }

        Ok(rec)
    }
}

/// Signed hex field `idx` of `digits` width in `block`.
fn hex_field(block: &str, idx: usize, digits: usize) -> Result<i32> {
    block
        .get(idx * digits..(idx + 1) * digits)
        .and_then(parse_hex_signed)
        .ok_or_else(|| Error::Decode(format!("invalid hex field {idx} in {block:?}")))
}

// YYMMDD.hhmmss.sss
fn parse_time(s: &str) -> Option<DateTime<Utc>> {
    let b = s.as_bytes();
    if b.len() != 17 || b[6] != b'.' || b[13] != b'.' {
        return None;
    }
    timestamp(
        fixed(s, 0..2)?,
        fixed(s, 2..4)?,
        fixed(s, 4..6)?,
        fixed(s, 7..9)?,
        fixed(s, 9..11)?,
        fixed(s, 11..13)?,
        fixed(s, 14..17)? * 1_000,
    )
}

impl FieldDecoder for ObsDaqDecoder {
    fn decode(
        &self,
        frame: &RawFrame,
        config: &SensorConfig,
        received: DateTime<Utc>,
    ) -> DecodedRecord {
        match self.parse(frame, config, received) {
            Ok(rec) => rec,
            Err(err) => {
                debug!(offset = frame.offset, "ObsDAQ line decode failed: {err}");
                DecodedRecord::invalid(
                    &config.sensor_id,
                    received,
                    &self.channels(),
                    err.to_string(),
                )
            }
        }
    }

    fn layout(&self) -> Layout {
        let mut columns = vec![Column::Time {
            source: TimeSource::Sample,
            key: None,
        }];
        columns.extend(XYZ.iter().map(|&(key, name)| Column::Channel {
            key,
            name,
            unit: "nT",
            factor: 1000,
            pack: 'l',
        }));
        if self.supplement {
            columns.extend(AUX.iter().map(|aux| Column::Channel {
                key: aux.key,
                name: aux.name,
                unit: aux.unit,
                factor: 1000,
                pack: 'l',
            }));
        }
        Layout::new(columns)
    }
}

#[cfg(test)]
mod tests {
    use chrono::{TimeZone, Timelike};

    use super::*;
    use crate::codec::RecordCodec;
    use crate::config::{Calibration, Device};

    const LINE: &str = ":R,00,200131.143739.617,*0259FEFFF1BFFFFCEDL:04AC11CC000B000B000B";

    fn config(supplement: bool) -> SensorConfig {
        SensorConfig::builder()
            .sensor_id("OBSDAQ_01")
            .device(Device::ObsDaq)
            .supplement(supplement)
            .calibration(
                Calibration::builder()
                    .gain(10.0)
                    .scale_x(1.0)
                    .scale_y(2.0)
                    .scale_z(4.0)
                    .build(),
            )
            .build()
    }

    fn frame(line: &str) -> RawFrame {
        RawFrame {
            offset: 0,
            data: line.as_bytes().to_vec(),
        }
    }

    fn received() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2020, 1, 31, 14, 37, 40).unwrap()
    }

    fn decode(line: &str, supplement: bool) -> DecodedRecord {
        let cfg = config(supplement);
        ObsDaqDecoder::new(supplement).decode(&frame(line), &cfg, received())
    }

    fn assert_close(got: Option<f64>, expected: f64) {
        let got = got.expect("channel to be present");
        assert!((got - expected).abs() < 1e-9, "got {got}, expected {expected}");
    }

    #[test]
    fn decode_components() {
        let rec = decode(LINE, false);

        assert!(rec.is_valid(), "{:?}", rec.validity);
        assert_close(rec.value("x"), 154_110.0 / 8_388_608.0 * 10.0);
        assert_close(rec.value("y"), -3_649.0 / 8_388_608.0 * 10.0 * 2.0);
        assert_close(rec.value("z"), -787.0 / 8_388_608.0 * 10.0 * 4.0);
        assert_eq!(rec.channels.len(), 3, "supplement not requested");
        assert_eq!(
            rec.device_time,
            Some(
                Utc.with_ymd_and_hms(2020, 1, 31, 14, 37, 39)
                    .unwrap()
                    .with_nanosecond(617_000_000)
                    .unwrap()
            )
        );
    }

    #[test]
    fn decode_supplement() {
        let rec = decode(LINE, true);

        assert!(rec.is_valid(), "{:?}", rec.validity);
        assert_close(rec.value("var1"), 1196.0 * 2.6622e-3 + 9.15);
        assert_close(rec.value("t2"), 4556.0 / 128.0);
        assert_close(rec.value("var3"), 11.0 / 8000.0);
        assert_close(rec.value("var4"), 11.0 / 8000.0);
        assert_close(rec.value("var5"), 11.0 / 8000.0);
    }

    #[test]
    fn negative_supplement_fields_are_sign_extended() {
        let rec = decode(
            ":R,00,200131.143739.617,*000000000000000000L:FFFFFF80800000000000",
            true,
        );
        assert!(rec.is_valid(), "{:?}", rec.validity);
        assert_close(rec.value("var1"), -2.6622e-3 + 9.15);
        assert_close(rec.value("t2"), -128.0 / 128.0);
        assert_close(rec.value("var3"), -32_768.0 / 8000.0);
    }

    #[test]
    fn missing_required_supplement_is_invalid() {
        let rec = decode(":R,00,200131.143739.617,*0259FEFFF1BFFFFCEDL", true);

        assert!(!rec.is_valid());
        assert_eq!(rec.channels.len(), 8, "all layout channels zeroed");
        assert!(rec.channels.values().all(|m| m.value == 0.0));
    }

    #[test]
    fn malformed_lines_are_invalid() {
        for line in [
            ":R,00,200131.143739.617",
            ":R,00,200131-143739.617,*0259FEFFF1BFFFFCEDL",
            ":R,00,201331.143739.617,*0259FEFFF1BFFFFCEDL",
            ":R,00,200131.143739.617,0259FEFFF1BFFFFCEDL",
            ":R,00,200131.143739.617,*0259FEFFF1BFFFFCE",
            ":R,00,200131.143739.617,*0259FEFFG1BFFFFCEDL",
            ":R,00,200131.143739.617,*0259FEFFF1BFFFFCED",
            ":R,00,200131.143739.617,*0259FEFFF1BFFFFCEDLX",
            ":R,00,200131.143739.617,*0259FEFFF1BFFFFCEDl",
            ":R,00,200131.143739.617,*0259FEFFF1BFFFFCED9",
            "!00,200131.143739.617,*0259FEFFF1BFFFFCEDL",
        ] {
            let rec = decode(line, false);
            assert!(!rec.is_valid(), "expected invalid for {line:?}");
        }
    }

    #[test]
    fn layout_and_text() {
        let dec = ObsDaqDecoder::new(false);
        let codec = RecordCodec::new("OBSDAQ_01", dec.layout()).unwrap();
        assert_eq!(
            codec.header(),
            "# MagPyBin OBSDAQ_01 [x,y,z] [X,Y,Z] [nT,nT,nT] [1000,1000,1000] 6hLlll 28"
        );

        let rec = decode(LINE, false);
        let text = codec.to_text(&rec).unwrap();
        assert_eq!(text.split(',').count(), codec.layout().field_count());
        assert!(text.starts_with("2020,1,31,14,37,39,617000,"), "{text}");

        let codec = RecordCodec::new("OBSDAQ_01", ObsDaqDecoder::new(true).layout()).unwrap();
        assert!(codec.header().ends_with(
            "[x,y,z,var1,t2,var3,var4,var5] [X,Y,Z,Vcc,Telec,sup1,sup2,sup3] \
             [nT,nT,nT,V,degC,V,V,V] [1000,1000,1000,1000,1000,1000,1000,1000] 6hLllllllll 48"
        ));
    }
}
