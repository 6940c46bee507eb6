//! Record encoding.
//!
//! A [Layout] is the versioned contract between the decoder and anything storing or
//! receiving records. It fixes the column order, the per-column scale factor and the
//! binary pack code. Physical values are multiplied by their column factor and
//! truncated to integers, so the wire and storage formats carry no floating point.
//!
//! Any change to a layout changes its pack code and is a breaking format change.
use chrono::{DateTime, Datelike, Timelike, Utc};

use crate::prelude::*;
use crate::record::DecodedRecord;

/// Number of integers a time column expands to.
pub const TIME_FIELDS: usize = 7;

/// Which timestamp of a record a time column carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeSource {
    /// Host receipt time
    Receipt,
    /// Device time; encoding fails if the record has none
    Device,
    /// Device time while synchronized, receipt time otherwise
    Sample,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Column {
    /// Time expanded to year, month, day, hour, minute, second and microsecond.
    ///
    /// Time columns with a `key` are listed in the header, others are implied.
    Time {
        source: TimeSource,
        key: Option<(&'static str, &'static str)>,
    },
    /// A physical channel scaled by `factor` and truncated.
    Channel {
        key: &'static str,
        name: &'static str,
        unit: &'static str,
        factor: i64,
        pack: char,
    },
    /// The record status code.
    Status {
        key: &'static str,
        name: &'static str,
    },
}

impl Column {
    fn code(&self) -> String {
        match self {
            Column::Time { .. } => "6hL".to_string(),
            Column::Channel { pack, .. } => pack.to_string(),
            Column::Status { .. } => "h".to_string(),
        }
    }

    // (key, name, unit, factor) for header listed columns
    fn describe(&self) -> Option<(&'static str, &'static str, &'static str, i64)> {
        match self {
            Column::Time { key, .. } => key.map(|(k, n)| (k, n, "none", 1)),
            Column::Channel {
                key,
                name,
                unit,
                factor,
                ..
            } => Some((*key, *name, *unit, *factor)),
            Column::Status { key, name } => Some((*key, *name, "none", 1)),
        }
    }
}

/// A binary field type from a pack code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PackType {
    I16,
    U16,
    I32,
    U32,
    I64,
    U64,
}

impl PackType {
    fn from_char(c: char) -> Option<Self> {
        Some(match c {
            'h' => PackType::I16,
            'H' => PackType::U16,
            'i' | 'l' => PackType::I32,
            'I' | 'L' => PackType::U32,
            'q' => PackType::I64,
            'Q' => PackType::U64,
            _ => return None,
        })
    }

    #[must_use]
    pub fn size(&self) -> usize {
        match self {
            PackType::I16 | PackType::U16 => 2,
            PackType::I32 | PackType::U32 => 4,
            PackType::I64 | PackType::U64 => 8,
        }
    }

    /// Append `value` little-endian, failing if it does not fit.
    fn pack(&self, value: i64, buf: &mut Vec<u8>) -> std::result::Result<(), String> {
        fn fit<T: TryFrom<i64>>(value: i64, typ: &PackType) -> std::result::Result<T, String> {
            T::try_from(value).map_err(|_| format!("{value} does not fit {typ:?}"))
        }
        match self {
            PackType::I16 => buf.extend(fit::<i16>(value, self)?.to_le_bytes()),
            PackType::U16 => buf.extend(fit::<u16>(value, self)?.to_le_bytes()),
            PackType::I32 => buf.extend(fit::<i32>(value, self)?.to_le_bytes()),
            PackType::U32 => buf.extend(fit::<u32>(value, self)?.to_le_bytes()),
            PackType::I64 => buf.extend(value.to_le_bytes()),
            PackType::U64 => buf.extend(fit::<u64>(value, self)?.to_le_bytes()),
        }
        Ok(())
    }
}

/// Parse a pack code such as `6hLlll` into its field types.
///
/// # Errors
/// [Error::Encode] for unknown type characters or a dangling repeat count.
pub fn parse_pack_code(code: &str) -> Result<Vec<PackType>> {
    let mut types = Vec::new();
    let mut count: Option<usize> = None;
    for c in code.chars() {
        if let Some(d) = c.to_digit(10) {
            count = Some(count.unwrap_or(0) * 10 + d as usize);
            continue;
        }
        let typ = PackType::from_char(c)
            .ok_or_else(|| Error::Encode(format!("unsupported pack code character {c:?}")))?;
        types.extend(std::iter::repeat(typ).take(count.take().unwrap_or(1)));
    }
    if count.is_some() {
        return Err(Error::Encode(format!("pack code {code:?} ends with a count")));
    }
    Ok(types)
}

/// Ordered column list describing one packed record.
#[derive(Debug, Clone, PartialEq)]
pub struct Layout {
    pub columns: Vec<Column>,
}

impl Layout {
    /// Header identifier understood by downstream consumers.
    pub const FORMAT: &'static str = "MagPyBin";

    pub fn new(columns: Vec<Column>) -> Self {
        Layout { columns }
    }

    #[must_use]
    pub fn pack_code(&self) -> String {
        self.columns.iter().map(Column::code).collect()
    }

    /// Number of integer fields in one record.
    #[must_use]
    pub fn field_count(&self) -> usize {
        self.columns
            .iter()
            .map(|c| match c {
                Column::Time { .. } => TIME_FIELDS,
                _ => 1,
            })
            .sum()
    }

    /// Number of bytes in one packed record.
    #[must_use]
    pub fn packed_len(&self) -> usize {
        parse_pack_code(&self.pack_code())
            .map(|types| types.iter().map(PackType::size).sum())
            .unwrap_or(0)
    }

    /// Channel names and units the decoder must populate.
    #[must_use]
    pub fn channels(&self) -> Vec<(&'static str, &'static str)> {
        self.columns
            .iter()
            .filter_map(|c| match c {
                Column::Channel { key, unit, .. } => Some((*key, *unit)),
                _ => None,
            })
            .collect()
    }

    /// Header line documenting this layout for `sensor_id`.
    #[must_use]
    pub fn header(&self, sensor_id: &str) -> String {
        let described: Vec<_> = self.columns.iter().filter_map(Column::describe).collect();
        let keys: Vec<&str> = described.iter().map(|d| d.0).collect();
        let names: Vec<&str> = described.iter().map(|d| d.1).collect();
        let units: Vec<&str> = described.iter().map(|d| d.2).collect();
        let factors: Vec<String> = described.iter().map(|d| d.3.to_string()).collect();
        format!(
            "# {} {} [{}] [{}] [{}] [{}] {} {}",
            Self::FORMAT,
            sensor_id,
            keys.join(","),
            names.join(","),
            units.join(","),
            factors.join(","),
            self.pack_code(),
            self.packed_len(),
        )
    }
}

fn time_fields(t: DateTime<Utc>) -> [i64; TIME_FIELDS] {
    [
        i64::from(t.year()),
        i64::from(t.month()),
        i64::from(t.day()),
        i64::from(t.hour()),
        i64::from(t.minute()),
        i64::from(t.second()),
        // leap second nanos are folded into the last microsecond
        i64::from((t.nanosecond() / 1_000).min(999_999)),
    ]
}

fn scale(name: &str, value: f64, factor: i64) -> Result<i64> {
    let scaled = (value * factor as f64).trunc();
    if !scaled.is_finite() || scaled.abs() >= i64::MAX as f64 {
        return Err(Error::Encode(format!(
            "channel {name} value {value} cannot be scaled by {factor}"
        )));
    }
    Ok(scaled as i64)
}

/// Encodes records of one sensor according to a [Layout].
#[derive(Debug, Clone)]
pub struct RecordCodec {
    layout: Layout,
    types: Vec<PackType>,
    header: String,
}

impl RecordCodec {
    /// # Errors
    /// [Error::Encode] if the layout pack code is invalid or disagrees with its field count.
    pub fn new(sensor_id: &str, layout: Layout) -> Result<Self> {
        let types = parse_pack_code(&layout.pack_code())?;
        if types.len() != layout.field_count() {
            return Err(Error::Encode(format!(
                "pack code {} has {} fields, layout has {}",
                layout.pack_code(),
                types.len(),
                layout.field_count()
            )));
        }
        Ok(RecordCodec {
            header: layout.header(sensor_id),
            layout,
            types,
        })
    }

    #[must_use]
    pub fn header(&self) -> &str {
        &self.header
    }

    #[must_use]
    pub fn layout(&self) -> &Layout {
        &self.layout
    }

    /// Integer field values of `record` in layout order.
    ///
    /// # Errors
    /// [Error::Encode] if a required timestamp or channel is missing, or a value cannot
    /// be scaled.
    pub fn values(&self, record: &DecodedRecord) -> Result<Vec<i64>> {
        let mut values = Vec::with_capacity(self.types.len());
        for col in &self.layout.columns {
            match col {
                Column::Time { source, .. } => {
                    let t = match source {
                        TimeSource::Receipt => record.received,
                        TimeSource::Sample => record.sample_time(),
                        TimeSource::Device => record.device_time.ok_or_else(|| {
                            Error::Encode("record has no device time".to_string())
                        })?,
                    };
                    values.extend(time_fields(t));
                }
                Column::Channel { key, factor, .. } => {
                    let value = record
                        .value(key)
                        .ok_or_else(|| Error::Encode(format!("record has no channel {key}")))?;
                    values.push(scale(key, value, *factor)?);
                }
                Column::Status { .. } => values.push(i64::from(record.status)),
            }
        }
        Ok(values)
    }

    /// Comma joined field values in layout order.
    ///
    /// # Errors
    /// See [Self::values].
    pub fn to_text(&self, record: &DecodedRecord) -> Result<String> {
        Ok(self
            .values(record)?
            .iter()
            .map(i64::to_string)
            .collect::<Vec<String>>()
            .join(","))
    }

    /// Pack field values little-endian according to the layout pack code.
    ///
    /// # Errors
    /// [Error::Encode] on a field count mismatch or a value overflowing its field type.
    pub fn pack(&self, values: &[i64]) -> Result<Vec<u8>> {
        if values.len() != self.types.len() {
            return Err(Error::Encode(format!(
                "expected {} fields, got {}",
                self.types.len(),
                values.len()
            )));
        }
        let mut buf = Vec::with_capacity(self.layout.packed_len());
        for (idx, (typ, value)) in self.types.iter().zip(values).enumerate() {
            typ.pack(*value, &mut buf)
                .map_err(|msg| Error::Encode(format!("field {idx}: {msg}")))?;
        }
        Ok(buf)
    }

    /// Binary payload and header for `record`.
    ///
    /// # Errors
    /// See [Self::values] and [Self::pack].
    pub fn encode(&self, record: &DecodedRecord) -> Result<(Vec<u8>, String)> {
        let payload = self.pack(&self.values(record)?)?;
        Ok((payload, self.header.clone()))
    }
}
