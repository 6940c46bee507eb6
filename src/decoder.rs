//! Instrument field decoding.
//!
//! A [FieldDecoder] turns a [RawFrame] into a [DecodedRecord] of calibrated physical
//! values. Decoding never fails outright: malformed frames produce a record marked
//! [Validity::Invalid](crate::record::Validity::Invalid) so callers can keep advancing.
mod obsdaq;
mod pos1;

use std::ops::Range;

use chrono::{DateTime, NaiveDate, TimeZone, Utc};

use crate::codec::Layout;
use crate::config::SensorConfig;
use crate::framing::RawFrame;
use crate::record::DecodedRecord;

pub use obsdaq::ObsDaqDecoder;
pub use pos1::Pos1Decoder;

/// Decodes frames of one instrument family.
pub trait FieldDecoder: Send + Sync {
    /// Decode `frame`, received by the host at `received`, using the calibration in
    /// `config`.
    fn decode(
        &self,
        frame: &RawFrame,
        config: &SensorConfig,
        received: DateTime<Utc>,
    ) -> DecodedRecord;

    /// Record layout produced by this decoder. Valid records populate every channel in
    /// the layout.
    fn layout(&self) -> Layout;
}

/// Sign extend the low `digits * 4` bits of `raw` as a two's-complement value.
///
/// # Panics
/// If `digits` is not between 1 and 8.
#[must_use]
pub fn sign_extend(raw: u32, digits: usize) -> i32 {
    assert!((1..=8).contains(&digits), "digits must be 1 to 8");
    let bits = digits * 4;
    let raw = i64::from(raw) & ((1i64 << bits) - 1);
    let half = 1i64 << (bits - 1);
    ((raw ^ half) - half) as i32
}

/// Parse `s` as a two's-complement integer encoded with `s.len()` hex digits.
///
/// ```
/// use magstream::decoder::parse_hex_signed;
///
/// assert_eq!(parse_hex_signed("800000"), Some(-8388608));
/// assert_eq!(parse_hex_signed("FFFF"), Some(-1));
/// assert_eq!(parse_hex_signed("+FF"), None);
/// ```
#[must_use]
pub fn parse_hex_signed(s: &str) -> Option<i32> {
    if s.is_empty() || s.len() > 8 || !s.bytes().all(|b| b.is_ascii_hexdigit()) {
        return None;
    }
    let raw = u32::from_str_radix(s, 16).ok()?;
    Some(sign_extend(raw, s.len()))
}

/// Parse the zero-padded decimal field at `range` of `s`.
pub(crate) fn fixed(s: &str, range: Range<usize>) -> Option<u32> {
    let field = s.get(range)?;
    if field.is_empty() || !field.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    field.parse().ok()
}

/// Parse a fractional seconds field of 1 or more digits into microseconds. Digits
/// beyond microsecond resolution are truncated.
pub(crate) fn fraction_micros(s: &str) -> Option<u32> {
    if s.is_empty() || !s.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    let digits = &s[..s.len().min(6)];
    let value: u32 = digits.parse().ok()?;
    Some(value * 10u32.pow((6 - digits.len()) as u32))
}

/// Construct a UTC timestamp from a 2-digit year in the 2000s.
pub(crate) fn timestamp(
    year: u32,
    month: u32,
    day: u32,
    hour: u32,
    min: u32,
    sec: u32,
    micros: u32,
) -> Option<DateTime<Utc>> {
    if year > 99 {
        return None;
    }
    let date = NaiveDate::from_ymd_opt(2000 + year as i32, month, day)?;
    let dt = date.and_hms_micro_opt(hour, min, sec, micros)?;
    Some(Utc.from_utc_datetime(&dt))
}
