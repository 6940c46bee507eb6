//! Batching and publishing of encoded records.
//!
//! The [Dispatcher] owns the per-sensor batching state: records accumulate until the
//! configured stack depth is reached and are then released as one [Batch]. It decides
//! when the layout header (metadata) and the static identification attributes (dict)
//! accompany a batch. Publishing a batch through a [Publisher] is a separate step so a
//! failed publish never affects the batching state.
use std::fmt::Display;
use std::path::Path;

use tracing::{debug, error, trace};

use crate::config::{QoS, SensorConfig};
use crate::error::BoxError;
use crate::prelude::*;
use crate::record::{DecodedRecord, Validity};

/// Destination for dispatched batches, e.g., an MQTT client.
///
/// Implementations shared between sensors must be safe for concurrent calls.
pub trait Publisher: Send + Sync {
    /// Publish `payload` to `topic`. The caller does not wait for any acknowledgment
    /// beyond the return of this call.
    ///
    /// # Errors
    /// Any error of the underlying transport.
    fn publish(&self, topic: &str, payload: &str, qos: QoS) -> std::result::Result<(), BoxError>;
}

/// Persists binary encoded records, e.g., to daily buffer files.
pub trait StorageWriter: Send + Sync {
    /// # Errors
    /// Any I/O error writing the record.
    fn write_record(
        &self,
        directory: &Path,
        sensor_id: &str,
        date_filename: &str,
        payload: &[u8],
        header: &str,
    ) -> std::io::Result<()>;
}

/// Publish topics of one sensor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Topics {
    pub data: String,
    pub meta: String,
    pub dict: String,
}

impl Topics {
    #[must_use]
    pub fn new(station: &str, sensor_id: &str) -> Self {
        Topics {
            data: format!("{station}/{sensor_id}/data"),
            meta: format!("{station}/{sensor_id}/meta"),
            dict: format!("{station}/{sensor_id}/dict"),
        }
    }
}

/// Static identification attributes of a sensor, published on the dict topic.
#[must_use]
pub fn dict_payload(station: &str, sensor: &SensorConfig) -> String {
    let opt = |v: &Option<String>| v.clone().unwrap_or_default();
    // The "SensorDecription" spelling is what existing consumers parse.
    format!(
        concat!(
            "SensorID:{},StationID:{},DataPier:{},SensorModule:{},SensorGroup:{},",
            "SensorDecription:{},DataTimeProtocol:{}"
        ),
        sensor.sensor_id,
        station,
        opt(&sensor.pier),
        sensor.device.name(),
        opt(&sensor.group),
        opt(&sensor.description),
        opt(&sensor.time_protocol),
    )
}

/// Records released together by a [Dispatcher].
#[derive(Debug, Clone)]
pub struct Batch {
    /// Zero based index of this batch in the sensor session.
    pub sequence: u64,
    pub records: Vec<DecodedRecord>,
    /// Text form of each record, in submission order.
    pub lines: Vec<String>,
    /// Layout header to publish on the meta topic with this batch.
    pub meta: Option<String>,
    /// Identification attributes to publish on the dict topic with this batch.
    pub dict: Option<String>,
}

impl Batch {
    /// Data topic payload: the record lines joined with `;`.
    #[must_use]
    pub fn payload(&self) -> String {
        self.lines.join(";")
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.lines.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }
}

impl Display for Batch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Batch{{sequence={}, records={}, meta={}, dict={}}}",
            self.sequence,
            self.lines.len(),
            self.meta.is_some(),
            self.dict.is_some()
        )
    }
}

/// Per-sensor batching state.
#[derive(Debug)]
pub struct Dispatcher {
    stack: usize,
    meta_interval: u32,
    header: String,
    dict: Option<String>,
    pending: Vec<(DecodedRecord, String)>,
    // dispatches since the last metadata announcement, singleton mode only
    meta_count: u32,
    sequence: u64,
}

impl Dispatcher {
    /// Create a dispatcher for `sensor` publishing `header` as metadata and `dict` with
    /// the first batch.
    pub fn new(sensor: &SensorConfig, header: impl Into<String>, dict: impl Into<String>) -> Self {
        Dispatcher {
            stack: sensor.stack.max(1),
            meta_interval: sensor.meta_interval.max(1),
            header: header.into(),
            dict: Some(dict.into()),
            pending: Vec::with_capacity(sensor.stack.max(1)),
            meta_count: 0,
            sequence: 0,
        }
    }

    /// Number of records accumulated toward the next batch.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    /// Submit a record with its text form, returning a batch if one is complete.
    ///
    /// Invalid records are dropped without counting toward the stack depth.
    pub fn submit(&mut self, record: DecodedRecord, line: String) -> Option<Batch> {
        if let Validity::Invalid(reason) = &record.validity {
            debug!(sensor = %record.sensor_id, %reason, "dropping invalid record");
            return None;
        }

        self.pending.push((record, line));
        if self.pending.len() < self.stack {
            trace!(pending = self.pending.len(), stack = self.stack, "accumulating");
            return None;
        }

        let meta = if self.stack > 1 {
            // batch boundaries need not align with the meta cadence
            Some(self.header.clone())
        } else {
            let due = self.meta_count == 0;
            self.meta_count += 1;
            if self.meta_count >= self.meta_interval {
                self.meta_count = 0;
            }
            due.then(|| self.header.clone())
        };

        let (records, lines): (Vec<_>, Vec<_>) =
            std::mem::take(&mut self.pending).into_iter().unzip();
        let batch = Batch {
            sequence: self.sequence,
            records,
            lines,
            dict: meta.as_ref().and_then(|_| self.dict.take()),
            meta,
        };
        self.sequence += 1;
        Some(batch)
    }

    /// Discard any accumulated records. Cadence and session state are kept.
    pub fn reset(&mut self) {
        if !self.pending.is_empty() {
            debug!(discarded = self.pending.len(), "discarding accumulated records");
        }
        self.pending.clear();
    }
}

/// Publish `batch` to `topics`: dict (if present), meta (if present), then data.
///
/// Every publish is attempted even if an earlier one fails. Failures are returned as
/// [Error::Sink].
pub fn publish(batch: &Batch, topics: &Topics, qos: QoS, sink: &dyn Publisher) -> Vec<Error> {
    let messages = [
        (&topics.dict, batch.dict.clone()),
        (&topics.meta, batch.meta.clone()),
        (&topics.data, Some(batch.payload())),
    ];
    let mut errors = Vec::default();
    for (topic, payload) in messages {
        let Some(payload) = payload else {
            continue;
        };
        if let Err(source) = sink.publish(topic, &payload, qos) {
            error!(topic = %topic, sequence = batch.sequence, "publish failed: {source}");
            errors.push(Error::Sink {
                topic: topic.clone(),
                source,
            });
        }
    }
    errors
}
