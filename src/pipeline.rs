//! Per-sensor processing pipeline.
//!
//! A [Pipeline] drives the bytes of one instrument through frame assembly, decoding,
//! drift monitoring, encoding and dispatch. Every frame is processed to completion
//! before the next one, so records are published in stream order. Nothing here blocks
//! and nothing aborts the stream: every problem is reported in the [Outcome] of the
//! call that observed it.
use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, debug_span, error, Span};

use crate::codec::RecordCodec;
use crate::config::{QoS, SensorConfig, SessionConfig};
use crate::decoder::FieldDecoder;
use crate::dispatch::{dict_payload, publish, Batch, Dispatcher, Publisher, StorageWriter, Topics};
use crate::framing::{FrameAssembler, RawFrame};
use crate::prelude::*;
use crate::record::{DecodedRecord, Validity};
use crate::timesync::DriftMonitor;

/// Everything produced by one [Pipeline::feed] call.
#[derive(Debug, Default)]
pub struct Outcome {
    /// Number of frames assembled.
    pub frames: usize,
    /// Every decoded record, including invalid ones, in stream order.
    pub records: Vec<DecodedRecord>,
    /// Batches dispatched to the publisher.
    pub batches: Vec<Batch>,
    /// Non-fatal diagnostics.
    pub errors: Vec<Error>,
}

impl Outcome {
    /// Records that were valid.
    pub fn valid_records(&self) -> impl Iterator<Item = &DecodedRecord> {
        self.records.iter().filter(|r| r.is_valid())
    }
}

pub struct Pipeline {
    sensor: SensorConfig,
    qos: QoS,
    debug: bool,
    buffer_directory: Option<PathBuf>,
    assembler: Box<dyn FrameAssembler>,
    decoder: Box<dyn FieldDecoder>,
    monitor: DriftMonitor,
    codec: RecordCodec,
    dispatcher: Dispatcher,
    topics: Topics,
    publisher: Arc<dyn Publisher>,
    storage: Option<Arc<dyn StorageWriter>>,
    span: Span,
}

impl Pipeline {
    /// Create the pipeline for `sensor` of the `session` station.
    ///
    /// # Errors
    /// [Error::Config] if the session or sensor configuration is invalid, [Error::Encode]
    /// if the device layout is inconsistent.
    pub fn new(
        session: &SessionConfig,
        sensor: SensorConfig,
        publisher: Arc<dyn Publisher>,
    ) -> Result<Self> {
        session.validate()?;
        sensor.validate()?;

        let decoder = sensor.device.decoder(&sensor);
        let codec = RecordCodec::new(&sensor.sensor_id, decoder.layout())?;
        let monitor = DriftMonitor::new(sensor.drift_offset(), sensor.drift.threshold)
            .with_window(sensor.drift.window);
        let dispatcher = Dispatcher::new(
            &sensor,
            codec.header(),
            dict_payload(&session.station, &sensor),
        );
        let span = debug_span!(
            "sensor",
            id = %sensor.sensor_id,
            device = sensor.device.name()
        );
        debug!(parent: &span, header = codec.header(), stack = sensor.stack, "pipeline created");

        Ok(Pipeline {
            qos: session.qos,
            debug: session.debug,
            buffer_directory: session.buffer_directory.clone(),
            assembler: sensor.device.assembler(),
            topics: Topics::new(&session.station, &sensor.sensor_id),
            decoder,
            monitor,
            codec,
            dispatcher,
            publisher,
            storage: None,
            span,
            sensor,
        })
    }

    /// Write every binary encoded record through `storage` when the session configures a
    /// buffer directory.
    #[must_use]
    pub fn with_storage(mut self, storage: Arc<dyn StorageWriter>) -> Self {
        self.storage = Some(storage);
        self
    }

    #[must_use]
    pub fn sensor(&self) -> &SensorConfig {
        &self.sensor
    }

    #[must_use]
    pub fn header(&self) -> &str {
        self.codec.header()
    }

    #[must_use]
    pub fn topics(&self) -> &Topics {
        &self.topics
    }

    #[must_use]
    pub fn monitor(&self) -> &DriftMonitor {
        &self.monitor
    }

    /// Process bytes from one transport read, received now.
    pub fn feed(&mut self, bytes: &[u8]) -> Outcome {
        self.feed_at(bytes, Utc::now())
    }

    /// Process bytes from one transport read received at `received`.
    pub fn feed_at(&mut self, bytes: &[u8], received: DateTime<Utc>) -> Outcome {
        let _guard = self.span.clone().entered();
        let mut outcome = Outcome::default();
        for frame in self.assembler.feed(bytes) {
            match frame {
                Ok(frame) => {
                    outcome.frames += 1;
                    self.process(&frame, received, &mut outcome);
                }
                Err(err) => outcome.errors.push(err),
            }
        }
        outcome
    }

    /// Discard partially assembled frames and accumulated records. Nothing is flushed.
    pub fn reset(&mut self) {
        let _guard = self.span.clone().entered();
        self.assembler.reset();
        self.dispatcher.reset();
    }

    fn process(&mut self, frame: &RawFrame, received: DateTime<Utc>, outcome: &mut Outcome) {
        let mut record = self.decoder.decode(frame, &self.sensor, received);

        if let Validity::Invalid(reason) = &record.validity {
            outcome.errors.push(Error::Decode(reason.clone()));
        } else if let Some(device) = record.device_time {
            let obs = self.monitor.observe(device, received);
            record.sync = obs.status;
            if obs.warning {
                outcome.errors.push(Error::Drift {
                    drift: obs.drift,
                    threshold: self.sensor.drift.threshold,
                });
            }
        }

        if record.is_valid() {
            match self.codec.to_text(&record) {
                Ok(line) => {
                    if self.debug {
                        debug!(offset = frame.offset, %line, "decoded");
                    }
                    self.store(&record, outcome);
                    if let Some(batch) = self.dispatcher.submit(record.clone(), line) {
                        let errors =
                            publish(&batch, &self.topics, self.qos, self.publisher.as_ref());
                        outcome.errors.extend(errors);
                        outcome.batches.push(batch);
                    }
                }
                Err(err) => {
                    debug!(offset = frame.offset, "record text encoding failed: {err}");
                    outcome.errors.push(err);
                }
            }
        } else {
            // counted as a diagnostic above; submitting logs and drops it
            self.dispatcher.submit(record.clone(), String::new());
        }

        outcome.records.push(record);
    }

    fn store(&self, record: &DecodedRecord, outcome: &mut Outcome) {
        let (Some(dir), Some(storage)) = (&self.buffer_directory, &self.storage) else {
            return;
        };
        let (payload, header) = match self.codec.encode(record) {
            Ok(encoded) => encoded,
            Err(err) => {
                debug!("binary encoding failed; record not stored: {err}");
                outcome.errors.push(err);
                return;
            }
        };
        let filename = record.received.format("%Y-%m-%d").to_string();
        if let Err(source) =
            storage.write_record(dir, &self.sensor.sensor_id, &filename, &payload, &header)
        {
            error!(dir = %dir.display(), %filename, "storage write failed: {source}");
            outcome.errors.push(Error::Storage {
                path: dir.clone(),
                source,
            });
        }
    }
}
