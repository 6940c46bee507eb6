//! One reader thread per instrument.
//!
//! [spawn_sensor] moves a [Pipeline] onto its own named thread that reads from a
//! transport and feeds the pipeline. Sensors never share mutable state; the only shared
//! collaborator is the [Publisher](crate::dispatch::Publisher), which must tolerate
//! concurrent calls.
use std::io::{ErrorKind, Read};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam::channel::{bounded, Receiver, Sender, TrySendError};
use tracing::{debug, error, info, warn};

use crate::pipeline::Pipeline;
use crate::prelude::*;

/// Size of a single transport read.
pub const READ_SIZE: usize = 1024;

/// Wait before reading again after a read timed out or would block.
pub const RETRY_DELAY: Duration = Duration::from_millis(10);

/// Number of diagnostics held for the host. Further diagnostics are dropped and counted
/// until the host drains [SensorTask::errors].
pub const ERROR_BUFFER_SIZE: usize = 1024;

/// Handle to a running sensor thread.
pub struct SensorTask {
    name: String,
    stop: Arc<AtomicBool>,
    errors: Receiver<Error>,
    dropped: Arc<AtomicUsize>,
    handle: Option<JoinHandle<Pipeline>>,
}

impl SensorTask {
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Diagnostics reported by the sensor thread, in the order observed.
    #[must_use]
    pub fn errors(&self) -> &Receiver<Error> {
        &self.errors
    }

    /// Number of diagnostics dropped because the error buffer was full.
    #[must_use]
    pub fn dropped(&self) -> usize {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Request the thread to stop before its next read. Partially assembled frames and
    /// accumulated records are discarded.
    pub fn stop(&self) {
        self.stop.store(true, Ordering::Relaxed);
    }

    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.handle.as_ref().map_or(true, JoinHandle::is_finished)
    }

    /// Wait for the thread to finish, returning its pipeline.
    ///
    /// # Errors
    /// [Error::Io] if the sensor thread panicked.
    pub fn join(mut self) -> Result<Option<Pipeline>> {
        let Some(handle) = self.handle.take() else {
            return Ok(None);
        };
        handle.join().map(Some).map_err(|_| {
            Error::Io(std::io::Error::new(
                ErrorKind::Other,
                format!("sensor thread {} panicked", self.name),
            ))
        })
    }
}

/// Start a thread reading `reader` and driving `pipeline` until EOF, a fatal transport
/// error or [SensorTask::stop].
///
/// Interrupted reads are retried at once; reads that time out or would block are
/// retried after [RETRY_DELAY].
///
/// # Errors
/// [Error::Io] if the thread cannot be spawned.
pub fn spawn_sensor<R>(pipeline: Pipeline, reader: R) -> Result<SensorTask>
where
    R: Read + Send + 'static,
{
    let name = format!("sensor-{}", pipeline.sensor().sensor_id);
    let stop = Arc::new(AtomicBool::new(false));
    let dropped = Arc::new(AtomicUsize::new(0));
    let (errors_tx, errors_rx) = bounded(ERROR_BUFFER_SIZE);

    let handle = thread::Builder::new().name(name.clone()).spawn({
        let stop = stop.clone();
        let diagnostics = Diagnostics {
            tx: errors_tx,
            dropped: dropped.clone(),
        };
        move || run(pipeline, reader, &stop, &diagnostics)
    })?;

    Ok(SensorTask {
        name,
        stop,
        errors: errors_rx,
        dropped,
        handle: Some(handle),
    })
}

struct Diagnostics {
    tx: Sender<Error>,
    dropped: Arc<AtomicUsize>,
}

impl Diagnostics {
    fn send(&self, err: Error) {
        match self.tx.try_send(err) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                if self.dropped.fetch_add(1, Ordering::Relaxed) == 0 {
                    warn!("error buffer full; dropping diagnostics");
                }
            }
            Err(TrySendError::Disconnected(_)) => debug!("error receiver dropped"),
        }
    }
}

fn run<R: Read>(
    mut pipeline: Pipeline,
    mut reader: R,
    stop: &AtomicBool,
    diagnostics: &Diagnostics,
) -> Pipeline {
    let sensor_id = pipeline.sensor().sensor_id.clone();
    info!(sensor = %sensor_id, "sensor reader started");
    let mut buf = vec![0u8; READ_SIZE];

    while !stop.load(Ordering::Relaxed) {
        let n = match reader.read(&mut buf) {
            Ok(0) => {
                debug!(sensor = %sensor_id, "transport closed");
                break;
            }
            Ok(n) => n,
            Err(err) if err.kind() == ErrorKind::Interrupted => continue,
            Err(err) if matches!(err.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => {
                thread::sleep(RETRY_DELAY);
                continue;
            }
            Err(err) => {
                error!(sensor = %sensor_id, "transport read failed: {err}");
                diagnostics.send(Error::Io(err));
                break;
            }
        };

        for err in pipeline.feed(&buf[..n]).errors {
            diagnostics.send(err);
        }
    }

    pipeline.reset();
    let dropped = diagnostics.dropped.load(Ordering::Relaxed);
    info!(sensor = %sensor_id, dropped, "sensor reader stopped");
    pipeline
}
