//! Device/host clock drift monitoring.
//!
//! Instruments stamp samples with their own (typically GPS disciplined) clock. That time
//! is authoritative but can be wrong or stale, so each sample is compared to the host
//! receipt time. The comparison never alters a record; it only yields a [DriftStatus]
//! callers use to decide whether to fall back to host time.
use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub enum DriftStatus {
    #[default]
    Ok,
    Degraded,
}

/// A single device/host time comparison.
#[derive(Debug, Clone, PartialEq)]
pub struct DriftSample {
    pub device: DateTime<Utc>,
    pub received: DateTime<Utc>,
    /// Absolute difference between `device` and `received` in seconds.
    pub delay: f64,
}

/// Result of [DriftMonitor::observe].
#[derive(Debug, Clone, PartialEq)]
pub struct Observation {
    pub status: DriftStatus,
    /// Delay less the expected propagation offset, in seconds.
    pub drift: f64,
    /// True only for the observation that moved the monitor from ok to degraded.
    pub warning: bool,
}

#[derive(Debug, Clone)]
pub struct DriftMonitor {
    /// Expected device-to-host propagation and processing offset in seconds.
    offset: f64,
    threshold: f64,
    capacity: usize,
    window: VecDeque<DriftSample>,
    consecutive: u64,
}

impl DriftMonitor {
    pub const DEFAULT_THRESHOLD: f64 = 3.0;
    pub const DEFAULT_WINDOW: usize = 1000;

    pub fn new(offset: f64, threshold: f64) -> Self {
        DriftMonitor {
            offset,
            threshold,
            capacity: Self::DEFAULT_WINDOW,
            window: VecDeque::new(),
            consecutive: 0,
        }
    }

    /// Number of recent samples retained for the delay estimate. Zero retains none.
    pub fn with_window(mut self, capacity: usize) -> Self {
        self.capacity = capacity;
        let excess = self.window.len().saturating_sub(capacity);
        self.window.drain(..excess);
        self
    }

    /// Compare a device timestamp with the host receipt timestamp.
    pub fn observe(&mut self, device: DateTime<Utc>, received: DateTime<Utc>) -> Observation {
        let delay = (received - device)
            .num_microseconds()
            .map_or(f64::INFINITY, |us| us.unsigned_abs() as f64 / 1e6);
        let drift = delay - self.offset;

        if self.capacity > 0 {
            if self.window.len() == self.capacity {
                self.window.pop_front();
            }
            self.window.push_back(DriftSample {
                device,
                received,
                delay,
            });
        }

        if drift > self.threshold {
            self.consecutive += 1;
            let warning = self.consecutive == 1;
            if warning {
                warn!(
                    delay,
                    drift,
                    threshold = self.threshold,
                    "large time difference observed; falling back to host time"
                );
            }
            Observation {
                status: DriftStatus::Degraded,
                drift,
                warning,
            }
        } else {
            if self.consecutive > 0 {
                debug!(
                    after = self.consecutive,
                    drift, "time difference back within threshold"
                );
            }
            self.consecutive = 0;
            Observation {
                status: DriftStatus::Ok,
                drift,
                warning: false,
            }
        }
    }

    #[must_use]
    pub fn status(&self) -> DriftStatus {
        if self.consecutive > 0 {
            DriftStatus::Degraded
        } else {
            DriftStatus::Ok
        }
    }

    /// Number of consecutive observations exceeding the threshold.
    #[must_use]
    pub fn consecutive(&self) -> u64 {
        self.consecutive
    }

    /// Median device/host delay, in seconds, over the retained window.
    #[must_use]
    pub fn median_delay(&self) -> Option<f64> {
        if self.window.is_empty() {
            return None;
        }
        let mut delays: Vec<f64> = self.window.iter().map(|s| s.delay).collect();
        delays.sort_by(f64::total_cmp);
        let mid = delays.len() / 2;
        if delays.len() % 2 == 0 {
            Some((delays[mid - 1] + delays[mid]) / 2.0)
        } else {
            Some(delays[mid])
        }
    }

    #[must_use]
    pub fn samples(&self) -> &VecDeque<DriftSample> {
        &self.window
    }
}
