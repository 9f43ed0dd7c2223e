//! Diagnostics telemetry collector and helpers.
//!
//! The collector multiplexes onsets, applied corrections, clamps, aborted
//! scans and sampling overruns into a bounded history plus an async broadcast
//! stream. Anomalies are also counted so they stay observable after the
//! history has rolled over.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use once_cell::sync::Lazy;
use tokio::sync::broadcast;

use crate::onset::Instrument;
use crate::state::Micros;

pub mod events;

pub use events::{ClampTarget, DiagnosticEvent};

static HUB: Lazy<Arc<TelemetryHub>> = Lazy::new(|| Arc::new(TelemetryHub::default()));

/// Access the global telemetry hub.
pub fn hub() -> Arc<TelemetryHub> {
    Arc::clone(&HUB)
}

/// Snapshot of collector state for CLI reporting.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct TelemetrySnapshot {
    pub recent: Vec<DiagnosticEvent>,
    pub total_events: u64,
    pub dropped_events: u64,
    pub clamp_count: u64,
    pub overrun_count: u64,
    pub aborted_scans: u64,
}

/// Broadcast-based collector retaining a bounded history of events.
pub struct TelemetryCollector {
    tx: broadcast::Sender<DiagnosticEvent>,
    history: Mutex<VecDeque<DiagnosticEvent>>,
    history_capacity: usize,
    total_events: AtomicU64,
    dropped_history: AtomicU64,
}

impl TelemetryCollector {
    pub fn new(buffer: usize, history_capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(buffer.max(1));
        Self {
            tx,
            history: Mutex::new(VecDeque::with_capacity(history_capacity)),
            history_capacity: history_capacity.max(1),
            total_events: AtomicU64::new(0),
            dropped_history: AtomicU64::new(0),
        }
    }

    fn history(&self) -> MutexGuard<'_, VecDeque<DiagnosticEvent>> {
        self.history
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn publish(&self, event: DiagnosticEvent) {
        self.total_events.fetch_add(1, Ordering::Relaxed);
        {
            let mut history = self.history();
            if history.len() == self.history_capacity {
                history.pop_front();
                self.dropped_history.fetch_add(1, Ordering::Relaxed);
            }
            history.push_back(event.clone());
        }

        // No subscribers is the common case
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<DiagnosticEvent> {
        self.tx.subscribe()
    }

    fn recent(&self) -> Vec<DiagnosticEvent> {
        self.history().iter().cloned().collect()
    }
}

impl Default for TelemetryCollector {
    fn default() -> Self {
        Self::new(256, 64)
    }
}

/// Top-level hub wrapping the collector plus anomaly counters.
pub struct TelemetryHub {
    collector: TelemetryCollector,
    clamp_count: AtomicU64,
    overrun_count: AtomicU64,
    aborted_scans: AtomicU64,
}

impl TelemetryHub {
    pub fn new(channel_capacity: usize, history_capacity: usize) -> Self {
        Self {
            collector: TelemetryCollector::new(channel_capacity, history_capacity),
            clamp_count: AtomicU64::new(0),
            overrun_count: AtomicU64::new(0),
            aborted_scans: AtomicU64::new(0),
        }
    }

    pub fn collector(&self) -> &TelemetryCollector {
        &self.collector
    }

    pub fn subscribe(&self) -> broadcast::Receiver<DiagnosticEvent> {
        self.collector.subscribe()
    }

    pub fn snapshot(&self) -> TelemetrySnapshot {
        TelemetrySnapshot {
            recent: self.collector.recent(),
            total_events: self.collector.total_events.load(Ordering::Relaxed),
            dropped_events: self.collector.dropped_history.load(Ordering::Relaxed),
            clamp_count: self.clamp_count.load(Ordering::Relaxed),
            overrun_count: self.overrun_count.load(Ordering::Relaxed),
            aborted_scans: self.aborted_scans.load(Ordering::Relaxed),
        }
    }

    pub fn clamp_count(&self) -> u64 {
        self.clamp_count.load(Ordering::Relaxed)
    }

    pub fn overrun_count(&self) -> u64 {
        self.overrun_count.load(Ordering::Relaxed)
    }

    pub fn aborted_scans(&self) -> u64 {
        self.aborted_scans.load(Ordering::Relaxed)
    }

    pub fn record_onset(&self, instrument: Instrument, timestamp_us: Micros) {
        self.collector.publish(DiagnosticEvent::Onset {
            instrument,
            timestamp_us,
        });
    }

    /// Publish one overrun event; the counter totals the blocks it lost.
    pub fn record_overrun(&self, dropped_blocks: u64) {
        self.overrun_count
            .fetch_add(dropped_blocks, Ordering::Relaxed);
        self.collector
            .publish(DiagnosticEvent::SamplingOverrun { dropped_blocks });
    }

    pub fn record_clamp(&self, target: ClampTarget, requested_us: Micros, floor_us: Micros) {
        self.clamp_count.fetch_add(1, Ordering::Relaxed);
        self.collector.publish(DiagnosticEvent::CorrectionClamped {
            target,
            requested_us,
            floor_us,
        });
    }

    pub fn record_scan_aborted(&self, ioi_multiple: i64) {
        self.aborted_scans.fetch_add(1, Ordering::Relaxed);
        self.collector
            .publish(DiagnosticEvent::ScanAborted { ioi_multiple });
    }

    pub fn record_sync(&self, correction_us: Micros, accuracy: f64) {
        self.collector.publish(DiagnosticEvent::SyncApplied {
            correction_us,
            accuracy,
        });
    }

    pub fn record_tempo(&self, correction_us: Micros, accuracy: f64) {
        self.collector.publish(DiagnosticEvent::TempoApplied {
            correction_us,
            accuracy,
        });
    }

    pub fn record_clock_started(&self, tau_us: Micros) {
        self.collector
            .publish(DiagnosticEvent::ClockStarted { tau_us });
    }

    pub fn record_clock_stopped(&self) {
        self.collector.publish(DiagnosticEvent::ClockStopped);
    }
}

impl Default for TelemetryHub {
    fn default() -> Self {
        Self::new(256, 64)
    }
}
