//! Diagnostic event types published by the tracker.

use serde::{Deserialize, Serialize};

use crate::onset::Instrument;
use crate::state::Micros;

/// What a clamped correction would have pushed below the floor.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ClampTarget {
    /// The tempo step applied to tau itself
    Tau,
    /// A smoothed latency contribution at one bar position
    Latency { position: usize },
    /// The phase correction folded into the next half period
    Sync,
}

/// Events describing what the tracker did and every numeric anomaly it handled.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum DiagnosticEvent {
    Onset {
        instrument: Instrument,
        timestamp_us: Micros,
    },
    SamplingOverrun {
        dropped_blocks: u64,
    },
    CorrectionClamped {
        target: ClampTarget,
        requested_us: Micros,
        floor_us: Micros,
    },
    ScanAborted {
        ioi_multiple: i64,
    },
    SyncApplied {
        correction_us: Micros,
        accuracy: f64,
    },
    TempoApplied {
        correction_us: Micros,
        accuracy: f64,
    },
    ClockStarted {
        tau_us: Micros,
    },
    ClockStopped,
}
