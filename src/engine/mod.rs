//! Engine module housing the live tracker.
//!
//! `BeatTracker` wires the detector, evaluator and clock threads around one
//! shared beat state. Offline runs use [`crate::replay`] instead.

pub mod core;

pub use self::core::{bpm_from_tau, tau_from_bpm, BeatTracker, TrackerIo};
