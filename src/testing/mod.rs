//! Test and replay harness utilities.
//!
//! Recorders for every output the tracker drives, a virtual clock, and a
//! seeded generator for synthetic two-channel performances. Nothing here
//! touches audio or MIDI hardware.

pub mod synthetic;

pub use crate::clock::RecordingMidi;
pub use crate::indicators::{IndicatorEvent, RecordingIndicators};
pub use crate::timing::ManualClock;
pub use synthetic::{SyntheticPerformance, HIT_LEVEL};
