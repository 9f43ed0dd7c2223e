//! Visual/audible feedback outputs.
//!
//! The tracker drives four beat accents (one per quarter note of the bar),
//! a short flash per detected onset, and clip indication while the gain check
//! is active. How these reach LEDs or a click generator is up to the
//! implementation.

use std::sync::Mutex;

use crate::onset::Instrument;

/// Feedback sink driven by the clock and the detector.
pub trait Indicators: Send + Sync {
    /// Turn on the accent for quarter note `beat` (0..4) of the bar
    fn accent_on(&self, beat: u8);

    /// Turn all accents off
    fn accents_off(&self);

    /// Momentary pulse for a detected onset
    fn onset_flash(&self, instrument: Instrument);

    /// Clip status of a channel during the gain check
    fn clip_status(&self, instrument: Instrument, clipping: bool);
}

/// Discards everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullIndicators;

impl Indicators for NullIndicators {
    fn accent_on(&self, _beat: u8) {}
    fn accents_off(&self) {}
    fn onset_flash(&self, _instrument: Instrument) {}
    fn clip_status(&self, _instrument: Instrument, _clipping: bool) {}
}

/// Writes accents and onsets to the log at debug level.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogIndicators;

impl Indicators for LogIndicators {
    fn accent_on(&self, beat: u8) {
        if beat == 0 {
            tracing::debug!("[Indicators] ONE");
        } else {
            tracing::debug!("[Indicators] beat {}", beat + 1);
        }
    }

    fn accents_off(&self) {}

    fn onset_flash(&self, instrument: Instrument) {
        tracing::debug!("[Indicators] onset {:?}", instrument);
    }

    fn clip_status(&self, instrument: Instrument, clipping: bool) {
        if clipping {
            tracing::info!("[Indicators] {:?} input clipping", instrument);
        }
    }
}

/// Something an [`Indicators`] implementation was asked to show.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndicatorEvent {
    AccentOn(u8),
    AccentsOff,
    OnsetFlash(Instrument),
    Clip(Instrument, bool),
}

/// Records every indicator call for assertions.
#[derive(Debug, Default)]
pub struct RecordingIndicators {
    events: Mutex<Vec<IndicatorEvent>>,
}

impl RecordingIndicators {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<IndicatorEvent> {
        self.events
            .lock()
            .map(|events| events.clone())
            .unwrap_or_default()
    }

    fn push(&self, event: IndicatorEvent) {
        if let Ok(mut events) = self.events.lock() {
            events.push(event);
        }
    }
}

impl Indicators for RecordingIndicators {
    fn accent_on(&self, beat: u8) {
        self.push(IndicatorEvent::AccentOn(beat));
    }

    fn accents_off(&self) {
        self.push(IndicatorEvent::AccentsOff);
    }

    fn onset_flash(&self, instrument: Instrument) {
        self.push(IndicatorEvent::OnsetFlash(instrument));
    }

    fn clip_status(&self, instrument: Instrument, clipping: bool) {
        self.push(IndicatorEvent::Clip(instrument, clipping));
    }
}
