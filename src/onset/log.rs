//! Fixed-capacity onset log.
//!
//! Single writer (the detector), many readers (the evaluators). Every event
//! gets a monotonically increasing sequence number and lives in slot
//! `seq % capacity` until it is overwritten one lap later.
//!
//! Each slot is a single `AtomicU64` holding the whole event plus the lap it
//! was written in, so a reader can never observe half an event and can always
//! tell a live slot from one that has already been recycled:
//!
//! ```text
//!  63        43 42                                   1   0
//! +-----------+--------------------------------------+---+
//! |    lap    |             timestamp (us)           | i |
//! +-----------+--------------------------------------+---+
//! ```
//!
//! Publication order is slot first, then `len` with `Release`. Readers load
//! `len` with `Acquire`, so any sequence below the loaded length is fully
//! written.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

use crate::state::Micros;

/// Number of onsets retained
pub const ONSET_LOG_CAPACITY: usize = 300;

const INSTRUMENT_BITS: u32 = 1;
const TIMESTAMP_BITS: u32 = 42;
const LAP_SHIFT: u32 = INSTRUMENT_BITS + TIMESTAMP_BITS;
const TIMESTAMP_MASK: u64 = (1 << TIMESTAMP_BITS) - 1;
const LAP_MASK: u64 = (1 << (64 - LAP_SHIFT)) - 1;

/// Drum channel an onset was detected on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Instrument {
    Kick,
    Snare,
}

impl Instrument {
    pub const ALL: [Instrument; 2] = [Instrument::Kick, Instrument::Snare];

    /// Row index into per-instrument tables
    pub fn index(self) -> usize {
        match self {
            Instrument::Kick => 0,
            Instrument::Snare => 1,
        }
    }
}

/// One detected onset. Immutable once written.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct OnsetEvent {
    pub timestamp_us: Micros,
    pub instrument: Instrument,
}

impl OnsetEvent {
    fn pack(self, lap: u64) -> u64 {
        let timestamp = (self.timestamp_us.max(0) as u64) & TIMESTAMP_MASK;
        let bit = self.instrument.index() as u64;
        ((lap & LAP_MASK) << LAP_SHIFT) | (timestamp << INSTRUMENT_BITS) | bit
    }

    fn unpack(word: u64) -> (u64, Self) {
        let instrument = if word & 1 == 0 {
            Instrument::Kick
        } else {
            Instrument::Snare
        };
        let timestamp_us = ((word >> INSTRUMENT_BITS) & TIMESTAMP_MASK) as Micros;
        (
            word >> LAP_SHIFT,
            Self {
                timestamp_us,
                instrument,
            },
        )
    }
}

/// Append-only ring of onsets with lock-free publication.
#[derive(Debug)]
pub struct OnsetLog {
    slots: Box<[AtomicU64]>,
    /// Number of events ever pushed; the next sequence number
    len: AtomicU64,
}

impl OnsetLog {
    pub fn new() -> Self {
        Self::with_capacity(ONSET_LOG_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            slots: (0..capacity).map(|_| AtomicU64::new(u64::MAX)).collect(),
            len: AtomicU64::new(0),
        }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Total events ever pushed
    pub fn len(&self) -> u64 {
        self.len.load(Ordering::Acquire)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Sequence number of the newest event
    pub fn newest(&self) -> Option<u64> {
        self.len().checked_sub(1)
    }

    /// Sequence number of the oldest event still retained
    pub fn oldest_retained(&self) -> u64 {
        self.len().saturating_sub(self.capacity() as u64)
    }

    /// Append an event and return its sequence number.
    ///
    /// Must only be called from the single writer.
    pub fn push(&self, event: OnsetEvent) -> u64 {
        let seq = self.len.load(Ordering::Relaxed);
        let capacity = self.capacity() as u64;
        let slot = (seq % capacity) as usize;
        self.slots[slot].store(event.pack(seq / capacity), Ordering::Release);
        self.len.store(seq + 1, Ordering::Release);
        seq
    }

    /// Read event `seq`, or `None` if it is not yet published or was overwritten.
    pub fn get(&self, seq: u64) -> Option<OnsetEvent> {
        let len = self.len();
        let capacity = self.capacity() as u64;
        if seq >= len || len - seq > capacity {
            return None;
        }
        let word = self.slots[(seq % capacity) as usize].load(Ordering::Acquire);
        let (lap, event) = OnsetEvent::unpack(word);
        // The writer may have lapped us between the length check and the load
        (lap == (seq / capacity) & LAP_MASK).then_some(event)
    }

    /// Move a cursor that lags by more than the capacity forward to the
    /// oldest retained event.
    pub fn clamp_cursor(&self, cursor: u64) -> u64 {
        cursor.max(self.oldest_retained())
    }

    /// Events with sequence numbers in `from..to`, skipping any that were
    /// overwritten while iterating.
    pub fn range(&self, from: u64, to: u64) -> impl Iterator<Item = (u64, OnsetEvent)> + '_ {
        let from = self.clamp_cursor(from);
        (from..to).filter_map(move |seq| self.get(seq).map(|event| (seq, event)))
    }
}

impl Default for OnsetLog {
    fn default() -> Self {
        Self::new()
    }
}
