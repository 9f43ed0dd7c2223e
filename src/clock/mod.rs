// Clock module - adaptive MIDI clock
//
// Architecture:
// - scheduler: BeatClock tick state machine (pure, no threads)
// - runner: real-time thread that sleeps between ticks and owns the BeatClock
// - midi: realtime byte output (midir port or recorder)

pub mod midi;
pub mod runner;
pub mod scheduler;

pub use midi::{list_output_ports, MidiPortSink, MidiSink, RecordingMidi, START, STOP, TIMING_CLOCK};
pub use runner::{spawn_clock_thread, ClockHandle, ClockMessage, ClockSender};
pub use scheduler::{
    correction_floor, BeatClock, ClockCommand, ClockEffect, ClockRunState, TICKS_PER_8TH,
};
