// Beat Keeper Core - acoustic-to-MIDI beat tracker
// Piezo onsets in, an adaptive 24 PPQN MIDI clock out

// Module declarations
pub mod audio;
pub mod clock;
pub mod config;
pub mod engine;
pub mod error;
pub mod indicators;
pub mod onset;
pub mod replay;
pub mod state;
pub mod telemetry;
pub mod testing;
pub mod timing;
pub mod tracking;

// Re-exports for convenience
pub use config::{AppConfig, ParamPatch};
pub use engine::{BeatTracker, TrackerIo};
pub use replay::{replay_recording, Recording, Replay, ReplayReport};
pub use state::Micros;

/// Install the fmt subscriber on stderr (also receiving `log` records).
///
/// Safe to call more than once; later calls are ignored.
pub fn init_logging(verbose: bool) {
    let level = if verbose {
        tracing::Level::DEBUG
    } else {
        tracing::Level::INFO
    };
    let _ = tracing_subscriber::fmt()
        .with_max_level(level)
        .with_target(false)
        .with_writer(std::io::stderr)
        .try_init();
}
