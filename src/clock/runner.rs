// ClockRunner - real-time thread driving the BeatClock
//
// While stopped the thread blocks on its command channel. While running it
// sleeps toward each tick deadline (hybrid sleep/spin via `Clock`) in slices
// of at most `MAX_SLEEP_SLICE_US`, draining queued commands after every
// slice, so a Stop takes effect within one slice even during a long lead-in
// to the first beat.

use std::sync::Arc;
use std::thread::{self, JoinHandle};

use tokio::sync::mpsc::{self, error::TryRecvError, UnboundedReceiver, UnboundedSender};

use crate::config::Tunables;
use crate::error::ClockError;
use crate::onset::DetectorMailbox;
use crate::state::Micros;
use crate::timing::Clock;

use super::scheduler::{BeatClock, ClockCommand};

/// Longest uninterrupted sleep before the command channel is checked again
pub const MAX_SLEEP_SLICE_US: Micros = 5_000;

/// What travels over the clock thread's channel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClockMessage {
    Command(ClockCommand),
    Shutdown,
}

/// Sending side of the clock thread's command channel
#[derive(Clone)]
pub struct ClockSender {
    tx: UnboundedSender<ClockMessage>,
}

impl ClockSender {
    /// A sender paired with a plain receiver, for driving the clock by hand
    pub fn channel() -> (ClockSender, UnboundedReceiver<ClockMessage>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (ClockSender { tx }, rx)
    }

    pub fn send(&self, command: ClockCommand) -> Result<(), ClockError> {
        self.tx
            .send(ClockMessage::Command(command))
            .map_err(|_| ClockError::ChannelClosed {
                channel: "clock".to_string(),
            })
    }
}

struct ClockRunner {
    clock: BeatClock,
    rx: UnboundedReceiver<ClockMessage>,
    detector: DetectorMailbox,
    tunables: Tunables,
    time: Arc<dyn Clock>,
    next_tick: Option<Micros>,
}

impl ClockRunner {
    /// Apply one message; false on shutdown
    fn apply(&mut self, message: ClockMessage) -> bool {
        let command = match message {
            ClockMessage::Command(command) => command,
            ClockMessage::Shutdown => return false,
        };
        if let ClockCommand::SetTempoCorrection(_) = command {
            self.clock
                .set_latency_smoothing(self.tunables.latency_smoothing());
        }
        let effect = self.clock.handle(command);
        if let Some(detector_command) = effect.detector {
            self.detector.send(detector_command);
        }
        if matches!(command, ClockCommand::Start { .. } | ClockCommand::Stop) {
            self.next_tick = effect.next_tick_at;
        }
        true
    }

    /// Apply everything queued; false on shutdown or when every sender is gone
    fn drain(&mut self) -> bool {
        loop {
            match self.rx.try_recv() {
                Ok(message) => {
                    if !self.apply(message) {
                        return false;
                    }
                }
                Err(TryRecvError::Empty) => return true,
                Err(TryRecvError::Disconnected) => return false,
            }
        }
    }

    fn run(mut self) {
        tracing::info!("[ClockRunner] Thread started");
        loop {
            let Some(deadline) = self.next_tick else {
                match self.rx.blocking_recv() {
                    Some(message) => {
                        if !self.apply(message) {
                            break;
                        }
                        continue;
                    }
                    None => break,
                }
            };

            let wake = deadline.min(self.time.now_us() + MAX_SLEEP_SLICE_US);
            self.time.sleep_until(wake);
            if !self.drain() {
                break;
            }
            // A Start or Stop drained above replaces the deadline
            if self.next_tick != Some(deadline) || wake < deadline {
                continue;
            }

            let effect = self.clock.on_tick(deadline);
            if let Some(detector_command) = effect.detector {
                self.detector.send(detector_command);
            }
            self.next_tick = effect.next_tick_at;
        }

        if self.clock.is_running() {
            let effect = self.clock.handle(ClockCommand::Stop);
            if let Some(detector_command) = effect.detector {
                self.detector.send(detector_command);
            }
        }
        tracing::info!("[ClockRunner] Thread exiting");
    }
}

/// Owner's handle on the clock thread
pub struct ClockHandle {
    sender: ClockSender,
    join: Option<JoinHandle<()>>,
}

impl ClockHandle {
    pub fn sender(&self) -> ClockSender {
        self.sender.clone()
    }

    pub fn send(&self, command: ClockCommand) -> Result<(), ClockError> {
        self.sender.send(command)
    }

    /// Stop the clock (sending STOP if running) and join the thread
    pub fn shutdown(&mut self) {
        let _ = self.sender.tx.send(ClockMessage::Shutdown);
        if let Some(join) = self.join.take() {
            if join.join().is_err() {
                tracing::error!("[ClockRunner] Thread panicked");
            }
        }
    }
}

impl Drop for ClockHandle {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Spawn the clock thread owning `clock`.
pub fn spawn_clock_thread(
    clock: BeatClock,
    detector: DetectorMailbox,
    tunables: Tunables,
    time: Arc<dyn Clock>,
) -> ClockHandle {
    let (sender, rx) = ClockSender::channel();
    let runner = ClockRunner {
        clock,
        rx,
        detector,
        tunables,
        time,
        next_tick: None,
    };
    let join = thread::spawn(move || runner.run());
    ClockHandle {
        sender,
        join: Some(join),
    }
}
