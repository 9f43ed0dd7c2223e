// Evaluator worker - sync and tempo passes on one runtime thread
//
// Both evaluators run as tasks on a current-thread tokio runtime owned by a
// dedicated std thread, so they never run concurrently with each other. The
// sync task is woken by the detector when the clock closes a window; after
// every pass it wakes the tempo task. Corrections go to the clock thread as
// commands; the shared state is only locked for snapshots and the tempo
// cursor write-back.

use std::sync::Arc;
use std::thread::{self, JoinHandle};

use tokio::sync::oneshot;

use crate::clock::{ClockCommand, ClockSender};
use crate::config::{SyncConfig, TempoConfig, Tunables};
use crate::error::{log_clock_error, ClockError};
use crate::onset::OnsetLog;
use crate::state::{Micros, SharedBeatState};
use crate::telemetry::TelemetryHub;
use crate::timing::Clock;

use super::signal::{EvaluatorSignal, EvaluatorWake, WakeListener};
use super::sync::{LayerDecayRule, SyncController};
use super::tempo::TempoController;

/// Shared resources the evaluator tasks read and write
#[derive(Clone)]
pub struct EvaluatorLinks {
    pub state: SharedBeatState,
    pub log: Arc<OnsetLog>,
    pub tunables: Tunables,
    pub clock: ClockSender,
    pub time: Arc<dyn Clock>,
    pub telemetry: Arc<TelemetryHub>,
    pub decay_rule: LayerDecayRule,
}

/// Owner's handle on the evaluator thread
pub struct EvaluatorHandle {
    sync_wake: EvaluatorWake,
    tempo_wake: EvaluatorWake,
    shutdown_tx: Option<oneshot::Sender<()>>,
    join: Option<JoinHandle<()>>,
}

impl EvaluatorHandle {
    /// Wake handle of the sync evaluator (the detector holds a clone)
    pub fn sync_wake(&self) -> EvaluatorWake {
        self.sync_wake.clone()
    }

    /// Reset both evaluators to the defaults for `tau`
    pub fn reset(&self, tau: Micros) {
        self.sync_wake.reset(tau);
        self.tempo_wake.reset(tau);
    }

    pub fn shutdown(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        if let Some(join) = self.join.take() {
            if join.join().is_err() {
                tracing::error!("[EvaluatorWorker] Thread panicked");
            }
        }
    }
}

impl Drop for EvaluatorHandle {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// One sync pass over the window that just closed.
///
/// Returns the phase correction to hand to the clock, if any.
pub fn sync_pass(
    controller: &mut SyncController,
    state: &SharedBeatState,
    log: &OnsetLog,
    config: &SyncConfig,
    telemetry: &TelemetryHub,
) -> Option<Micros> {
    let snapshot = state.snapshot();
    let outcome = controller.evaluate(&snapshot, log, config);
    let correction = outcome.correction?;
    let accuracy = outcome.winner_accuracy.unwrap_or(0.0);
    tracing::debug!(
        "[SyncEvaluator] pos {} correction {} us (accuracy {:.3})",
        snapshot.bar_position,
        correction,
        accuracy
    );
    telemetry.record_sync(correction, accuracy);
    Some(correction)
}

/// One tempo pass at `now`, writing the advanced cursor back to `state`.
///
/// Returns the tempo correction to hand to the clock, if any.
pub fn tempo_pass(
    controller: &mut TempoController,
    state: &SharedBeatState,
    log: &OnsetLog,
    config: &TempoConfig,
    telemetry: &TelemetryHub,
    now: Micros,
) -> Option<Micros> {
    let snapshot = state.snapshot();
    let outcome = controller.evaluate(&snapshot, log, config, now);

    // A restart in the meantime can only have moved the cursor forward
    state.update(|state| state.tempo_cursor = state.tempo_cursor.max(outcome.tempo_cursor));

    if let Some(multiple) = outcome.aborted_at {
        tracing::warn!(
            "[TempoEvaluator] Interval of {} tatums exceeds two bars, scan aborted",
            multiple
        );
        telemetry.record_scan_aborted(multiple);
    }
    let (correction, winner) = (outcome.correction?, outcome.winner?);
    tracing::debug!(
        "[TempoEvaluator] v {} error {:.0} us correction {} us",
        winner.v,
        winner.error,
        correction
    );
    telemetry.record_tempo(correction, winner.accuracy);
    Some(correction)
}

fn send_correction(clock: &ClockSender, command: ClockCommand) {
    if let Err(err) = clock.send(command) {
        log_clock_error(&err, "EvaluatorWorker::send_correction");
    }
}

async fn run_sync(
    mut listener: WakeListener,
    tempo_wake: EvaluatorWake,
    links: EvaluatorLinks,
    initial_tau: Micros,
) {
    let mut controller = SyncController::new(initial_tau, &links.tunables.sync())
        .with_decay_rule(links.decay_rule);

    while let Some(signals) = listener.wait().await {
        for signal in signals {
            match signal {
                EvaluatorSignal::Reset { tau } => {
                    controller.reset(tau, &links.tunables.sync());
                    tracing::debug!(
                        "[SyncEvaluator] Reset: sigma {} theta {}",
                        controller.sigma(),
                        controller.theta()
                    );
                }
                EvaluatorSignal::Evaluate => {
                    let correction = sync_pass(
                        &mut controller,
                        &links.state,
                        &links.log,
                        &links.tunables.sync(),
                        &links.telemetry,
                    );
                    if let Some(correction) = correction {
                        send_correction(&links.clock, ClockCommand::SetSyncCorrection(correction));
                    }
                    tempo_wake.evaluate();
                }
            }
        }
    }
}

async fn run_tempo(mut listener: WakeListener, links: EvaluatorLinks, initial_tau: Micros) {
    let mut controller = TempoController::new(initial_tau, &links.tunables.tempo());

    while let Some(signals) = listener.wait().await {
        for signal in signals {
            match signal {
                EvaluatorSignal::Reset { tau } => {
                    controller.reset(tau, &links.tunables.tempo());
                }
                EvaluatorSignal::Evaluate => {
                    let correction = tempo_pass(
                        &mut controller,
                        &links.state,
                        &links.log,
                        &links.tunables.tempo(),
                        &links.telemetry,
                        links.time.now_us(),
                    );
                    if let Some(correction) = correction {
                        send_correction(&links.clock, ClockCommand::SetTempoCorrection(correction));
                    }
                }
            }
        }
    }
}

/// Spawn the evaluator thread. `sync` is the wake pair shared with the detector.
pub fn spawn_evaluator_thread(
    sync: (EvaluatorWake, WakeListener),
    links: EvaluatorLinks,
) -> Result<EvaluatorHandle, ClockError> {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .build()
        .map_err(|err| ClockError::RuntimeUnavailable {
            reason: err.to_string(),
        })?;

    let (sync_wake, sync_listener) = sync;
    let (tempo_wake, tempo_listener) = EvaluatorWake::channel();
    let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
    let initial_tau = links.state.snapshot().tau;
    let task_tempo_wake = tempo_wake.clone();

    let join = thread::spawn(move || {
        tracing::info!("[EvaluatorWorker] Thread started");
        runtime.block_on(async move {
            let sync_task = run_sync(sync_listener, task_tempo_wake, links.clone(), initial_tau);
            let tempo_task = run_tempo(tempo_listener, links, initial_tau);
            tokio::select! {
                _ = sync_task => {}
                _ = tempo_task => {}
                _ = shutdown_rx => {}
            }
        });
        tracing::info!("[EvaluatorWorker] Thread exiting");
    });

    Ok(EvaluatorHandle {
        sync_wake,
        tempo_wake,
        shutdown_tx: Some(shutdown_tx),
        join: Some(join),
    })
}
