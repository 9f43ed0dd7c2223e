//! Single-slot wake signals for the evaluators.
//!
//! Each evaluator owns one `watch` channel. Wakes do not queue: any number of
//! `evaluate()` calls before the evaluator looks again collapse into a single
//! pass. A reset is latched separately so a later evaluation wake can never
//! swallow it.

use std::sync::Arc;

use tokio::sync::watch;

use crate::state::Micros;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct WakeState {
    evaluations: u64,
    resets: u64,
    reset_tau: Micros,
}

/// Work an evaluator has to do after waking, resets first.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvaluatorSignal {
    Reset { tau: Micros },
    Evaluate,
}

/// Sending side of an evaluator's wake slot
#[derive(Debug, Clone)]
pub struct EvaluatorWake {
    tx: Arc<watch::Sender<WakeState>>,
}

impl EvaluatorWake {
    pub fn channel() -> (EvaluatorWake, WakeListener) {
        let (tx, rx) = watch::channel(WakeState::default());
        (
            EvaluatorWake { tx: Arc::new(tx) },
            WakeListener {
                rx,
                seen: WakeState::default(),
            },
        )
    }

    /// Request an evaluation pass (latest wins)
    pub fn evaluate(&self) {
        self.tx.send_modify(|state| state.evaluations += 1);
    }

    /// Request a reset of the adaptive parameters for `tau`
    pub fn reset(&self, tau: Micros) {
        self.tx.send_modify(|state| {
            state.resets += 1;
            state.reset_tau = tau;
        });
    }
}

/// Receiving side of an evaluator's wake slot
#[derive(Debug)]
pub struct WakeListener {
    rx: watch::Receiver<WakeState>,
    seen: WakeState,
}

impl WakeListener {
    /// Wait for the next wake. `None` once every sender is gone.
    pub async fn wait(&mut self) -> Option<Vec<EvaluatorSignal>> {
        loop {
            if self.rx.changed().await.is_err() {
                return None;
            }
            let signals = self.take();
            if !signals.is_empty() {
                return Some(signals);
            }
        }
    }

    /// Everything signalled since the last call, without waiting.
    pub fn take(&mut self) -> Vec<EvaluatorSignal> {
        let current = *self.rx.borrow_and_update();
        let mut signals = Vec::with_capacity(2);
        if current.resets != self.seen.resets {
            signals.push(EvaluatorSignal::Reset {
                tau: current.reset_tau,
            });
        }
        if current.evaluations != self.seen.evaluations {
            signals.push(EvaluatorSignal::Evaluate);
        }
        self.seen = current;
        signals
    }
}
