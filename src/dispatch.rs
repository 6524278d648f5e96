//! Fan-out of one delivery unit per recipient.
//!
//! Units are futures polled together on the caller's task. Each unit paces,
//! takes a send slot, and walks a small state machine:
//!
//! ```text
//! FirstAttempt -> Done(Delivered | Forbidden | Failed)
//!              -> Backoff -> SecondAttempt -> Done(DeliveredAfterRetry | Failed)
//! ```
//!
//! The slot is held through the backoff and the second attempt.
use futures::stream::{FuturesUnordered, StreamExt};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::delivery::{Messenger, SendError};
use crate::model::{Outcome, OutcomeKind, Payload, RecipientId};
use crate::rate::{RateConfig, RateController};

/// Added on top of the server-provided retry-after.
pub const RETRY_MARGIN: Duration = Duration::from_secs(1);

pub const INTERRUPTED: &str = "interrupted before send";

enum Step {
    FirstAttempt,
    Backoff { wait: Duration, first_error: String },
    SecondAttempt,
    Done(OutcomeKind),
}

pub struct Dispatcher {
    messenger: Arc<dyn Messenger>,
    rate: RateController,
    stop: Option<watch::Receiver<bool>>,
    stopping: AtomicBool,
}

impl Dispatcher {
    pub fn new(messenger: Arc<dyn Messenger>, rate: RateConfig) -> Self {
        Self {
            messenger,
            rate: RateController::new(rate),
            stop: None,
            stopping: AtomicBool::new(false),
        }
    }

    /// Once the receiver reads `true`, no new sends start. Sends already on
    /// the wire finish; everything else is recorded as interrupted.
    pub fn with_stop_signal(mut self, stop: watch::Receiver<bool>) -> Self {
        self.stop = Some(stop);
        self
    }

    /// Deliver `payload` to every recipient. Returns exactly one outcome per
    /// recipient, in completion order.
    pub async fn run(&self, recipients: &[RecipientId], payload: &Payload) -> Vec<Outcome> {
        let mut stop = self.stop.clone();
        if stop.as_ref().is_some_and(|rx| *rx.borrow()) {
            self.begin_stopping();
        }

        let total = recipients.len();
        let mut pending: FuturesUnordered<_> = recipients
            .iter()
            .map(|recipient| self.deliver_one(*recipient, payload))
            .collect();
        let mut outcomes = Vec::with_capacity(total);

        loop {
            tokio::select! {
                biased;
                _ = stop_requested(&mut stop), if !self.is_stopping() => {
                    warn!(done = outcomes.len(), total, "stop requested; letting in-flight sends finish");
                    self.begin_stopping();
                }
                next = pending.next() => match next {
                    Some(outcome) => {
                        log_outcome(&outcome);
                        outcomes.push(outcome);
                        if outcomes.len() % 100 == 0 {
                            info!(done = outcomes.len(), total, "dispatch progress");
                        }
                    }
                    None => break,
                },
            }
        }
        outcomes
    }

    fn begin_stopping(&self) {
        self.stopping.store(true, Ordering::SeqCst);
        self.rate.close();
    }

    fn is_stopping(&self) -> bool {
        self.stopping.load(Ordering::SeqCst)
    }

    async fn deliver_one(&self, recipient: RecipientId, payload: &Payload) -> Outcome {
        self.rate.pace().await;
        let Ok(_slot) = self.rate.acquire().await else {
            return interrupted(recipient);
        };
        if self.is_stopping() {
            return interrupted(recipient);
        }

        let mut step = Step::FirstAttempt;
        loop {
            step = match step {
                Step::FirstAttempt => match self.messenger.send(recipient, payload).await {
                    Ok(()) => Step::Done(OutcomeKind::Delivered),
                    Err(SendError::RateLimited(wait)) => Step::Backoff {
                        first_error: SendError::RateLimited(wait).to_string(),
                        wait,
                    },
                    Err(SendError::Unreachable(reason)) => Step::Done(OutcomeKind::Forbidden { reason }),
                    Err(err) => Step::Done(OutcomeKind::Failed {
                        error: err.to_string(),
                    }),
                },
                Step::Backoff { wait, first_error } => {
                    debug!(%recipient, wait_secs = wait.as_secs(), "rate limited; backing off");
                    tokio::time::sleep(wait + RETRY_MARGIN).await;
                    if self.is_stopping() {
                        Step::Done(OutcomeKind::Failed { error: first_error })
                    } else {
                        Step::SecondAttempt
                    }
                }
                Step::SecondAttempt => match self.messenger.send(recipient, payload).await {
                    Ok(()) => Step::Done(OutcomeKind::DeliveredAfterRetry),
                    Err(err) => Step::Done(OutcomeKind::Failed {
                        error: err.to_string(),
                    }),
                },
                Step::Done(kind) => return Outcome { recipient, kind },
            };
        }
    }
}

fn interrupted(recipient: RecipientId) -> Outcome {
    Outcome {
        recipient,
        kind: OutcomeKind::Failed {
            error: INTERRUPTED.to_string(),
        },
    }
}

/// Resolves once the stop signal reads `true`. Never resolves without a
/// signal or after its sender is gone.
async fn stop_requested(stop: &mut Option<watch::Receiver<bool>>) {
    let Some(rx) = stop else {
        return std::future::pending().await;
    };
    loop {
        if *rx.borrow_and_update() {
            return;
        }
        if rx.changed().await.is_err() {
            return std::future::pending().await;
        }
    }
}

fn log_outcome(outcome: &Outcome) {
    let recipient = outcome.recipient;
    match &outcome.kind {
        OutcomeKind::Delivered => debug!(%recipient, "delivered"),
        OutcomeKind::DeliveredAfterRetry => info!(%recipient, "delivered after retry"),
        OutcomeKind::Forbidden { reason } => {
            warn!(%recipient, %reason, "forbidden (blocked or never started the bot)")
        }
        OutcomeKind::Failed { error } => warn!(%recipient, %error, "delivery failed"),
    }
}
