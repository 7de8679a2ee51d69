//! Per-channel mutual exclusion.
//!
//! Each [`Channel`] admits one operation at a time. Acquiring a slot never waits: a
//! request that finds the slot occupied is refused on the spot. The [`InFlightToken`]
//! handed out on success is the only way to release the slot, and it releases it exactly
//! once, either through [`InFlightToken::complete`] or when dropped.
//!
//! Lock order is slot first, then application state. Start and finish updates are
//! published while the slot lock is held, so observers never see a channel go idle
//! without its outcome.

use super::state::StateUpdate;
use super::Publisher;
use crate::error::{Failure, Outcome};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Independent lanes of work. Operations on different channels may overlap.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Channel {
    Chat,
    Knowledge,
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Channel::Chat => f.write_str("chat"),
            Channel::Knowledge => f.write_str("knowledge"),
        }
    }
}

/// Identifies one accepted operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct OperationId(pub u64);

impl fmt::Display for OperationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug)]
struct Running {
    op: OperationId,
    cancel: CancellationToken,
}

#[derive(Debug)]
pub(crate) struct ChannelSlot {
    channel: Channel,
    running: Mutex<Option<Running>>,
}

impl ChannelSlot {
    pub(crate) fn new(channel: Channel) -> Self {
        Self {
            channel,
            running: Mutex::new(None),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Option<Running>> {
        self.running.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Claims the slot for `op`, or returns `None` if another operation holds it.
    pub(crate) fn try_acquire(
        self: &Arc<Self>,
        op: OperationId,
        label: &str,
        publisher: &Publisher,
    ) -> Option<InFlightToken> {
        let mut running = self.lock();
        if let Some(current) = running.as_ref() {
            debug!(channel = %self.channel, current = %current.op, "Channel busy");
            return None;
        }

        let cancel = CancellationToken::new();
        *running = Some(Running {
            op,
            cancel: cancel.clone(),
        });
        publisher.publish(StateUpdate::OperationStarted {
            channel: self.channel,
            op,
            label: label.to_string(),
        });

        Some(InFlightToken {
            slot: Arc::clone(self),
            publisher: publisher.clone(),
            op,
            cancel,
            finished: false,
        })
    }

    /// Requests cancellation of the running operation. Returns whether one was running.
    pub(crate) fn cancel(&self) -> bool {
        match self.lock().as_ref() {
            Some(running) => {
                running.cancel.cancel();
                true
            }
            None => false,
        }
    }

    /// Runs `f` with the slot held idle, or returns `None` if an operation is running.
    pub(crate) fn while_idle<T>(&self, f: impl FnOnce() -> T) -> Option<T> {
        let running = self.lock();
        if running.is_some() {
            return None;
        }
        Some(f())
    }

    fn release(&self, op: OperationId, outcome: Outcome, publisher: &Publisher) {
        let mut running = self.lock();
        match running.as_ref() {
            Some(current) if current.op == op => {
                *running = None;
            }
            _ => {
                warn!(channel = %self.channel, %op, "Released a slot it did not hold");
                return;
            }
        }
        publisher.publish(StateUpdate::OperationFinished {
            channel: self.channel,
            op,
            outcome,
        });
    }
}

/// Proof that one operation owns a channel.
#[derive(Debug)]
pub(crate) struct InFlightToken {
    slot: Arc<ChannelSlot>,
    publisher: Publisher,
    op: OperationId,
    cancel: CancellationToken,
    finished: bool,
}

impl InFlightToken {
    pub(crate) fn op(&self) -> OperationId {
        self.op
    }

    pub(crate) fn channel(&self) -> Channel {
        self.slot.channel
    }

    pub(crate) fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub(crate) fn complete(mut self, outcome: Outcome) {
        self.finished = true;
        self.slot.release(self.op, outcome, &self.publisher);
    }
}

impl Drop for InFlightToken {
    fn drop(&mut self) {
        if !self.finished {
            warn!(channel = %self.slot.channel, op = %self.op, "Operation dropped without an outcome");
            self.slot.release(
                self.op,
                Outcome::Failed(Failure::internal("the operation stopped without a result")),
                &self.publisher,
            );
        }
    }
}
