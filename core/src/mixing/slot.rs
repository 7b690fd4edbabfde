// Result Slot — single-assignment handoff between a dispatch task and the
// caller waiting on it
//
//   Pending ──fulfill──→ Fulfilled
//      │
//      ├──── wait deadline ──→ TimedOut
//      └──── shutdown ───────→ Cancelled
//
// Exactly one terminal transition happens, decided under the slot lock. A
// fulfillment that loses the race against a timeout or cancellation is
// rejected and reported back to the fulfiller.

use crate::{Verification, VerifyError};
use parking_lot::Mutex;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Notify;

/// What a waiter eventually receives
pub type SlotOutcome = Result<Verification, VerifyError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotState {
    Pending,
    Fulfilled,
    TimedOut,
    Cancelled,
}

impl SlotState {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, SlotState::Pending)
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SlotError {
    /// A second fulfillment: always a bug in the caller
    #[error("Result slot already fulfilled")]
    AlreadyFulfilled,
    /// The waiter gave up or the engine shut down first
    #[error("Result slot already closed ({0:?})")]
    Closed(SlotState),
}

struct SlotInner {
    state: SlotState,
    outcome: Option<SlotOutcome>,
}

pub struct ResultSlot {
    inner: Mutex<SlotInner>,
    notify: Notify,
}

impl ResultSlot {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(SlotInner {
                state: SlotState::Pending,
                outcome: None,
            }),
            notify: Notify::new(),
        }
    }

    pub fn state(&self) -> SlotState {
        self.inner.lock().state
    }

    /// Deliver an outcome. Succeeds only from `Pending`.
    pub fn fulfill(&self, outcome: SlotOutcome) -> Result<(), SlotError> {
        {
            let mut inner = self.inner.lock();
            match inner.state {
                SlotState::Pending => {
                    inner.state = SlotState::Fulfilled;
                    inner.outcome = Some(outcome);
                }
                SlotState::Fulfilled => return Err(SlotError::AlreadyFulfilled),
                closed => return Err(SlotError::Closed(closed)),
            }
        }
        self.notify.notify_one();
        Ok(())
    }

    /// Move a pending slot to `Cancelled`. Returns false if it was already terminal.
    pub fn cancel(&self) -> bool {
        {
            let mut inner = self.inner.lock();
            if inner.state != SlotState::Pending {
                return false;
            }
            inner.state = SlotState::Cancelled;
        }
        self.notify.notify_one();
        true
    }

    /// Wait for a terminal state for at most `timeout`.
    ///
    /// If the deadline passes while still pending the slot becomes `TimedOut`
    /// and any later `fulfill` is rejected. A fulfillment that lands before
    /// the timeout transition is still delivered.
    pub async fn wait(&self, timeout: Duration) -> SlotOutcome {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if let Some(outcome) = self.terminal_outcome() {
                return outcome;
            }
            if tokio::time::timeout_at(deadline, self.notify.notified())
                .await
                .is_err()
            {
                return self.expire();
            }
        }
    }

    fn terminal_outcome(&self) -> Option<SlotOutcome> {
        let inner = self.inner.lock();
        Self::outcome_for(&inner)
    }

    fn expire(&self) -> SlotOutcome {
        let mut inner = self.inner.lock();
        if inner.state == SlotState::Pending {
            inner.state = SlotState::TimedOut;
        }
        Self::outcome_for(&inner).unwrap_or(Err(VerifyError::RequestTimeout))
    }

    fn outcome_for(inner: &SlotInner) -> Option<SlotOutcome> {
        match inner.state {
            SlotState::Pending => None,
            SlotState::Fulfilled => Some(
                inner
                    .outcome
                    .clone()
                    .unwrap_or(Err(VerifyError::Cancelled)),
            ),
            SlotState::TimedOut => Some(Err(VerifyError::RequestTimeout)),
            SlotState::Cancelled => Some(Err(VerifyError::Cancelled)),
        }
    }
}

impl Default for ResultSlot {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for ResultSlot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResultSlot")
            .field("state", &self.state())
            .finish()
    }
}
