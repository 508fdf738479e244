//! Completion tokens
//!
//! A job's completion callback is a typed token with a validity flag:
//! the caller may go away while the job runs, and a canceled token must
//! swallow the answer instead of delivering it to nobody. Dispatch
//! consumes the token, so a job cannot answer twice.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::oneshot;
use tracing::trace;

/// Sender half of a completion: held by the job, dispatched exactly
/// once.
#[derive(Debug)]
pub struct Completion<T> {
    tx: oneshot::Sender<T>,
    canceled: Arc<AtomicBool>,
}

/// Caller-side handle used to withdraw interest in the answer.
#[derive(Debug, Clone)]
pub struct CompletionHandle {
    canceled: Arc<AtomicBool>,
}

/// Create a completion token, its cancellation handle, and the receiver
/// the answer arrives on.
#[must_use]
pub fn completion_channel<T>() -> (Completion<T>, CompletionHandle, oneshot::Receiver<T>) {
    let (tx, rx) = oneshot::channel();
    let canceled = Arc::new(AtomicBool::new(false));
    (
        Completion {
            tx,
            canceled: canceled.clone(),
        },
        CompletionHandle { canceled },
        rx,
    )
}

impl CompletionHandle {
    /// Withdraw interest: a later dispatch drops the answer.
    pub fn cancel(&self) {
        self.canceled.store(true, Ordering::Release);
    }

    /// Whether the answer was withdrawn.
    #[must_use]
    pub fn is_canceled(&self) -> bool {
        self.canceled.load(Ordering::Acquire)
    }
}

impl<T> Completion<T> {
    /// Whether the caller withdrew interest in the answer.
    #[must_use]
    pub fn canceled(&self) -> bool {
        self.canceled.load(Ordering::Acquire)
    }

    /// Deliver the answer, unless the token was canceled or the
    /// receiver is gone. Returns whether the answer was delivered.
    pub fn dispatch(self, answer: T) -> bool {
        if self.canceled() {
            trace!("completion canceled; dropping answer");
            return false;
        }
        self.tx.send(answer).is_ok()
    }
}
