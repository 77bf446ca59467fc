use tokio::sync::oneshot;

use crate::{AccessToken, AccessTokenRef, RefreshError};

/// The outcome delivered to a parked request when the governing refresh
/// settles
pub(crate) type Settlement = Result<AccessToken, RefreshError>;

/// Ordered waiters for the outcome of the in-flight refresh
///
/// Requests that find a refresh already running park here. The queue owns
/// the sending half of each waiter until the refresh settles; exactly one of
/// [`release_all`][Self::release_all] or [`fail_all`][Self::fail_all] runs
/// per refresh cycle, leaving the queue empty. All mutation happens under
/// the session state lock, so a drain never races an enqueue.
#[derive(Debug, Default)]
pub(crate) struct PendingQueue {
    waiters: Vec<oneshot::Sender<Settlement>>,
}

impl PendingQueue {
    /// Parks one request, returning the handle it should await
    pub(crate) fn enqueue(&mut self) -> oneshot::Receiver<Settlement> {
        let (tx, rx) = oneshot::channel();
        self.waiters.push(tx);
        rx
    }

    /// Number of requests currently parked
    pub(crate) fn len(&self) -> usize {
        self.waiters.len()
    }

    /// Fulfills every waiter, oldest first, with the same token
    pub(crate) fn release_all(&mut self, token: &AccessTokenRef) {
        for waiter in self.waiters.drain(..) {
            // a waiter whose request has been dropped is skipped
            let _ = waiter.send(Ok(token.to_owned()));
        }
    }

    /// Fails every waiter, oldest first, with the same classified error
    pub(crate) fn fail_all(&mut self, error: &RefreshError) {
        for waiter in self.waiters.drain(..) {
            let _ = waiter.send(Err(error.clone()));
        }
    }
}
