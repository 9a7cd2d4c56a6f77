//! Cooperative cancellation for scan sessions
//!
//! A token is checked between chunks; a chunk already handed to a worker
//! runs to completion and is journaled normally. Child tokens are cancelled
//! with their parent but can also be cancelled on their own, which is how a
//! fatal error in one worker lane stops its siblings without marking the
//! whole session as cancelled by the user.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::Notify;

struct TokenState {
    flag: AtomicBool,
    wake: Notify,
    children: Mutex<Vec<Weak<TokenState>>>,
}

impl TokenState {
    fn new(cancelled: bool) -> Arc<Self> {
        Arc::new(Self {
            flag: AtomicBool::new(cancelled),
            wake: Notify::new(),
            children: Mutex::new(Vec::new()),
        })
    }

    fn trip(&self) {
        if self.flag.swap(true, Ordering::AcqRel) {
            return;
        }
        self.wake.notify_waiters();

        let children: Vec<Arc<TokenState>> = {
            let mut children = self.children.lock();
            children.retain(|c| c.strong_count() > 0);
            children.iter().filter_map(Weak::upgrade).collect()
        };
        for child in children {
            child.trip();
        }
    }
}

/// Shared cancellation token
#[derive(Clone)]
pub struct CancelToken {
    state: Arc<TokenState>,
}

impl std::fmt::Debug for CancelToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CancelToken")
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

impl CancelToken {
    /// Token that is not cancelled
    pub fn new() -> Self {
        Self {
            state: TokenState::new(false),
        }
    }

    /// Token cancelled together with this one
    ///
    /// A child of an already cancelled token starts cancelled.
    pub fn child(&self) -> Self {
        let child = TokenState::new(self.is_cancelled());
        self.state.children.lock().push(Arc::downgrade(&child));
        // Close the race with a concurrent cancel between the check and the push
        if self.is_cancelled() {
            child.trip();
        }
        Self { state: child }
    }

    /// Check if cancellation was requested
    pub fn is_cancelled(&self) -> bool {
        self.state.flag.load(Ordering::Acquire)
    }

    /// Request cancellation of this token and its children
    pub fn cancel(&self) {
        self.state.trip();
    }

    /// Clear this token for another session
    ///
    /// Children already cancelled stay cancelled.
    pub fn reset(&self) {
        self.state.flag.store(false, Ordering::Release);
    }

    /// Wait until cancellation is requested
    pub async fn cancelled(&self) {
        loop {
            let notified = self.state.wake.notified();
            if self.is_cancelled() {
                return;
            }
            notified.await;
        }
    }
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_cancel_wakes_waiter() {
        let token = CancelToken::new();
        let waiter = token.clone();

        let task = tokio::spawn(async move { waiter.cancelled().await });
        tokio::time::sleep(Duration::from_millis(10)).await;
        token.cancel();

        tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .unwrap()
            .unwrap();
        assert!(token.is_cancelled());

        token.reset();
        assert!(!token.is_cancelled());
    }

    #[tokio::test]
    async fn test_parent_cancels_children() {
        let session = CancelToken::new();
        let lane = session.child();
        let waiter = lane.clone();
        let task = tokio::spawn(async move { waiter.cancelled().await });

        session.cancel();
        tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .unwrap()
            .unwrap();
        assert!(lane.is_cancelled());
    }

    #[test]
    fn test_child_cancel_leaves_parent() {
        let session = CancelToken::new();
        let lane = session.child();
        lane.cancel();
        assert!(lane.is_cancelled());
        assert!(!session.is_cancelled());
    }

    #[test]
    fn test_child_of_cancelled_token_starts_cancelled() {
        let session = CancelToken::new();
        session.cancel();
        assert!(session.child().is_cancelled());
    }
}
