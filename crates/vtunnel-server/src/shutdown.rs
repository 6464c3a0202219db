//! The server-wide running flag.
//!
//! Written once when the server stops and read by every session. The accept
//! loop is woken immediately; relays only look at the flag when their poll
//! interval elapses, so in-flight reads and writes are never interrupted.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;

#[derive(Debug, Default)]
struct Inner {
    stopped: AtomicBool,
    notify: Notify,
}

/// Cloneable handle to the shared shutdown state.
#[derive(Debug, Clone, Default)]
pub struct ShutdownFlag {
    inner: Arc<Inner>,
}

impl ShutdownFlag {
    pub fn new() -> Self {
        Self::default()
    }

    /// Flip the flag and wake everything blocked in [`ShutdownFlag::wait`].
    /// Calling it again is a no-op.
    pub fn trigger(&self) {
        if !self.inner.stopped.swap(true, Ordering::AcqRel) {
            self.inner.notify.notify_waiters();
        }
    }

    pub fn is_shutdown(&self) -> bool {
        self.inner.stopped.load(Ordering::Acquire)
    }

    /// Resolve once [`ShutdownFlag::trigger`] has been called.
    pub async fn wait(&self) {
        let notified = self.inner.notify.notified();
        if self.is_shutdown() {
            return;
        }
        notified.await;
    }
}
