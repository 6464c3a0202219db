//! Destination port policy and session accounting.
//!
//! [`TunnelPolicy`] holds an optional allowlist of destination ports and an
//! optional cap on concurrent sessions. Every accepted connection takes a
//! [`SessionGuard`] that keeps it counted until the guard is dropped.

use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Runtime policy enforcer with atomic session tracking.
#[derive(Debug)]
pub struct TunnelPolicy {
    /// Empty = every port allowed.
    allowed_ports: HashSet<u16>,
    /// 0 = unlimited.
    max_sessions: usize,
    active: Arc<AtomicUsize>,
}

impl TunnelPolicy {
    pub fn new(allowed_ports: &[u16], max_sessions: usize) -> Self {
        Self {
            allowed_ports: allowed_ports.iter().copied().collect(),
            max_sessions,
            active: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Check whether `port` may be tunneled to.
    ///
    /// # Errors
    ///
    /// Returns the wire message for the `ERROR` response when the port is
    /// not on a non-empty allowlist.
    pub fn check_port(&self, port: u16) -> Result<(), String> {
        if self.allowed_ports.is_empty() || self.allowed_ports.contains(&port) {
            Ok(())
        } else {
            Err(format!("Port {port} is not allowed"))
        }
    }

    /// Count a new session, or refuse it when the cap is reached.
    pub fn try_acquire(&self) -> Result<SessionGuard, String> {
        let previous = self.active.fetch_add(1, Ordering::AcqRel);
        if self.max_sessions > 0 && previous >= self.max_sessions {
            self.active.fetch_sub(1, Ordering::AcqRel);
            return Err("Too many sessions".to_string());
        }
        Ok(SessionGuard {
            counter: self.active.clone(),
        })
    }

    /// Current number of sessions holding a guard.
    pub fn active_sessions(&self) -> usize {
        self.active.load(Ordering::Relaxed)
    }
}

/// RAII guard that decrements the session count on drop.
#[derive(Debug)]
pub struct SessionGuard {
    counter: Arc<AtomicUsize>,
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        self.counter.fetch_sub(1, Ordering::AcqRel);
    }
}
