//! One-shot, auto-resetting lifecycle notifications.
//!
//! Every hook always has exactly one "current" occurrence. `wait` attaches to
//! the current occurrence at call time; `fire` resolves it for every attached
//! waiter and installs a fresh one, so a later `wait` blocks for the next
//! occurrence and never observes a past value.

use std::future::Future;
use std::sync::{Mutex, MutexGuard};

use tokio::sync::watch;
use tracing::debug;

use super::publisher::SendReport;

pub struct EventHook<T> {
    name: &'static str,
    current: Mutex<watch::Sender<Option<T>>>,
}

impl<T> EventHook<T>
where
    T: Clone + Send + Sync + 'static,
{
    pub fn new(name: &'static str) -> Self {
        let (current, _) = watch::channel(None);
        Self {
            name,
            current: Mutex::new(current),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Waits for the next firing. The subscription is taken when this is
    /// called, not when the future is first polled. Resolves to `None` only
    /// if the hook is dropped before it fires.
    pub fn wait(&self) -> impl Future<Output = Option<T>> + Send + 'static {
        let mut receiver = self.lock().subscribe();
        async move {
            match receiver.wait_for(Option::is_some).await {
                Ok(value) => (*value).clone(),
                Err(_) => None,
            }
        }
    }

    /// Resolves all current waiters with `value` and returns how many there
    /// were. Firing with nobody waiting is fine; the value is discarded.
    pub fn fire(&self, value: T) -> usize {
        let (next, _) = watch::channel(None);
        let fired = std::mem::replace(&mut *self.lock(), next);

        let waiters = fired.receiver_count();
        debug!(hook = self.name, waiters, "Firing event hook");
        fired.send_replace(Some(value));
        waiters
    }

    fn lock(&self) -> MutexGuard<'_, watch::Sender<Option<T>>> {
        // Nothing panics while the lock is held, so a poisoned guard is still consistent.
        self.current.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Outcome reported through the `authenticated` hook.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthOutcome {
    Accepted { user: String },
    Rejected { user: String, reason: String },
}

impl AuthOutcome {
    pub fn is_accepted(&self) -> bool {
        matches!(self, AuthOutcome::Accepted { .. })
    }
}

/// Value of the `connection-made` hook.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionReady {
    pub generation: u64,
    pub channel_number: u16,
}

/// The named hooks owned by a connection manager.
pub struct SessionHooks {
    pub authenticated: EventHook<AuthOutcome>,
    pub connection_made: EventHook<SessionReady>,
    pub connection_lost: EventHook<String>,
    pub connection_failed: EventHook<String>,
    pub initial_send: EventHook<SendReport>,
}

impl SessionHooks {
    pub fn new() -> Self {
        Self {
            authenticated: EventHook::new("authenticated"),
            connection_made: EventHook::new("connection-made"),
            connection_lost: EventHook::new("connection-lost"),
            connection_failed: EventHook::new("connection-failed"),
            initial_send: EventHook::new("initial-send"),
        }
    }
}

impl Default for SessionHooks {
    fn default() -> Self {
        Self::new()
    }
}
