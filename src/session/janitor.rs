//! Session expiry.
//!
//! Two independent triggers end a session: a per-session idle timer started
//! at creation, and a periodic sweep that enforces the maximum age (and
//! catches any idle session whose timer was lost). Explicit close and
//! shutdown use the same [`Janitor::cleanup`] routine.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use vidrelay_common::SessionId;

use super::registry::SessionRegistry;
use super::storage::StorageLayout;

/// What triggered a cleanup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CleanupReason {
    Idle,
    MaxAge,
    Closed,
    Shutdown,
}

impl fmt::Display for CleanupReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            CleanupReason::Idle => "idle",
            CleanupReason::MaxAge => "max_age",
            CleanupReason::Closed => "closed",
            CleanupReason::Shutdown => "shutdown",
        })
    }
}

#[derive(Debug, Clone)]
pub struct Janitor {
    registry: Arc<SessionRegistry>,
    storage: StorageLayout,
    idle_timeout: Duration,
    max_age: Duration,
}

impl Janitor {
    pub fn new(
        registry: Arc<SessionRegistry>,
        storage: StorageLayout,
        idle_timeout: Duration,
        max_age: Duration,
    ) -> Self {
        Self {
            registry,
            storage,
            idle_timeout,
            max_age,
        }
    }

    /// Tear a session down: mark it closed, delete its storage, release its
    /// gate slot and drop the registry entry.
    ///
    /// Returns false if the session was unknown or another caller already
    /// cleaned it up.
    pub async fn cleanup(&self, id: &SessionId, reason: CleanupReason) -> bool {
        let Some(ticket) = self.registry.claim_cleanup(id) else {
            return false;
        };

        if let Err(e) = self.storage.remove(id).await {
            tracing::warn!(session_id = %id, error = %e, "Failed to remove session storage");
        }
        drop(ticket.slot);
        self.registry.remove(id);

        tracing::info!(
            session_id = %id,
            reason = %reason,
            previous = %ticket.previous,
            age_secs = ticket.age.as_secs(),
            "Session cleaned up"
        );
        true
    }

    /// Start the idle timer for `id`.
    ///
    /// On every wake the timer re-reads the session's deadline: a touch in
    /// the meantime pushes it out and the timer sleeps again for the
    /// remainder. The task ends once the session is cleaned up by any path.
    pub fn schedule_idle(&self, id: SessionId, cancel: CancellationToken) -> JoinHandle<()> {
        let janitor = self.clone();
        tokio::spawn(async move {
            loop {
                let Some(deadline) = janitor.registry.idle_deadline(&id, janitor.idle_timeout)
                else {
                    return;
                };
                if Instant::now() >= deadline {
                    janitor.cleanup(&id, CleanupReason::Idle).await;
                    return;
                }
                tokio::select! {
                    _ = tokio::time::sleep_until(deadline) => {}
                    _ = cancel.cancelled() => return,
                }
            }
        })
    }

    /// Clean up every session past its maximum age or idle deadline.
    pub async fn sweep(&self) -> usize {
        let mut cleaned = 0;
        for (id, reason) in self.registry.expired(self.idle_timeout, self.max_age) {
            if self.cleanup(&id, reason).await {
                cleaned += 1;
            }
        }
        if cleaned > 0 {
            tracing::debug!(cleaned, "Sweep expired sessions");
        }
        cleaned
    }

    /// Run [`Janitor::sweep`] every `interval` until `shutdown` fires.
    pub fn start_sweep_task(
        self,
        interval: Duration,
        shutdown: CancellationToken,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            // The first tick completes immediately.
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        self.sweep().await;
                    }
                    _ = shutdown.cancelled() => {
                        tracing::debug!("Sweep task stopped");
                        return;
                    }
                }
            }
        })
    }
}
