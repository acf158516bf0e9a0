//! Age-based reclamation of desktop sessions.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use super::service::DesktopSessionService;

/// Evicts sessions older than `max_age` through the normal terminate path.
pub struct IdleReaper {
    service: Arc<DesktopSessionService>,
    max_age: chrono::Duration,
}

impl IdleReaper {
    pub fn new(service: Arc<DesktopSessionService>, max_age: Duration) -> Self {
        Self {
            service,
            max_age: chrono::Duration::from_std(max_age).unwrap_or(chrono::Duration::MAX),
        }
    }

    /// One sweep against the given clock. Returns the number of evicted sessions.
    pub async fn sweep_at(&self, now: DateTime<Utc>) -> usize {
        let mut evicted = 0;

        for session in self.service.list_sessions() {
            if session.age_at(now) <= self.max_age {
                continue;
            }

            // The snapshot may be stale by now; only the aged session goes.
            let outcome = self
                .service
                .terminate_if(session.user_id, &session.session_id)
                .await;
            if outcome.success {
                info!(
                    "Reaped session {} for user {} (created {})",
                    session.session_id, session.user_id, session.created_at
                );
                evicted += 1;
            } else {
                // Gone or replaced since the snapshot.
                debug!(
                    "Session {} for user {} already gone",
                    session.session_id, session.user_id
                );
            }
        }

        let pruned = self.service.prune_locks();
        if pruned > 0 {
            debug!("Pruned {} idle user locks", pruned);
        }

        evicted
    }

    pub async fn sweep(&self) -> usize {
        self.sweep_at(Utc::now()).await
    }

    /// Sweep every `interval` until the handle is aborted.
    pub fn spawn(self, interval: Duration) -> JoinHandle<()> {
        info!(
            "Starting desktop reaper (check every {:?}, max age {})",
            interval, self.max_age
        );

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

            loop {
                ticker.tick().await;

                let evicted = self.sweep().await;
                if evicted > 0 {
                    warn!("Reaper evicted {} expired desktop sessions", evicted);
                }
            }
        })
    }
}
