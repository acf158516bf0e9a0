//! Readiness polling.
//!
//! A desktop container is "ready" once its startup banner shows up in the
//! logs. Images differ in how long that takes and some never print it, so the
//! poll is bounded and falls back to assuming the desktop is up.

use std::time::Duration;

use async_trait::async_trait;
use log::{debug, warn};
use tokio::time::Instant;

use super::adapter::RuntimeAdapter;
use super::models::ReadyState;

#[async_trait]
pub trait ReadinessProbe: Send + Sync {
    async fn wait_until_ready(
        &self,
        container_id: &str,
        marker: &str,
        timeout: Duration,
        interval: Duration,
    ) -> ReadyState;
}

/// Polls the container log tail for a marker substring.
pub struct LogMarkerReadiness {
    adapter: RuntimeAdapter,
}

impl LogMarkerReadiness {
    pub fn new(adapter: RuntimeAdapter) -> Self {
        Self { adapter }
    }
}

#[async_trait]
impl ReadinessProbe for LogMarkerReadiness {
    async fn wait_until_ready(
        &self,
        container_id: &str,
        marker: &str,
        timeout: Duration,
        interval: Duration,
    ) -> ReadyState {
        let deadline = Instant::now() + timeout;
        let mut attempts: u32 = 0;

        loop {
            attempts += 1;

            let logs = self.adapter.fetch_recent_logs(container_id).await;
            if logs.contains(marker) {
                debug!(
                    "Container {} ready after {} log probes",
                    container_id, attempts
                );
                return ReadyState::Ready;
            }

            let now = Instant::now();
            if now >= deadline {
                warn!(
                    "Container {} did not log {:?} within {:?} ({} probes); assuming ready",
                    container_id, marker, timeout, attempts
                );
                return ReadyState::AssumedReady;
            }

            tokio::time::sleep(interval.min(deadline - now)).await;
        }
    }
}
