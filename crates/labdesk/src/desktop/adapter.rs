//! Fail-closed wrapper over the container runtime client.
//!
//! The raw [`ContainerRuntimeApi`] reports every hiccup as an error. The
//! lifecycle manager wants something calmer: only provisioning failures are
//! errors, liveness is a plain bool that resolves any doubt to "not running",
//! and cleanup never raises.

use std::sync::Arc;

use log::{debug, warn};

use crate::container::{Container, ContainerConfig, ContainerRuntimeApi};

use super::error::{DesktopError, DesktopResult};

/// Label carrying the owning user id.
pub const USER_LABEL: &str = "labdesk.user_id";
/// Label marking containers this service owns.
pub const MANAGED_LABEL: &str = "labdesk.managed";

/// Grace period handed to `stop -t`.
const STOP_TIMEOUT_SECS: u32 = 10;

#[derive(Clone)]
pub struct RuntimeAdapter {
    runtime: Arc<dyn ContainerRuntimeApi>,
    log_tail_lines: u32,
}

impl RuntimeAdapter {
    pub fn new(runtime: Arc<dyn ContainerRuntimeApi>, log_tail_lines: u32) -> Self {
        Self {
            runtime,
            log_tail_lines,
        }
    }

    /// Start a detached desktop container and return its ID.
    pub async fn create(&self, config: &ContainerConfig) -> DesktopResult<String> {
        let container_id = self
            .runtime
            .create_container(config)
            .await
            .map_err(|e| DesktopError::Provision(e.to_string()))?;

        if container_id.is_empty() {
            return Err(DesktopError::Provision(
                "runtime returned an empty container id".to_string(),
            ));
        }

        Ok(container_id)
    }

    /// Whether the container exists and is running. Any doubt means `false`.
    pub async fn is_running(&self, container_id: &str) -> bool {
        match self.runtime.container_state_status(container_id).await {
            Ok(Some(status)) => status.trim().eq_ignore_ascii_case("running"),
            Ok(None) => false,
            Err(e) => {
                debug!("Liveness check for {} failed: {}", container_id, e);
                false
            }
        }
    }

    /// Recent log tail, or an empty string if it can't be fetched.
    pub async fn fetch_recent_logs(&self, container_id: &str) -> String {
        match self
            .runtime
            .get_logs(container_id, Some(self.log_tail_lines))
            .await
        {
            Ok(logs) => logs,
            Err(e) => {
                debug!("Fetching logs for {} failed: {}", container_id, e);
                String::new()
            }
        }
    }

    /// Stop a container. Returns `false` on failure.
    pub async fn stop(&self, container_id: &str) -> bool {
        match self
            .runtime
            .stop_container(container_id, Some(STOP_TIMEOUT_SECS))
            .await
        {
            Ok(()) => true,
            Err(e) => {
                warn!("Failed to stop container {}: {}", container_id, e);
                false
            }
        }
    }

    /// Force-remove a container. Returns `false` on failure.
    pub async fn remove(&self, container_id: &str) -> bool {
        match self.runtime.remove_container(container_id, true).await {
            Ok(()) => true,
            Err(e) => {
                warn!("Failed to remove container {}: {}", container_id, e);
                false
            }
        }
    }

    /// All containers carrying the managed label, running or not.
    pub async fn list_managed(&self) -> Vec<Container> {
        let filter = format!("label={}=true", MANAGED_LABEL);
        match self.runtime.list_containers(true, Some(&filter)).await {
            Ok(containers) => containers,
            Err(e) => {
                warn!("Failed to list managed containers: {}", e);
                Vec::new()
            }
        }
    }
}
