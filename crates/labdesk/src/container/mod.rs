//! Container runtime management module.
//!
//! Provides an async interface to manage desktop containers via the Docker or
//! Podman CLI. The runtime is auto-detected or can be configured explicitly.

mod container;
mod error;

pub use container::{Container, ContainerConfig, ContainerState, PortMapping, parse_container_list};
pub use error::{ContainerError, ContainerResult};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::process::Stdio;
use tokio::process::Command;

/// Container runtime type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuntimeType {
    /// Docker runtime
    #[default]
    Docker,
    /// Podman runtime
    Podman,
}

impl RuntimeType {
    /// Get the default binary name for this runtime.
    pub fn default_binary(&self) -> &'static str {
        match self {
            RuntimeType::Docker => "docker",
            RuntimeType::Podman => "podman",
        }
    }
}

impl std::fmt::Display for RuntimeType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RuntimeType::Docker => write!(f, "docker"),
            RuntimeType::Podman => write!(f, "podman"),
        }
    }
}

impl std::str::FromStr for RuntimeType {
    type Err = ContainerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "docker" => Ok(RuntimeType::Docker),
            "podman" => Ok(RuntimeType::Podman),
            other => Err(ContainerError::InvalidInput(format!(
                "unknown container runtime '{}'",
                other
            ))),
        }
    }
}

/// Validate a container ID or name.
///
/// Container IDs are hex strings (12 or 64 chars for docker/podman).
/// Container names follow the same rules as container creation.
fn validate_container_id_or_name(id: &str) -> ContainerResult<()> {
    if id.is_empty() {
        return Err(ContainerError::InvalidInput(
            "container ID or name cannot be empty".to_string(),
        ));
    }

    if id.len() > 128 {
        return Err(ContainerError::InvalidInput(
            "container ID or name exceeds maximum length".to_string(),
        ));
    }

    let valid_chars = |c: char| c.is_ascii_alphanumeric() || c == '-' || c == '_';
    if !id.chars().all(valid_chars) {
        return Err(ContainerError::InvalidInput(format!(
            "container ID or name '{}' contains invalid characters",
            id
        )));
    }

    Ok(())
}

/// Validate a `--filter` expression such as `label=labdesk.managed=true`.
fn validate_filter(filter: &str) -> ContainerResult<()> {
    let valid_chars =
        |c: char| c.is_ascii_alphanumeric() || matches!(c, '=' | '.' | '-' | '_' | ':');
    if filter.is_empty() || !filter.chars().all(valid_chars) {
        return Err(ContainerError::InvalidInput(format!(
            "invalid container filter '{}'",
            filter
        )));
    }
    Ok(())
}

/// Build the argument list for `run -d`.
///
/// Kept separate from the spawn so the exact flags can be asserted in tests.
pub fn build_run_args(config: &ContainerConfig) -> Vec<String> {
    let mut args: Vec<String> = vec!["run".to_string(), "-d".to_string()];

    if let Some(ref name) = config.name {
        args.push("--name".to_string());
        args.push(name.clone());
    }

    if let Some(ref hostname) = config.hostname {
        args.push("--hostname".to_string());
        args.push(hostname.clone());
    }

    for port in &config.ports {
        args.push("-p".to_string());
        args.push(format!("{}:{}", port.host_port, port.container_port));
    }

    if let Some(ref memory) = config.memory {
        args.push("--memory".to_string());
        args.push(memory.clone());
    }

    if let Some(ref cpus) = config.cpus {
        args.push("--cpus".to_string());
        args.push(cpus.clone());
    }

    if let Some(ref shm_size) = config.shm_size {
        args.push("--shm-size".to_string());
        args.push(shm_size.clone());
    }

    for cap in &config.cap_drop {
        args.push("--cap-drop".to_string());
        args.push(cap.clone());
    }

    for cap in &config.cap_add {
        args.push("--cap-add".to_string());
        args.push(cap.clone());
    }

    for opt in &config.security_opts {
        args.push("--security-opt".to_string());
        args.push(opt.clone());
    }

    // Sorted so the command line is stable across HashMap iteration orders.
    let mut labels: Vec<_> = config.labels.iter().collect();
    labels.sort();
    for (key, value) in labels {
        args.push("--label".to_string());
        args.push(format!("{}={}", key, value));
    }

    let mut env: Vec<_> = config.env.iter().collect();
    env.sort();
    for (key, value) in env {
        args.push("-e".to_string());
        args.push(format!("{}={}", key, value));
    }

    args.push(config.image.clone());
    args
}

/// Container runtime client for managing containers.
///
/// Supports both Docker and Podman with automatic detection.
#[derive(Debug, Clone)]
pub struct ContainerRuntime {
    /// The runtime type (docker or podman)
    runtime_type: RuntimeType,
    /// Path to the container binary
    binary: String,
}

/// Container runtime abstraction for testability.
#[async_trait]
pub trait ContainerRuntimeApi: Send + Sync {
    async fn create_container(&self, config: &ContainerConfig) -> ContainerResult<String>;
    async fn stop_container(
        &self,
        container_id: &str,
        timeout_seconds: Option<u32>,
    ) -> ContainerResult<()>;
    async fn remove_container(&self, container_id: &str, force: bool) -> ContainerResult<()>;
    async fn list_containers(
        &self,
        all: bool,
        filter: Option<&str>,
    ) -> ContainerResult<Vec<Container>>;
    async fn container_state_status(&self, id_or_name: &str) -> ContainerResult<Option<String>>;
    async fn get_logs(&self, container_id: &str, tail: Option<u32>) -> ContainerResult<String>;
}

#[async_trait]
impl ContainerRuntimeApi for ContainerRuntime {
    async fn create_container(&self, config: &ContainerConfig) -> ContainerResult<String> {
        self.create_container(config).await
    }

    async fn stop_container(
        &self,
        container_id: &str,
        timeout_seconds: Option<u32>,
    ) -> ContainerResult<()> {
        self.stop_container(container_id, timeout_seconds).await
    }

    async fn remove_container(&self, container_id: &str, force: bool) -> ContainerResult<()> {
        self.remove_container(container_id, force).await
    }

    async fn list_containers(
        &self,
        all: bool,
        filter: Option<&str>,
    ) -> ContainerResult<Vec<Container>> {
        self.list_containers(all, filter).await
    }

    async fn container_state_status(&self, id_or_name: &str) -> ContainerResult<Option<String>> {
        self.container_state_status(id_or_name).await
    }

    async fn get_logs(&self, container_id: &str, tail: Option<u32>) -> ContainerResult<String> {
        self.get_logs(container_id, tail).await
    }
}

impl Default for ContainerRuntime {
    fn default() -> Self {
        Self::new()
    }
}

impl ContainerRuntime {
    /// Create a new container runtime with auto-detection.
    ///
    /// Prefers Docker, falls back to Podman.
    pub fn new() -> Self {
        let runtime_type = if Self::is_binary_available("docker") {
            RuntimeType::Docker
        } else if Self::is_binary_available("podman") {
            RuntimeType::Podman
        } else {
            // Nothing on PATH; spawning will fail and be reported per call.
            RuntimeType::Docker
        };
        Self::with_type(runtime_type)
    }

    /// Create a container runtime with a specific type.
    pub fn with_type(runtime_type: RuntimeType) -> Self {
        Self {
            binary: runtime_type.default_binary().to_string(),
            runtime_type,
        }
    }

    /// Create a container runtime with a custom binary path.
    pub fn with_binary(runtime_type: RuntimeType, binary: impl Into<String>) -> Self {
        Self {
            runtime_type,
            binary: binary.into(),
        }
    }

    /// Get the runtime type.
    pub fn runtime_type(&self) -> RuntimeType {
        self.runtime_type
    }

    /// Get the binary used to drive the runtime.
    pub fn binary(&self) -> &str {
        &self.binary
    }

    /// Check if a binary is available in PATH.
    fn is_binary_available(name: &str) -> bool {
        std::process::Command::new("which")
            .arg(name)
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .map(|s| s.success())
            .unwrap_or(false)
    }

    /// Spawn the runtime binary and wait for it.
    async fn exec<I, S>(&self, command: &str, args: I) -> ContainerResult<std::process::Output>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<std::ffi::OsStr>,
    {
        Command::new(&self.binary)
            .args(args)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await
            .map_err(|e| ContainerError::command_failed(command, e.to_string()))
    }

    /// Spawn the runtime binary and return stdout, treating a non-zero exit as an error.
    async fn exec_checked<I, S>(&self, command: &str, args: I) -> ContainerResult<String>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<std::ffi::OsStr>,
    {
        let output = self.exec(command, args).await?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(ContainerError::command_failed(command, stderr.trim()));
        }

        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }

    /// Check if the container runtime is available and working.
    pub async fn health_check(&self) -> ContainerResult<String> {
        self.exec_checked("version", ["version", "--format", "json"])
            .await
    }

    /// Create and start a new container.
    ///
    /// The configuration is validated before creating the container to prevent
    /// injection attacks and ensure all inputs are well-formed.
    pub async fn create_container(&self, config: &ContainerConfig) -> ContainerResult<String> {
        config.validate()?;

        let stdout = self.exec_checked("run", build_run_args(config)).await?;

        Ok(stdout.trim().to_string())
    }

    /// Stop a running container.
    pub async fn stop_container(
        &self,
        container_id: &str,
        timeout: Option<u32>,
    ) -> ContainerResult<()> {
        validate_container_id_or_name(container_id)?;

        let mut args: Vec<String> = vec!["stop".to_string()];
        if let Some(t) = timeout {
            args.push("-t".to_string());
            args.push(t.to_string());
        }
        args.push(container_id.to_string());

        self.exec_checked("stop", args).await.map(|_| ())
    }

    /// Remove a container.
    pub async fn remove_container(&self, container_id: &str, force: bool) -> ContainerResult<()> {
        validate_container_id_or_name(container_id)?;

        let mut args = vec!["rm"];
        if force {
            args.push("-f");
        }
        args.push(container_id);

        self.exec_checked("rm", args).await.map(|_| ())
    }

    /// List containers, optionally including stopped ones and narrowing by a filter.
    pub async fn list_containers(
        &self,
        all: bool,
        filter: Option<&str>,
    ) -> ContainerResult<Vec<Container>> {
        let mut args = vec!["ps", "--format", "json"];

        if all {
            args.push("-a");
        }

        if let Some(filter) = filter {
            validate_filter(filter)?;
            args.push("--filter");
            args.push(filter);
        }

        let stdout = self.exec_checked("ps", args).await?;
        parse_container_list(&stdout)
    }

    /// Get the container state status string (e.g. "running", "exited") via `inspect`.
    ///
    /// Returns `Ok(None)` when the container does not exist.
    pub async fn container_state_status(
        &self,
        id_or_name: &str,
    ) -> ContainerResult<Option<String>> {
        validate_container_id_or_name(id_or_name)?;

        let output = self
            .exec("inspect", ["inspect", "--format", "{{.State.Status}}", id_or_name])
            .await?;

        if !output.status.success() {
            // Container not found is not an error; callers treat it as missing.
            return Ok(None);
        }

        let status = String::from_utf8_lossy(&output.stdout).trim().to_string();
        if status.is_empty() {
            return Ok(None);
        }

        Ok(Some(status))
    }

    /// Get container logs (stdout followed by stderr).
    pub async fn get_logs(&self, container_id: &str, tail: Option<u32>) -> ContainerResult<String> {
        validate_container_id_or_name(container_id)?;

        let mut args: Vec<String> = vec!["logs".to_string()];
        if let Some(n) = tail {
            args.push("--tail".to_string());
            args.push(n.to_string());
        }
        args.push(container_id.to_string());

        let output = self.exec("logs", args).await?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(ContainerError::command_failed("logs", stderr.trim()));
        }

        // Desktop images print their startup banner on stderr.
        let mut logs = String::from_utf8_lossy(&output.stdout).to_string();
        logs.push_str(&String::from_utf8_lossy(&output.stderr));
        Ok(logs)
    }
}
