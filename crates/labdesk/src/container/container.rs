//! Container types and configuration.

use std::collections::HashMap;

use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use serde::{Deserialize, Deserializer, Serialize};

use super::error::{ContainerError, ContainerResult};

/// Deserialize a field that can be either a string or an integer (Unix timestamp).
/// Converts integers to string representation.
fn deserialize_string_or_int<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    use serde::de::{self, Visitor};
    use std::fmt;

    struct StringOrInt;

    impl<'de> Visitor<'de> for StringOrInt {
        type Value = String;

        fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
            formatter.write_str("a string or an integer")
        }

        fn visit_str<E>(self, value: &str) -> Result<Self::Value, E>
        where
            E: de::Error,
        {
            Ok(value.to_string())
        }

        fn visit_i64<E>(self, value: i64) -> Result<Self::Value, E>
        where
            E: de::Error,
        {
            Ok(value.to_string())
        }

        fn visit_u64<E>(self, value: u64) -> Result<Self::Value, E>
        where
            E: de::Error,
        {
            Ok(value.to_string())
        }
    }

    deserializer.deserialize_any(StringOrInt)
}

/// Names come back as an array from podman and as a comma separated string from docker.
fn deserialize_names<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Names {
        List(Vec<String>),
        Joined(String),
    }

    Ok(match Names::deserialize(deserializer)? {
        Names::List(names) => names,
        Names::Joined(joined) => joined
            .split(',')
            .map(|name| name.trim().to_string())
            .filter(|name| !name.is_empty())
            .collect(),
    })
}

/// Labels come back as a map from podman and as `k=v,k2=v2` from docker.
fn deserialize_labels<'de, D>(deserializer: D) -> Result<HashMap<String, String>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Labels {
        Map(HashMap<String, String>),
        Joined(String),
        Missing(()),
    }

    Ok(match Labels::deserialize(deserializer)? {
        Labels::Map(map) => map,
        Labels::Joined(joined) => joined
            .split(',')
            .filter_map(|pair| {
                let (key, value) = pair.split_once('=')?;
                Some((key.trim().to_string(), value.trim().to_string()))
            })
            .collect(),
        Labels::Missing(()) => HashMap::new(),
    })
}

/// Port mapping configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortMapping {
    /// Port on the host.
    pub host_port: u16,
    /// Port in the container.
    pub container_port: u16,
}

impl PortMapping {
    /// Create a new port mapping.
    pub fn new(host_port: u16, container_port: u16) -> Self {
        Self {
            host_port,
            container_port,
        }
    }
}

/// Configuration for creating a new container.
#[derive(Debug, Clone, Default)]
pub struct ContainerConfig {
    /// Container name (optional).
    pub name: Option<String>,
    /// Container hostname.
    pub hostname: Option<String>,
    /// Docker/OCI image to use.
    pub image: String,
    /// Environment variables.
    pub env: HashMap<String, String>,
    /// Port mappings.
    pub ports: Vec<PortMapping>,
    /// Labels for the container.
    pub labels: HashMap<String, String>,
    /// Hard memory cap (e.g. "2g").
    pub memory: Option<String>,
    /// CPU quota (e.g. "1.5").
    pub cpus: Option<String>,
    /// Size of /dev/shm; desktop browsers crash with the 64m default.
    pub shm_size: Option<String>,
    /// Linux capabilities to drop.
    pub cap_drop: Vec<String>,
    /// Linux capabilities to add back after dropping.
    pub cap_add: Vec<String>,
    /// Security options (e.g. "no-new-privileges").
    pub security_opts: Vec<String>,
}

impl ContainerConfig {
    /// Create a new container config with the given image.
    pub fn new(image: impl Into<String>) -> Self {
        Self {
            image: image.into(),
            ..Default::default()
        }
    }

    /// Validate all container configuration fields.
    ///
    /// This should be called before creating a container to ensure all inputs
    /// are safe and well-formed.
    pub fn validate(&self) -> ContainerResult<()> {
        validate_image_name(&self.image)?;

        if let Some(ref name) = self.name {
            validate_container_name(name)?;
        }

        if let Some(ref hostname) = self.hostname {
            validate_hostname(hostname)?;
        }

        for key in self.env.keys() {
            validate_env_var_key(key)?;
        }

        for (key, value) in &self.labels {
            validate_label(key, value)?;
        }

        if let Some(ref memory) = self.memory {
            validate_memory_limit(memory)?;
        }

        if let Some(ref shm_size) = self.shm_size {
            validate_memory_limit(shm_size)?;
        }

        if let Some(ref cpus) = self.cpus {
            validate_cpu_limit(cpus)?;
        }

        for cap in self.cap_drop.iter().chain(self.cap_add.iter()) {
            validate_capability(cap)?;
        }

        Ok(())
    }

    /// Set the container name.
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Set the container hostname.
    pub fn hostname(mut self, hostname: impl Into<String>) -> Self {
        self.hostname = Some(hostname.into());
        self
    }

    /// Add an environment variable.
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    /// Add a port mapping.
    pub fn port(mut self, host_port: u16, container_port: u16) -> Self {
        self.ports.push(PortMapping::new(host_port, container_port));
        self
    }

    /// Add a label.
    pub fn label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }

    /// Set the memory cap.
    pub fn memory(mut self, limit: impl Into<String>) -> Self {
        self.memory = Some(limit.into());
        self
    }

    /// Set the CPU quota.
    pub fn cpus(mut self, limit: impl Into<String>) -> Self {
        self.cpus = Some(limit.into());
        self
    }

    /// Set the shared memory size.
    pub fn shm_size(mut self, size: impl Into<String>) -> Self {
        self.shm_size = Some(size.into());
        self
    }

    /// Drop a Linux capability.
    pub fn cap_drop(mut self, cap: impl Into<String>) -> Self {
        self.cap_drop.push(cap.into());
        self
    }

    /// Add a Linux capability.
    pub fn cap_add(mut self, cap: impl Into<String>) -> Self {
        self.cap_add.push(cap.into());
        self
    }

    /// Add a security option.
    pub fn security_opt(mut self, opt: impl Into<String>) -> Self {
        self.security_opts.push(opt.into());
        self
    }
}

/// Container state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContainerState {
    Created,
    Running,
    Paused,
    Restarting,
    Removing,
    Exited,
    Dead,
    #[default]
    #[serde(other)]
    Unknown,
}

impl std::fmt::Display for ContainerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ContainerState::Created => write!(f, "created"),
            ContainerState::Running => write!(f, "running"),
            ContainerState::Paused => write!(f, "paused"),
            ContainerState::Restarting => write!(f, "restarting"),
            ContainerState::Removing => write!(f, "removing"),
            ContainerState::Exited => write!(f, "exited"),
            ContainerState::Dead => write!(f, "dead"),
            ContainerState::Unknown => write!(f, "unknown"),
        }
    }
}

/// Container information from `ps --format json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Container {
    /// Container ID.
    #[serde(alias = "ID")]
    pub id: String,

    /// Container names.
    #[serde(default, deserialize_with = "deserialize_names")]
    pub names: Vec<String>,

    /// Image used.
    #[serde(default)]
    pub image: String,

    /// Container state.
    #[serde(default)]
    pub state: ContainerState,

    /// Creation timestamp (podman reports a Unix timestamp, docker a string).
    #[serde(
        default,
        alias = "CreatedAt",
        deserialize_with = "deserialize_string_or_int"
    )]
    pub created: String,

    /// Container labels.
    #[serde(default, deserialize_with = "deserialize_labels")]
    pub labels: HashMap<String, String>,
}

impl Container {
    /// Parse the creation timestamp reported by the runtime.
    ///
    /// Accepts Unix seconds (podman), RFC 3339, and docker's
    /// `2024-05-01 10:00:00 +0000 UTC` layout.
    pub fn created_at(&self) -> Option<DateTime<Utc>> {
        let raw = self.created.trim();
        if raw.is_empty() {
            return None;
        }

        if let Ok(secs) = raw.parse::<i64>() {
            return Utc.timestamp_opt(secs, 0).single();
        }

        if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
            return Some(ts.with_timezone(&Utc));
        }

        let without_zone_name: String = raw.split_whitespace().take(3).collect::<Vec<_>>().join(" ");
        if let Ok(ts) = DateTime::parse_from_str(&without_zone_name, "%Y-%m-%d %H:%M:%S %z") {
            return Some(ts.with_timezone(&Utc));
        }

        let date_time: String = raw.split_whitespace().take(2).collect::<Vec<_>>().join(" ");
        NaiveDateTime::parse_from_str(&date_time, "%Y-%m-%d %H:%M:%S")
            .ok()
            .map(|naive| naive.and_utc())
    }

    /// Look up a label value.
    pub fn label(&self, key: &str) -> Option<&str> {
        self.labels.get(key).map(String::as_str)
    }
}

/// Parse `ps --format json` output.
///
/// Podman prints a single JSON array, docker prints one object per line.
pub fn parse_container_list(stdout: &str) -> ContainerResult<Vec<Container>> {
    let trimmed = stdout.trim();
    if trimmed.is_empty() {
        return Ok(Vec::new());
    }

    if trimmed.starts_with('[') {
        return serde_json::from_str(trimmed).map_err(|e| ContainerError::ParseError(e.to_string()));
    }

    trimmed
        .lines()
        .filter(|line| !line.trim().is_empty())
        .map(|line| {
            serde_json::from_str(line).map_err(|e| ContainerError::ParseError(e.to_string()))
        })
        .collect()
}

// ============================================================================
// Input Validation Functions
// ============================================================================

/// Validate a Docker/OCI image name.
///
/// Image names follow the pattern: `[registry/][namespace/]name[:tag][@digest]`
pub fn validate_image_name(image: &str) -> ContainerResult<()> {
    if image.is_empty() {
        return Err(ContainerError::InvalidInput(
            "image name cannot be empty".to_string(),
        ));
    }

    if image.len() > 256 {
        return Err(ContainerError::InvalidInput(
            "image name exceeds maximum length of 256 characters".to_string(),
        ));
    }

    let valid_chars = |c: char| {
        c.is_ascii_alphanumeric()
            || c == '.'
            || c == '-'
            || c == '_'
            || c == '/'
            || c == ':'
            || c == '@'
    };

    if !image.chars().all(valid_chars) {
        return Err(ContainerError::InvalidInput(format!(
            "image name '{}' contains invalid characters; only alphanumeric, '.', '-', '_', '/', ':', '@' are allowed",
            image
        )));
    }

    if image.contains("..") {
        return Err(ContainerError::InvalidInput(
            "image name cannot contain '..'".to_string(),
        ));
    }

    Ok(())
}

/// Validate a container name.
///
/// Container names must be alphanumeric with hyphens and underscores.
/// They must start with a letter, digit or underscore.
pub fn validate_container_name(name: &str) -> ContainerResult<()> {
    let Some(first_char) = name.chars().next() else {
        return Err(ContainerError::InvalidInput(
            "container name cannot be empty".to_string(),
        ));
    };

    if name.len() > 128 {
        return Err(ContainerError::InvalidInput(
            "container name exceeds maximum length of 128 characters".to_string(),
        ));
    }

    if !first_char.is_ascii_alphanumeric() && first_char != '_' {
        return Err(ContainerError::InvalidInput(
            "container name must start with an alphanumeric character or underscore".to_string(),
        ));
    }

    let valid_chars = |c: char| c.is_ascii_alphanumeric() || c == '-' || c == '_';
    if !name.chars().all(valid_chars) {
        return Err(ContainerError::InvalidInput(format!(
            "container name '{}' contains invalid characters; only alphanumeric, '-', '_' are allowed",
            name
        )));
    }

    Ok(())
}

/// Validate a hostname (RFC 1123).
fn validate_hostname(hostname: &str) -> ContainerResult<()> {
    if hostname.is_empty() {
        return Err(ContainerError::InvalidInput(
            "hostname cannot be empty".to_string(),
        ));
    }

    if hostname.len() > 253 {
        return Err(ContainerError::InvalidInput(
            "hostname exceeds maximum length of 253 characters".to_string(),
        ));
    }

    for label in hostname.split('.') {
        if label.is_empty() || label.len() > 63 {
            return Err(ContainerError::InvalidInput(format!(
                "hostname '{}' has an empty or oversized label",
                hostname
            )));
        }

        let starts_ok = label.starts_with(|c: char| c.is_ascii_alphanumeric());
        let ends_ok = label.ends_with(|c: char| c.is_ascii_alphanumeric());
        if !starts_ok || !ends_ok {
            return Err(ContainerError::InvalidInput(
                "hostname labels must start and end with alphanumeric characters".to_string(),
            ));
        }

        if !label.chars().all(|c| c.is_ascii_alphanumeric() || c == '-') {
            return Err(ContainerError::InvalidInput(format!(
                "hostname '{}' contains invalid characters",
                hostname
            )));
        }
    }

    Ok(())
}

/// Validate an environment variable key (POSIX style).
fn validate_env_var_key(key: &str) -> ContainerResult<()> {
    let Some(first_char) = key.chars().next() else {
        return Err(ContainerError::InvalidInput(
            "environment variable key cannot be empty".to_string(),
        ));
    };

    if !first_char.is_ascii_alphabetic() && first_char != '_' {
        return Err(ContainerError::InvalidInput(format!(
            "environment variable key '{}' must start with a letter or underscore",
            key
        )));
    }

    if !key.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
        return Err(ContainerError::InvalidInput(format!(
            "environment variable key '{}' contains invalid characters; only alphanumeric and '_' are allowed",
            key
        )));
    }

    Ok(())
}

/// Validate a label key/value pair. Labels are passed as `--label k=v`.
fn validate_label(key: &str, value: &str) -> ContainerResult<()> {
    if key.is_empty() {
        return Err(ContainerError::InvalidInput(
            "label key cannot be empty".to_string(),
        ));
    }

    let valid_key = |c: char| c.is_ascii_alphanumeric() || c == '.' || c == '-' || c == '_';
    if !key.chars().all(valid_key) {
        return Err(ContainerError::InvalidInput(format!(
            "label key '{}' contains invalid characters",
            key
        )));
    }

    if value.contains(['\n', '\r', '\0', ',']) {
        return Err(ContainerError::InvalidInput(format!(
            "label value for '{}' contains invalid characters",
            key
        )));
    }

    Ok(())
}

/// Validate a size such as `512m`, `2g` or `1073741824`.
fn validate_memory_limit(limit: &str) -> ContainerResult<()> {
    let digits = limit.trim_end_matches(['b', 'k', 'm', 'g', 'B', 'K', 'M', 'G']);
    let suffix_len = limit.len() - digits.len();

    if digits.is_empty() || suffix_len > 1 || !digits.chars().all(|c| c.is_ascii_digit()) {
        return Err(ContainerError::InvalidInput(format!(
            "invalid size '{}'; expected a number with optional b/k/m/g suffix",
            limit
        )));
    }

    Ok(())
}

/// Validate a CPU quota such as `1` or `1.5`.
fn validate_cpu_limit(limit: &str) -> ContainerResult<()> {
    match limit.parse::<f64>() {
        Ok(cpus) if cpus > 0.0 && cpus.is_finite() => Ok(()),
        _ => Err(ContainerError::InvalidInput(format!(
            "invalid cpu limit '{}'; expected a positive number",
            limit
        ))),
    }
}

/// Validate a capability name (`ALL`, `NET_RAW`, ...).
fn validate_capability(cap: &str) -> ContainerResult<()> {
    if cap.is_empty() || !cap.chars().all(|c| c.is_ascii_uppercase() || c == '_') {
        return Err(ContainerError::InvalidInput(format!(
            "invalid capability '{}'",
            cap
        )));
    }
    Ok(())
}
