//! Authentication configuration.

use super::Role;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Minimum accepted length for an HS256 secret.
const MIN_SECRET_LEN: usize = 32;

/// Authentication configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    /// Enable development mode (`X-Dev-User` and `dev:<id>` tokens).
    pub dev_mode: bool,

    /// HS256 secret shared with the LMS. Supports `env:VAR_NAME`.
    /// Required when dev_mode is false.
    pub jwt_secret: Option<String>,

    /// Expected `iss` claim, if the LMS sets one.
    pub jwt_issuer: Option<String>,

    /// Expected `aud` claim, if the LMS sets one.
    pub jwt_audience: Option<String>,

    /// Development users (only used in dev mode).
    pub dev_users: Vec<DevUser>,

    /// Allowed CORS origins. Empty means same-origin only.
    pub allowed_origins: Vec<String>,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            dev_mode: false,
            jwt_secret: None,
            jwt_issuer: None,
            jwt_audience: None,
            dev_users: Vec::new(),
            allowed_origins: vec!["http://localhost:3000".to_string()],
        }
    }
}

impl AuthConfig {
    /// Resolve the JWT secret, expanding `env:VAR_NAME` syntax.
    pub fn resolve_jwt_secret(&self) -> Result<Option<String>, ConfigValidationError> {
        let Some(value) = &self.jwt_secret else {
            return Ok(None);
        };

        let Some(var_name) = value.strip_prefix("env:") else {
            return Ok(Some(value.clone()));
        };

        match std::env::var(var_name) {
            Ok(secret) if !secret.is_empty() => Ok(Some(secret)),
            Ok(_) => Err(ConfigValidationError::EnvVarEmpty(var_name.to_string())),
            Err(_) => Err(ConfigValidationError::EnvVarNotFound(var_name.to_string())),
        }
    }

    /// Reject configurations that would leave the API unauthenticated.
    pub fn validate(&self) -> Result<(), ConfigValidationError> {
        if self.dev_mode {
            return Ok(());
        }

        let secret = self
            .resolve_jwt_secret()?
            .ok_or(ConfigValidationError::MissingJwtSecret)?;

        if secret.len() < MIN_SECRET_LEN {
            return Err(ConfigValidationError::JwtSecretTooShort);
        }

        Ok(())
    }
}

/// Configuration validation errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigValidationError {
    #[error(
        "JWT secret is required when dev_mode is false. Set auth.jwt_secret or LABDESK__AUTH__JWT_SECRET."
    )]
    MissingJwtSecret,

    #[error("JWT secret must be at least 32 characters long.")]
    JwtSecretTooShort,

    #[error("Environment variable '{0}' not found (referenced via env: in config).")]
    EnvVarNotFound(String),

    #[error("Environment variable '{0}' is empty (referenced via env: in config).")]
    EnvVarEmpty(String),
}

/// Development user configuration.
///
/// `id` must be the numeric LMS user id the desktop is provisioned for.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DevUser {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub email: String,
    #[serde(default)]
    pub role: Role,
}
