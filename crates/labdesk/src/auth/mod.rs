//! Authentication module.
//!
//! Validates HS256 tokens minted by the LMS, with a dev bypass mode backed by
//! configured test users.

mod claims;
mod config;
mod error;
mod middleware;

pub use claims::{Claims, Role};
pub use config::{AuthConfig, ConfigValidationError, DevUser};
pub use error::AuthError;
pub use middleware::{AuthState, CurrentUser, RequireAdmin, auth_middleware};
