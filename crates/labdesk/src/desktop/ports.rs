//! Deterministic port allocation.

use super::error::{DesktopError, DesktopResult};

/// Maps a user to the host port that publishes their desktop.
///
/// `port = base_port + user_id`. Pure, so distinct users always get distinct
/// ports and no reservation state has to be kept.
#[derive(Debug, Clone, Copy)]
pub struct PortAllocator {
    base_port: u16,
}

impl PortAllocator {
    pub fn new(base_port: u16) -> Self {
        Self { base_port }
    }

    pub fn base_port(&self) -> u16 {
        self.base_port
    }

    /// Allocate the port for `user_id`.
    pub fn allocate(&self, user_id: u64) -> DesktopResult<u16> {
        if user_id == 0 {
            return Err(DesktopError::InvalidUserId(
                "user id must be a positive integer".to_string(),
            ));
        }

        u64::from(self.base_port)
            .checked_add(user_id)
            .and_then(|port| u16::try_from(port).ok())
            .ok_or_else(|| {
                DesktopError::InvalidUserId(format!(
                    "user id {} exceeds the port range above base port {}",
                    user_id, self.base_port
                ))
            })
    }
}

/// Parse an identity string from the auth layer into a positive user id.
pub fn parse_user_id(raw: &str) -> DesktopResult<u64> {
    match raw.trim().parse::<u64>() {
        Ok(0) | Err(_) => Err(DesktopError::InvalidUserId(format!(
            "'{}' is not a positive integer",
            raw
        ))),
        Ok(id) => Ok(id),
    }
}
