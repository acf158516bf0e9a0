//! Application state.

use std::sync::Arc;

use crate::audit::SqliteAuditStore;
use crate::auth::AuthState;
use crate::desktop::DesktopSessionService;

/// Application state shared across all handlers.
#[derive(Clone)]
pub struct AppState {
    /// Desktop lifecycle manager.
    pub desktops: Arc<DesktopSessionService>,
    /// Authentication state.
    pub auth: AuthState,
    /// Read side of the audit trail; `None` when auditing is disabled.
    pub audit: Option<Arc<SqliteAuditStore>>,
}

impl AppState {
    pub fn new(desktops: Arc<DesktopSessionService>, auth: AuthState) -> Self {
        Self {
            desktops,
            auth,
            audit: None,
        }
    }

    pub fn with_audit(mut self, audit: Arc<SqliteAuditStore>) -> Self {
        self.audit = Some(audit);
        self
    }
}
