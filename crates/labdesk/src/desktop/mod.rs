//! Desktop session management.
//!
//! Provisions per-user remote desktops in containers, tracks them in an
//! in-memory registry and reclaims them when they age out.

mod adapter;
mod error;
mod models;
mod ports;
mod readiness;
mod reaper;
mod registry;
mod service;

pub use adapter::{MANAGED_LABEL, RuntimeAdapter, USER_LABEL};
pub use error::{DesktopError, DesktopResult};
pub use models::{
    AdminSessionView, CreateOutcome, DesktopSession, ReadyState, SessionStatus, SessionView,
    TerminateOutcome, TerminateReason,
};
pub use ports::{PortAllocator, parse_user_id};
pub use readiness::{LogMarkerReadiness, ReadinessProbe};
pub use reaper::IdleReaper;
pub use registry::SessionRegistry;
pub use service::{
    CONTAINER_NAME_PREFIX, DesktopServiceConfig, DesktopSessionService, RediscoveryReport,
};
