//! Desktop session data models.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Session status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    /// Container exists, readiness not yet decided.
    Starting,
    /// Desktop is serving (confirmed or assumed, see [`ReadyState`]).
    Running,
    /// Session was torn down.
    Terminated,
    /// Provisioning failed.
    Error,
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionStatus::Starting => write!(f, "starting"),
            SessionStatus::Running => write!(f, "running"),
            SessionStatus::Terminated => write!(f, "terminated"),
            SessionStatus::Error => write!(f, "error"),
        }
    }
}

impl std::str::FromStr for SessionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "starting" => Ok(SessionStatus::Starting),
            "running" => Ok(SessionStatus::Running),
            "terminated" => Ok(SessionStatus::Terminated),
            "error" => Ok(SessionStatus::Error),
            _ => Err(format!("unknown session status: {}", s)),
        }
    }
}

/// Verdict of the readiness poller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReadyState {
    /// The readiness marker was seen in the container logs.
    Ready,
    /// The timeout elapsed without the marker; the desktop is assumed up.
    AssumedReady,
}

impl std::fmt::Display for ReadyState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ReadyState::Ready => write!(f, "ready"),
            ReadyState::AssumedReady => write!(f, "assumed_ready"),
        }
    }
}

/// A container-backed remote desktop bound to one user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DesktopSession {
    /// Opaque session handle. Identical to `container_id`.
    pub session_id: String,
    /// Runtime container ID.
    pub container_id: String,
    /// Runtime container name (`labdesk-<user>-<uuid>`).
    pub container_name: String,
    /// Owning user.
    pub user_id: u64,
    /// Host port exposing the web remote display.
    pub port: u16,
    pub vnc_url: String,
    pub web_url: String,
    pub status: SessionStatus,
    pub readiness: ReadyState,
    /// Sole basis for reclamation.
    pub created_at: DateTime<Utc>,
    pub os_type: String,
    pub ip_address: String,
}

impl DesktopSession {
    /// Build a session for a container that exists but has not been polled yet.
    pub fn starting(
        container_id: impl Into<String>,
        container_name: impl Into<String>,
        user_id: u64,
        port: u16,
        host: &str,
        os_type: impl Into<String>,
        created_at: DateTime<Utc>,
    ) -> Self {
        let container_id = container_id.into();
        let (web_url, vnc_url) = endpoints(host, port);
        Self {
            session_id: container_id.clone(),
            container_id,
            container_name: container_name.into(),
            user_id,
            port,
            vnc_url,
            web_url,
            status: SessionStatus::Starting,
            // Overwritten by `into_running`; nothing has been confirmed yet.
            readiness: ReadyState::AssumedReady,
            created_at,
            os_type: os_type.into(),
            ip_address: host.to_string(),
        }
    }

    /// Transition to `running` with the poller's verdict.
    pub fn into_running(mut self, readiness: ReadyState) -> Self {
        self.status = SessionStatus::Running;
        self.readiness = readiness;
        self
    }

    /// Snapshot of this session as it looks after teardown.
    pub fn terminated(&self) -> Self {
        let mut snapshot = self.clone();
        snapshot.status = SessionStatus::Terminated;
        snapshot
    }

    /// Age of the session at `now`.
    pub fn age_at(&self, now: DateTime<Utc>) -> chrono::Duration {
        now - self.created_at
    }
}

/// Derive `(web_url, vnc_url)` for a published port.
pub fn endpoints(host: &str, port: u16) -> (String, String) {
    let web_url = format!("http://{}:{}", host, port);
    let vnc_url = format!("{}/vnc.html?autoconnect=true", web_url);
    (web_url, vnc_url)
}

/// Client-facing view of a session.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionView {
    pub session_id: String,
    pub vnc_url: String,
    pub web_url: String,
    pub port: u16,
    pub status: SessionStatus,
    pub os_type: String,
    pub ip_address: String,
    pub readiness: ReadyState,
    pub created_at: DateTime<Utc>,
}

impl From<&DesktopSession> for SessionView {
    fn from(session: &DesktopSession) -> Self {
        Self {
            session_id: session.session_id.clone(),
            vnc_url: session.vnc_url.clone(),
            web_url: session.web_url.clone(),
            port: session.port,
            status: session.status,
            os_type: session.os_type.clone(),
            ip_address: session.ip_address.clone(),
            readiness: session.readiness,
            created_at: session.created_at,
        }
    }
}

/// Admin listing entry; carries the owner and container name as well.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AdminSessionView {
    pub user_id: u64,
    pub container_name: String,
    #[serde(flatten)]
    pub session: SessionView,
}

impl From<&DesktopSession> for AdminSessionView {
    fn from(session: &DesktopSession) -> Self {
        Self {
            user_id: session.user_id,
            container_name: session.container_name.clone(),
            session: SessionView::from(session),
        }
    }
}

/// Result of `create_session`.
#[derive(Debug, Clone)]
pub enum CreateOutcome {
    /// A live session already existed and was returned untouched.
    Reused(DesktopSession),
    /// A new container was provisioned.
    Created(DesktopSession),
}

impl CreateOutcome {
    pub fn session(&self) -> &DesktopSession {
        match self {
            CreateOutcome::Reused(session) | CreateOutcome::Created(session) => session,
        }
    }

    pub fn into_session(self) -> DesktopSession {
        match self {
            CreateOutcome::Reused(session) | CreateOutcome::Created(session) => session,
        }
    }

    pub fn is_created(&self) -> bool {
        matches!(self, CreateOutcome::Created(_))
    }
}

/// Why a termination did not happen.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TerminateReason {
    NoActiveSession,
}

impl std::fmt::Display for TerminateReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TerminateReason::NoActiveSession => write!(f, "No active session"),
        }
    }
}

/// Result of `terminate_session`.
#[derive(Debug, Clone, Default)]
pub struct TerminateOutcome {
    pub success: bool,
    pub reason: Option<TerminateReason>,
    /// Stop/remove failures; logged, never blocking the eviction.
    pub cleanup_warnings: Vec<String>,
    /// The evicted session with `status = terminated`.
    pub session: Option<DesktopSession>,
}

impl TerminateOutcome {
    pub fn no_active_session() -> Self {
        Self {
            success: false,
            reason: Some(TerminateReason::NoActiveSession),
            ..Default::default()
        }
    }

    pub fn terminated(session: DesktopSession, cleanup_warnings: Vec<String>) -> Self {
        Self {
            success: true,
            reason: None,
            cleanup_warnings,
            session: Some(session),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_round_trips_through_strings() {
        for status in [
            SessionStatus::Starting,
            SessionStatus::Running,
            SessionStatus::Terminated,
            SessionStatus::Error,
        ] {
            assert_eq!(status.to_string().parse::<SessionStatus>().unwrap(), status);
        }
        assert!("stopped".parse::<SessionStatus>().is_err());
    }

    #[test]
    fn urls_are_derived_from_host_and_port() {
        let session = DesktopSession::starting(
            "abc123",
            "labdesk-7-x",
            7,
            6907,
            "lab.example.com",
            "Ubuntu",
            Utc::now(),
        );
        assert_eq!(session.session_id, session.container_id);
        assert_eq!(session.web_url, "http://lab.example.com:6907");
        assert_eq!(
            session.vnc_url,
            "http://lab.example.com:6907/vnc.html?autoconnect=true"
        );
        assert_eq!(session.status, SessionStatus::Starting);

        let running = session.into_running(ReadyState::Ready);
        assert_eq!(running.status, SessionStatus::Running);
        assert_eq!(running.readiness, ReadyState::Ready);
        assert_eq!(running.terminated().status, SessionStatus::Terminated);
    }

    #[test]
    fn view_serializes_camel_case() {
        let session = DesktopSession::starting(
            "abc123",
            "labdesk-7-x",
            7,
            6907,
            "localhost",
            "Ubuntu",
            Utc::now(),
        )
        .into_running(ReadyState::AssumedReady);

        let json = serde_json::to_value(SessionView::from(&session)).unwrap();
        assert_eq!(json["sessionId"], "abc123");
        assert_eq!(json["vncUrl"], "http://localhost:6907/vnc.html?autoconnect=true");
        assert_eq!(json["status"], "running");
        assert_eq!(json["readiness"], "assumed_ready");
        assert_eq!(json["osType"], "Ubuntu");
        assert_eq!(json["ipAddress"], "localhost");
        assert!(json.get("createdAt").is_some());

        let admin = serde_json::to_value(AdminSessionView::from(&session)).unwrap();
        assert_eq!(admin["userId"], 7);
        assert_eq!(admin["sessionId"], "abc123");
    }
}
