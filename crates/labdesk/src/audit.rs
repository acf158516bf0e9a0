//! Best-effort audit trail of desktop session events.
//!
//! Events are pushed onto a bounded channel with `try_send` and written to
//! sqlite by a background task. Publishing never blocks, never awaits the
//! write, and never fails the caller; a full channel or a failed insert is
//! logged at `warn` and dropped.

use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::desktop::{DesktopSession, SessionStatus};

/// Channel depth before events start being dropped.
pub const DEFAULT_AUDIT_CAPACITY: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuditEventKind {
    Created,
    Terminated,
    Error,
}

impl std::fmt::Display for AuditEventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AuditEventKind::Created => write!(f, "created"),
            AuditEventKind::Terminated => write!(f, "terminated"),
            AuditEventKind::Error => write!(f, "error"),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct AuditEvent {
    pub event: AuditEventKind,
    pub user_id: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub container_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    pub status: SessionStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_snapshot: Option<DesktopSession>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub terminated_at: Option<DateTime<Utc>>,
}

impl AuditEvent {
    pub fn created(session: &DesktopSession) -> Self {
        Self {
            event: AuditEventKind::Created,
            user_id: session.user_id,
            container_id: Some(session.container_id.clone()),
            port: Some(session.port),
            status: session.status,
            session_snapshot: Some(session.clone()),
            error_message: None,
            created_at: Some(session.created_at),
            terminated_at: None,
        }
    }

    /// `snapshot` is the session as evicted, with `status = terminated`.
    pub fn terminated(snapshot: &DesktopSession, terminated_at: DateTime<Utc>) -> Self {
        Self {
            event: AuditEventKind::Terminated,
            user_id: snapshot.user_id,
            container_id: Some(snapshot.container_id.clone()),
            port: Some(snapshot.port),
            status: snapshot.status,
            session_snapshot: Some(snapshot.clone()),
            error_message: None,
            created_at: Some(snapshot.created_at),
            terminated_at: Some(terminated_at),
        }
    }

    pub fn provision_failed(user_id: u64, port: u16, message: impl Into<String>) -> Self {
        Self {
            event: AuditEventKind::Error,
            user_id,
            container_id: None,
            port: Some(port),
            status: SessionStatus::Error,
            session_snapshot: None,
            error_message: Some(message.into()),
            created_at: None,
            terminated_at: None,
        }
    }
}

/// A persisted audit row.
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
#[serde(rename_all = "camelCase")]
pub struct AuditRecord {
    pub id: i64,
    pub event: String,
    pub user_id: i64,
    pub container_id: Option<String>,
    pub port: Option<i64>,
    pub status: String,
    pub session_snapshot: Option<String>,
    pub error_message: Option<String>,
    pub created_at: Option<String>,
    pub terminated_at: Option<String>,
    pub recorded_at: String,
}

#[async_trait]
pub trait AuditStore: Send + Sync {
    async fn record(&self, event: &AuditEvent) -> Result<()>;
}

/// Audit store backed by the `desktop_session_events` table.
#[derive(Debug, Clone)]
pub struct SqliteAuditStore {
    pool: SqlitePool,
}

impl SqliteAuditStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Most recent events first, optionally narrowed to one user.
    pub async fn recent(&self, user_id: Option<u64>, limit: u32) -> Result<Vec<AuditRecord>> {
        let records = match user_id {
            Some(user_id) => {
                sqlx::query_as::<_, AuditRecord>(
                    r#"
                    SELECT id, event, user_id, container_id, port, status, session_snapshot,
                           error_message, created_at, terminated_at, recorded_at
                    FROM desktop_session_events
                    WHERE user_id = ?
                    ORDER BY id DESC
                    LIMIT ?
                    "#,
                )
                .bind(to_db_id(user_id))
                .bind(i64::from(limit))
                .fetch_all(&self.pool)
                .await
            }
            None => {
                sqlx::query_as::<_, AuditRecord>(
                    r#"
                    SELECT id, event, user_id, container_id, port, status, session_snapshot,
                           error_message, created_at, terminated_at, recorded_at
                    FROM desktop_session_events
                    ORDER BY id DESC
                    LIMIT ?
                    "#,
                )
                .bind(i64::from(limit))
                .fetch_all(&self.pool)
                .await
            }
        };

        records.context("listing desktop session events")
    }
}

#[async_trait]
impl AuditStore for SqliteAuditStore {
    async fn record(&self, event: &AuditEvent) -> Result<()> {
        let snapshot = event
            .session_snapshot
            .as_ref()
            .map(serde_json::to_string)
            .transpose()
            .context("serializing session snapshot")?;

        sqlx::query(
            r#"
            INSERT INTO desktop_session_events (
                event, user_id, container_id, port, status, session_snapshot,
                error_message, created_at, terminated_at, recorded_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(event.event.to_string())
        .bind(to_db_id(event.user_id))
        .bind(&event.container_id)
        .bind(event.port.map(i64::from))
        .bind(event.status.to_string())
        .bind(snapshot)
        .bind(&event.error_message)
        .bind(event.created_at.map(format_ts))
        .bind(event.terminated_at.map(format_ts))
        .bind(format_ts(Utc::now()))
        .execute(&self.pool)
        .await
        .context("inserting desktop session event")?;

        Ok(())
    }
}

fn format_ts(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn to_db_id(user_id: u64) -> i64 {
    i64::try_from(user_id).unwrap_or(i64::MAX)
}

/// Fire-and-forget handle onto the audit writer.
#[derive(Clone, Default)]
pub struct AuditPublisher {
    tx: Option<mpsc::Sender<AuditEvent>>,
}

impl AuditPublisher {
    /// Start the background writer. The task ends once every publisher clone is dropped.
    pub fn spawn(store: Arc<dyn AuditStore>, capacity: usize) -> (Self, JoinHandle<()>) {
        let (tx, mut rx) = mpsc::channel::<AuditEvent>(capacity.max(1));

        let handle = tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                if let Err(e) = store.record(&event).await {
                    warn!(
                        "Failed to record {} audit event for user {}: {:#}",
                        event.event, event.user_id, e
                    );
                }
            }
            debug!("Audit writer stopped");
        });

        (Self { tx: Some(tx) }, handle)
    }

    /// A publisher that discards everything (audit disabled).
    pub fn disabled() -> Self {
        Self { tx: None }
    }

    pub fn is_enabled(&self) -> bool {
        self.tx.is_some()
    }

    pub fn publish(&self, event: AuditEvent) {
        let Some(tx) = &self.tx else {
            return;
        };

        if let Err(e) = tx.try_send(event) {
            let event = match &e {
                mpsc::error::TrySendError::Full(event) | mpsc::error::TrySendError::Closed(event) => {
                    event
                }
            };
            warn!(
                "Dropping {} audit event for user {}: {}",
                event.event, event.user_id, e
            );
        }
    }
}
