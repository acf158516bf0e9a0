//! In-memory index of live desktop sessions.

use dashmap::DashMap;
use log::info;

use super::adapter::RuntimeAdapter;
use super::models::DesktopSession;

/// Authoritative `user_id -> session` map.
///
/// Reads through [`SessionRegistry::get`] revalidate liveness and evict dead
/// entries, so callers never see a session whose container is gone.
pub struct SessionRegistry {
    sessions: DashMap<u64, DesktopSession>,
    adapter: RuntimeAdapter,
}

impl SessionRegistry {
    pub fn new(adapter: RuntimeAdapter) -> Self {
        Self {
            sessions: DashMap::new(),
            adapter,
        }
    }

    /// Live session for `user_id`, evicting it if its container is not running.
    ///
    /// An evicted container is force-removed, best effort.
    pub async fn get(&self, user_id: u64) -> Option<DesktopSession> {
        // Clone out so no shard lock is held across the liveness await.
        let session = self.peek(user_id)?;

        if self.adapter.is_running(&session.container_id).await {
            return Some(session);
        }

        // Only evict if nobody replaced the entry while we were checking.
        let evicted = self
            .sessions
            .remove_if(&user_id, |_, current| current.session_id == session.session_id);
        if evicted.is_some() {
            info!(
                "Evicted session {} for user {}: container no longer running",
                session.session_id, user_id
            );
            // Exited containers still pin their name, and a container the
            // runtime merely failed to report may still hold the port.
            self.adapter.remove(&session.container_id).await;
        }

        None
    }

    /// Current entry without a liveness check.
    pub fn peek(&self, user_id: u64) -> Option<DesktopSession> {
        self.sessions.get(&user_id).map(|entry| entry.value().clone())
    }

    pub fn put(&self, user_id: u64, session: DesktopSession) {
        self.sessions.insert(user_id, session);
    }

    pub fn remove(&self, user_id: u64) -> Option<DesktopSession> {
        self.sessions.remove(&user_id).map(|(_, session)| session)
    }

    /// Snapshot of every entry. No liveness checks.
    pub fn all(&self) -> Vec<DesktopSession> {
        self.sessions
            .iter()
            .map(|entry| entry.value().clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}
