//! Desktop session service - orchestrates the per-user desktop lifecycle.
//!
//! Every user owns at most one live desktop. Creation and termination for the
//! same user are serialised through a per-user lock so concurrent requests
//! can't both provision a container; different users proceed in parallel.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use dashmap::DashMap;
use log::{debug, error, info, warn};
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::audit::{AuditEvent, AuditPublisher};
use crate::container::{ContainerConfig, ContainerRuntimeApi, ContainerState};

use super::adapter::{MANAGED_LABEL, RuntimeAdapter, USER_LABEL};
use super::error::{DesktopError, DesktopResult};
use super::models::{CreateOutcome, DesktopSession, ReadyState, TerminateOutcome};
use super::ports::{PortAllocator, parse_user_id};
use super::readiness::{LogMarkerReadiness, ReadinessProbe};
use super::registry::SessionRegistry;

/// Prefix used for container names managed by this service.
pub const CONTAINER_NAME_PREFIX: &str = "labdesk-";

/// Default desktop image.
const DEFAULT_IMAGE: &str = "consol/debian-xfce-vnc:latest";

/// Default host port base; user N is published on `DEFAULT_BASE_PORT + N`.
const DEFAULT_BASE_PORT: u16 = 6900;

/// Port noVNC listens on inside the image.
const DEFAULT_CONTAINER_PORT: u16 = 6901;

/// Configuration for the desktop session service.
#[derive(Debug, Clone)]
pub struct DesktopServiceConfig {
    /// Desktop image to run.
    pub image: String,
    /// Memory cap passed as `--memory`.
    pub memory_limit: Option<String>,
    /// CPU cap passed as `--cpus`.
    pub cpu_limit: Option<String>,
    /// `/dev/shm` size.
    pub shm_size: Option<String>,
    pub cap_drop: Vec<String>,
    pub cap_add: Vec<String>,
    /// Adds `--security-opt no-new-privileges`.
    pub no_new_privileges: bool,
    /// Port the web remote display listens on inside the container.
    pub container_port: u16,
    pub base_port: u16,
    /// Exported to the container as `VNC_PW` when set.
    pub vnc_password: Option<String>,
    /// Exported as `VNC_RESOLUTION`.
    pub resolution: String,
    /// Descriptive OS label reported to clients.
    pub os_type: String,
    /// Host used in the URLs handed back to clients.
    pub public_host: String,
    /// Log substring that marks the desktop as booted.
    pub readiness_marker: String,
    pub readiness_timeout: Duration,
    pub readiness_interval: Duration,
    /// Lines of log tail inspected per readiness probe.
    pub log_tail_lines: u32,
}

impl Default for DesktopServiceConfig {
    fn default() -> Self {
        Self {
            image: DEFAULT_IMAGE.to_string(),
            memory_limit: Some("2g".to_string()),
            cpu_limit: Some("1.5".to_string()),
            shm_size: Some("512m".to_string()),
            cap_drop: vec!["ALL".to_string()],
            cap_add: vec![
                "CHOWN".to_string(),
                "SETUID".to_string(),
                "SETGID".to_string(),
            ],
            no_new_privileges: true,
            container_port: DEFAULT_CONTAINER_PORT,
            base_port: DEFAULT_BASE_PORT,
            vnc_password: None,
            resolution: "1280x800".to_string(),
            os_type: "Ubuntu".to_string(),
            public_host: "localhost".to_string(),
            readiness_marker: "Navigate to this URL".to_string(),
            readiness_timeout: Duration::from_secs(30),
            readiness_interval: Duration::from_secs(2),
            log_tail_lines: 50,
        }
    }
}

/// Outcome of a startup rediscovery pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RediscoveryReport {
    /// Running containers re-registered.
    pub adopted: usize,
    /// Stopped containers removed.
    pub removed: usize,
    /// Containers left alone (bad label, or the user already has a session).
    pub skipped: usize,
}

/// Service for managing desktop sessions.
pub struct DesktopSessionService {
    registry: Arc<SessionRegistry>,
    adapter: RuntimeAdapter,
    readiness: Arc<dyn ReadinessProbe>,
    ports: PortAllocator,
    audit: AuditPublisher,
    locks: DashMap<u64, Arc<Mutex<()>>>,
    config: Arc<DesktopServiceConfig>,
}

/// Everything one provisioning run needs, owned so it can outlive the caller.
struct Provisioning {
    registry: Arc<SessionRegistry>,
    adapter: RuntimeAdapter,
    readiness: Arc<dyn ReadinessProbe>,
    audit: AuditPublisher,
    config: Arc<DesktopServiceConfig>,
    user_id: u64,
    port: u16,
    container_name: String,
    container_config: ContainerConfig,
}

impl DesktopSessionService {
    /// Create a service driving `runtime`, polling readiness from container logs.
    pub fn new(
        runtime: Arc<dyn ContainerRuntimeApi>,
        config: DesktopServiceConfig,
        audit: AuditPublisher,
    ) -> Self {
        let adapter = RuntimeAdapter::new(runtime, config.log_tail_lines);
        let readiness: Arc<dyn ReadinessProbe> =
            Arc::new(LogMarkerReadiness::new(adapter.clone()));

        Self {
            registry: Arc::new(SessionRegistry::new(adapter.clone())),
            adapter,
            readiness,
            ports: PortAllocator::new(config.base_port),
            audit,
            locks: DashMap::new(),
            config: Arc::new(config),
        }
    }

    /// Replace the readiness probe.
    pub fn with_readiness(mut self, readiness: Arc<dyn ReadinessProbe>) -> Self {
        self.readiness = readiness;
        self
    }

    pub fn config(&self) -> &DesktopServiceConfig {
        &self.config
    }

    pub fn registry(&self) -> &SessionRegistry {
        &self.registry
    }

    /// Number of registered sessions.
    pub fn active_count(&self) -> usize {
        self.registry.len()
    }

    fn user_lock(&self, user_id: u64) -> Arc<Mutex<()>> {
        Arc::clone(&self.locks.entry(user_id).or_default())
    }

    /// Drop lock entries nobody is holding or waiting on.
    ///
    /// Entries are only cloned out under the map's shard lock, so a count of
    /// one seen inside `retain` cannot race with a new acquirer.
    pub fn prune_locks(&self) -> usize {
        let before = self.locks.len();
        self.locks.retain(|_, lock| Arc::strong_count(lock) > 1);
        before.saturating_sub(self.locks.len())
    }

    /// Number of entries in the per-user lock table.
    pub fn lock_count(&self) -> usize {
        self.locks.len()
    }

    /// Return the user's live desktop, provisioning one if needed.
    ///
    /// Provisioning runs on its own task holding the user's lock, so a caller
    /// that goes away mid-readiness-poll never leaves an unregistered
    /// container behind.
    pub async fn create_session(&self, user_id: u64) -> DesktopResult<CreateOutcome> {
        let port = self.ports.allocate(user_id)?;

        let guard = self.user_lock(user_id).lock_owned().await;

        if let Some(existing) = self.registry.get(user_id).await {
            debug!(
                "Reusing session {} for user {}",
                existing.session_id, user_id
            );
            return Ok(CreateOutcome::Reused(existing));
        }

        let container_name = format!(
            "{}{}-{}",
            CONTAINER_NAME_PREFIX,
            user_id,
            Uuid::new_v4().simple()
        );
        let provisioning = Provisioning {
            registry: Arc::clone(&self.registry),
            adapter: self.adapter.clone(),
            readiness: Arc::clone(&self.readiness),
            audit: self.audit.clone(),
            config: Arc::clone(&self.config),
            user_id,
            port,
            container_config: self.container_config(&container_name, user_id, port),
            container_name,
        };

        let task = tokio::spawn(async move {
            let _guard = guard;
            provisioning.run().await
        });

        match task.await {
            Ok(result) => result.map(CreateOutcome::Created),
            Err(e) => {
                error!("Provisioning task for user {} failed: {}", user_id, e);
                Err(DesktopError::Provision(format!(
                    "provisioning task failed: {}",
                    e
                )))
            }
        }
    }

    /// The user's live desktop, if any.
    pub async fn get_session(&self, user_id: u64) -> DesktopResult<Option<DesktopSession>> {
        self.ports.allocate(user_id)?;
        Ok(self.registry.get(user_id).await)
    }

    /// Tear down the user's desktop.
    ///
    /// Cleanup failures are reported in the outcome but never keep the
    /// session registered.
    pub async fn terminate_session(&self, user_id: u64) -> TerminateOutcome {
        self.terminate_matching(user_id, None).await
    }

    /// Tear down the user's desktop only if it is still `session_id`.
    ///
    /// A session replaced since the caller looked yields `NoActiveSession`.
    pub async fn terminate_if(&self, user_id: u64, session_id: &str) -> TerminateOutcome {
        self.terminate_matching(user_id, Some(session_id)).await
    }

    async fn terminate_matching(
        &self,
        user_id: u64,
        expected_session: Option<&str>,
    ) -> TerminateOutcome {
        let lock = self.user_lock(user_id);
        let _guard = lock.lock().await;

        let Some(session) = self.registry.get(user_id).await else {
            return TerminateOutcome::no_active_session();
        };

        if let Some(expected) = expected_session
            && session.session_id != expected
        {
            debug!(
                "Session {} for user {} replaced by {}; leaving it alone",
                expected, user_id, session.session_id
            );
            return TerminateOutcome::no_active_session();
        }

        let mut cleanup_warnings = Vec::new();
        if !self.adapter.stop(&session.container_id).await {
            cleanup_warnings.push(format!(
                "failed to stop container {}",
                session.container_id
            ));
        }
        if !self.adapter.remove(&session.container_id).await {
            cleanup_warnings.push(format!(
                "failed to remove container {}",
                session.container_id
            ));
        }

        self.registry.remove(user_id);

        let snapshot = session.terminated();
        self.audit
            .publish(AuditEvent::terminated(&snapshot, Utc::now()));

        if cleanup_warnings.is_empty() {
            info!(
                "Terminated session {} for user {}",
                session.session_id, user_id
            );
        } else {
            warn!(
                "Terminated session {} for user {} with cleanup warnings: {}",
                session.session_id,
                user_id,
                cleanup_warnings.join("; ")
            );
        }

        TerminateOutcome::terminated(snapshot, cleanup_warnings)
    }

    /// Every registered session, ordered by user.
    pub fn list_sessions(&self) -> Vec<DesktopSession> {
        let mut sessions = self.registry.all();
        sessions.sort_by_key(|session| session.user_id);
        sessions
    }

    /// Re-register desktops left running by a previous process and remove
    /// stopped ones.
    pub async fn rediscover(&self) -> RediscoveryReport {
        let mut report = RediscoveryReport::default();

        for container in self.adapter.list_managed().await {
            let Some(user_id) = container
                .label(USER_LABEL)
                .and_then(|raw| parse_user_id(raw).ok())
            else {
                warn!(
                    "Managed container {} has no valid {} label; leaving it alone",
                    container.id, USER_LABEL
                );
                report.skipped += 1;
                continue;
            };

            if container.state != ContainerState::Running {
                if self.adapter.remove(&container.id).await {
                    info!(
                        "Removed stopped desktop container {} for user {}",
                        container.id, user_id
                    );
                    report.removed += 1;
                } else {
                    report.skipped += 1;
                }
                continue;
            }

            let Ok(port) = self.ports.allocate(user_id) else {
                report.skipped += 1;
                continue;
            };

            let lock = self.user_lock(user_id);
            let _guard = lock.lock().await;

            if self.registry.peek(user_id).is_some() {
                report.skipped += 1;
                continue;
            }

            let logs = self.adapter.fetch_recent_logs(&container.id).await;
            let readiness = if logs.contains(&self.config.readiness_marker) {
                ReadyState::Ready
            } else {
                ReadyState::AssumedReady
            };

            let container_name = container
                .names
                .first()
                .cloned()
                .unwrap_or_else(|| container.id.clone());
            let created_at = container.created_at().unwrap_or_else(Utc::now);

            let session = DesktopSession::starting(
                container.id.clone(),
                container_name,
                user_id,
                port,
                &self.config.public_host,
                self.config.os_type.clone(),
                created_at,
            )
            .into_running(readiness);

            info!(
                "Adopted running desktop {} for user {}",
                session.session_id, user_id
            );
            self.registry.put(user_id, session);
            report.adopted += 1;
        }

        report
    }

    /// Terminate every registered session. Returns how many were torn down.
    pub async fn shutdown_all(&self) -> usize {
        let sessions = self.registry.all();
        if sessions.is_empty() {
            return 0;
        }

        info!("Stopping {} desktop sessions", sessions.len());

        let mut terminated = 0;
        for session in sessions {
            if self.terminate_session(session.user_id).await.success {
                terminated += 1;
            }
        }
        terminated
    }

    fn container_config(&self, name: &str, user_id: u64, port: u16) -> ContainerConfig {
        let mut config = ContainerConfig::new(self.config.image.clone())
            .name(name)
            .hostname(format!("desktop-{}", user_id))
            .port(port, self.config.container_port)
            .label(USER_LABEL, user_id.to_string())
            .label(MANAGED_LABEL, "true")
            .env("VNC_RESOLUTION", self.config.resolution.clone());

        if let Some(ref password) = self.config.vnc_password {
            config = config.env("VNC_PW", password.clone());
        }
        if let Some(ref memory) = self.config.memory_limit {
            config = config.memory(memory.clone());
        }
        if let Some(ref cpus) = self.config.cpu_limit {
            config = config.cpus(cpus.clone());
        }
        if let Some(ref shm_size) = self.config.shm_size {
            config = config.shm_size(shm_size.clone());
        }
        for cap in &self.config.cap_drop {
            config = config.cap_drop(cap.clone());
        }
        for cap in &self.config.cap_add {
            config = config.cap_add(cap.clone());
        }
        if self.config.no_new_privileges {
            config = config.security_opt("no-new-privileges");
        }

        config
    }
}

impl Provisioning {
    /// Start the container, wait for readiness and register the session.
    async fn run(self) -> DesktopResult<DesktopSession> {
        let Self {
            registry,
            adapter,
            readiness,
            audit,
            config,
            user_id,
            port,
            container_name,
            container_config,
        } = self;

        info!(
            "Provisioning desktop {} for user {} on port {}",
            container_name, user_id, port
        );

        let container_id = match adapter.create(&container_config).await {
            Ok(id) => id,
            Err(e) => {
                error!("Failed to provision desktop for user {}: {}", user_id, e);
                // A failed port bind can leave a created-but-stopped container.
                adapter.remove(&container_name).await;
                audit.publish(AuditEvent::provision_failed(user_id, port, e.to_string()));
                return Err(e);
            }
        };

        let starting = DesktopSession::starting(
            container_id.clone(),
            container_name,
            user_id,
            port,
            &config.public_host,
            config.os_type.clone(),
            Utc::now(),
        );

        let readiness = readiness
            .wait_until_ready(
                &container_id,
                &config.readiness_marker,
                config.readiness_timeout,
                config.readiness_interval,
            )
            .await;

        let session = starting.into_running(readiness);
        registry.put(user_id, session.clone());
        audit.publish(AuditEvent::created(&session));

        info!(
            "Desktop session {} for user {} is {} ({})",
            session.session_id, user_id, session.status, session.readiness
        );

        Ok(session)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::container::{Container, ContainerError, ContainerResult};
    use crate::desktop::models::{SessionStatus, TerminateReason};
    use async_trait::async_trait;
    use std::collections::{HashMap, HashSet};
    use std::sync::Mutex as StdMutex;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[derive(Default)]
    struct FakeRuntime {
        created: AtomicU32,
        running: StdMutex<HashSet<String>>,
        last_config: StdMutex<Option<ContainerConfig>>,
        listed: StdMutex<Vec<Container>>,
        removed: StdMutex<Vec<String>>,
        fail_create: bool,
        fail_stop: bool,
    }

    #[async_trait]
    impl ContainerRuntimeApi for FakeRuntime {
        async fn create_container(&self, config: &ContainerConfig) -> ContainerResult<String> {
            if self.fail_create {
                return Err(ContainerError::command_failed("run", "port is already allocated"));
            }
            let n = self.created.fetch_add(1, Ordering::SeqCst) + 1;
            let id = format!("container{}", n);
            self.running.lock().unwrap().insert(id.clone());
            *self.last_config.lock().unwrap() = Some(config.clone());
            Ok(id)
        }

        async fn stop_container(
            &self,
            container_id: &str,
            _timeout_seconds: Option<u32>,
        ) -> ContainerResult<()> {
            if self.fail_stop {
                return Err(ContainerError::command_failed("stop", "timeout"));
            }
            self.running.lock().unwrap().remove(container_id);
            Ok(())
        }

        async fn remove_container(&self, container_id: &str, _force: bool) -> ContainerResult<()> {
            self.running.lock().unwrap().remove(container_id);
            self.removed.lock().unwrap().push(container_id.to_string());
            Ok(())
        }

        async fn list_containers(
            &self,
            _all: bool,
            _filter: Option<&str>,
        ) -> ContainerResult<Vec<Container>> {
            Ok(self.listed.lock().unwrap().clone())
        }

        async fn container_state_status(
            &self,
            id_or_name: &str,
        ) -> ContainerResult<Option<String>> {
            let running = self.running.lock().unwrap().contains(id_or_name);
            Ok(running.then(|| "running".to_string()))
        }

        async fn get_logs(&self, _container_id: &str, _tail: Option<u32>) -> ContainerResult<String> {
            Ok("Navigate to this URL: http://localhost:6901/vnc.html".to_string())
        }
    }

    fn service(runtime: Arc<FakeRuntime>) -> DesktopSessionService {
        DesktopSessionService::new(
            runtime,
            DesktopServiceConfig {
                vnc_password: Some("labpass".to_string()),
                ..Default::default()
            },
            AuditPublisher::disabled(),
        )
    }

    #[tokio::test]
    async fn create_provisions_with_hardened_config() {
        let runtime = Arc::new(FakeRuntime::default());
        let service = service(runtime.clone());

        let outcome = service.create_session(7).await.unwrap();
        assert!(outcome.is_created());
        let session = outcome.into_session();
        assert_eq!(session.port, 6907);
        assert_eq!(session.status, SessionStatus::Running);
        assert_eq!(session.readiness, ReadyState::Ready);
        assert!(session.container_name.starts_with("labdesk-7-"));

        let config = runtime.last_config.lock().unwrap().clone().unwrap();
        assert_eq!(config.ports[0].host_port, 6907);
        assert_eq!(config.ports[0].container_port, 6901);
        assert_eq!(config.labels.get(USER_LABEL).map(String::as_str), Some("7"));
        assert_eq!(config.labels.get(MANAGED_LABEL).map(String::as_str), Some("true"));
        assert_eq!(config.env.get("VNC_PW").map(String::as_str), Some("labpass"));
        assert_eq!(config.memory.as_deref(), Some("2g"));
        assert_eq!(config.cap_drop, vec!["ALL".to_string()]);
        assert_eq!(config.security_opts, vec!["no-new-privileges".to_string()]);
    }

    #[tokio::test]
    async fn container_names_are_unique_per_attempt() {
        let runtime = Arc::new(FakeRuntime::default());
        let service = service(runtime.clone());

        let first = service.create_session(7).await.unwrap().into_session();
        service.terminate_session(7).await;
        let second = service.create_session(7).await.unwrap().into_session();

        assert_ne!(first.container_name, second.container_name);
    }

    #[tokio::test]
    async fn invalid_user_has_no_side_effects() {
        let runtime = Arc::new(FakeRuntime::default());
        let service = service(runtime.clone());

        assert!(matches!(
            service.create_session(0).await,
            Err(DesktopError::InvalidUserId(_))
        ));
        assert!(matches!(
            service.get_session(0).await,
            Err(DesktopError::InvalidUserId(_))
        ));
        assert_eq!(runtime.created.load(Ordering::SeqCst), 0);
        assert_eq!(service.lock_count(), 0);
    }

    #[tokio::test]
    async fn provision_failure_registers_nothing() {
        let runtime = Arc::new(FakeRuntime {
            fail_create: true,
            ..Default::default()
        });
        let service = service(runtime.clone());

        assert!(matches!(
            service.create_session(7).await,
            Err(DesktopError::Provision(_))
        ));
        assert_eq!(service.active_count(), 0);

        // The half-created container is force-removed by name.
        let removed = runtime.removed.lock().unwrap().clone();
        assert_eq!(removed.len(), 1);
        assert!(removed[0].starts_with("labdesk-7-"));
    }

    /// Readiness that takes a fixed while and then succeeds.
    struct SlowReadiness(Duration);

    #[async_trait]
    impl ReadinessProbe for SlowReadiness {
        async fn wait_until_ready(
            &self,
            _container_id: &str,
            _marker: &str,
            _timeout: Duration,
            _interval: Duration,
        ) -> ReadyState {
            tokio::time::sleep(self.0).await;
            ReadyState::Ready
        }
    }

    #[tokio::test(start_paused = true)]
    async fn abandoned_create_still_registers() {
        let runtime = Arc::new(FakeRuntime::default());
        let service = service(runtime.clone())
            .with_readiness(Arc::new(SlowReadiness(Duration::from_secs(5))));

        // The caller gives up mid-poll.
        let abandoned =
            tokio::time::timeout(Duration::from_secs(1), service.create_session(7)).await;
        assert!(abandoned.is_err());

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(service.active_count(), 1);

        let retry = service.create_session(7).await.unwrap();
        assert!(!retry.is_created());
        assert_eq!(runtime.created.load(Ordering::SeqCst), 1);
        assert_eq!(runtime.running.lock().unwrap().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn retry_waits_for_abandoned_provisioning() {
        let runtime = Arc::new(FakeRuntime::default());
        let service = service(runtime.clone())
            .with_readiness(Arc::new(SlowReadiness(Duration::from_secs(5))));

        let abandoned =
            tokio::time::timeout(Duration::from_secs(1), service.create_session(7)).await;
        assert!(abandoned.is_err());

        // The provisioning task still holds the user's lock.
        let retry = service.create_session(7).await.unwrap();
        assert!(!retry.is_created());
        assert_eq!(runtime.created.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn terminate_if_spares_replaced_session() {
        let runtime = Arc::new(FakeRuntime::default());
        let service = service(runtime.clone());

        let old = service.create_session(7).await.unwrap().into_session();
        service.terminate_session(7).await;
        let fresh = service.create_session(7).await.unwrap().into_session();

        let outcome = service.terminate_if(7, &old.session_id).await;
        assert!(!outcome.success);
        assert_eq!(outcome.reason, Some(TerminateReason::NoActiveSession));
        assert_eq!(
            service.get_session(7).await.unwrap().map(|s| s.session_id),
            Some(fresh.session_id.clone())
        );

        let outcome = service.terminate_if(7, &fresh.session_id).await;
        assert!(outcome.success);
        assert_eq!(service.active_count(), 0);
    }

    #[tokio::test]
    async fn cleanup_failures_do_not_block_eviction() {
        let runtime = Arc::new(FakeRuntime {
            fail_stop: true,
            ..Default::default()
        });
        let service = service(runtime.clone());
        service.create_session(7).await.unwrap();

        let outcome = service.terminate_session(7).await;
        assert!(outcome.success);
        assert_eq!(outcome.cleanup_warnings.len(), 1);
        assert_eq!(
            outcome.session.map(|s| s.status),
            Some(SessionStatus::Terminated)
        );
        assert_eq!(service.active_count(), 0);
        assert_eq!(runtime.removed.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn prune_locks_drops_idle_entries() {
        let service = service(Arc::new(FakeRuntime::default()));
        service.create_session(7).await.unwrap();
        service.create_session(8).await.unwrap();
        assert_eq!(service.lock_count(), 2);

        let held = service.user_lock(7);
        assert_eq!(service.prune_locks(), 1);
        assert_eq!(service.lock_count(), 1);

        drop(held);
        assert_eq!(service.prune_locks(), 1);
        assert_eq!(service.lock_count(), 0);
    }

    fn managed(id: &str, user: &str, state: ContainerState) -> Container {
        Container {
            id: id.to_string(),
            names: vec![format!("labdesk-{}-old", user)],
            image: DEFAULT_IMAGE.to_string(),
            state,
            created: "1714557600".to_string(),
            labels: HashMap::from([
                (USER_LABEL.to_string(), user.to_string()),
                (MANAGED_LABEL.to_string(), "true".to_string()),
            ]),
        }
    }

    #[tokio::test]
    async fn rediscover_adopts_running_and_removes_stopped() {
        let runtime = Arc::new(FakeRuntime::default());
        runtime.running.lock().unwrap().insert("live1".to_string());
        *runtime.listed.lock().unwrap() = vec![
            managed("live1", "12", ContainerState::Running),
            managed("dead1", "13", ContainerState::Exited),
            managed("weird", "bob", ContainerState::Running),
        ];
        let service = service(runtime.clone());

        let report = service.rediscover().await;
        assert_eq!(
            report,
            RediscoveryReport {
                adopted: 1,
                removed: 1,
                skipped: 1
            }
        );

        let adopted = service.get_session(12).await.unwrap().unwrap();
        assert_eq!(adopted.session_id, "live1");
        assert_eq!(adopted.port, 6912);
        assert_eq!(adopted.container_name, "labdesk-12-old");
        assert_eq!(adopted.created_at.timestamp(), 1_714_557_600);
        assert_eq!(*runtime.removed.lock().unwrap(), vec!["dead1".to_string()]);

        // Adopted sessions are reused rather than reprovisioned.
        let outcome = service.create_session(12).await.unwrap();
        assert!(!outcome.is_created());
        assert_eq!(runtime.created.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn shutdown_all_terminates_everything() {
        let runtime = Arc::new(FakeRuntime::default());
        let service = service(runtime.clone());
        for user in [1, 2, 3] {
            service.create_session(user).await.unwrap();
        }

        assert_eq!(service.shutdown_all().await, 3);
        assert_eq!(service.active_count(), 0);
        assert!(runtime.running.lock().unwrap().is_empty());
        assert_eq!(service.shutdown_all().await, 0);
    }
}
