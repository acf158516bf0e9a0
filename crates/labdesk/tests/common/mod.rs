//! Test utilities and common setup.
#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Result, anyhow};
use async_trait::async_trait;
use axum::Router;
use axum::body::Body;
use axum::http::{Method, Request, Response};
use serde_json::Value;
use tower::ServiceExt;

use labdesk::api::{AppState, create_app};
use labdesk::audit::{AuditEvent, AuditPublisher, AuditStore};
use labdesk::auth::{AuthConfig, AuthState, DevUser, Role};
use labdesk::container::{
    Container, ContainerConfig, ContainerError, ContainerResult, ContainerRuntimeApi,
    ContainerState,
};
use labdesk::desktop::{DesktopServiceConfig, DesktopSessionService, MANAGED_LABEL, USER_LABEL};

pub const READY_BANNER: &str = "Navigate to this URL: http://localhost:6901/vnc.html";

/// In-memory stand-in for docker/podman.
#[derive(Default)]
pub struct FakeRuntime {
    pub created: AtomicU32,
    pub running: Mutex<HashSet<String>>,
    pub listed: Mutex<Vec<Container>>,
    pub fail_create: AtomicBool,
    /// Simulated `run -d` latency.
    pub create_delay: Option<Duration>,
    /// Containers whose `stop` takes `stop_delay`.
    pub slow_stops: Mutex<HashSet<String>>,
    pub stop_delay: Duration,
}

impl FakeRuntime {
    pub fn with_create_delay(delay: Duration) -> Self {
        Self {
            create_delay: Some(delay),
            ..Default::default()
        }
    }

    pub fn create_calls(&self) -> u32 {
        self.created.load(Ordering::SeqCst)
    }

    pub fn is_running(&self, container_id: &str) -> bool {
        self.running.lock().unwrap().contains(container_id)
    }

    /// Simulate someone running `docker kill` behind our back.
    pub fn kill(&self, container_id: &str) {
        self.running.lock().unwrap().remove(container_id);
    }

    pub fn with_stop_delay(delay: Duration) -> Self {
        Self {
            stop_delay: delay,
            ..Default::default()
        }
    }

    /// Make `stop` on this container take `stop_delay`.
    pub fn slow_down_stop(&self, container_id: &str) {
        self.slow_stops
            .lock()
            .unwrap()
            .insert(container_id.to_string());
    }

    pub fn set_fail_create(&self, fail: bool) {
        self.fail_create.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl ContainerRuntimeApi for FakeRuntime {
    async fn create_container(&self, _config: &ContainerConfig) -> ContainerResult<String> {
        if let Some(delay) = self.create_delay {
            tokio::time::sleep(delay).await;
        }
        if self.fail_create.load(Ordering::SeqCst) {
            return Err(ContainerError::CommandFailed {
                command: "run".to_string(),
                message: "Bind for 0.0.0.0:6907 failed: port is already allocated".to_string(),
            });
        }

        let n = self.created.fetch_add(1, Ordering::SeqCst) + 1;
        let id = format!("c0ffee{:06}", n);
        self.running.lock().unwrap().insert(id.clone());
        Ok(id)
    }

    async fn stop_container(
        &self,
        container_id: &str,
        _timeout_seconds: Option<u32>,
    ) -> ContainerResult<()> {
        let slow = self.slow_stops.lock().unwrap().contains(container_id);
        if slow {
            tokio::time::sleep(self.stop_delay).await;
        }
        self.running.lock().unwrap().remove(container_id);
        Ok(())
    }

    async fn remove_container(&self, container_id: &str, _force: bool) -> ContainerResult<()> {
        self.running.lock().unwrap().remove(container_id);
        Ok(())
    }

    async fn list_containers(
        &self,
        _all: bool,
        _filter: Option<&str>,
    ) -> ContainerResult<Vec<Container>> {
        Ok(self.listed.lock().unwrap().clone())
    }

    async fn container_state_status(&self, id_or_name: &str) -> ContainerResult<Option<String>> {
        Ok(self
            .is_running(id_or_name)
            .then(|| "running".to_string()))
    }

    async fn get_logs(&self, _container_id: &str, _tail: Option<u32>) -> ContainerResult<String> {
        Ok(format!("Starting noVNC\n{}\n", READY_BANNER))
    }
}

/// Audit store whose every write fails.
pub struct FailingAuditStore {
    pub attempts: AtomicU32,
}

#[async_trait]
impl AuditStore for FailingAuditStore {
    async fn record(&self, _event: &AuditEvent) -> Result<()> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        Err(anyhow!("database is locked"))
    }
}

fn dev_user(id: &str, name: &str, role: Role) -> DevUser {
    DevUser {
        id: id.to_string(),
        name: name.to_string(),
        email: format!("{}@lms.test", name.to_lowercase()),
        role,
    }
}

/// Dev-mode auth with a learner (7), a second learner (8), an admin (1) and
/// a user whose id is not numeric.
pub fn test_auth_config() -> AuthConfig {
    AuthConfig {
        dev_mode: true,
        jwt_secret: Some("test-secret-for-integration-tests-minimum-32-chars".to_string()),
        dev_users: vec![
            dev_user("7", "Learner", Role::User),
            dev_user("8", "Other", Role::User),
            dev_user("1", "Admin", Role::Admin),
            dev_user("alice", "Alice", Role::User),
        ],
        allowed_origins: Vec::new(),
        ..Default::default()
    }
}

pub fn test_service_config() -> DesktopServiceConfig {
    DesktopServiceConfig {
        readiness_timeout: Duration::from_millis(200),
        readiness_interval: Duration::from_millis(50),
        ..Default::default()
    }
}

pub struct TestApp {
    pub router: Router,
    pub service: Arc<DesktopSessionService>,
    pub runtime: Arc<FakeRuntime>,
    pub auth: AuthState,
}

pub fn test_service(runtime: Arc<FakeRuntime>, audit: AuditPublisher) -> Arc<DesktopSessionService> {
    Arc::new(DesktopSessionService::new(
        runtime,
        test_service_config(),
        audit,
    ))
}

pub fn test_app_with(runtime: Arc<FakeRuntime>, audit: AuditPublisher) -> TestApp {
    let service = test_service(runtime.clone(), audit);
    let auth = AuthState::new(test_auth_config());
    let router = create_app(AppState::new(service.clone(), auth.clone()));

    TestApp {
        router,
        service,
        runtime,
        auth,
    }
}

pub fn test_app() -> TestApp {
    test_app_with(Arc::new(FakeRuntime::default()), AuditPublisher::disabled())
}

/// A managed container as `ps --format json` would report it.
pub fn managed_container(id: &str, user: &str, state: ContainerState) -> Container {
    let mut labels = HashMap::new();
    labels.insert(MANAGED_LABEL.to_string(), "true".to_string());
    labels.insert(USER_LABEL.to_string(), user.to_string());

    Container {
        id: id.to_string(),
        names: vec![format!("labdesk-{}-previous", user)],
        image: "consol/debian-xfce-vnc:latest".to_string(),
        state,
        created: "1714557600".to_string(),
        labels,
    }
}

pub fn request(method: Method, uri: &str, dev_user: Option<&str>) -> Request<Body> {
    let mut builder = Request::builder().method(method).uri(uri);
    if let Some(user) = dev_user {
        builder = builder.header("X-Dev-User", user);
    }
    builder.body(Body::empty()).unwrap()
}

pub async fn send(router: &Router, req: Request<Body>) -> Response<Body> {
    router.clone().oneshot(req).await.unwrap()
}

pub async fn body_json(response: Response<Body>) -> Value {
    let body = axum::body::to_bytes(response.into_body(), 1024 * 1024)
        .await
        .unwrap();
    serde_json::from_slice(&body).unwrap()
}
