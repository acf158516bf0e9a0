//! Desktop lifecycle tests against a fake container runtime.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use labdesk::audit::AuditPublisher;
use labdesk::container::ContainerState;
use labdesk::desktop::{IdleReaper, RediscoveryReport, TerminateReason};

mod common;
use common::{FakeRuntime, managed_container, test_service};

fn service_with(runtime: &Arc<FakeRuntime>) -> Arc<labdesk::desktop::DesktopSessionService> {
    test_service(runtime.clone(), AuditPublisher::disabled())
}

#[tokio::test]
async fn distinct_users_get_distinct_ports() {
    let runtime = Arc::new(FakeRuntime::default());
    let service = service_with(&runtime);

    let a = service.create_session(7).await.unwrap().into_session();
    let b = service.create_session(8).await.unwrap().into_session();

    assert_eq!(a.port, 6907);
    assert_eq!(b.port, 6908);
    assert_ne!(a.container_id, b.container_id);
    assert_eq!(service.active_count(), 2);
}

#[tokio::test]
async fn creation_is_idempotent() {
    let runtime = Arc::new(FakeRuntime::default());
    let service = service_with(&runtime);

    let first = service.create_session(7).await.unwrap();
    let second = service.create_session(7).await.unwrap();

    assert!(first.is_created());
    assert!(!second.is_created());
    assert_eq!(first.session().session_id, second.session().session_id);
    assert_eq!(runtime.create_calls(), 1);
}

#[tokio::test]
async fn terminate_twice_reports_no_active_session() {
    let runtime = Arc::new(FakeRuntime::default());
    let service = service_with(&runtime);

    let session = service.create_session(7).await.unwrap().into_session();

    let outcome = service.terminate_session(7).await;
    assert!(outcome.success);
    assert!(outcome.cleanup_warnings.is_empty());
    assert!(!runtime.is_running(&session.container_id));
    assert!(service.get_session(7).await.unwrap().is_none());

    let outcome = service.terminate_session(7).await;
    assert!(!outcome.success);
    assert_eq!(outcome.reason, Some(TerminateReason::NoActiveSession));
}

#[tokio::test]
async fn externally_killed_container_heals_registry() {
    let runtime = Arc::new(FakeRuntime::default());
    let service = service_with(&runtime);

    let first = service.create_session(7).await.unwrap().into_session();
    runtime.kill(&first.container_id);

    assert!(service.get_session(7).await.unwrap().is_none());
    assert_eq!(service.active_count(), 0);

    // The next create provisions a fresh container instead of reusing the dead one.
    let second = service.create_session(7).await.unwrap();
    assert!(second.is_created());
    assert_ne!(second.session().container_id, first.container_id);
    assert_eq!(runtime.create_calls(), 2);
}

#[tokio::test]
async fn reaper_evicts_sessions_past_max_age() {
    let runtime = Arc::new(FakeRuntime::default());
    let service = service_with(&runtime);
    let reaper = IdleReaper::new(service.clone(), Duration::from_secs(2 * 60 * 60));

    let session = service.create_session(7).await.unwrap().into_session();
    let created = session.created_at;

    let evicted = reaper
        .sweep_at(created + chrono::Duration::minutes(119))
        .await;
    assert_eq!(evicted, 0);
    assert!(service.get_session(7).await.unwrap().is_some());

    let evicted = reaper
        .sweep_at(created + chrono::Duration::minutes(121))
        .await;
    assert_eq!(evicted, 1);
    assert!(service.get_session(7).await.unwrap().is_none());
    assert!(!runtime.is_running(&session.container_id));

    // Nothing left to reap; locks have been pruned.
    assert_eq!(reaper.sweep_at(Utc::now()).await, 0);
    assert_eq!(service.lock_count(), 0);
}

#[tokio::test]
async fn reaper_spares_session_recreated_mid_sweep() {
    let runtime = Arc::new(FakeRuntime::with_stop_delay(Duration::from_millis(200)));
    let service = service_with(&runtime);

    let slow = service.create_session(7).await.unwrap().into_session();
    let stale = service.create_session(8).await.unwrap().into_session();
    runtime.slow_down_stop(&slow.container_id);

    let reaper = IdleReaper::new(service.clone(), Duration::from_secs(60));
    let later = Utc::now() + chrono::Duration::hours(3);
    let sweep = tokio::spawn(async move { reaper.sweep_at(later).await });

    // While the reaper is stuck stopping user 7, user 8 starts over.
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(service.terminate_session(8).await.success);
    let fresh = service.create_session(8).await.unwrap().into_session();
    assert_ne!(fresh.session_id, stale.session_id);

    assert_eq!(sweep.await.unwrap(), 1);
    assert!(service.get_session(7).await.unwrap().is_none());
    let current = service.get_session(8).await.unwrap().unwrap();
    assert_eq!(current.session_id, fresh.session_id);
    assert!(runtime.is_running(&fresh.container_id));
}

#[tokio::test]
async fn abandoned_request_does_not_leak_a_container() {
    let runtime = Arc::new(FakeRuntime::with_create_delay(Duration::from_millis(100)));
    let service = service_with(&runtime);

    // The caller disconnects while `run -d` is still in flight.
    let abandoned =
        tokio::time::timeout(Duration::from_millis(20), service.create_session(7)).await;
    assert!(abandoned.is_err());

    let retry = service.create_session(7).await.unwrap();
    assert!(!retry.is_created());
    assert_eq!(runtime.create_calls(), 1);
    assert_eq!(runtime.running.lock().unwrap().len(), 1);
}

#[tokio::test]
async fn concurrent_creates_for_one_user_provision_once() {
    let runtime = Arc::new(FakeRuntime::with_create_delay(Duration::from_millis(50)));
    let service = service_with(&runtime);

    let outcomes =
        futures::future::join_all((0..2).map(|_| service.create_session(42))).await;

    let outcomes: Vec<_> = outcomes.into_iter().map(Result::unwrap).collect();
    assert_eq!(runtime.create_calls(), 1);
    assert_eq!(outcomes.iter().filter(|o| o.is_created()).count(), 1);
    assert_eq!(
        outcomes[0].session().session_id,
        outcomes[1].session().session_id
    );
    assert_eq!(service.active_count(), 1);
}

#[tokio::test]
async fn concurrent_creates_for_different_users_proceed() {
    let runtime = Arc::new(FakeRuntime::with_create_delay(Duration::from_millis(20)));
    let service = service_with(&runtime);

    let outcomes =
        futures::future::join_all((1..=5).map(|user| service.create_session(user))).await;

    assert!(outcomes.iter().all(|o| o.as_ref().unwrap().is_created()));
    assert_eq!(runtime.create_calls(), 5);
    assert_eq!(service.active_count(), 5);
}

#[tokio::test]
async fn rediscovery_adopts_labelled_containers() {
    let runtime = Arc::new(FakeRuntime::default());
    runtime.running.lock().unwrap().insert("abc123".to_string());
    *runtime.listed.lock().unwrap() = vec![
        managed_container("abc123", "7", ContainerState::Running),
        managed_container("def456", "8", ContainerState::Exited),
    ];
    let service = service_with(&runtime);

    let report = service.rediscover().await;
    assert_eq!(
        report,
        RediscoveryReport {
            adopted: 1,
            removed: 1,
            skipped: 0,
        }
    );

    let session = service.get_session(7).await.unwrap().unwrap();
    assert_eq!(session.container_id, "abc123");
    assert_eq!(session.port, 6907);
    assert_eq!(session.created_at.timestamp(), 1_714_557_600);

    // Adopted desktops are reused, and an immediate reap catches the old one.
    let outcome = service.create_session(7).await.unwrap();
    assert!(!outcome.is_created());
    assert_eq!(runtime.create_calls(), 0);

    let reaper = IdleReaper::new(service.clone(), Duration::from_secs(2 * 60 * 60));
    assert_eq!(reaper.sweep().await, 1);
}
