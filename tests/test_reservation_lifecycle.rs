mod common;

use futures::future::join_all;
use std::sync::Arc;
use std::time::Duration;

use common::{MockBackend, criteria, eventually, test_config, wait_for, wait_for_state};
use nsi_provider_agent::domain::clock::clock::WallClock;
use nsi_provider_agent::domain::clock::clock_mock::MockClock;
use nsi_provider_agent::domain::provider::backend::nrm_backend_trait::BackendOperation;
use nsi_provider_agent::domain::provider::provider_agent::ProviderAgent;
use nsi_provider_agent::domain::provider::reservation::notification::{NotificationKind, ResultKind};
use nsi_provider_agent::domain::provider::reservation::reservation::ReservationState;
use nsi_provider_agent::error::Error;

async fn start(backend: Arc<MockBackend>) -> ProviderAgent {
    ProviderAgent::start(test_config(), backend, WallClock::shared()).await.unwrap()
}

async fn start_with_clock(backend: Arc<MockBackend>, clock: &MockClock) -> ProviderAgent {
    ProviderAgent::start(test_config(), backend, Arc::new(clock.clone())).await.unwrap()
}

#[tokio::test]
async fn test_full_lifecycle() {
    let backend = MockBackend::new();
    let agent = start(backend.clone()).await;

    let reserved = agent.submit_reserve(criteria(), Some("urn:global:1".into()), Some("demo".into())).await.unwrap();
    assert_eq!(reserved.state, ReservationState::Reserved);
    assert_eq!(reserved.version, 1);
    assert!(reserved.reserve_deadline.is_some());
    let id = reserved.id.clone();

    wait_for(&agent, &id, |r| r.backend_handle.is_some()).await;

    let committed = agent.submit_reserve_commit(&id, Some(1)).await.unwrap();
    assert_eq!(committed.state, ReservationState::Committed);
    assert_eq!(committed.version, 2);

    let provisioning = agent.submit_provision(&id, None).await.unwrap();
    assert_eq!(provisioning.state, ReservationState::Provisioning);
    let provisioned = wait_for_state(&agent, &id, ReservationState::Provisioned).await;
    assert_eq!(provisioned.version, 4);

    agent.submit_release(&id, None).await.unwrap();
    wait_for_state(&agent, &id, ReservationState::Released).await;

    let terminated = agent.submit_terminate(&id, None).await.unwrap();
    assert_eq!(terminated.state, ReservationState::Terminated);
    assert_eq!(terminated.version, 7);
    assert_eq!(terminated.global_reservation_id.as_deref(), Some("urn:global:1"));

    assert_eq!(
        terminated.states_visited(),
        vec![
            ReservationState::Created,
            ReservationState::Reserved,
            ReservationState::Committed,
            ReservationState::Provisioning,
            ReservationState::Provisioned,
            ReservationState::Releasing,
            ReservationState::Released,
            ReservationState::Terminated,
        ]
    );
    let versions: Vec<u64> = terminated.transitions.iter().map(|t| t.version).collect();
    assert_eq!(versions, vec![1, 2, 3, 4, 5, 6, 7]);

    eventually("terminate confirmed", || {
        agent.query_results(&id, None).unwrap().iter().any(|r| r.kind == ResultKind::TerminateConfirmed)
    })
    .await;
    assert_eq!(backend.calls(BackendOperation::Terminate), 1);
    let kinds: Vec<ResultKind> = agent.query_results(&id, None).unwrap().iter().map(|r| r.kind).collect();
    for expected in [
        ResultKind::ReserveConfirmed,
        ResultKind::ReserveCommitConfirmed,
        ResultKind::ProvisionConfirmed,
        ResultKind::ReleaseConfirmed,
        ResultKind::TerminateConfirmed,
    ] {
        assert!(kinds.contains(&expected), "missing {:?} in {:?}", expected, kinds);
    }

    agent.shutdown().await;
}

#[tokio::test]
async fn test_commit_before_and_after_deadline() {
    let clock = MockClock::new(0);
    let agent = start_with_clock(MockBackend::new(), &clock).await;

    let a = agent.submit_reserve(criteria(), None, None).await.unwrap().id;
    let b = agent.submit_reserve(criteria(), None, None).await.unwrap().id;

    clock.set_time_in_s(60);
    let committed = agent.submit_reserve_commit(&a, None).await.unwrap();
    assert_eq!(committed.state, ReservationState::Committed);

    clock.set_time_in_s(121);
    let result = agent.submit_reserve_commit(&b, None).await;
    assert!(matches!(result, Err(Error::Timeout { .. })), "unexpected {:?}", result);
    assert_eq!(agent.query_state(&b).await.unwrap().state, ReservationState::Expired);

    // The committed reservation is not touched by its (cancelled) sweep.
    tokio::time::sleep(Duration::from_millis(50)).await;
    let a_state = agent.query_state(&a).await.unwrap();
    assert_eq!(a_state.state, ReservationState::Committed);
    assert_eq!(a_state.version, 2);

    agent.shutdown().await;
}

#[tokio::test]
async fn test_reserve_expires_without_commit() {
    let clock = MockClock::new(0);
    let agent = start_with_clock(MockBackend::new(), &clock).await;

    let id = agent.submit_reserve(criteria(), None, None).await.unwrap().id;
    clock.advance(Duration::from_secs(121));

    let expired = wait_for_state(&agent, &id, ReservationState::Expired).await;
    assert_eq!(expired.version, 2);

    let notifications = agent.query_notifications(&id, None).unwrap();
    assert_eq!(notifications.len(), 1);
    assert_eq!(notifications[0].kind, NotificationKind::ReserveTimeout);

    // Expiry already won: a late commit is a timeout, not an invalid transition.
    assert!(matches!(agent.submit_reserve_commit(&id, None).await, Err(Error::Timeout { .. })));

    agent.shutdown().await;
}

#[tokio::test]
async fn test_invalid_transition_leaves_reservation_unchanged() {
    let agent = start(MockBackend::new()).await;
    let reserved = agent.submit_reserve(criteria(), None, None).await.unwrap();

    let result = agent.submit_provision(&reserved.id, None).await;
    assert!(matches!(
        result,
        Err(Error::InvalidTransition { state: ReservationState::Reserved, .. })
    ));

    let release = agent.submit_release(&reserved.id, None).await;
    assert!(matches!(release, Err(Error::InvalidTransition { .. })));

    let after = agent.query_state(&reserved.id).await.unwrap();
    assert_eq!(after.state, ReservationState::Reserved);
    assert_eq!(after.version, 1);
    assert_eq!(after.transitions.len(), 1);

    agent.shutdown().await;
}

#[tokio::test]
async fn test_invalid_criteria_creates_nothing() {
    let agent = start(MockBackend::new()).await;
    let mut bad = criteria();
    bad.bandwidth = 0;

    assert!(matches!(agent.submit_reserve(bad, None, None).await, Err(Error::InvalidCriteria(_))));
    assert!(agent.records().await.unwrap().is_empty());

    agent.shutdown().await;
}

#[tokio::test]
async fn test_provision_failing_three_times_fails_reservation() {
    let backend = MockBackend::new();
    backend.fail(BackendOperation::Provision, 3, true);
    let agent = start(backend.clone()).await;

    let id = agent.submit_reserve(criteria(), None, None).await.unwrap().id;
    wait_for(&agent, &id, |r| r.backend_handle.is_some()).await;
    agent.submit_reserve_commit(&id, None).await.unwrap();
    agent.submit_provision(&id, None).await.unwrap();

    let failed = wait_for_state(&agent, &id, ReservationState::Failed).await;
    assert!(failed.last_error.as_deref().unwrap_or_default().contains("injected failure"));
    assert_eq!(backend.calls(BackendOperation::Provision), 3);

    let notifications = agent.query_notifications(&id, None).unwrap();
    assert!(notifications.iter().any(|n| n.kind == NotificationKind::ErrorEvent));

    // A failed reservation can still be terminated.
    let terminated = agent.submit_terminate(&id, None).await.unwrap();
    assert_eq!(terminated.state, ReservationState::Terminated);

    agent.shutdown().await;
}

#[tokio::test]
async fn test_permanent_failure_is_not_retried() {
    let backend = MockBackend::new();
    backend.fail(BackendOperation::Reserve, 1, false);
    let agent = start(backend.clone()).await;

    let id = agent.submit_reserve(criteria(), None, None).await.unwrap().id;
    let failed = wait_for_state(&agent, &id, ReservationState::Failed).await;

    assert_eq!(backend.calls(BackendOperation::Reserve), 1);
    assert!(failed.last_error.is_some());
    assert!(agent.query_results(&id, None).unwrap().iter().any(|r| r.kind == ResultKind::ReserveFailed));

    agent.shutdown().await;
}

#[tokio::test]
async fn test_terminate_uncommitted_skips_backend() {
    let backend = MockBackend::new();
    let agent = start(backend.clone()).await;

    let id = agent.submit_reserve(criteria(), None, None).await.unwrap().id;
    wait_for(&agent, &id, |r| r.backend_handle.is_some()).await;

    let terminated = agent.submit_terminate(&id, None).await.unwrap();
    assert_eq!(terminated.state, ReservationState::Terminated);
    assert!(!terminated.allocated);

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(backend.calls(BackendOperation::Terminate), 0);
    assert!(agent.query_results(&id, None).unwrap().iter().any(|r| r.kind == ResultKind::TerminateConfirmed));

    agent.shutdown().await;
}

#[tokio::test]
async fn test_stale_version_is_reported() {
    let agent = start(MockBackend::new()).await;
    let id = agent.submit_reserve(criteria(), None, None).await.unwrap().id;

    match agent.submit_reserve_commit(&id, Some(0)).await {
        Err(Error::StaleVersion { expected, actual, .. }) => {
            assert_eq!(expected, 0);
            assert_eq!(actual, 1);
        }
        other => panic!("expected StaleVersion, got {:?}", other),
    }
    assert_eq!(agent.query_state(&id).await.unwrap().state, ReservationState::Reserved);

    agent.shutdown().await;
}

#[tokio::test]
async fn test_release_during_provisioning_discards_stale_confirmation() {
    let backend = MockBackend::new();
    backend.set_latency(BackendOperation::Provision, Duration::from_millis(200));
    let agent = start(backend.clone()).await;

    let id = agent.submit_reserve(criteria(), None, None).await.unwrap().id;
    wait_for(&agent, &id, |r| r.backend_handle.is_some()).await;
    agent.submit_reserve_commit(&id, None).await.unwrap();
    agent.submit_provision(&id, None).await.unwrap();

    let releasing = agent.submit_release(&id, None).await.unwrap();
    assert_eq!(releasing.state, ReservationState::Releasing);

    let released = wait_for_state(&agent, &id, ReservationState::Released).await;
    assert!(!released.states_visited().contains(&ReservationState::Provisioned));
    assert_eq!(backend.calls(BackendOperation::Provision), 1);
    assert_eq!(backend.calls(BackendOperation::Release), 1);

    agent.shutdown().await;
}

#[tokio::test]
async fn test_commit_and_sweep_race_has_one_winner() {
    let clock = MockClock::new(0);
    let agent = start_with_clock(MockBackend::new(), &clock).await;

    let mut ids = Vec::new();
    for _ in 0..20 {
        ids.push(agent.submit_reserve(criteria(), None, None).await.unwrap().id);
    }

    // Exactly at the deadline both the sweeps and the commits are eligible.
    clock.set_time_in_s(120);
    let commits = join_all(ids.iter().map(|id| agent.submit_reserve_commit(id, None))).await;

    for (id, commit) in ids.iter().zip(commits) {
        assert!(matches!(commit, Err(Error::Timeout { .. })));
        let reservation = agent.query_state(id).await.unwrap();
        assert_eq!(reservation.state, ReservationState::Expired);
        assert_eq!(reservation.version, 2, "double transition on {}", id);
    }

    agent.shutdown().await;
}

#[tokio::test]
async fn test_commit_just_before_deadline_wins() {
    let clock = MockClock::new(0);
    let agent = start_with_clock(MockBackend::new(), &clock).await;

    let ids: Vec<_> = join_all((0..10).map(|_| agent.submit_reserve(criteria(), None, None)))
        .await
        .into_iter()
        .map(|r| r.unwrap().id)
        .collect();

    clock.set_time_in_ms(119_999);
    let commits = join_all(ids.iter().map(|id| agent.submit_reserve_commit(id, None))).await;
    assert!(commits.iter().all(|c| c.is_ok()));

    clock.set_time_in_s(200);
    tokio::time::sleep(Duration::from_millis(50)).await;
    for id in &ids {
        let reservation = agent.query_state(id).await.unwrap();
        assert_eq!(reservation.state, ReservationState::Committed);
        assert_eq!(reservation.version, 2);
    }

    agent.shutdown().await;
}
