mod common;

use chrono::TimeDelta;
use common::{service_over, FaultyStore};
use ratekeeper::{
    BucketState, Decision, InMemoryStore, ReduceRequest, ReduceResponse, ServiceError, Status,
    Store,
};
use std::sync::atomic::Ordering;
use std::time::Duration;

#[tokio::test]
async fn exhausts_then_refills_after_one_interval() {
    let (service, clock) = service_over(InMemoryStore::new());
    let request = ReduceRequest::new("sms:543", 3, 1, 60);

    for expected in [2, 1, 0] {
        let resp = service.reduce(&request).await.expect("store available");
        assert_eq!(resp, ReduceResponse { status: Status::Ok, remaining: expected });
    }
    for _ in 0..3 {
        let resp = service.reduce(&request).await.expect("store available");
        assert_eq!(resp, ReduceResponse { status: Status::Ng, remaining: 0 });
    }

    clock.advance(TimeDelta::seconds(59));
    assert_eq!(service.reduce(&request).await.unwrap().status, Status::Ng);
    clock.advance(TimeDelta::seconds(1));
    assert_eq!(
        service.reduce(&request).await.unwrap(),
        ReduceResponse { status: Status::Ok, remaining: 0 }
    );
}

#[tokio::test]
async fn one_at_a_time_gate_reopens_after_interval() {
    let (service, clock) = service_over(InMemoryStore::new());
    let request = ReduceRequest::new("gate", 1, 1, 60);

    assert_eq!(service.decide(&request).await.unwrap(), Decision::Allowed { remaining: 0 });
    assert_eq!(service.decide(&request).await.unwrap(), Decision::Denied { remaining: 0 });
    clock.advance(TimeDelta::seconds(60));
    assert_eq!(service.decide(&request).await.unwrap(), Decision::Allowed { remaining: 0 });
}

#[tokio::test]
async fn partial_refill_keeps_phase_in_storage() {
    let (service, clock) = service_over(InMemoryStore::new());
    let request = ReduceRequest::new("phase", 40, 5, 10);
    let key = "phase.max=40.rd=10.ra=5";

    // Drain the bucket.
    for _ in 0..40 {
        assert!(service.decide(&request).await.unwrap().is_allowed());
    }
    assert!(!service.decide(&request).await.unwrap().is_allowed());

    clock.advance(TimeDelta::seconds(19));
    assert_eq!(service.decide(&request).await.unwrap(), Decision::Allowed { remaining: 4 });
    let state = BucketState::decode(&service.store().read(key).await.unwrap().unwrap()).unwrap();
    assert_eq!(state.last_refilled_at, common::start() + TimeDelta::seconds(10));
    assert_eq!(state.last_reduced_at, common::start() + TimeDelta::seconds(19));

    // The 9s carried over plus 1s completes the next interval.
    clock.advance(TimeDelta::seconds(1));
    assert_eq!(service.decide(&request).await.unwrap(), Decision::Allowed { remaining: 8 });
}

#[tokio::test]
async fn differing_limits_never_share_state() {
    let (service, _clock) = service_over(InMemoryStore::new());
    let tight = ReduceRequest::new("user:1", 1, 1, 60);
    let loose = ReduceRequest::new("user:1", 10, 1, 60);
    let slow = ReduceRequest::new("user:1", 1, 1, 120);

    assert_eq!(service.decide(&tight).await.unwrap(), Decision::Allowed { remaining: 0 });
    assert_eq!(service.decide(&tight).await.unwrap(), Decision::Denied { remaining: 0 });
    assert_eq!(service.decide(&loose).await.unwrap(), Decision::Allowed { remaining: 9 });
    assert_eq!(service.decide(&slow).await.unwrap(), Decision::Allowed { remaining: 0 });
    assert_eq!(service.store().len(), 3);
}

#[tokio::test]
async fn invalid_request_leaves_no_trace() {
    let (service, _clock) = service_over(InMemoryStore::new());
    let invalid = ReduceRequest::new("k", 3, 4, 60);
    let resp = service.reduce(&invalid).await.unwrap();
    assert_eq!(resp, ReduceResponse { status: Status::Error, remaining: 0 });
    assert!(service.store().is_empty());

    let valid = ReduceRequest::new("k", 3, 0, 60);
    assert_eq!(service.decide(&valid).await.unwrap(), Decision::Allowed { remaining: 2 });
}

#[tokio::test]
async fn set_failure_aborts_and_surfaces_as_error() {
    let store = FaultyStore::default();
    let (service, _clock) = service_over(store.clone());
    store.fail_set.store(true, Ordering::SeqCst);

    let err = service.decide(&ReduceRequest::new("k", 2, 0, 1)).await.unwrap_err();
    assert!(matches!(err, ServiceError::Store(_)));
    assert_eq!(store.aborts.load(Ordering::SeqCst), 1);
    assert!(store.inner.is_empty());

    store.fail_set.store(false, Ordering::SeqCst);
    assert_eq!(
        service.decide(&ReduceRequest::new("k", 2, 0, 1)).await.unwrap(),
        Decision::Allowed { remaining: 1 }
    );
    assert_eq!(store.aborts.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn timed_out_request_leaves_state_untouched() {
    let store = FaultyStore::default();
    let (service, _clock) = service_over(store.clone());
    let request = ReduceRequest::new("slow", 2, 0, 60);
    service.decide(&request).await.unwrap();
    let before = store.read("slow.max=2.rd=60.ra=2").await.unwrap();

    store.stall_commit.store(true, Ordering::SeqCst);
    let timed_out = tokio::time::timeout(Duration::from_millis(50), service.decide(&request)).await;
    assert!(timed_out.is_err());
    assert_eq!(store.aborts.load(Ordering::SeqCst), 1);
    assert_eq!(store.read("slow.max=2.rd=60.ra=2").await.unwrap(), before);

    // The key lock was released by the abort.
    store.stall_commit.store(false, Ordering::SeqCst);
    let decision = tokio::time::timeout(Duration::from_secs(1), service.decide(&request))
        .await
        .expect("lock released")
        .unwrap();
    assert_eq!(decision, Decision::Allowed { remaining: 0 });
}
