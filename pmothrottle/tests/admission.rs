use std::{sync::Arc, time::Duration};

use tokio_test::{assert_pending, assert_ready, task};
use tokio_util::sync::CancellationToken;

use pmothrottle::{AdmissionThrottle, ThrottleError, ThrottleSettings};

const WAIT: Duration = Duration::from_millis(200);

fn throttle(capacity: usize) -> AdmissionThrottle {
    AdmissionThrottle::new(ThrottleSettings::new(Some(capacity)))
}

#[tokio::test(start_paused = true)]
async fn third_request_waits_for_a_release() -> Result<(), ThrottleError> {
    let throttle = throttle(2);

    let first = throttle.acquire("alice", WAIT).await?;
    let _second = throttle.acquire("alice", WAIT).await?;
    assert_eq!(throttle.outstanding("alice"), 2);

    let err = throttle.acquire("alice", WAIT).await.unwrap_err();
    assert!(err.is_retryable());
    assert!(matches!(err, ThrottleError::CapacityExceeded { .. }));

    // other identities are not affected
    let _bob = throttle.acquire("bob", WAIT).await?;

    first.release();
    let third = throttle.acquire("alice", WAIT).await?;
    assert_eq!(third.identity(), "alice");
    assert_eq!(throttle.outstanding("alice"), 2);
    Ok(())
}

#[tokio::test]
async fn blocked_acquire_resumes_on_release() {
    let throttle = throttle(1);
    let held = throttle
        .acquire("alice", Duration::from_secs(60))
        .await
        .unwrap();

    let mut waiting = task::spawn(throttle.acquire("alice", Duration::from_secs(60)));
    assert_pending!(waiting.poll());

    drop(held);
    assert!(waiting.is_woken());
    assert!(assert_ready!(waiting.poll()).is_ok());
}

#[tokio::test]
async fn unknown_and_disabled_identities_are_refused() {
    let throttle = AdmissionThrottle::new(
        ThrottleSettings::new(None)
            .with_identity("alice", 1)
            .with_identity("muted", 0),
    );

    assert_eq!(
        throttle.acquire("mallory", WAIT).await.unwrap_err(),
        ThrottleError::Unknown("mallory".into())
    );
    assert_eq!(
        throttle.acquire("muted", WAIT).await.unwrap_err(),
        ThrottleError::Disabled("muted".into())
    );
    assert!(!throttle.try_admit("mallory", WAIT).await);
    assert!(throttle.try_admit("alice", WAIT).await);
}

#[tokio::test(start_paused = true)]
async fn boolean_admission_and_explicit_release() {
    let throttle = throttle(1);

    assert!(throttle.try_admit("alice", WAIT).await);
    assert!(!throttle.try_admit("alice", WAIT).await);
    assert_eq!(throttle.outstanding("alice"), 1);

    assert!(throttle.release("alice"));
    assert!(!throttle.release("alice"));
    assert!(throttle.try_admit("alice", WAIT).await);
}

#[tokio::test(start_paused = true)]
async fn release_ignores_held_permits() -> Result<(), ThrottleError> {
    let throttle = throttle(1);

    let held = throttle.acquire("alice", WAIT).await?;
    assert!(!throttle.release("alice"));
    drop(held);
    assert_eq!(throttle.outstanding("alice"), 0);

    let _first = throttle.acquire("alice", WAIT).await?;
    assert!(matches!(
        throttle.acquire("alice", WAIT).await,
        Err(ThrottleError::CapacityExceeded { .. })
    ));
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn boolean_admission_next_to_a_held_permit() -> Result<(), ThrottleError> {
    let throttle = throttle(2);
    let _held = throttle.acquire("alice", WAIT).await?;
    assert!(throttle.try_admit("alice", WAIT).await);
    assert!(throttle.release("alice"));
    assert!(!throttle.release("alice"));
    let _again = throttle.acquire("alice", WAIT).await?;
    assert!(throttle.acquire("alice", WAIT).await.is_err());
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn growing_admits_waiters_immediately() -> Result<(), ThrottleError> {
    let throttle = throttle(1);
    let _held = throttle.acquire("alice", WAIT).await?;

    throttle.resize("alice", 3).await?;
    assert_eq!(throttle.capacity("alice"), Some(3));

    let _a = throttle.acquire("alice", WAIT).await?;
    let _b = throttle.acquire("alice", WAIT).await?;
    assert!(throttle.acquire("alice", WAIT).await.is_err());
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn shrinking_waits_for_outstanding_admissions() -> Result<(), ThrottleError> {
    let throttle = Arc::new(throttle(3));
    let first = throttle.acquire("alice", WAIT).await?;
    let second = throttle.acquire("alice", WAIT).await?;
    let third = throttle.acquire("alice", WAIT).await?;

    let resizer = {
        let throttle = throttle.clone();
        tokio::spawn(async move { throttle.resize("alice", 1).await })
    };
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert!(!resizer.is_finished());

    // a second resize while the first one waits
    assert_eq!(
        throttle.resize("alice", 5).await.unwrap_err(),
        ThrottleError::ResizeInProgress("alice".into())
    );

    drop(first);
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert!(!resizer.is_finished());

    drop(second);
    resizer.await.expect("resize task panicked")?;
    assert_eq!(throttle.capacity("alice"), Some(1));
    assert_eq!(throttle.outstanding("alice"), 1);

    drop(third);

    let _only = throttle.acquire("alice", WAIT).await?;
    assert!(throttle.acquire("alice", WAIT).await.is_err());
    Ok(())
}

#[tokio::test]
async fn resize_can_enable_a_disabled_identity() -> Result<(), ThrottleError> {
    let throttle = AdmissionThrottle::new(ThrottleSettings::new(Some(0)));
    assert!(throttle.acquire("alice", WAIT).await.is_err());

    throttle.resize("alice", 1).await?;
    let _permit = throttle.acquire("alice", WAIT).await?;

    assert_eq!(
        throttle.resize("ghost", 1).await.err(),
        None,
        "default capacity makes every identity known"
    );
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn sweep_keeps_busy_identities() -> Result<(), ThrottleError> {
    let throttle = Arc::new(throttle(1));

    let held = throttle.acquire("busy", WAIT).await?;
    drop(throttle.acquire("idle", WAIT).await?);
    assert!(throttle.try_admit("manual", WAIT).await);

    // a waiter keeps its identity alive even with nothing admitted yet
    let waiter = {
        let throttle = throttle.clone();
        tokio::spawn(async move { throttle.acquire("busy", Duration::from_secs(5)).await })
    };
    tokio::task::yield_now().await;

    assert_eq!(throttle.len(), 3);
    assert_eq!(throttle.sweep(), 1);
    assert_eq!(throttle.capacity("idle"), None);
    assert_eq!(throttle.capacity("busy"), Some(1));
    assert_eq!(throttle.capacity("manual"), Some(1));

    drop(held);
    drop(waiter.await.expect("waiter panicked")?);
    throttle.release("manual");
    assert_eq!(throttle.sweep(), 2);
    assert!(throttle.is_empty());
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn sweeper_task_runs_until_cancelled() -> Result<(), ThrottleError> {
    let throttle = Arc::new(throttle(1));
    drop(throttle.acquire("alice", WAIT).await?);
    assert_eq!(throttle.len(), 1);

    let token = CancellationToken::new();
    let sweeper = throttle
        .clone()
        .spawn_sweeper(Duration::from_secs(30), token.clone());

    tokio::time::sleep(Duration::from_secs(31)).await;
    assert!(throttle.is_empty());

    token.cancel();
    sweeper.await.expect("sweeper panicked");
    Ok(())
}
