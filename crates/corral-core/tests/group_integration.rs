//! End-to-end tests for the task group against realistic batches.
#![cfg_attr(
    test,
    allow(
        clippy::expect_used,
        clippy::unwrap_used,
        clippy::panic,
        clippy::tests_outside_test_module,
        clippy::min_ident_chars,
        reason = "Test allows"
    )
)]

use std::time::Duration;

use corral_core::{CancelReason, Error, Group, RunContext};
use tokio::time::sleep;
use tokio_test::{assert_err, assert_ok};

/// Mirrors a typical fan-out: N independent service updates collected in
/// submission order.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn update_services_in_parallel() {
    let services = ["database", "cache", "gateway"];
    let mut group = Group::new();
    for service in services {
        group.queue(move |_ctx, _index| async move {
            sleep(Duration::from_millis(5)).await;
            Ok(format!("service {service} updated"))
        });
    }
    let values = assert_ok!(group.wait(&RunContext::new()).await);
    assert_eq!(
        values,
        vec![
            "service database updated".to_owned(),
            "service cache updated".to_owned(),
            "service gateway updated".to_owned(),
        ]
    );
}

/// A capped batch where some operations fail: the survivors still run to
/// completion and every failure is reported.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn capped_batch_reports_every_failure() {
    let mut group = Group::new();
    group.set_max_concurrent(2);
    for index in 0..6usize {
        group.queue(move |_ctx, _queued_index| async move {
            sleep(Duration::from_millis(2)).await;
            if index % 3 == 0 {
                Err(Error::Other(format!("update {index} failed")))
            } else {
                Ok(index)
            }
        });
    }
    let error = assert_err!(group.wait(&RunContext::new()).await);
    let Error::Aggregate(errors) = error else {
        panic!("expected aggregate error, got {error}");
    };
    assert_eq!(errors.len(), 2);
    let rendered = errors.to_string();
    assert!(rendered.contains("update 0 failed"));
    assert!(rendered.contains("update 3 failed"));
}

/// Cancelling the caller's scope mid-batch drains every operation before
/// `wait` returns.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn caller_cancellation_drains_batch() {
    let mut group = Group::new();
    group.set_timeout(Duration::from_secs(60));
    for _slot in 0..4usize {
        group.queue(|ctx, _index| async move { Err::<u32, _>(ctx.done_err().await) });
    }

    let ctx = RunContext::new();
    let canceller = ctx.clone();
    tokio::spawn(async move {
        sleep(Duration::from_millis(10)).await;
        canceller.cancel(CancelReason::Cancelled);
    });

    let error = assert_err!(group.wait(&ctx).await);
    let Error::Aggregate(errors) = error else {
        panic!("expected aggregate error");
    };
    assert_eq!(errors.len(), 4);
    for entry in &errors {
        assert!(matches!(entry, Error::Cancelled));
    }
}
