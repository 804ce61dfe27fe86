// Concurrency tests for the metrics aggregator
//
// Properties tested:
// 1. No lost updates: N concurrent writers x M outcomes = N*M recorded
// 2. Exact failure rate: failures / total regardless of interleaving
// 3. Many executors on one tag: counts and percentiles from every sample

use std::sync::Arc;
use std::time::{Duration, SystemTime};

use proptest::prelude::*;
use surge_core::{OutcomeStatus, RequestOutcome, VuId};
use surge_engine::MetricsAggregator;

fn outcome(tag: &str, vu: u64, ms: u64, ok: bool) -> RequestOutcome {
    RequestOutcome {
        tag: tag.to_string(),
        timestamp: SystemTime::now(),
        duration: Duration::from_millis(ms),
        status: if ok {
            OutcomeStatus::Success
        } else {
            OutcomeStatus::Failure
        },
        http_status: Some(if ok { 200 } else { 500 }),
        vu: VuId::new(vu),
        iteration: 0,
        error: None,
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_hundred_executors_one_success_each() {
    let aggregator = Arc::new(MetricsAggregator::new());

    let handles: Vec<_> = (1..=100u64)
        .map(|vu| {
            let aggregator = Arc::clone(&aggregator);
            tokio::spawn(async move {
                aggregator.record(outcome("list_hotels", vu, vu, true));
            })
        })
        .collect();
    for handle in handles {
        handle.await.unwrap();
    }

    let snapshot = aggregator.snapshot();
    let series = &snapshot.tags["list_hotels"];
    assert_eq!(series.total, 100);
    assert_eq!(series.failure_rate(), 0.0);
    // Samples are 1..=100 ms, so p95 is the 95th of them.
    assert!((series.percentile_ms(95.0) - 95.0).abs() < 0.1);
    assert_eq!(snapshot.global.total, 100);
}

#[test]
fn test_no_lost_updates_across_threads() {
    const WRITERS: u64 = 16;
    const PER_WRITER: u64 = 2_000;

    let aggregator = Arc::new(MetricsAggregator::new());
    let threads: Vec<_> = (0..WRITERS)
        .map(|w| {
            let aggregator = Arc::clone(&aggregator);
            std::thread::spawn(move || {
                let tag = if w % 2 == 0 { "even" } else { "odd" };
                for i in 0..PER_WRITER {
                    aggregator.record(outcome(tag, w + 1, 1 + i % 50, i % 4 != 0));
                    if i % 10 == 0 {
                        aggregator.record_skip(tag);
                    }
                }
                aggregator.record_iteration();
            })
        })
        .collect();
    for thread in threads {
        thread.join().unwrap();
    }

    let snapshot = aggregator.snapshot();
    assert_eq!(snapshot.global.total, WRITERS * PER_WRITER);
    assert_eq!(snapshot.tags["even"].total, WRITERS / 2 * PER_WRITER);
    assert_eq!(snapshot.tags["odd"].total, WRITERS / 2 * PER_WRITER);
    assert_eq!(snapshot.global.failures, WRITERS * PER_WRITER / 4);
    assert_eq!(snapshot.global.skipped, WRITERS * PER_WRITER / 10);
    assert_eq!(snapshot.iterations, WRITERS);
    assert_eq!(snapshot.global.failure_rate(), 0.25);
}

#[test]
fn test_snapshot_while_writing_is_consistent() {
    let aggregator = Arc::new(MetricsAggregator::new());
    let writer = {
        let aggregator = Arc::clone(&aggregator);
        std::thread::spawn(move || {
            for i in 0..20_000u64 {
                aggregator.record(outcome("t", 1, 1 + i % 10, i % 2 == 0));
            }
        })
    };

    let mut last_total = 0;
    while !writer.is_finished() {
        let series = aggregator.snapshot().global;
        // Totals only grow and failures never exceed totals.
        assert!(series.total >= last_total);
        assert!(series.failures <= series.total);
        last_total = series.total;
    }
    writer.join().unwrap();
    assert_eq!(aggregator.snapshot().global.total, 20_000);
}

proptest! {
    #[test]
    fn prop_failure_rate_is_exact(results in prop::collection::vec(any::<bool>(), 1..300)) {
        let aggregator = MetricsAggregator::new();
        for (i, ok) in results.iter().enumerate() {
            let tag = if i % 3 == 0 { "a" } else { "b" };
            aggregator.record(outcome(tag, 1, 5, *ok));
        }

        let failures = results.iter().filter(|ok| !**ok).count() as u64;
        let snapshot = aggregator.snapshot();
        prop_assert_eq!(snapshot.global.total, results.len() as u64);
        prop_assert_eq!(snapshot.global.failures, failures);
        prop_assert_eq!(
            snapshot.global.failure_rate(),
            failures as f64 / results.len() as f64
        );
    }
}
