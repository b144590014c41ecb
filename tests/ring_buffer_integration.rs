//! Exercises `RingBuffer` as it is actually used in production: one
//! producer thread pushing while the test thread repeatedly snapshots
//! concurrently (§4.3, §5's "multi-consumer snapshot reads" concurrency
//! policy).

use std::collections::HashMap;
use std::sync::Arc;
use std::thread;

use nemb_core::model::SynchronizedReading;
use nemb_core::RingBuffer;

fn reading(ts: u64) -> SynchronizedReading {
    SynchronizedReading {
        common_timestamp_ns: ts,
        readings: HashMap::new(),
        total_energy_joules: ts as f64,
    }
}

#[test]
fn concurrent_snapshot_during_pushes_stays_ordered() {
    let buffer = Arc::new(RingBuffer::new(256));
    let producer_buffer = buffer.clone();

    let producer = thread::spawn(move || {
        for i in 0..5000u64 {
            producer_buffer.push(reading(i * 1000));
        }
    });

    // Repeatedly snapshot from this thread while the producer is still
    // running. Every snapshot observed must itself be internally ordered,
    // even if it's a stale or partial prefix of what's ultimately pushed.
    let mut observed_any_non_empty = false;
    while !producer.is_finished() {
        let snapshot = buffer.snapshot();
        if !snapshot.is_empty() {
            observed_any_non_empty = true;
        }
        for w in snapshot.windows(2) {
            assert!(w[0].common_timestamp_ns < w[1].common_timestamp_ns);
        }
    }
    producer.join().unwrap();

    let final_snapshot = buffer.snapshot();
    assert_eq!(final_snapshot.len(), 256);
    assert!(buffer.has_wrapped());
    assert!(observed_any_non_empty || !final_snapshot.is_empty());
    for w in final_snapshot.windows(2) {
        assert!(w[0].common_timestamp_ns < w[1].common_timestamp_ns);
    }
}

#[test]
fn capacity_must_be_power_of_two_at_construction() {
    let result = std::panic::catch_unwind(|| RingBuffer::new(10));
    assert!(result.is_err());
}
