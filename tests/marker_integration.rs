//! End-to-end exercise of the thread-local marker capture (§3, §4.5, §9)
//! from outside the crate, the way an instrumented application actually
//! calls it: many threads, each marking several raw names, then one
//! merge-and-sort on query.

use std::collections::HashSet;
use std::sync::Mutex;
use std::thread;

use nemb_core::marker;

/// `marker`'s registry is process-wide (§9's thread-local-map redesign
/// note); `clear_all()` affects every thread in the test binary, so tests
/// in this file must not run concurrently with each other.
static SERIAL: Mutex<()> = Mutex::new(());

#[test]
fn n_threads_times_m_marks_yields_exactly_n_times_m_unique_names() {
    let _guard = SERIAL.lock().unwrap();
    marker::clear_all();

    const THREADS: usize = 8;
    const MARKS_PER_THREAD: usize = 25;

    let handles: Vec<_> = (0..THREADS)
        .map(|t| {
            thread::spawn(move || {
                for m in 0..MARKS_PER_THREAD {
                    let ts = (t * 1_000_000 + m) as u64;
                    marker::record_mark("region", ts);
                }
            })
        })
        .collect();
    for h in handles {
        h.join().unwrap();
    }

    let markers = marker::merge_all();
    assert_eq!(markers.len(), THREADS * MARKS_PER_THREAD);

    let unique_names: HashSet<&str> = markers.iter().map(|m| m.name.as_str()).collect();
    assert_eq!(unique_names.len(), THREADS * MARKS_PER_THREAD);

    marker::clear_all();
}

#[test]
fn recursive_same_thread_marks_get_increasing_invocation_ordinals() {
    let _guard = SERIAL.lock().unwrap();
    marker::clear_all();
    for i in 0..4u64 {
        marker::record_mark("recursive_fn", i * 100);
    }
    let markers = marker::merge_all();
    assert_eq!(markers.len(), 4);
    for (i, m) in markers.iter().enumerate() {
        assert!(m.name.starts_with(&format!("recursive_fn#inv_{}_t", i + 1)));
    }
    for w in markers.windows(2) {
        assert!(w[0].timestamp_ns < w[1].timestamp_ns);
    }
    marker::clear_all();
}

#[test]
fn clear_all_resets_both_markers_and_invocation_counters() {
    let _guard = SERIAL.lock().unwrap();
    marker::clear_all();
    marker::record_mark("once", 1);
    assert_eq!(marker::merge_all().len(), 1);

    marker::clear_all();
    assert!(marker::merge_all().is_empty());

    // After clearing, the invocation ordinal for "once" restarts at 1
    // rather than continuing from the prior session.
    marker::record_mark("once", 2);
    let markers = marker::merge_all();
    assert!(markers[0].name.starts_with("once#inv_1_t"));
    marker::clear_all();
}
