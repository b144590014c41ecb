//! Hot-path marker capture (§4.5, §9).
//!
//! Per §9's explicit redesign notes ("thread-local invocation counters
//! keyed by raw name", "`snprintf`-style canonical name formatting into a
//! fixed-size buffer with heap fallback", "prefer per-thread append-only
//! buffers... eliminates contention on the hot path"), this module never
//! takes a process-wide lock on the `mark()` path. Each thread owns its
//! own invocation-ordinal map and its own append-only marker vector;
//! `merge_all()` (used only by `get_checkpoints()`, never by `mark()`)
//! walks a small registry of per-thread handles to collect everything.

use std::cell::RefCell;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::{Arc, Mutex};

use crate::model::{Marker, Timestamp};

/// Fixed-size stack buffer for canonical name formatting (§9): covers
/// typical names without allocation; anything longer falls back to the
/// heap via `String`'s own growth.
const CANONICAL_NAME_STACK_BYTES: usize = 256;

thread_local! {
    static INVOCATION_COUNTERS: RefCell<HashMap<String, u64>> = RefCell::new(HashMap::new());
    static THREAD_TAG: u64 = compute_thread_tag();
    static LOCAL_LOG: Arc<Mutex<Vec<Marker>>> = {
        let log = Arc::new(Mutex::new(Vec::new()));
        registry().lock().expect("marker registry mutex poisoned").push(log.clone());
        log
    };
}

fn registry() -> &'static Mutex<Vec<Arc<Mutex<Vec<Marker>>>>> {
    static REGISTRY: std::sync::OnceLock<Mutex<Vec<Arc<Mutex<Vec<Marker>>>>>> = std::sync::OnceLock::new();
    REGISTRY.get_or_init(|| Mutex::new(Vec::new()))
}

/// Stable per-thread identifier, computed once per thread by hashing the
/// current thread's `ThreadId` (§3's "hash of thread handle").
fn compute_thread_tag() -> u64 {
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    std::thread::current().id().hash(&mut hasher);
    hasher.finish()
}

fn thread_tag() -> u64 {
    THREAD_TAG.with(|tag| *tag)
}

/// Formats the canonical marker name `"{raw_name}#inv_{N}_t{ThreadTag}"`
/// (§3), using a fixed-size stack buffer when it fits and falling back to
/// heap formatting otherwise.
fn format_canonical_name(raw_name: &str, ordinal: u64, tag: u64) -> String {
    use std::fmt::Write;
    let mut buf = arrayvec_like::StackString::<CANONICAL_NAME_STACK_BYTES>::new();
    if write!(buf, "{raw_name}#inv_{ordinal}_t{tag}").is_ok() {
        buf.into_string()
    } else {
        format!("{raw_name}#inv_{ordinal}_t{tag}")
    }
}

/// Minimal stack-allocated string buffer used only to realize the
/// fixed-size-buffer-with-heap-fallback idiom (§9) without pulling in a
/// crate dependency for something this small.
mod arrayvec_like {
    pub struct StackString<const N: usize> {
        buf: [u8; N],
        len: usize,
        overflowed: bool,
    }

    impl<const N: usize> StackString<N> {
        pub fn new() -> Self {
            StackString {
                buf: [0u8; N],
                len: 0,
                overflowed: false,
            }
        }

        pub fn into_string(self) -> String {
            String::from_utf8_lossy(&self.buf[..self.len]).into_owned()
        }
    }

    impl<const N: usize> std::fmt::Write for StackString<N> {
        fn write_str(&mut self, s: &str) -> std::fmt::Result {
            let bytes = s.as_bytes();
            if self.overflowed || self.len + bytes.len() > N {
                self.overflowed = true;
                return Err(std::fmt::Error);
            }
            self.buf[self.len..self.len + bytes.len()].copy_from_slice(bytes);
            self.len += bytes.len();
            Ok(())
        }
    }
}

/// Records a named marker on the hot path. Bounded O(1) in expectation; no
/// I/O, no syscalls beyond the timestamp read, no blocking waits (§4.5).
///
/// `now_ns` is the caller-supplied timestamp, captured by the `EnergyMeter`
/// facade *before* any of this function's bookkeeping, per §4.5 step 3.
pub fn record_mark(raw_name: &str, now_ns: Timestamp) {
    let ordinal = INVOCATION_COUNTERS.with(|counters| {
        let mut counters = counters.borrow_mut();
        let entry = counters.entry(raw_name.to_string()).or_insert(0);
        *entry += 1;
        *entry
    });
    let tag = thread_tag();
    let canonical_name = format_canonical_name(raw_name, ordinal, tag);

    LOCAL_LOG.with(|log| {
        let mut log = log.lock().expect("marker log mutex poisoned");
        log.push(Marker {
            name: canonical_name,
            timestamp_ns: now_ns,
        });
    });
}

/// Merges every thread's marker vector, sorted by `timestamp_ns`. Only
/// ever called from `get_checkpoints()`, never from the hot path.
pub fn merge_all() -> Vec<Marker> {
    let logs = registry().lock().expect("marker registry mutex poisoned");
    let mut merged = Vec::new();
    for log in logs.iter() {
        let guard = log.lock().expect("marker log mutex poisoned");
        merged.extend(guard.iter().cloned());
    }
    merged.sort_by_key(|m| m.timestamp_ns);
    merged
}

/// Clears all markers across all threads. Called when a new measurement
/// session begins (§3's "cleared when a new session begins").
pub fn clear_all() {
    let logs = registry().lock().expect("marker registry mutex poisoned");
    for log in logs.iter() {
        log.lock().expect("marker log mutex poisoned").clear();
    }
    INVOCATION_COUNTERS.with(|counters| counters.borrow_mut().clear());
}
