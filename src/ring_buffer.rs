//! Bounded, wait-free, single-producer/single-consumer time-series store
//! for [`SynchronizedReading`](crate::model::SynchronizedReading)s.
//!
//! The reference codebase's own SPSC ring buffer (`rtrb`, used for raw
//! latency samples in `system/performance/collector.rs`) is a consuming
//! queue: `Consumer::pop` removes the entry. `snapshot()` here must be
//! callable repeatedly, from any application thread, concurrently with the
//! producer still pushing, and see a consistent prefix of what's currently
//! retained — `rtrb` cannot express that. So this buffer is hand-rolled
//! using the sequence-number-per-slot scheme §4.3 calls out as "(a)
//! preferred", in the `AtomicU64` + explicit `Ordering` idiom the reference
//! codebase uses for its own atomic counters (`collector.rs`'s
//! `dropped_count`/`spike_count`, `system/performance/mod.rs`'s
//! `MonitoringState`).

use std::sync::atomic::{AtomicU64, Ordering};

use crate::model::SynchronizedReading;

/// A slot stores a sequence number alongside the payload. The writer
/// publishes a slot by: write payload, then store `seq = write_index + 1`
/// with `Release`. A reader that observes `seq == write_index + 1` knows
/// the payload it just read was the one published for that index; if the
/// writer has since lapped and overwritten the slot, `seq` will have moved
/// on and the reader discards the read and retries.
struct Slot {
    seq: AtomicU64,
    reading: std::sync::Mutex<Option<SynchronizedReading>>,
}

impl Slot {
    fn empty() -> Self {
        Slot {
            seq: AtomicU64::new(0),
            reading: std::sync::Mutex::new(None),
        }
    }
}

/// Bounded circular store of [`SynchronizedReading`]s. Capacity is fixed at
/// construction and must be a power of two (§4.3).
pub struct RingBuffer {
    slots: Box<[Slot]>,
    capacity: u64,
    mask: u64,
    /// Next index to be written. Also doubles as "total entries ever
    /// pushed" for computing the live window.
    write_index: AtomicU64,
    wrapped: std::sync::atomic::AtomicBool,
}

/// Default ring buffer capacity per §4.4 (2^17 entries).
pub const DEFAULT_CAPACITY: usize = 1 << 17;

impl RingBuffer {
    /// Constructs a ring buffer with the given power-of-two capacity.
    ///
    /// # Panics
    /// Panics if `capacity` is zero or not a power of two — this is a
    /// construction-time programmer error, not a runtime condition, so it
    /// is asserted rather than threaded through `Result`.
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0 && capacity.is_power_of_two(), "RingBuffer capacity must be a nonzero power of two, got {capacity}");
        let mut slots = Vec::with_capacity(capacity);
        slots.resize_with(capacity, Slot::empty);
        RingBuffer {
            slots: slots.into_boxed_slice(),
            capacity: capacity as u64,
            mask: capacity as u64 - 1,
            write_index: AtomicU64::new(0),
            wrapped: std::sync::atomic::AtomicBool::new(false),
        }
    }

    /// Wait-free push from the single producer thread. Overwrites the
    /// oldest entry once the buffer is full.
    pub fn push(&self, reading: SynchronizedReading) {
        let index = self.write_index.load(Ordering::Relaxed);
        let slot_idx = (index & self.mask) as usize;
        let slot = &self.slots[slot_idx];

        // Invalidate the slot before writing so a concurrent reader never
        // observes a torn payload under the old sequence number.
        slot.seq.store(0, Ordering::Release);
        {
            let mut guard = slot.reading.lock().expect("ring buffer slot mutex poisoned");
            *guard = Some(reading);
        }
        slot.seq.store(index + 1, Ordering::Release);

        if index >= self.capacity {
            self.wrapped.store(true, Ordering::Relaxed);
        }
        self.write_index.store(index + 1, Ordering::Release);
    }

    /// True once the buffer has overwritten at least one entry.
    pub fn has_wrapped(&self) -> bool {
        self.wrapped.load(Ordering::Relaxed)
    }

    pub fn capacity(&self) -> usize {
        self.capacity as usize
    }

    /// Returns all currently live entries ordered by `common_timestamp_ns`
    /// ascending. Safe to call concurrently with `push`; may observe a
    /// consistent prefix of the most recent entries if the producer laps
    /// the reader mid-copy.
    pub fn snapshot(&self) -> Vec<SynchronizedReading> {
        let end = self.write_index.load(Ordering::Acquire);
        let start = end.saturating_sub(self.capacity);
        let mut out = Vec::with_capacity((end - start) as usize);

        for index in start..end {
            let slot_idx = (index & self.mask) as usize;
            let slot = &self.slots[slot_idx];
            let expected_seq = index + 1;

            let seq_before = slot.seq.load(Ordering::Acquire);
            if seq_before != expected_seq {
                // Producer has already overwritten this slot; it is no
                // longer part of the retained window.
                continue;
            }
            let value = {
                let guard = slot.reading.lock().expect("ring buffer slot mutex poisoned");
                guard.clone()
            };
            let seq_after = slot.seq.load(Ordering::Acquire);
            if seq_after != expected_seq {
                // The producer lapped us while we were copying; drop this
                // entry rather than return a torn read.
                continue;
            }
            if let Some(reading) = value {
                out.push(reading);
            }
        }
        out
    }
}
