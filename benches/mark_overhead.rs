//! Characterizes the hot path's per-call cost: `EnergyMeter::mark()` must
//! stay sub-microsecond per §2/§4.5. Run with `cargo bench` against a
//! session with no providers polling concurrently to isolate `mark()`
//! itself from ring-buffer contention.

use criterion::{criterion_group, criterion_main, Criterion};
use nemb_core::timer::PrecisionTimer;

fn bench_mark_overhead(c: &mut Criterion) {
    let timer = PrecisionTimer::new().expect("some clock must be usable");

    c.bench_function("mark_hot_path_single_thread", |b| {
        b.iter(|| {
            let ts = timer.now_ns();
            nemb_core::marker::record_mark("bench_region", ts);
        });
    });

    nemb_core::marker::clear_all();
}

criterion_group!(benches, bench_mark_overhead);
criterion_main!(benches);
