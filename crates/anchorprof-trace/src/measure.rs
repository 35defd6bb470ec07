//! Scoped measurement guards.
//!
//! A [`Measurement`] captures counter baselines when created and records
//! the deltas when dropped, so every exit path of the guarded scope
//! (normal return, `?`, panic unwind) finalizes exactly once.

use crate::counters::{CounterFlags, CounterKind, Timestamp, perf, tsc};
use crate::error::fatal;
use crate::format::{ResultKind, ResultRecord};
use crate::profiler::Shared;
use crate::registry::Anchor;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Source of per-call-site anchor indices for [`measure!`](crate::measure!).
static NEXT_ANCHOR: AtomicUsize = AtomicUsize::new(1);

/// Hand out the next unused anchor index. Indices start at 1.
pub fn next_anchor_index() -> usize {
    NEXT_ANCHOR.fetch_add(1, Ordering::Relaxed)
}

/// Records of one finalized measurement: cycles or migration, then one per
/// requested counter.
const MAX_RECORDS: usize = 1 + CounterKind::COUNT;

/// RAII guard for one timed interval bound to an anchor.
///
/// The guard is tied to the thread that created it: counter baselines are
/// per-thread, so it is deliberately `!Send`.
#[must_use = "a measurement records when dropped; bind it with `let _m = ...`"]
pub struct Measurement<'p> {
    active: Option<Active<'p>>,
    _not_send: PhantomData<*const ()>,
}

struct Active<'p> {
    shared: &'p Shared,
    anchor: &'p Anchor,
    baselines: [Option<u64>; CounterKind::COUNT],
    start: Timestamp,
}

impl<'p> Measurement<'p> {
    /// A guard that records nothing.
    pub fn inactive() -> Self {
        Measurement {
            active: None,
            _not_send: PhantomData,
        }
    }

    pub(crate) fn begin(
        shared: &'p Shared,
        anchor: &'p Anchor,
        name: &'static str,
        flags: CounterFlags,
    ) -> Self {
        anchor.set_name(name);

        let mut baselines = [None; CounterKind::COUNT];
        for kind in flags.kinds() {
            match perf::begin(kind) {
                Ok(baseline) => baselines[kind.index()] = Some(baseline),
                Err(err) if err.is_recoverable() => {
                    log::warn!("'{name}': no {kind} delta for this measurement: {err}");
                }
                Err(err) => fatal("starting performance counter", &err),
            }
        }

        // Cycles last, so counter reads stay outside the timed window.
        let start = tsc::read();
        Measurement {
            active: Some(Active {
                shared,
                anchor,
                baselines,
                start,
            }),
            _not_send: PhantomData,
        }
    }

    /// Whether this guard will record on drop.
    pub fn is_recording(&self) -> bool {
        self.active.is_some()
    }

    /// Finalize now instead of at end of scope.
    pub fn finish(mut self) {
        if let Some(active) = self.active.take() {
            active.finalize();
        }
    }
}

impl Drop for Measurement<'_> {
    fn drop(&mut self) {
        if let Some(active) = self.active.take() {
            active.finalize();
        }
    }
}

impl Active<'_> {
    fn finalize(self) {
        let now = tsc::read();
        let (timing, cycles) = timing_record(&self.start, &now);

        let mut records = [ResultRecord::default(); MAX_RECORDS];
        records[0] = timing;
        let mut len = 1;

        // Every baseline is released, even when the profiler has stopped.
        for kind in CounterKind::ALL {
            let Some(baseline) = self.baselines[kind.index()] else {
                continue;
            };
            match perf::end(kind, baseline) {
                Ok(Some(delta)) => {
                    records[len] = ResultRecord::new(kind.result_kind(), delta);
                    len += 1;
                }
                Ok(None) => {}
                Err(err) if err.is_recoverable() => {
                    log::warn!("no {kind} delta for this measurement: {err}");
                }
                Err(err) => fatal("reading performance counter", &err),
            }
        }

        if !self.shared.is_active() {
            return;
        }

        let registry = &self.shared.registry;
        let slot = registry.current_slot();
        if let Err(err) =
            registry.append(self.anchor, slot, &records[..len], cycles, &self.shared.sink)
        {
            fatal("recording measurement", &err);
        }
    }
}

/// Timing record for an interval, plus the cycles to add to the anchor's
/// live total. A core change between the readings makes the cycle count
/// meaningless, so it is logged as a migration and not accumulated.
fn timing_record(start: &Timestamp, now: &Timestamp) -> (ResultRecord, Option<u64>) {
    let elapsed = now.cycles_since(start);
    if now.migrated_from(start) {
        (ResultRecord::new(ResultKind::CpuMigrations, elapsed), None)
    } else {
        (ResultRecord::new(ResultKind::Cycles, elapsed), Some(elapsed))
    }
}

/// Open a measurement for the enclosing scope on the process-wide profiler.
///
/// Each call site gets its own anchor index the first time it runs. With no
/// flags only cycles are captured; pass [`CounterFlags`] to add counters.
///
/// ```rust,ignore
/// use anchorprof_trace::{CounterFlags, measure};
///
/// fn parse(input: &str) {
///     let _m = measure!("parse");
///     let _inner = measure!("parse/tokens", CounterFlags::CACHE_MISSES);
///     // ...
/// }
/// ```
#[macro_export]
macro_rules! measure {
    ($name:expr) => {
        $crate::measure!($name, $crate::CounterFlags::CYCLES)
    };
    ($name:expr, $flags:expr) => {{
        static __ANCHORPROF_INDEX: ::std::sync::OnceLock<usize> = ::std::sync::OnceLock::new();
        $crate::measure(
            *__ANCHORPROF_INDEX.get_or_init($crate::next_anchor_index),
            $name,
            $flags,
        )
    }};
}
