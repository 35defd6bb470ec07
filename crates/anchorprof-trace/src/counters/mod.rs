//! Hardware counter sources: the cycle counter and per-thread perf counters.

pub mod perf;
pub mod tsc;

use crate::format::ResultKind;
use std::fmt;
use std::ops::{BitOr, BitOrAssign};

pub use perf::{COUNTER_MASK, OVERFLOW_MARGIN, PerfCounter, counter_delta, needs_reset};
pub use tsc::Timestamp;

/// Performance-monitoring event a measurement can request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CounterKind {
    CacheMisses,
    BranchMisses,
    PageFaults,
    Instructions,
}

impl CounterKind {
    pub const COUNT: usize = 4;

    pub const ALL: [CounterKind; Self::COUNT] = [
        CounterKind::CacheMisses,
        CounterKind::BranchMisses,
        CounterKind::PageFaults,
        CounterKind::Instructions,
    ];

    /// Position in per-thread counter tables.
    pub fn index(self) -> usize {
        self as usize
    }

    pub fn flag(self) -> CounterFlags {
        match self {
            CounterKind::CacheMisses => CounterFlags::CACHE_MISSES,
            CounterKind::BranchMisses => CounterFlags::BRANCH_MISSES,
            CounterKind::PageFaults => CounterFlags::PAGE_FAULTS,
            CounterKind::Instructions => CounterFlags::INSTRUCTIONS,
        }
    }

    /// Kind tag written to the log for this counter's deltas.
    pub fn result_kind(self) -> ResultKind {
        match self {
            CounterKind::CacheMisses => ResultKind::CacheMisses,
            CounterKind::BranchMisses => ResultKind::BranchMisses,
            CounterKind::PageFaults => ResultKind::PageFaults,
            CounterKind::Instructions => ResultKind::Instructions,
        }
    }
}

impl fmt::Display for CounterKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.result_kind().name())
    }
}

/// Set of counters requested by a measurement.
///
/// Cycles are always captured; `CYCLES` exists so call sites can spell it out.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct CounterFlags(u64);

impl CounterFlags {
    pub const NONE: CounterFlags = CounterFlags(0);
    pub const CACHE_MISSES: CounterFlags = CounterFlags(1);
    pub const PAGE_FAULTS: CounterFlags = CounterFlags(2);
    pub const INSTRUCTIONS: CounterFlags = CounterFlags(4);
    pub const CYCLES: CounterFlags = CounterFlags(8);
    pub const BRANCH_MISSES: CounterFlags = CounterFlags(16);

    pub const fn contains(self, other: CounterFlags) -> bool {
        self.0 & other.0 == other.0
    }

    /// Requested perf counters, in table order.
    pub fn kinds(self) -> impl Iterator<Item = CounterKind> {
        CounterKind::ALL
            .into_iter()
            .filter(move |kind| self.contains(kind.flag()))
    }
}

impl BitOr for CounterFlags {
    type Output = CounterFlags;

    fn bitor(self, rhs: CounterFlags) -> CounterFlags {
        CounterFlags(self.0 | rhs.0)
    }
}

impl BitOrAssign for CounterFlags {
    fn bitor_assign(&mut self, rhs: CounterFlags) {
        self.0 |= rhs.0;
    }
}
