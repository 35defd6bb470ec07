//! Scope instrumentation for anchorprof.
//!
//! Code marks interesting scopes with named anchors. When a scope exits the
//! elapsed cycles and any requested hardware-counter deltas are buffered per
//! anchor and thread slot, then written to a binary log that the `anchorprof`
//! tool turns into per-function statistics.
//!
//! - **Cycles**: `rdtscp`, tagged with the core so CPU migrations are
//!   recorded separately
//! - **Counters**: cache misses, branch misses, page faults and instructions
//!   via `perf_event_open`, read in user space with `rdpmc`
//!
//! # Usage
//!
//! ```rust,ignore
//! use anchorprof_trace::{CounterFlags, measure};
//!
//! fn main() -> anchorprof_trace::Result<()> {
//!     anchorprof_trace::start_profiling("profile.bin")?;
//!     {
//!         let _m = measure!("load");
//!         load();
//!     }
//!     {
//!         let _m = measure!("solve", CounterFlags::CACHE_MISSES | CounterFlags::BRANCH_MISSES);
//!         solve();
//!     }
//!     anchorprof_trace::stop_profiling()
//! }
//! ```
//!
//! Then summarize the log:
//! ```bash
//! anchorprof profile.bin
//! ```
//!
//! Hardware counters need `perf_event_open` access
//! (`/proc/sys/kernel/perf_event_paranoid` at 2 or lower).

pub mod arena;
pub mod config;
pub mod counters;
pub mod error;
pub mod flush;
pub mod format;
pub mod measure;
pub mod profiler;
pub mod registry;

pub use config::ProfilerConfig;
pub use counters::{CounterFlags, CounterKind};
pub use error::{Error, Result};
pub use format::{FlushHeader, ResultKind, ResultRecord};
pub use measure::{Measurement, next_anchor_index};
pub use profiler::{Profiler, global, measure, start_profiling, start_profiling_with, stop_profiling};
