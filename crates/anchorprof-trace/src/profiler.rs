//! Profiler lifecycle: start, background flushing, shutdown.
//!
//! A [`Profiler`] owns the anchor table, the log sink and the optional
//! flusher thread. It can be used directly (tests, embedders that want an
//! explicit handle) or through the process-wide facade at the bottom of this
//! module, which is what [`measure!`](crate::measure!) talks to.

use crate::config::ProfilerConfig;
use crate::counters::CounterFlags;
use crate::error::{Error, Result, fatal};
use crate::flush::LogSink;
use crate::measure::Measurement;
use crate::registry::{AnchorSummary, Registry, lock};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// State shared between the profiler handle, live measurements and the
/// flusher thread.
pub(crate) struct Shared {
    active: AtomicBool,
    pub(crate) registry: Registry,
    pub(crate) sink: LogSink,
    warned_out_of_range: AtomicBool,
}

impl Shared {
    pub(crate) fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }
}

pub struct Profiler {
    shared: Arc<Shared>,
    config: ProfilerConfig,
    flusher: Mutex<Option<JoinHandle<()>>>,
}

impl Profiler {
    /// Open the log for append and start recording.
    pub fn start(path: impl AsRef<Path>, config: ProfilerConfig) -> Result<Self> {
        config.validate()?;
        let path = config.log_path(path.as_ref());
        let sink = LogSink::open(&path)?;

        let shared = Arc::new(Shared {
            active: AtomicBool::new(true),
            registry: Registry::new(&config)?,
            sink,
            warned_out_of_range: AtomicBool::new(false),
        });

        let flusher = match config.flush_interval {
            Some(interval) => Some(spawn_flusher(Arc::clone(&shared), interval)?),
            None => None,
        };

        log::debug!(
            "profiling to {} ({} anchors x {} slots, flush every {})",
            path.display(),
            config.max_anchors,
            config.thread_slots,
            config
                .flush_interval
                .map(|d| humantime::format_duration(d).to_string())
                .unwrap_or_else(|| "never".to_string())
        );

        Ok(Profiler {
            shared,
            config,
            flusher: Mutex::new(flusher),
        })
    }

    /// Open a measurement on anchor `index`.
    ///
    /// An index outside the anchor table yields an inactive guard and a
    /// one-time warning; so does a stopped profiler.
    pub fn measure(&self, index: usize, name: &'static str, flags: CounterFlags) -> Measurement<'_> {
        let shared = &*self.shared;
        if !shared.is_active() {
            return Measurement::inactive();
        }
        match shared.registry.anchor(index) {
            Ok(anchor) => Measurement::begin(shared, anchor, name, flags),
            Err(err) => {
                if !shared.warned_out_of_range.swap(true, Ordering::Relaxed) {
                    log::warn!("'{name}' not measured: {err}");
                }
                Measurement::inactive()
            }
        }
    }

    /// Flush every buffered record now. Returns the payload bytes written.
    pub fn flush(&self) -> Result<usize> {
        if !self.shared.is_active() {
            return Err(Error::NotStarted);
        }
        let flushed = self.shared.registry.flush_all(&self.shared.sink)?;
        self.shared.sink.sync()?;
        Ok(flushed)
    }

    /// Stop recording, join the flusher, write out every buffer and close
    /// the log. Calling it again does nothing.
    pub fn shutdown(&self) -> Result<()> {
        if !self.shared.active.swap(false, Ordering::AcqRel) {
            return Ok(());
        }

        if let Some(handle) = lock(&self.flusher).take() {
            handle.thread().unpark();
            if handle.join().is_err() {
                log::warn!("flusher thread panicked");
            }
        }

        // The log is closed even when the final flush fails.
        let retired = self.shared.registry.retire_all(&self.shared.sink);
        let closed = self.shared.sink.close();
        let flushed = retired?;
        closed?;
        log::debug!(
            "profiling stopped: {flushed} bytes in final flush, {} blocks total",
            self.shared.sink.blocks_written()
        );
        Ok(())
    }

    pub fn is_active(&self) -> bool {
        self.shared.is_active()
    }

    pub fn config(&self) -> &ProfilerConfig {
        &self.config
    }

    /// Path of the log being written, after any pid prefix.
    pub fn log_path(&self) -> &Path {
        self.shared.sink.path()
    }

    /// Live hit and cycle totals of every named anchor.
    pub fn summaries(&self) -> Vec<AnchorSummary> {
        self.shared.registry.summaries()
    }
}

impl Drop for Profiler {
    fn drop(&mut self) {
        if let Err(err) = self.shutdown() {
            log::error!("profiler shutdown failed: {err}");
        }
    }
}

fn spawn_flusher(shared: Arc<Shared>, interval: Duration) -> Result<JoinHandle<()>> {
    thread::Builder::new()
        .name("anchorprof-flush".to_string())
        .spawn(move || {
            while shared.is_active() {
                thread::park_timeout(interval);
                if !shared.is_active() {
                    break;
                }
                let flushed = shared
                    .registry
                    .flush_all(&shared.sink)
                    .and_then(|flushed| shared.sink.sync().map(|()| flushed));
                match flushed {
                    Ok(bytes) => report(&shared.registry, bytes),
                    Err(err) => fatal("periodic flush", &err),
                }
            }
        })
        .map_err(Error::ThreadSpawn)
}

fn report(registry: &Registry, flushed: usize) {
    if !log::log_enabled!(log::Level::Debug) {
        return;
    }
    log::debug!("periodic flush wrote {flushed} bytes");
    for summary in registry.summaries() {
        log::debug!(
            "  {:<32} hits={:<10} cycles={}",
            summary.name,
            summary.hits,
            summary.cycles
        );
    }
}

static GLOBAL: OnceLock<Profiler> = OnceLock::new();

/// Start the process-wide profiler, configured from the environment.
pub fn start_profiling(path: impl AsRef<Path>) -> Result<()> {
    start_profiling_with(path, ProfilerConfig::from_env()?)
}

/// Start the process-wide profiler with an explicit configuration.
///
/// The process-wide profiler runs at most once per process; a second start,
/// even after [`stop_profiling`], fails with [`Error::AlreadyStarted`].
pub fn start_profiling_with(path: impl AsRef<Path>, config: ProfilerConfig) -> Result<()> {
    if GLOBAL.get().is_some() {
        return Err(Error::AlreadyStarted);
    }
    let profiler = Profiler::start(path, config)?;
    GLOBAL.set(profiler).map_err(|profiler| {
        // Lost a race with another starter; discard ours without touching
        // the winner's log.
        let _ = profiler.shutdown();
        Error::AlreadyStarted
    })
}

/// Stop the process-wide profiler and flush everything it buffered.
pub fn stop_profiling() -> Result<()> {
    GLOBAL.get().ok_or(Error::NotStarted)?.shutdown()
}

/// The process-wide profiler, if one was started.
pub fn global() -> Option<&'static Profiler> {
    GLOBAL.get()
}

/// Open a measurement on the process-wide profiler. Without a running
/// profiler the guard records nothing.
pub fn measure(index: usize, name: &'static str, flags: CounterFlags) -> Measurement<'static> {
    match GLOBAL.get() {
        Some(profiler) => profiler.measure(index, name, flags),
        None => Measurement::inactive(),
    }
}
