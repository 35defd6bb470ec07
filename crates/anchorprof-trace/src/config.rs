use crate::error::{Error, Result};
use crate::format::RECORD_SIZE;
use crate::registry::avalanche;
use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DEFAULT_MAX_ANCHORS: usize = 128;
pub const DEFAULT_THREAD_SLOTS: usize = 64;
pub const DEFAULT_SLOT_CAPACITY: usize = 20 * 1024 * 1024;
pub const DEFAULT_FLUSH_INTERVAL: Duration = Duration::from_secs(1);

pub const ENV_FLUSH_INTERVAL: &str = "ANCHORPROF_FLUSH_INTERVAL";
pub const ENV_SLOT_CAPACITY: &str = "ANCHORPROF_SLOT_CAPACITY";
pub const ENV_PID_PREFIX: &str = "ANCHORPROF_PID_PREFIX";

/// Maps a raw thread identity to a well-mixed value; the slot is that value
/// modulo [`ProfilerConfig::thread_slots`].
pub type ThreadHash = fn(u64) -> u64;

/// Sizing and behaviour of a profiler, fixed at start.
#[derive(Debug, Clone)]
pub struct ProfilerConfig {
    /// Anchor table size. Anchor indices must be below this.
    pub max_anchors: usize,
    /// Thread slots per anchor. Distinct threads may share a slot.
    pub thread_slots: usize,
    /// Byte capacity of each per-slot result buffer.
    pub slot_capacity: usize,
    /// Background flush period; `None` runs without a flusher thread.
    pub flush_interval: Option<Duration>,
    pub thread_hash: ThreadHash,
    /// Prefix the log file name with `<pid>-`.
    pub pid_prefix: bool,
}

impl Default for ProfilerConfig {
    fn default() -> Self {
        ProfilerConfig {
            max_anchors: DEFAULT_MAX_ANCHORS,
            thread_slots: DEFAULT_THREAD_SLOTS,
            slot_capacity: DEFAULT_SLOT_CAPACITY,
            flush_interval: Some(DEFAULT_FLUSH_INTERVAL),
            thread_hash: avalanche,
            pid_prefix: false,
        }
    }
}

impl ProfilerConfig {
    /// Defaults overridden by `ANCHORPROF_*` environment variables.
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();

        if let Ok(value) = env::var(ENV_FLUSH_INTERVAL) {
            config.flush_interval = parse_flush_interval(&value)?;
        }
        if let Ok(value) = env::var(ENV_SLOT_CAPACITY) {
            config.slot_capacity = value.trim().parse().map_err(|_| {
                Error::InvalidConfig(format!("{ENV_SLOT_CAPACITY}: expected bytes, got '{value}'"))
            })?;
        }
        if let Ok(value) = env::var(ENV_PID_PREFIX) {
            config.pid_prefix = matches!(value.trim(), "1" | "true" | "yes");
        }

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_anchors == 0 {
            return Err(Error::InvalidConfig("max_anchors must be at least 1".to_string()));
        }
        if self.thread_slots == 0 {
            return Err(Error::InvalidConfig("thread_slots must be at least 1".to_string()));
        }
        if self.slot_capacity < RECORD_SIZE {
            return Err(Error::InvalidConfig(format!(
                "slot_capacity must hold at least one {RECORD_SIZE}-byte record, got {}",
                self.slot_capacity
            )));
        }
        if self.flush_interval == Some(Duration::ZERO) {
            return Err(Error::InvalidConfig(
                "flush_interval must be non-zero; use None to disable".to_string(),
            ));
        }
        Ok(())
    }

    /// Final log path for `path`, applying the pid prefix if enabled.
    pub fn log_path(&self, path: &Path) -> PathBuf {
        if !self.pid_prefix {
            return path.to_path_buf();
        }
        let file_name = path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default();
        path.with_file_name(format!("{}-{}", std::process::id(), file_name))
    }
}

/// Parse a flush interval: `off`/`none`/`0` disable it, otherwise a
/// humantime duration or bare seconds.
pub fn parse_flush_interval(s: &str) -> Result<Option<Duration>> {
    let s = s.trim();
    if matches!(s, "off" | "none" | "0") {
        return Ok(None);
    }

    // Try humantime first
    if let Ok(d) = humantime::parse_duration(s) {
        return Ok(Some(d));
    }

    // Try bare number as seconds
    if let Ok(secs) = s.parse::<u64>() {
        return Ok(Some(Duration::from_secs(secs)));
    }

    Err(Error::InvalidConfig(format!(
        "Invalid flush interval '{}'. Examples: 500ms, 1s, 2m, off",
        s
    )))
}
