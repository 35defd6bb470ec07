use crate::counters::CounterKind;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("perf_event_open failed for {kind}: {source}")]
    CounterOpen {
        kind: CounterKind,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to map perf metadata page for {kind}: {source}")]
    CounterMap {
        kind: CounterKind,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to control counter {kind}: {source}")]
    CounterControl {
        kind: CounterKind,
        #[source]
        source: std::io::Error,
    },

    #[error("Counter {kind} metadata kept changing after {attempts} read attempts")]
    SeqlockContention { kind: CounterKind, attempts: u32 },

    #[error("Failed to map arena region of {size} bytes: {source}")]
    ArenaMap {
        size: usize,
        #[source]
        source: std::io::Error,
    },

    #[error("Arena of {capacity} bytes cannot hold a {requested}-byte record after flushing")]
    ArenaExhausted { capacity: usize, requested: usize },

    #[error("Anchor index {index} is outside the anchor table ({capacity} entries)")]
    AnchorOutOfRange { index: usize, capacity: usize },

    #[error("Profiling is already active")]
    AlreadyStarted,

    #[error("Profiling is not active")]
    NotStarted,

    #[error("Failed to spawn background flusher: {0}")]
    ThreadSpawn(#[source] std::io::Error),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Whether a measurement can drop the affected value and carry on.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Error::SeqlockContention { .. })
    }
}

/// Report an unrecoverable failure and terminate the process.
///
/// Only used where the error cannot be handed back to a caller: guard
/// finalization and the background flusher.
pub(crate) fn fatal(operation: &str, err: &Error) -> ! {
    log::error!("{operation} failed: {err}");
    eprintln!("Error: {operation} failed: {err}");
    std::process::exit(1);
}
