use std::collections::TryReserveError;
use std::path::PathBuf;

use thiserror::Error;

use crate::stats::StateId;

/// Errors raised while loading a trace and replaying its events.
///
/// Only some of them abort a load, see [`TraceError::is_recoverable`].
#[derive(Error, Debug)]
pub enum TraceError {
    #[error("line {line}: malformed trace event: '{content}'")]
    MalformedEvent { line: usize, content: String },

    #[error("invalid trace header: {0}")]
    Header(String),

    #[error("cpu{cpu}: idle exit at {time:.6} without a matching idle entry")]
    OutOfOrderClose { cpu: usize, time: f64 },

    #[error("cpu{cpu}: dropping interval of state {state} with non-positive duration {duration_us:.3}us")]
    NegativeDuration { cpu: usize, state: StateId, duration_us: f64 },

    #[error("cpu{cpu}: frequency {freq_khz} kHz is not in the advertised table")]
    UnknownFrequency { cpu: usize, freq_khz: u32 },

    #[error("event for cpu{cpu}, but the trace only declares {nr_cpus} cpus")]
    UnknownCpu { cpu: usize, nr_cpus: usize },

    #[error("cannot grow interval storage")]
    Alloc(#[from] TryReserveError),

    #[error("invalid trace pattern")]
    Pattern(#[from] regex::Error),

    #[error("failed to read trace {path:?}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl TraceError {
    /// `true` if the event was skipped but the load can go on.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            TraceError::OutOfOrderClose { .. }
                | TraceError::NegativeDuration { .. }
                | TraceError::UnknownFrequency { .. }
                | TraceError::UnknownCpu { .. }
        )
    }
}

/// Errors raised when binding per-CPU statistics to the topology tree.
#[derive(Error, Debug)]
pub enum TopologyError {
    #[error("no cpu of the trace is present in the topology")]
    Unmapped,

    #[error("topology does not match the trace: cpus missing from topology {missing:?}, cpus without trace data {unknown:?}")]
    Mismatch { missing: Vec<usize>, unknown: Vec<usize> },

    #[error("cannot grow interval storage")]
    Alloc(#[from] TryReserveError),
}

/// Errors raised while reading an energy model description.
#[derive(Error, Debug)]
pub enum EnergyModelError {
    #[error("energy model line {line}: {reason}")]
    Parse { line: usize, reason: String },

    #[error("failed to read energy model {path:?}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}
