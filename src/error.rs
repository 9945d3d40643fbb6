//! Error classification for the miner.
//!
//! # Design
//!
//! One flat enum, classified by *who has to act*:
//!
//! ```text
//! MinerError
//! ├── Input              - file open / parse / encoding; fix the input
//! ├── Config             - unknown mode, bad flag value; fix the invocation
//! ├── Resource           - allocator failure, pmem without backing; fix the machine
//! ├── InvariantViolation - broken internal contract (aliased merge, re-reserve); fatal
//! └── Internal           - unreachable states, task panics; fatal with context
//! ```
//!
//! Errors raised inside worker-executed tasks are captured into the run's
//! first-error slot ([`FirstError`]) and surfaced at the wait-group boundary;
//! tasks are never retried (a retry would double-enumerate itemsets).

use std::fmt;
use std::io;
use std::sync::Mutex;

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, MinerError>;

/// All error kinds the miner can surface.
#[derive(Debug)]
pub enum MinerError {
    /// File open / parse / encoding problems.
    Input(String),
    /// Unknown scheduler, allocator, or report mode; invalid flag values.
    Config(String),
    /// Allocation failure, or a persistent-memory mode requested without backing.
    Resource(String),
    /// A broken internal contract. Fatal.
    InvariantViolation(String),
    /// Unreachable states and captured task panics. Fatal.
    Internal(String),
}

impl MinerError {
    /// Short kind tag used in user-visible diagnostics.
    pub fn kind(&self) -> &'static str {
        match self {
            MinerError::Input(_) => "input",
            MinerError::Config(_) => "config",
            MinerError::Resource(_) => "resource",
            MinerError::InvariantViolation(_) => "invariant",
            MinerError::Internal(_) => "internal",
        }
    }

    fn context(&self) -> &str {
        match self {
            MinerError::Input(c)
            | MinerError::Config(c)
            | MinerError::Resource(c)
            | MinerError::InvariantViolation(c)
            | MinerError::Internal(c) => c,
        }
    }
}

impl fmt::Display for MinerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "error[{}]: {}", self.kind(), self.context())
    }
}

impl std::error::Error for MinerError {}

impl From<io::Error> for MinerError {
    fn from(err: io::Error) -> Self {
        MinerError::Input(err.to_string())
    }
}

// ============================================================================
// First-error capture
// ============================================================================

/// Run-scoped slot recording the first error raised by any task.
///
/// Later errors are discarded so `take()` reports a deterministic failure.
/// The mutex is cold: it is touched only on the error path.
#[derive(Debug, Default)]
pub struct FirstError {
    slot: Mutex<Option<MinerError>>,
}

impl FirstError {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `err` if no earlier error was recorded.
    pub fn record(&self, err: MinerError) {
        let mut guard = self.slot.lock().unwrap_or_else(|p| p.into_inner());
        if guard.is_none() {
            *guard = Some(err);
        }
    }

    /// True if any error has been recorded.
    pub fn is_set(&self) -> bool {
        self.slot
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .is_some()
    }

    /// Take the recorded error, leaving the slot empty.
    pub fn take(&self) -> Option<MinerError> {
        self.slot.lock().unwrap_or_else(|p| p.into_inner()).take()
    }

    /// Turn the slot into a `Result`: `Err` with the first error if set.
    pub fn check(&self) -> Result<()> {
        match self.take() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_includes_kind_and_context() {
        let err = MinerError::Input("bad line 7".to_string());
        assert_eq!(err.to_string(), "error[input]: bad line 7");
        assert_eq!(err.kind(), "input");
    }

    #[test]
    fn io_error_maps_to_input() {
        let err: MinerError = io::Error::new(io::ErrorKind::NotFound, "nope").into();
        assert!(matches!(err, MinerError::Input(_)));
    }

    #[test]
    fn first_error_keeps_earliest() {
        let first = FirstError::new();
        assert!(!first.is_set());
        first.record(MinerError::Input("one".into()));
        first.record(MinerError::Internal("two".into()));
        assert!(first.is_set());
        let err = first.take().expect("recorded");
        assert!(matches!(err, MinerError::Input(_)));
        assert!(first.take().is_none());
    }

    #[test]
    fn check_returns_err_once() {
        let first = FirstError::new();
        assert!(first.check().is_ok());
        first.record(MinerError::Resource("oom".into()));
        assert!(first.check().is_err());
        assert!(first.check().is_ok());
    }
}
