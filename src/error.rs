//! Error types for acceleration-structure and shader-binding-table operations.
//!
//! Two tiers: caller-misuse preconditions surface as recoverable variants with
//! a descriptive message, and native device-call failures are wrapped in
//! [`Error::Device`] carrying the failing call's name and source location.
//! Programming-logic violations (unreachable state-machine branches) are
//! `debug_assert!`s, not errors.

use std::panic::Location;
use thiserror::Error;

/// Main error type for lifecycle and SBT operations.
#[derive(Error, Debug)]
pub enum Error {
    /// An operation was attempted in a state that does not allow it.
    #[error("Precondition violated: {0}")]
    Precondition(String),

    /// A traversable handle was requested before a build completed.
    #[error("Traversable handle is not ready")]
    HandleNotReady,

    /// The shader binding table is incomplete or stale for a launch.
    #[error("Shader binding table is not ready: {0}")]
    SbtNotReady(String),

    /// No SBT offset is recorded for the given (GAS, material set) pair.
    /// The layout is stale or the structure is misconfigured.
    #[error("No SBT offset for material set {mat_set} of the given acceleration structure")]
    UnknownSbtEntry { mat_set: u32 },

    /// A caller-supplied buffer is too small for the operation.
    #[error("Buffer too small for {what}: {size} bytes supplied, {required} required")]
    BufferTooSmall {
        what: &'static str,
        size: u64,
        required: u64,
    },

    /// A native device call failed.
    #[error("Device call ({call}) failed: {message} ({location})")]
    Device {
        call: &'static str,
        message: String,
        location: &'static Location<'static>,
    },
}

impl Error {
    /// Create a precondition-violation error from a message.
    pub fn precondition(msg: impl Into<String>) -> Self {
        Self::Precondition(msg.into())
    }
}

/// Failure of a single native device call, reported by a [`DeviceBackend`]
/// implementation. Carries the failing call's name and the source location of
/// the construction site for diagnosis.
///
/// [`DeviceBackend`]: crate::device::DeviceBackend
#[derive(Error, Debug)]
#[error("{call} failed: {message} ({location})")]
pub struct BackendError {
    call: &'static str,
    message: String,
    location: &'static Location<'static>,
}

impl BackendError {
    #[track_caller]
    pub fn new(call: &'static str, message: impl Into<String>) -> Self {
        Self {
            call,
            message: message.into(),
            location: Location::caller(),
        }
    }

    pub fn call(&self) -> &'static str {
        self.call
    }
}

impl From<BackendError> for Error {
    fn from(e: BackendError) -> Self {
        Error::Device {
            call: e.call,
            message: e.message,
            location: e.location,
        }
    }
}

/// Result type alias for lifecycle and SBT operations.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn device_error_names_the_failing_call() {
        let err: Error = BackendError::new("buildAccel", "out of memory").into();
        let text = err.to_string();
        assert!(text.contains("buildAccel"));
        assert!(text.contains("out of memory"));
        assert!(text.contains("error.rs"));
    }

    #[test]
    fn precondition_carries_message() {
        let err = Error::precondition("compaction was not requested");
        assert!(err.to_string().contains("compaction"));
    }
}
