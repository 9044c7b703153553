//! Error types for the rail driver.
//!
//! `RailError` is the single error type crossing the public boundary. Every
//! adapter-facing failure is caught at the controller and converted into one
//! of these variants; nothing propagates as an unhandled fault.

use std::time::Duration;
use thiserror::Error;

/// Convenience alias for results using the rail error type.
pub type RailResult<T> = std::result::Result<T, RailError>;

/// Outcome of a single motion call.
pub type MotionResult = RailResult<()>;

#[derive(Error, Debug)]
pub enum RailError {
    /// Link establishment failed.
    #[error("failed to connect to rail controller at {address}: {reason}")]
    Connect { address: String, reason: String },

    /// The controller rejected a speed/acceleration setting, or an
    /// override combination was invalid.
    #[error("configuration rejected: {0}")]
    Config(String),

    /// Position query failed.
    #[error("position read failed: {0}")]
    Read(String),

    /// Operation not permitted in the current drive state.
    #[error("operation not permitted: {0}")]
    InvalidState(String),

    /// Requested target lies outside the rail span. Pure validation
    /// rejection; the adapter is never touched.
    #[error("target position {position} outside rail span [0, {span}]")]
    OutOfRange { position: f64, span: f64 },

    /// The adapter reported a command failure during move/home/stop.
    #[error("motion fault: {0}")]
    MotionFault(String),

    /// Emergency stop is engaged, or was engaged while a motion wait was
    /// in flight.
    #[error("emergency stop engaged")]
    Estopped,

    /// Motion did not report completion within the configured timeout.
    #[error("motion did not complete within {0:?}")]
    CompletionTimeout(Duration),
}
