//! Structured events emitted by the controller.
//!
//! Events are published on a tokio broadcast channel; subscribers are
//! optional and sends are best-effort, so the sink is a pluggable
//! capability rather than a dependency of the core.

/// Operational events consumed by the orchestration layer.
#[derive(Debug, Clone, PartialEq)]
pub enum RailEvent {
    Connected { address: String },
    Disconnected,
    MotionStarted { target: f64 },
    MotionComplete { position: f64 },
    MotionFailed { reason: String },
    Homed,
    Stopped,
    EstopEngaged,
    EstopReleased,
}
