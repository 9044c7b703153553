//! Link adapters for the rail controller.
//!
//! A [`LinkAdapter`] owns the physical session and exposes the raw command
//! primitives of the motion controller. It carries no business logic: bounds
//! checking, estop precedence, and completion waiting all live in the
//! controller layer.

use crate::config::RailConfig;
use crate::error::RailResult;
use async_trait::async_trait;

pub mod machine_motion;
pub mod mock;

pub use machine_motion::MachineMotionLink;
pub use mock::MockLink;

/// The single controllable axis. The rail has one degree of freedom, wired
/// to axis 1 on the controller.
pub const RAIL_AXIS: u8 = 1;

/// Direction framing for relative moves, as the controller expects it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Positive,
    Negative,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::Positive => "positive",
            Direction::Negative => "negative",
        }
    }
}

/// Raw command interface to the physical rail controller.
///
/// Move/home/stop commands are fire-and-acknowledge: they return once the
/// controller accepts the command, not once motion finishes. Callers poll
/// [`LinkAdapter::motion_complete`] for completion so that the link stays
/// available between polls (a concurrent estop must always get through).
#[async_trait]
pub trait LinkAdapter: Send + Sync {
    /// Open the session. No automatic retry.
    async fn connect(&mut self) -> RailResult<()>;

    /// Close the session. Callers treat failures as log-and-continue.
    async fn disconnect(&mut self) -> RailResult<()>;

    /// Whether a session is currently open.
    fn is_connected(&self) -> bool;

    /// Set travel speed in mm/s.
    async fn set_speed(&mut self, speed: f64) -> RailResult<()>;

    /// Set acceleration in mm/s².
    async fn set_acceleration(&mut self, acceleration: f64) -> RailResult<()>;

    /// Command an absolute move. Does not block for completion.
    async fn move_absolute(&mut self, axis: u8, position: f64) -> RailResult<()>;

    /// Command a relative move of `magnitude` (always non-negative) in the
    /// given direction. Does not block for completion.
    async fn move_relative(&mut self, axis: u8, direction: Direction, magnitude: f64)
        -> RailResult<()>;

    /// Start the homing sequence. Does not block for completion.
    async fn home(&mut self, axis: u8) -> RailResult<()>;

    /// Stop all motion.
    async fn stop_all(&mut self) -> RailResult<()>;

    /// Trigger the emergency stop.
    async fn estop(&mut self) -> RailResult<()>;

    /// Release the emergency stop.
    async fn release_estop(&mut self) -> RailResult<()>;

    /// Single completion poll: `true` once the in-flight move/home has
    /// finished.
    async fn motion_complete(&mut self, axis: u8) -> RailResult<bool>;

    /// Synchronous position read in mm.
    async fn get_position(&mut self, axis: u8) -> RailResult<f64>;
}

/// Pick a link implementation for the configured address: `sim://` selects
/// the in-process simulator, anything else the TCP line protocol.
pub fn link_for_address(config: &RailConfig) -> Box<dyn LinkAdapter> {
    if config.is_simulated() {
        Box::new(MockLink::new())
    } else {
        Box::new(MachineMotionLink::new(config.address.clone()))
    }
}
