//! Single-axis motorized rail control driver.
//!
//! The crate controls a linear rail through a MachineMotion-style motion
//! controller: homing, absolute/relative positioning, speed/acceleration
//! configuration, and emergency-stop semantics. The [`RailController`] owns
//! the physical link, enforces the motion safety invariants, and surfaces
//! every outcome as a typed result; the link itself is pluggable through
//! the [`link::LinkAdapter`] trait (TCP line protocol or the in-process
//! simulator behind `sim://` addresses).
//!
//! # Example
//!
//! ```no_run
//! use vention_rail::{RailConfig, RailController};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = RailConfig::new("sim://rail", 50.0, 25.0, 500.0)?;
//!     let rail = RailController::from_config(config);
//!
//!     rail.connect().await?;
//!     rail.home().await?;
//!     rail.move_to(100.0, None, None).await?;
//!     println!("position: {:.1} mm", rail.get_position().await?);
//!     rail.disconnect().await;
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod controller;
pub mod error;
pub mod events;
pub mod link;

pub use config::{ConfigError, RailConfig};
pub use controller::{DriveState, MotionRequest, MotionTarget, RailController, RetryPolicy};
pub use error::{MotionResult, RailError, RailResult};
pub use events::RailEvent;
