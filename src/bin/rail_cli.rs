//! Command-line interface for the rail driver.
//!
//! Thin action layer: each subcommand maps 1:1 onto a controller operation,
//! connects, runs it, and disconnects. All policy lives in the library.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use vention_rail::{MotionRequest, RailConfig, RailController};

#[derive(Parser)]
#[command(name = "rail_cli", about = "Control a single-axis motorized rail")]
struct Cli {
    /// Path to the rail configuration TOML file.
    #[arg(short, long, default_value = "rail.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Home the rail.
    Home,
    /// Move to an absolute position in mm.
    Move {
        position: f64,
        /// Travel speed override in mm/s (requires --acceleration).
        #[arg(long)]
        speed: Option<f64>,
        /// Acceleration override in mm/s² (requires --speed).
        #[arg(long)]
        acceleration: Option<f64>,
    },
    /// Move by a signed relative distance in mm.
    MoveRel {
        distance: f64,
        #[arg(long)]
        speed: Option<f64>,
        #[arg(long)]
        acceleration: Option<f64>,
    },
    /// Print the current position.
    Position,
    /// Stop all motion.
    Stop,
    /// Trigger the emergency stop.
    Estop,
    /// Release the emergency stop.
    ReleaseEstop,
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let cli = Cli::parse();

    let config = RailConfig::load(&cli.config)
        .with_context(|| format!("failed to load config from {}", cli.config.display()))?;
    let rail = RailController::from_config(config);

    rail.connect().await?;
    let outcome = run(&rail, cli.command).await;
    rail.disconnect().await;
    outcome
}

async fn run(rail: &RailController, command: Command) -> Result<()> {
    match command {
        Command::Home => {
            rail.home().await?;
            println!("homed");
        }
        Command::Move {
            position,
            speed,
            acceleration,
        } => {
            let mut request = MotionRequest::absolute(position);
            request.speed = speed;
            request.acceleration = acceleration;
            let settled = rail.execute(request).await?;
            println!("position: {:.2} mm", settled);
        }
        Command::MoveRel {
            distance,
            speed,
            acceleration,
        } => {
            let mut request = MotionRequest::relative(distance);
            request.speed = speed;
            request.acceleration = acceleration;
            let settled = rail.execute(request).await?;
            println!("position: {:.2} mm", settled);
        }
        Command::Position => {
            println!("position: {:.2} mm", rail.get_position().await?);
        }
        Command::Stop => {
            rail.stop().await?;
            println!("stopped");
        }
        Command::Estop => {
            rail.estop().await?;
            println!("emergency stop engaged");
        }
        Command::ReleaseEstop => {
            rail.release_estop().await?;
            println!("emergency stop released");
        }
    }
    Ok(())
}
