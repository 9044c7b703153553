//! Rail motion controller.
//!
//! `RailController` owns the link adapter and enforces the safety invariants
//! of the drive: position bounds, estop precedence, speed/acceleration
//! validity, and one in-flight motion operation at a time. High-level motion
//! intents are translated into adapter command sequences with completion
//! polling, and every failure is caught here and surfaced as a typed result.
//!
//! State machine: `Disconnected → Connecting → Ready ⇄ Moving`, with an
//! orthogonal estop flag that can be set from `Ready` or `Moving` and is
//! only cleared by an explicit release. The completion wait polls the
//! adapter between sleeps and races against the estop signal, so an estop
//! issued from another task interrupts the wait within one poll interval.

use crate::config::{check_rate, RailConfig};
use crate::error::{MotionResult, RailError, RailResult};
use crate::events::RailEvent;
use crate::link::{link_for_address, Direction, LinkAdapter, RAIL_AXIS};
use log::{error, info, warn};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex as StdMutex;
use std::time::Duration;
use tokio::sync::{broadcast, Mutex, MutexGuard, Notify};
use tokio::time::Instant;

/// Drive connection/motion state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriveState {
    Disconnected,
    Connecting,
    Ready,
    Moving,
}

impl DriveState {
    pub fn as_str(&self) -> &'static str {
        match self {
            DriveState::Disconnected => "Disconnected",
            DriveState::Connecting => "Connecting",
            DriveState::Ready => "Ready",
            DriveState::Moving => "Moving",
        }
    }
}

/// Target of a motion request.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum MotionTarget {
    /// Absolute position in mm, must lie in `[0, span]`.
    Absolute(f64),
    /// Signed relative distance in mm, scaled by `relative_move_scale`
    /// before it reaches the controller.
    Relative(f64),
}

/// A single motion intent with optional rate overrides. Overrides must be
/// supplied together or not at all.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MotionRequest {
    pub target: MotionTarget,
    pub speed: Option<f64>,
    pub acceleration: Option<f64>,
}

impl MotionRequest {
    pub fn absolute(position: f64) -> Self {
        Self {
            target: MotionTarget::Absolute(position),
            speed: None,
            acceleration: None,
        }
    }

    pub fn relative(distance: f64) -> Self {
        Self {
            target: MotionTarget::Relative(distance),
            speed: None,
            acceleration: None,
        }
    }

    pub fn with_rates(mut self, speed: f64, acceleration: f64) -> Self {
        self.speed = Some(speed);
        self.acceleration = Some(acceleration);
        self
    }
}

/// Bounded-retry policy for [`RailController::reconnect`].
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Maximum number of connection attempts.
    pub max_attempts: u32,
    /// Delay between attempts.
    pub backoff_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff_delay: Duration::from_millis(500),
        }
    }
}

/// Single-axis rail motion controller.
///
/// All methods take `&self`; share the controller behind an `Arc` to issue
/// an estop or position read while a motion call is in flight. Motion
/// operations themselves are serialized by an internal permit and a second
/// concurrent one is rejected, never queued.
pub struct RailController {
    config: RailConfig,
    link: Mutex<Box<dyn LinkAdapter>>,
    state: StdMutex<DriveState>,
    estopped: AtomicBool,
    estop_signal: Notify,
    /// Held for the duration of one motion operation; `try_lock` rejection
    /// is how a second concurrent motion fails fast.
    motion_permit: Mutex<()>,
    current_speed: StdMutex<f64>,
    current_acceleration: StdMutex<f64>,
    last_known_position: StdMutex<Option<f64>>,
    events: broadcast::Sender<RailEvent>,
}

impl RailController {
    /// Create a controller over an explicit link adapter.
    pub fn new(config: RailConfig, link: Box<dyn LinkAdapter>) -> Self {
        let (events, _) = broadcast::channel(64);
        Self {
            current_speed: StdMutex::new(config.default_speed),
            current_acceleration: StdMutex::new(config.default_acceleration),
            config,
            link: Mutex::new(link),
            state: StdMutex::new(DriveState::Disconnected),
            estopped: AtomicBool::new(false),
            estop_signal: Notify::new(),
            motion_permit: Mutex::new(()),
            last_known_position: StdMutex::new(None),
            events,
        }
    }

    /// Create a controller with the link implied by the configured address
    /// (`sim://` selects the simulator).
    pub fn from_config(config: RailConfig) -> Self {
        let link = link_for_address(&config);
        Self::new(config, link)
    }

    pub fn config(&self) -> &RailConfig {
        &self.config
    }

    /// Current drive state.
    pub fn state(&self) -> DriveState {
        *self.state.lock().unwrap()
    }

    /// Whether the emergency stop is engaged.
    pub fn is_estopped(&self) -> bool {
        self.estopped.load(Ordering::SeqCst)
    }

    /// Last successfully read position, if any.
    pub fn last_known_position(&self) -> Option<f64> {
        *self.last_known_position.lock().unwrap()
    }

    /// Currently configured (speed, acceleration).
    pub fn current_rates(&self) -> (f64, f64) {
        (
            *self.current_speed.lock().unwrap(),
            *self.current_acceleration.lock().unwrap(),
        )
    }

    /// Subscribe to operational events. Subscribers are optional; events
    /// are dropped when nobody listens.
    pub fn subscribe(&self) -> broadcast::Receiver<RailEvent> {
        self.events.subscribe()
    }

    /// Open the session and apply the default speed/acceleration.
    pub async fn connect(&self) -> RailResult<()> {
        let state = self.state();
        if state != DriveState::Disconnected {
            return Err(RailError::InvalidState(format!(
                "connect is only valid from Disconnected, drive is {}",
                state.as_str()
            )));
        }
        self.set_state(DriveState::Connecting);

        if let Err(e) = self.link.lock().await.connect().await {
            error!("rail: connection to {} failed: {}", self.config.address, e);
            self.set_state(DriveState::Disconnected);
            return Err(e);
        }

        if let Err(e) = self
            .apply_rates(self.config.default_speed, self.config.default_acceleration)
            .await
        {
            error!("rail: initial rate configuration failed: {}", e);
            let _ = self.link.lock().await.disconnect().await;
            self.set_state(DriveState::Disconnected);
            return Err(e);
        }

        self.set_state(DriveState::Ready);
        info!("rail: connected to {}", self.config.address);
        self.emit(RailEvent::Connected {
            address: self.config.address.clone(),
        });
        Ok(())
    }

    /// Tear down the session. Best-effort: adapter failures are logged and
    /// swallowed so shutdown always completes, and calling this without a
    /// prior (or after a failed) connect is harmless.
    pub async fn disconnect(&self) {
        if let Err(e) = self.link.lock().await.disconnect().await {
            warn!("rail: disconnect failed (ignored): {}", e);
        }
        self.set_state(DriveState::Disconnected);
        info!("rail: disconnected");
        self.emit(RailEvent::Disconnected);
    }

    /// Tear down and re-establish the session with bounded retries.
    pub async fn reconnect(&self, policy: &RetryPolicy) -> RailResult<()> {
        self.disconnect().await;
        let mut last_err = None;
        for attempt in 1..=policy.max_attempts {
            match self.connect().await {
                Ok(()) => return Ok(()),
                Err(e) => {
                    warn!(
                        "rail: reconnect attempt {}/{} failed: {}",
                        attempt, policy.max_attempts, e
                    );
                    last_err = Some(e);
                    if attempt < policy.max_attempts {
                        tokio::time::sleep(policy.backoff_delay).await;
                    }
                }
            }
        }
        Err(last_err.unwrap_or_else(|| RailError::Connect {
            address: self.config.address.clone(),
            reason: "retry policy allows no attempts".into(),
        }))
    }

    /// Home the rail under conservative rates, then restore the previous
    /// speed/acceleration.
    pub async fn home(&self) -> MotionResult {
        self.ensure_not_estopped()?;
        let _permit = self.acquire_motion_permit()?;
        self.ensure_ready("home")?;

        let (prev_speed, prev_accel) = self.current_rates();
        self.apply_rates(self.config.homing_speed, self.config.homing_acceleration)
            .await?;

        self.set_state(DriveState::Moving);
        let result = self.run_home().await;
        self.set_state(DriveState::Ready);

        // Restore travel rates whatever the homing outcome was
        if let Err(e) = self.apply_rates(prev_speed, prev_accel).await {
            warn!("rail: failed to restore rates after homing: {}", e);
        }

        match result {
            Ok(position) => {
                info!("rail: homed, position {:.2}", position);
                self.emit(RailEvent::Homed);
                Ok(())
            }
            Err(e) => {
                error!("rail: homing failed: {}", e);
                self.emit(RailEvent::MotionFailed {
                    reason: e.to_string(),
                });
                Err(e)
            }
        }
    }

    /// Move to an absolute position in `[0, span]`.
    ///
    /// Out-of-span targets are rejected before any adapter traffic. Success
    /// is verified by re-reading the position and comparing against the
    /// target within `position_tolerance`.
    pub async fn move_to(
        &self,
        position: f64,
        speed: Option<f64>,
        acceleration: Option<f64>,
    ) -> MotionResult {
        self.do_move_absolute(position, speed, acceleration)
            .await
            .map(|_| ())
    }

    /// Move by a signed relative distance and return the freshly read
    /// position. The distance is scaled by `relative_move_scale` before it
    /// is sent; the sign selects the direction, the magnitude is absolute.
    pub async fn move_relative(
        &self,
        distance: f64,
        speed: Option<f64>,
        acceleration: Option<f64>,
    ) -> RailResult<f64> {
        self.ensure_not_estopped()?;
        let overrides = Self::resolve_overrides(speed, acceleration)?;
        let _permit = self.acquire_motion_permit()?;
        self.ensure_ready("move_relative")?;

        if let Some((v, a)) = overrides {
            self.apply_rates(v, a).await?;
        }

        let scaled = distance * self.config.relative_move_scale;
        let (direction, magnitude) = if scaled >= 0.0 {
            (Direction::Positive, scaled)
        } else {
            (Direction::Negative, -scaled)
        };

        self.set_state(DriveState::Moving);
        let result = self.run_relative(direction, magnitude).await;
        self.set_state(DriveState::Ready);

        match result {
            Ok(position) => {
                info!(
                    "rail: relative move of {} ({} {:.2} after scaling) settled at {:.2}",
                    distance,
                    direction.as_str(),
                    magnitude,
                    position
                );
                self.emit(RailEvent::MotionComplete { position });
                Ok(position)
            }
            Err(e) => {
                error!("rail: relative move of {} failed: {}", distance, e);
                self.emit(RailEvent::MotionFailed {
                    reason: e.to_string(),
                });
                Err(e)
            }
        }
    }

    /// Dispatch a [`MotionRequest`] and return the resulting position.
    pub async fn execute(&self, request: MotionRequest) -> RailResult<f64> {
        match request.target {
            MotionTarget::Absolute(position) => {
                self.do_move_absolute(position, request.speed, request.acceleration)
                    .await
            }
            MotionTarget::Relative(distance) => {
                self.move_relative(distance, request.speed, request.acceleration)
                    .await
            }
        }
    }

    /// Stop all motion. Valid from any state except `Disconnected`; the
    /// drive always lands in `Ready`.
    pub async fn stop(&self) -> MotionResult {
        self.ensure_connected("stop")?;
        let result = self.link.lock().await.stop_all().await;
        self.set_state(DriveState::Ready);
        match result {
            Ok(()) => {
                info!("rail: all motion stopped");
                self.emit(RailEvent::Stopped);
                Ok(())
            }
            Err(e) => {
                error!("rail: stop failed: {}", e);
                Err(e)
            }
        }
    }

    /// Trigger the emergency stop. The estop flag is raised and any
    /// in-flight completion wait is woken before the adapter command goes
    /// out, so the flag holds even if the command itself fails.
    pub async fn estop(&self) -> MotionResult {
        self.ensure_connected("estop")?;
        self.estopped.store(true, Ordering::SeqCst);
        self.estop_signal.notify_waiters();
        match self.link.lock().await.estop().await {
            Ok(()) => {
                warn!("rail: emergency stop engaged");
                self.emit(RailEvent::EstopEngaged);
                Ok(())
            }
            Err(e) => {
                error!("rail: estop command failed: {}", e);
                Err(e)
            }
        }
    }

    /// Release the emergency stop. The flag clears only once the controller
    /// accepts the release; no re-home or reconfiguration is implied.
    pub async fn release_estop(&self) -> MotionResult {
        self.ensure_connected("release_estop")?;
        self.link.lock().await.release_estop().await?;
        self.estopped.store(false, Ordering::SeqCst);
        info!("rail: emergency stop released");
        self.emit(RailEvent::EstopReleased);
        Ok(())
    }

    /// Read the current position. Caches the value on success; failures
    /// surface as [`RailError::Read`], never as a stale substitute.
    pub async fn get_position(&self) -> RailResult<f64> {
        if self.state() == DriveState::Disconnected {
            return Err(RailError::Read("drive is disconnected".into()));
        }
        self.read_position_cached().await
    }

    /// Reconfigure travel speed and acceleration. Rejected while a motion
    /// operation is in flight.
    pub async fn configure(&self, speed: f64, acceleration: f64) -> RailResult<()> {
        let _permit = self.acquire_motion_permit()?;
        self.ensure_ready("configure")?;
        self.apply_rates(speed, acceleration).await?;
        info!(
            "rail: reconfigured to {} mm/s, {} mm/s²",
            speed, acceleration
        );
        Ok(())
    }

    fn set_state(&self, state: DriveState) {
        *self.state.lock().unwrap() = state;
    }

    fn emit(&self, event: RailEvent) {
        let _ = self.events.send(event);
    }

    fn ensure_not_estopped(&self) -> RailResult<()> {
        if self.is_estopped() {
            return Err(RailError::Estopped);
        }
        Ok(())
    }

    fn ensure_ready(&self, op: &str) -> RailResult<()> {
        let state = self.state();
        if state != DriveState::Ready {
            return Err(RailError::InvalidState(format!(
                "{} requires the Ready state, drive is {}",
                op,
                state.as_str()
            )));
        }
        Ok(())
    }

    fn ensure_connected(&self, op: &str) -> RailResult<()> {
        if self.state() == DriveState::Disconnected {
            return Err(RailError::InvalidState(format!(
                "{} requires a connected drive",
                op
            )));
        }
        Ok(())
    }

    fn acquire_motion_permit(&self) -> RailResult<MutexGuard<'_, ()>> {
        self.motion_permit.try_lock().map_err(|_| {
            RailError::InvalidState("another motion operation is in flight".into())
        })
    }

    /// Both-or-neither override rule: a lone speed or acceleration override
    /// is rejected instead of silently nulling out its counterpart.
    fn resolve_overrides(
        speed: Option<f64>,
        acceleration: Option<f64>,
    ) -> RailResult<Option<(f64, f64)>> {
        match (speed, acceleration) {
            (None, None) => Ok(None),
            (Some(v), Some(a)) => Ok(Some((v, a))),
            _ => Err(RailError::Config(
                "speed and acceleration overrides must be supplied together".into(),
            )),
        }
    }

    /// Validate and push a speed/acceleration pair to the controller, then
    /// record it as the current configuration.
    async fn apply_rates(&self, speed: f64, acceleration: f64) -> RailResult<()> {
        check_rate("speed", speed).map_err(|e| RailError::Config(e.to_string()))?;
        check_rate("acceleration", acceleration).map_err(|e| RailError::Config(e.to_string()))?;
        {
            let mut link = self.link.lock().await;
            link.set_speed(speed).await?;
            link.set_acceleration(acceleration).await?;
        }
        *self.current_speed.lock().unwrap() = speed;
        *self.current_acceleration.lock().unwrap() = acceleration;
        Ok(())
    }

    async fn do_move_absolute(
        &self,
        position: f64,
        speed: Option<f64>,
        acceleration: Option<f64>,
    ) -> RailResult<f64> {
        self.ensure_not_estopped()?;
        if position < 0.0 || position > self.config.span {
            return Err(RailError::OutOfRange {
                position,
                span: self.config.span,
            });
        }
        let overrides = Self::resolve_overrides(speed, acceleration)?;
        let _permit = self.acquire_motion_permit()?;
        self.ensure_ready("move")?;

        if let Some((v, a)) = overrides {
            self.apply_rates(v, a).await?;
        }

        self.set_state(DriveState::Moving);
        self.emit(RailEvent::MotionStarted { target: position });
        let result = self.run_move(position).await;
        self.set_state(DriveState::Ready);

        match result {
            Ok(actual) => {
                info!("rail: moved to {:.2} (target {:.2})", actual, position);
                self.emit(RailEvent::MotionComplete { position: actual });
                Ok(actual)
            }
            Err(e) => {
                error!("rail: move to {} failed: {}", position, e);
                self.emit(RailEvent::MotionFailed {
                    reason: e.to_string(),
                });
                Err(e)
            }
        }
    }

    async fn run_move(&self, position: f64) -> RailResult<f64> {
        self.link
            .lock()
            .await
            .move_absolute(RAIL_AXIS, position)
            .await?;
        self.wait_for_completion().await?;
        self.verify_position(position).await
    }

    async fn run_relative(&self, direction: Direction, magnitude: f64) -> RailResult<f64> {
        self.link
            .lock()
            .await
            .move_relative(RAIL_AXIS, direction, magnitude)
            .await?;
        self.wait_for_completion().await?;
        self.read_position_cached().await
    }

    async fn run_home(&self) -> RailResult<f64> {
        self.link.lock().await.home(RAIL_AXIS).await?;
        self.wait_for_completion().await?;
        self.read_position_cached().await
    }

    /// Poll the adapter until motion completes, the timeout expires, or an
    /// estop interrupts the wait. The link mutex is released between polls
    /// so a concurrent estop can always issue its command.
    async fn wait_for_completion(&self) -> RailResult<()> {
        let timeout = self.config.completion_timeout();
        let deadline = Instant::now() + timeout;
        loop {
            if self.is_estopped() {
                return Err(RailError::Estopped);
            }
            let done = self.link.lock().await.motion_complete(RAIL_AXIS).await?;
            if done {
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(RailError::CompletionTimeout(timeout));
            }
            tokio::select! {
                _ = self.estop_signal.notified() => return Err(RailError::Estopped),
                _ = tokio::time::sleep(self.config.poll_interval()) => {}
            }
        }
    }

    async fn verify_position(&self, target: f64) -> RailResult<f64> {
        let actual = self.read_position_cached().await?;
        let deviation = (actual - target).abs();
        if deviation > self.config.position_tolerance {
            return Err(RailError::MotionFault(format!(
                "settled at {:.3}, {:.3} away from target {:.3} (tolerance {})",
                actual, deviation, target, self.config.position_tolerance
            )));
        }
        Ok(actual)
    }

    async fn read_position_cached(&self) -> RailResult<f64> {
        let position = self.link.lock().await.get_position(RAIL_AXIS).await?;
        *self.last_known_position.lock().unwrap() = Some(position);
        Ok(position)
    }
}
