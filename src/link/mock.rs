//! In-process rail simulator for tests and `sim://` addresses.
//!
//! Honors commands against a simulated axis position, logs every call for
//! test verification, and supports failure injection. Moves settle after a
//! configurable number of completion polls (zero by default, so a move is
//! done by the first `motion_complete` call); `hold_motion` keeps a move
//! in flight forever, which tests use to exercise estop interruption.

use crate::error::{RailError, RailResult};
use crate::link::{Direction, LinkAdapter};
use async_trait::async_trait;
use std::sync::{Arc, Mutex};

/// Simulated rail link. Cloning shares the underlying state, so tests can
/// keep a handle for inspection while the controller owns the boxed copy.
#[derive(Clone)]
pub struct MockLink {
    inner: Arc<Mutex<MockState>>,
}

struct MockState {
    connected: bool,
    estopped: bool,
    speed: f64,
    acceleration: f64,
    position: f64,
    target: f64,
    /// Completion polls remaining before the in-flight move settles.
    ticks_remaining: u32,
    /// Settle tick count applied to each new move.
    settle_ticks: u32,
    /// When set, in-flight motion never reports complete.
    hold_motion: bool,
    fail_next: bool,
    /// Number of upcoming connect attempts that should fail.
    failing_connects: u32,
    call_log: Vec<String>,
}

impl Default for MockLink {
    fn default() -> Self {
        Self::new()
    }
}

impl MockLink {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(MockState {
                connected: false,
                estopped: false,
                speed: 0.0,
                acceleration: 0.0,
                position: 0.0,
                target: 0.0,
                ticks_remaining: 0,
                settle_ticks: 0,
                hold_motion: false,
                fail_next: false,
                failing_connects: 0,
                call_log: Vec::new(),
            })),
        }
    }

    /// Require `ticks` completion polls before each move settles.
    pub fn with_settle_ticks(self, ticks: u32) -> Self {
        self.inner.lock().unwrap().settle_ticks = ticks;
        self
    }

    /// Keep in-flight motion incomplete until released or stopped.
    pub fn hold_motion(&self, hold: bool) {
        self.inner.lock().unwrap().hold_motion = hold;
    }

    /// Inject a failure for the next operation.
    pub fn inject_next_failure(&self) {
        self.inner.lock().unwrap().fail_next = true;
    }

    /// Make the next `count` connect attempts fail.
    pub fn fail_next_connects(&self, count: u32) {
        self.inner.lock().unwrap().failing_connects = count;
    }

    /// Current simulated position.
    pub fn position(&self) -> f64 {
        self.inner.lock().unwrap().position
    }

    /// Override the simulated position directly.
    pub fn set_position(&self, position: f64) {
        self.inner.lock().unwrap().position = position;
    }

    /// Last speed/acceleration the controller configured.
    pub fn rates(&self) -> (f64, f64) {
        let state = self.inner.lock().unwrap();
        (state.speed, state.acceleration)
    }

    /// Full call log.
    pub fn call_log(&self) -> Vec<String> {
        self.inner.lock().unwrap().call_log.clone()
    }

    /// Number of logged calls whose name starts with `prefix`.
    pub fn calls_matching(&self, prefix: &str) -> usize {
        self.inner
            .lock()
            .unwrap()
            .call_log
            .iter()
            .filter(|c| c.starts_with(prefix))
            .count()
    }

    fn check(state: &mut MockState, call: String) -> RailResult<()> {
        state.call_log.push(call.clone());
        if std::mem::take(&mut state.fail_next) {
            return Err(RailError::MotionFault(format!(
                "injected failure during {}",
                call
            )));
        }
        Ok(())
    }

    fn check_connected(state: &MockState) -> RailResult<()> {
        if !state.connected {
            return Err(RailError::MotionFault("link not connected".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl LinkAdapter for MockLink {
    async fn connect(&mut self) -> RailResult<()> {
        let mut state = self.inner.lock().unwrap();
        Self::check(&mut state, "connect".into()).map_err(|e| RailError::Connect {
            address: "sim://rail".into(),
            reason: e.to_string(),
        })?;
        if state.failing_connects > 0 {
            state.failing_connects -= 1;
            return Err(RailError::Connect {
                address: "sim://rail".into(),
                reason: "injected connect failure".into(),
            });
        }
        state.connected = true;
        Ok(())
    }

    async fn disconnect(&mut self) -> RailResult<()> {
        let mut state = self.inner.lock().unwrap();
        Self::check(&mut state, "disconnect".into())?;
        state.connected = false;
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.inner.lock().unwrap().connected
    }

    async fn set_speed(&mut self, speed: f64) -> RailResult<()> {
        let mut state = self.inner.lock().unwrap();
        Self::check(&mut state, format!("set_speed {}", speed))
            .map_err(|e| RailError::Config(e.to_string()))?;
        Self::check_connected(&state).map_err(|e| RailError::Config(e.to_string()))?;
        state.speed = speed;
        Ok(())
    }

    async fn set_acceleration(&mut self, acceleration: f64) -> RailResult<()> {
        let mut state = self.inner.lock().unwrap();
        Self::check(&mut state, format!("set_acceleration {}", acceleration))
            .map_err(|e| RailError::Config(e.to_string()))?;
        Self::check_connected(&state).map_err(|e| RailError::Config(e.to_string()))?;
        state.acceleration = acceleration;
        Ok(())
    }

    async fn move_absolute(&mut self, axis: u8, position: f64) -> RailResult<()> {
        let mut state = self.inner.lock().unwrap();
        Self::check(&mut state, format!("move_absolute {} {}", axis, position))?;
        Self::check_connected(&state)?;
        if state.estopped {
            return Err(RailError::MotionFault("controller is estopped".into()));
        }
        state.target = position;
        state.ticks_remaining = state.settle_ticks;
        if state.ticks_remaining == 0 && !state.hold_motion {
            state.position = position;
        }
        Ok(())
    }

    async fn move_relative(
        &mut self,
        axis: u8,
        direction: Direction,
        magnitude: f64,
    ) -> RailResult<()> {
        let signed = match direction {
            Direction::Positive => magnitude,
            Direction::Negative => -magnitude,
        };
        let mut state = self.inner.lock().unwrap();
        Self::check(
            &mut state,
            format!("move_relative {} {} {}", axis, direction.as_str(), magnitude),
        )?;
        Self::check_connected(&state)?;
        if state.estopped {
            return Err(RailError::MotionFault("controller is estopped".into()));
        }
        state.target = state.position + signed;
        state.ticks_remaining = state.settle_ticks;
        if state.ticks_remaining == 0 && !state.hold_motion {
            state.position = state.target;
        }
        Ok(())
    }

    async fn home(&mut self, axis: u8) -> RailResult<()> {
        let mut state = self.inner.lock().unwrap();
        Self::check(&mut state, format!("home {}", axis))?;
        Self::check_connected(&state)?;
        if state.estopped {
            return Err(RailError::MotionFault("controller is estopped".into()));
        }
        state.target = 0.0;
        state.ticks_remaining = state.settle_ticks;
        if state.ticks_remaining == 0 && !state.hold_motion {
            state.position = 0.0;
        }
        Ok(())
    }

    async fn stop_all(&mut self) -> RailResult<()> {
        let mut state = self.inner.lock().unwrap();
        Self::check(&mut state, "stop_all".into())?;
        Self::check_connected(&state)?;
        // Motion halts wherever it is
        state.ticks_remaining = 0;
        state.hold_motion = false;
        state.target = state.position;
        Ok(())
    }

    async fn estop(&mut self) -> RailResult<()> {
        let mut state = self.inner.lock().unwrap();
        Self::check(&mut state, "estop".into())?;
        Self::check_connected(&state)?;
        state.estopped = true;
        state.ticks_remaining = 0;
        state.target = state.position;
        Ok(())
    }

    async fn release_estop(&mut self) -> RailResult<()> {
        let mut state = self.inner.lock().unwrap();
        Self::check(&mut state, "release_estop".into())?;
        Self::check_connected(&state)?;
        state.estopped = false;
        Ok(())
    }

    async fn motion_complete(&mut self, axis: u8) -> RailResult<bool> {
        let mut state = self.inner.lock().unwrap();
        Self::check(&mut state, format!("motion_complete {}", axis))?;
        Self::check_connected(&state)?;
        if state.hold_motion {
            return Ok(false);
        }
        if state.ticks_remaining > 0 {
            state.ticks_remaining -= 1;
            if state.ticks_remaining == 0 {
                state.position = state.target;
            }
            return Ok(state.ticks_remaining == 0);
        }
        Ok(true)
    }

    async fn get_position(&mut self, axis: u8) -> RailResult<f64> {
        let mut state = self.inner.lock().unwrap();
        Self::check(&mut state, format!("get_position {}", axis))
            .map_err(|e| RailError::Read(e.to_string()))?;
        Self::check_connected(&state).map_err(|e| RailError::Read(e.to_string()))?;
        Ok(state.position)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_mock_connect_disconnect() {
        let mut link = MockLink::new();
        assert!(!link.is_connected());
        link.connect().await.unwrap();
        assert!(link.is_connected());
        link.disconnect().await.unwrap();
        assert!(!link.is_connected());
    }

    #[tokio::test]
    async fn test_mock_instant_move() {
        let mut link = MockLink::new();
        link.connect().await.unwrap();
        link.move_absolute(1, 123.0).await.unwrap();
        assert!(link.motion_complete(1).await.unwrap());
        assert_eq!(link.get_position(1).await.unwrap(), 123.0);
    }

    #[tokio::test]
    async fn test_mock_settle_ticks() {
        let mut link = MockLink::new().with_settle_ticks(2);
        link.connect().await.unwrap();
        link.move_absolute(1, 50.0).await.unwrap();
        assert!(!link.motion_complete(1).await.unwrap());
        assert!(link.motion_complete(1).await.unwrap());
        assert_eq!(link.get_position(1).await.unwrap(), 50.0);
    }

    #[tokio::test]
    async fn test_mock_estop_blocks_moves() {
        let mut link = MockLink::new();
        link.connect().await.unwrap();
        link.estop().await.unwrap();
        assert!(link.move_absolute(1, 10.0).await.is_err());
        link.release_estop().await.unwrap();
        assert!(link.move_absolute(1, 10.0).await.is_ok());
    }

    #[tokio::test]
    async fn test_mock_failure_injection_is_consumed() {
        let mut link = MockLink::new();
        link.connect().await.unwrap();
        link.inject_next_failure();
        assert!(link.move_absolute(1, 10.0).await.is_err());
        assert!(link.move_absolute(1, 10.0).await.is_ok());
    }

    #[tokio::test]
    async fn test_mock_call_log() {
        let mut link = MockLink::new();
        link.connect().await.unwrap();
        link.set_speed(50.0).await.unwrap();
        link.move_absolute(1, 10.0).await.unwrap();

        let log = link.call_log();
        assert_eq!(log[0], "connect");
        assert_eq!(log[1], "set_speed 50");
        assert_eq!(link.calls_matching("move_absolute"), 1);
    }

    #[tokio::test]
    async fn test_mock_relative_moves() {
        let mut link = MockLink::new();
        link.connect().await.unwrap();
        link.move_relative(1, Direction::Positive, 30.0).await.unwrap();
        assert_eq!(link.get_position(1).await.unwrap(), 30.0);
        link.move_relative(1, Direction::Negative, 10.0).await.unwrap();
        assert_eq!(link.get_position(1).await.unwrap(), 20.0);
    }
}
