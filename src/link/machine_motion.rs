//! TCP link adapter for the MachineMotion rail controller.
//!
//! The controller speaks a newline-delimited ASCII command protocol. Every
//! command is acknowledged with `OK` or `ERR <reason>`; queries answer with
//! a payload line instead:
//!
//! ```text
//! -> SPEED 50
//! <- OK
//! -> MOVE 1 100
//! <- OK
//! -> STATUS 1
//! <- MOVING
//! -> POS 1
//! <- 100.00
//! ```
//!
//! Acknowledgement only means the controller accepted the command; motion
//! completion is observed by polling `STATUS`.

use crate::error::{RailError, RailResult};
use crate::link::{Direction, LinkAdapter};
use async_trait::async_trait;
use log::debug;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;

const DEFAULT_RESPONSE_TIMEOUT_MS: u64 = 2_000;
const DEFAULT_CONNECT_TIMEOUT_MS: u64 = 5_000;

/// Link adapter for a MachineMotion-style controller over TCP.
pub struct MachineMotionLink {
    /// Controller address as `host:port`.
    address: String,
    /// Per-transaction response deadline.
    response_timeout: Duration,
    /// Connection establishment deadline.
    connect_timeout: Duration,
    /// Open session, if any.
    session: Option<Session>,
}

struct Session {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
}

impl MachineMotionLink {
    pub fn new(address: String) -> Self {
        Self {
            address,
            response_timeout: Duration::from_millis(DEFAULT_RESPONSE_TIMEOUT_MS),
            connect_timeout: Duration::from_millis(DEFAULT_CONNECT_TIMEOUT_MS),
            session: None,
        }
    }

    /// Set the per-transaction response timeout.
    pub fn with_response_timeout(mut self, timeout: Duration) -> Self {
        self.response_timeout = timeout;
        self
    }

    /// Send one command line and read one response line.
    async fn transaction(&mut self, command: &str) -> Result<String, String> {
        let timeout = self.response_timeout;
        let session = self
            .session
            .as_mut()
            .ok_or_else(|| "link not connected".to_string())?;

        let line = format!("{}\n", command);
        session
            .writer
            .write_all(line.as_bytes())
            .await
            .map_err(|e| format!("write failed: {}", e))?;

        let mut response = String::new();
        let read = tokio::time::timeout(timeout, session.reader.read_line(&mut response))
            .await
            .map_err(|_| format!("no response to '{}' within {:?}", command, timeout))?
            .map_err(|e| format!("read failed: {}", e))?;
        if read == 0 {
            return Err("controller closed the connection".to_string());
        }

        let response = response.trim().to_string();
        debug!("rail link: '{}' -> '{}'", command, response);
        Ok(response)
    }

    /// Send a command that must be acknowledged with `OK`.
    async fn command(&mut self, command: &str) -> Result<(), String> {
        let response = self.transaction(command).await?;
        if response == "OK" {
            Ok(())
        } else if let Some(reason) = response.strip_prefix("ERR ") {
            Err(format!("controller rejected '{}': {}", command, reason))
        } else {
            Err(format!(
                "unexpected response to '{}': '{}'",
                command, response
            ))
        }
    }
}

#[async_trait]
impl LinkAdapter for MachineMotionLink {
    async fn connect(&mut self) -> RailResult<()> {
        let stream = tokio::time::timeout(self.connect_timeout, TcpStream::connect(&self.address))
            .await
            .map_err(|_| RailError::Connect {
                address: self.address.clone(),
                reason: format!("timed out after {:?}", self.connect_timeout),
            })?
            .map_err(|e| RailError::Connect {
                address: self.address.clone(),
                reason: e.to_string(),
            })?;

        let (read_half, write_half) = stream.into_split();
        self.session = Some(Session {
            reader: BufReader::new(read_half),
            writer: write_half,
        });
        debug!("rail link: connected to {}", self.address);
        Ok(())
    }

    async fn disconnect(&mut self) -> RailResult<()> {
        if let Some(mut session) = self.session.take() {
            // Shutdown failures are not interesting; the session is dropped
            // either way.
            let _ = session.writer.shutdown().await;
            debug!("rail link: disconnected from {}", self.address);
        }
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.session.is_some()
    }

    async fn set_speed(&mut self, speed: f64) -> RailResult<()> {
        self.command(&format!("SPEED {}", speed))
            .await
            .map_err(RailError::Config)
    }

    async fn set_acceleration(&mut self, acceleration: f64) -> RailResult<()> {
        self.command(&format!("ACCEL {}", acceleration))
            .await
            .map_err(RailError::Config)
    }

    async fn move_absolute(&mut self, axis: u8, position: f64) -> RailResult<()> {
        self.command(&format!("MOVE {} {}", axis, position))
            .await
            .map_err(RailError::MotionFault)
    }

    async fn move_relative(
        &mut self,
        axis: u8,
        direction: Direction,
        magnitude: f64,
    ) -> RailResult<()> {
        self.command(&format!("MOVEREL {} {} {}", axis, direction.as_str(), magnitude))
            .await
            .map_err(RailError::MotionFault)
    }

    async fn home(&mut self, axis: u8) -> RailResult<()> {
        self.command(&format!("HOME {}", axis))
            .await
            .map_err(RailError::MotionFault)
    }

    async fn stop_all(&mut self) -> RailResult<()> {
        self.command("STOP").await.map_err(RailError::MotionFault)
    }

    async fn estop(&mut self) -> RailResult<()> {
        self.command("ESTOP").await.map_err(RailError::MotionFault)
    }

    async fn release_estop(&mut self) -> RailResult<()> {
        self.command("RELEASE")
            .await
            .map_err(RailError::MotionFault)
    }

    async fn motion_complete(&mut self, axis: u8) -> RailResult<bool> {
        let response = self
            .transaction(&format!("STATUS {}", axis))
            .await
            .map_err(RailError::MotionFault)?;
        match response.as_str() {
            "IDLE" => Ok(true),
            "MOVING" => Ok(false),
            other => Err(RailError::MotionFault(format!(
                "unexpected status response: '{}'",
                other
            ))),
        }
    }

    async fn get_position(&mut self, axis: u8) -> RailResult<f64> {
        let response = self
            .transaction(&format!("POS {}", axis))
            .await
            .map_err(RailError::Read)?;
        response
            .parse::<f64>()
            .map_err(|_| RailError::Read(format!("failed to parse position: '{}'", response)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_link_creation() {
        let link = MachineMotionLink::new("192.168.7.2:9999".to_string());
        assert!(!link.is_connected());
        assert_eq!(link.address, "192.168.7.2:9999");
    }

    #[test]
    fn test_builder_timeout() {
        let link = MachineMotionLink::new("192.168.7.2:9999".to_string())
            .with_response_timeout(Duration::from_millis(500));
        assert_eq!(link.response_timeout, Duration::from_millis(500));
    }

    #[tokio::test]
    async fn test_commands_fail_when_not_connected() {
        let mut link = MachineMotionLink::new("192.168.7.2:9999".to_string());
        assert!(link.set_speed(50.0).await.is_err());
        assert!(link.get_position(1).await.is_err());
        // Disconnect is a no-op without a session
        assert!(link.disconnect().await.is_ok());
    }

    #[tokio::test]
    async fn test_transaction_against_scripted_server() {
        use tokio::net::TcpListener;

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let (read_half, mut write_half) = stream.into_split();
            let mut lines = BufReader::new(read_half).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                let reply = match line.as_str() {
                    "SPEED 50" => "OK",
                    "MOVE 1 100" => "OK",
                    "STATUS 1" => "IDLE",
                    "POS 1" => "100.0",
                    "SPEED 5000" => "ERR speed out of range",
                    _ => "ERR unknown command",
                };
                write_half
                    .write_all(format!("{}\n", reply).as_bytes())
                    .await
                    .unwrap();
            }
        });

        let mut link = MachineMotionLink::new(addr.to_string());
        link.connect().await.unwrap();
        assert!(link.is_connected());

        link.set_speed(50.0).await.unwrap();
        link.move_absolute(1, 100.0).await.unwrap();
        assert!(link.motion_complete(1).await.unwrap());
        assert_eq!(link.get_position(1).await.unwrap(), 100.0);

        let err = link.set_speed(5000.0).await.unwrap_err();
        assert!(matches!(err, RailError::Config(_)));

        link.disconnect().await.unwrap();
        server.abort();
    }
}
