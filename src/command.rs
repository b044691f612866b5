//! Command channel to the robot controller
//!
//! Every script goes out on its own short-lived TCP connection: connect, write
//! the script plus a newline, hold the socket for a short grace period so the
//! controller finishes reading, then close. Nothing is read back.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tracing::{debug, info};
use crate::config::RobotConfig;
use crate::error::{TransmissionError, TransmissionFailure};
use crate::scripts::ScriptSource;

/// Anything that can deliver a named script to the robot
#[async_trait]
pub trait ScriptTransmitter: Send + Sync {
    async fn send_script(&self, script: &str) -> Result<(), TransmissionError>;
}

#[derive(Clone)]
pub struct CommandChannel {
    host: String,
    port: u16,
    connect_timeout: Duration,
    grace: Duration,
    scripts: Arc<dyn ScriptSource>,
}

impl CommandChannel {
    pub fn new(config: &RobotConfig, scripts: Arc<dyn ScriptSource>) -> Self {
        Self {
            host: config.host.clone(),
            port: config.command_port,
            connect_timeout: config.connect_timeout(),
            grace: config.send_grace(),
            scripts,
        }
    }

    pub fn endpoint(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Transmit a script body verbatim
    ///
    /// `label` only names the script in errors and logs.
    pub async fn send(&self, label: &str, body: &str) -> Result<(), TransmissionError> {
        let connect = TcpStream::connect((self.host.as_str(), self.port));
        let mut stream = match tokio::time::timeout(self.connect_timeout, connect).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                return Err(TransmissionError::new(
                    TransmissionFailure::ConnectFailed,
                    label,
                    format!("{}: {}", self.endpoint(), e),
                ))
            }
            Err(_) => {
                return Err(TransmissionError::new(
                    TransmissionFailure::ConnectFailed,
                    label,
                    format!("{}: timed out after {:?}", self.endpoint(), self.connect_timeout),
                ))
            }
        };

        let mut payload = String::with_capacity(body.len() + 1);
        payload.push_str(body);
        payload.push('\n');

        let write_failed = |e: std::io::Error| {
            TransmissionError::new(TransmissionFailure::WriteFailed, label, e)
        };
        stream.write_all(payload.as_bytes()).await.map_err(write_failed)?;
        stream.flush().await.map_err(write_failed)?;
        debug!("Wrote {} bytes of '{}' to {}", payload.len(), label, self.endpoint());

        // Closing right after the write can truncate what the controller reads
        tokio::time::sleep(self.grace).await;
        let _ = stream.shutdown().await;

        info!("Sent script '{}' to {}", label, self.endpoint());
        Ok(())
    }
}

#[async_trait]
impl ScriptTransmitter for CommandChannel {
    async fn send_script(&self, script: &str) -> Result<(), TransmissionError> {
        let body = self
            .scripts
            .load(script)
            .await
            .map_err(|e| {
                TransmissionError::new(TransmissionFailure::SourceUnavailable, script, e)
            })?;
        self.send(script, &body).await
    }
}
