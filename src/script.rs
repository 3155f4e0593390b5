//! Raw script channel
//!
//! Program text goes to the controller's script port as-is, newline
//! terminated. The controller never answers on this channel.

use crate::connection::Connector;
use crate::supervisor::ScriptSink;
use crate::Result;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

pub const DEFAULT_SEND_ATTEMPTS: u32 = 3;
pub const DEFAULT_WRITE_TIMEOUT: Duration = Duration::from_secs(2);

pub struct ScriptChannel {
    connector: Arc<Connector>,
    write_timeout: Duration,
    send_attempts: u32,
}

impl ScriptChannel {
    pub fn new(connector: Arc<Connector>) -> Self {
        Self {
            connector,
            write_timeout: DEFAULT_WRITE_TIMEOUT,
            send_attempts: DEFAULT_SEND_ATTEMPTS,
        }
    }

    pub fn with_write_timeout(mut self, timeout: Duration) -> Self {
        self.write_timeout = timeout;
        self
    }

    pub fn with_send_attempts(mut self, attempts: u32) -> Self {
        self.send_attempts = attempts.max(1);
        self
    }

    pub fn connector(&self) -> &Arc<Connector> {
        &self.connector
    }

    pub async fn connect(&self) -> Result<()> {
        self.connector.connect().await
    }

    pub async fn disconnect(&self) {
        self.connector.disconnect().await;
    }

    /// Send one program, retrying transient failures a bounded number of times
    pub async fn send(&self, program: &str) -> Result<()> {
        let mut framed = program.trim_end().to_string();
        framed.push('\n');

        let mut attempt = 1;
        loop {
            let outcome = match self.connector.connect().await {
                Ok(()) => self.connector.write_all(framed.as_bytes(), self.write_timeout).await,
                Err(e) => Err(e),
            };

            match outcome {
                Ok(()) => {
                    debug!(bytes = framed.len(), attempt, "Program sent");
                    return Ok(());
                }
                Err(e) if e.is_transient() && attempt < self.send_attempts => {
                    warn!(attempt, max_attempts = self.send_attempts, "Program send failed, retrying: {}", e);
                    attempt += 1;
                }
                Err(e) => {
                    warn!(attempt, "Program send failed: {}", e);
                    return Err(e);
                }
            }
        }
    }
}

#[async_trait]
impl ScriptSink for ScriptChannel {
    async fn send_program(&self, program: &str) -> Result<()> {
        info!(chars = program.len(), "Sending program to script channel");
        self.send(program).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backoff::RetryPolicy;
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn test_program_is_newline_terminated() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let server = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut received = Vec::new();
            socket.read_to_end(&mut received).await.unwrap();
            String::from_utf8(received).unwrap()
        });

        let connector = Arc::new(Connector::new("script", "127.0.0.1", port, RetryPolicy::default()));
        let channel = ScriptChannel::new(connector);
        channel.send("def p():\n  sleep(1)\nend\n\n").await.unwrap();
        channel.disconnect().await;

        assert_eq!(server.await.unwrap(), "def p():\n  sleep(1)\nend\n");
    }

    #[tokio::test]
    async fn test_send_fails_without_controller() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let policy = RetryPolicy::new(1, Duration::ZERO, 1.0);
        let connector = Arc::new(Connector::new("script", "127.0.0.1", port, policy));
        let channel = ScriptChannel::new(connector).with_send_attempts(2);
        assert!(channel.send("textmsg(\"hi\")").await.is_err());
    }
}
