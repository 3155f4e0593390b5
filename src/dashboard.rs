//! Dashboard server client
//!
//! Line request, line reply. The server greets every new connection with one
//! line, which is consumed before the first request on that socket.

use crate::connection::Connector;
use crate::supervisor::ProgramControl;
use crate::{Result, URError};
use async_trait::async_trait;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

pub const DEFAULT_REPLY_TIMEOUT: Duration = Duration::from_secs(2);

/// Program state as reported by `programState`
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LoadedProgramState {
    pub state: String,
    pub program: Option<String>,
}

pub struct DashboardClient {
    connector: Arc<Connector>,
    reply_timeout: Duration,
    /// Connector generation whose greeting was consumed
    greeted: AtomicU64,
    /// Keeps greeting and request of one caller together
    exchange: Mutex<()>,
}

impl DashboardClient {
    pub fn new(connector: Arc<Connector>) -> Self {
        Self {
            connector,
            reply_timeout: DEFAULT_REPLY_TIMEOUT,
            greeted: AtomicU64::new(0),
            exchange: Mutex::new(()),
        }
    }

    pub fn with_reply_timeout(mut self, timeout: Duration) -> Self {
        self.reply_timeout = timeout;
        self
    }

    pub fn connector(&self) -> &Arc<Connector> {
        &self.connector
    }

    pub async fn connect(&self) -> Result<()> {
        let _exchange = self.exchange.lock().await;
        self.ensure_greeted().await
    }

    pub async fn disconnect(&self) {
        self.connector.disconnect().await;
    }

    async fn ensure_greeted(&self) -> Result<()> {
        self.connector.connect().await?;
        let generation = self.connector.generation();
        if self.greeted.load(Ordering::Acquire) != generation {
            let greeting = self.connector.read_line(self.reply_timeout).await?;
            info!(addr = self.connector.addr(), "Dashboard: {}", greeting);
            self.greeted.store(generation, Ordering::Release);
        }
        Ok(())
    }

    /// Send one command and return the reply line
    pub async fn request(&self, command: &str) -> Result<String> {
        let _exchange = self.exchange.lock().await;
        self.ensure_greeted().await?;
        let reply = self.connector.request_line(command, self.reply_timeout).await?;
        debug!(command, reply = %reply, "Dashboard request");
        Ok(reply)
    }

    /// Send a command whose reply must start with `success`
    async fn command(&self, command: &str, success: &str) -> Result<String> {
        let reply = self.request(command).await?;
        if reply.to_ascii_lowercase().starts_with(&success.to_ascii_lowercase()) {
            Ok(reply)
        } else {
            warn!(command, reply = %reply, "Dashboard command refused");
            Err(URError::InvalidState(format!("Dashboard refused '{}': {}", command, reply)))
        }
    }

    pub async fn pause(&self) -> Result<()> {
        self.command("pause", "Pausing program").await.map(|_| ())
    }

    pub async fn play(&self) -> Result<()> {
        self.command("play", "Starting program").await.map(|_| ())
    }

    pub async fn stop(&self) -> Result<()> {
        self.command("stop", "Stopped").await.map(|_| ())
    }

    pub async fn load_program(&self, program: &str) -> Result<()> {
        self.command(&format!("load {}", program), "Loading program").await.map(|_| ())
    }

    pub async fn power_on(&self) -> Result<()> {
        self.command("power on", "Powering on").await.map(|_| ())
    }

    pub async fn power_off(&self) -> Result<()> {
        self.command("power off", "Powering off").await.map(|_| ())
    }

    pub async fn brake_release(&self) -> Result<()> {
        self.command("brake release", "Brake releasing").await.map(|_| ())
    }

    pub async fn unlock_protective_stop(&self) -> Result<()> {
        self.command("unlock protective stop", "Protective stop releasing").await.map(|_| ())
    }

    pub async fn close_safety_popup(&self) -> Result<()> {
        self.command("close safety popup", "closing safety popup").await.map(|_| ())
    }

    pub async fn popup(&self, message: &str) -> Result<()> {
        self.command(&format!("popup {}", message), "showing popup").await.map(|_| ())
    }

    pub async fn close_popup(&self) -> Result<()> {
        self.command("close popup", "closing popup").await.map(|_| ())
    }

    pub async fn add_to_log(&self, message: &str) -> Result<()> {
        self.command(&format!("addToLog {}", message), "Added log message").await.map(|_| ())
    }

    /// Robot mode name, e.g. `RUNNING`
    pub async fn robotmode(&self) -> Result<String> {
        let reply = self.request("robotmode").await?;
        Ok(value_after_colon(&reply).to_string())
    }

    /// Safety status name, e.g. `NORMAL` or `PROTECTIVE_STOP`
    pub async fn safety_status(&self) -> Result<String> {
        let reply = self.request("safetystatus").await?;
        Ok(value_after_colon(&reply).to_string())
    }

    pub async fn running(&self) -> Result<bool> {
        let reply = self.request("running").await?;
        parse_bool(value_after_colon(&reply))
    }

    pub async fn is_in_remote_control(&self) -> Result<bool> {
        let reply = self.request("is in remote control").await?;
        parse_bool(&reply)
    }

    pub async fn program_state(&self) -> Result<LoadedProgramState> {
        let reply = self.request("programState").await?;
        let mut parts = reply.trim().splitn(2, ' ');
        let state = parts.next().unwrap_or_default().to_string();
        let program = parts.next().map(str::trim).filter(|p| !p.is_empty()).map(str::to_string);
        Ok(LoadedProgramState { state, program })
    }

    pub async fn loaded_program(&self) -> Result<Option<String>> {
        let reply = self.request("get loaded program").await?;
        if reply.starts_with("No program loaded") {
            Ok(None)
        } else {
            Ok(Some(value_after_colon(&reply).to_string()))
        }
    }

    pub async fn polyscope_version(&self) -> Result<String> {
        self.request("PolyscopeVersion").await
    }
}

#[async_trait]
impl ProgramControl for DashboardClient {
    async fn pause(&self) -> Result<()> {
        DashboardClient::pause(self).await
    }

    async fn resume(&self) -> Result<()> {
        self.play().await
    }
}

/// `Robotmode: RUNNING` -> `RUNNING`; replies without a colon are returned trimmed
fn value_after_colon(reply: &str) -> &str {
    reply.split_once(':').map(|(_, value)| value).unwrap_or(reply).trim()
}

fn parse_bool(value: &str) -> Result<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "true" => Ok(true),
        "false" => Ok(false),
        other => Err(URError::Protocol(format!("Expected true/false from dashboard, got '{}'", other))),
    }
}
