//! Robot session service
//!
//! Wires configuration, recipe file, connectors, the RTDE session, the script
//! and dashboard channels and the supervisor into one handle.

use crate::backoff::RetryPolicy;
use crate::config::Config;
use crate::connection::Connector;
use crate::dashboard::DashboardClient;
use crate::recipe::{FieldSpec, Recipe, RecipeFile, TypeTag};
use crate::registers::RegisterBank;
use crate::script::ScriptChannel;
use crate::session::RtdeSession;
use crate::snapshot::{ROBOT_STATUS_BITS, SAFETY_STATUS_BITS};
use crate::supervisor::{ProgramControl, ScriptSink, Supervisor, TelemetrySource};
use crate::{Result, URError};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// Output fields the supervisor cannot work without
pub fn supervisor_output_fields(start_register: u32, finish_register: u32) -> Result<Vec<FieldSpec>> {
    let mut fields: Vec<FieldSpec> = Vec::new();
    for register in [start_register, finish_register] {
        let name = RegisterBank::Output.bit_word_field(register).ok_or_else(|| {
            URError::Config(format!("sentinel register {} has no bit word field", register))
        })?;
        if !fields.iter().any(|f| f.name == name) {
            fields.push(FieldSpec::new(&name, TypeTag::Uint32));
        }
    }
    fields.push(FieldSpec::new(ROBOT_STATUS_BITS, TypeTag::Uint32));
    fields.push(FieldSpec::new(SAFETY_STATUS_BITS, TypeTag::Uint32));
    Ok(fields)
}

/// Load both recipes, extending or rejecting the output recipe as configured
pub fn load_recipes(config: &Config) -> Result<(Recipe, Recipe)> {
    let rtde = config.rtde();
    let supervisor = config.supervisor();
    let required = supervisor_output_fields(supervisor.start_register(), supervisor.finish_register())?;

    let output_key = rtde.output_recipe();
    let input_key = rtde.input_recipe();
    let file = RecipeFile::require_on_disk(rtde.recipe_file(), &output_key, &required, rtde.missing_fields())?;

    let output = file.recipe(&output_key)?;
    let input = if file.recipes.contains_key(&input_key) {
        file.recipe(&input_key)?
    } else {
        warn!(recipe = %input_key, "No input recipe defined, setpoints are disabled");
        Recipe::default()
    };
    Ok((output, input))
}

/// Everything needed to supervise programs on one robot
pub struct RobotSession {
    config: Config,
    rtde: Arc<RtdeSession>,
    script: Arc<ScriptChannel>,
    dashboard: Arc<DashboardClient>,
    supervisor: Supervisor,
    shutdown_signal: Arc<AtomicBool>,
}

impl RobotSession {
    pub async fn new_with_config(config_path: &str) -> Result<Self> {
        let config = Config::load_from_path(config_path)?;
        Self::new(config).await
    }

    pub async fn new_with_config_str(config_str: &str) -> Result<Self> {
        let config = Config::load_from_str(config_str)?;
        Self::new(config).await
    }

    pub async fn new(config: Config) -> Result<Self> {
        let host = config.robot.host.clone();
        let ports = config.ports();
        let connection = config.connection();
        let policy = connection.retry_policy();
        let connect_timeout = connection.connect_timeout();
        info!(host = %host, rtde = ports.rtde(), script = ports.script(), dashboard = ports.dashboard(), "Initializing robot session");

        let (output, input) = load_recipes(&config)?;

        let connector = |name: &str, port: u16| {
            Arc::new(Connector::new(name, &host, port, policy).with_connect_timeout(connect_timeout))
        };

        let rtde = Arc::new(
            RtdeSession::start(connector("rtde", ports.rtde()), output, input, config.rtde().session_settings()).await?,
        );

        let script = Arc::new(
            ScriptChannel::new(connector("script", ports.script()))
                .with_send_attempts(config.supervisor().send_attempts()),
        );
        let dashboard = Arc::new(
            DashboardClient::new(connector("dashboard", ports.dashboard()))
                .with_reply_timeout(config.dashboard().reply_timeout()),
        );

        let supervisor = Supervisor::new(
            Arc::clone(&rtde) as Arc<dyn TelemetrySource>,
            Arc::clone(&script) as Arc<dyn ScriptSink>,
            Some(Arc::clone(&dashboard) as Arc<dyn ProgramControl>),
            config.supervisor().settings(),
        );

        info!(host = %host, "Robot session ready");
        Ok(Self {
            config,
            rtde,
            script,
            dashboard,
            supervisor,
            shutdown_signal: Arc::new(AtomicBool::new(false)),
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        self.config.connection().retry_policy()
    }

    pub fn rtde(&self) -> &Arc<RtdeSession> {
        &self.rtde
    }

    pub fn script(&self) -> &Arc<ScriptChannel> {
        &self.script
    }

    pub fn dashboard(&self) -> &Arc<DashboardClient> {
        &self.dashboard
    }

    pub fn supervisor(&self) -> &Supervisor {
        &self.supervisor
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutdown_signal.load(Ordering::Acquire)
    }

    /// Abort any active program and close every channel
    pub async fn shutdown(&self) {
        if self.shutdown_signal.swap(true, Ordering::AcqRel) {
            return;
        }
        info!("Shutting down robot session");

        if let Err(e) = self.supervisor.abort().await {
            warn!("Abort during shutdown failed: {}", e);
        }
        self.rtde.close().await;
        self.script.disconnect().await;
        self.dashboard.disconnect().await;
    }

    /// Poll interval of the supervisor, exposed for callers that pace their own loops
    pub fn poll_interval(&self) -> Duration {
        self.supervisor.settings().poll_interval
    }
}

impl Drop for RobotSession {
    fn drop(&mut self) {
        self.shutdown_signal.store(true, Ordering::Release);
    }
}
