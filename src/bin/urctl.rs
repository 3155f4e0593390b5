//! urctl - Universal Robots control session CLI
//!
//! Runs a URScript program under supervision or streams telemetry as JSON lines.
//! Logs go to stderr, events to stdout.

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;
use urctl::events::{output_event, ErrorEvent, SessionEvent};
use urctl::{ProgramState, RobotSession};

#[derive(Parser)]
#[command(name = "urctl")]
#[command(about = "Supervised control session for Universal Robots controllers")]
#[command(version)]
struct Args {
    /// Path to the configuration file
    #[arg(short, long, global = true)]
    config: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Submit a URScript file and wait until it reaches a terminal state
    Run {
        /// URScript program file
        program: String,

        /// Seconds to wait for the program before aborting it
        #[arg(short, long, default_value = "300")]
        timeout: u64,
    },
    /// Print every telemetry sample as a JSON line until interrupted
    Monitor {
        /// Only print every n-th sample
        #[arg(long, default_value = "1")]
        every: u64,
    },
    /// Send a raw dashboard command and print the reply
    Dashboard {
        /// Command line, e.g. "robotmode"
        command: Vec<String>,
    },
}

impl Args {
    fn get_config_path(&self) -> String {
        self.config
            .clone()
            .or_else(|| std::env::var("URCTL_CONFIG").ok())
            .unwrap_or_else(|| "config/default.yaml".to_string())
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let config_path = args.get_config_path();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    info!("Using config: {}", config_path);
    let robot = RobotSession::new_with_config(&config_path)
        .await
        .context("Failed to start robot session")?;

    let outcome = match &args.command {
        Commands::Run { program, timeout } => run_program(&robot, program, Duration::from_secs(*timeout)).await,
        Commands::Monitor { every } => monitor(&robot, (*every).max(1)).await,
        Commands::Dashboard { command } => dashboard(&robot, &command.join(" ")).await,
    };

    robot.shutdown().await;
    info!("Shutdown complete");
    outcome
}

async fn run_program(robot: &RobotSession, path: &str, timeout: Duration) -> Result<()> {
    let program = std::fs::read_to_string(path).with_context(|| format!("Failed to read program {}", path))?;
    let supervisor = robot.supervisor();

    let mut events = supervisor.subscribe_events();
    let printer = tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => output_event(&event),
                Err(RecvError::Lagged(missed)) => warn!("Dropped {} program events", missed),
                Err(RecvError::Closed) => break,
            }
        }
    });

    let submission = match supervisor.submit(&program).await {
        Ok(id) => id,
        Err(e) => {
            output_event(&ErrorEvent::new(&e.to_string(), None));
            printer.abort();
            return Err(e).context("Failed to submit program");
        }
    };

    let state = tokio::select! {
        waited = supervisor.wait(timeout) => waited,
        _ = tokio::signal::ctrl_c() => {
            info!("Interrupted, aborting program");
            supervisor.abort().await.map(|_| ProgramState::Idle)
        }
    };
    // let the last transition reach stdout
    tokio::time::sleep(Duration::from_millis(50)).await;
    printer.abort();

    match state {
        Ok(ProgramState::Finished) => Ok(()),
        Ok(other) => bail!("Program {} ended as {:?}", submission, other),
        Err(e) => {
            error!(submission, "Program did not complete: {}", e);
            output_event(&ErrorEvent::new(&e.to_string(), Some(submission)));
            if let Err(abort) = supervisor.abort().await {
                warn!("Abort after timeout failed: {}", abort);
            }
            Err(e).context("Program did not complete")
        }
    }
}

async fn monitor(robot: &RobotSession, every: u64) -> Result<()> {
    let rtde = robot.rtde();
    let mut snapshots = rtde.subscribe();
    let mut states = rtde.subscribe_state();
    output_event(&SessionEvent::state_change(rtde.state()));

    loop {
        tokio::select! {
            changed = snapshots.changed() => {
                if changed.is_err() {
                    break;
                }
                let snapshot = snapshots.borrow_and_update().clone();
                if snapshot.sequence % every == 0 {
                    output_event(&SessionEvent::from_snapshot(rtde.state(), &snapshot));
                }
            }
            changed = states.changed() => {
                if changed.is_err() {
                    break;
                }
                let state = *states.borrow_and_update();
                output_event(&SessionEvent::state_change(state));
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted");
                break;
            }
        }
    }
    Ok(())
}

async fn dashboard(robot: &RobotSession, command: &str) -> Result<()> {
    if command.trim().is_empty() {
        bail!("No dashboard command given");
    }
    let reply = robot
        .dashboard()
        .request(command)
        .await
        .with_context(|| format!("Dashboard command '{}' failed", command))?;
    println!("{}", reply);
    Ok(())
}
