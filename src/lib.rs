//! urctl - Universal Robots control session library
//!
//! Talks to a UR controller over its three TCP interfaces: RTDE for
//! synchronized telemetry and setpoints, the secondary script port for
//! URScript programs, and the dashboard server for program control.
//! A supervisor tracks each submitted program from sending to a terminal
//! state by watching a pair of sentinel output bit registers.
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use urctl::RobotSession;
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let robot = RobotSession::new_with_config("config/default.yaml").await?;
//!
//!     let state = robot
//!         .supervisor()
//!         .run("def hello():\n  popup(\"Hello\")\nend\n", Duration::from_secs(30))
//!         .await?;
//!     println!("Program ended as {:?}", state);
//!
//!     let snapshot = robot.rtde().latest();
//!     println!("Joints: {:?}", snapshot.actual_q());
//!
//!     robot.shutdown().await;
//!     Ok(())
//! }
//! ```
//!
//! # Architecture
//!
//! - **RobotSession**: wires configuration, channels and supervisor together
//! - **RtdeSession**: background RTDE synchronization loop with snapshots and setpoints
//! - **ScriptChannel**: URScript submission with reconnects
//! - **DashboardClient**: dashboard server commands and queries
//! - **Supervisor**: program lifecycle tracking via sentinel registers
//! - **Connector**: TCP connection with exponential backoff

pub mod backoff;
pub mod config;
pub mod connection;
pub mod dashboard;
pub mod error;
pub mod events;
pub mod program;
pub mod recipe;
pub mod registers;
pub mod rtde;
pub mod script;
pub mod service;
pub mod session;
pub mod snapshot;
pub mod supervisor;

// High-level exports for easy usage
pub use service::RobotSession;
pub use config::Config;
pub use error::{Result, URError};
pub use supervisor::{ProgramState, Supervisor, SupervisorSettings};
pub use session::{RtdeSession, SessionSettings, SessionState};
pub use snapshot::{SetpointBuffer, Snapshot};

// Core component exports for advanced usage
pub use backoff::{Clock, RetryPolicy, TokioClock};
pub use connection::{ConnectionState, Connector};
pub use dashboard::DashboardClient;
pub use events::{ErrorEvent, ProgramEvent, SessionEvent};
pub use recipe::{FieldSpec, MissingFieldPolicy, Recipe, RecipeFile, TypeTag, Value};
pub use registers::{DigitalIo, IoGroup, RegisterBank, RobotStatusBits, SafetyStatus};
pub use script::ScriptChannel;
pub use supervisor::{ProgramControl, ScriptSink, TelemetrySource};
