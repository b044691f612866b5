//! sortd - telemetry and command sequencing for a colour-sorting robot
//!
//! The robot reports progress as plain text over TCP connections it opens
//! back to this host. The daemon classifies those lines, keeps a per-colour
//! inventory from the placements it sees, and runs the sort-all sequence by
//! sending one script at a time and waiting for the robot to confirm each.
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use sortd::{SorterConfig, SorterService, Started};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let Started { service, mut reports } =
//!         SorterService::from_config(SorterConfig::default()).await?;
//!
//!     service.start_sequence().await?;
//!     while let Ok(event) = reports.recv().await {
//!         println!("{}", event.to_json()?);
//!     }
//!     Ok(())
//! }
//! ```
//!
//! # Architecture
//!
//! - **TelemetryListener**: accepts robot connections and emits text lines
//! - **TelemetryClassifier**: turns lines into quantity, placement and acknowledgement events
//! - **CountAggregator**: derives inventory changes from quantities and placements
//! - **Sequencer**: sort-all state machine
//! - **SortController**: single task that owns the aggregator and sequencer
//! - **CommandChannel**: sends scripts to the robot's command port
//! - **SorterService**: wires everything together for the binary and console

pub mod aggregator;
pub mod classifier;
pub mod command;
pub mod config;
pub mod console;
pub mod controller;
pub mod error;
pub mod events;
pub mod inventory;
pub mod listener;
pub mod scripts;
pub mod sequencer;
pub mod service;

pub use aggregator::{CountAggregator, CountSnapshot, InventoryDelta};
pub use classifier::{QuantitySource, TelemetryClassifier, TelemetryEvent};
pub use command::{CommandChannel, ScriptTransmitter};
pub use config::SorterConfig;
pub use console::{run_console, ConsoleCommand};
pub use controller::{ControllerStatus, StartOutcome};
pub use error::{BindError, Result, SortError, TransmissionError, TransmissionFailure};
pub use events::{output_event, ReportEvent, ReportKind};
pub use inventory::{Color, InventoryStore, JsonFileInventory, MemoryInventory};
pub use listener::{ListenerEvent, TelemetryListener};
pub use scripts::{DirectoryScriptSource, ScriptSource, StaticScriptSource};
pub use sequencer::{SequenceState, Sequencer};
pub use service::{SorterService, Started};
