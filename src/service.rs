//! Sorter service - high-level wrapper for embedding the daemon
//!
//! Wires the telemetry listener, the sort controller, the command channel and
//! the inventory store together, and exposes the operations the console (or
//! any other front end) needs.

use anyhow::Context;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};
use crate::{
    command::{CommandChannel, ScriptTransmitter},
    config::SorterConfig,
    controller::{ControllerHandle, ControllerStatus, SortController, StartOutcome},
    error::{Result, SortError},
    events::{ChangeOrigin, ReportEvent, ReportKind},
    inventory::{Color, Counts, InventoryStore, JsonFileInventory, MemoryInventory},
    listener::TelemetryListener,
    scripts::{DirectoryScriptSource, ScriptSource},
    sequencer::{SequenceState, Sequencer},
};

const LISTENER_CHANNEL_CAPACITY: usize = 256;
const REPORT_CHANNEL_CAPACITY: usize = 1024;

/// A started service plus a report stream subscribed before the listener bind
pub struct Started {
    pub service: SorterService,
    pub reports: broadcast::Receiver<ReportEvent>,
}

#[derive(Clone)]
pub struct SorterService {
    config: Arc<SorterConfig>,
    listener: Arc<Mutex<TelemetryListener>>,
    controller: ControllerHandle,
    controller_task: Arc<Mutex<Option<JoinHandle<()>>>>,
    transmitter: Arc<dyn ScriptTransmitter>,
    inventory: Arc<dyn InventoryStore>,
    reports: broadcast::Sender<ReportEvent>,
}

impl SorterService {
    /// Load configuration from a YAML file and start the service
    pub async fn new_with_config(config_path: impl AsRef<Path>) -> anyhow::Result<Started> {
        let config =
            SorterConfig::load_from_path(config_path).context("Failed to load configuration")?;
        Self::from_config(config).await
    }

    /// Build the configured collaborators and start the service
    ///
    /// Scripts are read from `scripts.dir`; inventory is kept in a JSON file
    /// when `inventory.path` is set and in memory otherwise.
    pub async fn from_config(config: SorterConfig) -> anyhow::Result<Started> {
        let scripts: Arc<dyn ScriptSource> =
            Arc::new(DirectoryScriptSource::new(&config.scripts.dir));
        let inventory: Arc<dyn InventoryStore> = match &config.inventory.path {
            Some(path) => Arc::new(
                JsonFileInventory::open(path)
                    .await
                    .with_context(|| format!("Failed to open inventory file {}", path.display()))?,
            ),
            None => {
                info!("No inventory file configured, keeping counts in memory");
                Arc::new(MemoryInventory::new())
            }
        };

        let started = Self::start(config, scripts, inventory)
            .await
            .context("Failed to start sorter service")?;
        Ok(started)
    }

    /// Start the service and try to bind the telemetry listener
    ///
    /// Returns once the bind outcome is known. A bind failure leaves the
    /// service running with the listener stopped: the failure is published on
    /// the returned report stream, and [`SorterService::start_listener`] can be
    /// retried later.
    pub async fn start(
        config: SorterConfig,
        scripts: Arc<dyn ScriptSource>,
        inventory: Arc<dyn InventoryStore>,
    ) -> Result<Started> {
        let transmitter = Arc::new(CommandChannel::new(&config.robot, scripts));
        info!("Robot command endpoint is {}", transmitter.endpoint());

        let service = Self::new(config, transmitter, inventory)?;
        let reports = service.subscribe();
        if let Err(e) = service.start_listener().await {
            warn!("Continuing without telemetry: {}", e);
        }
        Ok(Started { service, reports })
    }

    /// Assemble the service without binding the listener
    pub fn new(
        config: SorterConfig,
        transmitter: Arc<dyn ScriptTransmitter>,
        inventory: Arc<dyn InventoryStore>,
    ) -> Result<Self> {
        let (reports, _) = broadcast::channel(REPORT_CHANNEL_CAPACITY);
        let (listener, telemetry) =
            TelemetryListener::with_channel(&config.telemetry.bind_host, LISTENER_CHANNEL_CAPACITY);

        let sequencer = Sequencer::from_config(&config.sequence.steps);
        let (controller, task) = SortController::spawn(
            sequencer,
            Arc::clone(&transmitter),
            Arc::clone(&inventory),
            reports.clone(),
            telemetry,
        )?;

        Ok(Self {
            config: Arc::new(config),
            listener: Arc::new(Mutex::new(listener)),
            controller,
            controller_task: Arc::new(Mutex::new(Some(task))),
            transmitter,
            inventory,
            reports,
        })
    }

    pub fn config(&self) -> &SorterConfig {
        &self.config
    }

    /// Observe report events from this point on
    pub fn subscribe(&self) -> broadcast::Receiver<ReportEvent> {
        self.reports.subscribe()
    }

    pub async fn start_listener(&self) -> Result<SocketAddr> {
        let mut listener = self.listener.lock().await;
        let addr = listener.start(self.config.telemetry.port).await?;
        Ok(addr)
    }

    pub async fn stop_listener(&self) {
        self.listener.lock().await.stop().await;
    }

    pub async fn telemetry_addr(&self) -> Option<SocketAddr> {
        self.listener.lock().await.local_addr()
    }

    /// Begin a sort-all run; requires the telemetry listener to be up
    pub async fn start_sequence(&self) -> Result<StartOutcome> {
        if !self.listener.lock().await.is_listening() {
            warn!("Sort all requested while the telemetry listener is down");
            return Err(SortError::NotListening);
        }
        self.controller.start_sequence().await
    }

    pub async fn cancel_sequence(&self) -> Result<SequenceState> {
        self.controller.cancel_sequence().await
    }

    /// Send one script outside any sequencing run
    pub async fn send_script(&self, script: &str) -> Result<()> {
        match self.transmitter.send_script(script).await {
            Ok(()) => {
                info!("Sent {}", script);
                self.report(ReportKind::ScriptSent { script: script.to_string() });
                Ok(())
            }
            Err(e) => {
                error!("{}", e);
                let _ = self.reports.send(ReportEvent::script_failed(&e));
                Err(e.into())
            }
        }
    }

    /// Apply an operator correction to one colour's count
    pub async fn adjust_count(&self, color: Color, delta: i64) -> Result<u64> {
        match self.inventory.change_count(color, delta).await {
            Ok(count) => {
                info!("Adjusted {} by {:+}; inventory now {}", color, delta, count);
                self.report(ReportKind::InventoryChanged {
                    color,
                    delta,
                    count,
                    origin: ChangeOrigin::Manual,
                });
                Ok(count)
            }
            Err(e) => {
                error!("Adjusting {} failed: {}", color, e);
                self.report(ReportKind::InventoryFailed {
                    color,
                    delta,
                    error: e.to_string(),
                });
                Err(e.into())
            }
        }
    }

    pub async fn counts(&self) -> Result<Counts> {
        Ok(self.inventory.get_counts().await?)
    }

    /// Sequencer state plus the aggregator's running quantities
    pub async fn status(&self) -> Result<ControllerStatus> {
        self.controller.status().await
    }

    /// Stop the listener, then the controller
    pub async fn shutdown(&self) {
        info!("Shutting down sorter service");
        self.stop_listener().await;
        self.controller.shutdown().await;

        if let Some(task) = self.controller_task.lock().await.take() {
            if let Err(e) = task.await {
                error!("Sort controller task failed: {}", e);
            }
        }
    }

    fn report(&self, kind: ReportKind) {
        let _ = self.reports.send(ReportEvent::new(kind));
    }
}
