//! Sort controller
//!
//! Single consumer for everything that mutates counting or sequencing state.
//! Telemetry from every connection and operator requests are funnelled into
//! one task, which classifies each line and fans the resulting events out to
//! the count aggregator, the inventory store, the sequencer and the report
//! stream, in that order.
//!
//! Script transmissions are spawned as separate tasks so a slow robot socket
//! never holds up telemetry; failures come back through the inbox.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::mpsc::error::TryRecvError;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use crate::{
    aggregator::{CountAggregator, CountSnapshot, InventoryDelta},
    classifier::{split_fragments, TelemetryClassifier, TelemetryEvent},
    command::ScriptTransmitter,
    error::{Result, SortError, TransmissionError},
    events::{ChangeOrigin, ReportEvent, ReportKind},
    inventory::InventoryStore,
    listener::ListenerEvent,
    sequencer::{SequenceState, SequenceStep, Sequencer, StepDispatch, Transition},
};

/// Telemetry events handled in a row before a waiting control message is served
const TELEMETRY_BURST: usize = 64;

/// Result of asking the controller to start a sequencing run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StartOutcome {
    Started,
    AlreadyRunning,
    /// No steps are configured; the run finished immediately
    NothingToRun,
}

/// Snapshot of controller state for status queries
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ControllerStatus {
    pub sequence: SequenceState,
    pub current_step: Option<SequenceStep>,
    pub counts: CountSnapshot,
}

#[derive(Debug)]
pub enum ControlMessage {
    StartSequence { reply: oneshot::Sender<StartOutcome> },
    CancelSequence { reply: oneshot::Sender<SequenceState> },
    Status { reply: oneshot::Sender<ControllerStatus> },
    StepFailed { run: u64, index: usize, error: TransmissionError },
    Shutdown,
}

/// Cloneable handle for talking to a running controller
#[derive(Debug, Clone)]
pub struct ControllerHandle {
    inbox: mpsc::Sender<ControlMessage>,
}

impl ControllerHandle {
    pub async fn start_sequence(&self) -> Result<StartOutcome> {
        let (reply, response) = oneshot::channel();
        self.request(ControlMessage::StartSequence { reply }, response).await
    }

    pub async fn cancel_sequence(&self) -> Result<SequenceState> {
        let (reply, response) = oneshot::channel();
        self.request(ControlMessage::CancelSequence { reply }, response).await
    }

    pub async fn status(&self) -> Result<ControllerStatus> {
        let (reply, response) = oneshot::channel();
        self.request(ControlMessage::Status { reply }, response).await
    }

    pub async fn shutdown(&self) {
        let _ = self.inbox.send(ControlMessage::Shutdown).await;
    }

    async fn request<T>(
        &self,
        message: ControlMessage,
        response: oneshot::Receiver<T>,
    ) -> Result<T> {
        self.inbox
            .send(message)
            .await
            .map_err(|_| SortError::ControllerGone)?;
        response.await.map_err(|_| SortError::ControllerGone)
    }
}

pub struct SortController {
    classifier: TelemetryClassifier,
    aggregator: CountAggregator,
    sequencer: Sequencer,
    transmitter: Arc<dyn ScriptTransmitter>,
    inventory: Arc<dyn InventoryStore>,
    reports: broadcast::Sender<ReportEvent>,
    inbox: mpsc::Receiver<ControlMessage>,
    outcomes: mpsc::WeakSender<ControlMessage>,
    telemetry: mpsc::Receiver<ListenerEvent>,
}

impl SortController {
    /// Spawn the controller task
    pub fn spawn(
        sequencer: Sequencer,
        transmitter: Arc<dyn ScriptTransmitter>,
        inventory: Arc<dyn InventoryStore>,
        reports: broadcast::Sender<ReportEvent>,
        telemetry: mpsc::Receiver<ListenerEvent>,
    ) -> Result<(ControllerHandle, JoinHandle<()>)> {
        let classifier = TelemetryClassifier::new()?;
        let (inbox_tx, inbox) = mpsc::channel(64);

        let controller = Self {
            classifier,
            aggregator: CountAggregator::new(),
            sequencer,
            transmitter,
            inventory,
            reports,
            inbox,
            outcomes: inbox_tx.downgrade(),
            telemetry,
        };

        let task = tokio::spawn(controller.run());
        Ok((ControllerHandle { inbox: inbox_tx }, task))
    }

    async fn run(mut self) {
        let steps = self.sequencer.steps().len();
        info!("Sort controller started with {} sequence steps", steps);
        let mut telemetry_open = true;
        let mut telemetry_streak = 0usize;

        loop {
            // Under a constant telemetry stream the inbox still gets a turn
            if telemetry_streak >= TELEMETRY_BURST {
                telemetry_streak = 0;
                match self.inbox.try_recv() {
                    Ok(ControlMessage::Shutdown) | Err(TryRecvError::Disconnected) => break,
                    Ok(message) => {
                        self.handle_message(message);
                        continue;
                    }
                    Err(TryRecvError::Empty) => {}
                }
            }

            tokio::select! {
                // Telemetry first: a query observes every line delivered before
                // it, unless more than TELEMETRY_BURST lines were already queued
                biased;

                event = self.telemetry.recv(), if telemetry_open => match event {
                    Some(event) => {
                        telemetry_streak += 1;
                        self.handle_telemetry(event).await;
                    }
                    None => {
                        debug!("Telemetry channel closed");
                        telemetry_open = false;
                    }
                },
                message = self.inbox.recv() => {
                    telemetry_streak = 0;
                    match message {
                        Some(ControlMessage::Shutdown) | None => break,
                        Some(message) => self.handle_message(message),
                    }
                }
            }
        }

        info!("Sort controller stopped");
    }

    fn handle_message(&mut self, message: ControlMessage) {
        match message {
            ControlMessage::StartSequence { reply } => {
                let transition = self.sequencer.start();
                let outcome = match &transition {
                    Transition::AlreadyRunning => StartOutcome::AlreadyRunning,
                    Transition::Finished => StartOutcome::NothingToRun,
                    _ => StartOutcome::Started,
                };
                if outcome == StartOutcome::Started {
                    info!("Sort all started ({} steps)", self.sequencer.steps().len());
                    self.report(ReportKind::SequenceStarted {
                        steps: self.sequencer.steps().len(),
                    });
                }
                self.apply_transition(transition);
                let _ = reply.send(outcome);
            }
            ControlMessage::CancelSequence { reply } => {
                let transition = self.sequencer.cancel();
                self.apply_transition(transition);
                let _ = reply.send(self.sequencer.state());
            }
            ControlMessage::Status { reply } => {
                let _ = reply.send(self.status());
            }
            ControlMessage::StepFailed { run, index, error } => {
                match self.sequencer.transmission_failed(run, index) {
                    Transition::Aborted { index, script } => {
                        error!("Sort all aborted at step {} ({}): {}", index, script, error);
                        self.report(ReportKind::SequenceAborted {
                            index,
                            script,
                            error: error.to_string(),
                        });
                    }
                    _ => debug!("Ignoring failure of step {} from run {}", index, run),
                }
            }
            ControlMessage::Shutdown => {}
        }
    }

    async fn handle_telemetry(&mut self, event: ListenerEvent) {
        match event {
            ListenerEvent::Line { peer, text } => {
                let peer = peer.to_string();
                for fragment in split_fragments(&text) {
                    debug!("[{}] {}", peer, fragment);
                    self.report(ReportKind::Telemetry {
                        peer: peer.clone(),
                        line: fragment.to_string(),
                    });
                    if let Some(event) = self.classifier.classify_fragment(fragment) {
                        self.dispatch(event).await;
                    }
                }
            }
            ListenerEvent::Diagnostic(message) => {
                warn!("Telemetry: {}", message);
                let _ = self.reports.send(ReportEvent::diagnostic(message));
            }
        }
    }

    /// Fan one classified event out to every consumer
    async fn dispatch(&mut self, event: TelemetryEvent) {
        if let Some(delta) = self.aggregator.apply(&event) {
            self.book(delta).await;
        }

        match event {
            TelemetryEvent::SequenceStepAcknowledged { name } => self.acknowledge(&name),
            TelemetryEvent::Unclassified { raw_line } => {
                debug!("Unclassified telemetry: {}", raw_line)
            }
            _ => {}
        }
    }

    async fn book(&mut self, delta: InventoryDelta) {
        let InventoryDelta { color, delta } = delta;
        let delta = i64::from(delta);
        match self.inventory.change_count(color, delta).await {
            Ok(count) => {
                info!("Placed {} {}; inventory now {}", delta, color, count);
                self.report(ReportKind::InventoryChanged {
                    color,
                    delta,
                    count,
                    origin: ChangeOrigin::Telemetry,
                });
            }
            Err(e) => {
                error!("Auto count failed for {}: {}", color, e);
                self.report(ReportKind::InventoryFailed {
                    color,
                    delta,
                    error: e.to_string(),
                });
            }
        }
    }

    fn acknowledge(&mut self, name: &str) {
        let awaited = match self.sequencer.state() {
            SequenceState::Running { index } => index,
            _ => {
                debug!("Acknowledgement '{}' with no run active", name);
                return;
            }
        };

        let transition = self.sequencer.acknowledge(name);
        if matches!(transition, Transition::Transmit(_) | Transition::Finished) {
            info!("{} END detected", name);
            self.report(ReportKind::StepAcknowledged {
                index: awaited,
                name: name.to_string(),
            });
        }
        self.apply_transition(transition);
    }

    fn apply_transition(&mut self, transition: Transition) {
        match transition {
            Transition::Transmit(dispatch) => self.transmit(dispatch),
            Transition::AlreadyRunning => {
                info!("Sort all already running");
                self.report(ReportKind::SequenceAlreadyRunning);
            }
            Transition::Finished => {
                info!("Sort all finished");
                self.report(ReportKind::SequenceFinished);
            }
            Transition::AckIgnored { received, expected } => {
                info!("END ignored (got '{}', expected '{}')", received, expected);
                self.report(ReportKind::AckIgnored { received, expected });
            }
            Transition::Cancelled { index } => {
                info!("Sort all cancelled");
                self.report(ReportKind::SequenceCancelled { index });
            }
            Transition::Aborted { index, script } => {
                self.report(ReportKind::SequenceAborted {
                    index,
                    script,
                    error: "transmission failed".to_string(),
                });
            }
            Transition::NotRunning => {}
        }
    }

    fn transmit(&self, dispatch: StepDispatch) {
        let StepDispatch { run, index, step } = dispatch;
        info!("Sort all: sending {} (step {})", step.script, index);
        self.report(ReportKind::StepDispatched {
            index,
            script: step.script.clone(),
        });

        let transmitter = Arc::clone(&self.transmitter);
        let reports = self.reports.clone();
        let outcomes = self.outcomes.clone();
        tokio::spawn(async move {
            match transmitter.send_script(&step.script).await {
                Ok(()) => {
                    let sent = ReportKind::ScriptSent { script: step.script };
                    let _ = reports.send(ReportEvent::new(sent));
                }
                Err(error) => {
                    let _ = reports.send(ReportEvent::script_failed(&error));
                    if let Some(outcomes) = outcomes.upgrade() {
                        let failed = ControlMessage::StepFailed { run, index, error };
                        let _ = outcomes.send(failed).await;
                    }
                }
            }
        });
    }

    fn status(&self) -> ControllerStatus {
        ControllerStatus {
            sequence: self.sequencer.state(),
            current_step: self.sequencer.current_step().cloned(),
            counts: self.aggregator.snapshot(),
        }
    }

    fn report(&self, kind: ReportKind) {
        // No subscribers is fine
        let _ = self.reports.send(ReportEvent::new(kind));
    }
}
