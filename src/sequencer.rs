//! Sort-all sequencing
//!
//! Sends a fixed list of scripts one at a time. After each transmission the
//! sequencer waits for the robot to report `RUN <name> END` for the script it
//! is waiting on before it moves to the next step. Acknowledgements for other
//! names (for example from a manually sent script) are ignored.
//!
//! The state machine itself does no I/O; every method returns a [`Transition`]
//! telling the caller what to transmit or report.

use serde::{Deserialize, Serialize};
use crate::config::StepConfig;

/// One step of a sequencing run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SequenceStep {
    pub script: String,
    pub ack: String,
}

impl SequenceStep {
    pub fn new(script: &str, ack: &str) -> Self {
        Self {
            script: script.to_string(),
            ack: ack.to_string(),
        }
    }
}

impl From<&StepConfig> for SequenceStep {
    fn from(step: &StepConfig) -> Self {
        Self::new(&step.script, &step.ack)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum SequenceState {
    Idle,
    Running { index: usize },
    Cancelled,
    Finished,
}

impl SequenceState {
    pub fn is_running(&self) -> bool {
        matches!(self, SequenceState::Running { .. })
    }
}

/// A step that must be transmitted now
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepDispatch {
    /// Identifies the run the step belongs to
    pub run: u64,
    pub index: usize,
    pub step: SequenceStep,
}

/// Outcome of feeding an input to the sequencer
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transition {
    Transmit(StepDispatch),
    AlreadyRunning,
    Finished,
    AckIgnored { received: String, expected: String },
    /// Input had no effect because no run is active
    NotRunning,
    Cancelled { index: Option<usize> },
    Aborted { index: usize, script: String },
}

#[derive(Debug, Clone)]
pub struct Sequencer {
    steps: Vec<SequenceStep>,
    state: SequenceState,
    run: u64,
}

impl Sequencer {
    pub fn new(steps: Vec<SequenceStep>) -> Self {
        Self {
            steps,
            state: SequenceState::Idle,
            run: 0,
        }
    }

    pub fn from_config(steps: &[StepConfig]) -> Self {
        Self::new(steps.iter().map(SequenceStep::from).collect())
    }

    pub fn state(&self) -> SequenceState {
        self.state
    }

    pub fn steps(&self) -> &[SequenceStep] {
        &self.steps
    }

    /// Step currently awaiting its acknowledgement
    pub fn current_step(&self) -> Option<&SequenceStep> {
        match self.state {
            SequenceState::Running { index } => self.steps.get(index),
            _ => None,
        }
    }

    pub fn start(&mut self) -> Transition {
        if self.state.is_running() {
            return Transition::AlreadyRunning;
        }
        self.run += 1;
        self.enter_step(0)
    }

    pub fn acknowledge(&mut self, name: &str) -> Transition {
        let index = match self.state {
            SequenceState::Running { index } => index,
            _ => return Transition::NotRunning,
        };
        let expected = &self.steps[index].ack;
        if !name.trim().eq_ignore_ascii_case(expected) {
            return Transition::AckIgnored {
                received: name.to_string(),
                expected: expected.clone(),
            };
        }
        self.enter_step(index + 1)
    }

    /// Stop advancing; a script already on the robot keeps running
    pub fn cancel(&mut self) -> Transition {
        let index = match self.state {
            SequenceState::Running { index } => Some(index),
            _ => None,
        };
        self.state = SequenceState::Cancelled;
        Transition::Cancelled { index }
    }

    /// A transmission failed; abort if it belongs to the step being awaited
    pub fn transmission_failed(&mut self, run: u64, index: usize) -> Transition {
        match self.state {
            SequenceState::Running { index: current } if run == self.run && index == current => {
                self.state = SequenceState::Idle;
                Transition::Aborted {
                    index,
                    script: self.steps[index].script.clone(),
                }
            }
            _ => Transition::NotRunning,
        }
    }

    fn enter_step(&mut self, index: usize) -> Transition {
        match self.steps.get(index) {
            Some(step) => {
                self.state = SequenceState::Running { index };
                Transition::Transmit(StepDispatch {
                    run: self.run,
                    index,
                    step: step.clone(),
                })
            }
            None => {
                self.state = SequenceState::Finished;
                Transition::Finished
            }
        }
    }
}
