//! Open/close sequencer
//!
//! Walks the configured device list in order to open the facility and in
//! reverse to close it. One step is in progress at a time; a step ends when
//! the device reports the target state, fails, or times out.
//!
//! Opening is fail-closed: any failed step aborts the run. Closing records
//! the failed device in FailedClose and carries on with the rest.

use crate::clock::{after, to_chrono};
use crate::registry::{PeerId, PeerRegistry};
use chrono::{DateTime, Duration, Utc};
use nightwatch_core::StatusWord;
use std::collections::BTreeSet;
use std::fmt;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    Open,
    Close,
}

impl Direction {
    /// Command sent to a device for this direction
    pub fn command(self) -> &'static str {
        match self {
            Direction::Open => "open",
            Direction::Close => "close",
        }
    }

    fn reached(self, status: StatusWord) -> bool {
        match self {
            Direction::Open => status.is_opened(),
            Direction::Close => status.is_closed(),
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.command())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SequencePhase {
    Idle,
    Opening,
    Closing,
}

/// Read access to device registers. `None` means not connected.
pub trait OpenCloseView {
    fn status_of(&self, device: &str) -> Option<StatusWord>;
}

impl OpenCloseView for PeerRegistry {
    fn status_of(&self, device: &str) -> Option<StatusWord> {
        self.device_by_name(device).map(|link| link.status)
    }
}

/// Why a step failed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepFailure {
    Timeout,
    Disconnected,
    /// Negative reply or device error bits
    Hardware,
}

impl fmt::Display for StepFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            StepFailure::Timeout => "timeout",
            StepFailure::Disconnected => "disconnected",
            StepFailure::Hardware => "hardware error",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SequencerEvent {
    /// Send the direction's command to this device
    Issue {
        device: String,
        direction: Direction,
    },
    /// A close step failed; the device was added to FailedClose
    StepFailed {
        device: String,
        failure: StepFailure,
    },
    Completed {
        direction: Direction,
        failed_close: Vec<String>,
    },
    /// Opening stopped at `device`
    Aborted {
        direction: Direction,
        device: String,
        failure: StepFailure,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Step {
    device: String,
    deadline: DateTime<Utc>,
}

#[derive(Debug)]
pub struct OpenCloseSequencer {
    order: Vec<String>,
    step_timeout: Duration,
    phase: SequencePhase,
    step: Option<Step>,
    failed_close: BTreeSet<String>,
    /// Client that started the current run
    origin: Option<PeerId>,
}

impl OpenCloseSequencer {
    pub fn new(order: Vec<String>, step_timeout: std::time::Duration) -> Self {
        Self {
            order,
            step_timeout: to_chrono(step_timeout),
            phase: SequencePhase::Idle,
            step: None,
            failed_close: BTreeSet::new(),
            origin: None,
        }
    }

    /// Replace the device list and step timeout. A running sequence is abandoned.
    pub fn reconfigure(&mut self, order: Vec<String>, step_timeout: std::time::Duration) {
        *self = Self::new(order, step_timeout);
    }

    pub fn phase(&self) -> SequencePhase {
        self.phase
    }

    pub fn is_idle(&self) -> bool {
        self.phase == SequencePhase::Idle
    }

    pub fn origin(&self) -> Option<PeerId> {
        self.origin
    }

    pub fn order(&self) -> &[String] {
        &self.order
    }

    /// Device the current step waits for
    pub fn awaiting(&self) -> Option<&str> {
        self.step.as_ref().map(|s| s.device.as_str())
    }

    pub fn failed_close(&self) -> &BTreeSet<String> {
        &self.failed_close
    }

    pub fn contains(&self, device: &str) -> bool {
        self.order.iter().any(|d| d == device)
    }

    /// Begin a run in `direction`. Starting a close resets FailedClose.
    pub fn start(
        &mut self,
        direction: Direction,
        origin: Option<PeerId>,
        view: &impl OpenCloseView,
        now: DateTime<Utc>,
    ) -> Vec<SequencerEvent> {
        self.phase = match direction {
            Direction::Open => SequencePhase::Opening,
            Direction::Close => {
                self.failed_close.clear();
                SequencePhase::Closing
            }
        };
        self.step = None;
        self.origin = origin;
        info!(%direction, ?origin, "sequence started");
        self.scan(view, now)
    }

    /// Stop the current run without any event
    pub fn abort(&mut self) -> bool {
        let running = !self.is_idle();
        self.phase = SequencePhase::Idle;
        self.step = None;
        self.origin = None;
        running
    }

    /// A device register changed; rescan immediately.
    pub fn on_status_change(
        &mut self,
        view: &impl OpenCloseView,
        now: DateTime<Utc>,
    ) -> Vec<SequencerEvent> {
        if self.is_idle() {
            return Vec::new();
        }
        self.scan(view, now)
    }

    /// Check the step deadline
    pub fn on_tick(&mut self, view: &impl OpenCloseView, now: DateTime<Utc>) -> Vec<SequencerEvent> {
        match &self.step {
            Some(step) if now >= step.deadline => {
                let device = step.device.clone();
                self.fail_step(&device, StepFailure::Timeout, view, now)
            }
            _ => Vec::new(),
        }
    }

    /// The device rejected the command the current step sent it
    pub fn on_command_failed(
        &mut self,
        device: &str,
        view: &impl OpenCloseView,
        now: DateTime<Utc>,
    ) -> Vec<SequencerEvent> {
        if self.awaiting() != Some(device) {
            return Vec::new();
        }
        self.fail_step(device, StepFailure::Hardware, view, now)
    }

    fn direction(&self) -> Option<Direction> {
        match self.phase {
            SequencePhase::Idle => None,
            SequencePhase::Opening => Some(Direction::Open),
            SequencePhase::Closing => Some(Direction::Close),
        }
    }

    fn fail_step(
        &mut self,
        device: &str,
        failure: StepFailure,
        view: &impl OpenCloseView,
        now: DateTime<Utc>,
    ) -> Vec<SequencerEvent> {
        self.step = None;
        match self.direction() {
            None => Vec::new(),
            Some(Direction::Open) => {
                warn!(device, %failure, "open step failed, aborting");
                self.phase = SequencePhase::Idle;
                self.origin = None;
                vec![SequencerEvent::Aborted {
                    direction: Direction::Open,
                    device: device.to_string(),
                    failure,
                }]
            }
            Some(Direction::Close) => {
                warn!(device, %failure, "close step failed, skipping device");
                self.failed_close.insert(device.to_string());
                let mut events = vec![SequencerEvent::StepFailed {
                    device: device.to_string(),
                    failure,
                }];
                events.extend(self.scan(view, now));
                events
            }
        }
    }

    fn scan(&mut self, view: &impl OpenCloseView, now: DateTime<Utc>) -> Vec<SequencerEvent> {
        let Some(direction) = self.direction() else {
            return Vec::new();
        };
        let order: Vec<String> = match direction {
            Direction::Open => self.order.clone(),
            Direction::Close => self.order.iter().rev().cloned().collect(),
        };

        let mut events = Vec::new();
        for device in order {
            if direction == Direction::Close && self.failed_close.contains(&device) {
                continue;
            }
            let status = match view.status_of(&device) {
                Some(status) => status,
                None => {
                    events.extend(self.fail_step(&device, StepFailure::Disconnected, view, now));
                    return events;
                }
            };
            if direction.reached(status) {
                continue;
            }
            if status.has_error() {
                events.extend(self.fail_step(&device, StepFailure::Hardware, view, now));
                return events;
            }
            if self.awaiting() == Some(device.as_str()) {
                debug!(device = %device, status = %status, "sequence step in progress");
                return events;
            }
            info!(device = %device, %direction, "sequence step issued");
            self.step = Some(Step {
                device: device.clone(),
                deadline: after(now, self.step_timeout),
            });
            events.push(SequencerEvent::Issue { device, direction });
            return events;
        }

        info!(%direction, failed_close = ?self.failed_close, "sequence completed");
        self.phase = SequencePhase::Idle;
        self.step = None;
        self.origin = None;
        events.push(SequencerEvent::Completed {
            direction,
            failed_close: match direction {
                Direction::Open => Vec::new(),
                Direction::Close => self.failed_close.iter().cloned().collect(),
            },
        });
        events
    }
}
