//! Per-device command queue
//!
//! The coordinator keeps at most one command in flight per device. Terminal
//! replies from a device always answer the head of its queue, except replies
//! still owed for commands retired by [`CommandQueue::preempt`].

use crate::fanout::RequestId;
use crate::registry::PeerId;
use crate::sequencer::Direction;
use chrono::{DateTime, Utc};
use std::collections::VecDeque;

/// Why a command was sent
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandOrigin {
    /// Part of a client status fan-out
    Fanout(RequestId),
    /// Step of the open/close sequence
    Sequencer(Direction),
    /// Stop issued when a priority holder was forcibly cancelled
    Cancellation,
}

/// A command queued for one device
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceCommand {
    pub command: &'static str,
    pub origin: CommandOrigin,
    /// Priority holder the command runs on behalf of
    pub holder: Option<PeerId>,
}

#[derive(Debug, Clone)]
struct InFlight {
    command: DeviceCommand,
    sent_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default)]
pub struct CommandQueue {
    waiting: VecDeque<DeviceCommand>,
    in_flight: Option<InFlight>,
    /// Replies still owed for preempted commands
    superseded: usize,
}

impl CommandQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a command. Returns the command to write now if the device was idle.
    pub fn push(&mut self, command: DeviceCommand, now: DateTime<Utc>) -> Option<&'static str> {
        self.waiting.push_back(command);
        self.send_next(now)
    }

    /// Put a command ahead of everything not yet sent.
    pub fn push_urgent(
        &mut self,
        command: DeviceCommand,
        now: DateTime<Utc>,
    ) -> Option<&'static str> {
        self.waiting.push_front(command);
        self.send_next(now)
    }

    /// Take the in-flight command once its reply arrived, and start the next one.
    ///
    /// A reply owed for a preempted command is swallowed and leaves the
    /// in-flight command in place.
    pub fn complete(
        &mut self,
        now: DateTime<Utc>,
    ) -> (Option<DeviceCommand>, Option<&'static str>) {
        if self.superseded > 0 {
            self.superseded -= 1;
            return (None, None);
        }
        let done = self.in_flight.take().map(|f| f.command);
        (done, self.send_next(now))
    }

    /// Give up on the in-flight command without waiting for its reply.
    /// Replies owed for preempted commands are forgotten too.
    pub fn abandon(
        &mut self,
        now: DateTime<Utc>,
    ) -> (Option<DeviceCommand>, Option<&'static str>) {
        self.superseded = 0;
        let done = self.in_flight.take().map(|f| f.command);
        (done, self.send_next(now))
    }

    /// Write `command` at once, retiring whatever is in flight.
    ///
    /// Returns the retired command and the text to write. The device still
    /// answers the retired command first; that reply is discarded.
    pub fn preempt(
        &mut self,
        command: DeviceCommand,
        now: DateTime<Utc>,
    ) -> (Option<DeviceCommand>, &'static str) {
        let text = command.command;
        let retired = self.in_flight.replace(InFlight {
            command,
            sent_at: now,
        });
        if retired.is_some() {
            self.superseded += 1;
        }
        (retired.map(|f| f.command), text)
    }

    fn send_next(&mut self, now: DateTime<Utc>) -> Option<&'static str> {
        if self.in_flight.is_some() {
            return None;
        }
        let command = self.waiting.pop_front()?;
        let text = command.command;
        self.in_flight = Some(InFlight {
            command,
            sent_at: now,
        });
        Some(text)
    }

    /// True if the in-flight command was sent at or before `cutoff`
    pub fn overdue(&self, cutoff: DateTime<Utc>) -> bool {
        self.in_flight
            .as_ref()
            .map_or(false, |f| f.sent_at <= cutoff)
    }

    pub fn in_flight(&self) -> Option<&DeviceCommand> {
        self.in_flight.as_ref().map(|f| &f.command)
    }

    /// Drop waiting commands sent on behalf of `holder`. Returns how many went.
    pub fn drop_holder(&mut self, holder: PeerId) -> usize {
        let before = self.waiting.len();
        self.waiting.retain(|c| c.holder != Some(holder));
        before - self.waiting.len()
    }

    /// Everything still queued, in-flight command first
    pub fn drain(&mut self) -> Vec<DeviceCommand> {
        self.superseded = 0;
        self.in_flight
            .take()
            .map(|f| f.command)
            .into_iter()
            .chain(self.waiting.drain(..))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.waiting.len() + usize::from(self.in_flight.is_some())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
