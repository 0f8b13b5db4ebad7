//! Status fan-out
//!
//! A client's `status_info` is forwarded to every device. The client's reply
//! is held back until each polled device answered, disconnected or the
//! request deadline passed.

use crate::registry::PeerId;
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, BTreeSet};
use tracing::debug;

pub type RequestId = u64;

/// A held-back reply
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingRequest {
    pub originator: PeerId,
    /// Devices that have not answered yet
    pub outstanding: BTreeSet<PeerId>,
    /// Devices that dropped out without answering
    pub missed: BTreeSet<PeerId>,
    pub deadline: DateTime<Utc>,
}

impl PendingRequest {
    pub fn outstanding_count(&self) -> usize {
        self.outstanding.len()
    }
}

/// A request whose reply can go out now
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Completion {
    pub request: RequestId,
    pub originator: PeerId,
    /// Devices that never answered
    pub missed: Vec<PeerId>,
}

#[derive(Debug, Default)]
pub struct StatusFanout {
    pending: BTreeMap<RequestId, PendingRequest>,
    next_id: RequestId,
}

impl StatusFanout {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a request polling `devices`. Completes at once if there are none.
    pub fn start(
        &mut self,
        originator: PeerId,
        devices: impl IntoIterator<Item = PeerId>,
        deadline: DateTime<Utc>,
    ) -> (RequestId, Option<Completion>) {
        self.next_id += 1;
        let id = self.next_id;
        let request = PendingRequest {
            originator,
            outstanding: devices.into_iter().collect(),
            missed: BTreeSet::new(),
            deadline,
        };
        debug!(request = id, originator, outstanding = request.outstanding_count(), "fan-out started");
        self.pending.insert(id, request);
        (id, self.try_complete(id))
    }

    /// A polled device answered
    pub fn reply(&mut self, request: RequestId, device: PeerId) -> Option<Completion> {
        self.pending.get_mut(&request)?.outstanding.remove(&device);
        self.try_complete(request)
    }

    /// A device answered with an error or timed out; it no longer counts
    pub fn give_up(&mut self, request: RequestId, device: PeerId) -> Option<Completion> {
        let pending = self.pending.get_mut(&request)?;
        if pending.outstanding.remove(&device) {
            pending.missed.insert(device);
        }
        self.try_complete(request)
    }

    /// A device disconnected: remove it from every request
    pub fn device_lost(&mut self, device: PeerId) -> Vec<Completion> {
        let ids: Vec<RequestId> = self
            .pending
            .iter()
            .filter(|(_, p)| p.outstanding.contains(&device))
            .map(|(id, _)| *id)
            .collect();
        ids.into_iter()
            .filter_map(|id| self.give_up(id, device))
            .collect()
    }

    /// The requester disconnected: nobody to answer
    pub fn originator_lost(&mut self, originator: PeerId) -> usize {
        let before = self.pending.len();
        self.pending.retain(|_, p| p.originator != originator);
        before - self.pending.len()
    }

    /// Complete every request whose deadline passed
    pub fn expire(&mut self, now: DateTime<Utc>) -> Vec<Completion> {
        let expired: Vec<RequestId> = self
            .pending
            .iter()
            .filter(|(_, p)| now >= p.deadline)
            .map(|(id, _)| *id)
            .collect();
        expired
            .into_iter()
            .filter_map(|id| {
                let mut pending = self.pending.remove(&id)?;
                let mut missed = std::mem::take(&mut pending.missed);
                missed.append(&mut pending.outstanding);
                Some(Completion {
                    request: id,
                    originator: pending.originator,
                    missed: missed.into_iter().collect(),
                })
            })
            .collect()
    }

    pub fn get(&self, request: RequestId) -> Option<&PendingRequest> {
        self.pending.get(&request)
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    fn try_complete(&mut self, request: RequestId) -> Option<Completion> {
        if !self.pending.get(&request)?.outstanding.is_empty() {
            return None;
        }
        let pending = self.pending.remove(&request)?;
        Some(Completion {
            request,
            originator: pending.originator,
            missed: pending.missed.into_iter().collect(),
        })
    }
}
