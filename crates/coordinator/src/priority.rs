//! Priority arbitration
//!
//! At most one client holds priority, the exclusive right to command
//! hardware motion. A competing request does not preempt the holder
//! immediately: the holder is asked to finish and gets a grace period, after
//! which its in-flight work is forcibly cancelled and priority moves on.

use crate::clock::{after, to_chrono};
use crate::registry::PeerId;
use chrono::{DateTime, Duration, Utc};
use thiserror::Error;
use tracing::{info, warn};

/// Priority errors
#[derive(Debug, Error, PartialEq, Eq)]
pub enum PriorityError {
    /// The peer does not hold priority
    #[error("peer {0} does not hold priority")]
    NotHolder(PeerId),

    /// A hand-over to another client is already pending
    #[error("priority of {holder} is already being revoked for {next}")]
    RevokePending {
        /// Current holder
        holder: PeerId,
        /// Client waiting for priority
        next: PeerId,
    },
}

/// Grant state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GrantState {
    Unheld,
    Held {
        holder: PeerId,
        epoch: u64,
    },
    Revoking {
        holder: PeerId,
        epoch: u64,
        deadline: DateTime<Utc>,
        next: PeerId,
    },
}

/// Outcome of an arbiter operation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PriorityEvent {
    Granted {
        holder: PeerId,
        epoch: u64,
    },
    /// Requester already holds priority
    AlreadyHeld {
        holder: PeerId,
        epoch: u64,
    },
    /// Holder was asked to finish before `deadline`
    RevokeRequested {
        holder: PeerId,
        next: PeerId,
        deadline: DateTime<Utc>,
    },
    HandedOver {
        from: PeerId,
        to: PeerId,
        epoch: u64,
        /// True when the grace period ran out or the holder vanished
        forced: bool,
    },
    Released {
        holder: PeerId,
    },
    /// Holder vanished with nobody waiting; its work must be cancelled
    Revoked {
        holder: PeerId,
        epoch: u64,
    },
    /// Pending hand-over abandoned, holder keeps priority
    RevokeCancelled {
        holder: PeerId,
        next: PeerId,
    },
}

/// Record of one forced hand-over or revoke
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ForcedCancellation {
    pub holder: PeerId,
    pub epoch: u64,
    pub at: DateTime<Utc>,
}

#[derive(Debug)]
pub struct PriorityArbiter {
    state: GrantState,
    epoch: u64,
    grace: Duration,
    forced: Vec<ForcedCancellation>,
}

impl PriorityArbiter {
    pub fn new(grace: std::time::Duration) -> Self {
        Self {
            state: GrantState::Unheld,
            epoch: 0,
            grace: to_chrono(grace),
            forced: Vec::new(),
        }
    }

    pub fn set_grace(&mut self, grace: std::time::Duration) {
        self.grace = to_chrono(grace);
    }

    pub fn state(&self) -> GrantState {
        self.state
    }

    /// Latest epoch handed out
    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    /// Client currently allowed to command motion
    pub fn holder(&self) -> Option<PeerId> {
        match self.state {
            GrantState::Unheld => None,
            GrantState::Held { holder, .. } | GrantState::Revoking { holder, .. } => Some(holder),
        }
    }

    pub fn is_holder(&self, peer: PeerId) -> bool {
        self.holder() == Some(peer)
    }

    /// Forced hand-overs so far
    pub fn forced_cancellations(&self) -> &[ForcedCancellation] {
        &self.forced
    }

    pub fn request(
        &mut self,
        client: PeerId,
        now: DateTime<Utc>,
    ) -> Result<PriorityEvent, PriorityError> {
        match self.state {
            GrantState::Unheld => Ok(self.grant(client)),
            GrantState::Held { holder, epoch } if holder == client => {
                Ok(PriorityEvent::AlreadyHeld { holder, epoch })
            }
            GrantState::Held { holder, epoch } => {
                let deadline = after(now, self.grace);
                self.state = GrantState::Revoking {
                    holder,
                    epoch,
                    deadline,
                    next: client,
                };
                info!(holder, next = client, %deadline, "priority revoke requested");
                Ok(PriorityEvent::RevokeRequested {
                    holder,
                    next: client,
                    deadline,
                })
            }
            GrantState::Revoking { holder, epoch, .. } if holder == client => {
                Ok(PriorityEvent::AlreadyHeld { holder, epoch })
            }
            GrantState::Revoking {
                holder,
                deadline,
                next,
                ..
            } if next == client => Ok(PriorityEvent::RevokeRequested {
                holder,
                next,
                deadline,
            }),
            GrantState::Revoking { holder, next, .. } => {
                Err(PriorityError::RevokePending { holder, next })
            }
        }
    }

    /// The holder finished its work
    pub fn holder_finished(
        &mut self,
        client: PeerId,
        now: DateTime<Utc>,
    ) -> Result<PriorityEvent, PriorityError> {
        match self.state {
            GrantState::Revoking { holder, next, .. } if holder == client => {
                Ok(self.hand_over(holder, next, false, now))
            }
            GrantState::Held { holder, .. } if holder == client => Ok(self.unhold(holder)),
            _ => Err(PriorityError::NotHolder(client)),
        }
    }

    /// Give priority up. The pending next holder may also withdraw.
    pub fn release(
        &mut self,
        client: PeerId,
        now: DateTime<Utc>,
    ) -> Result<PriorityEvent, PriorityError> {
        match self.state {
            GrantState::Held { holder, .. } if holder == client => Ok(self.unhold(holder)),
            GrantState::Revoking { holder, next, .. } if holder == client => {
                Ok(self.hand_over(holder, next, false, now))
            }
            GrantState::Revoking {
                holder,
                epoch,
                next,
                ..
            } if next == client => Ok(self.cancel_revoke(holder, epoch, next)),
            _ => Err(PriorityError::NotHolder(client)),
        }
    }

    /// Force the hand-over once the grace deadline passed
    pub fn expire(&mut self, now: DateTime<Utc>) -> Option<PriorityEvent> {
        match self.state {
            GrantState::Revoking {
                holder,
                deadline,
                next,
                ..
            } if now >= deadline => Some(self.hand_over(holder, next, true, now)),
            _ => None,
        }
    }

    /// A peer went away
    pub fn disconnect(&mut self, peer: PeerId, now: DateTime<Utc>) -> Option<PriorityEvent> {
        match self.state {
            GrantState::Held { holder, epoch } if holder == peer => {
                self.state = GrantState::Unheld;
                self.forced.push(ForcedCancellation {
                    holder,
                    epoch,
                    at: now,
                });
                warn!(holder, epoch, "priority holder disconnected, priority revoked");
                Some(PriorityEvent::Revoked { holder, epoch })
            }
            GrantState::Revoking { holder, next, .. } if holder == peer => {
                Some(self.hand_over(holder, next, true, now))
            }
            GrantState::Revoking {
                holder,
                epoch,
                next,
                ..
            } if next == peer => Some(self.cancel_revoke(holder, epoch, next)),
            _ => None,
        }
    }

    fn grant(&mut self, client: PeerId) -> PriorityEvent {
        self.epoch += 1;
        self.state = GrantState::Held {
            holder: client,
            epoch: self.epoch,
        };
        info!(holder = client, epoch = self.epoch, "priority granted");
        PriorityEvent::Granted {
            holder: client,
            epoch: self.epoch,
        }
    }

    fn unhold(&mut self, holder: PeerId) -> PriorityEvent {
        self.state = GrantState::Unheld;
        info!(holder, "priority released");
        PriorityEvent::Released { holder }
    }

    fn cancel_revoke(&mut self, holder: PeerId, epoch: u64, next: PeerId) -> PriorityEvent {
        self.state = GrantState::Held { holder, epoch };
        info!(holder, next, "priority revoke cancelled");
        PriorityEvent::RevokeCancelled { holder, next }
    }

    fn hand_over(
        &mut self,
        from: PeerId,
        to: PeerId,
        forced: bool,
        now: DateTime<Utc>,
    ) -> PriorityEvent {
        self.epoch += 1;
        self.state = GrantState::Held {
            holder: to,
            epoch: self.epoch,
        };
        if forced {
            self.forced.push(ForcedCancellation {
                holder: from,
                epoch: self.epoch - 1,
                at: now,
            });
            warn!(from, to, epoch = self.epoch, "priority forcibly handed over");
        } else {
            info!(from, to, epoch = self.epoch, "priority handed over");
        }
        PriorityEvent::HandedOver {
            from,
            to,
            epoch: self.epoch,
            forced,
        }
    }
}
