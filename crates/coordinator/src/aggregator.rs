//! State aggregation
//!
//! System-wide weather safety, stop safety and the per-device effective BOP
//! masks are recomputed from the full registry every time, never from
//! deltas, so the result depends only on the current registers.

use crate::blocking::BlockingRelation;
use crate::registry::{PeerId, PeerLink, PeerRegistry};
use chrono::{DateTime, Utc};
use nightwatch_core::status::{BAD_WEATHER, BOP_MASK, STOP_EVERYTHING, STOP_MASK, WEATHER_MASK};
use nightwatch_core::{DiurnalPhase, PowerState, StatusWord};
use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, info, warn};

/// Safety projection of all device registers
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Safety {
    pub weather_safe: bool,
    /// Devices making the weather unsafe, sorted
    pub failing: BTreeSet<String>,
    pub stop_safe: bool,
    /// Devices demanding a stop, sorted
    pub stopping: BTreeSet<String>,
    /// Effective BOP mask per device name
    pub bop: BTreeMap<String, u32>,
}

/// Device and reason that first turned the weather bad
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WeatherReason {
    pub device: String,
    pub reason: String,
}

/// Process-wide coordinator state
#[derive(Debug, Clone)]
pub struct SystemStatus {
    pub power: PowerState,
    pub phase: DiurnalPhase,
    pub safety: Safety,
    /// Retained until the weather is safe again
    pub weather_reason: Option<WeatherReason>,
    /// Switches to standby since the last dusk: when and by whom
    pub standby_history: Vec<(DateTime<Utc>, String)>,
    pub last_change: DateTime<Utc>,
}

impl SystemStatus {
    /// The `centrald` register: phase, power, weather and stop bits
    pub fn register(&self) -> StatusWord {
        let mut bits = self.phase.code() | self.power.bits();
        if !self.safety.weather_safe {
            bits |= BAD_WEATHER;
        }
        if !self.safety.stop_safe {
            bits |= STOP_EVERYTHING;
        }
        StatusWord(bits)
    }

    pub fn weather_safe(&self) -> bool {
        self.safety.weather_safe
    }
}

/// What a recompute changed
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AggregateChange {
    Weather {
        safe: bool,
        failing: Vec<String>,
        reason: Option<WeatherReason>,
    },
    Stop {
        safe: bool,
        stopping: Vec<String>,
    },
    Bop {
        device: String,
        mask: u32,
    },
}

#[derive(Debug)]
pub struct StateAggregator {
    required: BTreeSet<String>,
    blocking: BlockingRelation,
    status: SystemStatus,
}

impl StateAggregator {
    pub fn new(
        required: impl IntoIterator<Item = String>,
        blocking: BlockingRelation,
        power: PowerState,
        phase: DiurnalPhase,
        now: DateTime<Utc>,
    ) -> Self {
        let required: BTreeSet<String> = required.into_iter().collect();
        let failing = required.clone();
        Self {
            required,
            blocking,
            status: SystemStatus {
                power,
                phase,
                safety: Safety {
                    weather_safe: failing.is_empty(),
                    failing,
                    stop_safe: true,
                    stopping: BTreeSet::new(),
                    bop: BTreeMap::new(),
                },
                weather_reason: None,
                standby_history: Vec::new(),
                last_change: now,
            },
        }
    }

    pub fn status(&self) -> &SystemStatus {
        &self.status
    }

    /// Power and phase are written by the coordinator directly
    pub fn status_mut(&mut self) -> &mut SystemStatus {
        &mut self.status
    }

    pub fn required(&self) -> &BTreeSet<String> {
        &self.required
    }

    pub fn blocking(&self) -> &BlockingRelation {
        &self.blocking
    }

    pub fn reconfigure(
        &mut self,
        required: impl IntoIterator<Item = String>,
        blocking: BlockingRelation,
    ) {
        self.required = required.into_iter().collect();
        self.blocking = blocking;
    }

    /// Store a device register and recompute whatever its toggled bits feed.
    pub fn set_status(
        &mut self,
        registry: &mut PeerRegistry,
        peer: PeerId,
        new: StatusWord,
        now: DateTime<Utc>,
    ) -> Vec<AggregateChange> {
        let old = match registry.set_status(peer, new) {
            Some(old) => old,
            None => return Vec::new(),
        };
        let mut changes = Vec::new();
        if old.toggled(new, WEATHER_MASK) {
            changes.extend(self.recompute_weather(registry, Some(peer), now));
        }
        if old.toggled(new, STOP_MASK) {
            changes.extend(self.recompute_stop(registry, now));
        }
        if old.toggled(new, BOP_MASK) {
            changes.extend(self.recompute_bop(registry));
        }
        changes
    }

    /// Full recompute, used when devices come and go
    pub fn recompute_all(
        &mut self,
        registry: &PeerRegistry,
        now: DateTime<Utc>,
    ) -> Vec<AggregateChange> {
        let mut changes = Vec::new();
        changes.extend(self.recompute_weather(registry, None, now));
        changes.extend(self.recompute_stop(registry, now));
        changes.extend(self.recompute_bop(registry));
        changes
    }

    /// Recompute weather safety. `trigger` names the device whose report
    /// caused the recompute.
    pub fn recompute_weather(
        &mut self,
        registry: &PeerRegistry,
        trigger: Option<PeerId>,
        now: DateTime<Utc>,
    ) -> Option<AggregateChange> {
        let failing = self.failing_set(registry, |status| status.bad_weather());
        let safe = failing.is_empty();
        let was_safe = self.status.safety.weather_safe;

        let reason = if safe {
            None
        } else {
            let trigger_link = trigger
                .and_then(|id| registry.get(id))
                .filter(|link| failing.contains(&link.name));
            match (&self.status.weather_reason, trigger_link) {
                // the device that turned the weather bad refreshed its reason
                (Some(current), Some(link)) if current.device == link.name => {
                    Some(describe_failure(&link.name, Some(link)))
                }
                (Some(current), _) if failing.contains(&current.device) => Some(current.clone()),
                (_, Some(link)) => Some(describe_failure(&link.name, Some(link))),
                (_, None) => failing.iter().next().map(|name| {
                    describe_failure(name, registry.device_by_name(name))
                }),
            }
        };

        if was_safe && !safe {
            if let Some(r) = &reason {
                warn!(device = %r.device, reason = %r.reason, "weather turned unsafe");
            }
        } else if !was_safe && safe {
            info!("weather safe again");
        }
        debug!(failing = ?failing, "weather recomputed");

        if failing == self.status.safety.failing
            && safe == was_safe
            && reason == self.status.weather_reason
        {
            return None;
        }
        if safe != was_safe {
            self.status.last_change = now;
        }
        self.status.safety.weather_safe = safe;
        self.status.safety.failing = failing.clone();
        self.status.weather_reason = reason.clone();
        Some(AggregateChange::Weather {
            safe,
            failing: failing.into_iter().collect(),
            reason,
        })
    }

    /// Recompute stop safety, same algorithm as weather over the stop bit
    pub fn recompute_stop(
        &mut self,
        registry: &PeerRegistry,
        now: DateTime<Utc>,
    ) -> Option<AggregateChange> {
        let stopping = self.failing_set(registry, |status| !status.can_move());
        let safe = stopping.is_empty();
        if stopping == self.status.safety.stopping && safe == self.status.safety.stop_safe {
            return None;
        }
        if safe != self.status.safety.stop_safe {
            info!(safe, stopping = ?stopping, "stop state changed");
            self.status.last_change = now;
        }
        self.status.safety.stop_safe = safe;
        self.status.safety.stopping = stopping.clone();
        Some(AggregateChange::Stop {
            safe,
            stopping: stopping.into_iter().collect(),
        })
    }

    /// Recompute every device's effective BOP mask; report the ones that moved
    pub fn recompute_bop(&mut self, registry: &PeerRegistry) -> Vec<AggregateChange> {
        let fresh: BTreeMap<String, u32> = registry
            .devices()
            .map(|device| (device.name.clone(), self.mask_for(registry, &device.name)))
            .collect();
        let changes: Vec<AggregateChange> = fresh
            .iter()
            .filter(|(name, mask)| self.status.safety.bop.get(*name) != Some(*mask))
            .map(|(name, mask)| AggregateChange::Bop {
                device: name.clone(),
                mask: *mask,
            })
            .collect();
        self.status.safety.bop = fresh;
        changes
    }

    /// Effective BOP mask of one device, computed on demand
    pub fn effective_mask(&self, registry: &PeerRegistry, peer: PeerId) -> u32 {
        registry
            .get(peer)
            .map_or(0, |link| self.mask_for(registry, &link.name))
    }

    fn mask_for(&self, registry: &PeerRegistry, device: &str) -> u32 {
        registry
            .devices()
            .filter(|other| self.blocking.blocks(device, &other.name))
            .fold(0, |mask, other| mask | other.status.bop())
    }

    /// Required devices that are missing, plus connected devices for which
    /// `unsafe_bit` holds
    fn failing_set(
        &self,
        registry: &PeerRegistry,
        unsafe_bit: impl Fn(StatusWord) -> bool,
    ) -> BTreeSet<String> {
        // an absent required device reads as the worst-case register
        let missing = self
            .required
            .iter()
            .filter(|name| registry.device_by_name(name).is_none())
            .filter(|_| unsafe_bit(StatusWord::WORST_CASE))
            .cloned();
        let reporting = registry
            .devices()
            .filter(|device| unsafe_bit(device.status))
            .map(|device| device.name.clone());
        missing.chain(reporting).collect()
    }
}

fn describe_failure(name: &str, link: Option<&PeerLink>) -> WeatherReason {
    let reason = match link {
        None => "disconnected".to_string(),
        Some(link) => link
            .weather_reason
            .clone()
            .unwrap_or_else(|| "bad weather".to_string()),
    };
    WeatherReason {
        device: name.to_string(),
        reason,
    }
}
