//! Test utilities for coordinator integration tests

use chrono::{DateTime, Duration, TimeZone, Utc};
use nightwatch_coordinator::{Coordinator, PeerId};
use nightwatch_core::Config;
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::collections::BTreeMap;

/// A clear equinox night over central Europe
pub fn night() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 3, 20, 23, 0, 0).unwrap()
}

/// Observatory at 50N 15E requiring a dome and a weather station
pub fn observatory_config() -> Config {
    let mut config = Config::default_config();
    config.observatory.required_devices = vec!["dome".into(), "weather".into()];
    config.observatory.open_sequence = vec!["dome".into()];
    config
}

/// Drives a [`Coordinator`] with a manual clock and collects what each peer
/// would have received
pub struct Harness {
    pub coordinator: Coordinator,
    pub now: DateTime<Utc>,
    inbox: BTreeMap<PeerId, Vec<String>>,
}

impl Harness {
    pub fn new(config: Config, now: DateTime<Utc>) -> Self {
        Self {
            coordinator: Coordinator::with_rng(config, now, StdRng::seed_from_u64(42)),
            now,
            inbox: BTreeMap::new(),
        }
    }

    pub fn connect(&mut self) -> PeerId {
        self.coordinator.connect("127.0.0.1:50000", self.now)
    }

    pub fn send(&mut self, id: PeerId, line: &str) {
        self.coordinator.handle_line(id, line, self.now);
        self.collect();
    }

    pub fn disconnect(&mut self, id: PeerId) {
        self.coordinator.disconnect(id, self.now);
        self.collect();
    }

    /// Move the clock forward and run one tick
    pub fn advance(&mut self, seconds: i64) {
        self.now += Duration::seconds(seconds);
        self.coordinator.tick(self.now);
        self.collect();
    }

    /// Lines received by `id` since the last call
    pub fn take(&mut self, id: PeerId) -> Vec<String> {
        self.inbox.remove(&id).unwrap_or_default()
    }

    /// Register a device; if the coordinator asks it to close, report closed
    pub fn device(&mut self, name: &str) -> PeerId {
        let id = self.connect();
        self.send(id, &format!("register 1 {} 4 localhost 5555", name));
        if self.take(id).iter().any(|l| l == "close") {
            self.send(id, &format!("S {} 1", name));
            self.send(id, "+000 OK");
        }
        self.take(id);
        id
    }

    pub fn client(&mut self, name: &str) -> PeerId {
        let id = self.connect();
        self.send(id, &format!("login {} {}", name, name));
        self.take(id);
        id
    }

    fn collect(&mut self) {
        for envelope in self.coordinator.drain_outbox() {
            self.inbox
                .entry(envelope.to)
                .or_default()
                .push(envelope.message.to_string());
        }
    }
}

/// Names in a failing set, sorted
pub fn failing(harness: &Harness) -> Vec<String> {
    harness
        .coordinator
        .status()
        .safety
        .failing
        .iter()
        .cloned()
        .collect()
}
