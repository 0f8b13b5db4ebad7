//! The coordinator proper
//!
//! [`Coordinator`] owns every piece of mutable shared state: the registry,
//! the aggregated system status, the priority grant, the sequencer and the
//! pending fan-out requests. It does no I/O. Each entry point takes the
//! current time and leaves outgoing lines in an outbox, which the server
//! drains after every call. Serializing all calls through one task is what
//! keeps the state consistent.

use crate::aggregator::{AggregateChange, StateAggregator, SystemStatus};
use crate::blocking::BlockingRelation;
use crate::clock::{after, before, to_chrono};
use crate::error::{CoordinatorError, Result};
use crate::fanout::{Completion, StatusFanout};
use crate::priority::{PriorityArbiter, PriorityEvent};
use crate::protocol::{Message, ProtocolError, Request};
use crate::queue::{CommandOrigin, DeviceCommand};
use crate::registry::{DeviceInfo, PeerId, PeerRegistry, Role};
use crate::sequencer::{Direction, OpenCloseSequencer, SequencerEvent};
use chrono::{DateTime, Duration, Utc};
use nightwatch_core::{Config, DiurnalPhase, MorningPolicy, PowerState, StatusWord};
use nightwatch_ephemeris::{DiurnalSchedule, NightWindow};
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::collections::BTreeSet;
use tracing::{debug, error, info, warn};

/// Name of the system register
pub const CENTRALD: &str = "centrald";

/// One outgoing line and its recipient
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    pub to: PeerId,
    pub message: Message,
}

/// How a handled command is answered
enum Answer {
    /// `+000` right away
    Ok,
    /// Reply is sent once a fan-out completes
    Deferred,
    /// No reply; the line was a report, not a command
    Silent,
}

pub struct Coordinator {
    config: Config,
    schedule: DiurnalSchedule,
    registry: PeerRegistry,
    aggregator: StateAggregator,
    priority: PriorityArbiter,
    sequencer: OpenCloseSequencer,
    fanout: StatusFanout,
    outbox: Vec<Envelope>,
    rng: StdRng,
    next_state: DiurnalPhase,
    next_state_change: DateTime<Utc>,
    night: Option<NightWindow>,
    next_sun_update: DateTime<Utc>,
    /// Direction the facility was last told to move
    last_commanded: Option<Direction>,
    /// Who changed the power state last, sent with the system register
    note: String,
    /// System register and note as last broadcast
    announced: Option<(StatusWord, String)>,
}

impl Coordinator {
    pub fn new(config: Config, now: DateTime<Utc>) -> Self {
        Self::with_rng(config, now, StdRng::from_entropy())
    }

    /// Construct with a caller-supplied key generator
    pub fn with_rng(config: Config, now: DateTime<Utc>, rng: StdRng) -> Self {
        let power = if config.centrald.reboot_on {
            PowerState::On
        } else {
            PowerState::HardOff
        };
        let aggregator = StateAggregator::new(
            config.observatory.required_devices.iter().cloned(),
            BlockingRelation::from_config(&config.blocking),
            power,
            DiurnalPhase::Day,
            now,
        );
        let mut coordinator = Self {
            schedule: DiurnalSchedule::from_config(&config.observatory),
            registry: PeerRegistry::new(),
            aggregator,
            priority: PriorityArbiter::new(config.centrald.priority_grace_duration()),
            sequencer: OpenCloseSequencer::new(
                config.observatory.open_sequence.clone(),
                config.centrald.step_timeout_duration(),
            ),
            fanout: StatusFanout::new(),
            outbox: Vec::new(),
            rng,
            next_state: DiurnalPhase::Day,
            next_state_change: now,
            night: None,
            next_sun_update: now,
            last_commanded: None,
            note: String::new(),
            announced: None,
            config,
        };
        coordinator.update_phase(now);
        info!(
            phase = %coordinator.aggregator.status().phase,
            %power,
            next = %coordinator.next_state,
            at = %coordinator.next_state_change,
            "coordinator started"
        );
        coordinator
    }

    pub fn status(&self) -> &SystemStatus {
        self.aggregator.status()
    }

    pub fn registry(&self) -> &PeerRegistry {
        &self.registry
    }

    pub fn priority(&self) -> &PriorityArbiter {
        &self.priority
    }

    pub fn sequencer(&self) -> &OpenCloseSequencer {
        &self.sequencer
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn next_state(&self) -> DiurnalPhase {
        self.next_state
    }

    pub fn next_state_change(&self) -> DateTime<Utc> {
        self.next_state_change
    }

    /// Current or next night, if the sun reaches the night horizon
    pub fn night_window(&self) -> Option<NightWindow> {
        self.night
    }

    pub fn last_commanded(&self) -> Option<Direction> {
        self.last_commanded
    }

    /// Trigger condition for opening the facility
    pub fn should_be_open(&self) -> bool {
        let status = self.aggregator.status();
        status.phase.is_dark() && status.power == PowerState::On && status.weather_safe()
    }

    /// Take every line queued since the last call
    pub fn drain_outbox(&mut self) -> Vec<Envelope> {
        std::mem::take(&mut self.outbox)
    }

    /// Track a new connection
    pub fn connect(&mut self, remote: impl Into<String>, now: DateTime<Utc>) -> PeerId {
        let remote = remote.into();
        let id = self.registry.open(remote.clone(), now);
        debug!(peer_id = id, %remote, "connection accepted");
        id
    }

    /// Handle one line from a peer
    pub fn handle_line(&mut self, id: PeerId, line: &str, now: DateTime<Utc>) {
        let role = match self.registry.get_mut(id) {
            Some(link) => {
                link.last_seen = now;
                link.role
            }
            None => {
                warn!(peer_id = id, "line from unknown peer dropped");
                return;
            }
        };

        let answer = match Request::parse(line) {
            Ok(Request::Reply { code, message }) => {
                self.command_replied(id, code, &message, now);
                Ok(Answer::Silent)
            }
            Ok(request) => {
                debug!(peer_id = id, command = request.name(), "command received");
                match role {
                    Role::Pending => self.pending_command(id, request, now),
                    Role::Device => self.device_command(id, request, now),
                    Role::Client => self.client_command(id, request, now),
                }
            }
            Err(err) => Err(err.into()),
        };
        match answer {
            Ok(Answer::Ok) => self.send(id, Message::ok()),
            Ok(Answer::Deferred) | Ok(Answer::Silent) => {}
            Err(err) => self.reject(id, &err),
        }
        self.settle(now);
    }

    /// A connection closed
    pub fn disconnect(&mut self, id: PeerId, now: DateTime<Utc>) {
        let Some(link) = self.registry.get(id) else {
            return;
        };
        let role = link.role;
        let name = link.name.clone();
        info!(peer_id = id, %role, name = %name, "peer disconnected");

        // the holder's authorizations are still known here
        if let Some(event) = self.priority.disconnect(id, now) {
            self.priority_event(event, now);
        }
        for completion in self.fanout.device_lost(id) {
            self.finish_fanout(completion);
        }
        self.fanout.originator_lost(id);

        let Some(mut link) = self.registry.deregister(id) else {
            return;
        };
        if link.is_device() {
            for command in link.queue.drain() {
                debug!(
                    device = %name,
                    command = command.command,
                    error = %CoordinatorError::PeerLost(id),
                    "command dropped"
                );
            }
            let changes = self.aggregator.recompute_all(&self.registry, now);
            self.apply_changes(changes);
            let events = self.sequencer.on_status_change(&self.registry, now);
            self.sequencer_events(events, now);
        }
        self.settle(now);
    }

    /// Periodic deadline checks and schedule updates
    pub fn tick(&mut self, now: DateTime<Utc>) {
        if let Some(event) = self.priority.expire(now) {
            self.priority_event(event, now);
        }
        let events = self.sequencer.on_tick(&self.registry, now);
        self.sequencer_events(events, now);
        self.expire_commands(now);
        for completion in self.fanout.expire(now) {
            self.finish_fanout(completion);
        }
        if now >= self.next_state_change {
            self.update_phase(now);
        }
        if now >= self.next_sun_update {
            self.broadcast_sun(now);
            self.next_sun_update = after(now, to_chrono(self.config.centrald.info_interval_duration()));
        }
        self.settle(now);
    }

    /// Apply a new configuration without dropping connections
    pub fn reload(&mut self, config: Config, now: DateTime<Utc>) {
        info!(
            required = ?config.observatory.required_devices,
            open_sequence = ?config.observatory.open_sequence,
            "configuration reloaded"
        );
        self.schedule = DiurnalSchedule::from_config(&config.observatory);
        self.aggregator.reconfigure(
            config.observatory.required_devices.iter().cloned(),
            BlockingRelation::from_config(&config.blocking),
        );
        self.priority
            .set_grace(config.centrald.priority_grace_duration());
        self.sequencer.reconfigure(
            config.observatory.open_sequence.clone(),
            config.centrald.step_timeout_duration(),
        );
        self.last_commanded = None;
        self.config = config;

        let changes = self.aggregator.recompute_all(&self.registry, now);
        self.apply_changes(changes);
        self.update_phase(now);
        self.settle(now);
    }

    fn pending_command(
        &mut self,
        id: PeerId,
        request: Request,
        now: DateTime<Utc>,
    ) -> Result<Answer> {
        match request {
            Request::Register {
                num,
                name,
                device_type,
                host,
                port,
            } => self.register_device(
                id,
                name,
                DeviceInfo {
                    num,
                    device_type,
                    host,
                    port,
                },
                now,
            ),
            Request::Login { login, name } => self.login_client(id, login, name),
            other => Err(CoordinatorError::Rejected(format!(
                "{} before register or login",
                other.name()
            ))),
        }
    }

    fn device_command(&mut self, id: PeerId, request: Request, now: DateTime<Utc>) -> Result<Answer> {
        match request {
            Request::Status {
                name,
                value,
                description,
            } => self.device_status(id, &name, StatusWord(value), description, now),
            Request::Authorize { client, key } => self.authorize(id, client, key),
            Request::Key { device } => self.issue_key(id, &device),
            Request::WeatherUpdate { device, reason } => self.weather_update(&device, reason, now),
            Request::Power(state) => self.power_request(id, state, now),
            Request::StatusInfo => {
                let bop = self.aggregator.effective_mask(&self.registry, id);
                let state = self.aggregator.status().register().bits();
                self.send(id, Message::Bop { state, bop });
                Ok(Answer::Ok)
            }
            Request::Info => self.info(id),
            Request::Register { .. } | Request::Login { .. } => Err(
                CoordinatorError::Rejected(format!("peer {} already registered", id)),
            ),
            other => Err(ProtocolError::UnknownCommand(other.name().to_string()).into()),
        }
    }

    fn client_command(&mut self, id: PeerId, request: Request, now: DateTime<Utc>) -> Result<Answer> {
        match request {
            Request::Key { device } => self.issue_key(id, &device),
            Request::Priority => {
                let event = self.priority.request(id, now)?;
                self.priority_event(event, now);
                Ok(Answer::Ok)
            }
            Request::PriorityDone => {
                let event = self.priority.holder_finished(id, now)?;
                self.priority_event(event, now);
                Ok(Answer::Ok)
            }
            Request::PriorityRelease => {
                let event = self.priority.release(id, now)?;
                self.priority_event(event, now);
                Ok(Answer::Ok)
            }
            Request::Power(state) => self.power_request(id, state, now),
            Request::Open => {
                self.require_priority(id, "open")?;
                if !self.should_be_open() {
                    return Err(CoordinatorError::Rejected(
                        "conditions do not allow opening".to_string(),
                    ));
                }
                self.run_sequence(Direction::Open, Some(id), now);
                Ok(Answer::Ok)
            }
            Request::Close => {
                self.require_priority(id, "close")?;
                if self.aggregator.status().power == PowerState::On {
                    let who = self.peer_name(id);
                    self.set_power(PowerState::Standby, &who, now);
                }
                self.run_sequence(Direction::Close, Some(id), now);
                Ok(Answer::Ok)
            }
            Request::StatusInfo => Ok(self.start_fanout(id, now)),
            Request::Info => self.info(id),
            Request::WeatherUpdate { device, reason } => self.weather_update(&device, reason, now),
            Request::Register { .. } | Request::Login { .. } => Err(
                CoordinatorError::Rejected(format!("peer {} already registered", id)),
            ),
            other => Err(ProtocolError::UnknownCommand(other.name().to_string()).into()),
        }
    }

    fn register_device(
        &mut self,
        id: PeerId,
        name: String,
        device: DeviceInfo,
        now: DateTime<Utc>,
    ) -> Result<Answer> {
        let announce = Message::Device {
            id,
            name: name.clone(),
            host: device.host.clone(),
            port: device.port,
            device_type: device.device_type.code(),
        };
        self.registry
            .register(id, Role::Device, &name, Some(device))?;
        info!(peer_id = id, device = %name, "device registered");

        self.send(id, Message::event("registered_as", id));
        self.initial_sync(id);
        self.broadcast_except(id, announce);

        let changes = self.aggregator.recompute_all(&self.registry, now);
        self.apply_changes(changes);
        self.push_bop(id);

        if self.sequencer.contains(&name) {
            if self.sequencer.is_idle() {
                if let Some(direction) = self.last_commanded {
                    self.run_sequence(direction, None, now);
                }
            } else {
                let events = self.sequencer.on_status_change(&self.registry, now);
                self.sequencer_events(events, now);
            }
        }
        Ok(Answer::Ok)
    }

    fn login_client(&mut self, id: PeerId, login: String, name: String) -> Result<Answer> {
        self.registry.register(id, Role::Client, &name, None)?;
        if let Some(link) = self.registry.get_mut(id) {
            link.login = login.clone();
        }
        info!(peer_id = id, login = %login, name = %name, "client logged in");

        self.send(id, Message::event("logged_as", id));
        self.initial_sync(id);
        self.broadcast_except(id, Message::User { id, login, name });
        Ok(Answer::Ok)
    }

    fn device_status(
        &mut self,
        id: PeerId,
        name: &str,
        status: StatusWord,
        description: String,
        now: DateTime<Utc>,
    ) -> Result<Answer> {
        let Some(link) = self.registry.get(id) else {
            return Ok(Answer::Silent);
        };
        if link.name != name {
            warn!(peer_id = id, device = %link.name, reported = name, "status for another register ignored");
            return Ok(Answer::Silent);
        }
        let old = link.status;

        let changes = self
            .aggregator
            .set_status(&mut self.registry, id, status, now);
        if old != status {
            debug!(device = name, from = %old, to = %status, "device status changed");
            self.broadcast_clients(Message::Status {
                name: name.to_string(),
                value: status.bits(),
                description,
            });
        }
        self.apply_changes(changes);

        let events = self.sequencer.on_status_change(&self.registry, now);
        self.sequencer_events(events, now);
        Ok(Answer::Silent)
    }

    fn weather_update(&mut self, device: &str, reason: String, now: DateTime<Utc>) -> Result<Answer> {
        let id = self
            .registry
            .device_by_name(device)
            .map(|link| link.id)
            .ok_or_else(|| CoordinatorError::UnknownDevice(device.to_string()))?;
        if let Some(link) = self.registry.get_mut(id) {
            link.weather_reason = Some(reason.clone());
        }
        info!(device, reason = %reason, "weather reason updated");
        let change = self
            .aggregator
            .recompute_weather(&self.registry, Some(id), now);
        self.apply_changes(change);
        Ok(Answer::Ok)
    }

    fn issue_key(&mut self, id: PeerId, device: &str) -> Result<Answer> {
        let key = self.registry.issue_key(id, device, &mut self.rng)?;
        info!(peer_id = id, device, "authorization key issued");
        self.send(
            id,
            Message::event("authorization_key", format!("{} {}", device, key)),
        );
        Ok(Answer::Ok)
    }

    fn authorize(&mut self, device: PeerId, client: PeerId, key: u32) -> Result<Answer> {
        match self.registry.authorize(device, client, key) {
            Ok(()) => {
                info!(device_id = device, client, "client authorized");
                self.send(device, Message::event("authorization_ok", client));
                Ok(Answer::Ok)
            }
            Err(err) => {
                warn!(device_id = device, client, %err, "authorization failed");
                self.send(device, Message::event("authorization_failed", client));
                Err(err.into())
            }
        }
    }

    fn power_request(&mut self, id: PeerId, state: PowerState, now: DateTime<Utc>) -> Result<Answer> {
        let who = self.peer_name(id);
        self.set_power(state, &who, now);
        Ok(Answer::Ok)
    }

    fn set_power(&mut self, state: PowerState, who: &str, now: DateTime<Utc>) {
        let status = self.aggregator.status_mut();
        let old = status.power;
        if state == PowerState::Standby {
            status.standby_history.push((now, who.to_string()));
        }
        if old != state {
            status.power = state;
            status.last_change = now;
        }
        info!(from = %old, to = %state, by = who, "power state changed");
        self.note = format!("{} by {}", state, who);
    }

    fn require_priority(&self, id: PeerId, command: &str) -> Result<()> {
        if self.priority.is_holder(id) {
            Ok(())
        } else {
            Err(CoordinatorError::NoPriority(format!(
                "{} requires priority",
                command
            )))
        }
    }

    fn info(&mut self, id: PeerId) -> Result<Answer> {
        let listing: Vec<Message> = self
            .registry
            .registered()
            .map(|peer| match &peer.device {
                Some(device) => Message::Device {
                    id: peer.id,
                    name: peer.name.clone(),
                    host: device.host.clone(),
                    port: device.port,
                    device_type: device.device_type.code(),
                },
                None => Message::User {
                    id: peer.id,
                    login: peer.login.clone(),
                    name: peer.name.clone(),
                },
            })
            .collect();
        for message in listing {
            self.send(id, message);
        }
        Ok(Answer::Ok)
    }

    fn start_fanout(&mut self, originator: PeerId, now: DateTime<Utc>) -> Answer {
        let devices: Vec<PeerId> = self.registry.devices().map(|d| d.id).collect();
        let deadline = after(now, to_chrono(self.config.centrald.status_timeout_duration()));
        let (request, done) = self
            .fanout
            .start(originator, devices.iter().copied(), deadline);
        if done.is_some() {
            return Answer::Ok;
        }
        for device in devices {
            self.enqueue(
                device,
                DeviceCommand {
                    command: "status_info",
                    origin: CommandOrigin::Fanout(request),
                    holder: None,
                },
                false,
                now,
            );
        }
        Answer::Deferred
    }

    fn finish_fanout(&mut self, completion: Completion) {
        if completion.missed.is_empty() {
            self.send(completion.originator, Message::ok());
            return;
        }
        let missed: Vec<String> = completion
            .missed
            .iter()
            .map(|id| {
                self.registry
                    .get(*id)
                    .map_or_else(|| format!("#{}", id), |link| link.name.clone())
            })
            .collect();
        let err = CoordinatorError::HardwareTimeout(missed.join(" "));
        self.reject(completion.originator, &err);
    }

    fn priority_event(&mut self, event: PriorityEvent, now: DateTime<Utc>) {
        match event {
            PriorityEvent::Granted { holder, epoch } => {
                self.send(holder, Message::event("priority_granted", epoch));
                self.broadcast(Message::value("priority_client", holder));
            }
            PriorityEvent::AlreadyHeld { holder, epoch } => {
                self.send(holder, Message::event("priority_granted", epoch));
            }
            PriorityEvent::RevokeRequested {
                holder,
                next,
                deadline,
            } => {
                self.send(holder, Message::event("priority_revoke", deadline.timestamp()));
                self.send(
                    next,
                    Message::event("priority_pending", format!("{} {}", holder, deadline.timestamp())),
                );
            }
            PriorityEvent::HandedOver {
                from,
                to,
                epoch,
                forced,
            } => {
                if forced {
                    self.cancel_holder(from, now);
                }
                self.send(from, Message::event("priority_lost", ""));
                self.send(to, Message::event("priority_granted", epoch));
                self.broadcast(Message::value("priority_client", to));
            }
            PriorityEvent::Released { holder } => {
                self.send(holder, Message::event("priority_lost", ""));
                self.broadcast(Message::value("priority_client", -1));
            }
            PriorityEvent::Revoked { holder, .. } => {
                self.cancel_holder(holder, now);
                self.broadcast(Message::value("priority_client", -1));
            }
            PriorityEvent::RevokeCancelled { holder, next } => {
                self.send(next, Message::event("priority_lost", ""));
                self.send(holder, Message::event("priority_granted", self.priority.epoch()));
            }
        }
    }

    /// Undo everything running on behalf of a holder whose priority was
    /// taken away by force
    fn cancel_holder(&mut self, holder: PeerId, now: DateTime<Utc>) {
        let stop_command = DeviceCommand {
            command: "stop",
            origin: CommandOrigin::Cancellation,
            holder: None,
        };
        let mut busy = BTreeSet::new();
        let mut dropped = 0;
        for device in self.registry.devices_mut() {
            dropped += device.queue.drop_holder(holder);
            if device
                .queue
                .in_flight()
                .map_or(false, |c| c.holder == Some(holder))
            {
                busy.insert(device.id);
            }
        }
        let mut stop = BTreeSet::new();
        if let Some(link) = self.registry.get_mut(holder) {
            link.key = None;
            stop.extend(std::mem::take(&mut link.authorized));
        }
        stop.retain(|id| !busy.contains(id));
        warn!(
            holder,
            dropped,
            preempted = busy.len(),
            stopping = stop.len(),
            "priority holder forcibly cancelled"
        );

        // the holder's in-flight work is interrupted, not waited for
        for device in busy {
            let Some(link) = self.registry.get_mut(device) else {
                continue;
            };
            let (retired, text) = link.queue.preempt(stop_command.clone(), now);
            if let Some(retired) = retired {
                debug!(device = %link.name, command = retired.command, "in-flight command preempted");
            }
            self.send(device, Message::Command(text));
        }
        for device in stop {
            self.enqueue(device, stop_command.clone(), true, now);
        }
        if self.sequencer.origin() == Some(holder) && self.sequencer.abort() {
            info!(holder, "sequence started by cancelled holder aborted");
            self.last_commanded = None;
        }
    }

    fn run_sequence(&mut self, direction: Direction, origin: Option<PeerId>, now: DateTime<Utc>) {
        self.last_commanded = Some(direction);
        self.broadcast(Message::value("open_close", direction));
        let events = self.sequencer.start(direction, origin, &self.registry, now);
        self.sequencer_events(events, now);
    }

    fn sequencer_events(&mut self, events: Vec<SequencerEvent>, now: DateTime<Utc>) {
        for event in events {
            match event {
                SequencerEvent::Issue { device, direction } => {
                    let Some(id) = self.registry.device_by_name(&device).map(|d| d.id) else {
                        continue;
                    };
                    let holder = self.sequencer.origin();
                    self.enqueue(
                        id,
                        DeviceCommand {
                            command: direction.command(),
                            origin: CommandOrigin::Sequencer(direction),
                            holder,
                        },
                        false,
                        now,
                    );
                }
                SequencerEvent::StepFailed { .. } => {
                    let failed = join(self.sequencer.failed_close());
                    self.broadcast(Message::value("failed_close", failed));
                }
                SequencerEvent::Completed {
                    direction,
                    failed_close,
                } => {
                    let done = match direction {
                        Direction::Open => "opened",
                        Direction::Close => "closed",
                    };
                    self.broadcast(Message::value("open_close", done));
                    if direction == Direction::Close {
                        self.broadcast(Message::value("failed_close", failed_close.join(" ")));
                    }
                }
                SequencerEvent::Aborted {
                    direction,
                    device,
                    failure,
                } => {
                    error!(%direction, device = %device, %failure, "sequence aborted");
                    self.broadcast(Message::value("open_close", "aborted"));
                }
            }
        }
    }

    fn evaluate_trigger(&mut self, now: DateTime<Utc>) {
        let desired = if self.should_be_open() {
            Direction::Open
        } else {
            Direction::Close
        };
        if self.last_commanded != Some(desired) {
            info!(
                from = ?self.last_commanded,
                to = %desired,
                phase = %self.aggregator.status().phase,
                power = %self.aggregator.status().power,
                weather_safe = self.aggregator.status().weather_safe(),
                "desired facility state changed"
            );
            self.run_sequence(desired, None, now);
        }
    }

    /// Queue a command for a device, writing it out if the device is idle
    fn enqueue(&mut self, device: PeerId, command: DeviceCommand, urgent: bool, now: DateTime<Utc>) {
        let Some(link) = self.registry.get_mut(device) else {
            return;
        };
        debug!(device = %link.name, command = command.command, urgent, "command queued");
        let ready = if urgent {
            link.queue.push_urgent(command, now)
        } else {
            link.queue.push(command, now)
        };
        if let Some(text) = ready {
            self.send(device, Message::Command(text));
        }
    }

    fn command_replied(&mut self, id: PeerId, code: i32, message: &str, now: DateTime<Utc>) {
        let Some(link) = self.registry.get_mut(id) else {
            return;
        };
        let name = link.name.clone();
        let (done, next) = link.queue.complete(now);
        if let Some(text) = next {
            self.send(id, Message::Command(text));
        }
        let Some(command) = done else {
            debug!(peer_id = id, code, "reply without a pending command");
            return;
        };
        let outcome = if code >= 0 {
            Ok(())
        } else {
            warn!(device = %name, command = command.command, code, message, "device command failed");
            Err(CoordinatorError::Rejected(message.to_string()))
        };
        self.command_finished(id, &name, command, outcome, now);
    }

    /// Fail in-flight commands that went unanswered for too long.
    ///
    /// Sequence steps run on the step timeout, which the sequencer enforces
    /// itself; everything else gets the status timeout.
    fn expire_commands(&mut self, now: DateTime<Utc>) {
        let status_cutoff = before(now, to_chrono(self.config.centrald.status_timeout_duration()));
        let step_cutoff = before(
            now,
            to_chrono(self.config.centrald.step_timeout_duration()),
        );
        let overdue: Vec<PeerId> = self
            .registry
            .devices()
            .filter(|d| {
                let cutoff = match d.queue.in_flight().map(|c| c.origin) {
                    Some(CommandOrigin::Sequencer(_)) => step_cutoff,
                    _ => status_cutoff,
                };
                d.queue.overdue(cutoff)
            })
            .map(|d| d.id)
            .collect();
        for id in overdue {
            let Some(link) = self.registry.get_mut(id) else {
                continue;
            };
            let name = link.name.clone();
            let (done, next) = link.queue.abandon(now);
            if let Some(text) = next {
                self.send(id, Message::Command(text));
            }
            if let Some(command) = done {
                warn!(device = %name, command = command.command, "device command timed out");
                let err = CoordinatorError::HardwareTimeout(format!("{} {}", name, command.command));
                self.command_finished(id, &name, command, Err(err), now);
            }
        }
    }

    fn command_finished(
        &mut self,
        device: PeerId,
        name: &str,
        command: DeviceCommand,
        outcome: Result<()>,
        now: DateTime<Utc>,
    ) {
        match command.origin {
            CommandOrigin::Fanout(request) => {
                let done = match outcome {
                    Ok(()) => self.fanout.reply(request, device),
                    Err(_) => self.fanout.give_up(request, device),
                };
                if let Some(completion) = done {
                    self.finish_fanout(completion);
                }
            }
            CommandOrigin::Sequencer(_) => {
                if outcome.is_err() {
                    let events = self.sequencer.on_command_failed(name, &self.registry, now);
                    self.sequencer_events(events, now);
                }
            }
            CommandOrigin::Cancellation => {
                if let Err(err) = outcome {
                    warn!(device = name, %err, "stop after forced cancellation failed");
                }
            }
        }
    }

    fn update_phase(&mut self, now: DateTime<Utc>) {
        let event = match self.schedule.next_event(now) {
            Ok(event) => event,
            Err(err) => {
                error!(%err, "cannot compute the next diurnal transition, retrying in an hour");
                self.next_state_change = after(now, Duration::hours(1));
                return;
            }
        };
        self.next_state = event.next;
        self.next_state_change = event.next_time;

        let old = self.aggregator.status().phase;
        if old != event.current {
            self.enter_phase(old, event.current, now);
        }

        self.night = match self.schedule.night_window(now) {
            Ok(window) => Some(window),
            Err(err) => {
                debug!(%err, "no night window");
                None
            }
        };
        debug!(next = %self.next_state, at = %self.next_state_change, "next transition scheduled");
        self.broadcast_schedule();
    }

    fn enter_phase(&mut self, old: DiurnalPhase, new: DiurnalPhase, now: DateTime<Utc>) {
        info!(from = %old, to = %new, "diurnal phase changed");
        {
            let status = self.aggregator.status_mut();
            status.phase = new;
            status.last_change = now;
        }
        match new {
            DiurnalPhase::Dusk => self.aggregator.status_mut().standby_history.clear(),
            DiurnalPhase::Day if old == DiurnalPhase::Morning => self.apply_morning_policy(now),
            _ => {}
        }
    }

    fn apply_morning_policy(&mut self, now: DateTime<Utc>) {
        let power = self.aggregator.status().power;
        if power.is_off() {
            debug!(%power, "already off at daybreak");
            return;
        }
        match self.config.centrald.morning_policy() {
            MorningPolicy::Off => self.set_power(PowerState::HardOff, "morning", now),
            MorningPolicy::Standby => self.set_power(PowerState::Standby, "morning", now),
            MorningPolicy::Nothing => {}
        }
    }

    fn broadcast_schedule(&mut self) {
        self.broadcast(Message::value("next_state", self.next_state));
        self.broadcast(Message::value(
            "next_state_change",
            self.next_state_change.timestamp(),
        ));
        if let Some(night) = self.night {
            self.broadcast(Message::value("night_start", night.start.timestamp()));
            self.broadcast(Message::value("night_stop", night.stop.timestamp()));
        }
    }

    fn broadcast_sun(&mut self, now: DateTime<Utc>) {
        let sun = self.schedule.sun_position(now);
        self.broadcast(Message::value("sun_alt", format!("{:.3}", sun.altitude)));
        self.broadcast(Message::value("sun_az", format!("{:.3}", sun.azimuth)));
    }

    fn apply_changes(&mut self, changes: impl IntoIterator<Item = AggregateChange>) {
        for change in changes {
            match change {
                AggregateChange::Weather {
                    safe,
                    failing,
                    reason,
                } => {
                    self.broadcast(Message::value("weather_safe", u8::from(safe)));
                    self.broadcast(Message::value("failed_devices", failing.join(" ")));
                    if let Some(reason) = reason {
                        self.broadcast(Message::value(
                            "weather_reason",
                            format!("{}: {}", reason.device, reason.reason),
                        ));
                    }
                }
                AggregateChange::Stop { safe, stopping } => {
                    self.broadcast(Message::value("stop_safe", u8::from(safe)));
                    self.broadcast(Message::value("stopping_devices", stopping.join(" ")));
                }
                AggregateChange::Bop { device, mask } => {
                    if let Some(id) = self.registry.device_by_name(&device).map(|d| d.id) {
                        let state = self.aggregator.status().register().bits();
                        self.send(id, Message::Bop { state, bop: mask });
                    }
                }
            }
        }
    }

    /// Re-evaluate the open/close trigger and announce the system register
    fn settle(&mut self, now: DateTime<Utc>) {
        self.evaluate_trigger(now);

        let register = self.aggregator.status().register();
        let current = (register, self.note.clone());
        if self.announced.as_ref() == Some(&current) {
            return;
        }
        self.broadcast(Message::Status {
            name: CENTRALD.to_string(),
            value: register.bits(),
            description: self.note.clone(),
        });
        let devices: Vec<PeerId> = self.registry.devices().map(|d| d.id).collect();
        for id in devices {
            self.push_bop(id);
        }
        self.announced = Some(current);
    }

    fn push_bop(&mut self, id: PeerId) {
        let Some(link) = self.registry.get(id) else {
            return;
        };
        let status = self.aggregator.status();
        let bop = status.safety.bop.get(&link.name).copied().unwrap_or(0);
        let state = status.register().bits();
        self.send(id, Message::Bop { state, bop });
    }

    /// Full register set plus the current named values, for a new peer
    fn initial_sync(&mut self, id: PeerId) {
        let status = self.aggregator.status();
        let mut registers = vec![(CENTRALD.to_string(), status.register().bits())];
        registers.extend(
            self.registry
                .devices()
                .map(|d| (d.name.clone(), d.status.bits())),
        );

        let mut sync = vec![Message::StatusNum(registers.len())];
        sync.extend(
            registers
                .into_iter()
                .enumerate()
                .map(|(index, (name, value))| Message::StatusEntry { index, name, value }),
        );
        sync.push(Message::value("weather_safe", u8::from(status.safety.weather_safe)));
        sync.push(Message::value("failed_devices", join(&status.safety.failing)));
        if let Some(reason) = &status.weather_reason {
            sync.push(Message::value(
                "weather_reason",
                format!("{}: {}", reason.device, reason.reason),
            ));
        }
        sync.push(Message::value("stop_safe", u8::from(status.safety.stop_safe)));
        sync.push(Message::value("stopping_devices", join(&status.safety.stopping)));
        sync.push(Message::value(
            "priority_client",
            self.priority.holder().map_or(-1, i64::from),
        ));
        sync.push(Message::value("next_state", self.next_state));
        sync.push(Message::value(
            "next_state_change",
            self.next_state_change.timestamp(),
        ));
        if let Some(night) = self.night {
            sync.push(Message::value("night_start", night.start.timestamp()));
            sync.push(Message::value("night_stop", night.stop.timestamp()));
        }
        for message in sync {
            self.send(id, message);
        }
    }

    fn peer_name(&self, id: PeerId) -> String {
        self.registry
            .get(id)
            .map(|link| link.name.clone())
            .unwrap_or_default()
    }

    fn reject(&mut self, id: PeerId, err: &CoordinatorError) {
        match err {
            CoordinatorError::Authorization(_) | CoordinatorError::DuplicateName(_) => {
                warn!(peer_id = id, %err, "command rejected")
            }
            _ => debug!(peer_id = id, %err, "command rejected"),
        }
        self.send(id, Message::reply(err.reply_code(), err.to_string()));
    }

    fn send(&mut self, to: PeerId, message: Message) {
        self.outbox.push(Envelope { to, message });
    }

    fn broadcast(&mut self, message: Message) {
        for peer in self.registry.registered() {
            self.outbox.push(Envelope {
                to: peer.id,
                message: message.clone(),
            });
        }
    }

    fn broadcast_except(&mut self, except: PeerId, message: Message) {
        for peer in self.registry.registered().filter(|p| p.id != except) {
            self.outbox.push(Envelope {
                to: peer.id,
                message: message.clone(),
            });
        }
    }

    fn broadcast_clients(&mut self, message: Message) {
        for peer in self.registry.clients() {
            self.outbox.push(Envelope {
                to: peer.id,
                message: message.clone(),
            });
        }
    }
}

fn join<'a>(names: impl IntoIterator<Item = &'a String>) -> String {
    names
        .into_iter()
        .map(String::as_str)
        .collect::<Vec<_>>()
        .join(" ")
}
