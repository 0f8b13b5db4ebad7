//! Peer registry and authorization keys
//!
//! Every accepted connection gets a numeric id straight away. Registration
//! later binds it to a role and a name; names are unique per role.

use crate::queue::CommandQueue;
use chrono::{DateTime, Utc};
use nightwatch_core::{DeviceType, StatusWord};
use rand::Rng;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use thiserror::Error;

/// Connection id, never reused within one coordinator run
pub type PeerId = u32;

/// Registry errors
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    /// Another peer of the same role already uses the name
    #[error("{role} name {name} already registered")]
    DuplicateName {
        /// Role of the colliding peer
        role: Role,
        /// Requested name
        name: String,
    },

    /// The connection already completed registration
    #[error("peer {0} already registered")]
    AlreadyRegistered(PeerId),

    /// No such connection
    #[error("unknown peer {0}")]
    UnknownPeer(PeerId),

    /// No registered device with this name
    #[error("unknown device {0}")]
    UnknownDevice(String),

    /// Authorization with a zero key
    #[error("zero authorization key for peer {0}")]
    ZeroKey(PeerId),

    /// Key does not match the one issued for this device
    #[error("invalid authorization key for peer {0}")]
    KeyMismatch(PeerId),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    /// Accepted, not yet registered
    Pending,
    Device,
    Client,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Role::Pending => "pending",
            Role::Device => "device",
            Role::Client => "client",
        })
    }
}

/// Routing information declared by a device at registration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceInfo {
    pub num: i32,
    pub device_type: DeviceType,
    pub host: String,
    pub port: u16,
}

/// One-time key bound to the device it was issued for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IssuedKey {
    pub device: PeerId,
    pub key: u32,
}

/// One peer connection
#[derive(Debug, Clone)]
pub struct PeerLink {
    pub id: PeerId,
    pub role: Role,
    pub name: String,
    /// Client login, empty for devices
    pub login: String,
    /// Remote socket address, for logs
    pub remote: String,
    pub status: StatusWord,
    /// Register before the last update
    pub previous: StatusWord,
    pub device: Option<DeviceInfo>,
    /// Free-text reason attached by `weather_update`
    pub weather_reason: Option<String>,
    pub key: Option<IssuedKey>,
    /// Devices this peer authenticated to
    pub authorized: BTreeSet<PeerId>,
    pub queue: CommandQueue,
    pub connected_at: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
}

impl PeerLink {
    fn new(id: PeerId, remote: String, now: DateTime<Utc>) -> Self {
        Self {
            id,
            role: Role::Pending,
            name: String::new(),
            login: String::new(),
            remote,
            status: StatusWord::default(),
            previous: StatusWord::default(),
            device: None,
            weather_reason: None,
            key: None,
            authorized: BTreeSet::new(),
            queue: CommandQueue::new(),
            connected_at: now,
            last_seen: now,
        }
    }

    pub fn is_device(&self) -> bool {
        self.role == Role::Device
    }

    pub fn is_client(&self) -> bool {
        self.role == Role::Client
    }

    pub fn is_registered(&self) -> bool {
        self.role != Role::Pending
    }
}

#[derive(Debug)]
pub struct PeerRegistry {
    peers: BTreeMap<PeerId, PeerLink>,
    next_id: PeerId,
}

impl PeerRegistry {
    pub fn new() -> Self {
        Self {
            peers: BTreeMap::new(),
            next_id: 1,
        }
    }

    /// Track a freshly accepted connection
    pub fn open(&mut self, remote: impl Into<String>, now: DateTime<Utc>) -> PeerId {
        let id = self.next_id;
        self.next_id += 1;
        self.peers.insert(id, PeerLink::new(id, remote.into(), now));
        id
    }

    /// Bind a pending connection to a role and name
    pub fn register(
        &mut self,
        id: PeerId,
        role: Role,
        name: &str,
        device: Option<DeviceInfo>,
    ) -> Result<&PeerLink, RegistryError> {
        if self.lookup_name(role, name).is_some() {
            return Err(RegistryError::DuplicateName {
                role,
                name: name.to_string(),
            });
        }
        let link = self
            .peers
            .get_mut(&id)
            .ok_or(RegistryError::UnknownPeer(id))?;
        if link.is_registered() {
            return Err(RegistryError::AlreadyRegistered(id));
        }
        link.role = role;
        link.name = name.to_string();
        link.device = device;
        Ok(link)
    }

    /// Remove a connection and every key bound to it
    pub fn deregister(&mut self, id: PeerId) -> Option<PeerLink> {
        let link = self.peers.remove(&id)?;
        if link.is_device() {
            for other in self.peers.values_mut() {
                if other.key.map_or(false, |k| k.device == id) {
                    other.key = None;
                }
                other.authorized.remove(&id);
            }
        }
        Some(link)
    }

    pub fn get(&self, id: PeerId) -> Option<&PeerLink> {
        self.peers.get(&id)
    }

    pub fn get_mut(&mut self, id: PeerId) -> Option<&mut PeerLink> {
        self.peers.get_mut(&id)
    }

    pub fn lookup_name(&self, role: Role, name: &str) -> Option<&PeerLink> {
        self.peers
            .values()
            .find(|p| p.role == role && p.name == name)
    }

    pub fn device_by_name(&self, name: &str) -> Option<&PeerLink> {
        self.lookup_name(Role::Device, name)
    }

    pub fn devices(&self) -> impl Iterator<Item = &PeerLink> {
        self.peers.values().filter(|p| p.is_device())
    }

    pub fn devices_mut(&mut self) -> impl Iterator<Item = &mut PeerLink> {
        self.peers.values_mut().filter(|p| p.is_device())
    }

    pub fn clients(&self) -> impl Iterator<Item = &PeerLink> {
        self.peers.values().filter(|p| p.is_client())
    }

    /// Registered peers of either role
    pub fn registered(&self) -> impl Iterator<Item = &PeerLink> {
        self.peers.values().filter(|p| p.is_registered())
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    /// Store a new register value. Returns the previous one.
    pub fn set_status(&mut self, id: PeerId, status: StatusWord) -> Option<StatusWord> {
        let link = self.peers.get_mut(&id)?;
        link.previous = link.status;
        link.status = status;
        Some(link.previous)
    }

    /// Issue a fresh nonzero key for `requester` to present to `device`.
    ///
    /// Any key issued earlier to the same requester is replaced.
    pub fn issue_key<R: Rng + ?Sized>(
        &mut self,
        requester: PeerId,
        device: &str,
        rng: &mut R,
    ) -> Result<u32, RegistryError> {
        let device_id = self
            .device_by_name(device)
            .map(|d| d.id)
            .ok_or_else(|| RegistryError::UnknownDevice(device.to_string()))?;
        let link = self
            .peers
            .get_mut(&requester)
            .ok_or(RegistryError::UnknownPeer(requester))?;
        let key = rng.gen_range(1..=u32::MAX);
        link.key = Some(IssuedKey {
            device: device_id,
            key,
        });
        Ok(key)
    }

    /// Check a key a client presented to `device`, consuming it on success
    pub fn authorize(
        &mut self,
        device: PeerId,
        client: PeerId,
        key: u32,
    ) -> Result<(), RegistryError> {
        if key == 0 {
            return Err(RegistryError::ZeroKey(client));
        }
        let link = self
            .peers
            .get_mut(&client)
            .ok_or(RegistryError::UnknownPeer(client))?;
        match link.key {
            Some(issued) if issued == (IssuedKey { device, key }) => {
                link.key = None;
                link.authorized.insert(device);
                Ok(())
            }
            _ => Err(RegistryError::KeyMismatch(client)),
        }
    }
}

impl Default for PeerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 20, 22, 0, 0).unwrap()
    }

    fn device_info() -> DeviceInfo {
        DeviceInfo {
            num: 1,
            device_type: DeviceType::Dome,
            host: "localhost".into(),
            port: 5555,
        }
    }

    #[test]
    fn test_ids_are_monotonic() {
        let mut registry = PeerRegistry::new();
        let a = registry.open("127.0.0.1:1000", now());
        let b = registry.open("127.0.0.1:1001", now());
        registry.deregister(a);
        let c = registry.open("127.0.0.1:1002", now());
        assert!(a < b && b < c);
    }

    #[test]
    fn test_duplicate_name_leaves_original_untouched() {
        let mut registry = PeerRegistry::new();
        let first = registry.open("a", now());
        let second = registry.open("b", now());
        registry
            .register(first, Role::Device, "dome", Some(device_info()))
            .unwrap();
        let err = registry
            .register(second, Role::Device, "dome", Some(device_info()))
            .unwrap_err();
        assert!(matches!(err, RegistryError::DuplicateName { .. }));
        assert_eq!(registry.device_by_name("dome").unwrap().id, first);
        assert_eq!(registry.get(second).unwrap().role, Role::Pending);

        // the same name is fine for the other role
        registry.register(second, Role::Client, "dome", None).unwrap();
    }

    #[test]
    fn test_register_twice_rejected() {
        let mut registry = PeerRegistry::new();
        let id = registry.open("a", now());
        registry.register(id, Role::Client, "alice", None).unwrap();
        assert_eq!(
            registry.register(id, Role::Client, "bob", None).unwrap_err(),
            RegistryError::AlreadyRegistered(id)
        );
    }

    #[test]
    fn test_key_is_bound_to_device_and_single_use() {
        let mut rng = StdRng::seed_from_u64(7);
        let mut registry = PeerRegistry::new();
        let dome = registry.open("a", now());
        let mount = registry.open("b", now());
        let client = registry.open("c", now());
        registry
            .register(dome, Role::Device, "dome", Some(device_info()))
            .unwrap();
        registry
            .register(mount, Role::Device, "mount", Some(device_info()))
            .unwrap();
        registry.register(client, Role::Client, "alice", None).unwrap();

        let key = registry.issue_key(client, "dome", &mut rng).unwrap();
        assert_ne!(key, 0);
        assert_eq!(
            registry.authorize(mount, client, key),
            Err(RegistryError::KeyMismatch(client))
        );
        assert_eq!(
            registry.authorize(dome, client, key.wrapping_add(1).max(1)),
            Err(RegistryError::KeyMismatch(client))
        );
        registry.authorize(dome, client, key).unwrap();
        assert!(registry.get(client).unwrap().authorized.contains(&dome));
        assert_eq!(
            registry.authorize(dome, client, key),
            Err(RegistryError::KeyMismatch(client))
        );
    }

    #[test]
    fn test_zero_key_and_unknown_device() {
        let mut rng = StdRng::seed_from_u64(1);
        let mut registry = PeerRegistry::new();
        let client = registry.open("c", now());
        registry.register(client, Role::Client, "alice", None).unwrap();
        assert_eq!(
            registry.issue_key(client, "dome", &mut rng),
            Err(RegistryError::UnknownDevice("dome".into()))
        );
        assert_eq!(
            registry.authorize(99, client, 0),
            Err(RegistryError::ZeroKey(client))
        );
    }

    #[test]
    fn test_device_removal_invalidates_keys() {
        let mut rng = StdRng::seed_from_u64(3);
        let mut registry = PeerRegistry::new();
        let dome = registry.open("a", now());
        let client = registry.open("c", now());
        registry
            .register(dome, Role::Device, "dome", Some(device_info()))
            .unwrap();
        registry.register(client, Role::Client, "alice", None).unwrap();
        registry.issue_key(client, "dome", &mut rng).unwrap();

        registry.deregister(dome);
        assert!(registry.get(client).unwrap().key.is_none());
    }

    #[test]
    fn test_set_status_keeps_previous() {
        let mut registry = PeerRegistry::new();
        let id = registry.open("a", now());
        assert_eq!(registry.set_status(id, StatusWord(4)), Some(StatusWord(0)));
        assert_eq!(registry.set_status(id, StatusWord(1)), Some(StatusWord(4)));
        assert_eq!(registry.get(id).unwrap().previous, StatusWord(4));
        assert_eq!(registry.set_status(42, StatusWord(1)), None);
    }
}
