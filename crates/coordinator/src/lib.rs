//! Nightwatch coordinator
//!
//! The central process of the observatory. Devices and operator clients
//! connect over a line protocol; the coordinator aggregates their status
//! registers into system-wide safety flags, arbitrates which client may move
//! hardware, and opens or closes the facility as the sun and the weather
//! allow.
//!
//! [`Coordinator`] holds the logic and performs no I/O, so it can be driven
//! directly from tests. [`CoordinatorServer`] puts it behind a TCP listener.

pub mod aggregator;
pub mod blocking;
mod clock;
pub mod coordinator;
pub mod error;
pub mod fanout;
pub mod priority;
pub mod protocol;
pub mod queue;
pub mod registry;
pub mod sequencer;
pub mod server;

pub use aggregator::{AggregateChange, Safety, StateAggregator, SystemStatus, WeatherReason};
pub use blocking::BlockingRelation;
pub use coordinator::{Coordinator, Envelope, CENTRALD};
pub use error::{CoordinatorError, Result};
pub use fanout::{Completion, RequestId, StatusFanout};
pub use priority::{ForcedCancellation, GrantState, PriorityArbiter, PriorityError, PriorityEvent};
pub use protocol::{Message, ProtocolError, ReplyCode, Request};
pub use queue::{CommandOrigin, CommandQueue, DeviceCommand};
pub use registry::{PeerId, PeerLink, PeerRegistry, RegistryError, Role};
pub use sequencer::{Direction, OpenCloseSequencer, OpenCloseView, SequencePhase, SequencerEvent, StepFailure};
pub use server::{CoordinatorServer, PeerEvent};
