//! Coordinator error taxonomy
//!
//! None of these are fatal. Each one becomes a negative terminal reply to the
//! peer whose command failed.

use crate::priority::PriorityError;
use crate::protocol::{ProtocolError, ReplyCode};
use crate::registry::{PeerId, RegistryError};
use thiserror::Error;

/// Errors raised while handling a peer command
#[derive(Debug, Error, PartialEq, Eq)]
pub enum CoordinatorError {
    /// Malformed line
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// Bad or missing authorization key
    #[error("authorization failed: {0}")]
    Authorization(String),

    /// Name already registered for this role
    #[error("name {0} already registered")]
    DuplicateName(String),

    /// Device did not acknowledge in time
    #[error("{0} timed out")]
    HardwareTimeout(String),

    /// Connection went away before answering
    #[error("peer {0} disconnected")]
    PeerLost(PeerId),

    /// Command needs priority the peer does not hold
    #[error("no priority: {0}")]
    NoPriority(String),

    #[error("unknown device {0}")]
    UnknownDevice(String),

    /// Command not acceptable in the current state
    #[error("{0}")]
    Rejected(String),
}

impl CoordinatorError {
    pub fn reply_code(&self) -> ReplyCode {
        match self {
            CoordinatorError::Protocol(e) => e.reply_code(),
            CoordinatorError::Authorization(_) | CoordinatorError::NoPriority(_) => {
                ReplyCode::Priority
            }
            CoordinatorError::DuplicateName(_) | CoordinatorError::UnknownDevice(_) => {
                ReplyCode::ParamValue
            }
            CoordinatorError::HardwareTimeout(_) => ReplyCode::Timeout,
            CoordinatorError::PeerLost(_) => ReplyCode::Hardware,
            CoordinatorError::Rejected(_) => ReplyCode::System,
        }
    }
}

impl From<RegistryError> for CoordinatorError {
    fn from(err: RegistryError) -> Self {
        match err {
            RegistryError::DuplicateName { name, .. } => CoordinatorError::DuplicateName(name),
            RegistryError::UnknownDevice(name) => CoordinatorError::UnknownDevice(name),
            RegistryError::ZeroKey(_) | RegistryError::KeyMismatch(_) => {
                CoordinatorError::Authorization(err.to_string())
            }
            RegistryError::AlreadyRegistered(_) | RegistryError::UnknownPeer(_) => {
                CoordinatorError::Rejected(err.to_string())
            }
        }
    }
}

impl From<PriorityError> for CoordinatorError {
    fn from(err: PriorityError) -> Self {
        CoordinatorError::NoPriority(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, CoordinatorError>;
