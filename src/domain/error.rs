//! Error taxonomy for the DSC session core.
//!
//! Nothing here is process-fatal. Command errors go back to the caller,
//! callback-driven errors are reported as `DscEvent::Fault`.

use crate::domain::models::CharacteristicRole;
use serde::Serialize;
use thiserror::Error;
use uuid::Uuid;

/// Why a text payload could not be turned into a sample.
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize)]
pub enum DecodeError {
    #[error("payload is not valid UTF-8")]
    NotUtf8,

    #[error("payload too short ({len} < 6 characters)")]
    TooShort { len: usize },

    #[error("unexpected character {ch:?} at index {index}")]
    InvalidCharacter { ch: char, index: usize },

    #[error("field {field:?} is not a decimal number")]
    InvalidNumber { field: String },
}

#[derive(Error, Debug, Clone, PartialEq, Serialize)]
pub enum SessionError {
    #[error("Bluetooth transport unavailable")]
    TransportUnavailable,

    #[error("Peripheral address is empty")]
    InvalidAddress,

    #[error("No open session")]
    NotConnected,

    #[error("DSC service {0} not found")]
    ServiceNotFound(Uuid),

    #[error("{0:?} characteristic {1} not found")]
    CharacteristicNotFound(CharacteristicRole, Uuid),

    #[error("Service discovery failed: {0}")]
    DiscoveryFailed(String),

    #[error("Notification subscription failed: {0}")]
    SubscribeFailed(String),

    #[error("Read of {uuid} failed: {reason}")]
    ReadFailed { uuid: Uuid, reason: String },

    #[error("Malformed sample: {0}")]
    MalformedSample(#[from] DecodeError),

    #[error("Transport error: {0}")]
    Transport(String),
}
