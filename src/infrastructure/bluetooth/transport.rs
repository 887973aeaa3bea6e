//! BLE transport contract
//!
//! The session core never talks to a Bluetooth stack directly. It issues
//! non-blocking requests through [`Transport`] and learns the outcome later
//! from [`TransportEvent`] messages, which every backend delivers over one
//! unbounded channel regardless of which thread its callbacks run on.

use crate::domain::error::SessionError;
use crate::domain::models::CharacteristicRole;
use std::fmt;
use tokio::sync::mpsc;
use uuid::Uuid;

/// Remote device address, as understood by the transport.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PeripheralAddress(String);

impl PeripheralAddress {
    /// Rejects empty (or blank) addresses; anything else is left to the transport.
    pub fn parse(address: &str) -> Result<Self, SessionError> {
        let address = address.trim();
        if address.is_empty() {
            return Err(SessionError::InvalidAddress);
        }
        Ok(Self(address.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PeripheralAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Identity of one transport-level session object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(pub u64);

/// Counter bumped every time a session reaches Connected. Anything derived
/// from one connected lifetime carries the generation it was created in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Generation(pub u64);

/// Tag echoed back by the transport with a read completion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ReadRequestId {
    pub generation: Generation,
    pub seq: u64,
}

/// A characteristic on the connected peripheral, valid for one generation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CharacteristicHandle {
    pub session: SessionId,
    pub generation: Generation,
    pub role: CharacteristicRole,
    pub uuid: Uuid,
}

/// Characteristic as reported by discovery
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveredCharacteristic {
    pub uuid: Uuid,
    pub readable: bool,
    pub notifiable: bool,
}

/// Service as reported by discovery, characteristics in the order the peripheral listed them
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveredService {
    pub uuid: Uuid,
    pub characteristics: Vec<DiscoveredCharacteristic>,
}

/// Facts reported by the Bluetooth stack. They never change session state by
/// themselves; the state machine decides what each one means.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    Connected {
        session: SessionId,
    },
    Disconnected {
        session: SessionId,
    },
    ServicesDiscovered {
        session: SessionId,
        result: Result<Vec<DiscoveredService>, String>,
    },
    ReadCompleted {
        session: SessionId,
        request: ReadRequestId,
        uuid: Uuid,
        result: Result<Vec<u8>, String>,
    },
    Notification {
        session: SessionId,
        uuid: Uuid,
        value: Vec<u8>,
    },
}

impl TransportEvent {
    pub fn session(&self) -> SessionId {
        match self {
            Self::Connected { session }
            | Self::Disconnected { session }
            | Self::ServicesDiscovered { session, .. }
            | Self::ReadCompleted { session, .. }
            | Self::Notification { session, .. } => *session,
        }
    }
}

pub type TransportEventSender = mpsc::UnboundedSender<TransportEvent>;
pub type TransportEventReceiver = mpsc::UnboundedReceiver<TransportEvent>;

/// Channel a backend reports into and the session service drains.
pub fn transport_channel() -> (TransportEventSender, TransportEventReceiver) {
    mpsc::unbounded_channel()
}

/// A Bluetooth LE central stack.
///
/// Every method returns immediately. `Ok` means the request was accepted;
/// its outcome arrives later as a [`TransportEvent`] tagged with the same
/// [`SessionId`]. `Err` means the request was rejected outright.
pub trait Transport: Send {
    /// Whether an adapter is present and usable
    fn is_available(&self) -> bool;

    /// Create a new session object and start connecting to `address`.
    fn open(&mut self, session: SessionId, address: &PeripheralAddress)
        -> Result<(), SessionError>;

    /// Reconnect an existing, currently disconnected session object.
    fn resume(&mut self, session: SessionId) -> Result<(), SessionError>;

    fn discover_services(&mut self, session: SessionId) -> Result<(), SessionError>;

    /// Enable or disable notifications. Completes synchronously.
    fn set_notify(
        &mut self,
        handle: &CharacteristicHandle,
        enabled: bool,
    ) -> Result<(), SessionError>;

    fn read(
        &mut self,
        handle: &CharacteristicHandle,
        request: ReadRequestId,
    ) -> Result<(), SessionError>;

    /// Request a disconnect; confirmed later by `TransportEvent::Disconnected`.
    fn disconnect(&mut self, session: SessionId) -> Result<(), SessionError>;

    /// Release the session object. No further events are expected for it.
    fn close(&mut self, session: SessionId);
}

impl<T: Transport + ?Sized> Transport for Box<T> {
    fn is_available(&self) -> bool {
        (**self).is_available()
    }

    fn open(
        &mut self,
        session: SessionId,
        address: &PeripheralAddress,
    ) -> Result<(), SessionError> {
        (**self).open(session, address)
    }

    fn resume(&mut self, session: SessionId) -> Result<(), SessionError> {
        (**self).resume(session)
    }

    fn discover_services(&mut self, session: SessionId) -> Result<(), SessionError> {
        (**self).discover_services(session)
    }

    fn set_notify(
        &mut self,
        handle: &CharacteristicHandle,
        enabled: bool,
    ) -> Result<(), SessionError> {
        (**self).set_notify(handle, enabled)
    }

    fn read(
        &mut self,
        handle: &CharacteristicHandle,
        request: ReadRequestId,
    ) -> Result<(), SessionError> {
        (**self).read(handle, request)
    }

    fn disconnect(&mut self, session: SessionId) -> Result<(), SessionError> {
        (**self).disconnect(session)
    }

    fn close(&mut self, session: SessionId) {
        (**self).close(session)
    }
}
