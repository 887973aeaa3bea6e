//! In-process DSC server simulator
//!
//! A [`Transport`] backed by a scripted peripheral. Every request is
//! recorded so tests can assert on what the session core asked for. In
//! auto-respond mode the simulator answers requests the way a real stack
//! would (connect, discovery, reads) by pushing [`TransportEvent`]s;
//! otherwise tests deliver the events themselves.

use crate::domain::error::SessionError;
use crate::domain::models::CharacteristicRole;
use crate::infrastructure::bluetooth::protocol::GattIdentifiers;
use crate::infrastructure::bluetooth::transport::{
    CharacteristicHandle, DiscoveredCharacteristic, DiscoveredService, PeripheralAddress,
    ReadRequestId, SessionId, Transport, TransportEvent, TransportEventSender,
};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::trace;
use uuid::Uuid;

/// A request the session core made of the transport
#[derive(Debug, Clone, PartialEq)]
pub enum TransportCall {
    Open { session: SessionId, address: String },
    Resume { session: SessionId },
    DiscoverServices { session: SessionId },
    SetNotify { uuid: Uuid, enabled: bool },
    Read { uuid: Uuid, request: ReadRequestId },
    Disconnect { session: SessionId },
    Close { session: SessionId },
}

/// What the simulated DSC server exposes
#[derive(Debug, Clone, Default)]
pub struct SimulatedPeripheral {
    pub services: Vec<DiscoveredService>,
    pub values: HashMap<Uuid, Vec<u8>>,
}

impl SimulatedPeripheral {
    /// A DSC server exposing every known characteristic.
    pub fn dsc(ids: &GattIdentifiers) -> Self {
        Self::with_roles(
            ids,
            &[
                CharacteristicRole::StreamingAzEl,
                CharacteristicRole::OneShotAzResolution,
                CharacteristicRole::OneShotElResolution,
                CharacteristicRole::OneShotAzimuth,
                CharacteristicRole::OneShotElevation,
            ],
        )
    }

    /// A DSC server exposing only `roles`, listed in the given order.
    pub fn with_roles(ids: &GattIdentifiers, roles: &[CharacteristicRole]) -> Self {
        let characteristics = roles
            .iter()
            .map(|role| DiscoveredCharacteristic {
                uuid: ids.uuid_of(*role),
                readable: true,
                notifiable: role.is_streaming(),
            })
            .collect();

        let values = roles
            .iter()
            .map(|role| {
                let value: &[u8] = match role {
                    CharacteristicRole::StreamingAzEl => b"000.0000.00",
                    CharacteristicRole::OneShotAzResolution => b"4096",
                    CharacteristicRole::OneShotElResolution => b"8192",
                    CharacteristicRole::OneShotAzimuth => b"123.45",
                    CharacteristicRole::OneShotElevation => b"-12.3",
                };
                (ids.uuid_of(*role), value.to_vec())
            })
            .collect();

        Self {
            services: vec![DiscoveredService {
                uuid: ids.service,
                characteristics,
            }],
            values,
        }
    }
}

/// Encode az/el the way the DSC server does. Azimuth must stay below 1000.
pub fn encode_azel(azimuth: f32, elevation: f32) -> Vec<u8> {
    format!("{:06.2}{:.2}", azimuth, elevation).into_bytes()
}

#[derive(Debug)]
struct SimState {
    available: bool,
    auto_respond: bool,
    reject_reads: bool,
    peripheral: SimulatedPeripheral,
    calls: Vec<TransportCall>,
    current: Option<SessionId>,
    notifying: Option<Uuid>,
}

fn lock(shared: &Mutex<SimState>) -> MutexGuard<'_, SimState> {
    shared.lock().unwrap_or_else(PoisonError::into_inner)
}

pub struct SimulatedTransport {
    shared: Arc<Mutex<SimState>>,
    events: TransportEventSender,
}

/// Test-side handle onto a [`SimulatedTransport`]
#[derive(Clone)]
pub struct SimulatedController {
    shared: Arc<Mutex<SimState>>,
    events: TransportEventSender,
}

impl SimulatedTransport {
    /// Create a transport in manual mode (no automatic responses).
    pub fn new(
        peripheral: SimulatedPeripheral,
        events: TransportEventSender,
    ) -> (Self, SimulatedController) {
        let shared = Arc::new(Mutex::new(SimState {
            available: true,
            auto_respond: false,
            reject_reads: false,
            peripheral,
            calls: Vec::new(),
            current: None,
            notifying: None,
        }));

        let controller = SimulatedController {
            shared: Arc::clone(&shared),
            events: events.clone(),
        };
        (Self { shared, events }, controller)
    }

    fn report(&self, event: TransportEvent) {
        trace!("Simulated transport reports {:?}", event);
        let _ = self.events.send(event);
    }

    fn record(&self, call: TransportCall) -> MutexGuard<'_, SimState> {
        let mut state = lock(&self.shared);
        state.calls.push(call);
        state
    }
}

impl Transport for SimulatedTransport {
    fn is_available(&self) -> bool {
        lock(&self.shared).available
    }

    fn open(
        &mut self,
        session: SessionId,
        address: &PeripheralAddress,
    ) -> Result<(), SessionError> {
        let mut state = self.record(TransportCall::Open {
            session,
            address: address.to_string(),
        });
        if !state.available {
            return Err(SessionError::TransportUnavailable);
        }
        state.current = Some(session);
        let auto = state.auto_respond;
        drop(state);

        if auto {
            self.report(TransportEvent::Connected { session });
        }
        Ok(())
    }

    fn resume(&mut self, session: SessionId) -> Result<(), SessionError> {
        let mut state = self.record(TransportCall::Resume { session });
        if !state.available {
            return Err(SessionError::TransportUnavailable);
        }
        state.current = Some(session);
        let auto = state.auto_respond;
        drop(state);

        if auto {
            self.report(TransportEvent::Connected { session });
        }
        Ok(())
    }

    fn discover_services(&mut self, session: SessionId) -> Result<(), SessionError> {
        let state = self.record(TransportCall::DiscoverServices { session });
        let services = state.auto_respond.then(|| state.peripheral.services.clone());
        drop(state);

        if let Some(services) = services {
            self.report(TransportEvent::ServicesDiscovered {
                session,
                result: Ok(services),
            });
        }
        Ok(())
    }

    fn set_notify(
        &mut self,
        handle: &CharacteristicHandle,
        enabled: bool,
    ) -> Result<(), SessionError> {
        let mut state = self.record(TransportCall::SetNotify {
            uuid: handle.uuid,
            enabled,
        });
        if !state.available {
            return Err(SessionError::TransportUnavailable);
        }
        state.notifying = enabled.then_some(handle.uuid);
        Ok(())
    }

    fn read(
        &mut self,
        handle: &CharacteristicHandle,
        request: ReadRequestId,
    ) -> Result<(), SessionError> {
        let state = self.record(TransportCall::Read {
            uuid: handle.uuid,
            request,
        });
        if state.reject_reads {
            return Err(SessionError::Transport("read request rejected".to_string()));
        }
        let result = state.auto_respond.then(|| {
            state
                .peripheral
                .values
                .get(&handle.uuid)
                .cloned()
                .ok_or_else(|| "attribute not found".to_string())
        });
        drop(state);

        if let Some(result) = result {
            self.report(TransportEvent::ReadCompleted {
                session: handle.session,
                request,
                uuid: handle.uuid,
                result,
            });
        }
        Ok(())
    }

    fn disconnect(&mut self, session: SessionId) -> Result<(), SessionError> {
        let mut state = self.record(TransportCall::Disconnect { session });
        state.notifying = None;
        let auto = state.auto_respond;
        drop(state);

        if auto {
            self.report(TransportEvent::Disconnected { session });
        }
        Ok(())
    }

    fn close(&mut self, session: SessionId) {
        let mut state = self.record(TransportCall::Close { session });
        if state.current == Some(session) {
            state.current = None;
            state.notifying = None;
        }
    }
}

impl SimulatedController {
    pub fn set_available(&self, available: bool) {
        lock(&self.shared).available = available;
    }

    /// Answer connect/discover/read/disconnect requests automatically.
    pub fn set_auto_respond(&self, auto_respond: bool) {
        lock(&self.shared).auto_respond = auto_respond;
    }

    /// Make every read request fail synchronously.
    pub fn set_reject_reads(&self, reject: bool) {
        lock(&self.shared).reject_reads = reject;
    }

    pub fn calls(&self) -> Vec<TransportCall> {
        lock(&self.shared).calls.clone()
    }

    /// Read requests issued so far, oldest first
    pub fn reads(&self) -> Vec<(Uuid, ReadRequestId)> {
        lock(&self.shared)
            .calls
            .iter()
            .filter_map(|call| match call {
                TransportCall::Read { uuid, request } => Some((*uuid, *request)),
                _ => None,
            })
            .collect()
    }

    pub fn current_session(&self) -> Option<SessionId> {
        lock(&self.shared).current
    }

    pub fn is_notifying(&self) -> bool {
        lock(&self.shared).notifying.is_some()
    }

    /// Push a notification on the subscribed characteristic.
    /// Returns false when nothing is subscribed.
    pub fn notify(&self, value: Vec<u8>) -> bool {
        let state = lock(&self.shared);
        let (Some(session), Some(uuid)) = (state.current, state.notifying) else {
            return false;
        };
        drop(state);

        self.report(TransportEvent::Notification {
            session,
            uuid,
            value,
        })
    }

    /// Deliver an arbitrary event, as if the stack had raised it.
    pub fn report(&self, event: TransportEvent) -> bool {
        self.events.send(event).is_ok()
    }
}
