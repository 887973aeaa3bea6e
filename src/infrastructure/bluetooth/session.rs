//! Connection State Machine
//!
//! Owns the single peripheral session. Commands come from the caller,
//! facts come from the transport as [`TransportEvent`]s, and only this
//! type decides what the [`ConnectionState`] becomes.
//!
//! ```text
//!                connect                 transport connected
//! Disconnected ──────────▶ Connecting ─────────────────────▶ Connected
//!      ▲                       │                                 │
//!      └───────────────────────┴─────────────────────────────────┘
//!          transport disconnected (also a failed attempt) / close
//! ```
//!
//! Everything derived from one connected lifetime (handles, read queue,
//! subscription) lives in an `ActiveSession` that is dropped as soon as
//! the connection ends, and is tagged with a [`Generation`] so callbacks
//! that arrive late can be recognised and discarded.

use crate::domain::error::SessionError;
use crate::domain::models::{CharacteristicRole, ConnectionState, DscEvent, EventSink};
use crate::infrastructure::bluetooth::protocol::{self, GattIdentifiers};
use crate::infrastructure::bluetooth::read_queue::ReadQueue;
use crate::infrastructure::bluetooth::registry::CharacteristicRegistry;
use crate::infrastructure::bluetooth::transport::{
    CharacteristicHandle, DiscoveredService, Generation, PeripheralAddress, ReadRequestId,
    SessionId, Transport, TransportEvent,
};
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

#[derive(Debug)]
struct Link {
    id: SessionId,
    address: PeripheralAddress,
    /// A disconnect was requested and the transport has not confirmed it yet
    disconnecting: bool,
    /// Reconnect as soon as the pending disconnect is confirmed
    resume_requested: bool,
}

impl Link {
    fn new(id: SessionId, address: PeripheralAddress) -> Self {
        Self {
            id,
            address,
            disconnecting: false,
            resume_requested: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Discovery {
    Pending,
    Resolved,
    Failed,
}

/// Session-scoped objects for one connected lifetime
#[derive(Debug)]
struct ActiveSession {
    generation: Generation,
    discovery: Discovery,
    subscribed: Option<CharacteristicHandle>,
    queue: ReadQueue,
}

impl ActiveSession {
    fn new(generation: Generation) -> Self {
        Self {
            generation,
            discovery: Discovery::Pending,
            subscribed: None,
            queue: ReadQueue::new(generation),
        }
    }
}

/// Log a degraded feature and surface it to the event sink.
fn report<S: EventSink>(sink: &S, error: SessionError) {
    warn!("{}", error);
    sink.emit(DscEvent::Fault(error));
}

pub struct SessionManager<T: Transport, S: EventSink> {
    transport: T,
    sink: S,
    identifiers: GattIdentifiers,
    raw_data_logging: bool,
    state: ConnectionState,
    link: Option<Link>,
    active: Option<ActiveSession>,
    next_session: u64,
    next_generation: u64,
}

impl<T: Transport, S: EventSink> SessionManager<T, S> {
    pub fn new(transport: T, sink: S, identifiers: GattIdentifiers) -> Self {
        Self {
            transport,
            sink,
            identifiers,
            raw_data_logging: false,
            state: ConnectionState::Disconnected,
            link: None,
            active: None,
            next_session: 1,
            next_generation: 1,
        }
    }

    /// Trace every raw payload before it is decoded
    pub fn with_raw_data_logging(mut self, enabled: bool) -> Self {
        self.raw_data_logging = enabled;
        self
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn address(&self) -> Option<&PeripheralAddress> {
        self.link.as_ref().map(|link| &link.address)
    }

    pub fn session_id(&self) -> Option<SessionId> {
        self.link.as_ref().map(|link| link.id)
    }

    pub fn generation(&self) -> Option<Generation> {
        self.active.as_ref().map(|active| active.generation)
    }

    pub fn is_subscribed(&self) -> bool {
        self.active
            .as_ref()
            .is_some_and(|active| active.subscribed.is_some())
    }

    /// One-shot reads waiting behind the in-flight one
    pub fn pending_reads(&self) -> Vec<CharacteristicRole> {
        self.active
            .as_ref()
            .map(|active| active.queue.pending().map(|h| h.role).collect())
            .unwrap_or_default()
    }

    pub fn read_in_flight(&self) -> Option<CharacteristicRole> {
        self.active
            .as_ref()
            .and_then(|active| active.queue.in_flight())
            .map(|read| read.handle.role)
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// Start connecting to `address`. The outcome is reported later as a
    /// `Connected` or `Disconnected` event, never from this call.
    pub fn connect(&mut self, address: &str) -> Result<(), SessionError> {
        if !self.transport.is_available() {
            warn!("Bluetooth transport not available");
            return Err(SessionError::TransportUnavailable);
        }
        let address = PeripheralAddress::parse(address)?;

        if let Some(link) = self.link.as_mut().filter(|link| link.address == address) {
            if link.disconnecting {
                info!(
                    "Disconnect of {:?} still pending, reconnecting once it completes",
                    link.id
                );
                link.resume_requested = true;
                return Ok(());
            }
            match self.state {
                ConnectionState::Connecting | ConnectionState::Connected => {
                    debug!("Session to {} already {:?}", address, self.state);
                    return Ok(());
                }
                ConnectionState::Disconnected => {
                    let id = link.id;
                    info!("Trying to use the existing session {:?} for {}", id, address);
                    self.transport.resume(id)?;
                    self.state = ConnectionState::Connecting;
                    return Ok(());
                }
            }
        }

        self.teardown();

        let id = SessionId(self.next_session);
        self.next_session += 1;
        self.transport.open(id, &address)?;
        info!("Created a new session {:?} to {}", id, address);

        self.link = Some(Link::new(id, address));
        self.state = ConnectionState::Connecting;
        Ok(())
    }

    /// Request a disconnect (or cancel a pending connect). The state only
    /// moves to Disconnected once the transport confirms it.
    pub fn disconnect(&mut self) -> Result<(), SessionError> {
        if !self.transport.is_available() {
            warn!("Bluetooth transport not available");
            return Err(SessionError::TransportUnavailable);
        }
        let Some(id) = self.session_id() else {
            warn!("Disconnect requested without an open session");
            return Err(SessionError::NotConnected);
        };

        info!("Disconnecting session {:?}", id);
        self.unsubscribe();
        if let Some(mut active) = self.active.take() {
            if !active.queue.is_empty() {
                debug!("Dropping {} queued reads", active.queue.len());
                active.queue.clear();
            }
            if let Some(read) = active.queue.in_flight() {
                debug!("Result of the {:?} read will be discarded", read.handle.role);
            }
        }
        if let Some(link) = self.link.as_mut() {
            link.disconnecting = self.state != ConnectionState::Disconnected;
            link.resume_requested = false;
        }
        self.transport.disconnect(id)
    }

    /// Release the session object. Safe to call any number of times.
    pub fn close(&mut self) {
        if self.link.is_none() {
            return;
        }
        info!("Closing session");
        self.teardown();
    }

    fn teardown(&mut self) {
        let Some(link) = self.link.take() else {
            return;
        };
        self.unsubscribe();
        self.active = None;
        self.transport.close(link.id);
        self.enter_disconnected();
    }

    fn unsubscribe(&mut self) {
        let Some(handle) = self
            .active
            .as_mut()
            .and_then(|active| active.subscribed.take())
        else {
            return;
        };
        if let Err(e) = self.transport.set_notify(&handle, false) {
            warn!("Failed to unsubscribe from {}: {}", handle.uuid, e);
        }
    }

    fn enter_disconnected(&mut self) {
        if self.state != ConnectionState::Disconnected {
            self.state = ConnectionState::Disconnected;
            self.sink.emit(DscEvent::Disconnected);
        }
    }

    /// Apply one transport report. Reports for any session other than the
    /// live one are dropped.
    pub fn handle_event(&mut self, event: TransportEvent) {
        if self.session_id() != Some(event.session()) {
            debug!("Discarding event for stale session: {:?}", event);
            return;
        }

        match event {
            TransportEvent::Connected { session } => self.on_connected(session),
            TransportEvent::Disconnected { .. } => self.on_disconnected(),
            TransportEvent::ServicesDiscovered { session, result } => {
                self.on_services_discovered(session, result)
            }
            TransportEvent::ReadCompleted {
                request,
                uuid,
                result,
                ..
            } => self.on_read_completed(request, uuid, result),
            TransportEvent::Notification { uuid, value, .. } => self.on_notification(uuid, value),
        }
    }

    fn on_connected(&mut self, session: SessionId) {
        if self.link.as_ref().is_some_and(|link| link.disconnecting) {
            debug!("Ignoring connect report for {:?}, disconnect pending", session);
            if let Err(e) = self.transport.disconnect(session) {
                warn!("Failed to repeat disconnect request: {}", e);
            }
            return;
        }
        if self.state != ConnectionState::Connecting {
            debug!("Ignoring connect report while {:?}", self.state);
            return;
        }

        let generation = Generation(self.next_generation);
        self.next_generation += 1;
        self.state = ConnectionState::Connected;
        self.active = Some(ActiveSession::new(generation));
        info!("Connected to DSC server ({:?})", generation);
        self.sink.emit(DscEvent::Connected);

        match self.transport.discover_services(session) {
            Ok(()) => info!("Started service discovery"),
            Err(e) => {
                if let Some(active) = self.active.as_mut() {
                    active.discovery = Discovery::Failed;
                }
                report(&self.sink, SessionError::DiscoveryFailed(e.to_string()));
            }
        }
    }

    fn on_disconnected(&mut self) {
        let resume = match self.link.as_mut() {
            Some(link) => {
                link.disconnecting = false;
                std::mem::take(&mut link.resume_requested)
            }
            None => false,
        };

        if self.state == ConnectionState::Disconnected {
            debug!("Already disconnected");
        } else {
            info!("Disconnected from DSC server");
            self.active = None;
            self.enter_disconnected();
        }

        if let (true, Some(id)) = (resume, self.session_id()) {
            info!("Resuming session {:?}", id);
            match self.transport.resume(id) {
                Ok(()) => self.state = ConnectionState::Connecting,
                Err(e) => report(&self.sink, e),
            }
        }
    }

    fn on_services_discovered(
        &mut self,
        session: SessionId,
        result: Result<Vec<DiscoveredService>, String>,
    ) {
        let Some(active) = self
            .active
            .as_mut()
            .filter(|active| active.discovery == Discovery::Pending)
        else {
            debug!("Discarding unexpected discovery result");
            return;
        };
        let generation = active.generation;

        let registry = result
            .map_err(SessionError::DiscoveryFailed)
            .and_then(|services| {
                CharacteristicRegistry::resolve(&services, &self.identifiers, session, generation)
            });
        let registry = match registry {
            Ok(registry) => registry,
            Err(e) => {
                active.discovery = Discovery::Failed;
                report(&self.sink, e);
                return;
            }
        };
        active.discovery = Discovery::Resolved;

        for role in registry.missing() {
            info!(
                "{}",
                SessionError::CharacteristicNotFound(*role, self.identifiers.uuid_of(*role))
            );
        }

        if let Some(handle) = registry.streaming().copied() {
            match self.transport.set_notify(&handle, true) {
                Ok(()) => {
                    info!("Subscribed to {}", protocol::lookup(&handle.uuid, "az+el"));
                    active.subscribed = Some(handle);
                }
                Err(e) => report(&self.sink, SessionError::SubscribeFailed(e.to_string())),
            }
        }

        for handle in registry.one_shot() {
            active.queue.enqueue(*handle);
        }

        self.pump_next();
    }

    /// Issue the next queued read if none is outstanding. The only place
    /// reads are issued from.
    pub fn pump_next(&mut self) {
        let Some(active) = self.active.as_mut() else {
            return;
        };

        while let Some(read) = active.queue.next_read() {
            match self.transport.read(&read.handle, read.request) {
                Ok(()) => {
                    debug!(
                        "Reading {}",
                        protocol::lookup(&read.handle.uuid, "characteristic")
                    );
                    return;
                }
                Err(e) => {
                    active.queue.complete(read.request);
                    report(
                        &self.sink,
                        SessionError::ReadFailed {
                            uuid: read.handle.uuid,
                            reason: e.to_string(),
                        },
                    );
                }
            }
        }
    }

    fn on_read_completed(
        &mut self,
        request: ReadRequestId,
        uuid: Uuid,
        result: Result<Vec<u8>, String>,
    ) {
        let Some(handle) = self
            .active
            .as_mut()
            .and_then(|active| active.queue.complete(request))
        else {
            debug!("Discarding stale read completion for {}", uuid);
            return;
        };

        match result {
            Ok(value) => self.publish(&handle, &value),
            Err(reason) => report(
                &self.sink,
                SessionError::ReadFailed {
                    uuid: handle.uuid,
                    reason,
                },
            ),
        }

        self.pump_next();
    }

    fn on_notification(&mut self, uuid: Uuid, value: Vec<u8>) {
        let subscribed = self.active.as_ref().and_then(|active| {
            active
                .subscribed
                .filter(|handle| handle.generation == active.generation)
        });
        match subscribed {
            Some(handle) if handle.uuid == uuid => self.publish(&handle, &value),
            _ => debug!("Discarding notification from {}", uuid),
        }
    }

    fn publish(&self, handle: &CharacteristicHandle, value: &[u8]) {
        if self.raw_data_logging {
            trace!("{:?} raw payload: {:02X?}", handle.role, value);
        }

        match protocol::decode(handle.role, value) {
            Ok(sample) => match DscEvent::from_sample(handle.role, sample) {
                Some(event) => self.sink.emit(event),
                None => debug!("No event for {:?} sample {:?}", handle.role, sample),
            },
            Err(e) => report(&self.sink, SessionError::MalformedSample(e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::error::DecodeError;
    use crate::infrastructure::bluetooth::simulated::{
        SimulatedController, SimulatedPeripheral, SimulatedTransport, TransportCall,
    };
    use crate::infrastructure::bluetooth::transport::{transport_channel, DiscoveredCharacteristic};
    use tokio::sync::mpsc;

    type Manager = SessionManager<SimulatedTransport, mpsc::UnboundedSender<DscEvent>>;

    struct Harness {
        manager: Manager,
        sim: SimulatedController,
        events: mpsc::UnboundedReceiver<DscEvent>,
        ids: GattIdentifiers,
    }

    impl Harness {
        fn new() -> Self {
            let ids = GattIdentifiers::default();
            let (transport_tx, _transport_rx) = transport_channel();
            let (transport, sim) =
                SimulatedTransport::new(SimulatedPeripheral::dsc(&ids), transport_tx);
            let (event_tx, events) = mpsc::unbounded_channel();
            Self {
                manager: SessionManager::new(transport, event_tx, ids),
                sim,
                events,
                ids,
            }
        }

        fn session(&self) -> SessionId {
            self.manager.session_id().unwrap_or(SessionId(0))
        }

        fn drain(&mut self) -> Vec<DscEvent> {
            let mut out = Vec::new();
            while let Ok(event) = self.events.try_recv() {
                out.push(event);
            }
            out
        }

        fn service(&self, roles: &[CharacteristicRole]) -> Vec<DiscoveredService> {
            SimulatedPeripheral::with_roles(&self.ids, roles).services
        }

        fn connected(&mut self, address: &str) {
            self.manager.connect(address).unwrap();
            let session = self.session();
            self.manager
                .handle_event(TransportEvent::Connected { session });
        }

        fn discovered(&mut self, roles: &[CharacteristicRole]) {
            let session = self.session();
            let services = self.service(roles);
            self.manager.handle_event(TransportEvent::ServicesDiscovered {
                session,
                result: Ok(services),
            });
        }

        fn complete_last_read(&mut self, value: Result<&[u8], &str>) {
            let (uuid, request) = *self.sim.reads().last().unwrap();
            let session = self.session();
            self.manager.handle_event(TransportEvent::ReadCompleted {
                session,
                request,
                uuid,
                result: value.map(<[u8]>::to_vec).map_err(str::to_string),
            });
        }
    }

    #[test]
    fn test_streaming_only_discovery_queues_nothing() {
        let mut h = Harness::new();
        h.manager.connect("AA:BB").unwrap();
        assert_eq!(h.manager.state(), ConnectionState::Connecting);

        let session = h.session();
        h.manager
            .handle_event(TransportEvent::Connected { session });
        assert_eq!(h.manager.state(), ConnectionState::Connected);
        assert!(h
            .sim
            .calls()
            .contains(&TransportCall::DiscoverServices { session }));

        h.discovered(&[CharacteristicRole::StreamingAzEl]);
        assert_eq!(h.manager.state(), ConnectionState::Connected);
        assert!(h.manager.is_subscribed());
        assert!(h.sim.is_notifying());
        assert!(h.manager.pending_reads().is_empty());
        assert_eq!(h.manager.read_in_flight(), None);

        h.manager.pump_next();
        assert!(h.sim.reads().is_empty());
        assert_eq!(h.drain(), vec![DscEvent::Connected]);
    }

    #[test]
    fn test_resolution_reads_complete_in_discovery_order() {
        let mut h = Harness::new();
        h.connected("AA:BB");
        h.discovered(&[
            CharacteristicRole::OneShotAzResolution,
            CharacteristicRole::OneShotElResolution,
        ]);

        // Head popped and issued, the other still queued
        assert_eq!(
            h.manager.read_in_flight(),
            Some(CharacteristicRole::OneShotAzResolution)
        );
        assert_eq!(
            h.manager.pending_reads(),
            vec![CharacteristicRole::OneShotElResolution]
        );
        assert_eq!(h.sim.reads().len(), 1);

        h.complete_last_read(Ok(b"4096"));
        assert_eq!(
            h.manager.read_in_flight(),
            Some(CharacteristicRole::OneShotElResolution)
        );
        h.complete_last_read(Ok(b"8192"));

        assert!(h.manager.pending_reads().is_empty());
        assert_eq!(h.manager.read_in_flight(), None);
        let reads: Vec<_> = h.sim.reads().into_iter().map(|(uuid, _)| uuid).collect();
        assert_eq!(reads, vec![h.ids.az_resolution, h.ids.el_resolution]);
        assert_eq!(
            h.drain(),
            vec![
                DscEvent::Connected,
                DscEvent::AzResolutionAvailable(4096.0),
                DscEvent::ElResolutionAvailable(8192.0),
            ]
        );
    }

    #[test]
    fn test_disconnect_discards_in_flight_read() {
        let mut h = Harness::new();
        h.connected("AA:BB");
        h.discovered(&[
            CharacteristicRole::StreamingAzEl,
            CharacteristicRole::OneShotAzResolution,
            CharacteristicRole::OneShotElResolution,
        ]);
        assert!(h.manager.read_in_flight().is_some());
        let (uuid, request) = h.sim.reads()[0];
        let session = h.session();

        h.manager.disconnect().unwrap();
        assert!(h.manager.pending_reads().is_empty());
        assert_eq!(h.manager.read_in_flight(), None);
        // Still connected until the transport confirms
        assert_eq!(h.manager.state(), ConnectionState::Connected);

        // Unsubscribe happens before the disconnect request
        let calls = h.sim.calls();
        let unsubscribe = calls
            .iter()
            .position(|c| {
                *c == TransportCall::SetNotify {
                    uuid: h.ids.azel,
                    enabled: false,
                }
            })
            .unwrap();
        let disconnect = calls
            .iter()
            .position(|c| *c == TransportCall::Disconnect { session })
            .unwrap();
        assert!(unsubscribe < disconnect);

        // Late completion is discarded
        h.manager.handle_event(TransportEvent::ReadCompleted {
            session,
            request,
            uuid,
            result: Ok(b"4096".to_vec()),
        });
        assert_eq!(h.sim.reads().len(), 1);

        h.manager
            .handle_event(TransportEvent::Disconnected { session });
        assert_eq!(h.manager.state(), ConnectionState::Disconnected);

        // And again after the confirmation
        h.manager.handle_event(TransportEvent::ReadCompleted {
            session,
            request,
            uuid,
            result: Ok(b"4096".to_vec()),
        });
        assert_eq!(
            h.drain(),
            vec![DscEvent::Connected, DscEvent::Disconnected]
        );
    }

    #[test]
    fn test_connect_fails_fast_without_transport() {
        let mut h = Harness::new();
        h.sim.set_available(false);
        assert_eq!(
            h.manager.connect("AA:BB"),
            Err(SessionError::TransportUnavailable)
        );
        assert_eq!(h.manager.state(), ConnectionState::Disconnected);
        assert!(h.sim.calls().is_empty());
    }

    #[test]
    fn test_connect_rejects_empty_address() {
        let mut h = Harness::new();
        assert_eq!(h.manager.connect(""), Err(SessionError::InvalidAddress));
        assert_eq!(h.manager.state(), ConnectionState::Disconnected);
        assert!(h.sim.calls().is_empty());
    }

    #[test]
    fn test_connect_while_connecting_is_idempotent() {
        let mut h = Harness::new();
        h.manager.connect("AA:BB").unwrap();
        h.manager.connect("AA:BB").unwrap();
        let opens = h
            .sim
            .calls()
            .iter()
            .filter(|c| matches!(c, TransportCall::Open { .. }))
            .count();
        assert_eq!(opens, 1);
        assert_eq!(h.manager.state(), ConnectionState::Connecting);
    }

    #[test]
    fn test_reconnect_reuses_session_and_rediscovers() {
        let mut h = Harness::new();
        h.connected("AA:BB");
        h.discovered(&[
            CharacteristicRole::OneShotAzResolution,
            CharacteristicRole::OneShotElResolution,
        ]);
        let session = h.session();
        let first_generation = h.manager.generation().unwrap();
        let (old_uuid, old_request) = h.sim.reads()[0];

        h.manager
            .handle_event(TransportEvent::Disconnected { session });
        assert_eq!(h.manager.state(), ConnectionState::Disconnected);

        h.manager.connect("AA:BB").unwrap();
        assert_eq!(h.session(), session);
        assert!(h.sim.calls().contains(&TransportCall::Resume { session }));

        h.manager
            .handle_event(TransportEvent::Connected { session });
        assert!(h.manager.generation().unwrap() > first_generation);
        let discoveries = h
            .sim
            .calls()
            .iter()
            .filter(|c| matches!(c, TransportCall::DiscoverServices { .. }))
            .count();
        assert_eq!(discoveries, 2);

        h.discovered(&[CharacteristicRole::OneShotAzResolution]);
        // A read from the previous connection must not settle the new one
        h.manager.handle_event(TransportEvent::ReadCompleted {
            session,
            request: old_request,
            uuid: old_uuid,
            result: Ok(b"1".to_vec()),
        });
        assert_eq!(
            h.manager.read_in_flight(),
            Some(CharacteristicRole::OneShotAzResolution)
        );

        h.complete_last_read(Ok(b"2048"));
        let events = h.drain();
        assert_eq!(
            events.last(),
            Some(&DscEvent::AzResolutionAvailable(2048.0))
        );
        assert!(!events.contains(&DscEvent::AzResolutionAvailable(1.0)));
    }

    #[test]
    fn test_connect_to_other_address_tears_down_old_session() {
        let mut h = Harness::new();
        h.connected("AA:BB");
        h.discovered(&[CharacteristicRole::StreamingAzEl]);
        let old = h.session();

        h.manager.connect("CC:DD").unwrap();
        let new = h.session();
        assert_ne!(old, new);
        assert_eq!(h.manager.state(), ConnectionState::Connecting);
        assert_eq!(h.manager.address().unwrap().as_str(), "CC:DD");

        let calls = h.sim.calls();
        let close = calls
            .iter()
            .position(|c| *c == TransportCall::Close { session: old })
            .unwrap();
        let open = calls
            .iter()
            .position(|c| matches!(c, TransportCall::Open { session, .. } if *session == new))
            .unwrap();
        assert!(close < open);

        // Old session's reports no longer count
        h.manager
            .handle_event(TransportEvent::Disconnected { session: old });
        h.manager.handle_event(TransportEvent::Notification {
            session: old,
            uuid: h.ids.azel,
            value: b"123.45-12.3".to_vec(),
        });
        assert_eq!(h.manager.state(), ConnectionState::Connecting);
        assert_eq!(
            h.drain(),
            vec![DscEvent::Connected, DscEvent::Disconnected]
        );
    }

    #[test]
    fn test_disconnect_without_session() {
        let mut h = Harness::new();
        assert_eq!(h.manager.disconnect(), Err(SessionError::NotConnected));
        assert!(h.sim.calls().is_empty());
    }

    #[test]
    fn test_disconnect_while_connecting_cancels() {
        let mut h = Harness::new();
        h.manager.connect("AA:BB").unwrap();
        let session = h.session();

        h.manager.disconnect().unwrap();
        assert!(h.sim.calls().contains(&TransportCall::Disconnect { session }));
        assert_eq!(h.manager.state(), ConnectionState::Connecting);

        h.manager
            .handle_event(TransportEvent::Disconnected { session });
        assert_eq!(h.manager.state(), ConnectionState::Disconnected);
        assert_eq!(h.drain(), vec![DscEvent::Disconnected]);
    }

    #[test]
    fn test_connected_report_after_cancel_is_ignored() {
        let mut h = Harness::new();
        h.manager.connect("AA:BB").unwrap();
        let session = h.session();
        h.manager.disconnect().unwrap();

        // The stack finished connecting before it saw the cancel
        h.manager
            .handle_event(TransportEvent::Connected { session });
        assert_eq!(h.manager.state(), ConnectionState::Connecting);
        h.discovered(&[
            CharacteristicRole::StreamingAzEl,
            CharacteristicRole::OneShotAzResolution,
        ]);

        let calls = h.sim.calls();
        assert!(!calls
            .iter()
            .any(|c| matches!(c, TransportCall::DiscoverServices { .. })));
        let disconnects = calls
            .iter()
            .filter(|c| **c == TransportCall::Disconnect { session })
            .count();
        assert_eq!(disconnects, 2);
        assert!(!h.manager.is_subscribed());
        assert!(h.sim.reads().is_empty());
        assert!(h.drain().is_empty());

        h.manager
            .handle_event(TransportEvent::Disconnected { session });
        assert_eq!(h.manager.state(), ConnectionState::Disconnected);
        assert_eq!(h.drain(), vec![DscEvent::Disconnected]);
    }

    #[test]
    fn test_connect_during_pending_disconnect_resumes_afterwards() {
        let mut h = Harness::new();
        h.connected("AA:BB");
        let session = h.session();
        h.manager.disconnect().unwrap();

        h.manager.connect("AA:BB").unwrap();
        assert!(!h.sim.calls().contains(&TransportCall::Resume { session }));
        assert_eq!(h.manager.state(), ConnectionState::Connected);

        h.manager
            .handle_event(TransportEvent::Disconnected { session });
        assert!(h.sim.calls().contains(&TransportCall::Resume { session }));
        assert_eq!(h.manager.state(), ConnectionState::Connecting);
        assert_eq!(h.session(), session);

        h.manager
            .handle_event(TransportEvent::Connected { session });
        assert_eq!(h.manager.state(), ConnectionState::Connected);
        assert_eq!(
            h.drain(),
            vec![
                DscEvent::Connected,
                DscEvent::Disconnected,
                DscEvent::Connected
            ]
        );
    }

    #[test]
    fn test_second_disconnect_drops_deferred_reconnect() {
        let mut h = Harness::new();
        h.connected("AA:BB");
        let session = h.session();
        h.manager.disconnect().unwrap();
        h.manager.connect("AA:BB").unwrap();
        h.manager.disconnect().unwrap();

        h.manager
            .handle_event(TransportEvent::Disconnected { session });
        assert!(!h.sim.calls().contains(&TransportCall::Resume { session }));
        assert_eq!(h.manager.state(), ConnectionState::Disconnected);
    }

    #[test]
    fn test_stale_generation_notification_ignored() {
        let mut h = Harness::new();
        h.connected("AA:BB");
        h.discovered(&[CharacteristicRole::StreamingAzEl]);
        let session = h.session();

        // Force the subscription to look like it belongs to an older connection
        if let Some(active) = h.manager.active.as_mut() {
            active.generation = Generation(active.generation.0 + 1);
        }
        h.manager.handle_event(TransportEvent::Notification {
            session,
            uuid: h.ids.azel,
            value: b"123.45-12.3".to_vec(),
        });
        assert_eq!(h.drain(), vec![DscEvent::Connected]);
    }

    #[test]
    fn test_failed_connect_attempt_reports_disconnected() {
        let mut h = Harness::new();
        h.manager.connect("AA:BB").unwrap();
        let session = h.session();
        h.manager
            .handle_event(TransportEvent::Disconnected { session });
        assert_eq!(h.manager.state(), ConnectionState::Disconnected);
        assert_eq!(h.drain(), vec![DscEvent::Disconnected]);
    }

    #[test]
    fn test_close_is_idempotent() {
        let mut h = Harness::new();
        h.connected("AA:BB");
        h.discovered(&[
            CharacteristicRole::StreamingAzEl,
            CharacteristicRole::OneShotAzResolution,
        ]);
        let session = h.session();

        h.manager.close();
        let state_once = (
            h.manager.state(),
            h.manager.session_id(),
            h.manager.pending_reads(),
            h.manager.read_in_flight(),
            h.manager.is_subscribed(),
        );
        h.manager.close();
        let state_twice = (
            h.manager.state(),
            h.manager.session_id(),
            h.manager.pending_reads(),
            h.manager.read_in_flight(),
            h.manager.is_subscribed(),
        );
        assert_eq!(state_once, state_twice);
        assert_eq!(state_once.0, ConnectionState::Disconnected);

        let closes = h
            .sim
            .calls()
            .iter()
            .filter(|c| matches!(c, TransportCall::Close { .. }))
            .count();
        assert_eq!(closes, 1);
        assert_eq!(
            h.drain(),
            vec![DscEvent::Connected, DscEvent::Disconnected]
        );

        // Nothing from the closed session is accepted
        h.manager
            .handle_event(TransportEvent::Connected { session });
        assert_eq!(h.manager.state(), ConnectionState::Disconnected);
    }

    #[test]
    fn test_close_when_never_opened() {
        let mut h = Harness::new();
        h.manager.close();
        h.manager.close();
        assert_eq!(h.manager.state(), ConnectionState::Disconnected);
        assert!(h.sim.calls().is_empty());
        assert!(h.drain().is_empty());
    }

    #[test]
    fn test_discovery_failure_keeps_connection() {
        let mut h = Harness::new();
        h.connected("AA:BB");
        let session = h.session();
        h.manager.handle_event(TransportEvent::ServicesDiscovered {
            session,
            result: Err("GATT_ERROR".to_string()),
        });

        assert_eq!(h.manager.state(), ConnectionState::Connected);
        assert!(h.sim.reads().is_empty());
        assert_eq!(
            h.drain(),
            vec![
                DscEvent::Connected,
                DscEvent::Fault(SessionError::DiscoveryFailed("GATT_ERROR".to_string())),
            ]
        );

        // No automatic rediscovery, and a late success is not applied
        h.discovered(&[CharacteristicRole::OneShotAzResolution]);
        assert!(h.sim.reads().is_empty());
        let discoveries = h
            .sim
            .calls()
            .iter()
            .filter(|c| matches!(c, TransportCall::DiscoverServices { .. }))
            .count();
        assert_eq!(discoveries, 1);
    }

    #[test]
    fn test_service_not_found_is_inert() {
        let mut h = Harness::new();
        h.connected("AA:BB");
        let session = h.session();
        h.manager.handle_event(TransportEvent::ServicesDiscovered {
            session,
            result: Ok(vec![DiscoveredService {
                uuid: Uuid::nil(),
                characteristics: vec![DiscoveredCharacteristic {
                    uuid: h.ids.azel,
                    readable: true,
                    notifiable: true,
                }],
            }]),
        });

        assert_eq!(h.manager.state(), ConnectionState::Connected);
        assert!(!h.manager.is_subscribed());
        assert_eq!(
            h.drain(),
            vec![
                DscEvent::Connected,
                DscEvent::Fault(SessionError::ServiceNotFound(h.ids.service)),
            ]
        );
    }

    #[test]
    fn test_read_failure_advances_queue() {
        let mut h = Harness::new();
        h.connected("AA:BB");
        h.discovered(&[
            CharacteristicRole::OneShotAzResolution,
            CharacteristicRole::OneShotElResolution,
        ]);

        h.complete_last_read(Err("GATT_READ_NOT_PERMITTED"));
        assert_eq!(
            h.manager.read_in_flight(),
            Some(CharacteristicRole::OneShotElResolution)
        );
        h.complete_last_read(Ok(b"8192"));

        assert_eq!(h.sim.reads().len(), 2);
        assert_eq!(
            h.drain(),
            vec![
                DscEvent::Connected,
                DscEvent::Fault(SessionError::ReadFailed {
                    uuid: h.ids.az_resolution,
                    reason: "GATT_READ_NOT_PERMITTED".to_string(),
                }),
                DscEvent::ElResolutionAvailable(8192.0),
            ]
        );
    }

    #[test]
    fn test_malformed_read_advances_queue() {
        let mut h = Harness::new();
        h.connected("AA:BB");
        h.discovered(&[
            CharacteristicRole::OneShotAzimuth,
            CharacteristicRole::OneShotElevation,
        ]);

        h.complete_last_read(Ok(b"n/a"));
        h.complete_last_read(Ok(b"-12.3"));
        assert_eq!(h.manager.read_in_flight(), None);
        assert_eq!(
            h.drain(),
            vec![
                DscEvent::Connected,
                DscEvent::Fault(SessionError::MalformedSample(
                    DecodeError::InvalidCharacter { ch: 'n', index: 0 }
                )),
                DscEvent::ElevationAvailable(-12.3),
            ]
        );
    }

    #[test]
    fn test_rejected_read_request_moves_on() {
        let mut h = Harness::new();
        h.sim.set_reject_reads(true);
        h.connected("AA:BB");
        h.discovered(&[
            CharacteristicRole::OneShotAzResolution,
            CharacteristicRole::OneShotElResolution,
        ]);

        // Both attempted, neither left in flight
        assert_eq!(h.sim.reads().len(), 2);
        assert_eq!(h.manager.read_in_flight(), None);
        let faults = h
            .drain()
            .into_iter()
            .filter(|e| matches!(e, DscEvent::Fault(SessionError::ReadFailed { .. })))
            .count();
        assert_eq!(faults, 2);
    }

    #[test]
    fn test_notifications_decode_to_azel() {
        let mut h = Harness::new();
        h.connected("AA:BB");
        h.discovered(&[CharacteristicRole::StreamingAzEl]);
        let session = h.session();

        for value in [&b"123.45-12.3"[..], b"12"] {
            h.manager.handle_event(TransportEvent::Notification {
                session,
                uuid: h.ids.azel,
                value: value.to_vec(),
            });
        }
        // Unknown characteristic
        h.manager.handle_event(TransportEvent::Notification {
            session,
            uuid: h.ids.az_resolution,
            value: b"123.45-12.3".to_vec(),
        });

        assert_eq!(
            h.drain(),
            vec![
                DscEvent::Connected,
                DscEvent::AzElAvailable {
                    azimuth: 123.45,
                    elevation: -12.3
                },
                DscEvent::Fault(SessionError::MalformedSample(DecodeError::TooShort {
                    len: 2
                })),
            ]
        );
    }

    #[test]
    fn test_notification_before_discovery_ignored() {
        let mut h = Harness::new();
        h.connected("AA:BB");
        let session = h.session();
        h.manager.handle_event(TransportEvent::Notification {
            session,
            uuid: h.ids.azel,
            value: b"123.45-12.3".to_vec(),
        });
        assert_eq!(h.drain(), vec![DscEvent::Connected]);
    }

    #[test]
    fn test_only_legal_transitions_reachable() {
        use ConnectionState::*;

        fn legal(from: ConnectionState, to: ConnectionState) -> bool {
            from == to
                || matches!(
                    (from, to),
                    (Disconnected, Connecting)
                        | (Connecting, Connected)
                        | (Connecting, Disconnected)
                        | (Connected, Disconnected)
                )
        }

        let mut h = Harness::new();
        // Deterministic pseudo-random walk over commands and reports
        let mut seed: u64 = 0x2545_f491_4f6c_dd1d;
        let mut previous = h.manager.state();
        for _ in 0..2_000 {
            seed ^= seed << 13;
            seed ^= seed >> 7;
            seed ^= seed << 17;

            let session = h.session();
            match seed % 9 {
                0 => {
                    let _ = h.manager.connect("AA:BB");
                }
                1 => {
                    let _ = h.manager.connect(" AA:BB ");
                }
                2 => {
                    let _ = h.manager.disconnect();
                }
                3 => h.manager.close(),
                4 => h
                    .manager
                    .handle_event(TransportEvent::Connected { session }),
                5 => h
                    .manager
                    .handle_event(TransportEvent::Disconnected { session }),
                6 => h.discovered(&[
                    CharacteristicRole::StreamingAzEl,
                    CharacteristicRole::OneShotAzResolution,
                    CharacteristicRole::OneShotElResolution,
                ]),
                7 => {
                    if !h.sim.reads().is_empty() {
                        h.complete_last_read(Ok(b"4096"));
                    }
                }
                _ => h
                    .manager
                    .handle_event(TransportEvent::Disconnected {
                        session: SessionId(session.0 + 1),
                    }),
            }

            let current = h.manager.state();
            // A deferred reconnect passes through Disconnected within one step
            let passed_disconnected = h.drain().contains(&DscEvent::Disconnected);
            if passed_disconnected && current == Connecting {
                assert!(legal(previous, Disconnected), "{:?} -> Disconnected", previous);
            } else {
                assert!(legal(previous, current), "{:?} -> {:?}", previous, current);
            }
            if current != ConnectionState::Connected {
                assert!(h.manager.read_in_flight().is_none());
                assert!(h.manager.pending_reads().is_empty());
            }
            previous = current;
        }
    }
}
