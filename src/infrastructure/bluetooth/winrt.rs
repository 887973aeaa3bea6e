//! WinRT Bluetooth LE backend
//!
//! Implements [`Transport`] on top of `Windows.Devices.Bluetooth`. Every
//! request is started on the tokio runtime and reported back through the
//! transport channel; WinRT callbacks (connection status, value changed)
//! are tagged with the session they were registered for.

use crate::domain::error::SessionError;
use crate::infrastructure::bluetooth::protocol;
use crate::infrastructure::bluetooth::transport::{
    CharacteristicHandle, DiscoveredCharacteristic, DiscoveredService, PeripheralAddress,
    ReadRequestId, SessionId, Transport, TransportEvent, TransportEventSender,
};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::runtime::Handle;
use tracing::{debug, info, warn};
use uuid::Uuid;
use windows::core::{Ref, GUID};
use windows::Devices::Bluetooth::GenericAttributeProfile::{
    GattCharacteristic, GattCharacteristicProperties,
    GattClientCharacteristicConfigurationDescriptorValue, GattCommunicationStatus, GattSession,
    GattValueChangedEventArgs,
};
use windows::Devices::Bluetooth::{
    BluetoothAdapter, BluetoothCacheMode, BluetoothConnectionStatus, BluetoothLEDevice,
};
use windows::Foundation::TypedEventHandler;
use windows::Storage::Streams::{DataReader, IBuffer};

#[derive(Debug, thiserror::Error)]
enum WinRtError {
    #[error(transparent)]
    Windows(#[from] windows::core::Error),
    #[error("{0} returned {1:?}")]
    Status(&'static str, GattCommunicationStatus),
    #[error("session has no device")]
    NoDevice,
}

fn to_uuid(guid: GUID) -> Uuid {
    Uuid::from_u128(guid.to_u128())
}

fn buffer_bytes(buffer: &IBuffer) -> windows::core::Result<Vec<u8>> {
    let reader = DataReader::FromBuffer(buffer)?;
    let mut bytes = vec![0u8; reader.UnconsumedBufferLength()? as usize];
    reader.ReadBytes(&mut bytes)?;
    Ok(bytes)
}

/// WinRT objects held for one session
struct Link {
    address: u64,
    /// Bumped on every release; a connect started under an older value is stale
    attempt: u64,
    device: Option<BluetoothLEDevice>,
    gatt: Option<GattSession>,
    status_token: Option<i64>,
    characteristics: HashMap<Uuid, GattCharacteristic>,
    subscriptions: HashMap<Uuid, i64>,
}

impl Link {
    fn new(address: u64) -> Self {
        Self {
            address,
            attempt: 0,
            device: None,
            gatt: None,
            status_token: None,
            characteristics: HashMap::new(),
            subscriptions: HashMap::new(),
        }
    }

    /// Drop every WinRT object. No callbacks fire for this link afterwards.
    fn release(&mut self) {
        self.attempt += 1;
        for (uuid, token) in self.subscriptions.drain() {
            if let Some(characteristic) = self.characteristics.get(&uuid) {
                let _ = characteristic.RemoveValueChanged(token);
            }
        }
        self.characteristics.clear();

        if let Some(gatt) = self.gatt.take() {
            let _ = gatt.SetMaintainConnection(false);
            let _ = gatt.Close();
        }
        if let Some(device) = self.device.take() {
            if let Some(token) = self.status_token.take() {
                let _ = device.RemoveConnectionStatusChanged(token);
            }
            let _ = device.Close();
        }
    }
}

type Links = Arc<Mutex<HashMap<SessionId, Link>>>;

fn lock(links: &Links) -> MutexGuard<'_, HashMap<SessionId, Link>> {
    links.lock().unwrap_or_else(PoisonError::into_inner)
}

fn is_current(links: &Links, session: SessionId, attempt: u64) -> bool {
    lock(links)
        .get(&session)
        .is_some_and(|link| link.attempt == attempt)
}

pub struct WinRtTransport {
    runtime: Handle,
    events: TransportEventSender,
    available: bool,
    links: Links,
}

impl WinRtTransport {
    /// Check the default adapter. Must be called from inside a tokio runtime.
    pub async fn new(events: TransportEventSender) -> Self {
        let available = match adapter_supports_le().await {
            Ok(supported) => {
                info!("Default Bluetooth adapter found, LE supported: {}", supported);
                supported
            }
            Err(e) => {
                warn!("No usable Bluetooth adapter: {}", e);
                false
            }
        };

        Self {
            runtime: Handle::current(),
            events,
            available,
            links: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    fn start_connect(&self, session: SessionId) {
        let Some((address, attempt)) = lock(&self.links)
            .get(&session)
            .map(|link| (link.address, link.attempt))
        else {
            return;
        };

        let links = Arc::clone(&self.links);
        let events = self.events.clone();
        self.runtime.spawn(async move {
            if let Err(e) = connect_device(&links, session, address, attempt, &events).await {
                if is_current(&links, session, attempt) {
                    warn!("Connection attempt failed: {}", e);
                    let _ = events.send(TransportEvent::Disconnected { session });
                } else {
                    debug!("Cancelled connection attempt failed: {}", e);
                }
            }
        });
    }

    fn characteristic(&self, handle: &CharacteristicHandle) -> Result<GattCharacteristic, SessionError> {
        lock(&self.links)
            .get(&handle.session)
            .and_then(|link| link.characteristics.get(&handle.uuid).cloned())
            .ok_or_else(|| SessionError::Transport(format!("{} not discovered", handle.uuid)))
    }
}

async fn adapter_supports_le() -> windows::core::Result<bool> {
    let adapter = BluetoothAdapter::GetDefaultAsync()?.await?;
    adapter.IsLowEnergySupported()
}

async fn connect_device(
    links: &Links,
    session: SessionId,
    address: u64,
    attempt: u64,
    events: &TransportEventSender,
) -> Result<(), WinRtError> {
    info!("Connecting to Bluetooth device: {:#X}", address);
    let device = BluetoothLEDevice::FromBluetoothAddressAsync(address)?.await?;
    debug!("Device object created: {:?}", device.Name()?);

    let sender = events.clone();
    let status_handler =
        TypedEventHandler::new(move |dev: Ref<BluetoothLEDevice>, _| {
            if let Some(dev) = dev.as_ref() {
                let event = match dev.ConnectionStatus()? {
                    BluetoothConnectionStatus::Connected => TransportEvent::Connected { session },
                    _ => TransportEvent::Disconnected { session },
                };
                let _ = sender.send(event);
            }
            Ok(())
        });
    let status_token = device.ConnectionStatusChanged(&status_handler)?;

    // WinRT connects lazily; a maintained GattSession keeps the link up
    let gatt = GattSession::FromDeviceIdAsync(&device.BluetoothDeviceId()?)?.await?;
    gatt.SetMaintainConnection(true)?;
    let connected = device.ConnectionStatus()? == BluetoothConnectionStatus::Connected;

    {
        let mut links = lock(links);
        let Some(link) = links
            .get_mut(&session)
            .filter(|link| link.attempt == attempt)
        else {
            debug!("Session {:?} released while connecting, dropping the device", session);
            let _ = gatt.SetMaintainConnection(false);
            let _ = device.RemoveConnectionStatusChanged(status_token);
            let _ = gatt.Close();
            let _ = device.Close();
            return Ok(());
        };
        link.device = Some(device);
        link.gatt = Some(gatt);
        link.status_token = Some(status_token);
    }

    if connected {
        let _ = events.send(TransportEvent::Connected { session });
    }
    Ok(())
}

async fn discover(
    device: &BluetoothLEDevice,
) -> Result<(Vec<DiscoveredService>, Vec<GattCharacteristic>), WinRtError> {
    let result = device
        .GetGattServicesWithCacheModeAsync(BluetoothCacheMode::Uncached)?
        .await?;
    let status = result.Status()?;
    if status != GattCommunicationStatus::Success {
        return Err(WinRtError::Status("GetGattServices", status));
    }

    let mut services = Vec::new();
    let mut handles = Vec::new();
    for service in result.Services()? {
        let uuid = to_uuid(service.Uuid()?);
        let chars = service.GetCharacteristicsAsync()?.await?;
        let status = chars.Status()?;
        if status != GattCommunicationStatus::Success {
            warn!(
                "Characteristics of {} unavailable: {:?}",
                protocol::lookup(&uuid, "service"),
                status
            );
            continue;
        }

        let mut characteristics = Vec::new();
        for characteristic in chars.Characteristics()? {
            let properties = characteristic.CharacteristicProperties()?;
            characteristics.push(DiscoveredCharacteristic {
                uuid: to_uuid(characteristic.Uuid()?),
                readable: properties.contains(GattCharacteristicProperties::Read),
                notifiable: properties.contains(GattCharacteristicProperties::Notify),
            });
            handles.push(characteristic);
        }
        services.push(DiscoveredService {
            uuid,
            characteristics,
        });
    }

    Ok((services, handles))
}

async fn read_value(characteristic: &GattCharacteristic) -> Result<Vec<u8>, WinRtError> {
    let result = characteristic
        .ReadValueWithCacheModeAsync(BluetoothCacheMode::Uncached)?
        .await?;
    let status = result.Status()?;
    if status != GattCommunicationStatus::Success {
        return Err(WinRtError::Status("ReadValue", status));
    }
    Ok(buffer_bytes(&result.Value()?)?)
}

impl Transport for WinRtTransport {
    fn is_available(&self) -> bool {
        self.available
    }

    fn open(
        &mut self,
        session: SessionId,
        address: &PeripheralAddress,
    ) -> Result<(), SessionError> {
        let raw = protocol::parse_bluetooth_address(address.as_str())
            .ok_or(SessionError::InvalidAddress)?;
        lock(&self.links).insert(session, Link::new(raw));
        self.start_connect(session);
        Ok(())
    }

    fn resume(&mut self, session: SessionId) -> Result<(), SessionError> {
        match lock(&self.links).get_mut(&session) {
            Some(link) => link.release(),
            None => return Err(SessionError::NotConnected),
        }
        self.start_connect(session);
        Ok(())
    }

    fn discover_services(&mut self, session: SessionId) -> Result<(), SessionError> {
        let links = Arc::clone(&self.links);
        let events = self.events.clone();
        self.runtime.spawn(async move {
            let device = lock(&links)
                .get(&session)
                .and_then(|link| link.device.clone());
            let result = match device {
                Some(device) => discover(&device).await,
                None => Err(WinRtError::NoDevice),
            };

            let result = match result {
                Ok((services, handles)) => {
                    if let Some(link) = lock(&links).get_mut(&session) {
                        for characteristic in handles {
                            if let Ok(guid) = characteristic.Uuid() {
                                link.characteristics.insert(to_uuid(guid), characteristic);
                            }
                        }
                    }
                    Ok(services)
                }
                Err(e) => Err(e.to_string()),
            };
            let _ = events.send(TransportEvent::ServicesDiscovered { session, result });
        });
        Ok(())
    }

    fn set_notify(
        &mut self,
        handle: &CharacteristicHandle,
        enabled: bool,
    ) -> Result<(), SessionError> {
        let characteristic = self.characteristic(handle)?;
        let session = handle.session;
        let uuid = handle.uuid;
        let to_error = |e: windows::core::Error| SessionError::Transport(e.to_string());

        let descriptor = if enabled {
            let sender = self.events.clone();
            let value_handler = TypedEventHandler::new(
                move |_: Ref<GattCharacteristic>, args: Ref<GattValueChangedEventArgs>| {
                    if let Some(args) = args.as_ref() {
                        let value = buffer_bytes(&args.CharacteristicValue()?)?;
                        let _ = sender.send(TransportEvent::Notification {
                            session,
                            uuid,
                            value,
                        });
                    }
                    Ok(())
                },
            );
            let token = characteristic.ValueChanged(&value_handler).map_err(to_error)?;
            if let Some(link) = lock(&self.links).get_mut(&session) {
                link.subscriptions.insert(uuid, token);
            }
            GattClientCharacteristicConfigurationDescriptorValue::Notify
        } else {
            if let Some(token) = lock(&self.links)
                .get_mut(&session)
                .and_then(|link| link.subscriptions.remove(&uuid))
            {
                characteristic.RemoveValueChanged(token).map_err(to_error)?;
            }
            GattClientCharacteristicConfigurationDescriptorValue::None
        };

        // The descriptor write finishes in the background; the handler is already live
        self.runtime.spawn(async move {
            let status = match characteristic
                .WriteClientCharacteristicConfigurationDescriptorAsync(descriptor)
            {
                Ok(op) => op.await,
                Err(e) => Err(e),
            };
            match status {
                Ok(GattCommunicationStatus::Success) => {
                    debug!("Notifications {} for {}", if enabled { "on" } else { "off" }, uuid)
                }
                Ok(status) => warn!("Descriptor write for {} returned {:?}", uuid, status),
                Err(e) => warn!("Descriptor write for {} failed: {}", uuid, e),
            }
        });
        Ok(())
    }

    fn read(
        &mut self,
        handle: &CharacteristicHandle,
        request: ReadRequestId,
    ) -> Result<(), SessionError> {
        let characteristic = self.characteristic(handle)?;
        let events = self.events.clone();
        let session = handle.session;
        let uuid = handle.uuid;
        self.runtime.spawn(async move {
            let result = read_value(&characteristic).await.map_err(|e| e.to_string());
            let _ = events.send(TransportEvent::ReadCompleted {
                session,
                request,
                uuid,
                result,
            });
        });
        Ok(())
    }

    fn disconnect(&mut self, session: SessionId) -> Result<(), SessionError> {
        // WinRT has no explicit disconnect: dropping every reference ends the link
        match lock(&self.links).get_mut(&session) {
            Some(link) => link.release(),
            None => return Err(SessionError::NotConnected),
        }
        let _ = self.events.send(TransportEvent::Disconnected { session });
        Ok(())
    }

    fn close(&mut self, session: SessionId) {
        if let Some(mut link) = lock(&self.links).remove(&session) {
            link.release();
        }
    }
}

impl Drop for WinRtTransport {
    fn drop(&mut self) {
        for (_, mut link) in lock(&self.links).drain() {
            link.release();
        }
    }
}
