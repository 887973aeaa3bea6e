use crate::domain::error::SessionError;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
}

/// What a vendor characteristic is used for, assigned once at discovery.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CharacteristicRole {
    /// Paired az+el text, delivered by notification
    StreamingAzEl,
    OneShotAzResolution,
    OneShotElResolution,
    OneShotAzimuth,
    OneShotElevation,
}

impl CharacteristicRole {
    pub fn is_streaming(&self) -> bool {
        matches!(self, Self::StreamingAzEl)
    }
}

/// A decoded measurement
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub enum Sample {
    Single(f32),
    Paired { azimuth: f32, elevation: f32 },
}

/// Events delivered to the UI layer
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", content = "data")]
pub enum DscEvent {
    Connected,
    Disconnected,
    AzimuthAvailable(f32),
    ElevationAvailable(f32),
    AzElAvailable { azimuth: f32, elevation: f32 },
    AzResolutionAvailable(f32),
    ElResolutionAvailable(f32),
    /// A single feature degraded; the session stays up
    Fault(SessionError),
}

impl DscEvent {
    /// Map a decoded sample to the availability event for the role it came from.
    ///
    /// Returns `None` when the sample shape does not fit the role.
    pub fn from_sample(role: CharacteristicRole, sample: Sample) -> Option<Self> {
        match (role, sample) {
            (CharacteristicRole::StreamingAzEl, Sample::Paired { azimuth, elevation }) => {
                Some(Self::AzElAvailable { azimuth, elevation })
            }
            (CharacteristicRole::OneShotAzResolution, Sample::Single(v)) => {
                Some(Self::AzResolutionAvailable(v))
            }
            (CharacteristicRole::OneShotElResolution, Sample::Single(v)) => {
                Some(Self::ElResolutionAvailable(v))
            }
            (CharacteristicRole::OneShotAzimuth, Sample::Single(v)) => Some(Self::AzimuthAvailable(v)),
            (CharacteristicRole::OneShotElevation, Sample::Single(v)) => {
                Some(Self::ElevationAvailable(v))
            }
            _ => None,
        }
    }
}

/// Receiver of session events.
pub trait EventSink: Send {
    fn emit(&self, event: DscEvent);
}

impl EventSink for mpsc::UnboundedSender<DscEvent> {
    fn emit(&self, event: DscEvent) {
        let _ = self.send(event);
    }
}

/// Latest values shown to the user for the connected DSC.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct DscReadings {
    pub connected: bool,
    pub azimuth: Option<f32>,
    pub elevation: Option<f32>,
    pub az_resolution: Option<f32>,
    pub el_resolution: Option<f32>,
}

impl DscReadings {
    /// Fold one event into the readings. Disconnecting clears every value.
    pub fn apply(&mut self, event: &DscEvent) {
        match event {
            DscEvent::Connected => self.connected = true,
            DscEvent::Disconnected => *self = Self::default(),
            DscEvent::AzimuthAvailable(az) => self.azimuth = Some(*az),
            DscEvent::ElevationAvailable(el) => self.elevation = Some(*el),
            DscEvent::AzElAvailable { azimuth, elevation } => {
                self.azimuth = Some(*azimuth);
                self.elevation = Some(*elevation);
            }
            DscEvent::AzResolutionAvailable(res) => self.az_resolution = Some(*res),
            DscEvent::ElResolutionAvailable(res) => self.el_resolution = Some(*res),
            DscEvent::Fault(_) => {}
        }
    }
}

impl std::fmt::Display for DscReadings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        fn field(v: Option<f32>) -> String {
            v.map(|v| format!("{v}")).unwrap_or_else(|| "--".to_string())
        }

        write!(
            f,
            "{} | az {} el {} | res az {} el {}",
            if self.connected { "connected" } else { "disconnected" },
            field(self.azimuth),
            field(self.elevation),
            field(self.az_resolution),
            field(self.el_resolution),
        )
    }
}
