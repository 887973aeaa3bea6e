//! Characteristic Registry
//!
//! Resolves the DSC service's characteristics after discovery and tags
//! each with its role. Built fresh for every connected lifetime.

use crate::domain::error::SessionError;
use crate::domain::models::CharacteristicRole;
use crate::infrastructure::bluetooth::protocol::{self, GattIdentifiers};
use crate::infrastructure::bluetooth::transport::{
    CharacteristicHandle, DiscoveredService, Generation, SessionId,
};
use tracing::{debug, info};

const ALL_ROLES: [CharacteristicRole; 5] = [
    CharacteristicRole::StreamingAzEl,
    CharacteristicRole::OneShotAzResolution,
    CharacteristicRole::OneShotElResolution,
    CharacteristicRole::OneShotAzimuth,
    CharacteristicRole::OneShotElevation,
];

#[derive(Debug, Clone, PartialEq)]
pub struct CharacteristicRegistry {
    streaming: Option<CharacteristicHandle>,
    one_shot: Vec<CharacteristicHandle>,
    missing: Vec<CharacteristicRole>,
}

impl CharacteristicRegistry {
    /// Locate the DSC service in a discovery result and classify its
    /// characteristics. Absent characteristics are recorded in
    /// [`missing`](Self::missing), not treated as errors.
    pub fn resolve(
        services: &[DiscoveredService],
        ids: &GattIdentifiers,
        session: SessionId,
        generation: Generation,
    ) -> Result<Self, SessionError> {
        let service = services
            .iter()
            .find(|s| s.uuid == ids.service)
            .ok_or(SessionError::ServiceNotFound(ids.service))?;

        info!(
            "Found {} with {} characteristics",
            protocol::lookup(&service.uuid, "DSC service"),
            service.characteristics.len()
        );

        let mut streaming = None;
        let mut one_shot = Vec::new();

        for characteristic in &service.characteristics {
            let Some(role) = ids.role_of(&characteristic.uuid) else {
                debug!(
                    "Ignoring {} ({})",
                    protocol::lookup(&characteristic.uuid, "unknown characteristic"),
                    characteristic.uuid
                );
                continue;
            };

            let usable = if role.is_streaming() {
                characteristic.notifiable
            } else {
                characteristic.readable
            };
            if !usable {
                info!(
                    "{} does not support {}, skipping it",
                    protocol::lookup(&characteristic.uuid, "characteristic"),
                    if role.is_streaming() { "notify" } else { "read" }
                );
                continue;
            }

            let handle = CharacteristicHandle {
                session,
                generation,
                role,
                uuid: characteristic.uuid,
            };

            if role.is_streaming() {
                if streaming.is_none() {
                    streaming = Some(handle);
                }
            } else if !one_shot.iter().any(|h: &CharacteristicHandle| h.role == role) {
                one_shot.push(handle);
            }
        }

        let missing = ALL_ROLES
            .into_iter()
            .filter(|role| {
                streaming.map(|h| h.role) != Some(*role) && !one_shot.iter().any(|h| h.role == *role)
            })
            .collect();

        Ok(Self {
            streaming,
            one_shot,
            missing,
        })
    }

    pub fn streaming(&self) -> Option<&CharacteristicHandle> {
        self.streaming.as_ref()
    }

    /// One-shot characteristics in discovery order
    pub fn one_shot(&self) -> &[CharacteristicHandle] {
        &self.one_shot
    }

    pub fn missing(&self) -> &[CharacteristicRole] {
        &self.missing
    }
}
