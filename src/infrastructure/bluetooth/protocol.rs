//! DSC Server Protocol
//!
//! GATT identifiers exposed by the DSC server and the text encodings
//! its characteristics carry.

use crate::domain::error::DecodeError;
use crate::domain::models::{CharacteristicRole, Sample};
use uuid::Uuid;

/// DSC vendor service
pub const DSC_SERVICE_UUID: &str = "4fafc201-1fb5-459e-8fcc-c5c9c331924b";

/// Streaming az+el characteristic (notify)
pub const AZEL_CHAR_UUID: &str = "beb5483e-36e1-4688-b7f5-ea07361b26ae";

/// Azimuth encoder resolution (read once)
pub const AZ_RESOLUTION_CHAR_UUID: &str = "beb5483e-36e1-4688-b7f5-ea07361b26ca";

/// Elevation encoder resolution (read once)
pub const EL_RESOLUTION_CHAR_UUID: &str = "beb5483e-36e1-4688-b7f5-ea07361b266e";

/// Azimuth alone (read once)
pub const AZIMUTH_CHAR_UUID: &str = "beb5483e-36e1-4688-b7f5-ea07361b26ba";

/// Elevation alone (read once)
pub const ELEVATION_CHAR_UUID: &str = "beb5483e-36e1-4688-b7f5-ea07361b265e";

/// Width of the azimuth field at the head of a paired payload.
pub const AZIMUTH_FIELD_WIDTH: usize = 6;

/// The identifiers a session looks for after discovery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GattIdentifiers {
    pub service: Uuid,
    pub azel: Uuid,
    pub az_resolution: Uuid,
    pub el_resolution: Uuid,
    pub azimuth: Uuid,
    pub elevation: Uuid,
}

impl Default for GattIdentifiers {
    fn default() -> Self {
        Self {
            service: Uuid::from_u128(0x4fafc201_1fb5_459e_8fcc_c5c9c331924b),
            azel: Uuid::from_u128(0xbeb5483e_36e1_4688_b7f5_ea07361b26ae),
            az_resolution: Uuid::from_u128(0xbeb5483e_36e1_4688_b7f5_ea07361b26ca),
            el_resolution: Uuid::from_u128(0xbeb5483e_36e1_4688_b7f5_ea07361b266e),
            azimuth: Uuid::from_u128(0xbeb5483e_36e1_4688_b7f5_ea07361b26ba),
            elevation: Uuid::from_u128(0xbeb5483e_36e1_4688_b7f5_ea07361b265e),
        }
    }
}

impl GattIdentifiers {
    /// Role for a characteristic identifier under the DSC service
    pub fn role_of(&self, uuid: &Uuid) -> Option<CharacteristicRole> {
        let role = if *uuid == self.azel {
            CharacteristicRole::StreamingAzEl
        } else if *uuid == self.az_resolution {
            CharacteristicRole::OneShotAzResolution
        } else if *uuid == self.el_resolution {
            CharacteristicRole::OneShotElResolution
        } else if *uuid == self.azimuth {
            CharacteristicRole::OneShotAzimuth
        } else if *uuid == self.elevation {
            CharacteristicRole::OneShotElevation
        } else {
            return None;
        };
        Some(role)
    }

    pub fn uuid_of(&self, role: CharacteristicRole) -> Uuid {
        match role {
            CharacteristicRole::StreamingAzEl => self.azel,
            CharacteristicRole::OneShotAzResolution => self.az_resolution,
            CharacteristicRole::OneShotElResolution => self.el_resolution,
            CharacteristicRole::OneShotAzimuth => self.azimuth,
            CharacteristicRole::OneShotElevation => self.elevation,
        }
    }
}

/// Decode a payload according to the encoding its role uses
///
/// # Encodings
///
/// ```text
/// paired (streaming az+el):  "123.45-12.3"
///                             [0..6)  azimuth, sign and point included
///                             [6..)   elevation
///
/// single (one-shot reads):   "4096"
/// ```
///
/// Only ASCII digits, `+`, `-` and `.` are accepted in either form.
pub fn decode(role: CharacteristicRole, payload: &[u8]) -> Result<Sample, DecodeError> {
    if role.is_streaming() {
        let (azimuth, elevation) = decode_paired(payload)?;
        Ok(Sample::Paired { azimuth, elevation })
    } else {
        decode_single(payload).map(Sample::Single)
    }
}

/// Decode the fixed-width paired az+el text.
pub fn decode_paired(payload: &[u8]) -> Result<(f32, f32), DecodeError> {
    let text = numeric_text(payload)?;
    if text.len() < AZIMUTH_FIELD_WIDTH {
        return Err(DecodeError::TooShort { len: text.len() });
    }

    // All ASCII past numeric_text, so the split lands on a char boundary
    let (az, el) = text.split_at(AZIMUTH_FIELD_WIDTH);
    Ok((parse_field(az)?, parse_field(el)?))
}

/// Decode a single decimal value.
pub fn decode_single(payload: &[u8]) -> Result<f32, DecodeError> {
    parse_field(numeric_text(payload)?)
}

fn numeric_text(payload: &[u8]) -> Result<&str, DecodeError> {
    let text = std::str::from_utf8(payload).map_err(|_| DecodeError::NotUtf8)?;
    if let Some((index, ch)) = text
        .char_indices()
        .find(|(_, ch)| !(ch.is_ascii_digit() || matches!(ch, '+' | '-' | '.')))
    {
        return Err(DecodeError::InvalidCharacter { ch, index });
    }
    Ok(text)
}

fn parse_field(field: &str) -> Result<f32, DecodeError> {
    field.parse::<f32>().map_err(|_| DecodeError::InvalidNumber {
        field: field.to_string(),
    })
}

const KNOWN_ATTRIBUTES: [(Uuid, &str); 11] = [
    // Standard services
    (Uuid::from_u128(0x0000180a_0000_1000_8000_00805f9b34fb), "Device Information Service"),
    // Standard characteristics
    (Uuid::from_u128(0x00002902_0000_1000_8000_00805f9b34fb), "Client Characteristic Config"),
    (Uuid::from_u128(0x00002901_0000_1000_8000_00805f9b34fb), "Description String"),
    (Uuid::from_u128(0x00002a29_0000_1000_8000_00805f9b34fb), "Manufacturer Name String"),
    // DSC server
    (Uuid::from_u128(0x4fafc201_1fb5_459e_8fcc_c5c9c331924b), "DSC Service"),
    (Uuid::from_u128(0xbeb5483e_36e1_4688_b7f5_ea07361b26ba), "Azimuth"),
    (Uuid::from_u128(0xbeb5483e_36e1_4688_b7f5_ea07361b265e), "Elevation"),
    (Uuid::from_u128(0xbeb5483e_36e1_4688_b7f5_ea07361b26ae), "Az+El"),
    (Uuid::from_u128(0xbeb5483e_36e1_4688_b7f5_ea07361b26ca), "Az Resolution"),
    (Uuid::from_u128(0xbeb5483e_36e1_4688_b7f5_ea07361b266e), "El Resolution"),
    (Uuid::from_u128(0xbeb5483e_36e1_4688_b7f5_ea07361b2168), "Reset"),
];

/// Human-readable name for a GATT identifier, for display and logs only.
pub fn lookup<'a>(uuid: &Uuid, default: &'a str) -> &'a str {
    KNOWN_ATTRIBUTES
        .iter()
        .find(|(known, _)| known == uuid)
        .map(|(_, name)| *name)
        .unwrap_or(default)
}

/// Parse "AA:BB:CC:DD:EE:FF" (or dash separated) into the 48-bit integer form
/// native stacks address devices by.
pub fn parse_bluetooth_address(address: &str) -> Option<u64> {
    let octets: Vec<&str> = address.trim().split([':', '-']).collect();
    if octets.len() != 6 {
        return None;
    }

    octets.iter().try_fold(0u64, |acc, octet| {
        if octet.len() != 2 {
            return None;
        }
        u8::from_str_radix(octet, 16)
            .ok()
            .map(|b| (acc << 8) | b as u64)
    })
}
