use std::collections::BTreeSet;

use btleplug::api::{Characteristic, Service};
use serde::Serialize;
use thiserror::Error;
use uuid::{uuid, Uuid};

/// Primary telemetry service advertised by current station firmware.
pub const TELEMETRY_SERVICE: Uuid = uuid!("4fafc201-1fb5-459e-8fcc-c5c9c331914b");

/// Telemetry characteristic inside the bound service.
pub const TELEMETRY_CHARACTERISTIC: Uuid = uuid!("beb5483e-36e1-4688-b7f5-ea07361b26a8");

/// Accepted services in preference order: current firmware, the legacy
/// mock firmware, and the Nordic UART service some dev boards ship with.
pub const CANDIDATE_SERVICES: [Uuid; 3] = [
    TELEMETRY_SERVICE,
    uuid!("12345678-1234-1234-1234-123456789abc"),
    uuid!("6e400001-b5a3-f393-e0a9-e50e24dcca9e"),
];

/// Advertised names of known station builds, matched as case-insensitive
/// substrings of the device name.
pub const KNOWN_DEVICE_NAMES: [&str; 6] = [
    "ESP32_LANDSLIDE_MOCK",
    "ESP32",
    "ESP32-WROOM",
    "ESP32-DevKit",
    "ESP32_BLE",
    "LANDSLIDE_SENSOR",
];

const NAME_HINTS: [&str; 3] = ["esp", "landslide", "sensor"];

/// True when an advertisement plausibly belongs to a landslide station:
/// either a service UUID from the allow-list, a known device name, or a
/// name carrying one of the generic hints.
pub fn advertisement_matches(name: Option<&str>, services: &[Uuid]) -> bool {
    if services.iter().any(|uuid| CANDIDATE_SERVICES.contains(uuid)) {
        return true;
    }

    let Some(name) = name else {
        return false;
    };
    let lowered = name.to_lowercase();

    KNOWN_DEVICE_NAMES
        .iter()
        .any(|known| lowered.contains(&known.to_lowercase()))
        || NAME_HINTS.iter().any(|hint| lowered.contains(hint))
}

/// Outcome of binding resolution. `*_exact` is false when the resolver had
/// to fall back past the preferred UUIDs; degraded bindings still monitor,
/// but the session reports them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Binding {
    pub service: Uuid,
    pub characteristic: Uuid,
    pub service_exact: bool,
    pub characteristic_exact: bool,
}

impl Binding {
    pub fn is_exact(&self) -> bool {
        self.service_exact && self.characteristic_exact
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum BindingError {
    #[error("device exposes no GATT services")]
    NoServices,
    #[error("service {service} exposes no characteristics")]
    NoCharacteristics { service: Uuid },
}

#[derive(Debug, Clone)]
pub struct ResolvedBinding {
    pub binding: Binding,
    pub characteristic: Characteristic,
}

/// Ordered resolution over the discovered services: the first allow-list
/// service present wins, else the first discovered service (degraded);
/// within it, the exact telemetry characteristic, else the first one
/// (degraded). A device with nothing to bind is rejected.
pub fn resolve_binding(services: &BTreeSet<Service>) -> Result<ResolvedBinding, BindingError> {
    if services.is_empty() {
        return Err(BindingError::NoServices);
    }

    let preferred = CANDIDATE_SERVICES
        .iter()
        .find_map(|candidate| services.iter().find(|service| service.uuid == *candidate));
    let (service, service_exact) = match preferred {
        Some(service) => (service, true),
        None => {
            let first = services.iter().next().ok_or(BindingError::NoServices)?;
            (first, false)
        }
    };

    let exact = service
        .characteristics
        .iter()
        .find(|characteristic| characteristic.uuid == TELEMETRY_CHARACTERISTIC);
    let (characteristic, characteristic_exact) = match exact {
        Some(characteristic) => (characteristic, true),
        None => {
            let first = service
                .characteristics
                .iter()
                .next()
                .ok_or(BindingError::NoCharacteristics {
                    service: service.uuid,
                })?;
            (first, false)
        }
    };

    Ok(ResolvedBinding {
        binding: Binding {
            service: service.uuid,
            characteristic: characteristic.uuid,
            service_exact,
            characteristic_exact,
        },
        characteristic: characteristic.clone(),
    })
}
