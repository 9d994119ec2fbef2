use serde::Serialize;

use crate::ble::profile::Binding;
use crate::ble::session::DiscoveredDevice;
use crate::reading::LiveReading;

/// Notifications pushed to whatever frontend is driving the station. Encoded
/// as `{ "event": ..., "payload": ... }` for the wire.
#[derive(Debug, Clone, Serialize)]
#[serde(
    tag = "event",
    content = "payload",
    rename_all = "camelCase",
    rename_all_fields = "camelCase"
)]
pub enum StationEvent {
    /// The live reading changed (new telemetry, GPS or compass input).
    ReadingUpdated(LiveReading),
    /// A peripheral showed up or refreshed during an active scan.
    DeviceDiscovered(DiscoveredDevice),
    Connected {
        device_name: String,
        binding: Binding,
    },
    /// `unsolicited` distinguishes link loss from an operator disconnect.
    Disconnected {
        device_name: String,
        unsolicited: bool,
    },
    /// The scan window closed without a recognized station.
    ScanWindowElapsed {
        device_count: usize,
    },
    AreaSaved {
        id: String,
        name: String,
    },
    Submitted {
        status: u16,
        without_photos: bool,
    },
    /// Operator-facing one-liner (duplicate connects, empty captures, ...).
    Notice(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn events_encode_with_tag_and_payload() {
        let event = StationEvent::Disconnected {
            device_name: "LandslideMonitor".to_string(),
            unsolicited: true,
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event"], "disconnected");
        assert_eq!(json["payload"]["deviceName"], "LandslideMonitor");
        assert_eq!(json["payload"]["unsolicited"], true);
    }

    #[test]
    fn notices_carry_plain_text() {
        let event = StationEvent::Notice("already connected".to_string());
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event"], "notice");
        assert_eq!(json["payload"], "already connected");
    }
}
