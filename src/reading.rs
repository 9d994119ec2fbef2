use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::ble::telemetry::FieldKey;
use crate::sensors::location::GpsFix;

/// Latest aggregated measurement, rebuilt on every telemetry delta. Held in
/// memory only; captures snapshot it into a `Point`, nothing persists it.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LiveReading {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub elevation: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub distance: Option<f64>,
    /// Unrecognized-but-numeric fields the station sent, kept verbatim.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub extra: BTreeMap<String, f64>,
    /// Station-supplied coordinates, used only when no GPS fix exists.
    #[serde(skip)]
    ble_lat: Option<f64>,
    #[serde(skip)]
    ble_lon: Option<f64>,
    pub lat: f64,
    pub lon: f64,
    pub altitude: f64,
    /// Always `round(compass heading)`; the station never sources this.
    pub azimuth: i32,
}

impl LiveReading {
    /// True until at least one usable BLE field has been folded in. GPS and
    /// compass alone never make a reading capturable.
    pub fn is_empty(&self) -> bool {
        self.elevation.is_none()
            && self.distance.is_none()
            && self.extra.is_empty()
            && self.ble_lat.is_none()
            && self.ble_lon.is_none()
    }

    /// Pure merge step: previous BLE fields plus this delta, then the
    /// positional overlay. `lat`/`lon`/`altitude` prefer the GPS fix, fall
    /// back to station-supplied values, else stay at their prior value
    /// (zero when nothing was ever known). `azimuth` is always the rounded
    /// compass heading at merge time.
    pub fn merge(
        previous: &LiveReading,
        fields: &[(FieldKey, f64)],
        gps: Option<&GpsFix>,
        heading: f64,
    ) -> LiveReading {
        let mut next = previous.clone();

        for (key, value) in fields {
            match key {
                FieldKey::Elevation => next.elevation = Some(*value),
                FieldKey::Distance => next.distance = Some(*value),
                FieldKey::Latitude => next.ble_lat = Some(*value),
                FieldKey::Longitude => next.ble_lon = Some(*value),
                FieldKey::Other(name) => {
                    next.extra.insert(name.clone(), *value);
                }
            }
        }

        next.lat = gps
            .map(|fix| fix.latitude)
            .or(next.ble_lat)
            .unwrap_or(previous.lat);
        next.lon = gps
            .map(|fix| fix.longitude)
            .or(next.ble_lon)
            .unwrap_or(previous.lon);
        next.altitude = gps
            .and_then(|fix| fix.altitude)
            .unwrap_or(previous.altitude);
        next.azimuth = normalize_azimuth(heading);

        next
    }
}

fn normalize_azimuth(heading: f64) -> i32 {
    let rounded = heading.round() as i32;
    rounded.rem_euclid(360)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fix(lat: f64, lon: f64, alt: f64) -> GpsFix {
        GpsFix {
            latitude: lat,
            longitude: lon,
            altitude: Some(alt),
            accuracy: Some(5.0),
        }
    }

    #[test]
    fn folds_successive_deltas_into_one_reading() {
        let gps = fix(17.5, 100.2, 301.0);

        let first = LiveReading::merge(
            &LiveReading::default(),
            &[(FieldKey::Elevation, 12.5)],
            Some(&gps),
            92.3,
        );
        let second = LiveReading::merge(&first, &[(FieldKey::Distance, 3.2)], Some(&gps), 92.3);

        assert_eq!(second.elevation, Some(12.5));
        assert_eq!(second.distance, Some(3.2));
        assert_eq!(second.lat, 17.5);
        assert_eq!(second.lon, 100.2);
        assert_eq!(second.altitude, 301.0);
        assert_eq!(second.azimuth, 92);
    }

    #[test]
    fn azimuth_tracks_the_compass_only() {
        let reading = LiveReading::merge(
            &LiveReading::default(),
            &[(FieldKey::Elevation, 1.0)],
            None,
            359.6,
        );
        // 359.6 rounds to 360, which wraps to 0.
        assert_eq!(reading.azimuth, 0);

        let moved = LiveReading::merge(&reading, &[], None, 45.4);
        assert_eq!(moved.azimuth, 45);
        assert_eq!(moved.elevation, Some(1.0));
    }

    #[test]
    fn station_coordinates_back_fill_missing_gps() {
        let reading = LiveReading::merge(
            &LiveReading::default(),
            &[(FieldKey::Latitude, 17.1), (FieldKey::Longitude, 100.9)],
            None,
            0.0,
        );
        assert_eq!(reading.lat, 17.1);
        assert_eq!(reading.lon, 100.9);

        // A real fix wins over the station values.
        let located = LiveReading::merge(&reading, &[], Some(&fix(18.0, 99.0, 50.0)), 0.0);
        assert_eq!(located.lat, 18.0);
        assert_eq!(located.lon, 99.0);
        assert_eq!(located.altitude, 50.0);
    }

    #[test]
    fn unknown_fields_accumulate_in_the_extra_bag() {
        let reading = LiveReading::merge(
            &LiveReading::default(),
            &[(FieldKey::Other("soilMoisture".into()), 0.82)],
            None,
            10.0,
        );
        assert_eq!(reading.extra.get("soilMoisture"), Some(&0.82));
        assert!(!reading.is_empty());
    }

    #[test]
    fn positional_data_alone_leaves_the_reading_empty() {
        let reading =
            LiveReading::merge(&LiveReading::default(), &[], Some(&fix(17.0, 100.0, 0.0)), 123.0);
        assert!(reading.is_empty());
        assert_eq!(reading.lat, 17.0);
        assert_eq!(reading.azimuth, 123);
    }

    #[test]
    fn reconcile_without_fields_keeps_measurements() {
        let base = LiveReading::merge(
            &LiveReading::default(),
            &[(FieldKey::Elevation, 4.0), (FieldKey::Distance, 9.5)],
            None,
            10.0,
        );
        let refreshed = LiveReading::merge(&base, &[], Some(&fix(17.0, 100.0, 12.0)), 200.0);

        assert_eq!(refreshed.elevation, Some(4.0));
        assert_eq!(refreshed.distance, Some(9.5));
        assert_eq!(refreshed.azimuth, 200);
        assert_eq!(refreshed.lat, 17.0);
    }
}
