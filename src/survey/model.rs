use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::reading::LiveReading;

/// The two measurement slots of a survey. Serialized as the bare numbers
/// 1 and 2 to stay compatible with previously stored data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum PointSlot {
    One,
    Two,
}

impl PointSlot {
    pub fn number(&self) -> u8 {
        match self {
            PointSlot::One => 1,
            PointSlot::Two => 2,
        }
    }

    pub fn other(&self) -> Self {
        match self {
            PointSlot::One => PointSlot::Two,
            PointSlot::Two => PointSlot::One,
        }
    }

    /// Storage key for the loose point in this slot.
    pub fn point_key(&self) -> &'static str {
        match self {
            PointSlot::One => "point1Data",
            PointSlot::Two => "point2Data",
        }
    }

    /// Storage key for the slot's main photo.
    pub fn photo_key(&self) -> &'static str {
        match self {
            PointSlot::One => "imagePoint1",
            PointSlot::Two => "imagePoint2",
        }
    }

    /// Storage key for the slot's full photo history.
    pub fn photo_list_key(&self) -> &'static str {
        match self {
            PointSlot::One => "imagePoint1List",
            PointSlot::Two => "imagePoint2List",
        }
    }
}

impl From<PointSlot> for u8 {
    fn from(slot: PointSlot) -> u8 {
        slot.number()
    }
}

impl TryFrom<u8> for PointSlot {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(PointSlot::One),
            2 => Ok(PointSlot::Two),
            other => Err(format!("point number must be 1 or 2, got {other}")),
        }
    }
}

/// A captured photo. The bytes stay on disk at `uri`; only this reference
/// is persisted and shipped around.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PhotoRef {
    pub uri: String,
    #[serde(rename = "type")]
    pub mime_type: String,
    pub width: u32,
    pub height: u32,
    pub captured_at: DateTime<Utc>,
}

impl PhotoRef {
    pub fn jpeg(uri: String, width: u32, height: u32) -> Self {
        Self {
            uri,
            mime_type: "image/jpeg".to_string(),
            width,
            height,
            captured_at: Utc::now(),
        }
    }
}

/// Frozen snapshot of the live reading at capture time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Point {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub elevation: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub distance: Option<f64>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, f64>,
    pub lat: f64,
    pub lon: f64,
    pub altitude: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub accuracy: Option<f64>,
    pub azimuth: i32,
    pub timestamp: DateTime<Utc>,
    pub device_id: String,
    pub point_number: PointSlot,
    #[serde(default)]
    pub has_image: bool,
}

impl Point {
    pub fn from_reading(
        reading: &LiveReading,
        slot: PointSlot,
        accuracy: Option<f64>,
        device_id: String,
        has_image: bool,
    ) -> Self {
        Self {
            elevation: reading.elevation,
            distance: reading.distance,
            extra: reading.extra.clone(),
            lat: reading.lat,
            lon: reading.lon,
            altitude: reading.altitude,
            accuracy,
            azimuth: reading.azimuth,
            timestamp: Utc::now(),
            device_id,
            point_number: slot,
            has_image,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AreaLocation {
    pub latitude: f64,
    pub longitude: f64,
    pub altitude: f64,
}

impl AreaLocation {
    pub fn zero() -> Self {
        Self {
            latitude: 0.0,
            longitude: 0.0,
            altitude: 0.0,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PointPair {
    pub point1: Option<Point>,
    pub point2: Option<Point>,
}

impl PointPair {
    pub fn get(&self, slot: PointSlot) -> Option<&Point> {
        match slot {
            PointSlot::One => self.point1.as_ref(),
            PointSlot::Two => self.point2.as_ref(),
        }
    }

    pub fn get_mut(&mut self, slot: PointSlot) -> Option<&mut Point> {
        match slot {
            PointSlot::One => self.point1.as_mut(),
            PointSlot::Two => self.point2.as_mut(),
        }
    }

    pub fn set(&mut self, slot: PointSlot, point: Point) {
        match slot {
            PointSlot::One => self.point1 = Some(point),
            PointSlot::Two => self.point2 = Some(point),
        }
    }

    pub fn both_present(&self) -> bool {
        self.point1.is_some() && self.point2.is_some()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PhotoPair {
    pub point1: Option<PhotoRef>,
    pub point2: Option<PhotoRef>,
}

impl PhotoPair {
    pub fn get(&self, slot: PointSlot) -> Option<&PhotoRef> {
        match slot {
            PointSlot::One => self.point1.as_ref(),
            PointSlot::Two => self.point2.as_ref(),
        }
    }

    pub fn set(&mut self, slot: PointSlot, photo: Option<PhotoRef>) {
        match slot {
            PointSlot::One => self.point1 = photo,
            PointSlot::Two => self.point2 = photo,
        }
    }
}

/// One named site with its two measurement points and their photos.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SurveyArea {
    pub id: String,
    pub name: String,
    pub observer: String,
    pub timestamp: DateTime<Utc>,
    pub location: AreaLocation,
    pub points: PointPair,
    pub images: PhotoPair,
    pub azimuth: i32,
    pub is_submitted: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub submitted_at: Option<DateTime<Utc>>,
    pub is_active: bool,
}

impl SurveyArea {
    pub fn new(id: String, name: String, observer: String, location: AreaLocation) -> Self {
        Self {
            id,
            name,
            observer,
            timestamp: Utc::now(),
            location,
            points: PointPair::default(),
            images: PhotoPair::default(),
            azimuth: 0,
            is_submitted: false,
            submitted_at: None,
            is_active: true,
        }
    }

    /// Submission needs both points; photos stay optional.
    pub fn is_complete(&self) -> bool {
        self.points.both_present()
    }
}
