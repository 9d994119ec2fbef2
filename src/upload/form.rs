//! Field layout of the survey submission form.
//!
//! The server expects flat multipart fields with fixed precision: camera
//! coordinates with seven decimals, measurements with one decimal (blank
//! measurements submit as "0.0"), azimuth as a bare integer. Photos ride
//! along as `photo1`/`photo2` file parts.

use crate::sensors::location::GpsFix;
use crate::survey::model::{Point, PointSlot, SurveyArea};

pub const PHOTO_MIME: &str = "image/jpeg";

#[derive(Debug, Clone, PartialEq)]
pub struct FormField {
    pub name: &'static str,
    pub value: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PhotoPart {
    pub field: &'static str,
    pub file_name: String,
    pub bytes: Vec<u8>,
    pub mime: &'static str,
}

/// Transport-agnostic description of one submission. Built up front so the
/// too-large retry can resubmit the same fields without the photo parts.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SurveyForm {
    pub fields: Vec<FormField>,
    pub photos: Vec<PhotoPart>,
}

impl SurveyForm {
    pub fn for_area(area: &SurveyArea, user_id: &str) -> SurveyForm {
        let mut form = SurveyForm::default();
        form.push("user_id", user_id.to_string());
        // The observer field carries the area name on the wire.
        form.push("observer", area.name.clone());
        form.push("camera_lat", fmt_coord(area.location.latitude));
        form.push("camera_lng", fmt_coord(area.location.longitude));
        form.push("azimuth", area.azimuth.to_string());
        form.push_point(PointSlot::One, area.points.get(PointSlot::One));
        form.push_point(PointSlot::Two, area.points.get(PointSlot::Two));
        form
    }

    /// Legacy loose-workspace submission: same shape as the area form plus
    /// the first point's own coordinates. The camera position falls back to
    /// the first point when no GPS fix is at hand, and the azimuth is the
    /// compass heading at submit time rather than a frozen point azimuth.
    pub fn for_workspace(
        point1: &Point,
        point2: &Point,
        fix: Option<&GpsFix>,
        heading: f64,
        observer: &str,
        user_id: &str,
    ) -> SurveyForm {
        let (camera_lat, camera_lng) = match fix {
            Some(fix) => (fix.latitude, fix.longitude),
            None => (point1.lat, point1.lon),
        };

        let mut form = SurveyForm::default();
        form.push("user_id", user_id.to_string());
        form.push("observer", observer.to_string());
        form.push("latitude", fmt_coord(point1.lat));
        form.push("longitude", fmt_coord(point1.lon));
        form.push("camera_lat", fmt_coord(camera_lat));
        form.push("camera_lng", fmt_coord(camera_lng));
        form.push("azimuth", (heading.round() as i32).to_string());
        form.push_point(PointSlot::One, Some(point1));
        form.push_point(PointSlot::Two, Some(point2));
        form
    }

    pub fn add_photo(&mut self, slot: PointSlot, bytes: Vec<u8>) {
        let field = match slot {
            PointSlot::One => "photo1",
            PointSlot::Two => "photo2",
        };
        self.photos.push(PhotoPart {
            field,
            file_name: format!("photo{}.jpg", slot.number()),
            bytes,
            mime: PHOTO_MIME,
        });
    }

    pub fn has_photos(&self) -> bool {
        !self.photos.is_empty()
    }

    /// Same fields, no photo parts.
    pub fn strip_photos(&self) -> SurveyForm {
        SurveyForm {
            fields: self.fields.clone(),
            photos: Vec::new(),
        }
    }

    pub fn field(&self, name: &str) -> Option<&str> {
        self.fields
            .iter()
            .find(|field| field.name == name)
            .map(|field| field.value.as_str())
    }

    fn push(&mut self, name: &'static str, value: String) {
        self.fields.push(FormField { name, value });
    }

    fn push_point(&mut self, slot: PointSlot, point: Option<&Point>) {
        let (distance, elevation) = match slot {
            PointSlot::One => ("distance1", "elevation1"),
            PointSlot::Two => ("distance2", "elevation2"),
        };
        self.push(distance, fmt_measure(point.and_then(|p| p.distance)));
        self.push(elevation, fmt_measure(point.and_then(|p| p.elevation)));
    }
}

fn fmt_coord(value: f64) -> String {
    format!("{value:.7}")
}

fn fmt_measure(value: Option<f64>) -> String {
    match value {
        Some(value) => format!("{value:.1}"),
        None => "0.0".to_string(),
    }
}
