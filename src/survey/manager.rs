use anyhow::Result;
use chrono::Utc;
use log::{debug, error, info, warn};
use serde::Serialize;

use crate::sensors::location::GpsFix;
use crate::store::Store;
use crate::survey::model::{AreaLocation, PhotoRef, Point, PointSlot, SurveyArea};

/// Storage key for the whole area collection; every mutation rewrites it.
pub const AREAS_KEY: &str = "surveyAreas";

/// Observer name used when the operator leaves the field blank.
pub const DEFAULT_OBSERVER: &str = "Rangwat";

/// Transient capture state used outside (and alongside) an active survey:
/// the two loose point slots, their current main photo, and the full photo
/// history per slot.
#[derive(Debug, Clone, Default)]
pub struct Workspace {
    pub point1: Option<Point>,
    pub point2: Option<Point>,
    pub photo1: Option<PhotoRef>,
    pub photo2: Option<PhotoRef>,
    pub photo1_history: Vec<PhotoRef>,
    pub photo2_history: Vec<PhotoRef>,
}

impl Workspace {
    pub fn point(&self, slot: PointSlot) -> Option<&Point> {
        match slot {
            PointSlot::One => self.point1.as_ref(),
            PointSlot::Two => self.point2.as_ref(),
        }
    }

    pub fn photo(&self, slot: PointSlot) -> Option<&PhotoRef> {
        match slot {
            PointSlot::One => self.photo1.as_ref(),
            PointSlot::Two => self.photo2.as_ref(),
        }
    }

    pub fn photo_history(&self, slot: PointSlot) -> &[PhotoRef] {
        match slot {
            PointSlot::One => &self.photo1_history,
            PointSlot::Two => &self.photo2_history,
        }
    }

    pub fn both_points(&self) -> bool {
        self.point1.is_some() && self.point2.is_some()
    }

    fn set_point(&mut self, slot: PointSlot, point: Point) {
        match slot {
            PointSlot::One => self.point1 = Some(point),
            PointSlot::Two => self.point2 = Some(point),
        }
    }

    fn add_photo(&mut self, slot: PointSlot, photo: PhotoRef) {
        match slot {
            PointSlot::One => {
                self.photo1 = Some(photo.clone());
                self.photo1_history.push(photo);
            }
            PointSlot::Two => {
                self.photo2 = Some(photo.clone());
                self.photo2_history.push(photo);
            }
        }
    }

    fn clear(&mut self) {
        *self = Workspace::default();
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum PointSaved {
    /// Captured into the loose workspace only.
    Loose { slot: PointSlot },
    /// Captured into the active survey area (and mirrored to the workspace).
    IntoArea { slot: PointSlot, area_id: String },
}

#[derive(Debug, Clone, PartialEq)]
pub enum FinishOutcome {
    NoActiveSurvey,
    /// Both points are required before an area can be closed out.
    Incomplete,
    Finished { area_id: String },
}

/// Owns the survey area collection and the loose capture workspace. All
/// mutations are write-through: in-memory state is the source of truth and
/// the store is updated best-effort right after (failures are logged, never
/// rolled back).
pub struct AreaManager {
    store: Store,
    areas: Vec<SurveyArea>,
    workspace: Workspace,
}

impl AreaManager {
    /// Restores the collection and the loose workspace from the store.
    /// Unreadable entries load as absent rather than failing startup.
    pub async fn load(store: Store) -> Result<Self> {
        let areas: Vec<SurveyArea> = store.get_json(AREAS_KEY).await?.unwrap_or_default();

        let mut workspace = Workspace::default();
        workspace.point1 = store.get_json(PointSlot::One.point_key()).await?;
        workspace.point2 = store.get_json(PointSlot::Two.point_key()).await?;
        workspace.photo1 = store.get_json(PointSlot::One.photo_key()).await?;
        workspace.photo2 = store.get_json(PointSlot::Two.photo_key()).await?;
        workspace.photo1_history = store
            .get_json(PointSlot::One.photo_list_key())
            .await?
            .unwrap_or_default();
        workspace.photo2_history = store
            .get_json(PointSlot::Two.photo_list_key())
            .await?
            .unwrap_or_default();

        info!("loaded {} survey area(s)", areas.len());
        Ok(Self {
            store,
            areas,
            workspace,
        })
    }

    pub fn areas(&self) -> &[SurveyArea] {
        &self.areas
    }

    pub fn workspace(&self) -> &Workspace {
        &self.workspace
    }

    pub fn active_area(&self) -> Option<&SurveyArea> {
        self.areas.iter().find(|area| area.is_active)
    }

    pub fn area(&self, area_id: &str) -> Option<&SurveyArea> {
        self.areas.iter().find(|area| area.id == area_id)
    }

    /// Starts a new survey: deactivates any current survey, creates an empty
    /// active area at the current position, and resets the loose workspace.
    pub async fn create_area(
        &mut self,
        name: &str,
        observer: &str,
        fix: Option<&GpsFix>,
    ) -> String {
        let name = non_blank(name).unwrap_or_else(|| self.next_default_name());
        let observer = non_blank(observer).unwrap_or_else(|| DEFAULT_OBSERVER.to_string());

        for area in &mut self.areas {
            area.is_active = false;
        }

        let id = next_area_id(&self.areas, Utc::now().timestamp_millis());
        let location = fix.map(area_location).unwrap_or_else(AreaLocation::zero);
        let area = SurveyArea::new(id.clone(), name, observer, location);
        info!("starting survey '{}' ({})", area.name, area.id);
        self.areas.push(area);

        self.clear_workspace().await;
        self.persist_areas().await;
        id
    }

    /// Promotes the two loose points into a new, inactive area. Photos come
    /// from the store first (the most recently persisted ones win), then
    /// from in-memory state. Without a GPS fix the area sits at point 1's
    /// coordinates. Returns `None` while either point is missing.
    pub async fn save_workspace_as_area(
        &mut self,
        name: &str,
        observer: &str,
        fix: Option<&GpsFix>,
    ) -> Option<String> {
        if !self.workspace.both_points() {
            return None;
        }

        let photo1 = self
            .read_stored_photo(PointSlot::One)
            .await
            .or_else(|| self.workspace.photo1.clone());
        let photo2 = self
            .read_stored_photo(PointSlot::Two)
            .await
            .or_else(|| self.workspace.photo2.clone());

        let mut point1 = self.workspace.point1.clone()?;
        let mut point2 = self.workspace.point2.clone()?;
        point1.has_image = photo1.is_some();
        point2.has_image = photo2.is_some();

        let name = non_blank(name).unwrap_or_else(|| self.next_default_name());
        let observer = non_blank(observer).unwrap_or_else(|| DEFAULT_OBSERVER.to_string());
        let id = next_area_id(&self.areas, Utc::now().timestamp_millis());
        let location = match fix {
            Some(fix) => area_location(fix),
            None => AreaLocation {
                latitude: point1.lat,
                longitude: point1.lon,
                altitude: 0.0,
            },
        };

        let mut area = SurveyArea::new(id.clone(), name, observer, location);
        area.azimuth = point1.azimuth;
        area.is_active = false;
        area.points.set(PointSlot::One, point1);
        area.points.set(PointSlot::Two, point2);
        area.images.set(PointSlot::One, photo1);
        area.images.set(PointSlot::Two, photo2);

        info!("saved loose points as area '{}' ({})", area.name, area.id);
        self.areas.push(area);

        self.clear_workspace().await;
        self.persist_areas().await;
        Some(id)
    }

    /// One capture path for both modes: the point always lands in its loose
    /// workspace slot (and its storage key); with an active survey it is
    /// also assigned into that area.
    pub async fn record_point(&mut self, point: Point, fix: Option<&GpsFix>) -> PointSaved {
        let slot = point.point_number;
        self.workspace.set_point(slot, point.clone());
        self.persist_value(slot.point_key(), &point).await;

        let Some(area_id) = self.active_area().map(|area| area.id.clone()) else {
            return PointSaved::Loose { slot };
        };

        let photo = self.workspace.photo(slot).cloned();
        self.save_point_to_area(&area_id, point, photo, fix).await;
        PointSaved::IntoArea { slot, area_id }
    }

    /// Assigns a point (and its photo, when one exists) into an area,
    /// refreshing the area's location and azimuth to the capture. Returns
    /// false when the area is gone.
    pub async fn save_point_to_area(
        &mut self,
        area_id: &str,
        mut point: Point,
        photo: Option<PhotoRef>,
        fix: Option<&GpsFix>,
    ) -> bool {
        let Some(area) = self.areas.iter_mut().find(|area| area.id == area_id) else {
            warn!("point capture targeted missing area {area_id}");
            return false;
        };

        let slot = point.point_number;
        point.has_image = photo.is_some();
        area.azimuth = point.azimuth;
        if let Some(fix) = fix {
            area.location = area_location(fix);
        }
        area.images.set(slot, photo);
        area.points.set(slot, point);

        self.persist_areas().await;
        true
    }

    /// Stores a new photo for the slot: it becomes the slot's main photo,
    /// joins the history, and back-fills the active area when the survey is
    /// already running. Returns true when an area picked it up.
    pub async fn attach_photo(&mut self, slot: PointSlot, photo: PhotoRef) -> bool {
        self.workspace.add_photo(slot, photo.clone());
        self.persist_value(slot.photo_key(), &photo).await;
        self.persist_value(slot.photo_list_key(), &self.workspace.photo_history(slot).to_vec())
            .await;

        let Some(area_id) = self.active_area().map(|area| area.id.clone()) else {
            return false;
        };
        let Some(area) = self.areas.iter_mut().find(|area| area.id == area_id) else {
            return false;
        };

        area.images.set(slot, Some(photo));
        if let Some(point) = area.points.get_mut(slot) {
            point.has_image = true;
        }
        self.persist_areas().await;
        true
    }

    /// Closes out the active survey. Photo presence is re-derived from the
    /// latest persisted photos so a photo taken after the point snapshot
    /// still counts, then the loose workspace is consumed the same way a
    /// promotion consumes it.
    pub async fn finish_active(&mut self) -> FinishOutcome {
        let Some(index) = self.areas.iter().position(|area| area.is_active) else {
            return FinishOutcome::NoActiveSurvey;
        };
        if !self.areas[index].is_complete() {
            return FinishOutcome::Incomplete;
        }

        let stored1 = self.read_stored_photo(PointSlot::One).await;
        let stored2 = self.read_stored_photo(PointSlot::Two).await;

        let area = &mut self.areas[index];
        for (slot, stored) in [(PointSlot::One, stored1), (PointSlot::Two, stored2)] {
            let resolved = stored.or_else(|| area.images.get(slot).cloned());
            let present = resolved.is_some();
            area.images.set(slot, resolved);
            if let Some(point) = area.points.get_mut(slot) {
                point.has_image = present;
            }
        }
        area.is_active = false;
        let area_id = area.id.clone();
        info!("finished survey '{}' ({})", area.name, area_id);

        self.clear_workspace().await;
        self.persist_areas().await;
        FinishOutcome::Finished { area_id }
    }

    pub async fn mark_submitted(&mut self, area_id: &str) -> bool {
        let Some(area) = self.areas.iter_mut().find(|area| area.id == area_id) else {
            return false;
        };
        area.is_submitted = true;
        area.submitted_at = Some(Utc::now());
        self.persist_areas().await;
        true
    }

    /// Removes an area. Deleting an unknown id is a no-op, not an error.
    pub async fn delete_area(&mut self, area_id: &str) {
        let before = self.areas.len();
        self.areas.retain(|area| area.id != area_id);
        if self.areas.len() == before {
            debug!("delete of unknown area {area_id} ignored");
        } else {
            info!("deleted area {area_id}");
        }
        self.persist_areas().await;
    }

    pub async fn clear_all(&mut self) {
        info!("clearing all {} survey area(s)", self.areas.len());
        self.areas.clear();
        self.persist_areas().await;
    }

    fn next_default_name(&self) -> String {
        format!("Area {}", self.areas.len() + 1)
    }

    async fn clear_workspace(&mut self) {
        self.workspace.clear();
        for slot in [PointSlot::One, PointSlot::Two] {
            for key in [slot.point_key(), slot.photo_key(), slot.photo_list_key()] {
                if let Err(err) = self.store.delete(key).await {
                    warn!("failed to clear stored key '{key}': {err:#}");
                }
            }
        }
    }

    async fn read_stored_photo(&self, slot: PointSlot) -> Option<PhotoRef> {
        match self.store.get_json(slot.photo_key()).await {
            Ok(photo) => photo,
            Err(err) => {
                warn!("could not read stored photo for slot {}: {err:#}", slot.number());
                None
            }
        }
    }

    async fn persist_areas(&self) {
        if let Err(err) = self.store.set_json(AREAS_KEY, &self.areas).await {
            error!("failed to persist survey areas: {err:#}");
        }
    }

    async fn persist_value<T: Serialize>(&self, key: &str, value: &T) {
        if let Err(err) = self.store.set_json(key, value).await {
            error!("failed to persist '{key}': {err:#}");
        }
    }
}

fn non_blank(value: &str) -> Option<String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

fn area_location(fix: &GpsFix) -> AreaLocation {
    AreaLocation {
        latitude: fix.latitude,
        longitude: fix.longitude,
        altitude: fix.altitude.unwrap_or(0.0),
    }
}

/// Time-derived area id. Two areas minted in the same millisecond bump the
/// second one forward until the id is free in the collection.
fn next_area_id(areas: &[SurveyArea], now_millis: i64) -> String {
    let mut millis = now_millis;
    loop {
        let id = format!("area_{millis}");
        if areas.iter().all(|area| area.id != id) {
            return id;
        }
        millis += 1;
    }
}
