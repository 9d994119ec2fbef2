use std::sync::Arc;

use anyhow::Result;
use log::info;
use tokio::sync::{mpsc, watch, Mutex};
use tokio_util::sync::CancellationToken;

use crate::ble::session::{
    BleSessionManager, ConnectedLink, DiscoveredDevice, LinkState, MonitorDeps, ScanOutcome,
    SessionConfig, SessionError,
};
use crate::events::StationEvent;
use crate::reading::LiveReading;
use crate::sensors::compass::{CompassReading, CompassReconciler, MagSample};
use crate::sensors::location::{GpsFix, LocationSource, LocationTracker};
use crate::store::Store;
use crate::survey::manager::{AreaManager, FinishOutcome, PointSaved, Workspace, DEFAULT_OBSERVER};
use crate::survey::model::{PhotoRef, Point, PointSlot, SurveyArea};
use crate::upload::pipeline::{
    spawn_connectivity_monitor, UploadConfig, UploadError, UploadPipeline, UploadReceipt,
};
use crate::upload::transport::Transport;

#[derive(Debug, Clone, Default)]
pub struct StationConfig {
    pub session: SessionConfig,
    pub upload: UploadConfig,
}

#[derive(Debug, Clone, PartialEq)]
pub enum CaptureOutcome {
    /// The live reading was empty; nothing was persisted.
    NoData,
    Saved {
        slot: PointSlot,
        /// Set when the point also landed in the active survey area.
        area_id: Option<String>,
    },
}

#[derive(Debug)]
pub enum SubmitOutcome {
    Submitted(UploadReceipt),
    NotFound,
    Incomplete,
}

/// The one object a frontend talks to. Owns the BLE session, both sensor
/// workers, the survey collection and the uploader, and pushes every
/// noteworthy change out through the event channel handed back by `new`.
pub struct FieldStation {
    reading: Arc<Mutex<LiveReading>>,
    session: BleSessionManager,
    compass: CompassReconciler,
    location: LocationTracker,
    areas: AreaManager,
    uploader: UploadPipeline,
    events: mpsc::UnboundedSender<StationEvent>,
    online: watch::Receiver<bool>,
    connectivity_cancel: CancellationToken,
    current_slot: PointSlot,
}

impl FieldStation {
    pub async fn new<S: LocationSource>(
        store: Store,
        compass_samples: mpsc::Receiver<MagSample>,
        location_source: S,
        transport: Arc<dyn Transport>,
        config: StationConfig,
    ) -> Result<(Self, mpsc::UnboundedReceiver<StationEvent>)> {
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        let compass = CompassReconciler::spawn(compass_samples);
        let location = LocationTracker::start(location_source).await?;

        let reading = Arc::new(Mutex::new(LiveReading::default()));
        let session = BleSessionManager::new(
            config.session,
            MonitorDeps {
                reading: reading.clone(),
                compass: compass.subscribe(),
                gps: location.subscribe(),
                events: events_tx.clone(),
            },
        );

        let areas = AreaManager::load(store).await?;

        let connectivity_cancel = CancellationToken::new();
        let online =
            spawn_connectivity_monitor(transport.clone(), &config.upload, connectivity_cancel.clone());
        let uploader = UploadPipeline::new(transport, config.upload);

        info!("field station ready");
        Ok((
            Self {
                reading,
                session,
                compass,
                location,
                areas,
                uploader,
                events: events_tx,
                online,
                connectivity_cancel,
                current_slot: PointSlot::One,
            },
            events_rx,
        ))
    }

    // --- BLE link ---

    pub async fn scan_and_connect(&mut self) -> Result<ScanOutcome, SessionError> {
        let result = self.session.scan_and_connect().await;
        if let Err(SessionError::AlreadyConnected(name)) = &result {
            let _ = self.events.send(StationEvent::Notice(format!(
                "already connected to {name}; disconnect first"
            )));
        }
        result
    }

    pub async fn connect_to(&mut self, device_id: &str) -> Result<ConnectedLink, SessionError> {
        self.session.connect_to(device_id).await
    }

    pub async fn disconnect(&mut self) {
        self.session.disconnect().await;
    }

    pub async fn link_state(&self) -> LinkState {
        self.session.link_state().await
    }

    pub fn devices(&self) -> &[DiscoveredDevice] {
        self.session.devices()
    }

    // --- Sensors ---

    pub async fn live_reading(&self) -> LiveReading {
        self.reading.lock().await.clone()
    }

    pub fn heading(&self) -> CompassReading {
        self.compass.latest()
    }

    pub fn gps(&self) -> Option<GpsFix> {
        self.location.latest()
    }

    // --- Point capture ---

    pub fn current_slot(&self) -> PointSlot {
        self.current_slot
    }

    pub fn set_slot(&mut self, slot: PointSlot) {
        self.current_slot = slot;
    }

    pub fn toggle_slot(&mut self) -> PointSlot {
        self.current_slot = self.current_slot.other();
        self.current_slot
    }

    /// Freezes the live reading into the given slot (default: the current
    /// one). An empty reading is refused with a notice instead of writing a
    /// zeroed point.
    pub async fn capture_point(&mut self, slot: Option<PointSlot>) -> CaptureOutcome {
        let slot = slot.unwrap_or(self.current_slot);
        let reading = self.reading.lock().await.clone();
        if reading.is_empty() {
            let _ = self.events.send(StationEvent::Notice(
                "no sensor data received yet; connect to a station first".to_string(),
            ));
            return CaptureOutcome::NoData;
        }

        // Re-reconcile against capture-time position and heading so the
        // snapshot is as fresh as the moment of the button press.
        let heading = self.compass.latest().heading;
        let fix = self.location.latest();
        let snapshot = LiveReading::merge(&reading, &[], fix.as_ref(), heading);

        let device_id = self
            .session
            .link_state()
            .await
            .device_id
            .unwrap_or_else(|| "unknown".to_string());
        let has_image = self.areas.workspace().photo(slot).is_some();
        let point = Point::from_reading(
            &snapshot,
            slot,
            fix.and_then(|f| f.accuracy),
            device_id,
            has_image,
        );

        let saved = self.areas.record_point(point, fix.as_ref()).await;
        let area_id = match saved {
            PointSaved::IntoArea { area_id, .. } => Some(area_id),
            PointSaved::Loose { .. } => None,
        };
        info!(
            "captured point {} ({})",
            slot.number(),
            area_id.as_deref().unwrap_or("loose")
        );
        CaptureOutcome::Saved { slot, area_id }
    }

    pub async fn attach_photo(&mut self, slot: Option<PointSlot>, photo: PhotoRef) -> bool {
        let slot = slot.unwrap_or(self.current_slot);
        self.areas.attach_photo(slot, photo).await
    }

    // --- Survey areas ---

    pub async fn start_survey(&mut self, name: &str, observer: &str) -> String {
        let fix = self.location.latest();
        let id = self.areas.create_area(name, observer, fix.as_ref()).await;
        self.emit_area_saved(&id);
        id
    }

    pub async fn save_workspace_as_area(&mut self, name: &str, observer: &str) -> Option<String> {
        let fix = self.location.latest();
        let id = self
            .areas
            .save_workspace_as_area(name, observer, fix.as_ref())
            .await?;
        self.emit_area_saved(&id);
        Some(id)
    }

    pub async fn finish_survey(&mut self) -> FinishOutcome {
        let outcome = self.areas.finish_active().await;
        if let FinishOutcome::Finished { area_id } = &outcome {
            self.current_slot = PointSlot::One;
            self.emit_area_saved(area_id);
        }
        outcome
    }

    pub async fn delete_area(&mut self, area_id: &str) {
        self.areas.delete_area(area_id).await;
    }

    pub async fn clear_areas(&mut self) {
        self.areas.clear_all().await;
    }

    pub fn areas(&self) -> &[SurveyArea] {
        self.areas.areas()
    }

    pub fn area(&self, area_id: &str) -> Option<&SurveyArea> {
        self.areas.area(area_id)
    }

    pub fn workspace(&self) -> &Workspace {
        self.areas.workspace()
    }

    // --- Upload ---

    pub async fn submit_area(&mut self, area_id: &str) -> Result<SubmitOutcome, UploadError> {
        let Some(area) = self.areas.area(area_id) else {
            return Ok(SubmitOutcome::NotFound);
        };
        if !area.is_complete() {
            return Ok(SubmitOutcome::Incomplete);
        }

        let receipt = self.uploader.submit_area(area).await?;
        self.areas.mark_submitted(area_id).await;
        info!("survey {area_id} submitted (status {})", receipt.status);
        let _ = self.events.send(StationEvent::Submitted {
            status: receipt.status,
            without_photos: receipt.without_photos,
        });
        Ok(SubmitOutcome::Submitted(receipt))
    }

    /// Legacy submission of the two loose workspace points. The observer
    /// field resolves to the active area's name when a survey is running,
    /// and the azimuth is read off the compass at this moment.
    pub async fn submit_workspace(&mut self) -> Result<SubmitOutcome, UploadError> {
        let workspace = self.areas.workspace();
        let (Some(point1), Some(point2)) = (workspace.point1.clone(), workspace.point2.clone())
        else {
            return Ok(SubmitOutcome::Incomplete);
        };
        let photo1 = workspace.photo1.clone();
        let photo2 = workspace.photo2.clone();
        let observer = self
            .areas
            .active_area()
            .map(|area| area.name.clone())
            .unwrap_or_else(|| DEFAULT_OBSERVER.to_string());

        let fix = self.location.latest();
        let heading = self.compass.latest().heading;
        let receipt = self
            .uploader
            .submit_workspace(
                &point1,
                &point2,
                photo1.as_ref(),
                photo2.as_ref(),
                fix.as_ref(),
                heading,
                &observer,
            )
            .await?;
        info!("loose points submitted (status {})", receipt.status);
        let _ = self.events.send(StationEvent::Submitted {
            status: receipt.status,
            without_photos: receipt.without_photos,
        });
        Ok(SubmitOutcome::Submitted(receipt))
    }

    /// Latest connectivity verdict from the background probe.
    pub fn online(&self) -> bool {
        *self.online.borrow()
    }

    pub async fn shutdown(&mut self) -> Result<()> {
        self.session.disconnect().await;
        self.connectivity_cancel.cancel();
        self.compass.shutdown().await?;
        self.location.shutdown().await?;
        info!("field station stopped");
        Ok(())
    }

    fn emit_area_saved(&self, area_id: &str) {
        if let Some(area) = self.areas.area(area_id) {
            let _ = self.events.send(StationEvent::AreaSaved {
                id: area.id.clone(),
                name: area.name.clone(),
            });
        }
    }
}
