use std::collections::HashMap;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use btleplug::api::{
    Central, CentralEvent, CentralState, Characteristic, Manager as _, Peripheral as _,
    ScanFilter, ValueNotification,
};
use btleplug::platform::{Adapter, Manager, Peripheral};
use futures_util::{Stream, StreamExt};
use log::{debug, info, warn};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::ble::profile::{self, Binding, BindingError};
use crate::ble::telemetry::{self, TelemetryFrame};
use crate::events::StationEvent;
use crate::reading::LiveReading;
use crate::sensors::compass::CompassReading;
use crate::sensors::location::GpsFix;

/// Session failures carry their own recovery guidance; every one of them
/// leaves the session back at idle.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("bluetooth stack unavailable: {0}")]
    StackUnavailable(String),
    #[error("bluetooth is powered off; turn it on and scan again")]
    PoweredOff,
    #[error("already connected to {0}; disconnect before scanning again")]
    AlreadyConnected(String),
    #[error("a scan or connection attempt is already in progress")]
    Busy,
    #[error("scan failed: {0}")]
    ScanFailed(String),
    #[error("device {0} is not in the scan results; scan again first")]
    UnknownDevice(String),
    #[error("could not connect to {name}: {detail}")]
    ConnectFailed { name: String, detail: String },
    #[error("{name} exposes no services to bind")]
    NoCompatibleService { name: String },
    #[error("{name} has no characteristic to subscribe on")]
    NoCompatibleCharacteristic { name: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum LinkPhase {
    Idle,
    Scanning,
    Connecting,
    /// Services discovered and a binding resolved, subscription pending.
    Bound,
    Monitoring,
}

impl Default for LinkPhase {
    fn default() -> Self {
        LinkPhase::Idle
    }
}

impl LinkPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            LinkPhase::Idle => "idle",
            LinkPhase::Scanning => "scanning",
            LinkPhase::Connecting => "connecting",
            LinkPhase::Bound => "bound",
            LinkPhase::Monitoring => "monitoring",
        }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LinkState {
    pub phase: LinkPhase,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub device_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub device_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub binding: Option<Binding>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DiscoveredDevice {
    pub id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rssi: Option<i16>,
    pub services: Vec<Uuid>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectedLink {
    pub device_id: String,
    pub device_name: String,
    pub binding: Binding,
}

#[derive(Debug, Clone)]
pub enum ScanOutcome {
    Connected(ConnectedLink),
    /// The window elapsed without a recognized station; everything seen is
    /// handed back (strongest signal first) for manual selection.
    NoMatch(Vec<DiscoveredDevice>),
}

#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub scan_window: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            scan_window: Duration::from_secs(30),
        }
    }
}

/// Everything the telemetry monitor needs besides the notification stream:
/// the shared live reading, the latest-value sensor channels and the event
/// sink.
#[derive(Clone)]
pub struct MonitorDeps {
    pub reading: Arc<Mutex<LiveReading>>,
    pub compass: watch::Receiver<CompassReading>,
    pub gps: watch::Receiver<Option<GpsFix>>,
    pub events: mpsc::UnboundedSender<StationEvent>,
}

type NotificationStream = Pin<Box<dyn Stream<Item = ValueNotification> + Send>>;

/// Single-session BLE central: scans, connects, binds the telemetry
/// characteristic and runs one monitor task for the life of the link.
pub struct BleSessionManager {
    config: SessionConfig,
    adapter: Option<Adapter>,
    state: Arc<Mutex<LinkState>>,
    peripheral: Option<Peripheral>,
    subscribed: Option<Characteristic>,
    monitor: Option<JoinHandle<()>>,
    cancel: Option<CancellationToken>,
    discovered: Vec<DiscoveredDevice>,
    handles: HashMap<String, Peripheral>,
    deps: MonitorDeps,
}

impl BleSessionManager {
    pub fn new(config: SessionConfig, deps: MonitorDeps) -> Self {
        Self {
            config,
            adapter: None,
            state: Arc::new(Mutex::new(LinkState::default())),
            peripheral: None,
            subscribed: None,
            monitor: None,
            cancel: None,
            discovered: Vec::new(),
            handles: HashMap::new(),
            deps,
        }
    }

    pub async fn link_state(&self) -> LinkState {
        self.state.lock().await.clone()
    }

    pub fn devices(&self) -> &[DiscoveredDevice] {
        &self.discovered
    }

    /// Scans until a recognized station advertises, then connects to it.
    pub async fn scan_and_connect(&mut self) -> Result<ScanOutcome, SessionError> {
        self.verify_link().await;
        self.guard_idle().await?;
        let adapter = self.ensure_adapter().await?;

        self.state.lock().await.phase = LinkPhase::Scanning;
        self.discovered.clear();
        self.handles.clear();

        let result = self.run_scan(&adapter).await;
        if let Err(err) = adapter.stop_scan().await {
            debug!("stop_scan failed: {err}");
        }

        let target = match result {
            Ok(target) => target,
            Err(err) => {
                self.state.lock().await.phase = LinkPhase::Idle;
                return Err(err);
            }
        };
        let Some(target) = target else {
            self.state.lock().await.phase = LinkPhase::Idle;
            info!(
                "scan window elapsed: {} device(s), none recognized",
                self.discovered.len()
            );
            let _ = self.deps.events.send(StationEvent::ScanWindowElapsed {
                device_count: self.discovered.len(),
            });
            return Ok(ScanOutcome::NoMatch(self.discovered.clone()));
        };

        self.establish(target).await.map(ScanOutcome::Connected)
    }

    /// Manual fallback: connect to one of the devices retained by the last
    /// scan.
    pub async fn connect_to(&mut self, device_id: &str) -> Result<ConnectedLink, SessionError> {
        self.verify_link().await;
        self.guard_idle().await?;
        self.ensure_adapter().await?;

        let peripheral = self
            .handles
            .get(device_id)
            .cloned()
            .ok_or_else(|| SessionError::UnknownDevice(device_id.to_string()))?;
        self.establish(peripheral).await
    }

    /// Operator-initiated teardown. Errors from the peripheral on the way
    /// down are expected noise and only logged.
    pub async fn disconnect(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel.cancel();
        }
        if let Some(handle) = self.monitor.take() {
            if let Err(err) = handle.await {
                warn!("telemetry monitor task failed: {err}");
            }
        }

        let device_name = self.state.lock().await.device_name.clone();
        if let (Some(peripheral), Some(characteristic)) = (&self.peripheral, &self.subscribed) {
            if let Err(err) = peripheral.unsubscribe(characteristic).await {
                debug!("unsubscribe failed: {err}");
            }
        }
        if let Some(peripheral) = self.peripheral.take() {
            if let Err(err) = peripheral.disconnect().await {
                debug!("disconnect returned an error: {err}");
            }
        }
        self.subscribed = None;

        *self.state.lock().await = LinkState::default();
        *self.deps.reading.lock().await = LiveReading::default();

        if let Some(device_name) = device_name {
            info!("disconnected from {device_name}");
            let _ = self.deps.events.send(StationEvent::Disconnected {
                device_name,
                unsolicited: false,
            });
        }
    }

    /// A connected flag can outlive the physical link. Check the peripheral
    /// and quietly reset when it no longer agrees.
    async fn verify_link(&mut self) {
        let Some(peripheral) = &self.peripheral else {
            return;
        };
        if peripheral.is_connected().await.unwrap_or(false) {
            return;
        }
        debug!("stale link state detected; resetting");
        if let Some(cancel) = self.cancel.take() {
            cancel.cancel();
        }
        if let Some(handle) = self.monitor.take() {
            let _ = handle.await;
        }
        self.peripheral = None;
        self.subscribed = None;
        *self.state.lock().await = LinkState::default();
        *self.deps.reading.lock().await = LiveReading::default();
    }

    async fn guard_idle(&self) -> Result<(), SessionError> {
        let state = self.state.lock().await;
        match state.phase {
            LinkPhase::Idle => Ok(()),
            LinkPhase::Monitoring => Err(SessionError::AlreadyConnected(
                state
                    .device_name
                    .clone()
                    .unwrap_or_else(|| "a station".to_string()),
            )),
            _ => Err(SessionError::Busy),
        }
    }

    async fn ensure_adapter(&mut self) -> Result<Adapter, SessionError> {
        let adapter = match self.adapter.clone() {
            Some(adapter) => adapter,
            None => {
                let manager = Manager::new()
                    .await
                    .map_err(|err| SessionError::StackUnavailable(err.to_string()))?;
                let adapter = manager
                    .adapters()
                    .await
                    .map_err(|err| SessionError::StackUnavailable(err.to_string()))?
                    .into_iter()
                    .next()
                    .ok_or_else(|| {
                        SessionError::StackUnavailable("no bluetooth adapter present".to_string())
                    })?;
                info!("bluetooth adapter ready");
                self.adapter = Some(adapter.clone());
                adapter
            }
        };

        match adapter.adapter_state().await {
            Ok(CentralState::PoweredOn) => Ok(adapter),
            Ok(_) => Err(SessionError::PoweredOff),
            Err(err) => {
                // Some backends cannot report power state; proceed and let
                // the scan surface the real failure.
                warn!("could not read adapter state: {err}");
                Ok(adapter)
            }
        }
    }

    async fn run_scan(&mut self, adapter: &Adapter) -> Result<Option<Peripheral>, SessionError> {
        let mut events = adapter
            .events()
            .await
            .map_err(|err| SessionError::ScanFailed(err.to_string()))?;
        adapter
            .start_scan(ScanFilter::default())
            .await
            .map_err(|err| SessionError::ScanFailed(err.to_string()))?;
        info!(
            "scanning for stations ({}s window)",
            self.config.scan_window.as_secs()
        );

        let deadline = tokio::time::sleep(self.config.scan_window);
        tokio::pin!(deadline);

        loop {
            tokio::select! {
                _ = &mut deadline => return Ok(None),
                event = events.next() => {
                    let Some(event) = event else { return Ok(None) };
                    let id = match event {
                        CentralEvent::DeviceDiscovered(id) | CentralEvent::DeviceUpdated(id) => id,
                        _ => continue,
                    };
                    let Ok(peripheral) = adapter.peripheral(&id).await else { continue };
                    if self.inspect(&peripheral).await {
                        return Ok(Some(peripheral));
                    }
                }
            }
        }
    }

    /// Records the device in the scan results and reports whether it
    /// advertises like a landslide station.
    async fn inspect(&mut self, peripheral: &Peripheral) -> bool {
        let properties = match peripheral.properties().await {
            Ok(Some(properties)) => properties,
            _ => return false,
        };
        let id = peripheral.address().to_string();
        self.handles.insert(id.clone(), peripheral.clone());
        self.upsert_discovered(DiscoveredDevice {
            id,
            name: properties.local_name.clone(),
            rssi: properties.rssi,
            services: properties.services.clone(),
        });
        profile::advertisement_matches(properties.local_name.as_deref(), &properties.services)
    }

    fn upsert_discovered(&mut self, device: DiscoveredDevice) {
        match self.discovered.iter_mut().find(|seen| seen.id == device.id) {
            Some(existing) => *existing = device.clone(),
            None => {
                debug!(
                    "found {} ({})",
                    device.name.as_deref().unwrap_or("unnamed"),
                    device.id
                );
                self.discovered.push(device.clone());
            }
        }
        self.discovered
            .sort_by_key(|seen| std::cmp::Reverse(seen.rssi.unwrap_or(i16::MIN)));
        let _ = self.deps.events.send(StationEvent::DeviceDiscovered(device));
    }

    async fn establish(&mut self, peripheral: Peripheral) -> Result<ConnectedLink, SessionError> {
        let device_id = peripheral.address().to_string();
        let device_name = match peripheral.properties().await {
            Ok(Some(properties)) => properties.local_name.unwrap_or_else(|| device_id.clone()),
            _ => device_id.clone(),
        };
        {
            let mut state = self.state.lock().await;
            state.phase = LinkPhase::Connecting;
            state.device_id = Some(device_id.clone());
            state.device_name = Some(device_name.clone());
        }
        info!("connecting to {device_name} ({device_id})");

        if let Err(err) = peripheral.connect().await {
            self.reset_state().await;
            return Err(SessionError::ConnectFailed {
                name: device_name,
                detail: err.to_string(),
            });
        }
        if let Err(err) = peripheral.discover_services().await {
            let _ = peripheral.disconnect().await;
            self.reset_state().await;
            return Err(SessionError::ConnectFailed {
                name: device_name,
                detail: err.to_string(),
            });
        }

        let resolved = match profile::resolve_binding(&peripheral.services()) {
            Ok(resolved) => resolved,
            Err(err) => {
                let _ = peripheral.disconnect().await;
                self.reset_state().await;
                return Err(match err {
                    BindingError::NoServices => SessionError::NoCompatibleService {
                        name: device_name,
                    },
                    BindingError::NoCharacteristics { .. } => {
                        SessionError::NoCompatibleCharacteristic { name: device_name }
                    }
                });
            }
        };
        if !resolved.binding.is_exact() {
            warn!(
                "{device_name} does not advertise the known telemetry profile; binding degraded to service {} characteristic {}",
                resolved.binding.service, resolved.binding.characteristic
            );
        }
        {
            let mut state = self.state.lock().await;
            state.phase = LinkPhase::Bound;
            state.binding = Some(resolved.binding);
        }

        let notifications = match peripheral.notifications().await {
            Ok(notifications) => notifications,
            Err(err) => {
                let _ = peripheral.disconnect().await;
                self.reset_state().await;
                return Err(SessionError::ConnectFailed {
                    name: device_name,
                    detail: err.to_string(),
                });
            }
        };
        if let Err(err) = peripheral.subscribe(&resolved.characteristic).await {
            let _ = peripheral.disconnect().await;
            self.reset_state().await;
            return Err(SessionError::ConnectFailed {
                name: device_name,
                detail: err.to_string(),
            });
        }

        let cancel = CancellationToken::new();
        let handle = tokio::spawn(monitor_loop(
            notifications,
            resolved.characteristic.uuid,
            device_name.clone(),
            self.deps.clone(),
            self.state.clone(),
            cancel.clone(),
        ));

        self.peripheral = Some(peripheral);
        self.subscribed = Some(resolved.characteristic);
        self.cancel = Some(cancel);
        self.monitor = Some(handle);
        self.state.lock().await.phase = LinkPhase::Monitoring;

        info!("monitoring telemetry from {device_name}");
        let _ = self.deps.events.send(StationEvent::Connected {
            device_name: device_name.clone(),
            binding: resolved.binding,
        });
        Ok(ConnectedLink {
            device_id,
            device_name,
            binding: resolved.binding,
        })
    }

    async fn reset_state(&mut self) {
        *self.state.lock().await = LinkState::default();
    }
}

/// Consumes the notification stream until cancelled or the link drops.
/// Stream exhaustion without cancellation is an unsolicited loss: the
/// reading is cleared and the disconnect reported.
async fn monitor_loop(
    mut notifications: NotificationStream,
    characteristic: Uuid,
    device_name: String,
    deps: MonitorDeps,
    state: Arc<Mutex<LinkState>>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                debug!("telemetry monitor cancelled");
                return;
            }
            notification = notifications.next() => {
                match notification {
                    Some(notification) => {
                        if notification.uuid != characteristic {
                            continue;
                        }
                        handle_notification(&notification.value, &deps).await;
                    }
                    None => {
                        warn!("link to {device_name} lost");
                        *deps.reading.lock().await = LiveReading::default();
                        *state.lock().await = LinkState::default();
                        let _ = deps.events.send(StationEvent::Disconnected {
                            device_name,
                            unsolicited: true,
                        });
                        return;
                    }
                }
            }
        }
    }
}

async fn handle_notification(payload: &[u8], deps: &MonitorDeps) {
    let Some(frame) = telemetry::decode(payload) else {
        return;
    };
    let fields = match frame {
        TelemetryFrame::EndOfBurst => {
            debug!("end of telemetry burst");
            return;
        }
        TelemetryFrame::Fields(fields) if fields.is_empty() => return,
        TelemetryFrame::Fields(fields) => fields,
    };

    let heading = deps.compass.borrow().heading;
    let fix = *deps.gps.borrow();

    let mut guard = deps.reading.lock().await;
    let next = LiveReading::merge(&guard, &fields, fix.as_ref(), heading);
    *guard = next.clone();
    drop(guard);

    let _ = deps.events.send(StationEvent::ReadingUpdated(next));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sensors::compass::CompassPoint;
    use uuid::uuid;

    fn deps() -> (
        MonitorDeps,
        watch::Sender<CompassReading>,
        watch::Sender<Option<GpsFix>>,
        mpsc::UnboundedReceiver<StationEvent>,
    ) {
        let (compass_tx, compass_rx) = watch::channel(CompassReading::default());
        let (gps_tx, gps_rx) = watch::channel(None);
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let deps = MonitorDeps {
            reading: Arc::new(Mutex::new(LiveReading::default())),
            compass: compass_rx,
            gps: gps_rx,
            events: events_tx,
        };
        (deps, compass_tx, gps_tx, events_rx)
    }

    fn device(id: &str, rssi: Option<i16>) -> DiscoveredDevice {
        DiscoveredDevice {
            id: id.to_string(),
            name: None,
            rssi,
            services: Vec::new(),
        }
    }

    #[tokio::test]
    async fn scan_results_stay_sorted_by_signal_strength() {
        let (deps, _compass, _gps, mut events) = deps();
        let mut session = BleSessionManager::new(SessionConfig::default(), deps);

        session.upsert_discovered(device("aa", Some(-80)));
        session.upsert_discovered(device("bb", Some(-40)));
        session.upsert_discovered(device("cc", None));
        session.upsert_discovered(device("aa", Some(-30)));

        let ids: Vec<&str> = session.devices().iter().map(|d| d.id.as_str()).collect();
        assert_eq!(ids, vec!["aa", "bb", "cc"]);
        assert_eq!(session.devices().len(), 3);

        // One event per sighting, including the refresh.
        let mut seen = 0;
        while events.try_recv().is_ok() {
            seen += 1;
        }
        assert_eq!(seen, 4);
    }

    #[tokio::test]
    async fn notifications_fold_into_the_shared_reading() {
        let (deps, compass, _gps, mut events) = deps();
        compass
            .send(CompassReading {
                heading: 90.0,
                direction: CompassPoint::E,
            })
            .unwrap();

        handle_notification(b"elevation:12.5", &deps).await;

        let reading = deps.reading.lock().await.clone();
        assert_eq!(reading.elevation, Some(12.5));
        assert_eq!(reading.azimuth, 90);
        assert!(matches!(
            events.try_recv(),
            Ok(StationEvent::ReadingUpdated(_))
        ));

        // A peripheral azimuth frame is recognized but must not disturb the
        // reading or notify anyone.
        handle_notification(b"azimuth:123", &deps).await;
        assert_eq!(deps.reading.lock().await.clone(), reading);
        assert!(events.try_recv().is_err());

        // Burst markers are a no-op too.
        handle_notification(b"END", &deps).await;
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn stream_exhaustion_reports_an_unsolicited_disconnect() {
        let (deps, _compass, _gps, mut events) = deps();
        let state = Arc::new(Mutex::new(LinkState {
            phase: LinkPhase::Monitoring,
            device_id: Some("aa".to_string()),
            device_name: Some("LandslideMonitor".to_string()),
            binding: None,
        }));
        let characteristic = uuid!("beb5483e-36e1-4688-b7f5-ea07361b26a8");

        let stream: NotificationStream = Box::pin(futures_util::stream::iter(vec![
            ValueNotification {
                uuid: characteristic,
                value: b"distance:4.2".to_vec(),
            },
            // Wrong characteristic: skipped without decoding.
            ValueNotification {
                uuid: uuid!("00000000-0000-0000-0000-000000000000"),
                value: b"distance:9.9".to_vec(),
            },
        ]));

        monitor_loop(
            stream,
            characteristic,
            "LandslideMonitor".to_string(),
            deps.clone(),
            state.clone(),
            CancellationToken::new(),
        )
        .await;

        // The distance arrived, then the loss wiped the reading and state.
        let mut updated = false;
        let mut disconnected = false;
        while let Ok(event) = events.try_recv() {
            match event {
                StationEvent::ReadingUpdated(reading) => {
                    assert_eq!(reading.distance, Some(4.2));
                    updated = true;
                }
                StationEvent::Disconnected {
                    device_name,
                    unsolicited,
                } => {
                    assert_eq!(device_name, "LandslideMonitor");
                    assert!(unsolicited);
                    disconnected = true;
                }
                other => panic!("unexpected event: {other:?}"),
            }
        }
        assert!(updated && disconnected);
        assert!(deps.reading.lock().await.is_empty());
        assert_eq!(state.lock().await.phase, LinkPhase::Idle);
    }

    #[test]
    fn phases_have_wire_names() {
        assert_eq!(LinkPhase::default().as_str(), "idle");
        assert_eq!(LinkPhase::Monitoring.as_str(), "monitoring");
    }
}
