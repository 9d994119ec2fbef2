use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GpsFix {
    pub latitude: f64,
    pub longitude: f64,
    pub altitude: Option<f64>,
    /// Horizontal accuracy radius in meters, when the platform reports one.
    pub accuracy: Option<f64>,
}

/// Navigation-grade watch settings: a new fix at least every 3 seconds or
/// whenever the carrier moves a meter, whichever comes first. Enforced by
/// the platform source.
#[derive(Debug, Clone, Copy)]
pub struct WatchProfile {
    pub min_interval: Duration,
    pub min_displacement_m: f64,
}

impl Default for WatchProfile {
    fn default() -> Self {
        Self {
            min_interval: Duration::from_secs(3),
            min_displacement_m: 1.0,
        }
    }
}

/// Platform seam for positioning. The real implementation talks to the OS
/// location service; harnesses and tests feed fixes by hand.
#[async_trait]
pub trait LocationSource: Send + 'static {
    /// Asks for foreground location permission. Called exactly once.
    async fn request_permission(&mut self) -> Result<bool>;

    /// Opens a continuous fix stream honoring `profile`.
    async fn watch(&mut self, profile: WatchProfile) -> Result<mpsc::Receiver<GpsFix>>;
}

/// Holds the latest fix for everyone who asks. Denied permission is not an
/// error: the tracker simply publishes `None` forever and consumers carry
/// on without coordinates.
pub struct LocationTracker {
    rx: watch::Receiver<Option<GpsFix>>,
    handle: Option<JoinHandle<()>>,
    cancel: Option<CancellationToken>,
}

impl LocationTracker {
    pub async fn start<S: LocationSource>(mut source: S) -> Result<Self> {
        let (tx, rx) = watch::channel(None);

        let granted = match source.request_permission().await {
            Ok(granted) => granted,
            Err(err) => {
                warn!("location permission request failed: {err:#}");
                false
            }
        };
        if !granted {
            warn!("location permission denied; fixes will stay empty");
            return Ok(Self {
                rx,
                handle: None,
                cancel: None,
            });
        }

        let fixes = source
            .watch(WatchProfile::default())
            .await
            .context("failed to start location watch")?;
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(location_loop(fixes, tx, cancel.clone()));

        Ok(Self {
            rx,
            handle: Some(handle),
            cancel: Some(cancel),
        })
    }

    pub fn subscribe(&self) -> watch::Receiver<Option<GpsFix>> {
        self.rx.clone()
    }

    pub fn latest(&self) -> Option<GpsFix> {
        *self.rx.borrow()
    }

    pub async fn shutdown(&mut self) -> Result<()> {
        if let Some(token) = self.cancel.take() {
            token.cancel();
        }
        if let Some(handle) = self.handle.take() {
            handle.await.context("location worker failed to join")?;
        }
        Ok(())
    }
}

async fn location_loop(
    mut fixes: mpsc::Receiver<GpsFix>,
    tx: watch::Sender<Option<GpsFix>>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                debug!("location worker shutting down");
                break;
            }
            fix = fixes.recv() => match fix {
                Some(fix) => {
                    let _ = tx.send(Some(fix));
                }
                None => {
                    debug!("location stream closed");
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::anyhow;

    struct TestSource {
        grant: bool,
        fixes: Option<mpsc::Receiver<GpsFix>>,
    }

    #[async_trait]
    impl LocationSource for TestSource {
        async fn request_permission(&mut self) -> Result<bool> {
            Ok(self.grant)
        }

        async fn watch(&mut self, _profile: WatchProfile) -> Result<mpsc::Receiver<GpsFix>> {
            self.fixes.take().ok_or_else(|| anyhow!("watch opened twice"))
        }
    }

    fn fix(lat: f64, lon: f64) -> GpsFix {
        GpsFix {
            latitude: lat,
            longitude: lon,
            altitude: Some(120.0),
            accuracy: Some(4.0),
        }
    }

    #[tokio::test]
    async fn denied_permission_leaves_fixes_empty() {
        let (_tx, rx) = mpsc::channel(1);
        let mut tracker = LocationTracker::start(TestSource {
            grant: false,
            fixes: Some(rx),
        })
        .await
        .unwrap();

        assert_eq!(tracker.latest(), None);
        tracker.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn publishes_the_latest_fix() {
        let (tx, rx) = mpsc::channel(4);
        let mut tracker = LocationTracker::start(TestSource {
            grant: true,
            fixes: Some(rx),
        })
        .await
        .unwrap();
        let mut updates = tracker.subscribe();

        tx.send(fix(17.5, 100.2)).await.unwrap();
        updates.changed().await.unwrap();
        assert_eq!(tracker.latest().unwrap().latitude, 17.5);

        tx.send(fix(17.6, 100.3)).await.unwrap();
        updates.changed().await.unwrap();
        assert_eq!(tracker.latest().unwrap().latitude, 17.6);

        tracker.shutdown().await.unwrap();
    }
}
