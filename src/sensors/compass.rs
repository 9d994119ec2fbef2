use std::f64::consts::PI;

use anyhow::{Context, Result};
use log::debug;
use serde::Serialize;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Raw magnetometer vector in the device frame, microtesla.
#[derive(Debug, Clone, Copy)]
pub struct MagSample {
    pub x: f64,
    pub y: f64,
    pub z: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum CompassPoint {
    N,
    NE,
    E,
    SE,
    S,
    SW,
    W,
    NW,
}

const POINTS: [CompassPoint; 8] = [
    CompassPoint::N,
    CompassPoint::NE,
    CompassPoint::E,
    CompassPoint::SE,
    CompassPoint::S,
    CompassPoint::SW,
    CompassPoint::W,
    CompassPoint::NW,
];

impl CompassPoint {
    pub fn as_str(&self) -> &'static str {
        match self {
            CompassPoint::N => "N",
            CompassPoint::NE => "NE",
            CompassPoint::E => "E",
            CompassPoint::SE => "SE",
            CompassPoint::S => "S",
            CompassPoint::SW => "SW",
            CompassPoint::W => "W",
            CompassPoint::NW => "NW",
        }
    }

    /// 45-degree sectors centered on each label, so 23..=67 is NE and so on.
    pub fn from_heading(heading: f64) -> Self {
        let index = ((heading / 45.0).round() as i64).rem_euclid(8) as usize;
        POINTS[index]
    }
}

#[derive(Debug, Clone, Copy, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CompassReading {
    /// Degrees clockwise from magnetic north, rounded, in 0..360.
    pub heading: f64,
    pub direction: CompassPoint,
}

impl Default for CompassReading {
    fn default() -> Self {
        Self {
            heading: 0.0,
            direction: CompassPoint::N,
        }
    }
}

impl CompassReading {
    pub fn from_sample(sample: &MagSample) -> Self {
        let heading = heading_from_sample(sample).round() % 360.0;
        Self {
            heading,
            direction: CompassPoint::from_heading(heading),
        }
    }
}

/// Heading from the horizontal field components, normalized to [0, 360).
pub fn heading_from_sample(sample: &MagSample) -> f64 {
    let mut angle = sample.y.atan2(sample.x) * (180.0 / PI);
    if angle < 0.0 {
        angle += 360.0;
    }
    angle
}

/// Republishes magnetometer samples as compass readings on a watch channel.
/// Silence from the sensor means the last value stands; consumers never see
/// an error, only staleness.
pub struct CompassReconciler {
    rx: watch::Receiver<CompassReading>,
    handle: Option<JoinHandle<()>>,
    cancel: Option<CancellationToken>,
}

impl CompassReconciler {
    pub fn spawn(samples: mpsc::Receiver<MagSample>) -> Self {
        let (tx, rx) = watch::channel(CompassReading::default());
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(compass_loop(samples, tx, cancel.clone()));

        Self {
            rx,
            handle: Some(handle),
            cancel: Some(cancel),
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<CompassReading> {
        self.rx.clone()
    }

    pub fn latest(&self) -> CompassReading {
        *self.rx.borrow()
    }

    pub async fn shutdown(&mut self) -> Result<()> {
        if let Some(token) = self.cancel.take() {
            token.cancel();
        }
        if let Some(handle) = self.handle.take() {
            handle.await.context("compass worker failed to join")?;
        }
        Ok(())
    }
}

async fn compass_loop(
    mut samples: mpsc::Receiver<MagSample>,
    tx: watch::Sender<CompassReading>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                debug!("compass worker shutting down");
                break;
            }
            sample = samples.recv() => match sample {
                Some(sample) => {
                    let _ = tx.send(CompassReading::from_sample(&sample));
                }
                None => {
                    debug!("magnetometer stream closed");
                    break;
                }
            }
        }
    }
}
