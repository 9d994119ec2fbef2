//! Line-oriented harness around the field station: sensors are fed by hand
//! (`gps`, `heading`), everything else drives the real stack. Station events
//! stream back as JSON lines prefixed with `<-`.

use std::sync::Arc;

use anyhow::{Context, Result};
use log::{error, LevelFilter};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;

use rawangphai_field::ble::session::ScanOutcome;
use rawangphai_field::sensors::compass::MagSample;
use rawangphai_field::sensors::location::{GpsFix, LocationSource, WatchProfile};
use rawangphai_field::station::{CaptureOutcome, FieldStation, StationConfig, SubmitOutcome};
use rawangphai_field::store::Store;
use rawangphai_field::survey::manager::FinishOutcome;
use rawangphai_field::survey::model::{PhotoRef, PointSlot};
use rawangphai_field::upload::transport::HttpTransport;

/// Feeds the fixes typed at the prompt into the location tracker.
struct ManualLocation {
    fixes: Option<mpsc::Receiver<GpsFix>>,
}

#[async_trait::async_trait]
impl LocationSource for ManualLocation {
    async fn request_permission(&mut self) -> Result<bool> {
        Ok(true)
    }

    async fn watch(&mut self, _profile: WatchProfile) -> Result<mpsc::Receiver<GpsFix>> {
        self.fixes.take().context("location watch already started")
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_default_env()
        .filter_level(LevelFilter::Info)
        .init();

    let db_path = std::env::var("RAWANGPHAI_DB")
        .unwrap_or_else(|_| "rawangphai-field.sqlite3".to_string());
    let store = Store::open(db_path.into())?;

    let (mag_tx, mag_rx) = mpsc::channel(32);
    let (fix_tx, fix_rx) = mpsc::channel(32);
    let (station, mut events) = FieldStation::new(
        store,
        mag_rx,
        ManualLocation { fixes: Some(fix_rx) },
        Arc::new(HttpTransport::new()),
        StationConfig::default(),
    )
    .await?;

    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            match serde_json::to_string(&event) {
                Ok(json) => println!("<- {json}"),
                Err(err) => error!("could not encode event: {err}"),
            }
        }
    });

    println!("rawangphai field station; type 'help' for commands");
    run_repl(station, mag_tx, fix_tx).await
}

async fn run_repl(
    mut station: FieldStation,
    mag_tx: mpsc::Sender<MagSample>,
    fix_tx: mpsc::Sender<GpsFix>,
) -> Result<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let parts: Vec<&str> = line.split_whitespace().collect();

        match parts.as_slice() {
            ["help"] => print_help(),
            ["quit"] | ["exit"] => break,

            ["scan"] => match station.scan_and_connect().await {
                Ok(ScanOutcome::Connected(link)) => {
                    let quality = if link.binding.is_exact() {
                        "known profile"
                    } else {
                        "degraded binding"
                    };
                    println!("connected to {} ({quality})", link.device_name);
                }
                Ok(ScanOutcome::NoMatch(devices)) => {
                    println!("no station recognized; {} device(s) seen:", devices.len());
                    for device in devices {
                        println!(
                            "  {}  rssi {}  {}",
                            device.id,
                            device.rssi.map_or("?".to_string(), |r| r.to_string()),
                            device.name.unwrap_or_default()
                        );
                    }
                }
                Err(err) => println!("error: {err}"),
            },
            ["connect", id] => match station.connect_to(id).await {
                Ok(link) => println!("connected to {}", link.device_name),
                Err(err) => println!("error: {err}"),
            },
            ["disconnect"] => station.disconnect().await,
            ["devices"] => {
                for device in station.devices() {
                    println!(
                        "  {}  rssi {}  {}",
                        device.id,
                        device.rssi.map_or("?".to_string(), |r| r.to_string()),
                        device.name.as_deref().unwrap_or("")
                    );
                }
            }

            ["status"] => {
                let link = station.link_state().await;
                let heading = station.heading();
                println!("link: {} {}", link.phase.as_str(), link.device_name.unwrap_or_default());
                println!("gps: {:?}", station.gps());
                println!("heading: {:.1} {}", heading.heading, heading.direction.as_str());
                println!("online: {}", station.online());
                println!("slot: {}", station.current_slot().number());
            }
            ["reading"] => {
                println!("{}", serde_json::to_string_pretty(&station.live_reading().await)?)
            }

            ["slot", arg] => match parse_slot(arg) {
                Some(slot) => station.set_slot(slot),
                None => println!("slot is 1 or 2"),
            },
            ["toggle"] => println!("slot {}", station.toggle_slot().number()),
            ["capture"] => report_capture(station.capture_point(None).await),
            ["capture", arg] => match parse_slot(arg) {
                Some(slot) => report_capture(station.capture_point(Some(slot)).await),
                None => println!("slot is 1 or 2"),
            },
            ["photo", rest @ ..] if !rest.is_empty() => {
                let path = rest[0];
                let slot = rest.get(1).and_then(|arg| parse_slot(arg));
                match image::image_dimensions(path) {
                    Ok((width, height)) => {
                        let photo = PhotoRef::jpeg(path.to_string(), width, height);
                        let into_area = station.attach_photo(slot, photo).await;
                        if into_area {
                            println!("photo attached to the active survey");
                        } else {
                            println!("photo attached");
                        }
                    }
                    Err(err) => println!("cannot read {path}: {err}"),
                }
            }

            ["gps", lat, lon, rest @ ..] => {
                match (lat.parse::<f64>(), lon.parse::<f64>()) {
                    (Ok(latitude), Ok(longitude)) => {
                        let fix = GpsFix {
                            latitude,
                            longitude,
                            altitude: rest.first().and_then(|v| v.parse().ok()),
                            accuracy: rest.get(1).and_then(|v| v.parse().ok()),
                        };
                        if fix_tx.send(fix).await.is_err() {
                            println!("location tracker is not running");
                        }
                    }
                    _ => println!("usage: gps <lat> <lon> [alt] [accuracy]"),
                }
            }
            ["heading", deg] => match deg.parse::<f64>() {
                Ok(heading) => {
                    let radians = heading.to_radians();
                    let sample = MagSample {
                        x: radians.cos(),
                        y: radians.sin(),
                        z: 0.0,
                    };
                    if mag_tx.send(sample).await.is_err() {
                        println!("compass worker is not running");
                    }
                }
                Err(_) => println!("usage: heading <degrees>"),
            },

            ["areas"] => {
                for area in station.areas() {
                    let mut flags = Vec::new();
                    if area.is_active {
                        flags.push("active");
                    }
                    if area.is_submitted {
                        flags.push("submitted");
                    }
                    if area.is_complete() {
                        flags.push("complete");
                    }
                    println!("  {}  {}  [{}]", area.id, area.name, flags.join(", "));
                }
            }
            ["area", "new", rest @ ..] => {
                let id = station.start_survey(&rest.join(" "), "").await;
                println!("survey started: {id}");
            }
            ["area", "save", rest @ ..] => match station
                .save_workspace_as_area(&rest.join(" "), "")
                .await
            {
                Some(id) => println!("saved as {id}"),
                None => println!("need both points captured first"),
            },
            ["area", "finish"] => match station.finish_survey().await {
                FinishOutcome::Finished { area_id } => println!("finished {area_id}"),
                FinishOutcome::Incomplete => println!("capture both points first"),
                FinishOutcome::NoActiveSurvey => println!("no survey running"),
            },
            ["area", "delete", id] => station.delete_area(id).await,
            ["area", "clear"] => station.clear_areas().await,

            ["submit", "points"] => report_submit(station.submit_workspace().await),
            ["submit", id] => report_submit(station.submit_area(id).await),
            ["online"] => println!("{}", station.online()),

            _ => println!("unknown command; type 'help'"),
        }
    }

    station.shutdown().await
}

fn parse_slot(arg: &str) -> Option<PointSlot> {
    match arg {
        "1" => Some(PointSlot::One),
        "2" => Some(PointSlot::Two),
        _ => None,
    }
}

fn report_capture(outcome: CaptureOutcome) {
    match outcome {
        CaptureOutcome::NoData => println!("nothing captured: no live data"),
        CaptureOutcome::Saved {
            slot,
            area_id: Some(area_id),
        } => println!("point {} saved into {area_id}", slot.number()),
        CaptureOutcome::Saved { slot, area_id: None } => {
            println!("point {} saved", slot.number())
        }
    }
}

fn report_submit(result: Result<SubmitOutcome, rawangphai_field::upload::UploadError>) {
    match result {
        Ok(SubmitOutcome::Submitted(receipt)) => {
            if receipt.without_photos {
                println!("submitted without photos (status {})", receipt.status);
            } else {
                println!("submitted (status {})", receipt.status);
            }
        }
        Ok(SubmitOutcome::NotFound) => println!("no such area"),
        Ok(SubmitOutcome::Incomplete) => println!("capture both points first"),
        Err(err) => println!("upload failed: {err}"),
    }
}

fn print_help() {
    println!("ble:     scan | connect <id> | disconnect | devices");
    println!("sensors: gps <lat> <lon> [alt] [acc] | heading <deg> | reading | status");
    println!("capture: slot <1|2> | toggle | capture [1|2] | photo <path> [1|2]");
    println!("areas:   areas | area new [name] | area save [name] | area finish");
    println!("         area delete <id> | area clear");
    println!("upload:  submit <id> | submit points | online");
    println!("misc:    help | quit");
}
