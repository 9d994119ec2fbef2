//! Offline-first core of the Rawangphai landslide survey client: pairs with
//! an ESP32 measuring station over BLE, reconciles its telemetry with the
//! phone's compass and GPS, and manages capture, local persistence and
//! upload of survey areas.

pub mod ble;
pub mod events;
pub mod reading;
pub mod sensors;
pub mod station;
pub mod store;
pub mod survey;
pub mod upload;

pub use ble::{BleSessionManager, LinkPhase, LinkState, ScanOutcome, SessionConfig, SessionError};
pub use events::StationEvent;
pub use reading::LiveReading;
pub use station::{CaptureOutcome, FieldStation, StationConfig, SubmitOutcome};
pub use store::Store;
pub use survey::{AreaManager, FinishOutcome, PhotoRef, Point, PointSlot, SurveyArea};
pub use upload::{HttpTransport, UploadConfig, UploadError, UploadPipeline, UploadReceipt};
