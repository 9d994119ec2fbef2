pub mod profile;
pub mod session;
pub mod telemetry;

pub use profile::{advertisement_matches, resolve_binding, Binding, BindingError};
pub use session::{
    BleSessionManager, ConnectedLink, DiscoveredDevice, LinkPhase, LinkState, MonitorDeps,
    ScanOutcome, SessionConfig, SessionError,
};
pub use telemetry::{FieldKey, TelemetryFrame};
