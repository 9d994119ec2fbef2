pub mod compass;
pub mod location;

pub use compass::{CompassPoint, CompassReading, CompassReconciler, MagSample};
pub use location::{GpsFix, LocationSource, LocationTracker, WatchProfile};
