pub mod manager;
pub mod model;

pub use manager::{AreaManager, FinishOutcome, PointSaved, Workspace, AREAS_KEY, DEFAULT_OBSERVER};
pub use model::{AreaLocation, PhotoPair, PhotoRef, Point, PointPair, PointSlot, SurveyArea};
