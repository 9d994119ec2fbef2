pub mod form;
pub mod photo;
pub mod pipeline;
pub mod transport;

pub use form::SurveyForm;
pub use pipeline::{
    spawn_connectivity_monitor, UploadConfig, UploadError, UploadPipeline, UploadReceipt,
};
pub use transport::{HttpTransport, Transport, TransportError, TransportReply};
