use std::sync::Arc;
use std::time::Duration;

use log::{debug, info, warn};
use thiserror::Error;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::sensors::location::GpsFix;
use crate::survey::model::{PhotoRef, Point, PointSlot, SurveyArea};
use crate::upload::form::SurveyForm;
use crate::upload::photo;
use crate::upload::transport::{Transport, TransportError};

#[derive(Debug, Clone)]
pub struct UploadConfig {
    pub endpoint: String,
    pub probe_url: String,
    pub user_id: String,
    pub probe_timeout: Duration,
    pub request_timeout: Duration,
    pub max_photo_dimension: u32,
    pub jpeg_quality: u8,
    /// Photos still larger than this after compression are left out of the
    /// upload.
    pub max_photo_bytes: usize,
    pub connectivity_interval: Duration,
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            endpoint: "https://rawangphai.uru.ac.th/api/Points".to_string(),
            probe_url: "https://www.google.com".to_string(),
            user_id: "124".to_string(),
            probe_timeout: Duration::from_secs(5),
            request_timeout: Duration::from_secs(60),
            max_photo_dimension: 400,
            jpeg_quality: 50,
            max_photo_bytes: 1024 * 1024,
            connectivity_interval: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Error)]
pub enum UploadError {
    #[error("no internet connection; the survey stays on this device until you are back online")]
    Offline,
    #[error("the server rejected the upload as too large even without photos")]
    PayloadTooLarge,
    #[error("the server hit an internal error; try again later")]
    ServerInternal,
    #[error("the server rejected the upload (status {status}): {detail}")]
    Rejected { status: u16, detail: String },
    #[error("network failure during upload: {0}")]
    Network(String),
}

#[derive(Debug, Clone)]
pub struct UploadReceipt {
    pub status: u16,
    /// Set when the payload only went through after dropping the photos.
    pub without_photos: bool,
    pub body: String,
}

/// Drives one submission end to end: connectivity probe, photo loading and
/// compression, the POST itself, and the retry-without-photos fallback for
/// payloads the server refuses as too large.
pub struct UploadPipeline {
    transport: Arc<dyn Transport>,
    config: UploadConfig,
}

impl UploadPipeline {
    pub fn new(transport: Arc<dyn Transport>, config: UploadConfig) -> Self {
        Self { transport, config }
    }

    pub fn config(&self) -> &UploadConfig {
        &self.config
    }

    pub async fn submit_area(&self, area: &SurveyArea) -> Result<UploadReceipt, UploadError> {
        let mut form = SurveyForm::for_area(area, &self.config.user_id);
        for slot in [PointSlot::One, PointSlot::Two] {
            if let Some(photo) = area.images.get(slot) {
                if let Some(bytes) = self.load_photo(photo).await {
                    form.add_photo(slot, bytes);
                }
            }
        }
        self.submit(form).await
    }

    /// Legacy path: submit the two loose workspace points directly.
    pub async fn submit_workspace(
        &self,
        point1: &Point,
        point2: &Point,
        photo1: Option<&PhotoRef>,
        photo2: Option<&PhotoRef>,
        fix: Option<&GpsFix>,
        heading: f64,
        observer: &str,
    ) -> Result<UploadReceipt, UploadError> {
        let mut form =
            SurveyForm::for_workspace(point1, point2, fix, heading, observer, &self.config.user_id);
        for (slot, photo) in [(PointSlot::One, photo1), (PointSlot::Two, photo2)] {
            if let Some(photo) = photo {
                if let Some(bytes) = self.load_photo(photo).await {
                    form.add_photo(slot, bytes);
                }
            }
        }
        self.submit(form).await
    }

    async fn submit(&self, form: SurveyForm) -> Result<UploadReceipt, UploadError> {
        if !self
            .transport
            .probe(&self.config.probe_url, self.config.probe_timeout)
            .await
        {
            warn!("upload aborted: no connectivity");
            return Err(UploadError::Offline);
        }

        info!("submitting survey data ({} photo(s))", form.photos.len());
        let reply = self
            .transport
            .post_form(&self.config.endpoint, &form, self.config.request_timeout)
            .await
            .map_err(network)?;

        match reply.status {
            200..=299 => Ok(UploadReceipt {
                status: reply.status,
                without_photos: false,
                body: reply.body,
            }),
            413 if form.has_photos() => {
                warn!("payload too large; retrying without photos");
                let retry = self
                    .transport
                    .post_form(&self.config.endpoint, &form.strip_photos(), self.config.request_timeout)
                    .await
                    .map_err(network)?;
                match retry.status {
                    200..=299 => Ok(UploadReceipt {
                        status: retry.status,
                        without_photos: true,
                        body: retry.body,
                    }),
                    413 => Err(UploadError::PayloadTooLarge),
                    500..=599 => Err(UploadError::ServerInternal),
                    status => Err(UploadError::Rejected {
                        status,
                        detail: trim_detail(&retry.body),
                    }),
                }
            }
            413 => Err(UploadError::PayloadTooLarge),
            500..=599 => Err(UploadError::ServerInternal),
            status => Err(UploadError::Rejected {
                status,
                detail: trim_detail(&reply.body),
            }),
        }
    }

    /// Reads and compresses one photo. Unreadable or undecodable photos are
    /// skipped so the measurements still go out, as is anything still over
    /// the size cap after compression.
    async fn load_photo(&self, photo: &PhotoRef) -> Option<Vec<u8>> {
        let path = photo::local_path(&photo.uri).to_string();
        let raw = match tokio::fs::read(&path).await {
            Ok(raw) => raw,
            Err(err) => {
                warn!("skipping photo {path}: {err}");
                return None;
            }
        };
        let prepared = match photo::prepare_for_upload(
            &raw,
            self.config.max_photo_dimension,
            self.config.jpeg_quality,
        ) {
            Ok(prepared) => prepared,
            Err(err) => {
                warn!("skipping photo {path}: {err:#}");
                return None;
            }
        };
        if prepared.len() > self.config.max_photo_bytes {
            warn!(
                "skipping photo {path}: still {} bytes after compression (cap {})",
                prepared.len(),
                self.config.max_photo_bytes
            );
            return None;
        }
        Some(prepared)
    }
}

fn network(err: TransportError) -> UploadError {
    UploadError::Network(err.to_string())
}

fn trim_detail(body: &str) -> String {
    let line = body.lines().next().unwrap_or("").trim();
    if line.is_empty() {
        return "no detail".to_string();
    }
    line.chars().take(200).collect()
}

/// Probes the upload route immediately and then on an interval, publishing
/// the latest online/offline verdict.
pub fn spawn_connectivity_monitor(
    transport: Arc<dyn Transport>,
    config: &UploadConfig,
    cancel: CancellationToken,
) -> watch::Receiver<bool> {
    let (tx, rx) = watch::channel(false);
    let probe_url = config.probe_url.clone();
    let probe_timeout = config.probe_timeout;
    let interval = config.connectivity_interval;

    tokio::spawn(async move {
        loop {
            let online = transport.probe(&probe_url, probe_timeout).await;
            if tx.send(online).is_err() {
                break;
            }
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(interval) => {}
            }
        }
        debug!("connectivity monitor stopped");
    });

    rx
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::survey::model::AreaLocation;
    use crate::upload::transport::TransportReply;
    use async_trait::async_trait;
    use chrono::Utc;
    use image::{DynamicImage, ImageFormat, RgbImage};
    use std::collections::VecDeque;
    use std::io::Cursor;
    use std::path::PathBuf;
    use std::sync::Mutex;

    struct ReplayTransport {
        online: bool,
        replies: Mutex<VecDeque<TransportReply>>,
        seen: Mutex<Vec<SurveyForm>>,
    }

    impl ReplayTransport {
        fn online(replies: Vec<TransportReply>) -> Arc<Self> {
            Arc::new(Self {
                online: true,
                replies: Mutex::new(replies.into()),
                seen: Mutex::new(Vec::new()),
            })
        }

        fn offline() -> Arc<Self> {
            Arc::new(Self {
                online: false,
                replies: Mutex::new(VecDeque::new()),
                seen: Mutex::new(Vec::new()),
            })
        }

        fn posts(&self) -> Vec<SurveyForm> {
            self.seen.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl Transport for ReplayTransport {
        async fn probe(&self, _url: &str, _timeout: Duration) -> bool {
            self.online
        }

        async fn post_form(
            &self,
            _url: &str,
            form: &SurveyForm,
            _timeout: Duration,
        ) -> Result<TransportReply, TransportError> {
            self.seen.lock().unwrap().push(form.clone());
            Ok(self.replies.lock().unwrap().pop_front().unwrap_or(TransportReply {
                status: 200,
                body: "ok".to_string(),
            }))
        }
    }

    struct BrokenTransport;

    #[async_trait]
    impl Transport for BrokenTransport {
        async fn probe(&self, _url: &str, _timeout: Duration) -> bool {
            true
        }

        async fn post_form(
            &self,
            _url: &str,
            _form: &SurveyForm,
            _timeout: Duration,
        ) -> Result<TransportReply, TransportError> {
            Err(TransportError::Timeout)
        }
    }

    fn reply(status: u16) -> TransportReply {
        TransportReply {
            status,
            body: String::new(),
        }
    }

    fn point(slot: PointSlot) -> Point {
        Point {
            elevation: Some(12.5),
            distance: Some(4.2),
            extra: Default::default(),
            lat: 17.5432104,
            lon: 100.1234567,
            altitude: 300.0,
            accuracy: Some(5.0),
            azimuth: 270,
            timestamp: Utc::now(),
            device_id: "AA:BB:CC:DD:EE:FF".to_string(),
            point_number: slot,
            has_image: false,
        }
    }

    fn area(photo_uri: Option<&str>) -> SurveyArea {
        let mut area = SurveyArea::new(
            "area_1700000000000".to_string(),
            "Slope A".to_string(),
            "Somchai".to_string(),
            AreaLocation {
                latitude: 17.5432104,
                longitude: 100.1234567,
                altitude: 301.0,
            },
        );
        area.points.set(PointSlot::One, point(PointSlot::One));
        area.points.set(PointSlot::Two, point(PointSlot::Two));
        if let Some(uri) = photo_uri {
            area.images
                .set(PointSlot::One, Some(PhotoRef::jpeg(uri.to_string(), 32, 24)));
        }
        area
    }

    fn temp_photo() -> PathBuf {
        let img = RgbImage::from_pixel(32, 24, image::Rgb([60, 120, 60]));
        write_temp_png(img)
    }

    /// Per-pixel hash noise; the PNG on disk cannot compress below a few
    /// megabytes, like a real camera snap.
    fn noisy_photo() -> PathBuf {
        let img = RgbImage::from_fn(1200, 1200, |x, y| {
            let mut v = (u64::from(x) << 32) | u64::from(y);
            v = v.wrapping_mul(0x9E37_79B9_7F4A_7C15);
            v ^= v >> 31;
            v = v.wrapping_mul(0xBF58_476D_1CE4_E5B9);
            v ^= v >> 27;
            let b = v.to_le_bytes();
            image::Rgb([b[0], b[1], b[2]])
        });
        write_temp_png(img)
    }

    fn write_temp_png(img: RgbImage) -> PathBuf {
        let mut out = Cursor::new(Vec::new());
        DynamicImage::ImageRgb8(img)
            .write_to(&mut out, ImageFormat::Png)
            .unwrap();
        let path =
            std::env::temp_dir().join(format!("rawangphai-upload-{}.png", uuid::Uuid::new_v4()));
        std::fs::write(&path, out.into_inner()).unwrap();
        path
    }

    fn pipeline(transport: Arc<dyn Transport>) -> UploadPipeline {
        UploadPipeline::new(transport, UploadConfig::default())
    }

    #[tokio::test]
    async fn successful_submission_posts_once() {
        let transport = ReplayTransport::online(vec![reply(200)]);
        let receipt = pipeline(transport.clone()).submit_area(&area(None)).await.unwrap();

        assert_eq!(receipt.status, 200);
        assert!(!receipt.without_photos);
        let posts = transport.posts();
        assert_eq!(posts.len(), 1);
        assert_eq!(posts[0].field("user_id"), Some("124"));
    }

    #[tokio::test]
    async fn offline_submits_nothing() {
        let transport = ReplayTransport::offline();
        let err = pipeline(transport.clone()).submit_area(&area(None)).await.unwrap_err();

        assert!(matches!(err, UploadError::Offline));
        assert!(transport.posts().is_empty());
    }

    #[tokio::test]
    async fn too_large_retries_without_photos() {
        let path = temp_photo();
        let uri = format!("file://{}", path.display());
        let transport = ReplayTransport::online(vec![reply(413), reply(201)]);

        let receipt = pipeline(transport.clone())
            .submit_area(&area(Some(&uri)))
            .await
            .unwrap();
        assert!(receipt.without_photos);
        assert_eq!(receipt.status, 201);

        let posts = transport.posts();
        assert_eq!(posts.len(), 2);
        assert_eq!(posts[0].photos.len(), 1);
        assert_eq!(&posts[0].photos[0].bytes[..2], &[0xFF, 0xD8]);
        assert!(posts[1].photos.is_empty());
        // The retry carries the identical fields.
        assert_eq!(posts[1].fields, posts[0].fields);

        let _ = std::fs::remove_file(path);
    }

    #[tokio::test]
    async fn a_second_413_gives_up() {
        let path = temp_photo();
        let uri = format!("file://{}", path.display());
        let transport = ReplayTransport::online(vec![reply(413), reply(413)]);

        let err = pipeline(transport.clone())
            .submit_area(&area(Some(&uri)))
            .await
            .unwrap_err();
        assert!(matches!(err, UploadError::PayloadTooLarge));
        assert_eq!(transport.posts().len(), 2);

        let _ = std::fs::remove_file(path);
    }

    #[tokio::test]
    async fn too_large_without_photos_does_not_retry() {
        let transport = ReplayTransport::online(vec![reply(413)]);
        let err = pipeline(transport.clone()).submit_area(&area(None)).await.unwrap_err();

        assert!(matches!(err, UploadError::PayloadTooLarge));
        assert_eq!(transport.posts().len(), 1);
    }

    #[tokio::test]
    async fn server_errors_are_distinguished() {
        let transport = ReplayTransport::online(vec![reply(500)]);
        let err = pipeline(transport).submit_area(&area(None)).await.unwrap_err();
        assert!(matches!(err, UploadError::ServerInternal));

        let transport = ReplayTransport::online(vec![TransportReply {
            status: 400,
            body: "bad azimuth\nsecond line".to_string(),
        }]);
        let err = pipeline(transport).submit_area(&area(None)).await.unwrap_err();
        match err {
            UploadError::Rejected { status, detail } => {
                assert_eq!(status, 400);
                assert_eq!(detail, "bad azimuth");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn camera_sized_photos_upload_after_compression() {
        let path = noisy_photo();
        let uri = format!("file://{}", path.display());
        // The stored file is well past the cap; only the compressed output
        // has to fit.
        assert!(std::fs::metadata(&path).unwrap().len() > 1024 * 1024);
        let transport = ReplayTransport::online(vec![reply(200)]);

        let receipt = pipeline(transport.clone())
            .submit_area(&area(Some(&uri)))
            .await
            .unwrap();

        assert_eq!(receipt.status, 200);
        let posts = transport.posts();
        assert_eq!(posts.len(), 1);
        assert_eq!(posts[0].photos.len(), 1);
        assert!(posts[0].photos[0].bytes.len() <= 1024 * 1024);

        let _ = std::fs::remove_file(path);
    }

    #[tokio::test]
    async fn photos_still_oversized_after_compression_are_left_behind() {
        let path = temp_photo();
        let uri = format!("file://{}", path.display());
        let transport = ReplayTransport::online(vec![reply(200)]);

        // Even the recompressed output cannot fit an 8 byte cap.
        let mut config = UploadConfig::default();
        config.max_photo_bytes = 8;
        let receipt = UploadPipeline::new(transport.clone(), config)
            .submit_area(&area(Some(&uri)))
            .await
            .unwrap();

        assert_eq!(receipt.status, 200);
        let posts = transport.posts();
        assert_eq!(posts.len(), 1);
        assert!(posts[0].photos.is_empty());

        let _ = std::fs::remove_file(path);
    }

    #[tokio::test]
    async fn transport_failures_surface_as_network_errors() {
        let err = pipeline(Arc::new(BrokenTransport))
            .submit_area(&area(None))
            .await
            .unwrap_err();
        assert!(matches!(err, UploadError::Network(_)));
    }

    #[tokio::test]
    async fn workspace_submission_posts_point_coordinates() {
        let transport = ReplayTransport::online(vec![reply(200)]);
        pipeline(transport.clone())
            .submit_workspace(
                &point(PointSlot::One),
                &point(PointSlot::Two),
                None,
                None,
                None,
                250.0,
                "Rangwat",
            )
            .await
            .unwrap();

        let posts = transport.posts();
        assert_eq!(posts[0].field("latitude"), Some("17.5432104"));
        assert_eq!(posts[0].field("observer"), Some("Rangwat"));
        // Live heading, not the point azimuth of 270.
        assert_eq!(posts[0].field("azimuth"), Some("250"));
    }

    #[tokio::test]
    async fn connectivity_monitor_publishes_probe_results() {
        let transport = ReplayTransport::online(Vec::new());
        let cancel = CancellationToken::new();
        let mut rx =
            spawn_connectivity_monitor(transport, &UploadConfig::default(), cancel.clone());

        rx.changed().await.unwrap();
        assert!(*rx.borrow());
        cancel.cancel();
    }
}
