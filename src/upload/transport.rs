use std::time::Duration;

use async_trait::async_trait;
use log::debug;
use thiserror::Error;

use crate::upload::form::SurveyForm;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("request timed out")]
    Timeout,
    #[error("could not reach the server: {0}")]
    Connect(String),
    #[error("{0}")]
    Other(String),
}

#[derive(Debug, Clone)]
pub struct TransportReply {
    pub status: u16,
    pub body: String,
}

/// Seam between the upload pipeline and the network, so submission logic is
/// testable against scripted replies.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Reachability check. Any response at all counts as online, including
    /// HTTP error statuses.
    async fn probe(&self, url: &str, timeout: Duration) -> bool;

    async fn post_form(
        &self,
        url: &str,
        form: &SurveyForm,
        timeout: Duration,
    ) -> Result<TransportReply, TransportError>;
}

pub struct HttpTransport {
    client: reqwest::Client,
}

impl HttpTransport {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
        }
    }
}

impl Default for HttpTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn probe(&self, url: &str, timeout: Duration) -> bool {
        match self.client.head(url).timeout(timeout).send().await {
            Ok(_) => true,
            Err(err) => {
                debug!("connectivity probe failed: {err}");
                false
            }
        }
    }

    async fn post_form(
        &self,
        url: &str,
        form: &SurveyForm,
        timeout: Duration,
    ) -> Result<TransportReply, TransportError> {
        let mut multipart = reqwest::multipart::Form::new();
        for field in &form.fields {
            multipart = multipart.text(field.name, field.value.clone());
        }
        for photo in &form.photos {
            let part = reqwest::multipart::Part::bytes(photo.bytes.clone())
                .file_name(photo.file_name.clone())
                .mime_str(photo.mime)
                .map_err(|err| TransportError::Other(err.to_string()))?;
            multipart = multipart.part(photo.field, part);
        }

        let response = self
            .client
            .post(url)
            .multipart(multipart)
            .timeout(timeout)
            .send()
            .await
            .map_err(classify)?;

        let status = response.status().as_u16();
        let body = response.text().await.unwrap_or_default();
        Ok(TransportReply { status, body })
    }
}

fn classify(err: reqwest::Error) -> TransportError {
    if err.is_timeout() {
        TransportError::Timeout
    } else if err.is_connect() {
        TransportError::Connect(err.to_string())
    } else {
        TransportError::Other(err.to_string())
    }
}
