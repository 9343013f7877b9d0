//! Forwarding of incidents to an external HTTP endpoint.

use std::sync::Arc;
use std::time::Duration;

use relay_protocol::Alarm;
use tracing::{debug, error};

use crate::error::ServerError;

const CHECK_TIMEOUT: Duration = Duration::from_secs(5);

/// Receives every incident of a changed payload. Fire-and-forget: failures
/// are the uploader's to log and never reach the caller.
pub trait Uploader: Send + Sync + 'static {
    fn upload(&self, alarm: Alarm);
}

/// POSTs each incident as form field `alarm` holding the `Alarm` XML.
#[derive(Clone)]
pub struct HttpUploader {
    client: reqwest::Client,
    url: Arc<str>,
}

impl HttpUploader {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            url: Arc::from(url.into()),
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub async fn send(&self, alarm: &Alarm) -> Result<(), ServerError> {
        let xml = alarm.to_xml()?;
        self.client
            .post(self.url.as_ref())
            .form(&[("alarm", xml)])
            .send()
            .await?
            .error_for_status()?;
        debug!(alarm = %alarm.id, "Alarm uploaded");
        Ok(())
    }
}

impl Uploader for HttpUploader {
    fn upload(&self, alarm: Alarm) {
        let uploader = self.clone();
        tokio::spawn(async move {
            if let Err(e) = uploader.send(&alarm).await {
                error!(alarm = %alarm.id, "Error while uploading alarm: {e}");
            }
        });
    }
}

/// Whether `url` answers a GET with 200 within five seconds.
pub async fn check_upload_url(url: &str) -> bool {
    if url.trim().is_empty() {
        return false;
    }
    let client = match reqwest::Client::builder().timeout(CHECK_TIMEOUT).build() {
        Ok(client) => client,
        Err(_) => return false,
    };
    match client.get(url).send().await {
        Ok(response) => response.status() == reqwest::StatusCode::OK,
        Err(e) => {
            debug!("Upload URL check failed: {e}");
            false
        }
    }
}
