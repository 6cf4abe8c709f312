//! Webhook notification sink
//!
//! POSTs each change as JSON to a client-supplied URL. Any 2xx response
//! acknowledges the change.

use super::snapshot::ConfigChange;
use crate::domain::ports::NotificationSink;
use crate::error::{Error, Result};
use async_trait::async_trait;
use reqwest::Client as HttpClient;
use std::time::Duration;

/// Header carrying the version being delivered
pub const VERSION_HEADER: &str = "X-Config-Version";

/// HTTP push target for one subscription
#[derive(Debug, Clone)]
pub struct WebhookSink {
    client_id: String,
    url: String,
    http_client: HttpClient,
}

impl WebhookSink {
    pub fn new(client_id: impl Into<String>, url: impl Into<String>, timeout: Duration) -> Result<Self> {
        let url = url.into();
        if !(url.starts_with("http://") || url.starts_with("https://")) {
            return Err(Error::Validation(format!("webhook url must be http(s): {}", url)));
        }
        let http_client = HttpClient::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| Error::Configuration(format!("failed to build HTTP client: {}", e)))?;
        Ok(Self {
            client_id: client_id.into(),
            url,
            http_client,
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl NotificationSink for WebhookSink {
    async fn deliver(&self, change: &ConfigChange) -> Result<()> {
        let response = self
            .http_client
            .post(&self.url)
            .header(VERSION_HEADER, change.version.to_string())
            .json(change)
            .send()
            .await
            .map_err(|e| Error::Delivery {
                client_id: self.client_id.clone(),
                reason: e.to_string(),
            })?;

        let status = response.status();
        if status.is_success() {
            Ok(())
        } else {
            Err(Error::from_status(&self.url, status.as_u16(), |reason| Error::Delivery {
                client_id: self.client_id.clone(),
                reason: format!("webhook {}", reason),
            }))
        }
    }

    fn target(&self) -> String {
        format!("{} ({})", self.url, self.client_id)
    }
}
