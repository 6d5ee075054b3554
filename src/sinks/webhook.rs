//! Advisory webhook.  One bounded request per record, `PUT` while the
//! container runs and `DELETE` once it stopped.  Failures are logged and
//! otherwise ignored.

use std::collections::BTreeMap;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use log::{debug, error};
use reqwest::header::AUTHORIZATION;
use reqwest::{Client, Method};
use serde::Serialize;

use crate::config::{seconds, WebhookConfig};
use crate::error::{Error, Result};
use crate::types::{ContainerChangeRecord, EventKind};

#[derive(Debug, Serialize)]
pub struct WebhookPayload<'a> {
    pub name: &'a str,
    pub node: &'a str,
    pub event: EventKind,
    pub labels: BTreeMap<String, String>,
}

pub struct Webhook {
    client: Client,
    url: String,
    /// Ready-made `Authorization` value.
    authorization: Option<String>,
}

impl Webhook {
    pub fn new(config: &WebhookConfig) -> Result<Self> {
        let timeout =
            seconds("webhook.timeout", config.timeout).map_err(|e| Error::Config(e.to_string()))?;
        let client = Client::builder().timeout(timeout).build()?;
        // The credential is encoded exactly as configured.
        let authorization = config
            .auth
            .as_ref()
            .and_then(|auth| auth.basic.as_deref())
            .map(|credential| format!("Basic {}", STANDARD.encode(credential)));

        Ok(Self {
            client,
            url: config.url.clone(),
            authorization,
        })
    }

    /// Returns whether the endpoint accepted the notification.
    pub async fn notify(&self, record: &ContainerChangeRecord, labels: BTreeMap<String, String>) -> bool {
        let method = if record.is_active() {
            Method::PUT
        } else {
            Method::DELETE
        };
        let payload = WebhookPayload {
            name: &record.name,
            node: &record.node,
            event: record.event,
            labels,
        };

        let mut request = self.client.request(method, &self.url).json(&payload);
        if let Some(authorization) = &self.authorization {
            request = request.header(AUTHORIZATION, authorization);
        }

        match request.send().await.and_then(|r| r.error_for_status()) {
            Ok(response) => {
                debug!("webhook [{}] answered {}", self.url, response.status());
                true
            }
            Err(e) => {
                error!("webhook [{}] failed: {}", self.url, e);
                false
            }
        }
    }
}
