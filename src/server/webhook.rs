//! State-change webhook
//!
//! After a value for one of the configured parameters was stored, an HTTP GET
//! `<url>?<parameter in lower case>=<device id>` is sent. Delivery is
//! fire-and-forget and never affects the RPC answer. At most
//! `max_in_flight` requests run at once; notifications beyond that are
//! dropped with a warning.

use crate::config::WebhookConfig;
use crate::error::{BridgeError, Result};
use reqwest::Client;
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tracing::{debug, warn};
use url::Url;

#[derive(Debug, Clone)]
pub struct StateWebhook {
    http: Client,
    url: Url,
    parameters: HashSet<String>,
    in_flight: Arc<Semaphore>,
}

impl StateWebhook {
    pub fn new(config: &WebhookConfig) -> Result<Self> {
        let http = Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| BridgeError::config(format!("Failed to build webhook client: {e}")))?;

        Ok(Self {
            http,
            url: config.url.clone(),
            parameters: config.parameters.clone(),
            in_flight: Arc::new(Semaphore::new(config.max_in_flight)),
        })
    }

    pub fn applies_to(&self, parameter: &str) -> bool {
        self.parameters.contains(parameter)
    }

    /// URL requested for a change of `parameter` on `device_id`
    pub fn target(&self, device_id: &str, parameter: &str) -> Url {
        let mut url = self.url.clone();
        url.query_pairs_mut()
            .append_pair(&parameter.to_lowercase(), device_id);
        url
    }

    /// Send the notification and wait for the answer
    pub async fn send(&self, device_id: &str, parameter: &str) -> Result<()> {
        let url = self.target(device_id, parameter);
        let response = self
            .http
            .get(url.clone())
            .send()
            .await
            .map_err(|e| BridgeError::server(format!("Webhook {url} failed: {e}")))?;

        if !response.status().is_success() {
            return Err(BridgeError::server(format!(
                "Webhook {url} answered {}",
                response.status()
            )));
        }
        debug!(%url, "Webhook delivered");
        Ok(())
    }

    /// Send in the background, logging failures. Returns false when the
    /// notification was dropped because too many are still pending.
    pub fn fire(&self, device_id: &str, parameter: &str) -> bool {
        let Ok(permit) = self.in_flight.clone().try_acquire_owned() else {
            warn!(device_id, parameter, "Webhook backlog full, notification dropped");
            return false;
        };
        let hook = self.clone();
        let device_id = device_id.to_string();
        let parameter = parameter.to_string();
        tokio::spawn(async move {
            if let Err(e) = hook.send(&device_id, &parameter).await {
                warn!("{e}");
            }
            drop(permit);
        });
        true
    }
}
