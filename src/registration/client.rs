//! Outbound `init` calls to the CCU interfaces
//!
//! Each interface is subscribed independently: one slow or unreachable
//! interface delays only its own [`SubscriptionAttempt`] and never the
//! others.

use super::backoff::{NextStep, SubscriptionAttempt, SubscriptionState};
use super::registry::SubscriptionRegistry;
use crate::config::{CcuConfig, InterfaceConfig};
use crate::error::{BridgeError, Result, SubscriptionError};
use crate::xmlrpc::{decode_response, encode_call, ResponseError, Value};
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use reqwest::{Client, ClientBuilder, StatusCode};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, error, info, warn};
use url::Url;
use uuid::Uuid;

/// An interface together with the callback URL advertised to it
#[derive(Debug, Clone, PartialEq)]
pub struct RegistrationTarget {
    pub interface: InterfaceConfig,
    pub callback_url: String,
}

impl RegistrationTarget {
    pub fn new(interface: InterfaceConfig, callback_url: impl Into<String>) -> Self {
        Self {
            interface,
            callback_url: callback_url.into(),
        }
    }
}

/// This bridge's subscription with one interface
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientRegistration {
    pub interface: String,
    pub endpoint: Url,
    pub client_id: String,
    pub callback_url: String,
    pub state: SubscriptionState,
}

/// Outcome of subscribing all configured interfaces
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Readiness {
    /// Every interface is subscribed
    Ready,
    /// Some interfaces failed, the rest are served
    Degraded { failed: Vec<String> },
    /// No interface could be subscribed
    Failed,
}

impl Readiness {
    fn from_results(results: &[std::result::Result<ClientRegistration, SubscriptionError>]) -> Self {
        let failed: Vec<String> = results
            .iter()
            .filter_map(|r| r.as_ref().err().map(|e| e.interface().to_string()))
            .collect();

        if failed.is_empty() {
            Readiness::Ready
        } else if failed.len() == results.len() {
            Readiness::Failed
        } else {
            Readiness::Degraded { failed }
        }
    }
}

impl fmt::Display for Readiness {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Readiness::Ready => write!(f, "ready"),
            Readiness::Degraded { failed } => write!(f, "degraded ({} failed)", failed.join(", ")),
            Readiness::Failed => write!(f, "failed"),
        }
    }
}

/// Subscribes and unsubscribes this bridge with CCU interfaces
#[derive(Debug, Clone)]
pub struct RegistrationClient {
    http: Client,
    config: CcuConfig,
    registry: SubscriptionRegistry,
    /// Client id per interface, fixed for the lifetime of the process
    client_ids: Arc<RwLock<HashMap<String, String>>>,
}

impl RegistrationClient {
    /// Create a client sharing `registry` with the event server
    pub fn new(config: CcuConfig, registry: SubscriptionRegistry) -> Result<Self> {
        let mut builder = ClientBuilder::new()
            .timeout(config.request_timeout)
            .user_agent(format!("ccu-event-bridge/{}", env!("CARGO_PKG_VERSION")));

        let mut default_headers = HeaderMap::new();
        default_headers.insert(CONTENT_TYPE, HeaderValue::from_static("text/xml"));
        if let Some(credentials) = &config.credentials {
            let mut value = HeaderValue::from_str(&credentials.basic_header()).map_err(|e| {
                BridgeError::invalid_input(format!("Invalid authorization header: {e}"))
            })?;
            value.set_sensitive(true);
            default_headers.insert(AUTHORIZATION, value);
        }
        builder = builder.default_headers(default_headers);

        let http = builder
            .build()
            .map_err(|e| BridgeError::config(format!("Failed to build HTTP client: {e}")))?;

        Ok(Self {
            http,
            config,
            registry,
            client_ids: Arc::default(),
        })
    }

    pub fn registry(&self) -> &SubscriptionRegistry {
        &self.registry
    }

    /// Mint a new identifier; [`Self::client_id_for`] keeps one per interface
    pub fn generate_client_id(&self, interface: &str) -> String {
        format!(
            "{}-{}-{}",
            self.config.client_id_prefix,
            interface,
            Uuid::new_v4().simple()
        )
    }

    /// Client id of `interface`, minted on first use and reused afterwards
    pub async fn client_id_for(&self, interface: &str) -> String {
        if let Some(id) = self.client_ids.read().await.get(interface) {
            return id.clone();
        }
        self.client_ids
            .write()
            .await
            .entry(interface.to_string())
            .or_insert_with(|| self.generate_client_id(interface))
            .clone()
    }

    /// Subscribe one interface, retrying within the backoff budget
    pub async fn subscribe(
        &self,
        target: &RegistrationTarget,
    ) -> std::result::Result<ClientRegistration, SubscriptionError> {
        let interface = &target.interface;
        let client_id = self.client_id_for(&interface.id).await;
        let mut attempt = SubscriptionAttempt::new(self.config.retry.clone());

        loop {
            let n = attempt.begin();
            debug!(
                interface = %interface.id,
                attempt = n,
                callback = %target.callback_url,
                "Sending init"
            );

            match self
                .send_init(interface, &target.callback_url, &client_id)
                .await
            {
                Ok(()) => {
                    attempt.succeeded();
                    let registration = ClientRegistration {
                        interface: interface.id.clone(),
                        endpoint: interface.url.clone(),
                        client_id: client_id.clone(),
                        callback_url: target.callback_url.clone(),
                        state: attempt.state().clone(),
                    };
                    self.registry.insert(registration.clone()).await;
                    info!(
                        interface = %interface.id,
                        client_id = %client_id,
                        "Subscribed"
                    );
                    return Ok(registration);
                }
                Err(e) => match attempt.failed(e) {
                    NextStep::RetryAfter(delay) => {
                        warn!(
                            interface = %interface.id,
                            attempt = n,
                            "Subscription attempt failed, retrying in {delay:?}"
                        );
                        tokio::time::sleep(delay).await;
                    }
                    NextStep::GiveUp(e) => {
                        error!(interface = %interface.id, attempts = n, "Giving up: {e}");
                        return Err(e);
                    }
                },
            }
        }
    }

    /// Subscribe every target concurrently
    pub async fn subscribe_all(&self, targets: &[RegistrationTarget]) -> Readiness {
        let results = futures::future::join_all(targets.iter().map(|t| self.subscribe(t))).await;
        let readiness = Readiness::from_results(&results);
        info!(%readiness, "Subscription round finished");
        readiness
    }

    /// Send `init` again with the interface's existing client id
    ///
    /// A restarted CCU has forgotten its callbacks until it is told again. When
    /// renewal fails the interface leaves the registry and counts as
    /// unsubscribed until a later round succeeds.
    pub async fn renew(
        &self,
        target: &RegistrationTarget,
    ) -> std::result::Result<ClientRegistration, SubscriptionError> {
        match self.subscribe(target).await {
            Ok(registration) => Ok(registration),
            Err(e) => {
                if let Some(lost) = self.registry.remove_interface(&target.interface.id).await {
                    warn!(
                        interface = %lost.interface,
                        client_id = %lost.client_id,
                        "Subscription lost: {e}"
                    );
                }
                Err(e)
            }
        }
    }

    /// Renew every target concurrently
    pub async fn renew_all(&self, targets: &[RegistrationTarget]) -> Readiness {
        let results = futures::future::join_all(targets.iter().map(|t| self.renew(t))).await;
        let readiness = Readiness::from_results(&results);
        debug!(%readiness, "Renewal round finished");
        readiness
    }

    /// Best-effort deregistration of every subscribed interface
    pub async fn unsubscribe_all(&self) {
        let registrations = self.registry.drain().await;
        let calls = registrations.iter().map(|reg| async move {
            // An empty client id tells the CCU to forget the callback URL
            match self.post_init(&reg.endpoint, &reg.interface, &reg.callback_url, "").await {
                Ok(()) => info!(interface = %reg.interface, "Unsubscribed"),
                Err(e) => warn!(interface = %reg.interface, "Unsubscribe failed: {e}"),
            }
        });
        futures::future::join_all(calls).await;
    }

    async fn send_init(
        &self,
        interface: &InterfaceConfig,
        callback_url: &str,
        client_id: &str,
    ) -> std::result::Result<(), SubscriptionError> {
        self.post_init(&interface.url, &interface.id, callback_url, client_id)
            .await
    }

    async fn post_init(
        &self,
        endpoint: &Url,
        interface: &str,
        callback_url: &str,
        client_id: &str,
    ) -> std::result::Result<(), SubscriptionError> {
        let body = encode_call(
            "init",
            &[Value::from(callback_url), Value::from(client_id)],
        );

        let response = self
            .http
            .post(endpoint.clone())
            .body(body)
            .send()
            .await
            .map_err(|e| self.classify(interface, e))?;

        let status = response.status();
        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            return Err(SubscriptionError::Rejected {
                interface: interface.to_string(),
                reason: format!("HTTP {status}"),
            });
        }
        if !status.is_success() {
            return Err(SubscriptionError::Unreachable {
                interface: interface.to_string(),
                reason: format!("HTTP {status}"),
            });
        }

        let bytes = response
            .bytes()
            .await
            .map_err(|e| self.classify(interface, e))?;

        match decode_response(&bytes) {
            Ok(_) => Ok(()),
            Err(ResponseError::Fault(fault)) => Err(SubscriptionError::Rejected {
                interface: interface.to_string(),
                reason: fault.to_string(),
            }),
            Err(ResponseError::Malformed(e)) => Err(SubscriptionError::Rejected {
                interface: interface.to_string(),
                reason: e.to_string(),
            }),
        }
    }

    fn classify(&self, interface: &str, e: reqwest::Error) -> SubscriptionError {
        if e.is_timeout() {
            SubscriptionError::Timeout {
                interface: interface.to_string(),
                timeout: self.config.request_timeout,
            }
        } else {
            SubscriptionError::Unreachable {
                interface: interface.to_string(),
                reason: e.to_string(),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registration(interface: &str) -> std::result::Result<ClientRegistration, SubscriptionError> {
        Ok(ClientRegistration {
            interface: interface.to_string(),
            endpoint: "http://ccu:2001".parse().unwrap(),
            client_id: format!("id-{interface}"),
            callback_url: "http://bridge:8001".to_string(),
            state: SubscriptionState::Subscribed,
        })
    }

    fn failure(interface: &str) -> std::result::Result<ClientRegistration, SubscriptionError> {
        Err(SubscriptionError::Unreachable {
            interface: interface.to_string(),
            reason: "refused".to_string(),
        })
    }

    #[test]
    fn test_readiness_summary() {
        assert_eq!(
            Readiness::from_results(&[registration("BidCos-RF"), registration("HmIP-RF")]),
            Readiness::Ready
        );
        assert_eq!(
            Readiness::from_results(&[registration("BidCos-RF"), failure("HmIP-RF")]),
            Readiness::Degraded {
                failed: vec!["HmIP-RF".to_string()]
            }
        );
        assert_eq!(
            Readiness::from_results(&[failure("BidCos-RF"), failure("HmIP-RF")]),
            Readiness::Failed
        );
    }

    #[test]
    fn test_client_id_format() {
        let client =
            RegistrationClient::new(CcuConfig::default(), SubscriptionRegistry::new()).unwrap();
        let a = client.generate_client_id("HmIP-RF");
        let b = client.generate_client_id("HmIP-RF");

        assert!(a.starts_with("ccu-bridge-HmIP-RF-"));
        assert_eq!(a.len(), "ccu-bridge-HmIP-RF-".len() + 32);
        assert_ne!(a, b);
    }

    #[tokio::test]
    async fn test_client_id_is_stable_per_interface() {
        let client =
            RegistrationClient::new(CcuConfig::default(), SubscriptionRegistry::new()).unwrap();

        let first = client.client_id_for("HmIP-RF").await;
        assert_eq!(client.client_id_for("HmIP-RF").await, first);
        assert_ne!(client.client_id_for("BidCos-RF").await, first);

        // Clones share the same ids
        assert_eq!(client.clone().client_id_for("HmIP-RF").await, first);
    }

    #[test]
    fn test_readiness_display() {
        let degraded = Readiness::Degraded {
            failed: vec!["HmIP-RF".into()],
        };
        assert_eq!(degraded.to_string(), "degraded (HmIP-RF failed)");
    }
}
