//! Common test utilities
//!
//! A wiremock-based stand-in for CCU interfaces plus configuration builders.

#![allow(dead_code)]

use ccu_event_bridge::config::{
    BridgeConfig, CcuConfig, Credentials, InterfaceConfig, ServerConfig, StoreConfig,
    WatchdogConfig,
};
use ccu_event_bridge::filter::FilterConfig;
use ccu_event_bridge::registration::BackoffPolicy;
use ccu_event_bridge::xmlrpc::{decode_call, encode_fault, encode_response, MethodCall, Value};
use std::time::Duration;
use url::Url;
use wiremock::{
    matchers::{body_string_contains, method},
    Mock, MockServer, ResponseTemplate,
};

/// Mock CCU interface answering `init`
pub struct MockCcu {
    pub server: MockServer,
}

impl MockCcu {
    /// Interface that accepts every `init`
    pub async fn accepting() -> Self {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(body_string_contains("<methodName>init</methodName>"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("content-type", "text/xml")
                    .set_body_string(encode_response(&Value::empty())),
            )
            .mount(&server)
            .await;
        Self { server }
    }

    /// Interface that answers every `init` with a fault
    pub async fn faulting(code: i32, message: &str) -> Self {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("content-type", "text/xml")
                    .set_body_string(encode_fault(code, message)),
            )
            .mount(&server)
            .await;
        Self { server }
    }

    /// Interface that answers with a bare HTTP status
    pub async fn with_status(status: u16) -> Self {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(status))
            .mount(&server)
            .await;
        Self { server }
    }

    pub fn url(&self) -> Url {
        self.server.uri().parse().unwrap()
    }

    /// Every `init` call received so far, decoded
    pub async fn init_calls(&self) -> Vec<MethodCall> {
        self.server
            .received_requests()
            .await
            .unwrap_or_default()
            .iter()
            .filter_map(|r| decode_call(&r.body).ok())
            .filter(|c| c.method == "init")
            .collect()
    }
}

/// URL of a port nothing listens on
pub async fn unreachable_url() -> Url {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);
    format!("http://127.0.0.1:{port}/").parse().unwrap()
}

pub fn interface(id: &str, url: Url) -> InterfaceConfig {
    InterfaceConfig::new(id, url)
}

/// Outbound settings tuned for fast tests
pub fn ccu_config() -> CcuConfig {
    CcuConfig {
        credentials: Some(Credentials {
            username: "Admin".into(),
            password: "secret".into(),
        }),
        request_timeout: Duration::from_secs(2),
        retry: BackoffPolicy {
            max_attempts: 2,
            initial_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(50),
            ..BackoffPolicy::default()
        },
        renew_interval: Duration::ZERO,
        ..CcuConfig::default()
    }
}

/// Bridge on an ephemeral loopback port with an in-memory store
pub fn bridge_config(interfaces: Vec<InterfaceConfig>) -> BridgeConfig {
    BridgeConfig {
        server: ServerConfig {
            bind_host: "127.0.0.1".into(),
            port: 0,
            callback_host: Some("127.0.0.1".into()),
            auth: None,
            processing_timeout: Duration::from_secs(5),
            max_body_size: 64 * 1024 * 1024,
        },
        ccu: ccu_config(),
        interfaces,
        filter: FilterConfig::new(["HM1", "000A1BE9A7F2C4"], Vec::<String>::new()),
        store: StoreConfig::Memory,
        watchdog: WatchdogConfig::default(),
        webhook: None,
    }
}
