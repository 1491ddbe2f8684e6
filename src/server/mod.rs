//! Callback listener for CCU-initiated XML-RPC calls
//!
//! One shared listener serves every interface without a dedicated callback
//! port; each interface that has one gets its own listener, which tags its
//! events with that interface. All listeners share one [`Dispatcher`].

pub mod dispatch;
pub mod webhook;

pub use dispatch::{DeviceEvent, Dispatcher, SUPPORTED_METHODS};
pub use webhook::StateWebhook;

use crate::config::{InterfaceConfig, ServerConfig};
use crate::error::{BridgeError, ErrorCode, Result};
use crate::liveness::LivenessProbe;
use crate::xmlrpc::{decode_call, encode_fault, encode_response};
use axum::{
    body::Body,
    extract::{DefaultBodyLimit, Request, State},
    http::{header, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::post,
    Router,
};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

/// Per-listener state
pub struct AppState {
    pub dispatcher: Arc<Dispatcher>,
    pub probe: LivenessProbe,
    /// Expected `Authorization` header, if inbound auth is enabled
    pub expected_auth: Option<String>,
    pub processing_timeout: Duration,
    /// Bodies above this size are answered with a fault
    pub max_body_size: usize,
    /// Interface served exclusively by this listener
    pub interface: Option<String>,
}

impl AppState {
    async fn process(&self, body: &[u8]) -> String {
        let call = match decode_call(body) {
            Ok(call) => call,
            Err(e) => {
                warn!("Rejecting undecodable call: {e}");
                return encode_fault(ErrorCode::MessageMalformed.as_number(), &e.to_string());
            }
        };

        debug!(method = %call.method, "Inbound call");
        match self.dispatcher.dispatch(call, self.interface.as_deref()).await {
            Ok(value) => encode_response(&value),
            Err(fault) => encode_fault(fault.code, &fault.message),
        }
    }
}

/// Router answering XML-RPC on `/` and `/RPC2`
pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/", post(handle_rpc))
        .route("/RPC2", post(handle_rpc))
        .layer(DefaultBodyLimit::disable())
        .layer(middleware::from_fn_with_state(state.clone(), basic_auth))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn handle_rpc(State(state): State<Arc<AppState>>, body: Body) -> Response {
    let xml = match axum::body::to_bytes(body, state.max_body_size).await {
        Ok(bytes) => {
            match tokio::time::timeout(state.processing_timeout, state.process(&bytes)).await {
                Ok(xml) => xml,
                Err(_) => {
                    warn!(deadline = ?state.processing_timeout, "Call exceeded processing deadline");
                    encode_fault(
                        ErrorCode::ServiceTimeout.as_number(),
                        "processing deadline exceeded",
                    )
                }
            }
        }
        Err(e) => {
            warn!(limit = state.max_body_size, "Rejecting unreadable or oversized body: {e}");
            encode_fault(
                ErrorCode::RequestTooLarge.as_number(),
                &format!("body unreadable or larger than {} bytes", state.max_body_size),
            )
        }
    };
    state.probe.touch();

    ([(header::CONTENT_TYPE, "text/xml")], xml).into_response()
}

async fn basic_auth(State(state): State<Arc<AppState>>, request: Request, next: Next) -> Response {
    let Some(expected) = &state.expected_auth else {
        return next.run(request).await;
    };

    let authorized = request
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        == Some(expected.as_str());
    if authorized {
        return next.run(request).await;
    }

    state.probe.touch();
    warn!("Rejected callback with missing or wrong credentials");
    (
        StatusCode::UNAUTHORIZED,
        [(header::WWW_AUTHENTICATE, "Basic realm=\"ccu-event-bridge\"")],
    )
        .into_response()
}

struct BoundListener {
    listener: TcpListener,
    router: Router,
    label: String,
}

/// One bound listener as seen by the liveness monitor
#[derive(Debug, Clone)]
pub struct ListenerHandle {
    /// `shared` or the interface id of a dedicated listener
    pub label: String,
    pub addr: SocketAddr,
    pub probe: LivenessProbe,
}

/// Bound, not yet serving, callback listeners
pub struct EventServer {
    handles: Vec<ListenerHandle>,
    listeners: Vec<BoundListener>,
}

impl EventServer {
    /// Bind every listener; failure to bind is fatal for the bridge
    pub async fn bind(
        config: &ServerConfig,
        interfaces: &[InterfaceConfig],
        dispatcher: Arc<Dispatcher>,
    ) -> Result<Self> {
        let dedicated = interfaces
            .iter()
            .filter_map(|iface| iface.callback_port.map(|port| (Some(iface.id.clone()), port)));
        let wanted = std::iter::once((None, config.port)).chain(dedicated);

        let expected_auth = config.auth.as_ref().map(|c| c.basic_header());
        let mut handles = Vec::new();
        let mut listeners = Vec::new();
        for (interface, port) in wanted {
            let listener = bind_listener(&config.bind_host, port).await?;
            let label = interface.clone().unwrap_or_else(|| "shared".to_string());
            let probe = LivenessProbe::new();
            let state = Arc::new(AppState {
                dispatcher: dispatcher.clone(),
                probe: probe.clone(),
                expected_auth: expected_auth.clone(),
                processing_timeout: config.processing_timeout,
                max_body_size: config.max_body_size,
                interface,
            });

            handles.push(ListenerHandle {
                label: label.clone(),
                addr: listener.local_addr()?,
                probe,
            });
            listeners.push(BoundListener {
                listener,
                router: router(state),
                label,
            });
        }

        Ok(Self { handles, listeners })
    }

    /// Address of the shared listener
    pub fn local_addr(&self) -> SocketAddr {
        self.handles[0].addr
    }

    /// Every listener, shared first
    pub fn handles(&self) -> &[ListenerHandle] {
        &self.handles
    }

    /// Port the CCU should call back on for `interface`
    pub fn port_for(&self, interface: &str) -> u16 {
        self.handles[1..]
            .iter()
            .find(|h| h.label == interface)
            .unwrap_or(&self.handles[0])
            .addr
            .port()
    }

    /// Serve until `shutdown` flips to true
    pub async fn serve(self, shutdown: watch::Receiver<bool>) -> Result<()> {
        let tasks = self.listeners.into_iter().map(|bound| {
            let mut shutdown = shutdown.clone();
            async move {
                info!(
                    listener = %bound.label,
                    addr = ?bound.listener.local_addr().ok(),
                    "Callback listener serving"
                );
                axum::serve(bound.listener, bound.router)
                    .with_graceful_shutdown(async move {
                        let _ = shutdown.wait_for(|stop| *stop).await;
                    })
                    .await
                    .map_err(|e| BridgeError::server(format!("Listener {} failed: {e}", bound.label)))
            }
        });

        for result in futures::future::join_all(tasks).await {
            result?;
        }
        Ok(())
    }
}

async fn bind_listener(host: &str, port: u16) -> Result<TcpListener> {
    TcpListener::bind((host, port))
        .await
        .map_err(|e| BridgeError::server(format!("Failed to bind {host}:{port}: {e}")))
}
