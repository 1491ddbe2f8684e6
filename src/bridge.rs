//! Composition root
//!
//! Startup order matters: listeners are bound and serving before any `init`
//! is sent, because the CCU calls back (`listDevices`, `newDevices`) while
//! the subscription is still being set up.

use crate::config::BridgeConfig;
use crate::error::Result;
use crate::filter::DeviceFilter;
use crate::liveness::{resolve_deadline, LivenessMonitor, SupervisorMessage, SupervisorNotifier};
use crate::registration::{Readiness, RegistrationClient, RegistrationTarget, SubscriptionRegistry};
use crate::server::{Dispatcher, EventServer, StateWebhook};
use crate::store::{open_store, StateStore};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// A started bridge; call [`RunningBridge::shutdown`] to stop it
pub struct RunningBridge {
    shutdown_tx: watch::Sender<bool>,
    server: JoinHandle<Result<()>>,
    background: Vec<JoinHandle<()>>,
    client: RegistrationClient,
    notifier: Arc<dyn SupervisorNotifier>,
    store: Arc<dyn StateStore>,
    local_addr: SocketAddr,
    readiness: Readiness,
}

impl RunningBridge {
    /// Outcome of the startup subscription round
    pub fn readiness(&self) -> &Readiness {
        &self.readiness
    }

    /// Address of the shared callback listener
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn store(&self) -> Arc<dyn StateStore> {
        self.store.clone()
    }

    pub fn registry(&self) -> &SubscriptionRegistry {
        self.client.registry()
    }

    /// Deregister, stop listeners and background tasks
    pub async fn shutdown(self) -> Result<()> {
        info!("Shutting down");
        notify(&*self.notifier, SupervisorMessage::Stopping);

        self.client.unsubscribe_all().await;
        let _ = self.shutdown_tx.send(true);

        for task in self.background {
            if let Err(e) = task.await {
                warn!("Background task ended abnormally: {e}");
            }
        }
        match self.server.await {
            Ok(result) => result,
            Err(e) => {
                error!("Listener task panicked: {e}");
                Ok(())
            }
        }
    }
}

/// Start serving and subscribe every configured interface
pub async fn start(
    config: BridgeConfig,
    notifier: Arc<dyn SupervisorNotifier>,
) -> Result<RunningBridge> {
    let store = open_store(&config.store).await?;
    let registry = SubscriptionRegistry::new();

    let mut dispatcher = Dispatcher::new(
        DeviceFilter::new(config.filter.clone()),
        store.clone(),
        registry.clone(),
    );
    if let Some(webhook) = &config.webhook {
        dispatcher = dispatcher.with_webhook(StateWebhook::new(webhook)?);
    }

    let server = EventServer::bind(&config.server, &config.interfaces, Arc::new(dispatcher)).await?;
    let local_addr = server.local_addr();
    let listeners = server.handles().to_vec();
    let host = config.server.advertised_host();
    let targets: Vec<RegistrationTarget> = config
        .interfaces
        .iter()
        .map(|iface| {
            let url = format!("http://{host}:{}", server.port_for(&iface.id));
            RegistrationTarget::new(iface.clone(), url)
        })
        .collect();

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let server = tokio::spawn(server.serve(shutdown_rx.clone()));
    info!(addr = %local_addr, callback_host = %host, "Callback listener bound");

    let client = RegistrationClient::new(config.ccu.clone(), registry)?;
    let readiness = client.subscribe_all(&targets).await;
    if readiness == Readiness::Failed {
        error!("No interface could be subscribed, retrying with each renewal");
    }
    notify(&*notifier, SupervisorMessage::Ready);
    notify(&*notifier, SupervisorMessage::Status(readiness.to_string()));

    let mut background = Vec::new();

    match resolve_deadline(config.watchdog.timeout) {
        Some(deadline) => {
            let mut monitor =
                LivenessMonitor::new(notifier.clone(), deadline, config.server.auth.as_ref())?;
            for listener in listeners {
                let url = loopback_url(listener.addr)?;
                monitor = monitor.watch(listener.label, listener.probe, Some(url));
            }
            background.push(tokio::spawn(monitor.run(shutdown_rx.clone())));
        }
        None => debug!("No watchdog deadline configured, liveness monitor disabled"),
    }

    if !config.ccu.renew_interval.is_zero() {
        background.push(tokio::spawn(renewal_loop(
            client.clone(),
            targets,
            config.ccu.renew_interval,
            readiness.clone(),
            notifier.clone(),
            shutdown_rx,
        )));
    }

    Ok(RunningBridge {
        shutdown_tx,
        server,
        background,
        client,
        notifier,
        store,
        local_addr,
        readiness,
    })
}

/// Run until SIGINT/SIGTERM, then shut down cleanly
pub async fn run(config: BridgeConfig, notifier: Arc<dyn SupervisorNotifier>) -> Result<()> {
    let running = start(config, notifier).await?;
    wait_for_signal().await;
    running.shutdown().await
}

/// Periodically renew every subscription; lost ones are retried the same way
async fn renewal_loop(
    client: RegistrationClient,
    targets: Vec<RegistrationTarget>,
    every: Duration,
    mut last: Readiness,
    notifier: Arc<dyn SupervisorNotifier>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut interval = tokio::time::interval_at(tokio::time::Instant::now() + every, every);
    loop {
        tokio::select! {
            _ = interval.tick() => {}
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    return;
                }
                continue;
            }
        }

        let readiness = client.renew_all(&targets).await;
        if readiness != last {
            info!(%readiness, "Subscription state changed");
            notify(&*notifier, SupervisorMessage::Status(readiness.to_string()));
            last = readiness;
        }
    }
}

fn loopback_url(addr: SocketAddr) -> Result<url::Url> {
    let ip = match addr.ip() {
        IpAddr::V4(ip) if ip.is_unspecified() => IpAddr::V4(Ipv4Addr::LOCALHOST),
        IpAddr::V6(ip) if ip.is_unspecified() => IpAddr::V6(Ipv6Addr::LOCALHOST),
        ip => ip,
    };
    let raw = format!("http://{}/", SocketAddr::new(ip, addr.port()));
    raw.parse()
        .map_err(|e| crate::error::BridgeError::config(format!("Invalid loopback URL {raw}: {e}")))
}

fn notify(notifier: &dyn SupervisorNotifier, message: SupervisorMessage) {
    if let Err(e) = notifier.notify(&message) {
        warn!("{e}");
    }
}

async fn wait_for_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Cannot listen for Ctrl-C: {e}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!("Cannot listen for SIGTERM: {e}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl-C"),
        _ = terminate => info!("Received SIGTERM"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_loopback_url() {
        let any: SocketAddr = "0.0.0.0:8001".parse().unwrap();
        assert_eq!(loopback_url(any).unwrap().as_str(), "http://127.0.0.1:8001/");

        let v6: SocketAddr = "[::]:8001".parse().unwrap();
        assert_eq!(loopback_url(v6).unwrap().as_str(), "http://[::1]:8001/");

        let fixed: SocketAddr = "192.168.1.20:8001".parse().unwrap();
        assert_eq!(loopback_url(fixed).unwrap().as_str(), "http://192.168.1.20:8001/");
    }
}
