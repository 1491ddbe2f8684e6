//! Supervisor notifications (`sd_notify` protocol)
//!
//! Messages are single datagrams sent to the Unix socket named by
//! `NOTIFY_SOCKET`. A leading `@` selects the Linux abstract namespace.

use crate::error::{BridgeError, Result};
use std::fmt;
use std::os::unix::net::UnixDatagram;
use std::sync::Arc;
use tracing::debug;

/// One state change reported to the supervisor
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SupervisorMessage {
    Ready,
    Status(String),
    Watchdog,
    Stopping,
}

impl SupervisorMessage {
    pub fn payload(&self) -> String {
        match self {
            SupervisorMessage::Ready => "READY=1".to_string(),
            SupervisorMessage::Status(line) => format!("STATUS={line}"),
            SupervisorMessage::Watchdog => "WATCHDOG=1".to_string(),
            SupervisorMessage::Stopping => "STOPPING=1".to_string(),
        }
    }
}

/// Sink for supervisor messages
pub trait SupervisorNotifier: Send + Sync + fmt::Debug {
    fn notify(&self, message: &SupervisorMessage) -> Result<()>;
}

/// Used when the process is not run under a notifying supervisor
#[derive(Debug, Default)]
pub struct NoopNotifier;

impl SupervisorNotifier for NoopNotifier {
    fn notify(&self, _message: &SupervisorMessage) -> Result<()> {
        Ok(())
    }
}

/// Datagram notifier for systemd `Type=notify` services
#[derive(Debug, Clone)]
pub struct SystemdNotifier {
    socket: String,
}

impl SystemdNotifier {
    pub fn new(socket: impl Into<String>) -> Self {
        Self {
            socket: socket.into(),
        }
    }

    /// Notifier for `$NOTIFY_SOCKET`, if set
    pub fn from_env() -> Option<Self> {
        std::env::var("NOTIFY_SOCKET")
            .ok()
            .filter(|s| !s.is_empty())
            .map(Self::new)
    }

    fn send(&self, payload: &[u8]) -> std::io::Result<usize> {
        let socket = UnixDatagram::unbound()?;
        match self.socket.strip_prefix('@') {
            Some(name) => send_abstract(&socket, name, payload),
            None => socket.send_to(payload, &self.socket),
        }
    }
}

#[cfg(target_os = "linux")]
fn send_abstract(socket: &UnixDatagram, name: &str, payload: &[u8]) -> std::io::Result<usize> {
    use std::os::linux::net::SocketAddrExt;
    let addr = std::os::unix::net::SocketAddr::from_abstract_name(name.as_bytes())?;
    socket.send_to_addr(payload, &addr)
}

#[cfg(not(target_os = "linux"))]
fn send_abstract(_socket: &UnixDatagram, name: &str, _payload: &[u8]) -> std::io::Result<usize> {
    Err(std::io::Error::new(
        std::io::ErrorKind::Unsupported,
        format!("abstract socket @{name} requires Linux"),
    ))
}

impl SupervisorNotifier for SystemdNotifier {
    fn notify(&self, message: &SupervisorMessage) -> Result<()> {
        let payload = message.payload();
        self.send(payload.as_bytes())
            .map_err(|e| BridgeError::notify(format!("{} via {}: {e}", payload, self.socket)))?;
        debug!(message = %payload, "Notified supervisor");
        Ok(())
    }
}

/// Systemd notifier when `NOTIFY_SOCKET` is set, no-op otherwise
pub fn notifier_from_env() -> Arc<dyn SupervisorNotifier> {
    match SystemdNotifier::from_env() {
        Some(notifier) => Arc::new(notifier),
        None => Arc::new(NoopNotifier),
    }
}
