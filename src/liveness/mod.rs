//! Supervisor liveness protocol
//!
//! - [`probe`]: "last served" stamp touched by the event server
//! - [`monitor`]: periodic check that turns a fresh stamp into `WATCHDOG=1`
//! - [`notify`]: `sd_notify` datagrams

pub mod monitor;
pub mod notify;
pub mod probe;

pub use monitor::{resolve_deadline, Health, LivenessMonitor};
pub use notify::{
    notifier_from_env, NoopNotifier, SupervisorMessage, SupervisorNotifier, SystemdNotifier,
};
pub use probe::LivenessProbe;
