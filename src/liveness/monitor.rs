//! Watchdog heartbeat gated on event server liveness
//!
//! The monitor never exits the process. When the server stops handling calls
//! it simply stops sending `WATCHDOG=1` and leaves the restart to the
//! supervisor.

use super::notify::{SupervisorMessage, SupervisorNotifier};
use super::probe::LivenessProbe;
use crate::config::Credentials;
use crate::error::{BridgeError, Result};
use crate::xmlrpc::encode_call;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use reqwest::Client;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};
use url::Url;

/// Result of one monitor tick
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Health {
    Alive,
    /// At least one listener has not served a call within the deadline
    Stalled { listener: String, since: Duration },
}

/// A listener whose probe stamp gates the heartbeat
#[derive(Debug)]
struct Watched {
    label: String,
    probe: LivenessProbe,
    /// Loopback URL for a `system.listMethods` call while the listener is idle
    self_probe: Option<Url>,
    last_seen: u64,
}

#[derive(Debug)]
pub struct LivenessMonitor {
    watched: Vec<Watched>,
    notifier: Arc<dyn SupervisorNotifier>,
    deadline: Duration,
    http: Client,
}

impl LivenessMonitor {
    /// `auth` is presented on self-probes when inbound auth is enabled
    pub fn new(
        notifier: Arc<dyn SupervisorNotifier>,
        deadline: Duration,
        auth: Option<&Credentials>,
    ) -> Result<Self> {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("text/xml"));
        if let Some(credentials) = auth {
            let mut value = HeaderValue::from_str(&credentials.basic_header()).map_err(|e| {
                BridgeError::invalid_input(format!("Invalid authorization header: {e}"))
            })?;
            value.set_sensitive(true);
            headers.insert(AUTHORIZATION, value);
        }

        let http = Client::builder()
            .timeout(interval_for(deadline))
            .default_headers(headers)
            .build()
            .map_err(|e| BridgeError::config(format!("Failed to build probe client: {e}")))?;

        Ok(Self {
            watched: Vec::new(),
            notifier,
            deadline,
            http,
        })
    }

    /// Gate the heartbeat on `probe`, self-probing `url` when it goes idle
    pub fn watch(
        mut self,
        label: impl Into<String>,
        probe: LivenessProbe,
        url: Option<Url>,
    ) -> Self {
        let last_seen = probe.served();
        self.watched.push(Watched {
            label: label.into(),
            probe,
            self_probe: url,
            last_seen,
        });
        self
    }

    /// Tick period, a third of the deadline
    pub fn interval(&self) -> Duration {
        interval_for(self.deadline)
    }

    /// Check every listener once and heartbeat if all of them are alive
    pub async fn tick(&mut self) -> Health {
        let idle: Vec<Url> = self
            .watched
            .iter()
            .filter(|w| w.probe.served() == w.last_seen)
            .filter_map(|w| w.self_probe.clone())
            .collect();
        futures::future::join_all(idle.iter().map(|url| self.send_self_probe(url))).await;

        let deadline = self.deadline;
        let mut stalled: Option<(String, Duration)> = None;
        for watched in &mut self.watched {
            watched.last_seen = watched.probe.served();
            let age = watched.probe.since_last_served();
            if age > deadline && stalled.as_ref().map_or(true, |(_, worst)| age > *worst) {
                stalled = Some((watched.label.clone(), age));
            }
        }

        match stalled {
            None => {
                if let Err(e) = self.notifier.notify(&SupervisorMessage::Watchdog) {
                    warn!("Watchdog notification failed: {e}");
                }
                Health::Alive
            }
            Some((listener, age)) => {
                error!(
                    listener = %listener,
                    stalled_for = ?age,
                    deadline = ?self.deadline,
                    "Callback listener unresponsive, withholding watchdog heartbeat"
                );
                Health::Stalled {
                    listener,
                    since: age,
                }
            }
        }
    }

    async fn send_self_probe(&self, url: &Url) {
        let body = encode_call("system.listMethods", &[]);
        match self.http.post(url.clone()).body(body).send().await {
            Ok(response) => debug!(%url, status = %response.status(), "Self probe answered"),
            Err(e) => warn!(%url, "Self probe failed: {e}"),
        }
    }

    /// Tick until `shutdown` flips to true or its sender is dropped
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        let mut interval = tokio::time::interval(self.interval());
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(deadline = ?self.deadline, listeners = self.watched.len(), "Liveness monitor started");

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    self.tick().await;
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        debug!("Liveness monitor stopped");
    }
}

fn interval_for(deadline: Duration) -> Duration {
    (deadline / 3).max(Duration::from_millis(1))
}

/// Watchdog deadline: configured value, else systemd's `WATCHDOG_USEC`
pub fn resolve_deadline(configured: Option<Duration>) -> Option<Duration> {
    configured.or_else(|| deadline_from_lookup(|key| std::env::var(key).ok()))
}

fn deadline_from_lookup<F>(lookup: F) -> Option<Duration>
where
    F: Fn(&str) -> Option<String>,
{
    if let Some(pid) = lookup("WATCHDOG_PID") {
        if pid.trim().parse::<u32>().ok() != Some(std::process::id()) {
            return None;
        }
    }
    let usec = lookup("WATCHDOG_USEC")?.trim().parse::<u64>().ok()?;
    (usec > 0).then(|| Duration::from_micros(usec))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use wiremock::matchers::{body_string_contains, method};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[derive(Debug, Default)]
    struct Recorder(Mutex<Vec<SupervisorMessage>>);

    impl SupervisorNotifier for Recorder {
        fn notify(&self, message: &SupervisorMessage) -> Result<()> {
            self.0.lock().unwrap().push(message.clone());
            Ok(())
        }
    }

    impl Recorder {
        fn watchdogs(&self) -> usize {
            self.0
                .lock()
                .unwrap()
                .iter()
                .filter(|m| **m == SupervisorMessage::Watchdog)
                .count()
        }
    }

    fn monitor(recorder: Arc<Recorder>, deadline: Duration) -> LivenessMonitor {
        LivenessMonitor::new(recorder, deadline, None).unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn test_heartbeat_stops_when_server_stalls() {
        let probe = LivenessProbe::new();
        let recorder = Arc::new(Recorder::default());
        let mut monitor =
            monitor(recorder.clone(), Duration::from_secs(3)).watch("shared", probe.clone(), None);

        assert_eq!(monitor.tick().await, Health::Alive);
        assert_eq!(recorder.watchdogs(), 1);

        tokio::time::advance(Duration::from_secs(4)).await;
        assert!(matches!(monitor.tick().await, Health::Stalled { .. }));
        assert_eq!(recorder.watchdogs(), 1);

        probe.touch();
        assert_eq!(monitor.tick().await, Health::Alive);
        assert_eq!(recorder.watchdogs(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_one_stalled_listener_withholds_heartbeat() {
        let shared = LivenessProbe::new();
        let dedicated = LivenessProbe::new();
        let recorder = Arc::new(Recorder::default());
        let mut monitor = monitor(recorder.clone(), Duration::from_secs(3))
            .watch("shared", shared.clone(), None)
            .watch("HmIP-RF", dedicated.clone(), None);

        tokio::time::advance(Duration::from_secs(4)).await;
        shared.touch();

        match monitor.tick().await {
            Health::Stalled { listener, .. } => assert_eq!(listener, "HmIP-RF"),
            other => panic!("expected stall, got {other:?}"),
        }
        assert_eq!(recorder.watchdogs(), 0);

        dedicated.touch();
        assert_eq!(monitor.tick().await, Health::Alive);
        assert_eq!(recorder.watchdogs(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_stops_on_shutdown() {
        let recorder = Arc::new(Recorder::default());
        let monitor = monitor(recorder.clone(), Duration::from_secs(30)).watch(
            "shared",
            LivenessProbe::new(),
            None,
        );
        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn(monitor.run(rx));

        tokio::time::sleep(Duration::from_secs(1)).await;
        tx.send(true).unwrap();
        handle.await.unwrap();

        assert!(recorder.watchdogs() >= 1);
    }

    #[tokio::test]
    async fn test_idle_server_gets_self_probe() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(body_string_contains("system.listMethods"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let mut monitor = monitor(Arc::new(Recorder::default()), Duration::from_secs(3)).watch(
            "shared",
            LivenessProbe::new(),
            Some(server.uri().parse().unwrap()),
        );

        monitor.tick().await;
    }

    #[test]
    fn test_deadline_from_systemd_env() {
        let pid = std::process::id().to_string();
        let env = |pairs: Vec<(&'static str, String)>| {
            move |key: &str| {
                pairs
                    .iter()
                    .find(|(k, _)| *k == key)
                    .map(|(_, v)| v.clone())
            }
        };

        assert_eq!(
            deadline_from_lookup(env(vec![("WATCHDOG_USEC", "30000000".into())])),
            Some(Duration::from_secs(30))
        );
        assert_eq!(
            deadline_from_lookup(env(vec![
                ("WATCHDOG_USEC", "6000000".into()),
                ("WATCHDOG_PID", pid),
            ])),
            Some(Duration::from_secs(6))
        );
        assert_eq!(
            deadline_from_lookup(env(vec![
                ("WATCHDOG_USEC", "6000000".into()),
                ("WATCHDOG_PID", "1".into()),
            ])),
            None
        );
        assert_eq!(deadline_from_lookup(env(vec![])), None);
        assert_eq!(
            resolve_deadline(Some(Duration::from_secs(9))),
            Some(Duration::from_secs(9))
        );
    }
}
