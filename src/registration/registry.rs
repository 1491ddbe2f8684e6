//! Shared record of live subscriptions
//!
//! Written by the registration client, read by the event server to attribute
//! inbound calls to an interface via the client id the CCU echoes back.

use super::client::ClientRegistration;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

#[derive(Debug, Clone, Default)]
pub struct SubscriptionRegistry {
    by_client_id: Arc<RwLock<HashMap<String, ClientRegistration>>>,
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a registration, replacing any older one for the same interface
    pub async fn insert(&self, registration: ClientRegistration) {
        let mut map = self.by_client_id.write().await;
        map.retain(|_, r| r.interface != registration.interface);
        map.insert(registration.client_id.clone(), registration);
    }

    /// Interface a client id was issued for
    pub async fn interface_for(&self, client_id: &str) -> Option<String> {
        self.by_client_id
            .read()
            .await
            .get(client_id)
            .map(|r| r.interface.clone())
    }

    pub async fn is_subscribed(&self, interface: &str) -> bool {
        self.by_client_id
            .read()
            .await
            .values()
            .any(|r| r.interface == interface)
    }

    pub async fn remove_interface(&self, interface: &str) -> Option<ClientRegistration> {
        let mut map = self.by_client_id.write().await;
        let client_id = map
            .iter()
            .find(|(_, r)| r.interface == interface)
            .map(|(id, _)| id.clone())?;
        map.remove(&client_id)
    }

    /// Snapshot ordered by interface name
    pub async fn registrations(&self) -> Vec<ClientRegistration> {
        let mut all: Vec<_> = self.by_client_id.read().await.values().cloned().collect();
        all.sort_by(|a, b| a.interface.cmp(&b.interface));
        all
    }

    pub(crate) async fn drain(&self) -> Vec<ClientRegistration> {
        self.by_client_id
            .write()
            .await
            .drain()
            .map(|(_, r)| r)
            .collect()
    }
}
