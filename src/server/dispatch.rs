//! Inbound XML-RPC method dispatch
//!
//! Every call the CCU makes lands in [`Dispatcher::dispatch`]. Only `event`
//! mutates anything; the device announcement methods are acknowledged and
//! logged. Malformed arguments and unknown methods are answered with a fault,
//! never with an HTTP error.

use super::webhook::StateWebhook;
use crate::error::ErrorCode;
use crate::filter::DeviceFilter;
use crate::registration::SubscriptionRegistry;
use crate::store::{StateRecord, StateStore, UpsertOutcome};
use crate::xmlrpc::{Fault, MethodCall, Value};
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Seconds a stored timestamp may lead the local clock before it is reported
const CLOCK_SKEW_TOLERANCE_SECS: i64 = 5;

/// Methods advertised by `system.listMethods`
pub const SUPPORTED_METHODS: &[&str] = &[
    "event",
    "listDevices",
    "newDevices",
    "deleteDevices",
    "newDevice",
    "updateDevice",
    "replaceDevice",
    "readdedDevice",
    "setReadyConfig",
    "system.listMethods",
    "system.methodHelp",
    "system.methodSignature",
    "system.multicall",
];

/// One inbound value change
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceEvent {
    pub interface: String,
    pub device_id: String,
    pub parameter: String,
    pub value: Value,
    pub received_at: DateTime<Utc>,
}

impl DeviceEvent {
    fn into_record(self) -> StateRecord {
        StateRecord::new(
            self.device_id,
            self.parameter,
            self.interface,
            self.value,
            self.received_at,
        )
    }
}

/// Routes decoded calls to filter, store and webhook
#[derive(Clone)]
pub struct Dispatcher {
    filter: DeviceFilter,
    store: Arc<dyn StateStore>,
    registry: SubscriptionRegistry,
    webhook: Option<StateWebhook>,
}

impl Dispatcher {
    pub fn new(
        filter: DeviceFilter,
        store: Arc<dyn StateStore>,
        registry: SubscriptionRegistry,
    ) -> Self {
        Self {
            filter,
            store,
            registry,
            webhook: None,
        }
    }

    pub fn with_webhook(mut self, webhook: StateWebhook) -> Self {
        self.webhook = Some(webhook);
        self
    }

    /// Handle one call; `listener` names the interface of a dedicated port
    pub async fn dispatch(&self, call: MethodCall, listener: Option<&str>) -> Result<Value, Fault> {
        if call.method == "system.multicall" {
            return self.multicall(call.params, listener).await;
        }
        self.dispatch_single(call, listener).await
    }

    async fn multicall(&self, params: Vec<Value>, listener: Option<&str>) -> Result<Value, Fault> {
        let calls = match params.as_slice() {
            [Value::Array(calls)] => calls,
            _ => return Err(malformed("system.multicall expects one array argument")),
        };

        let mut results = Vec::with_capacity(calls.len());
        for entry in calls {
            let outcome = match parse_multicall_entry(entry) {
                Ok(call) if call.method == "system.multicall" => {
                    Err(Fault::new(
                        ErrorCode::UnsupportedOperation.as_number(),
                        "recursive system.multicall is not allowed",
                    ))
                }
                Ok(call) => self.dispatch_single(call, listener).await,
                Err(fault) => Err(fault),
            };
            results.push(match outcome {
                Ok(value) => Value::Array(vec![value]),
                Err(fault) => fault.to_value(),
            });
        }
        Ok(Value::Array(results))
    }

    async fn dispatch_single(&self, call: MethodCall, listener: Option<&str>) -> Result<Value, Fault> {
        match call.method.as_str() {
            "event" => self.event(&call.params, listener).await,
            "listDevices" => Ok(Value::Array(Vec::new())),
            "newDevices" => {
                let (client_id, devices) = client_and_array(&call.params, "newDevices")?;
                info!(client_id, count = devices.len(), "CCU announced devices");
                for device in devices {
                    if let Some(address) = device_address(device) {
                        debug!(address, "New device");
                    }
                }
                Ok(Value::empty())
            }
            "deleteDevices" => {
                let (client_id, devices) = client_and_array(&call.params, "deleteDevices")?;
                let addresses: Vec<&str> = devices.iter().filter_map(Value::as_str).collect();
                info!(client_id, ?addresses, "CCU removed devices, stored values are kept");
                Ok(Value::empty())
            }
            "newDevice" | "updateDevice" | "replaceDevice" | "readdedDevice" | "setReadyConfig" => {
                debug!(method = %call.method, "Acknowledged informational call");
                Ok(Value::empty())
            }
            "system.listMethods" => Ok(Value::Array(
                SUPPORTED_METHODS.iter().map(|m| Value::from(*m)).collect(),
            )),
            "system.methodHelp" => Ok(Value::empty()),
            "system.methodSignature" => Ok(Value::Array(Vec::new())),
            other => {
                warn!(method = other, "Unknown method called");
                Err(Fault::new(
                    ErrorCode::UnsupportedOperation.as_number(),
                    format!("unknown method {other}"),
                ))
            }
        }
    }

    async fn event(&self, params: &[Value], listener: Option<&str>) -> Result<Value, Fault> {
        let (client_id, device_id, parameter, value) = match params {
            [Value::String(c), Value::String(d), Value::String(p), v] => (c, d, p, v),
            _ => {
                return Err(malformed(
                    "event expects (interfaceId, address, parameter, value)",
                ))
            }
        };

        if !self.filter.accept(device_id, parameter) {
            return Ok(Value::empty());
        }

        let interface = match listener {
            Some(name) => name.to_string(),
            None => self
                .registry
                .interface_for(client_id)
                .await
                .unwrap_or_else(|| client_id.clone()),
        };

        let event = DeviceEvent {
            interface,
            device_id: device_id.clone(),
            parameter: parameter.clone(),
            value: value.clone(),
            received_at: Utc::now(),
        };
        self.record(event).await;
        Ok(Value::empty())
    }

    async fn record(&self, event: DeviceEvent) {
        let device_id = event.device_id.clone();
        let parameter = event.parameter.clone();
        let value = event.value.to_string();
        let received_at = event.received_at;

        match self.store.upsert(event.into_record()).await {
            Ok(UpsertOutcome::Written) => {
                debug!(device = %device_id, param = %parameter, %value, "Stored value");
                if let Some(hook) = self.webhook.as_ref().filter(|h| h.applies_to(&parameter)) {
                    hook.fire(&device_id, &parameter);
                }
            }
            Ok(UpsertOutcome::Superseded) => {
                // Receipt times come from the wall clock; a clock stepped back
                // makes every new value look older than the stored one
                if let Ok(Some(stored)) = self.store.get(&device_id, &parameter).await {
                    if let Some(lead) = clock_lead(stored.last_updated, received_at) {
                        warn!(
                            device = %device_id,
                            param = %parameter,
                            lead_secs = lead.num_seconds(),
                            "Stored value is ahead of the local clock, new value dropped"
                        );
                    }
                }
            }
            Err(e) => warn!(
                device = %device_id,
                param = %parameter,
                "Dropping event, store failed: {e}"
            ),
        }
    }
}

/// How far `stored` lies in the future of `received`, beyond the tolerance
fn clock_lead(stored: DateTime<Utc>, received: DateTime<Utc>) -> Option<chrono::Duration> {
    let lead = stored - received;
    (lead > chrono::Duration::seconds(CLOCK_SKEW_TOLERANCE_SECS)).then_some(lead)
}

fn malformed(message: &str) -> Fault {
    Fault::new(ErrorCode::MessageMalformed.as_number(), message)
}

fn client_and_array<'a>(params: &'a [Value], method: &str) -> Result<(&'a str, &'a [Value]), Fault> {
    match params {
        [Value::String(client_id), Value::Array(items)] => Ok((client_id, items)),
        _ => Err(malformed(&format!("{method} expects (interfaceId, array)"))),
    }
}

fn device_address(description: &Value) -> Option<&str> {
    description.as_struct()?.get("ADDRESS")?.as_str()
}

fn parse_multicall_entry(entry: &Value) -> Result<MethodCall, Fault> {
    let fields: &BTreeMap<String, Value> = entry
        .as_struct()
        .ok_or_else(|| malformed("multicall entry must be a struct"))?;
    let method = fields
        .get("methodName")
        .and_then(Value::as_str)
        .ok_or_else(|| malformed("multicall entry lacks methodName"))?;
    let params = match fields.get("params") {
        Some(Value::Array(params)) => params.clone(),
        None => Vec::new(),
        Some(_) => return Err(malformed("multicall params must be an array")),
    };
    Ok(MethodCall::new(method, params))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filter::FilterConfig;
    use crate::store::MemoryStore;
    use pretty_assertions::assert_eq;

    fn dispatcher() -> (Dispatcher, MemoryStore) {
        let store = MemoryStore::new();
        let filter = DeviceFilter::new(FilterConfig::new(["HM1"], Vec::<String>::new()));
        let dispatcher = Dispatcher::new(
            filter,
            Arc::new(store.clone()),
            SubscriptionRegistry::new(),
        );
        (dispatcher, store)
    }

    fn event(device: &str, value: Value) -> MethodCall {
        MethodCall::new(
            "event",
            vec![
                "ccu-bridge-HmIP-RF-x".into(),
                device.into(),
                "STATE".into(),
                value,
            ],
        )
    }

    #[tokio::test]
    async fn test_accepted_event_is_stored() {
        let (dispatcher, store) = dispatcher();
        let answer = dispatcher
            .dispatch(event("HM1", Value::Boolean(true)), Some("HmIP-RF"))
            .await
            .unwrap();

        assert_eq!(answer, Value::empty());
        let record = store.get("HM1", "STATE").await.unwrap().unwrap();
        assert_eq!(record.value, Value::Boolean(true));
        assert_eq!(record.interface, "HmIP-RF");
    }

    #[test]
    fn test_clock_lead() {
        let now = Utc::now();
        assert_eq!(clock_lead(now, now), None);
        assert_eq!(clock_lead(now + chrono::Duration::seconds(2), now), None);
        assert_eq!(
            clock_lead(now + chrono::Duration::hours(1), now),
            Some(chrono::Duration::hours(1))
        );
    }

    #[tokio::test]
    async fn test_value_stamped_in_the_future_is_kept() {
        let (dispatcher, store) = dispatcher();
        let ahead = StateRecord::new(
            "HM1",
            "STATE",
            "HmIP-RF",
            Value::Boolean(true),
            Utc::now() + chrono::Duration::hours(1),
        );
        store.upsert(ahead.clone()).await.unwrap();

        let answer = dispatcher
            .dispatch(event("HM1", Value::Boolean(false)), Some("HmIP-RF"))
            .await
            .unwrap();

        assert_eq!(answer, Value::empty());
        assert_eq!(store.get("HM1", "STATE").await.unwrap(), Some(ahead));
    }

    #[tokio::test]
    async fn test_unlisted_device_is_acknowledged_but_not_stored() {
        let (dispatcher, store) = dispatcher();
        let answer = dispatcher
            .dispatch(event("UNLISTED_DEVICE", Value::Boolean(true)), None)
            .await
            .unwrap();

        assert_eq!(answer, Value::empty());
        assert!(store.is_empty().await);
    }

    #[tokio::test]
    async fn test_interface_from_registry() {
        let (dispatcher, store) = dispatcher();
        dispatcher
            .dispatch(event("HM1:1", Value::Int(3)), None)
            .await
            .unwrap();

        // No registration known for this client id, so the id itself is kept
        let record = store.get("HM1:1", "STATE").await.unwrap().unwrap();
        assert_eq!(record.interface, "ccu-bridge-HmIP-RF-x");
    }

    #[tokio::test]
    async fn test_event_with_wrong_arity_faults() {
        let (dispatcher, _) = dispatcher();
        let fault = dispatcher
            .dispatch(MethodCall::new("event", vec!["only-one".into()]), None)
            .await
            .unwrap_err();

        assert_eq!(fault.code, ErrorCode::MessageMalformed.as_number());
    }

    #[tokio::test]
    async fn test_container_value_is_dropped_not_faulted() {
        let (dispatcher, store) = dispatcher();
        let answer = dispatcher
            .dispatch(event("HM1", Value::Array(vec![])), None)
            .await
            .unwrap();

        assert_eq!(answer, Value::empty());
        assert!(store.is_empty().await);
    }

    #[tokio::test]
    async fn test_informational_methods() {
        let (dispatcher, _) = dispatcher();
        let devices = Value::Array(vec![Value::Struct(
            [("ADDRESS".to_string(), Value::from("HM2"))].into_iter().collect(),
        )]);

        for call in [
            MethodCall::new("newDevices", vec!["id".into(), devices.clone()]),
            MethodCall::new(
                "deleteDevices",
                vec!["id".into(), Value::Array(vec![Value::from("HM2")])],
            ),
            MethodCall::new("setReadyConfig", vec![]),
        ] {
            assert_eq!(dispatcher.dispatch(call, None).await.unwrap(), Value::empty());
        }

        let listed = dispatcher
            .dispatch(MethodCall::new("listDevices", vec!["id".into()]), None)
            .await
            .unwrap();
        assert_eq!(listed, Value::Array(vec![]));
    }

    #[tokio::test]
    async fn test_unknown_method_faults() {
        let (dispatcher, _) = dispatcher();
        let fault = dispatcher
            .dispatch(MethodCall::new("reboot", vec![]), None)
            .await
            .unwrap_err();
        assert_eq!(fault.code, ErrorCode::UnsupportedOperation.as_number());
    }

    #[tokio::test]
    async fn test_multicall_wraps_results_and_faults() {
        let (dispatcher, store) = dispatcher();
        let entry = |method: &str, params: Vec<Value>| {
            Value::Struct(
                [
                    ("methodName".to_string(), Value::from(method)),
                    ("params".to_string(), Value::Array(params)),
                ]
                .into_iter()
                .collect(),
            )
        };
        let calls = Value::Array(vec![
            entry(
                "event",
                vec!["id".into(), "HM1".into(), "LEVEL".into(), Value::Double(0.5)],
            ),
            entry("nope", vec![]),
            entry("system.multicall", vec![]),
        ]);

        let result = dispatcher
            .dispatch(MethodCall::new("system.multicall", vec![calls]), None)
            .await
            .unwrap();

        let items = result.as_array().unwrap();
        assert_eq!(items.len(), 3);
        assert_eq!(items[0], Value::Array(vec![Value::empty()]));
        assert_eq!(
            items[1].as_struct().unwrap()["faultCode"],
            Value::Int(ErrorCode::UnsupportedOperation.as_number())
        );
        assert!(items[2].as_struct().unwrap().contains_key("faultString"));
        assert!(store.get("HM1", "LEVEL").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_list_methods() {
        let (dispatcher, _) = dispatcher();
        let methods = dispatcher
            .dispatch(MethodCall::new("system.listMethods", vec![]), None)
            .await
            .unwrap();
        assert!(methods
            .as_array()
            .unwrap()
            .contains(&Value::from("system.multicall")));
    }
}
