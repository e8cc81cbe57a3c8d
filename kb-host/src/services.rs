//! `AdapterService` implementations (spec.md §4.4) that dispatch `adapter:call`
//! frames from a sandboxed child to the shared [`PlatformContainer`] (C9 step 3,
//! "dispatches incoming adapter:call frames to the matching platform service
//! methods... by reflection" — here, a plain match on `method` per adapter, Rust
//! having no runtime reflection to genuinely dispatch by name).

use std::sync::Arc;

use kb_core::error::ErrorEnvelope;
use kb_sandbox::transport::AdapterService;
use serde_json::Value;

use crate::platform::PlatformContainer;

fn internal_error(message: impl Into<String>) -> ErrorEnvelope {
    ErrorEnvelope { name: "Error".into(), message: message.into(), code: "INTERNAL_ERROR".into(), details: None, stack: None }
}

fn missing_arg(method: &str, index: usize) -> ErrorEnvelope {
    internal_error(format!("{method}: missing argument at index {index}"))
}

pub struct StateAdapterService {
    platform: Arc<PlatformContainer>,
}

impl StateAdapterService {
    pub fn new(platform: Arc<PlatformContainer>) -> Self {
        Self { platform }
    }
}

#[async_trait::async_trait]
impl AdapterService for StateAdapterService {
    async fn call(&self, method: &str, args: Vec<Value>) -> Result<Value, ErrorEnvelope> {
        match method {
            "get" => {
                let key = args.first().and_then(Value::as_str).ok_or_else(|| missing_arg("get", 0))?;
                Ok(self.platform.state_get(key).await.unwrap_or(Value::Null))
            }
            "set" => {
                let key = args.first().and_then(Value::as_str).ok_or_else(|| missing_arg("set", 0))?.to_string();
                let value = args.get(1).cloned().unwrap_or(Value::Null);
                let ttl_ms = args.get(2).and_then(Value::as_u64);
                self.platform.state_set(&key, value, ttl_ms).await;
                Ok(Value::Null)
            }
            "delete" => {
                let key = args.first().and_then(Value::as_str).ok_or_else(|| missing_arg("delete", 0))?;
                self.platform.state_delete(key).await;
                Ok(Value::Null)
            }
            other => Err(internal_error(format!("unknown state method '{other}'"))),
        }
    }
}

pub struct EventsAdapterService {
    platform: Arc<PlatformContainer>,
}

impl EventsAdapterService {
    pub fn new(platform: Arc<PlatformContainer>) -> Self {
        Self { platform }
    }
}

#[async_trait::async_trait]
impl AdapterService for EventsAdapterService {
    async fn call(&self, method: &str, args: Vec<Value>) -> Result<Value, ErrorEnvelope> {
        match method {
            "emit" => {
                let name = args.first().and_then(Value::as_str).ok_or_else(|| missing_arg("emit", 0))?;
                let payload = args.get(1).cloned().unwrap_or(Value::Null);
                self.platform.emit_event(name, payload).await;
                Ok(Value::Null)
            }
            other => Err(internal_error(format!("unknown events method '{other}'"))),
        }
    }
}

pub struct InvokeAdapterService {
    platform: Arc<PlatformContainer>,
}

impl InvokeAdapterService {
    pub fn new(platform: Arc<PlatformContainer>) -> Self {
        Self { platform }
    }
}

#[async_trait::async_trait]
impl AdapterService for InvokeAdapterService {
    async fn call(&self, method: &str, args: Vec<Value>) -> Result<Value, ErrorEnvelope> {
        match method {
            "call" => {
                let target = args.first().and_then(Value::as_str).ok_or_else(|| missing_arg("call", 0))?.to_string();
                let input = args.get(1).cloned().unwrap_or(Value::Null);
                let parent_request_id = args.get(2).and_then(Value::as_str).map(str::to_string);
                self.platform.invoke(&target, input, parent_request_id).await.map_err(|e| ErrorEnvelope::wrap(&e))
            }
            other => Err(internal_error(format!("unknown invoke method '{other}'"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn state_service_round_trips() {
        let platform = Arc::new(PlatformContainer::new());
        let service = StateAdapterService::new(platform);
        service.call("set", vec![serde_json::json!("k"), serde_json::json!(1), Value::Null]).await.expect("set");
        let got = service.call("get", vec![serde_json::json!("k")]).await.expect("get");
        assert_eq!(got, serde_json::json!(1));
    }

    #[tokio::test]
    async fn unknown_method_is_an_internal_error() {
        let platform = Arc::new(PlatformContainer::new());
        let service = EventsAdapterService::new(platform);
        let err = service.call("bogus", vec![]).await.unwrap_err();
        assert_eq!(err.code, "INTERNAL_ERROR");
    }
}
