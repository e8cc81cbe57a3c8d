//! The host platform container (spec.md §5 "shared by all invocations"): the process-
//! global state store, event log, and invoke dispatcher that the sandboxed child
//! reaches through the `state`/`events`/`invoke` adapters (spec.md §4.2, §4.4).

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::Mutex;

use kb_core::error::{Error, Result};

/// What the `invoke` adapter delegates to: resolving and running another plugin
/// command. `kb-host` only defines the contract; whoever owns the Command Registry
/// (`kb-cli`) implements it and wires it in with [`PlatformContainer::with_invoke_dispatch`].
#[async_trait::async_trait]
pub trait InvokeDispatch: Send + Sync {
    async fn invoke(&self, target_plugin_id: &str, input: serde_json::Value, parent_request_id: Option<String>) -> Result<serde_json::Value>;
}

struct StateEntry {
    value: serde_json::Value,
    expires_at: Option<Instant>,
}

/// Process-global state store, event log, and invoke dispatcher. The core only
/// assumes each method is independently safe to call concurrently (spec.md §5); a
/// `Mutex` around a plain map satisfies that without claiming any cross-call
/// transactional semantics.
pub struct PlatformContainer {
    state: Mutex<HashMap<String, StateEntry>>,
    events: Mutex<Vec<(String, serde_json::Value)>>,
    invoke_dispatch: Option<Arc<dyn InvokeDispatch>>,
}

impl PlatformContainer {
    pub fn new() -> Self {
        Self { state: Mutex::new(HashMap::new()), events: Mutex::new(Vec::new()), invoke_dispatch: None }
    }

    pub fn with_invoke_dispatch(mut self, dispatch: Arc<dyn InvokeDispatch>) -> Self {
        self.invoke_dispatch = Some(dispatch);
        self
    }

    pub async fn state_get(&self, key: &str) -> Option<serde_json::Value> {
        let mut map = self.state.lock().await;
        let expired = matches!(map.get(key), Some(e) if e.expires_at.is_some_and(|t| Instant::now() > t));
        if expired {
            map.remove(key);
            return None;
        }
        map.get(key).map(|e| e.value.clone())
    }

    pub async fn state_set(&self, key: &str, value: serde_json::Value, ttl_ms: Option<u64>) {
        let expires_at = ttl_ms.map(|ms| Instant::now() + Duration::from_millis(ms));
        self.state.lock().await.insert(key.to_string(), StateEntry { value, expires_at });
    }

    pub async fn state_delete(&self, key: &str) {
        self.state.lock().await.remove(key);
    }

    pub async fn emit_event(&self, name: &str, payload: serde_json::Value) {
        tracing::debug!(name, "platform event emitted");
        self.events.lock().await.push((name.to_string(), payload));
    }

    /// Events recorded so far, oldest first, for `kb` diagnostics commands.
    pub async fn recent_events(&self, limit: usize) -> Vec<(String, serde_json::Value)> {
        let events = self.events.lock().await;
        let start = events.len().saturating_sub(limit);
        events[start..].to_vec()
    }

    pub async fn invoke(&self, target_plugin_id: &str, input: serde_json::Value, parent_request_id: Option<String>) -> Result<serde_json::Value> {
        match &self.invoke_dispatch {
            Some(dispatch) => dispatch.invoke(target_plugin_id, input, parent_request_id).await,
            None => Err(Error::Internal("no invoke dispatcher configured on this host".into())),
        }
    }
}

impl Default for PlatformContainer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn state_round_trips() {
        let platform = PlatformContainer::new();
        platform.state_set("k", serde_json::json!(42), None).await;
        assert_eq!(platform.state_get("k").await, Some(serde_json::json!(42)));
        platform.state_delete("k").await;
        assert_eq!(platform.state_get("k").await, None);
    }

    #[tokio::test]
    async fn state_ttl_expires() {
        let platform = PlatformContainer::new();
        platform.state_set("k", serde_json::json!(1), Some(1)).await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(platform.state_get("k").await, None);
    }

    #[tokio::test]
    async fn invoke_without_dispatcher_is_an_internal_error() {
        let platform = PlatformContainer::new();
        let err = platform.invoke("other-plugin", serde_json::json!({}), None).await.unwrap_err();
        assert!(matches!(err, Error::Internal(_)));
    }

    #[tokio::test]
    async fn events_are_recorded_in_order() {
        let platform = PlatformContainer::new();
        platform.emit_event("a", serde_json::json!(1)).await;
        platform.emit_event("b", serde_json::json!(2)).await;
        let recent = platform.recent_events(10).await;
        assert_eq!(recent[0].0, "a");
        assert_eq!(recent[1].0, "b");
    }
}
