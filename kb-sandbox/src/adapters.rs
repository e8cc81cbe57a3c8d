#![forbid(unsafe_code)]
#![cfg(unix)]

//! IPC-backed implementations of the [`crate::facade`] host-callback traits
//! (spec.md §4.4 "Requests from child"). A real multi-process invocation cannot give
//! the sandboxed child direct access to the host's state store, event bus, or invoke
//! dispatcher — those are process-global resources — so the child's `state`/`events`/
//! `invoke` facades call back over the data channel instead. `kb-host` registers the
//! matching [`crate::transport::AdapterService`] implementations under the `"state"`,
//! `"events"`, and `"invoke"` adapter names.
//!
//! Tests and dev/inline mode can skip all of this and hand `build_context` a local
//! in-memory `StateCache` directly (see `kb-sandbox::context` tests) — these adapters
//! are only wired up by the sandbox bootstrap binary itself.

use std::sync::Arc;

use kb_core::error::{Error, Result};

use crate::facade::{EventSink, Invoker, StateCache};
use crate::transport::IpcClient;

/// `state` adapter client: `get`/`set`/`delete` forwarded as `adapter:call` frames.
pub struct IpcStateCache {
    client: Arc<IpcClient>,
}

impl IpcStateCache {
    pub fn new(client: Arc<IpcClient>) -> Self {
        Self { client }
    }
}

#[async_trait::async_trait]
impl StateCache for IpcStateCache {
    async fn get(&self, key: &str) -> Option<serde_json::Value> {
        match self.client.call("state", "get", vec![serde_json::json!(key)], None).await {
            Ok(v) if v.is_null() => None,
            Ok(v) => Some(v),
            Err(_) => None,
        }
    }

    async fn set(&self, key: &str, value: serde_json::Value, ttl_ms: Option<u64>) {
        let _ = self
            .client
            .call("state", "set", vec![serde_json::json!(key), value, serde_json::json!(ttl_ms)], None)
            .await;
    }

    async fn delete(&self, key: &str) {
        let _ = self.client.call("state", "delete", vec![serde_json::json!(key)], None).await;
    }
}

/// `events` adapter client: `emit` forwarded as an `adapter:call` frame.
pub struct IpcEventSink {
    client: Arc<IpcClient>,
}

impl IpcEventSink {
    pub fn new(client: Arc<IpcClient>) -> Self {
        Self { client }
    }
}

#[async_trait::async_trait]
impl EventSink for IpcEventSink {
    async fn emit(&self, name: &str, payload: serde_json::Value) {
        let _ = self.client.call("events", "emit", vec![serde_json::json!(name), payload], None).await;
    }
}

/// `invoke` adapter client: routes a nested plugin call back to the host, which
/// re-enters the Host Executor (C9) for `target_plugin_id`.
pub struct IpcInvoker {
    client: Arc<IpcClient>,
}

impl IpcInvoker {
    pub fn new(client: Arc<IpcClient>) -> Self {
        Self { client }
    }
}

#[async_trait::async_trait]
impl Invoker for IpcInvoker {
    async fn call(&self, target_plugin_id: &str, input: serde_json::Value, parent_request_id: &str) -> Result<serde_json::Value> {
        self.client
            .call(
                "invoke",
                "call",
                vec![serde_json::json!(target_plugin_id), input, serde_json::json!(parent_request_id)],
                None,
            )
            .await
            .map_err(|e| Error::Internal(e.to_string()))
    }
}
