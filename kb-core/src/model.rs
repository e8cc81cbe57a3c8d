//! Core data model entities shared across the workspace (spec.md §3):
//! `Descriptor`, `Trace`, the cwd/outdir/config/identity fields of `Context`
//! (the full `Context` — which also carries the runtime facades — is
//! assembled in `kb-sandbox`), and `CleanupStack`.

use std::collections::BTreeMap;
use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::policy::Policy;

/// Who invoked this plugin command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HostKind {
    Cli,
    Job,
    Invoke,
}

/// The frozen input to one plugin invocation (spec.md §3). Owned by the host;
/// serialised once and handed to the child at startup.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Descriptor {
    pub host: HostKind,
    #[serde(rename = "parentRequestId", default, skip_serializing_if = "Option::is_none")]
    pub parent_request_id: Option<String>,
    #[serde(rename = "pluginId")]
    pub plugin_id: String,
    #[serde(rename = "pluginVersion")]
    pub plugin_version: String,
    #[serde(rename = "tenantId", default, skip_serializing_if = "Option::is_none")]
    pub tenant_id: Option<String>,
    pub cwd: PathBuf,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outdir: Option<PathBuf>,
    pub permissions: Policy,
    #[serde(default)]
    pub config: serde_json::Value,
    #[serde(rename = "hostContext", default)]
    pub host_context: serde_json::Value,
}

impl Descriptor {
    /// Default artifact directory when the caller did not supply one: `<cwd>/.kb/output`
    /// (spec.md §4.5).
    pub fn resolved_outdir(&self) -> PathBuf {
        self.outdir.clone().unwrap_or_else(|| self.cwd.join(".kb").join("output"))
    }
}

/// `{ traceId, spanId, parentSpanId? }` plus event/exception recording (spec.md §3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Trace {
    #[serde(rename = "traceId")]
    pub trace_id: String,
    #[serde(rename = "spanId")]
    pub span_id: String,
    #[serde(rename = "parentSpanId", default, skip_serializing_if = "Option::is_none")]
    pub parent_span_id: Option<String>,
    #[serde(skip)]
    events: Vec<TraceEvent>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct TraceEvent {
    name: String,
    attributes: serde_json::Value,
}

impl Trace {
    /// `requestId` is formatted `"<traceId>:<spanId>"`.
    pub fn request_id(&self) -> String {
        format!("{}:{}", self.trace_id, self.span_id)
    }

    /// Build a fresh root trace (no parent request).
    pub fn root() -> Self {
        Self {
            trace_id: Uuid::new_v4().to_string(),
            span_id: Uuid::new_v4().to_string(),
            parent_span_id: None,
            events: Vec::new(),
        }
    }

    /// Build a trace inheriting `traceId` from a parent's `requestId`
    /// (`"<traceId>:<spanId>"`), recording the parent's span as `parentSpanId`
    /// (spec.md §4.5).
    pub fn from_parent_request_id(parent_request_id: &str) -> Self {
        let trace_id = extract_trace_id(parent_request_id);
        let parent_span_id = parent_request_id.split_once(':').map(|(_, s)| s.to_string());
        Self {
            trace_id,
            span_id: Uuid::new_v4().to_string(),
            parent_span_id,
            events: Vec::new(),
        }
    }

    /// Record a named event with free-form attributes.
    pub fn record_event(&mut self, name: impl Into<String>, attributes: serde_json::Value) {
        self.events.push(TraceEvent { name: name.into(), attributes });
        tracing::debug!(trace_id = %self.trace_id, span_id = %self.span_id, "trace event recorded");
    }

    /// Record an exception. Exceptions are events with a fixed name and the message as an attribute.
    pub fn record_exception(&mut self, message: impl Into<String>) {
        let message = message.into();
        tracing::warn!(trace_id = %self.trace_id, span_id = %self.span_id, %message, "trace exception recorded");
        self.events.push(TraceEvent {
            name: "exception".to_string(),
            attributes: serde_json::json!({ "message": message }),
        });
    }

    /// Events recorded so far, for tests/diagnostics.
    pub fn events(&self) -> &[TraceEvent] {
        &self.events
    }
}

/// `extractTraceId(parentRequestId)`: the part before the first colon, or the whole
/// string if there is no colon.
pub fn extract_trace_id(parent_request_id: &str) -> String {
    parent_request_id.split_once(':').map(|(t, _)| t.to_string()).unwrap_or_else(|| parent_request_id.to_string())
}

type CleanupFn = Box<dyn FnOnce() -> Pin<Box<dyn Future<Output = Result<(), String>> + Send>> + Send>;

/// An ordered sequence of deferred asynchronous callbacks, released in reverse
/// registration order after the handler returns or fails (spec.md §3).
#[derive(Default)]
pub struct CleanupStack {
    callbacks: Vec<CleanupFn>,
}

impl std::fmt::Debug for CleanupStack {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CleanupStack").field("len", &self.callbacks.len()).finish()
    }
}

/// Outcome of draining one cleanup callback.
#[derive(Debug, Clone)]
pub struct CleanupFailure {
    pub index: usize,
    pub message: String,
}

impl CleanupStack {
    pub fn new() -> Self {
        Self::default()
    }

    /// `lifecycle.onCleanup(fn)`: push a deferred callback.
    pub fn push<F, Fut>(&mut self, f: F)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<(), String>> + Send + 'static,
    {
        self.callbacks.push(Box::new(move || Box::pin(f())));
    }

    pub fn len(&self) -> usize {
        self.callbacks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.callbacks.is_empty()
    }

    /// Drain in reverse registration order, each call bounded by `release_timeout`
    /// (default 5s). Failures are collected, not propagated (spec.md §3/§7).
    pub async fn drain(mut self, release_timeout: Duration) -> Vec<CleanupFailure> {
        let mut failures = Vec::new();
        let total = self.callbacks.len();
        while let Some(cb) = self.callbacks.pop() {
            let index = total - self.callbacks.len() - 1;
            let result = tokio::time::timeout(release_timeout, cb()).await;
            match result {
                Ok(Ok(())) => {}
                Ok(Err(message)) => {
                    tracing::warn!(index, %message, "cleanup callback failed");
                    failures.push(CleanupFailure { index, message });
                }
                Err(_) => {
                    let message = "cleanup callback exceeded release timeout".to_string();
                    tracing::warn!(index, "cleanup callback timed out");
                    failures.push(CleanupFailure { index, message });
                }
            }
        }
        failures
    }
}

/// `ViolationEvent` — reported out-of-band when a harden interception triggers (spec.md §3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ViolationEvent {
    pub kind: ViolationKind,
    pub target: String,
    pub decision: ViolationDecision,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ViolationKind {
    Module,
    Fs,
    Fetch,
    Exit,
    Env,
    Shell,
    Invoke,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ViolationDecision {
    Block,
    Warn,
}

/// Where `state`/`events` prefix keys: `"<tenant|'default'>:<pluginId>:<key>"` (spec.md §4.2/§6).
pub fn namespaced_key(tenant_id: Option<&str>, plugin_id: &str, key: &str) -> String {
    format!("{}:{}:{}", tenant_id.unwrap_or("default"), plugin_id, key)
}

/// `events.emit(name, ...)` prefixing: `"<pluginId>:name"`.
pub fn namespaced_event(plugin_id: &str, name: &str) -> String {
    format!("{plugin_id}:{name}")
}

/// Map<key, value> helper used by `state.getMany`.
pub type ManyResult = BTreeMap<String, serde_json::Value>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trace_inherits_trace_id_from_parent() {
        let parent = "trace-abc:span-1";
        let t = Trace::from_parent_request_id(parent);
        assert_eq!(t.trace_id, "trace-abc");
        assert_eq!(t.parent_span_id.as_deref(), Some("span-1"));
        assert!(t.request_id().starts_with("trace-abc:"));
    }

    #[test]
    fn trace_root_has_no_parent_span() {
        let t = Trace::root();
        assert!(t.parent_span_id.is_none());
    }

    #[tokio::test]
    async fn p8_cleanup_order_is_lifo() {
        use std::sync::{Arc, Mutex};
        let order = Arc::new(Mutex::new(Vec::new()));
        let mut stack = CleanupStack::new();
        for i in 0..3 {
            let order = order.clone();
            stack.push(move || {
                let order = order.clone();
                async move {
                    order.lock().expect("lock").push(i);
                    Ok(())
                }
            });
        }
        let failures = stack.drain(Duration::from_secs(1)).await;
        assert!(failures.is_empty());
        assert_eq!(*order.lock().expect("lock"), vec![2, 1, 0]);
    }

    #[test]
    fn namespacing_helpers() {
        assert_eq!(namespaced_key(None, "p", "k"), "default:p:k");
        assert_eq!(namespaced_key(Some("t1"), "p", "k"), "t1:p:k");
        assert_eq!(namespaced_event("p", "evt"), "p:evt");
    }
}
