#![forbid(unsafe_code)]

//! Plugin Context Factory (C5, spec.md §4.5): composes the per-invocation `Context`
//! handed to a plugin handler from a `Descriptor` plus host-supplied platform pieces.

use std::sync::Arc;

use kb_core::model::{CleanupStack, Descriptor, Trace};
use kb_core::policy::Policy;

use crate::facade::{
    ArtifactsFacade, EnvFacade, EventSink, EventsFacade, FetchFacade, FsFacade, InvokeFacade, Invoker,
    ShellFacade, StateCache, StateFacade,
};
use crate::harden::Harden;

/// Everything a handler can reach: the runtime API facades plus identity/trace/UI.
pub struct Context {
    pub descriptor: Descriptor,
    pub trace: Trace,
    pub fs: FsFacade,
    pub fetch: FetchFacade,
    pub env: EnvFacade,
    pub shell: ShellFacade,
    pub artifacts: ArtifactsFacade,
    pub state: StateFacade,
    pub events: EventsFacade,
    pub invoke: InvokeFacade,
}

/// Output of the factory: the context plus the separately-owned cleanup stack and
/// trace identifiers the host needs after the handler returns (spec.md §4.5).
pub struct BuiltContext {
    pub context: Context,
    pub cleanup: CleanupStack,
    pub request_id: String,
    pub trace_id: String,
    pub span_id: String,
}

/// Host-supplied pieces not carried by the `Descriptor` (spec.md §4.5 "platform
/// services are passed through unchanged").
pub struct ContextInputs {
    pub state_cache: Arc<dyn StateCache>,
    pub event_sink: Option<Arc<dyn EventSink>>,
    pub invoker: Option<Arc<dyn Invoker>>,
    /// The harden layer installed for this invocation (spec.md §4.3), shared by every
    /// Policy-gated facade so `enforce`/`compat`/`warn` is consulted uniformly.
    pub harden: Arc<Harden>,
}

/// Build a `Context` for one invocation. Effective policy is the descriptor's
/// permissions already merged with any command-level override by the caller
/// (spec.md §4.9 step 2, performed by `kb-host` before the `Descriptor` is sent).
pub fn build_context(descriptor: Descriptor, inputs: ContextInputs) -> BuiltContext {
    let trace = match &descriptor.parent_request_id {
        Some(parent) => Trace::from_parent_request_id(parent),
        None => Trace::root(),
    };
    let request_id = trace.request_id();
    let trace_id = trace.trace_id.clone();
    let span_id = trace.span_id.clone();

    let policy: Policy = descriptor.permissions.clone();
    let cwd = descriptor.cwd.clone();
    let outdir = descriptor.resolved_outdir();
    let plugin_id = descriptor.plugin_id.clone();
    let tenant_id = descriptor.tenant_id.clone();

    let harden = inputs.harden;
    let context = Context {
        fs: FsFacade::new(policy.clone(), cwd.clone(), outdir.clone(), harden.clone()),
        fetch: FetchFacade::new(policy.clone(), harden.clone()),
        env: EnvFacade::new(policy.clone(), harden.clone()),
        shell: ShellFacade::new(policy.clone(), harden.clone()),
        artifacts: ArtifactsFacade::new(outdir),
        state: StateFacade::new(inputs.state_cache, tenant_id, plugin_id.clone()),
        events: EventsFacade::new(inputs.event_sink, plugin_id),
        invoke: InvokeFacade::new(policy, inputs.invoker, harden, request_id.clone()),
        descriptor,
        trace,
    };

    BuiltContext { context, cleanup: CleanupStack::new(), request_id, trace_id, span_id }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kb_core::model::HostKind;
    use std::collections::HashMap;
    use std::sync::Mutex;

    struct MapCache {
        map: Mutex<HashMap<String, serde_json::Value>>,
    }

    #[async_trait::async_trait]
    impl StateCache for MapCache {
        async fn get(&self, key: &str) -> Option<serde_json::Value> {
            self.map.lock().expect("lock").get(key).cloned()
        }
        async fn set(&self, key: &str, value: serde_json::Value, _ttl_ms: Option<u64>) {
            self.map.lock().expect("lock").insert(key.to_string(), value);
        }
        async fn delete(&self, key: &str) {
            self.map.lock().expect("lock").remove(key);
        }
    }

    fn test_harden() -> Arc<Harden> {
        Arc::new(Harden::install(crate::harden::EnforcementMode::Enforce))
    }

    fn descriptor(parent: Option<&str>) -> Descriptor {
        Descriptor {
            host: HostKind::Cli,
            parent_request_id: parent.map(String::from),
            plugin_id: "demo".into(),
            plugin_version: "1.0.0".into(),
            tenant_id: None,
            cwd: std::env::temp_dir(),
            outdir: None,
            permissions: Policy::default(),
            config: serde_json::json!({}),
            host_context: serde_json::json!({}),
        }
    }

    #[test]
    fn root_invocation_gets_fresh_trace() {
        let inputs = ContextInputs {
            state_cache: Arc::new(MapCache { map: Mutex::new(HashMap::new()) }),
            event_sink: None,
            invoker: None,
            harden: test_harden(),
        };
        let built = build_context(descriptor(None), inputs);
        assert!(built.context.trace.events().is_empty());
        assert!(built.request_id.contains(':'));
    }

    #[test]
    fn child_invocation_inherits_trace_id() {
        let inputs = ContextInputs {
            state_cache: Arc::new(MapCache { map: Mutex::new(HashMap::new()) }),
            event_sink: None,
            invoker: None,
            harden: test_harden(),
        };
        let built = build_context(descriptor(Some("trace-xyz:span-1")), inputs);
        assert_eq!(built.trace_id, "trace-xyz");
        assert!(built.request_id.starts_with("trace-xyz:"));
    }

    #[test]
    fn outdir_defaults_under_dot_kb() {
        let inputs = ContextInputs {
            state_cache: Arc::new(MapCache { map: Mutex::new(HashMap::new()) }),
            event_sink: None,
            invoker: None,
            harden: test_harden(),
        };
        let built = build_context(descriptor(None), inputs);
        assert!(built.context.descriptor.resolved_outdir().ends_with(".kb/output"));
    }
}
