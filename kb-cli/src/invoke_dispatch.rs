//! Implements `kb_host::InvokeDispatch` so a running plugin's `invoke.call(target,
//! input)` can route to another registered plugin command (spec.md §4.5 "invoke").
//!
//! Builds a fresh `PlatformContainer`/`HostExecutor` per call rather than sharing one
//! with the top-level dispatch: `PlatformContainer::with_invoke_dispatch` consumes
//! `self` before it can be wrapped in the `Arc` an executor needs, so there is no way
//! to hand a single executor a dispatcher that already knows about that executor.
//! Recursing with a fresh pair keeps the nested invocation on its own state/event
//! store, which matches spec.md's description of `invoke.call` as a new sub-invocation
//! rather than a continuation of the caller's.

use std::path::PathBuf;
use std::sync::Arc;

use kb_core::config::SandboxMode;
use kb_core::error::Error;
use kb_core::model::HostKind;
use kb_host::{ExecuteRequest, ExecutorConfig, HostExecutor, InvokeDispatch, PlatformContainer};
use kb_registry::CommandRegistry;

#[derive(Clone)]
pub struct Dispatcher {
    pub registry: Arc<CommandRegistry>,
    pub cwd: PathBuf,
    pub child_exe: PathBuf,
    pub sandbox_mode: SandboxMode,
}

#[async_trait::async_trait]
impl InvokeDispatch for Dispatcher {
    async fn invoke(
        &self,
        target_plugin_id: &str,
        input: serde_json::Value,
        parent_request_id: Option<String>,
    ) -> kb_core::Result<serde_json::Value> {
        let target = self
            .registry
            .plugin_command(target_plugin_id)
            .filter(|cmd| !cmd.shadowed && cmd.available)
            .ok_or_else(|| Error::CmdNotFound(target_plugin_id.to_string()))?;

        let nested = Arc::new(self.clone());
        let platform = Arc::new(PlatformContainer::new().with_invoke_dispatch(nested));
        let executor = HostExecutor::new(ExecutorConfig::new(self.child_exe.clone()).with_sandbox_mode(self.sandbox_mode), platform);

        let req = ExecuteRequest {
            plugin_id: target.id.clone(),
            plugin_version: target.plugin_version.clone(),
            tenant_id: None,
            parent_request_id,
            host: HostKind::Invoke,
            cwd: self.cwd.clone(),
            outdir: None,
            permissions: target.permissions.clone(),
            config: serde_json::Value::Null,
            host_context: serde_json::Value::Null,
            pkg_root: target.pkg_root.clone(),
            handler_path: target.handler_path.clone(),
            input,
        };

        let outcome = executor.execute(req).await;
        match outcome.error {
            Some(envelope) => Err(Error::Internal(envelope.message)),
            None => Ok(outcome.result.unwrap_or(serde_json::Value::Null)),
        }
    }
}
