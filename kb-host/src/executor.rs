//! Host Executor (C9, spec.md §4.9): resolves a plugin command's handler path,
//! builds its `Descriptor`, opens the IPC data-channel listener, spawns the sandbox
//! child, drives the control-channel state machine, and enforces the quota timer.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

use kb_core::config::SandboxMode;
use kb_core::error::{ErrorCode, ErrorEnvelope};
use kb_core::model::{Descriptor, HostKind};
use kb_core::policy::Policy;
use kb_core::protocol::{encode_line, ControlToChild, ControlToHost};
use kb_sandbox::transport::{AdapterService, IpcServer};

use crate::platform::PlatformContainer;
use crate::services::{EventsAdapterService, InvokeAdapterService, StateAdapterService};

/// `INIT → SPAWNED → READY → EXECUTING → (RESULT | ERROR | ABORTED) → CLOSED`
/// (spec.md §4.9 "State machine for one invocation").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InvocationState {
    Init,
    Spawned,
    Ready,
    Executing,
    Result,
    Error,
    Aborted,
    Closed,
}

/// Everything the executor needs to run one plugin command, independent of how the
/// caller (`kb-cli`) resolved it — deliberately not `kb_registry::RegisteredCommand`
/// so `kb-host` does not need to depend on `kb-registry`.
pub struct ExecuteRequest {
    pub plugin_id: String,
    pub plugin_version: String,
    pub tenant_id: Option<String>,
    pub parent_request_id: Option<String>,
    pub host: HostKind,
    pub cwd: PathBuf,
    pub outdir: Option<PathBuf>,
    pub permissions: Policy,
    pub config: serde_json::Value,
    pub host_context: serde_json::Value,
    pub pkg_root: PathBuf,
    pub handler_path: String,
    pub input: serde_json::Value,
}

/// Result of one invocation, normalised from whichever control frame (or lack of
/// one) ended it (spec.md §4.9 step 6).
#[derive(Debug, Clone)]
pub struct InvocationOutcome {
    pub exit_code: i32,
    pub result: Option<serde_json::Value>,
    pub meta: Option<serde_json::Value>,
    pub error: Option<ErrorEnvelope>,
    pub final_state: InvocationState,
}

impl InvocationOutcome {
    fn internal_error(message: impl Into<String>, final_state: InvocationState) -> Self {
        let message = message.into();
        tracing::error!(%message, ?final_state, "invocation ended abnormally");
        Self {
            exit_code: ErrorCode::InternalError.exit_code(),
            result: None,
            meta: None,
            error: Some(ErrorEnvelope {
                name: "Error".to_string(),
                message,
                code: ErrorCode::InternalError.as_str().to_string(),
                details: None,
                stack: None,
            }),
            final_state,
        }
    }
}

/// Tunables that would otherwise be hardcoded (spec.md §4.9 "ready timeout (default
/// 30s)" and the grace period before a force-kill).
pub struct ExecutorConfig {
    /// Binary re-exec'd to become the sandbox child (`kb-cli`'s own `current_exe()`
    /// in production; a test double binary in tests).
    pub child_exe: PathBuf,
    /// Extra argv passed to `child_exe`, e.g. the hidden `--sandbox-child` flag.
    pub child_args: Vec<String>,
    /// Directory name a `handlerPath` is resolved relative to, unless already
    /// prefixed with it (spec.md §4.9 step 1).
    pub built_output_dir: String,
    pub ready_timeout: Duration,
    pub grace_period: Duration,
    pub socket_dir: PathBuf,
    /// Enforcement posture forwarded to the child as `KB_SANDBOX_MODE` (spec.md §4.6
    /// step 3), resolved by the caller from `kb.toml`'s `[sandbox] mode` before `Config`
    /// is out of scope here.
    pub sandbox_mode: SandboxMode,
}

impl ExecutorConfig {
    pub fn new(child_exe: PathBuf) -> Self {
        Self {
            child_exe,
            child_args: vec!["--sandbox-child".to_string()],
            built_output_dir: "dist".to_string(),
            ready_timeout: Duration::from_secs(30),
            grace_period: Duration::from_secs(5),
            socket_dir: std::env::temp_dir(),
            sandbox_mode: SandboxMode::Enforce,
        }
    }

    pub fn with_sandbox_mode(mut self, mode: SandboxMode) -> Self {
        self.sandbox_mode = mode;
        self
    }
}

/// Drives one invocation end to end. Stateless across calls; all per-invocation
/// state lives on the stack of [`Self::execute`].
pub struct HostExecutor {
    config: ExecutorConfig,
    platform: Arc<PlatformContainer>,
}

impl HostExecutor {
    pub fn new(config: ExecutorConfig, platform: Arc<PlatformContainer>) -> Self {
        Self { config, platform }
    }

    fn fresh_socket_path(&self) -> PathBuf {
        self.config.socket_dir.join(format!("kb-{}.sock", uuid::Uuid::new_v4()))
    }

    fn build_ipc_server(&self) -> IpcServer {
        let mut server = IpcServer::new();
        server.register("state", Arc::new(StateAdapterService::new(self.platform.clone())) as Arc<dyn AdapterService>);
        server.register("events", Arc::new(EventsAdapterService::new(self.platform.clone())) as Arc<dyn AdapterService>);
        server.register("invoke", Arc::new(InvokeAdapterService::new(self.platform.clone())) as Arc<dyn AdapterService>);
        server
    }

    /// Plugin-root + handlerPath, relative to the built output directory unless
    /// already prefixed with it (spec.md §4.9 step 1).
    fn resolve_handler_path(&self, req: &ExecuteRequest) -> String {
        let output_dir = self.config.built_output_dir.as_str();
        let already_prefixed = req.handler_path.split('/').next() == Some(output_dir);
        let path = if already_prefixed {
            req.pkg_root.join(&req.handler_path)
        } else {
            req.pkg_root.join(output_dir).join(&req.handler_path)
        };
        path.to_string_lossy().into_owned()
    }

    fn build_descriptor(&self, req: &ExecuteRequest) -> Descriptor {
        Descriptor {
            host: req.host,
            parent_request_id: req.parent_request_id.clone(),
            plugin_id: req.plugin_id.clone(),
            plugin_version: req.plugin_version.clone(),
            tenant_id: req.tenant_id.clone(),
            cwd: req.cwd.clone(),
            outdir: req.outdir.clone(),
            permissions: req.permissions.clone(),
            config: req.config.clone(),
            host_context: req.host_context.clone(),
        }
    }

    /// Run one invocation (spec.md §4.9 steps 1-7).
    pub async fn execute(&self, req: ExecuteRequest) -> InvocationOutcome {
        let mut state = InvocationState::Init;
        let socket_path = self.fresh_socket_path();
        let server = Arc::new(self.build_ipc_server());
        let serve_path = socket_path.clone();
        let serve_server = server.clone();
        let serve_handle = tokio::spawn(async move {
            if let Err(e) = serve_server.serve_unix(&serve_path).await {
                tracing::debug!(error = %e, "ipc data-channel server exited");
            }
        });

        let handler_path = self.resolve_handler_path(&req);
        let quota_ms = req.permissions.quotas.timeout_ms;
        let descriptor = self.build_descriptor(&req);

        let spawned = tokio::process::Command::new(&self.config.child_exe)
            .args(&self.config.child_args)
            .env("KB_SANDBOX_MODE", self.config.sandbox_mode.as_env_str())
            .stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::inherit())
            .spawn();

        let mut child = match spawned {
            Ok(child) => {
                state = InvocationState::Spawned;
                child
            }
            Err(e) => {
                serve_handle.abort();
                let _ = std::fs::remove_file(&socket_path);
                return InvocationOutcome::internal_error(format!("failed to spawn sandbox child: {e}"), state);
            }
        };

        let mut stdin = match child.stdin.take() {
            Some(s) => s,
            None => return self.close(child, serve_handle, &socket_path, InvocationOutcome::internal_error("child stdin was not piped", state)).await,
        };
        let stdout = match child.stdout.take() {
            Some(s) => s,
            None => return self.close(child, serve_handle, &socket_path, InvocationOutcome::internal_error("child stdout was not piped", state)).await,
        };
        let mut lines = BufReader::new(stdout).lines();

        // SPAWNED -> READY (spec.md §4.9 "ready timeout (default 30s) -> fatal").
        match tokio::time::timeout(self.config.ready_timeout, lines.next_line()).await {
            Ok(Ok(Some(line))) => match serde_json::from_str::<ControlToHost>(line.trim()) {
                Ok(ControlToHost::Ready) => state = InvocationState::Ready,
                Ok(_) => {
                    return self.close(child, serve_handle, &socket_path, InvocationOutcome::internal_error("expected a ready frame first", state)).await;
                }
                Err(e) => {
                    return self.close(child, serve_handle, &socket_path, InvocationOutcome::internal_error(format!("malformed ready frame: {e}"), state)).await;
                }
            },
            Ok(Ok(None)) => {
                return self.close(child, serve_handle, &socket_path, InvocationOutcome::internal_error("sandbox child exited before becoming ready", state)).await;
            }
            Ok(Err(e)) => {
                return self.close(child, serve_handle, &socket_path, InvocationOutcome::internal_error(format!("error reading control channel: {e}"), state)).await;
            }
            Err(_) => {
                return self.close(child, serve_handle, &socket_path, InvocationOutcome::internal_error("sandbox child did not become ready in time", state)).await;
            }
        }

        // READY -> EXECUTING.
        let execute_msg = ControlToChild::Execute {
            descriptor,
            handler_path,
            input: req.input,
            socket_path: socket_path.clone(),
        };
        let encoded = match encode_line(&execute_msg) {
            Ok(s) => s,
            Err(e) => {
                return self.close(child, serve_handle, &socket_path, InvocationOutcome::internal_error(format!("failed to encode execute message: {e}"), state)).await;
            }
        };
        if let Err(e) = stdin.write_all(encoded.as_bytes()).await {
            return self.close(child, serve_handle, &socket_path, InvocationOutcome::internal_error(format!("failed to send execute message: {e}"), state)).await;
        }
        state = InvocationState::Executing;

        let outcome = tokio::select! {
            line = lines.next_line() => outcome_from_control_line(line),
            () = tokio::time::sleep(Duration::from_millis(quota_ms)) => {
                tracing::warn!(plugin_id = %req.plugin_id, quota_ms, "invocation exceeded its quota, sending abort");
                if let Ok(line) = encode_line(&ControlToChild::Abort) {
                    let _ = stdin.write_all(line.as_bytes()).await;
                }
                InvocationOutcome {
                    exit_code: ErrorCode::InternalError.exit_code(),
                    result: None,
                    meta: None,
                    error: Some(ErrorEnvelope {
                        name: "TimeoutError".to_string(),
                        message: format!("invocation exceeded its {quota_ms}ms quota"),
                        code: ErrorCode::InternalError.as_str().to_string(),
                        details: None,
                        stack: None,
                    }),
                    final_state: InvocationState::Aborted,
                }
            }
        };

        self.close(child, serve_handle, &socket_path, outcome).await
    }

    /// Grace period for a natural exit after the outcome is known, then force-kill
    /// (spec.md §4.9 step 5 "if the child does not terminate within a grace period,
    /// force-kill"); reap, stop the IPC server, and remove the socket file (step 7).
    async fn close(
        &self,
        mut child: tokio::process::Child,
        serve_handle: tokio::task::JoinHandle<()>,
        socket_path: &std::path::Path,
        outcome: InvocationOutcome,
    ) -> InvocationOutcome {
        if tokio::time::timeout(self.config.grace_period, child.wait()).await.is_err() {
            tracing::warn!("sandbox child did not exit within the grace period, force-killing");
            let _ = child.start_kill();
            let _ = child.wait().await;
        }
        serve_handle.abort();
        let _ = std::fs::remove_file(socket_path);
        outcome
    }
}

fn outcome_from_control_line(line: std::io::Result<Option<String>>) -> InvocationOutcome {
    match line {
        Ok(Some(line)) => match serde_json::from_str::<ControlToHost>(line.trim()) {
            Ok(ControlToHost::Result { exit_code, result, meta }) => {
                InvocationOutcome { exit_code, result, meta, error: None, final_state: InvocationState::Result }
            }
            Ok(ControlToHost::Error { error }) => InvocationOutcome {
                exit_code: ErrorCode::InternalError.exit_code(),
                result: None,
                meta: None,
                error: Some(error),
                final_state: InvocationState::Error,
            },
            Ok(ControlToHost::Ready) => {
                InvocationOutcome::internal_error("received a duplicate ready frame", InvocationState::Error)
            }
            Err(e) => InvocationOutcome::internal_error(format!("malformed control frame: {e}"), InvocationState::Error),
        },
        // No frame at all, spec.md §4.9 step 6 "synthesise an INTERNAL_ERROR".
        Ok(None) => InvocationOutcome::internal_error(
            "sandbox child closed its control channel without a result",
            InvocationState::Error,
        ),
        Err(e) => InvocationOutcome::internal_error(format!("error reading control channel: {e}"), InvocationState::Error),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolve_handler_path_joins_output_dir_by_default() {
        let config = ExecutorConfig::new(PathBuf::from("/bin/kb"));
        let platform = Arc::new(PlatformContainer::new());
        let executor = HostExecutor::new(config, platform);
        let req = sample_request("handler.so");
        assert!(executor.resolve_handler_path(&req).ends_with("dist/handler.so"));
    }

    #[test]
    fn resolve_handler_path_does_not_double_prefix() {
        let config = ExecutorConfig::new(PathBuf::from("/bin/kb"));
        let platform = Arc::new(PlatformContainer::new());
        let executor = HostExecutor::new(config, platform);
        let req = sample_request("dist/handler.so");
        let resolved = executor.resolve_handler_path(&req);
        assert_eq!(resolved.matches("dist").count(), 1);
    }

    fn sample_request(handler_path: &str) -> ExecuteRequest {
        ExecuteRequest {
            plugin_id: "demo".into(),
            plugin_version: "1.0.0".into(),
            tenant_id: None,
            parent_request_id: None,
            host: HostKind::Cli,
            cwd: PathBuf::from("/tmp"),
            outdir: None,
            permissions: Policy::default(),
            config: serde_json::json!({}),
            host_context: serde_json::json!({}),
            pkg_root: PathBuf::from("/plugins/demo"),
            handler_path: handler_path.to_string(),
            input: serde_json::json!({}),
        }
    }
}
