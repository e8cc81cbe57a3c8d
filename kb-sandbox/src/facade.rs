#![forbid(unsafe_code)]

//! Sandbox Runtime API (C2, spec.md §4.2): the facades a plugin handler is actually
//! given. In the teacher's JS-derived design these wrap ambient globals; here they are
//! simply the only capability surface a plugin ever sees — the handler never gets a
//! raw file handle or socket, only these policy-bound objects (see harden.rs for why
//! that replaces ambient interception in a compiled-binary host).

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::Command;
use tokio::time::timeout;

use kb_core::error::{Error, PermissionDenial, Result};
use kb_core::model::{namespaced_event, namespaced_key, ManyResult, ViolationKind};
use kb_core::policy::{self, Decision, Policy};

use crate::harden::Harden;

/// Runs a Policy decision through the harden layer (spec.md §4.3 "Violation
/// reporting"): every denial is recorded regardless of mode, but only
/// `enforce`/`compat` actually turn it into a `PermissionError` — `warn` lets the
/// call through after logging, per `Harden::should_deny`.
fn accept(harden: &Harden, kind: ViolationKind, target: impl Into<String>, decision: Decision) -> Result<()> {
    match decision {
        Decision::Allow => Ok(()),
        Decision::Deny { reason, details } => {
            harden.record(kind, target, reason.clone());
            if harden.should_deny() {
                Err(Error::Permission(PermissionDenial::new(reason, details)))
            } else {
                Ok(())
            }
        }
    }
}

/// Normalise `path` to absolute, `cwd`-anchored form before any policy check
/// (spec.md §4.2 "first normalises the path"); full lexical normalisation and the
/// deny-list are applied inside `kb_core::policy`.
fn anchor(cwd: &Path, path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        cwd.join(path)
    }
}

/// `fs` facade: every operation anchors the path to `cwd` then runs the Policy.
pub struct FsFacade {
    policy: Policy,
    cwd: PathBuf,
    outdir: PathBuf,
    harden: Arc<Harden>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Stat {
    pub is_file: bool,
    pub is_dir: bool,
    pub size: u64,
    pub mtime_ms: i64,
    pub ctime_ms: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct DirEntryStats {
    pub name: String,
    pub is_file: bool,
    pub is_dir: bool,
}

impl FsFacade {
    pub fn new(policy: Policy, cwd: PathBuf, outdir: PathBuf, harden: Arc<Harden>) -> Self {
        Self { policy, cwd, outdir, harden }
    }

    fn check_read(&self, path: &Path) -> Result<PathBuf> {
        let abs = anchor(&self.cwd, path);
        accept(
            &self.harden,
            ViolationKind::Fs,
            abs.to_string_lossy(),
            policy::check_read_path(&abs, &self.cwd, &self.policy.fs.read),
        )?;
        Ok(abs)
    }

    fn check_write(&self, path: &Path) -> Result<PathBuf> {
        let abs = anchor(&self.cwd, path);
        accept(
            &self.harden,
            ViolationKind::Fs,
            abs.to_string_lossy(),
            policy::check_write_path(&abs, &self.cwd, &self.policy.fs.write, &self.outdir),
        )?;
        Ok(abs)
    }

    pub async fn read_file(&self, path: &Path) -> Result<String> {
        let abs = self.check_read(path)?;
        Ok(tokio::fs::read_to_string(&abs).await?)
    }

    pub async fn read_file_buffer(&self, path: &Path) -> Result<Vec<u8>> {
        let abs = self.check_read(path)?;
        Ok(tokio::fs::read(&abs).await?)
    }

    pub async fn write_file(&self, path: &Path, content: &[u8], append: bool) -> Result<()> {
        let abs = self.check_write(path)?;
        if let Some(parent) = abs.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .write(true)
            .append(append)
            .truncate(!append)
            .open(&abs)
            .await?;
        file.write_all(content).await?;
        Ok(())
    }

    pub async fn readdir(&self, path: &Path) -> Result<Vec<String>> {
        let abs = self.check_read(path)?;
        let mut names = Vec::new();
        let mut rd = tokio::fs::read_dir(&abs).await?;
        while let Some(entry) = rd.next_entry().await? {
            names.push(entry.file_name().to_string_lossy().into_owned());
        }
        Ok(names)
    }

    pub async fn readdir_with_stats(&self, path: &Path) -> Result<Vec<DirEntryStats>> {
        let abs = self.check_read(path)?;
        let mut out = Vec::new();
        let mut rd = tokio::fs::read_dir(&abs).await?;
        while let Some(entry) = rd.next_entry().await? {
            let ft = entry.file_type().await?;
            out.push(DirEntryStats {
                name: entry.file_name().to_string_lossy().into_owned(),
                is_file: ft.is_file(),
                is_dir: ft.is_dir(),
            });
        }
        Ok(out)
    }

    pub async fn stat(&self, path: &Path) -> Result<Stat> {
        let abs = self.check_read(path)?;
        let meta = tokio::fs::metadata(&abs).await?;
        Ok(Stat {
            is_file: meta.is_file(),
            is_dir: meta.is_dir(),
            size: meta.len(),
            mtime_ms: system_time_ms(meta.modified().ok()),
            ctime_ms: system_time_ms(meta.created().ok()),
        })
    }

    /// Never fails: a denied or missing path both report `false`.
    pub async fn exists(&self, path: &Path) -> bool {
        match self.check_read(path) {
            Ok(abs) => tokio::fs::try_exists(&abs).await.unwrap_or(false),
            Err(_) => false,
        }
    }

    pub async fn mkdir(&self, path: &Path, recursive: bool) -> Result<()> {
        let abs = self.check_write(path)?;
        if recursive {
            tokio::fs::create_dir_all(&abs).await?;
        } else {
            tokio::fs::create_dir(&abs).await?;
        }
        Ok(())
    }

    pub async fn rm(&self, path: &Path, recursive: bool, force: bool) -> Result<()> {
        let abs = self.check_write(path)?;
        let meta = tokio::fs::metadata(&abs).await;
        let result = match meta {
            Ok(m) if m.is_dir() && recursive => tokio::fs::remove_dir_all(&abs).await,
            Ok(m) if m.is_dir() => tokio::fs::remove_dir(&abs).await,
            Ok(_) => tokio::fs::remove_file(&abs).await,
            Err(e) if force && e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e),
        };
        Ok(result?)
    }

    pub async fn copy(&self, src: &Path, dest: &Path) -> Result<()> {
        let src_abs = self.check_read(src)?;
        let dest_abs = self.check_write(dest)?;
        if let Some(parent) = dest_abs.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::copy(&src_abs, &dest_abs).await?;
        Ok(())
    }

    pub async fn mv(&self, src: &Path, dest: &Path) -> Result<()> {
        let src_abs = self.check_write(src)?;
        let dest_abs = self.check_write(dest)?;
        if let Some(parent) = dest_abs.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::rename(&src_abs, &dest_abs).await?;
        Ok(())
    }

    // Pure path helpers — no policy check (spec.md §4.2).
    pub fn resolve(&self, path: &Path) -> PathBuf {
        anchor(&self.cwd, path)
    }

    pub fn join(base: &Path, part: &str) -> PathBuf {
        base.join(part)
    }

    pub fn dirname(path: &Path) -> Option<PathBuf> {
        path.parent().map(Path::to_path_buf)
    }

    pub fn basename(path: &Path) -> Option<String> {
        path.file_name().map(|n| n.to_string_lossy().into_owned())
    }

    pub fn extname(path: &Path) -> Option<String> {
        path.extension().map(|e| format!(".{}", e.to_string_lossy()))
    }
}

fn system_time_ms(t: Option<std::time::SystemTime>) -> i64 {
    t.and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

/// `fetch` and `env` facades are single-callable by design (spec.md §4.2); the HTTP
/// client is injected so tests don't need a live network.
pub struct FetchFacade {
    policy: Policy,
    harden: Arc<Harden>,
}

impl FetchFacade {
    pub fn new(policy: Policy, harden: Arc<Harden>) -> Self {
        Self { policy, harden }
    }

    /// Checks the URL against Policy; callers perform the actual request, since the
    /// ambient-unrestricted-fetch the teacher's JS model forwards to has no single
    /// equivalent object in Rust (no crate is pulled in for an HTTP client the spec
    /// never asks this host to make requests with on its own behalf).
    pub fn authorize(&self, url: &str) -> Result<()> {
        accept(&self.harden, ViolationKind::Fetch, url, policy::check_fetch_relaxed(url, &self.policy.network.fetch))
    }
}

pub struct EnvFacade {
    policy: Policy,
    harden: Arc<Harden>,
}

impl EnvFacade {
    pub fn new(policy: Policy, harden: Arc<Harden>) -> Self {
        Self { policy, harden }
    }

    /// Never fails: denied keys silently return `None` (spec.md §4.2), but the harden
    /// layer still records the interception so `warn`/`compat` posture is visible.
    pub fn get(&self, key: &str) -> Option<String> {
        let decision = policy::check_env(key, &self.policy.env.read);
        if accept(&self.harden, ViolationKind::Env, key, decision).is_ok() {
            std::env::var(key).ok()
        } else {
            None
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ShellResult {
    pub code: i32,
    pub stdout: String,
    pub stderr: String,
    pub ok: bool,
}

pub struct ShellFacade {
    policy: Policy,
    harden: Arc<Harden>,
}

impl ShellFacade {
    pub fn new(policy: Policy, harden: Arc<Harden>) -> Self {
        Self { policy, harden }
    }

    pub async fn exec(
        &self,
        cmd: &str,
        argv: &[String],
        cwd: Option<&Path>,
        env: &[(String, String)],
        timeout_ms: u64,
        throw_on_error: bool,
    ) -> Result<ShellResult> {
        accept(&self.harden, ViolationKind::Shell, cmd, policy::check_shell(cmd, argv, &self.policy.shell))?;

        let mut command = Command::new(cmd);
        command.args(argv);
        if let Some(cwd) = cwd {
            command.current_dir(cwd);
        }
        // Merge parent env with supplied env; supplied wins (spec.md §4.2).
        for (k, v) in env {
            command.env(k, v);
        }
        command.stdout(std::process::Stdio::piped());
        command.stderr(std::process::Stdio::piped());
        // Forced termination on drop backstops the explicit `start_kill()` below so a
        // timed-out child never outlives this facade call (spec.md §4.2 "Enforces
        // timeout via forced termination").
        command.kill_on_drop(true);

        let mut child = command.spawn().map_err(Error::Io)?;
        let mut stdout_pipe = child.stdout.take();
        let mut stderr_pipe = child.stderr.take();

        let run = async {
            let mut stdout = String::new();
            let mut stderr = String::new();
            if let Some(mut out) = stdout_pipe.take() {
                out.read_to_string(&mut stdout).await.ok();
            }
            if let Some(mut err) = stderr_pipe.take() {
                err.read_to_string(&mut stderr).await.ok();
            }
            let status = child.wait().await?;
            Ok::<_, std::io::Error>((status, stdout, stderr))
        };

        match timeout(Duration::from_millis(timeout_ms), run).await {
            Ok(Ok((status, stdout, stderr))) => {
                let code = status.code().unwrap_or(-1);
                let ok = code == 0;
                if !ok && throw_on_error {
                    return Err(Error::Internal(format!(
                        "command '{cmd}' exited with code {code}: {stderr}"
                    )));
                }
                Ok(ShellResult { code, stdout, stderr, ok })
            }
            Ok(Err(e)) => Err(Error::Io(e)),
            Err(_) => {
                let _ = child.start_kill();
                let _ = child.wait().await;
                Err(Error::Internal(format!("command '{cmd}' timed out after {timeout_ms}ms")))
            }
        }
    }
}

/// `artifacts` facade: namespaced to `outdir` (spec.md §4.2).
pub struct ArtifactsFacade {
    outdir: PathBuf,
}

#[derive(Debug, Clone, Serialize)]
pub struct ArtifactInfo {
    pub name: String,
    pub path: PathBuf,
    pub size: u64,
    pub created_at_ms: i64,
}

impl ArtifactsFacade {
    pub fn new(outdir: PathBuf) -> Self {
        Self { outdir }
    }

    fn path_for(&self, name: &str) -> PathBuf {
        self.outdir.join(name)
    }

    pub async fn write(&self, name: &str, content: &[u8]) -> Result<PathBuf> {
        tokio::fs::create_dir_all(&self.outdir).await?;
        let path = self.path_for(name);
        tokio::fs::write(&path, content).await?;
        Ok(path)
    }

    pub async fn read(&self, name: &str) -> Result<String> {
        Ok(tokio::fs::read_to_string(self.path_for(name)).await?)
    }

    pub async fn read_buffer(&self, name: &str) -> Result<Vec<u8>> {
        Ok(tokio::fs::read(self.path_for(name)).await?)
    }

    pub async fn exists(&self, name: &str) -> bool {
        tokio::fs::try_exists(self.path_for(name)).await.unwrap_or(false)
    }

    pub fn path(&self, name: &str) -> PathBuf {
        self.path_for(name)
    }

    /// Regular top-level files only; a missing `outdir` is an empty list, not an error.
    pub async fn list(&self) -> Result<Vec<ArtifactInfo>> {
        let mut entries = Vec::new();
        let mut rd = match tokio::fs::read_dir(&self.outdir).await {
            Ok(rd) => rd,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(entries),
            Err(e) => return Err(Error::Io(e)),
        };
        while let Some(entry) = rd.next_entry().await? {
            if entry.file_type().await?.is_file() {
                let meta = entry.metadata().await?;
                entries.push(ArtifactInfo {
                    name: entry.file_name().to_string_lossy().into_owned(),
                    path: entry.path(),
                    size: meta.len(),
                    created_at_ms: system_time_ms(meta.created().ok()),
                });
            }
        }
        Ok(entries)
    }
}

/// `state` facade: a per-(tenant, plugin) namespaced view over a host-supplied cache
/// (spec.md §4.2). The cache itself is a trait so `kb-host` can back it with whatever
/// store it likes; a plain in-memory map is supplied for tests and the default host.
#[async_trait::async_trait]
pub trait StateCache: Send + Sync {
    async fn get(&self, key: &str) -> Option<serde_json::Value>;
    async fn set(&self, key: &str, value: serde_json::Value, ttl_ms: Option<u64>);
    async fn delete(&self, key: &str);
}

pub struct StateFacade {
    cache: std::sync::Arc<dyn StateCache>,
    tenant_id: Option<String>,
    plugin_id: String,
}

impl StateFacade {
    pub fn new(cache: std::sync::Arc<dyn StateCache>, tenant_id: Option<String>, plugin_id: String) -> Self {
        Self { cache, tenant_id, plugin_id }
    }

    fn key(&self, k: &str) -> String {
        namespaced_key(self.tenant_id.as_deref(), &self.plugin_id, k)
    }

    pub async fn get(&self, k: &str) -> Option<serde_json::Value> {
        self.cache.get(&self.key(k)).await
    }

    pub async fn set(&self, k: &str, v: serde_json::Value, ttl_ms: Option<u64>) {
        self.cache.set(&self.key(k), v, ttl_ms).await;
    }

    pub async fn delete(&self, k: &str) {
        self.cache.delete(&self.key(k)).await;
    }

    pub async fn has(&self, k: &str) -> bool {
        self.get(k).await.is_some()
    }

    pub async fn get_many(&self, keys: &[String]) -> ManyResult {
        let mut out = ManyResult::new();
        for k in keys {
            if let Some(v) = self.get(k).await {
                out.insert(k.clone(), v);
            }
        }
        out
    }

    pub async fn set_many(&self, entries: &[(String, serde_json::Value)], ttl_ms: Option<u64>) {
        for (k, v) in entries {
            self.set(k, v.clone(), ttl_ms).await;
        }
    }
}

/// `events.emit` sink, host-supplied; `None` yields a no-op (spec.md §4.2).
#[async_trait::async_trait]
pub trait EventSink: Send + Sync {
    async fn emit(&self, name: &str, payload: serde_json::Value);
}

pub struct EventsFacade {
    sink: Option<std::sync::Arc<dyn EventSink>>,
    plugin_id: String,
}

impl EventsFacade {
    pub fn new(sink: Option<std::sync::Arc<dyn EventSink>>, plugin_id: String) -> Self {
        Self { sink, plugin_id }
    }

    pub async fn emit(&self, name: &str, payload: serde_json::Value) {
        if let Some(sink) = &self.sink {
            sink.emit(&namespaced_event(&self.plugin_id, name), payload).await;
        }
    }
}

/// `invoke.call`, delegating to a host-supplied invoker when Policy allows the target
/// plugin (spec.md §4.2). `None` invoker or a disallowed target both deny. The
/// calling invocation's `requestId` is passed through so the host can set the nested
/// invocation's `parentRequestId` (spec.md §4.5 "traceId is extractTraceId(parentRequestId)
/// when the descriptor has a parent").
#[async_trait::async_trait]
pub trait Invoker: Send + Sync {
    async fn call(&self, target_plugin_id: &str, input: serde_json::Value, parent_request_id: &str) -> Result<serde_json::Value>;
}

pub struct InvokeFacade {
    policy: Policy,
    invoker: Option<std::sync::Arc<dyn Invoker>>,
    harden: Arc<Harden>,
    request_id: String,
}

impl InvokeFacade {
    pub fn new(policy: Policy, invoker: Option<std::sync::Arc<dyn Invoker>>, harden: Arc<Harden>, request_id: String) -> Self {
        Self { policy, invoker, harden, request_id }
    }

    pub async fn call(&self, target_plugin_id: &str, input: serde_json::Value) -> Result<serde_json::Value> {
        accept(
            &self.harden,
            ViolationKind::Invoke,
            target_plugin_id,
            policy::check_invoke(target_plugin_id, &self.policy.invoke),
        )?;
        match &self.invoker {
            Some(invoker) => invoker.call(target_plugin_id, input, &self.request_id).await,
            None => Err(Error::Permission(PermissionDenial::new(
                "no invoker configured for this host",
                serde_json::json!({ "targetPluginId": target_plugin_id }),
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kb_core::policy::EnvPolicy;
    use tempfile::tempdir;

    fn allow_all_policy() -> Policy {
        let mut policy = Policy::default();
        policy.fs.read = vec!["**".to_string()];
        policy.fs.write = vec!["**".to_string()];
        policy
    }

    fn harden() -> Arc<Harden> {
        Arc::new(Harden::install(crate::harden::EnforcementMode::Enforce))
    }

    #[tokio::test]
    async fn fs_write_then_read_round_trips() {
        let dir = tempdir().expect("tempdir");
        let outdir = dir.path().join(".kb").join("output");
        let fs = FsFacade::new(allow_all_policy(), dir.path().to_path_buf(), outdir, harden());
        fs.write_file(Path::new("out.txt"), b"hello", false).await.expect("write");
        let content = fs.read_file(Path::new("out.txt")).await.expect("read");
        assert_eq!(content, "hello");
    }

    #[tokio::test]
    async fn fs_denies_outside_allow_set() {
        let dir = tempdir().expect("tempdir");
        let outdir = dir.path().join(".kb").join("output");
        let fs = FsFacade::new(Policy::default(), dir.path().to_path_buf(), outdir, harden());
        let err = fs.read_file(Path::new("../escape.txt")).await.unwrap_err();
        assert!(matches!(err, Error::Permission(_)));
    }

    #[tokio::test]
    async fn fs_exists_never_throws_on_denial() {
        let dir = tempdir().expect("tempdir");
        let outdir = dir.path().join(".kb").join("output");
        let fs = FsFacade::new(Policy::default(), dir.path().to_path_buf(), outdir, harden());
        assert!(!fs.exists(Path::new("../nope.txt")).await);
    }

    #[tokio::test]
    async fn fs_warn_mode_allows_denied_read_through() {
        let dir = tempdir().expect("tempdir");
        let outdir = dir.path().join(".kb").join("output");
        let warn_harden = Arc::new(Harden::install(crate::harden::EnforcementMode::Warn));
        let fs = FsFacade::new(Policy::default(), dir.path().to_path_buf(), outdir, warn_harden);
        std::fs::write(dir.path().join("probe.txt"), "hi").expect("seed file");
        let content = fs.read_file(Path::new("probe.txt")).await.expect("warn mode still reads");
        assert_eq!(content, "hi");
    }

    #[test]
    fn env_facade_denies_silently() {
        let mut policy = Policy::default();
        policy.env.read = vec!["MY_APP_*".to_string()];
        let env = EnvFacade::new(policy, harden());
        std::env::set_var("MY_APP_TOKEN", "secret");
        std::env::set_var("OTHER_SECRET", "nope");
        assert_eq!(env.get("MY_APP_TOKEN").as_deref(), Some("secret"));
        assert_eq!(env.get("OTHER_SECRET"), None);
        std::env::remove_var("MY_APP_TOKEN");
        std::env::remove_var("OTHER_SECRET");
    }

    #[test]
    fn always_allowed_env_keys_pass_through() {
        let env = EnvFacade::new(Policy::default(), harden());
        std::env::set_var("TZ", "UTC");
        assert_eq!(env.get("TZ").as_deref(), Some("UTC"));
        std::env::remove_var("TZ");
    }

    #[tokio::test]
    async fn artifacts_list_tolerates_missing_outdir() {
        let artifacts = ArtifactsFacade::new(PathBuf::from("/nonexistent/kb-artifacts-test"));
        let list = artifacts.list().await.expect("list");
        assert!(list.is_empty());
    }

    #[tokio::test]
    async fn shell_exec_denied_by_empty_policy() {
        let shell = ShellFacade::new(Policy::default(), harden());
        let err = shell.exec("echo", &["hi".to_string()], None, &[], 1_000, false).await.unwrap_err();
        assert!(matches!(err, Error::Permission(_)));
    }

    #[tokio::test]
    async fn shell_exec_kills_child_on_timeout() {
        let mut policy = Policy::default();
        policy.shell.allowed = true;
        policy.shell.commands = vec!["sleep".to_string()];
        let shell = ShellFacade::new(policy, harden());
        let err = shell.exec("sleep", &["5".to_string()], None, &[], 50, false).await.unwrap_err();
        assert!(matches!(err, Error::Internal(_)));
    }

    #[test]
    fn env_policy_empty_is_default() {
        assert!(EnvPolicy::default().read.is_empty());
    }
}
