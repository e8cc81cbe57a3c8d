//! `kb.toml` — host-wide configuration (spec.md §4.9 Design Notes, §9 Open Questions).
//!
//! Three sections: `[sandbox]` (process/runtime defaults), `[discovery]` (plugin search
//! paths and trust list), `[log]` (tracing verbosity). Unlike the teacher's `NyxConfig`,
//! this does not hot-reload: a config change only takes effect on the next `kb` invocation
//! (decision recorded in DESIGN.md — the host is a short-lived CLI process, not a daemon).

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::policy::Quotas;

/// `[sandbox]`: process-level defaults applied before any manifest- or command-level
/// permission override (spec.md §4.9 step 1).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SandboxConfig {
    /// Enforcement posture: `enforce` (deny + block), `compat` (deny, warn on harden
    /// violations), or `warn` (log only, never deny).
    pub mode: SandboxMode,
    /// Default quotas, overridable per-manifest.
    pub quotas: Quotas,
    /// Directory holding the IPC domain socket for a run; `None` uses a per-invocation
    /// temp directory.
    pub socket_dir: Option<PathBuf>,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            mode: SandboxMode::Enforce,
            quotas: Quotas::default(),
            socket_dir: None,
        }
    }
}

/// Sandbox enforcement mode (spec.md §4.9 Design Notes).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SandboxMode {
    Enforce,
    Compat,
    Warn,
}

/// `[discovery]`: where plugin manifests are found and which sources are trusted
/// (spec.md §4.8 stages 1-2).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DiscoveryConfig {
    /// Directories scanned for `kb-plugin.toml` manifests, in priority order (earlier
    /// entries win on id collision per spec.md §4.8 stage 5).
    pub paths: Vec<PathBuf>,
    /// Plugin ids allowed to register at all; empty means "trust everything discovered".
    pub trusted_ids: Vec<String>,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            paths: vec![PathBuf::from("plugins")],
            trusted_ids: Vec::new(),
        }
    }
}

/// `[log]`: tracing-subscriber configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// `error`/`warn`/`info`/`debug`/`trace`, overridden at runtime by `KB_LOG_LEVEL`.
    pub level: String,
    /// Emit newline-delimited JSON instead of the human-readable formatter.
    pub json: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

/// Root `kb.toml` document.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    pub sandbox: SandboxConfig,
    pub discovery: DiscoveryConfig,
    pub log: LogConfig,
}

impl Config {
    /// Parse a `kb.toml` file. Missing file is not an error at this layer — callers
    /// (`kb-cli`) decide whether to fall back to [`Config::default`].
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let data = fs::read_to_string(path.as_ref()).map_err(Error::Io)?;
        let cfg: Config = toml::from_str(&data)?;
        Ok(cfg)
    }

    /// Load `kb.toml` from `path` if it exists, otherwise return the default configuration.
    pub fn load_or_default<P: AsRef<Path>>(path: P) -> Result<Self> {
        if path.as_ref().exists() {
            Self::from_file(path)
        } else {
            Ok(Self::default())
        }
    }

    /// `KB_LOG_LEVEL` environment variable takes precedence over `[log] level`
    /// (spec.md ambient logging convention, mirrored from the teacher's CLI).
    pub fn effective_log_level(&self) -> String {
        std::env::var("KB_LOG_LEVEL").unwrap_or_else(|_| self.log.level.clone())
    }

    /// `KB_SANDBOX_MODE` environment variable takes precedence over `[sandbox] mode`
    /// (spec.md §4.6 step 3), mirroring `effective_log_level`'s env-override convention.
    pub fn effective_sandbox_mode(&self) -> SandboxMode {
        match std::env::var("KB_SANDBOX_MODE") {
            Ok(raw) => match raw.as_str() {
                "compat" => SandboxMode::Compat,
                "warn" => SandboxMode::Warn,
                "enforce" => SandboxMode::Enforce,
                _ => self.sandbox.mode,
            },
            Err(_) => self.sandbox.mode,
        }
    }
}

impl SandboxMode {
    pub fn as_env_str(self) -> &'static str {
        match self {
            SandboxMode::Enforce => "enforce",
            SandboxMode::Compat => "compat",
            SandboxMode::Warn => "warn",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_has_enforce_mode_and_info_log() {
        let cfg = Config::default();
        assert_eq!(cfg.sandbox.mode, SandboxMode::Enforce);
        assert_eq!(cfg.log.level, "info");
    }

    #[test]
    fn parses_minimal_toml() {
        let toml_src = r#"
            [sandbox]
            mode = "warn"

            [discovery]
            paths = ["custom-plugins"]
            trusted_ids = ["acme:tools"]

            [log]
            level = "debug"
            json = true
        "#;
        let cfg: Config = toml::from_str(toml_src).expect("parse");
        assert_eq!(cfg.sandbox.mode, SandboxMode::Warn);
        assert_eq!(cfg.discovery.paths, vec![PathBuf::from("custom-plugins")]);
        assert_eq!(cfg.discovery.trusted_ids, vec!["acme:tools".to_string()]);
        assert!(cfg.log.json);
    }

    #[test]
    fn missing_file_falls_back_to_default() {
        let cfg = Config::load_or_default("/nonexistent/kb.toml").expect("fallback");
        assert_eq!(cfg.discovery.paths, DiscoveryConfig::default().paths);
    }

    #[test]
    fn log_level_env_override_wins() {
        std::env::set_var("KB_LOG_LEVEL", "trace");
        let cfg = Config::default();
        assert_eq!(cfg.effective_log_level(), "trace");
        std::env::remove_var("KB_LOG_LEVEL");
    }

    #[test]
    fn sandbox_mode_env_override_wins() {
        std::env::remove_var("KB_SANDBOX_MODE");
        let mut cfg = Config::default();
        cfg.sandbox.mode = SandboxMode::Compat;
        assert_eq!(cfg.effective_sandbox_mode(), SandboxMode::Compat);
        std::env::set_var("KB_SANDBOX_MODE", "warn");
        assert_eq!(cfg.effective_sandbox_mode(), SandboxMode::Warn);
        std::env::remove_var("KB_SANDBOX_MODE");
    }
}
