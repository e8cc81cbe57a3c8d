//! C1 — Permission Policy: pure, deterministic, no I/O.
//!
//! Evaluates a path/URL/key/command against a manifest-declared `Policy` and
//! returns an allow/deny `Decision`. Every rule here additively combines an
//! allow list with a fixed deny list, deny always winning (spec.md §4.1).

use std::path::{Path, PathBuf};

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::error::PermissionDenial;

/// Outcome of a single policy check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    Allow,
    Deny { reason: String, details: serde_json::Value },
}

impl Decision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Decision::Allow)
    }

    /// Convert a denial into the `PermissionDenial` facades raise to handlers.
    pub fn into_denial(self) -> Option<PermissionDenial> {
        match self {
            Decision::Allow => None,
            Decision::Deny { reason, details } => Some(PermissionDenial::new(reason, details)),
        }
    }
}

/// Resource quotas enforced by the host around one invocation (§3 Descriptor).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Quotas {
    pub timeout_ms: u64,
    pub memory_mb: u64,
    pub cpu_ms: u64,
}

impl Default for Quotas {
    fn default() -> Self {
        Self {
            timeout_ms: 30_000,
            memory_mb: 256,
            cpu_ms: 30_000,
        }
    }
}

/// `fs` section of a `Policy`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct FsPolicy {
    pub read: Vec<String>,
    pub write: Vec<String>,
}

/// `network` section of a `Policy`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkPolicy {
    pub fetch: Vec<String>,
}

/// `env` section of a `Policy`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EnvPolicy {
    pub read: Vec<String>,
}

/// `shell` section of a `Policy`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ShellPolicy {
    pub allowed: bool,
    pub commands: Vec<String>,
}

/// `invoke` section of a `Policy`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct InvokePolicy {
    pub allowed: bool,
    pub plugins: Vec<String>,
}

/// The permission set attached to a manifest (and optionally overridden per command).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Policy {
    pub fs: FsPolicy,
    pub network: NetworkPolicy,
    pub env: EnvPolicy,
    pub shell: ShellPolicy,
    pub invoke: InvokePolicy,
    pub quotas: Quotas,
}

impl Policy {
    /// Merge `self` with a command-level override; fields set on `other` win (spec.md §4.9 step 2).
    pub fn merged_with(&self, other: &Policy) -> Policy {
        Policy {
            fs: FsPolicy {
                read: merge_patterns(&self.fs.read, &other.fs.read),
                write: merge_patterns(&self.fs.write, &other.fs.write),
            },
            network: NetworkPolicy {
                fetch: merge_patterns(&self.network.fetch, &other.network.fetch),
            },
            env: EnvPolicy {
                read: merge_patterns(&self.env.read, &other.env.read),
            },
            shell: ShellPolicy {
                allowed: other.shell.allowed || self.shell.allowed,
                commands: merge_patterns(&self.shell.commands, &other.shell.commands),
            },
            invoke: InvokePolicy {
                allowed: other.invoke.allowed || self.invoke.allowed,
                plugins: merge_patterns(&self.invoke.plugins, &other.invoke.plugins),
            },
            quotas: other.quotas.clone(),
        }
    }
}

fn merge_patterns(base: &[String], over: &[String]) -> Vec<String> {
    let mut out = base.to_vec();
    for p in over {
        if !out.contains(p) {
            out.push(p.clone());
        }
    }
    out
}

const ALWAYS_ALLOWED_ENV: &[&str] = &["NODE_ENV", "CI", "DEBUG", "TZ", "LANG", "LC_ALL"];

/// Fixed path deny-list substrings/suffixes (spec.md §4.1), checked on the
/// normalised absolute path, case-insensitively for the substring set.
const DENY_PATH_SEGMENTS: &[&str] = &["node_modules/", ".git/", ".ssh/", "/etc/", "/usr/", "/var/"];
const DENY_PATH_SUBSTRINGS_CI: &[&str] = &["credentials", "secret", "password"];
const DENY_PATH_SUFFIXES: &[&str] = &[".pem", ".key", ".env"];

fn normalise(p: &Path, cwd: &Path) -> PathBuf {
    let abs = if p.is_absolute() { p.to_path_buf() } else { cwd.join(p) };
    // Lexical normalisation only — no symlink resolution (spec.md §9 open question).
    let mut out = PathBuf::new();
    for comp in abs.components() {
        use std::path::Component::*;
        match comp {
            CurDir => {}
            ParentDir => {
                out.pop();
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}

fn is_denied_path(normalised: &Path) -> Option<String> {
    let s = normalised.to_string_lossy();
    let lower = s.to_lowercase();
    for seg in DENY_PATH_SEGMENTS {
        if s.contains(seg) {
            return Some(format!("path matches fixed deny segment {seg}"));
        }
    }
    for needle in DENY_PATH_SUBSTRINGS_CI {
        if lower.contains(needle) {
            return Some(format!("path matches fixed deny substring {needle}"));
        }
    }
    for suffix in DENY_PATH_SUFFIXES {
        if lower.ends_with(suffix) {
            return Some(format!("path matches fixed deny suffix {suffix}"));
        }
    }
    // `.env` as a bare filename (not just suffix-matched, e.g. `.env.local`).
    if let Some(name) = normalised.file_name().and_then(|n| n.to_str()) {
        if name == ".env" || name.starts_with(".env.") {
            return Some("path is an .env file".to_string());
        }
    }
    None
}

fn allow_set(cwd: &Path, patterns: &[String], default: PathBuf) -> Vec<PathBuf> {
    let mut set = vec![default];
    for p in patterns {
        set.push(normalise(Path::new(p), cwd));
    }
    set
}

fn path_in_allow_set(normalised: &Path, allow: &[PathBuf]) -> bool {
    allow.iter().any(|root| normalised.starts_with(root))
}

/// `checkReadPath(p, cwd, allow) -> Decision`
pub fn check_read_path(p: &Path, cwd: &Path, allow: &[String]) -> Decision {
    let normalised = normalise(p, cwd);
    if let Some(reason) = is_denied_path(&normalised) {
        return Decision::Deny {
            reason,
            details: json!({ "path": normalised.to_string_lossy() }),
        };
    }
    let set = allow_set(cwd, allow, cwd.to_path_buf());
    if path_in_allow_set(&normalised, &set) {
        Decision::Allow
    } else {
        Decision::Deny {
            reason: "path is outside the fs.read allow set".to_string(),
            details: json!({ "path": normalised.to_string_lossy() }),
        }
    }
}

/// `checkWritePath(p, cwd, writeAllow, outdir) -> Decision`
pub fn check_write_path(p: &Path, cwd: &Path, write_allow: &[String], outdir: &Path) -> Decision {
    let normalised = normalise(p, cwd);
    if let Some(reason) = is_denied_path(&normalised) {
        return Decision::Deny {
            reason,
            details: json!({ "path": normalised.to_string_lossy() }),
        };
    }
    let default = if outdir.is_absolute() { outdir.to_path_buf() } else { cwd.join(outdir) };
    let set = allow_set(cwd, write_allow, default);
    if path_in_allow_set(&normalised, &set) {
        Decision::Allow
    } else {
        Decision::Deny {
            reason: "path is outside the fs.write allow set".to_string(),
            details: json!({ "path": normalised.to_string_lossy() }),
        }
    }
}

/// Compile a glob-like pattern (`*` wildcard, `?` single-char) into an anchored regex.
fn glob_to_regex(pattern: &str) -> Option<Regex> {
    let mut out = String::from("^");
    for ch in pattern.chars() {
        match ch {
            '*' => out.push_str(".*"),
            '?' => out.push('.'),
            c if regex_syntax::is_meta_character(c) => {
                out.push('\\');
                out.push(c);
            }
            c => out.push(c),
        }
    }
    out.push('$');
    Regex::new(&out).ok()
}

/// `checkFetch(url, allow) -> Decision` — strict end-to-end glob match.
pub fn check_fetch(url: &str, allow: &[String]) -> Decision {
    for pattern in allow {
        if let Some(re) = glob_to_regex(pattern) {
            if re.is_match(url) {
                return Decision::Allow;
            }
        }
    }
    Decision::Deny {
        reason: "url did not match any network.fetch pattern".to_string(),
        details: json!({ "url": url, "allowedPatterns": allow }),
    }
}

/// Relaxed URL matching used by the ambient-fetch harden wrapper (spec.md §4.1):
/// accepts `*.host` suffix, scheme-prefixed substring, exact hostname, and `.suffix` suffix.
pub fn check_fetch_relaxed(url: &str, allow: &[String]) -> Decision {
    let host = url::Url::parse(url).ok().and_then(|u| u.host_str().map(|h| h.to_string()));
    for pattern in allow {
        if pattern == "*" {
            return Decision::Allow;
        }
        if let Some(suffix) = pattern.strip_prefix("*.") {
            if let Some(h) = &host {
                if h == suffix || h.ends_with(&format!(".{suffix}")) {
                    return Decision::Allow;
                }
            }
        }
        if pattern.contains("://") && url.starts_with(pattern) {
            return Decision::Allow;
        }
        if let Some(h) = &host {
            if h == pattern {
                return Decision::Allow;
            }
        }
        if pattern.starts_with('.') && host.as_deref().is_some_and(|h| h.ends_with(pattern)) {
            return Decision::Allow;
        }
    }
    Decision::Deny {
        reason: "url did not match any relaxed network.fetch pattern".to_string(),
        details: json!({ "url": url, "allowedPatterns": allow }),
    }
}

/// `checkEnv(key, allow) -> Decision`
pub fn check_env(key: &str, allow: &[String]) -> Decision {
    if ALWAYS_ALLOWED_ENV.contains(&key) {
        return Decision::Allow;
    }
    for pattern in allow {
        if let Some(prefix) = pattern.strip_suffix('*') {
            if key.starts_with(prefix) {
                return Decision::Allow;
            }
        } else if pattern == key {
            return Decision::Allow;
        }
    }
    Decision::Deny {
        reason: "env key is not in the env.read allow list".to_string(),
        details: json!({ "key": key }),
    }
}

/// Catastrophic shell command forms that are always denied regardless of allow list.
/// Best-effort substring matching over the joined command line (spec.md §9 open question).
const DANGEROUS_SHELL_PATTERNS: &[&str] = &[
    "rm -rf /",
    "rm -rf /*",
    "mkfs",
    "dd if=/dev/zero of=/dev/",
    "dd of=/dev/sd",
    ":(){:|:&};:",
    "chmod -r 777 /",
    "chmod -r 000 /",
    "chown -r",
    "> /dev/sda",
];

fn is_dangerous_shell(joined: &str) -> bool {
    let lower = joined.to_lowercase();
    DANGEROUS_SHELL_PATTERNS.iter().any(|p| lower.contains(p))
}

/// `checkShell(command, argv, allow) -> Decision`
pub fn check_shell(command: &str, argv: &[String], allow: &ShellPolicy) -> Decision {
    let joined = format!("{command} {}", argv.join(" "));
    if is_dangerous_shell(&joined) {
        return Decision::Deny {
            reason: "command matches a catastrophic shell deny pattern".to_string(),
            details: json!({ "command": command }),
        };
    }
    if !allow.allowed {
        return Decision::Deny {
            reason: "shell execution is disabled by policy".to_string(),
            details: json!({ "command": command }),
        };
    }
    if !allow.commands.is_empty() && !allow.commands.iter().any(|c| c == command) {
        return Decision::Deny {
            reason: "command is not in the shell.commands allow list".to_string(),
            details: json!({ "command": command, "allowed": allow.commands }),
        };
    }
    Decision::Allow
}

/// `checkInvoke(pluginId, allow) -> Decision`
pub fn check_invoke(plugin_id: &str, allow: &InvokePolicy) -> Decision {
    if !allow.allowed {
        return Decision::Deny {
            reason: "inter-plugin invocation is disabled by policy".to_string(),
            details: json!({ "pluginId": plugin_id }),
        };
    }
    if !allow.plugins.is_empty() && !allow.plugins.iter().any(|p| p == plugin_id) {
        return Decision::Deny {
            reason: "target plugin is not in the invoke.plugins allow list".to_string(),
            details: json!({ "pluginId": plugin_id }),
        };
    }
    Decision::Allow
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deny_outside_cwd_allows_cwd_relative() {
        let cwd = Path::new("/w");
        assert!(!check_read_path(Path::new("/etc/passwd"), cwd, &[]).is_allowed());
        assert!(check_read_path(Path::new("./a.txt"), cwd, &[]).is_allowed());
    }

    #[test]
    fn url_glob_match() {
        let allow = vec!["https://api.example.com/*".to_string()];
        assert!(check_fetch("https://api.example.com/v1/x", &allow).is_allowed());
        let d = check_fetch("https://evil.com/", &allow);
        assert!(!d.is_allowed());
        if let Decision::Deny { details, .. } = d {
            assert_eq!(details["allowedPatterns"], serde_json::json!(allow));
        }
    }

    #[test]
    fn env_always_allowed_ignores_policy() {
        for key in ALWAYS_ALLOWED_ENV {
            assert!(check_env(key, &[]).is_allowed());
        }
        assert!(!check_env("SECRET_TOKEN", &[]).is_allowed());
        assert!(check_env("MYAPP_FOO", &["MYAPP*".to_string()]).is_allowed());
    }

    #[test]
    fn deny_list_wins_over_allow() {
        let cwd = Path::new("/w");
        let allow = vec![".".to_string()];
        let d = check_read_path(Path::new("/w/.env"), cwd, &allow);
        assert!(!d.is_allowed());
        let d2 = check_read_path(Path::new("/w/.git/config"), cwd, &allow);
        assert!(!d2.is_allowed());
    }

    #[test]
    fn shell_allow_list_and_deny_pattern() {
        let policy = ShellPolicy { allowed: true, commands: vec!["git".to_string()] };
        assert!(check_shell("git", &["status".into()], &policy).is_allowed());
        assert!(!check_shell("curl", &[], &policy).is_allowed());
        let open = ShellPolicy { allowed: true, commands: vec![] };
        assert!(!check_shell("rm", &["-rf".into(), "/".into()], &open).is_allowed());
    }

    #[test]
    fn invoke_allow_list() {
        let allow = InvokePolicy { allowed: true, plugins: vec!["a".to_string()] };
        assert!(check_invoke("a", &allow).is_allowed());
        assert!(!check_invoke("b", &allow).is_allowed());
    }

    proptest::proptest! {
        #[test]
        fn p1_policy_monotonicity(extra in "[a-z]{1,8}") {
            let cwd = Path::new("/w");
            let base: Vec<String> = vec![];
            let mut wider = base.clone();
            wider.push(format!("/allowed/{extra}"));
            let p = format!("/allowed/{extra}/file.txt");
            if check_read_path(Path::new(&p), cwd, &wider).is_allowed() {
                // superset allow must still allow: trivially true since wider ⊇ base ⊇ wider here,
                // exercised the other direction below.
            }
            let narrower = base;
            let d_narrow = check_read_path(Path::new(&p), cwd, &narrower);
            let d_wide = check_read_path(Path::new(&p), cwd, &wider);
            if d_narrow.is_allowed() {
                proptest::prop_assert!(d_wide.is_allowed());
            }
        }

        #[test]
        fn p3_path_normalisation_stability(seg in "[a-zA-Z0-9_]{1,6}") {
            let cwd = Path::new("/w");
            let allow = vec![".".to_string()];
            let raw = format!("./{seg}/../{seg}/file.txt");
            let normalised_input = format!("{seg}/file.txt");
            let d1 = check_read_path(Path::new(&raw), cwd, &allow);
            let d2 = check_read_path(Path::new(&normalised_input), cwd, &allow);
            proptest::prop_assert_eq!(d1.is_allowed(), d2.is_allowed());
        }

        #[test]
        fn p4_url_glob_idempotence(q in "[a-z]{3,10}") {
            let exact = format!("https://{q}.example.com/");
            proptest::prop_assert!(check_fetch(&exact, &[exact.clone()]).is_allowed());
            let wrong = format!("{exact}x");
            proptest::prop_assert!(!check_fetch(&wrong, &[exact]).is_allowed());
        }
    }
}
