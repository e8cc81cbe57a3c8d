//! The `Manifest` entity (spec.md §3) and its structural ("preflight") validation,
//! the first stage of the Registration Pipeline (C8 stage 1).

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::policy::Policy;

static ID_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[a-z0-9-]+(:[a-z0-9-]+)*$").expect("static pattern"));
static ALIAS_PATTERN: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[a-z0-9-:]+$").expect("static pattern"));

pub const MANIFEST_VERSION: &str = "1.0";

/// One flag accepted by a `cli.commands[]` entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlagSpec {
    pub name: String,
    #[serde(default)]
    pub alias: Option<char>,
    #[serde(rename = "type")]
    pub kind: FlagKind,
    #[serde(default)]
    pub choices: Vec<String>,
    #[serde(default)]
    pub default: Option<serde_json::Value>,
    #[serde(default)]
    pub describe: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FlagKind {
    String,
    Boolean,
    Number,
}

/// One entry of `manifest.cli.commands[]`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CliCommandSpec {
    pub id: String,
    #[serde(rename = "handlerPath")]
    pub handler_path: String,
    #[serde(default)]
    pub flags: Vec<FlagSpec>,
    #[serde(default)]
    pub describe: Option<String>,
    #[serde(default)]
    pub examples: Vec<String>,
    #[serde(default)]
    pub aliases: Vec<String>,
    /// Command-level permission override, merged over the manifest's top-level policy.
    #[serde(default)]
    pub permissions: Option<Policy>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct DisplayInfo {
    pub name: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct EngineRequirement {
    /// `engine.kbCli` version range, e.g. `">=1.0.0 <2.0.0"`.
    #[serde(rename = "kbCli")]
    pub kb_cli: Option<String>,
}

/// Declarative description of a plugin (spec.md §3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Manifest {
    pub id: String,
    pub version: String,
    #[serde(rename = "manifestVersion")]
    pub manifest_version: String,
    #[serde(default)]
    pub display: DisplayInfo,
    #[serde(default)]
    pub permissions: Policy,
    pub cli: CliSection,
    #[serde(default)]
    pub jobs: Vec<serde_json::Value>,
    #[serde(rename = "configSection", default)]
    pub config_section: Option<serde_json::Value>,
    #[serde(default)]
    pub engine: EngineRequirement,
    /// Package ids this plugin requires to be resolvable (C8 stage 4).
    #[serde(default)]
    pub requires: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct CliSection {
    pub commands: Vec<CliCommandSpec>,
}

/// Structural validation failures (spec.md §4.8 stage 1 / §7 kind 2).
#[derive(Debug, Clone, thiserror::Error)]
pub enum ManifestValidationError {
    #[error("manifest id '{0}' does not match ^[a-z0-9-]+(:[a-z0-9-]+)*$")]
    InvalidId(String),
    #[error("unsupported manifestVersion '{0}', expected {MANIFEST_VERSION}")]
    UnsupportedVersion(String),
    #[error("duplicate cli.commands id '{0}'")]
    DuplicateCommandId(String),
    #[error("command '{command}' flag '{flag}': alias must be a single lowercase letter")]
    InvalidFlagAlias { command: String, flag: String },
    #[error("command '{command}' flag '{flag}': choices are only valid for string flags")]
    ChoicesOnNonString { command: String, flag: String },
    #[error("command '{command}' flag '{flag}': default value type does not match declared type")]
    DefaultTypeMismatch { command: String, flag: String },
    #[error("command '{command}' alias '{alias}' does not match ^[a-z0-9-:]+$")]
    InvalidAlias { command: String, alias: String },
}

/// Preflight-validate a manifest's structure (spec.md §4.8 stage 1). Does not check
/// `requires` availability (stage 4, filesystem-dependent) nor collisions (stage 5,
/// registry-dependent) — those live in `kb-registry`.
pub fn validate_structure(m: &Manifest) -> Result<(), ManifestValidationError> {
    if !ID_PATTERN.is_match(&m.id) {
        return Err(ManifestValidationError::InvalidId(m.id.clone()));
    }
    if m.manifest_version != MANIFEST_VERSION {
        return Err(ManifestValidationError::UnsupportedVersion(m.manifest_version.clone()));
    }
    let mut seen = std::collections::HashSet::new();
    for cmd in &m.cli.commands {
        if !seen.insert(cmd.id.clone()) {
            return Err(ManifestValidationError::DuplicateCommandId(cmd.id.clone()));
        }
        for flag in &cmd.flags {
            if let Some(alias) = flag.alias {
                if !alias.is_ascii_lowercase() {
                    return Err(ManifestValidationError::InvalidFlagAlias {
                        command: cmd.id.clone(),
                        flag: flag.name.clone(),
                    });
                }
            }
            if !flag.choices.is_empty() && flag.kind != FlagKind::String {
                return Err(ManifestValidationError::ChoicesOnNonString {
                    command: cmd.id.clone(),
                    flag: flag.name.clone(),
                });
            }
            if let Some(default) = &flag.default {
                let matches = match flag.kind {
                    FlagKind::String => default.is_string(),
                    FlagKind::Boolean => default.is_boolean(),
                    FlagKind::Number => default.is_number(),
                };
                if !matches {
                    return Err(ManifestValidationError::DefaultTypeMismatch {
                        command: cmd.id.clone(),
                        flag: flag.name.clone(),
                    });
                }
            }
        }
    }
    Ok(())
}

/// Whether a command alias matches the allowed shape (spec.md §4.8 stage 3). Invalid
/// aliases are dropped with a warning by the registration pipeline, not a structural
/// validation failure — callers needing that behaviour live in `kb-registry`.
pub fn is_valid_alias(alias: &str) -> bool {
    ALIAS_PATTERN.is_match(alias)
}

/// Derive the automatic whitespace alias for a colon-separated id (`"foo:bar"` -> `"foo bar"`),
/// spec.md §4.8 stage 3.
pub fn whitespace_alias(id: &str) -> Option<String> {
    if id.contains(':') {
        Some(id.replace(':', " "))
    } else {
        None
    }
}

/// Normalise a lookup key so that `:` and ` ` separators resolve to the same entry
/// (spec.md §4.7).
pub fn normalise_lookup_key(name: &str) -> String {
    name.replace(' ', ":")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_manifest(id: &str) -> Manifest {
        Manifest {
            id: id.to_string(),
            version: "0.1.0".to_string(),
            manifest_version: MANIFEST_VERSION.to_string(),
            display: DisplayInfo::default(),
            permissions: Policy::default(),
            cli: CliSection { commands: vec![] },
            jobs: vec![],
            config_section: None,
            engine: EngineRequirement::default(),
            requires: vec![],
        }
    }

    #[test]
    fn accepts_namespaced_id() {
        let m = base_manifest("agent:trace:stats");
        assert!(validate_structure(&m).is_ok());
    }

    #[test]
    fn rejects_bad_id() {
        let m = base_manifest("Bad_ID!");
        assert!(matches!(validate_structure(&m), Err(ManifestValidationError::InvalidId(_))));
    }

    #[test]
    fn rejects_duplicate_command_ids() {
        let mut m = base_manifest("health");
        m.cli.commands.push(CliCommandSpec {
            id: "run".into(),
            handler_path: "h.so".into(),
            flags: vec![],
            describe: None,
            examples: vec![],
            aliases: vec![],
            permissions: None,
        });
        m.cli.commands.push(m.cli.commands[0].clone());
        assert!(matches!(
            validate_structure(&m),
            Err(ManifestValidationError::DuplicateCommandId(_))
        ));
    }

    #[test]
    fn whitespace_alias_for_namespaced_id() {
        assert_eq!(whitespace_alias("foo:bar"), Some("foo bar".to_string()));
        assert_eq!(whitespace_alias("foo"), None);
    }

    #[test]
    fn lookup_key_normalises_space_to_colon() {
        assert_eq!(normalise_lookup_key("agent trace stats"), "agent:trace:stats");
        assert_eq!(normalise_lookup_key("agent:trace:stats"), "agent:trace:stats");
    }
}
