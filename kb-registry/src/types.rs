//! Entities shared by the registry (C7) and the registration pipeline (C8):
//! `SystemCommand`, `CommandGroup`, `RegisteredCommand`, and `DiscoveryResult`
//! (spec.md §3, §4.7, §4.8).

use std::path::PathBuf;
use std::sync::Arc;

use kb_core::manifest::CliCommandSpec;
use kb_core::policy::Policy;

/// Where a discovered manifest came from, ordered by trust (spec.md §4.8 stage 2).
/// `Builtin` commands can never be shadowed (spec.md §3 `RegisteredCommand` invariant).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum DiscoverySource {
    NodeModules,
    Linked,
    Workspace,
    Builtin,
}

impl DiscoverySource {
    /// Priority used for stage-2 sort order (higher registers first).
    pub fn priority(self) -> u8 {
        match self {
            DiscoverySource::Builtin => 4,
            DiscoverySource::Workspace => 3,
            DiscoverySource::Linked => 2,
            DiscoverySource::NodeModules => 1,
        }
    }
}

/// Raw input to the registration pipeline: one manifest file found by whatever
/// discovery mechanism the host uses (walking workspace files, globbing — out of
/// scope here, spec.md §2 "concrete manifest discovery... specified only by the
/// `DiscoveryResult` it must produce").
#[derive(Debug, Clone)]
pub struct DiscoveryResult {
    pub source: DiscoverySource,
    pub package_name: String,
    pub manifest_path: PathBuf,
    pub pkg_root: PathBuf,
    pub manifests: Vec<kb_core::manifest::Manifest>,
}

/// A system (trusted, in-process) command, registered directly or as part of a
/// [`CommandGroup`]. `handler` is invoked in-process; it never crosses the sandbox
/// boundary (spec.md §4.7 "`system` => in-process invocation").
#[derive(Clone)]
pub struct SystemCommand {
    pub id: String,
    pub describe: Option<String>,
    pub aliases: Vec<String>,
    pub handler: Arc<dyn Fn(&SystemInvocation) -> kb_core::Result<serde_json::Value> + Send + Sync>,
}

impl std::fmt::Debug for SystemCommand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SystemCommand")
            .field("id", &self.id)
            .field("describe", &self.describe)
            .field("aliases", &self.aliases)
            .finish_non_exhaustive()
    }
}

/// Invocation arguments handed to a [`SystemCommand`]'s handler.
#[derive(Debug, Clone, Default)]
pub struct SystemInvocation {
    pub argv: Vec<String>,
    pub flags: serde_json::Value,
}

/// A named group of system commands (spec.md §4.7 "Group handling"). A raw lookup
/// of `name` returns the group itself; the router must not execute a group.
#[derive(Clone)]
pub struct CommandGroup {
    pub name: String,
    pub describe: Option<String>,
    pub commands: Vec<SystemCommand>,
}

impl std::fmt::Debug for CommandGroup {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandGroup")
            .field("name", &self.name)
            .field("describe", &self.describe)
            .field("commands", &self.commands.iter().map(|c| &c.id).collect::<Vec<_>>())
            .finish()
    }
}

/// A plugin command after passing (or failing) the registration pipeline
/// (spec.md §3 `RegisteredCommand`). `manifest_id` is the owning manifest's `id`;
/// `id` is this specific CLI command's id.
///
/// The original entity carries an optional `v3Manifest` field for a legacy manifest
/// generation; nothing in this spec describes its shape, so it is not reproduced
/// here (see DESIGN.md).
#[derive(Debug, Clone)]
pub struct RegisteredCommand {
    pub id: String,
    pub manifest_id: String,
    pub plugin_version: String,
    pub package_name: String,
    pub pkg_root: PathBuf,
    pub handler_path: String,
    pub source: DiscoverySource,
    pub aliases: Vec<String>,
    pub permissions: Policy,
    pub describe: Option<String>,
    pub shadowed: bool,
    pub available: bool,
    pub unavailable_reason: Option<String>,
    pub hint: Option<String>,
}

impl RegisteredCommand {
    /// Every key this command should be reachable under: its id plus its aliases,
    /// normalised so `:` and ` ` separators collapse to the same key (spec.md §4.7).
    pub fn lookup_keys(&self) -> Vec<String> {
        let mut keys = vec![kb_core::manifest::normalise_lookup_key(&self.id)];
        for alias in &self.aliases {
            let key = kb_core::manifest::normalise_lookup_key(alias);
            if !keys.contains(&key) {
                keys.push(key);
            }
        }
        keys
    }

    fn from_spec(
        spec: &CliCommandSpec,
        manifest: &kb_core::manifest::Manifest,
        source: DiscoverySource,
        package_name: &str,
        pkg_root: &std::path::Path,
    ) -> Self {
        let permissions = match &spec.permissions {
            Some(cmd_level) => manifest.permissions.clone().merged_with(cmd_level),
            None => manifest.permissions.clone(),
        };
        let mut aliases = spec.aliases.clone();
        if let Some(ws) = kb_core::manifest::whitespace_alias(&spec.id) {
            if !aliases.contains(&ws) {
                aliases.push(ws);
            }
        }
        RegisteredCommand {
            id: spec.id.clone(),
            manifest_id: manifest.id.clone(),
            plugin_version: manifest.version.clone(),
            package_name: package_name.to_string(),
            pkg_root: pkg_root.to_path_buf(),
            handler_path: spec.handler_path.clone(),
            source,
            aliases,
            permissions,
            describe: spec.describe.clone(),
            shadowed: false,
            available: true,
            unavailable_reason: None,
            hint: None,
        }
    }

    pub(crate) fn build(
        spec: &CliCommandSpec,
        manifest: &kb_core::manifest::Manifest,
        source: DiscoverySource,
        package_name: &str,
        pkg_root: &std::path::Path,
    ) -> Self {
        Self::from_spec(spec, manifest, source, package_name, pkg_root)
    }
}

/// Host-side hook a `builtin`/`linked` plugin source may register ahead of running
/// the pipeline (spec.md §4.8 stage 6 "dynamically imports the manifest module to
/// invoke optional `init`/`register` hooks"). A genuinely dynamic module loader for
/// these hooks would need the same `libloading` machinery as [`kb_sandbox::bootstrap`]
/// just to run registration-time code in the host process; this crate does not carry
/// that, so only compile-time-linked sources (builtin/linked) can supply one — see
/// DESIGN.md.
pub trait PluginLifecycle: Send + Sync {
    fn init(&self, package_name: &str, pkg_root: &std::path::Path) -> kb_core::Result<()>;
    fn on_register(&self, command: &RegisteredCommand) -> kb_core::Result<()>;
    fn dispose(&self) {}
}
