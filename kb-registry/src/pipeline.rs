//! Registration Pipeline (C8, spec.md §4.8): turns a batch of `DiscoveryResult`s
//! into `{registered, skipped, collisions, errors}`, then feeds survivors into the
//! [`CommandRegistry`].

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use kb_core::manifest::{self, Manifest};

use crate::registry::CommandRegistry;
use crate::types::{DiscoveryResult, DiscoverySource, PluginLifecycle, RegisteredCommand};

/// One manifest or command dropped by the pipeline, with the stage that dropped it.
#[derive(Debug, Clone)]
pub struct SkippedEntry {
    pub package_name: String,
    pub manifest_id: Option<String>,
    pub command_id: Option<String>,
    pub reason: String,
}

/// Output of [`run_registration_pipeline`] (spec.md §4.8 "Final output").
#[derive(Debug, Default)]
pub struct PipelineOutcome {
    pub registered: Vec<RegisteredCommand>,
    pub skipped: Vec<SkippedEntry>,
    pub collisions: usize,
    pub errors: Vec<String>,
}

/// Host-supplied environment the pipeline needs for stage 4 (availability) and
/// stage 6 (lifecycle hooks).
pub struct PipelineEnv {
    pub cwd: PathBuf,
    pub binary_root: PathBuf,
    /// Presence of a workspace declaration file at some ancestor (spec.md §4.8
    /// stage 4 "special relaxation").
    pub monorepo_detected: bool,
    /// Keyed by `package_name`; only realistic for compile-time-linked sources
    /// (see [`PluginLifecycle`]'s doc comment).
    pub lifecycle_hooks: HashMap<String, Arc<dyn PluginLifecycle>>,
    resolve_requirement: Arc<dyn Fn(&str, &[PathBuf]) -> bool + Send + Sync>,
}

impl PipelineEnv {
    pub fn new(cwd: PathBuf, binary_root: PathBuf) -> Self {
        Self {
            cwd,
            binary_root,
            monorepo_detected: false,
            lifecycle_hooks: HashMap::new(),
            resolve_requirement: Arc::new(default_resolve_requirement),
        }
    }

    /// Override how a `requires` package id is resolved against a search path,
    /// primarily for tests.
    pub fn with_resolver(mut self, resolver: impl Fn(&str, &[PathBuf]) -> bool + Send + Sync + 'static) -> Self {
        self.resolve_requirement = Arc::new(resolver);
        self
    }

    fn search_path(&self, pkg_root: &std::path::Path) -> Vec<PathBuf> {
        vec![self.cwd.clone(), pkg_root.to_path_buf(), self.binary_root.clone()]
    }
}

fn default_resolve_requirement(id: &str, search_path: &[PathBuf]) -> bool {
    search_path.iter().any(|root| root.join(id).exists() || root.join("node_modules").join(id).exists())
}

struct Candidate {
    source: DiscoverySource,
    package_name: String,
    pkg_root: PathBuf,
    manifest: Manifest,
}

/// Run all seven stages over `discoveries`, inserting survivors into `registry`
/// (which separately applies the system-shadowing invariant, spec.md §4.7).
pub fn run_registration_pipeline(
    discoveries: Vec<DiscoveryResult>,
    registry: &mut CommandRegistry,
    env: &PipelineEnv,
) -> PipelineOutcome {
    let mut outcome = PipelineOutcome::default();

    // Stage 1: preflight structural validation.
    let mut candidates: Vec<Candidate> = Vec::new();
    for discovery in discoveries {
        for m in discovery.manifests {
            if let Err(e) = manifest::validate_structure(&m) {
                outcome.skipped.push(SkippedEntry {
                    package_name: discovery.package_name.clone(),
                    manifest_id: Some(m.id.clone()),
                    command_id: None,
                    reason: e.to_string(),
                });
                continue;
            }
            candidates.push(Candidate {
                source: discovery.source,
                package_name: discovery.package_name.clone(),
                pkg_root: discovery.pkg_root.clone(),
                manifest: m,
            });
        }
    }

    // Stage 2: source ordering, descending priority. Stable sort keeps discovery
    // order as the tiebreaker within one source.
    candidates.sort_by(|a, b| b.source.priority().cmp(&a.source.priority()));

    // Stages 3-5 operate per command, in the now-priority-ordered candidate list.
    // `claimed` tracks, per lookup key, which higher-priority (source, id) already
    // won it, so a later lower-priority loser can be marked shadowed instead of
    // silently overwriting.
    let mut claimed: HashMap<String, (DiscoverySource, String)> = HashMap::new();
    // Same id seen twice from `workspace` sources is a hard error (stage 5).
    let mut workspace_ids: HashMap<String, usize> = HashMap::new();
    // Same id within one group (here: one manifest) twice is a hard error (stage 1
    // already rejects literal duplicates; this also catches the case after
    // normalisation where two distinct ids collapse to the same key).
    let mut seen_keys_in_manifest: HashMap<(String, String), String> = HashMap::new();

    for candidate in &candidates {
        if candidate.source == DiscoverySource::Workspace {
            *workspace_ids.entry(candidate.manifest.id.clone()).or_insert(0) += 1;
        }
    }

    for candidate in candidates {
        let manifest_key = (candidate.package_name.clone(), candidate.manifest.id.clone());
        if candidate.source == DiscoverySource::Workspace && workspace_ids.get(&candidate.manifest.id).copied().unwrap_or(0) > 1 {
            outcome.errors.push(format!(
                "manifest id '{}' registered from two workspace sources",
                candidate.manifest.id
            ));
            outcome.collisions += 1;
            outcome.skipped.push(SkippedEntry {
                package_name: candidate.package_name.clone(),
                manifest_id: Some(candidate.manifest.id.clone()),
                command_id: None,
                reason: "duplicate workspace manifest id".into(),
            });
            continue;
        }

        for spec in &candidate.manifest.cli.commands {
            // Stage 3: id normalisation + soft alias validation.
            let aliases: Vec<String> = spec
                .aliases
                .iter()
                .filter(|a| {
                    let ok = manifest::is_valid_alias(a);
                    if !ok {
                        tracing::warn!(command = %spec.id, alias = %a, "dropping alias: invalid shape");
                    }
                    ok
                })
                .cloned()
                .collect();

            let mut built = RegisteredCommand::build(
                spec,
                &candidate.manifest,
                candidate.source,
                &candidate.package_name,
                &candidate.pkg_root,
            );
            built.aliases = aliases;
            if let Some(ws) = manifest::whitespace_alias(&spec.id) {
                if !built.aliases.contains(&ws) {
                    built.aliases.push(ws);
                }
            }

            // Stage 5: same id within the same manifest "group" twice is a hard error.
            let dup_key = (manifest_key.0.clone(), built.id.clone());
            if let Some(prior_source_label) = seen_keys_in_manifest.get(&dup_key) {
                outcome.errors.push(format!(
                    "command id '{}' registered twice within package '{}' ({})",
                    built.id, candidate.package_name, prior_source_label
                ));
                outcome.collisions += 1;
                outcome.skipped.push(SkippedEntry {
                    package_name: candidate.package_name.clone(),
                    manifest_id: Some(candidate.manifest.id.clone()),
                    command_id: Some(built.id.clone()),
                    reason: "duplicate command id within package".into(),
                });
                continue;
            }
            seen_keys_in_manifest.insert(dup_key, candidate.manifest.id.clone());

            // Stage 4: availability.
            let search_path = env.search_path(&candidate.pkg_root);
            for requirement in &candidate.manifest.requires {
                let resolvable = (env.resolve_requirement)(requirement, &search_path);
                if !resolvable && !env.monorepo_detected {
                    built.available = false;
                    built.unavailable_reason =
                        Some(format!("required package '{requirement}' could not be resolved"));
                    built.hint = Some(format!("install '{requirement}' alongside '{}'", candidate.package_name));
                    break;
                }
            }

            // Stage 5 continued: cross-source collision / shadowing, and alias
            // collisions against already-registered keys (including other
            // plugins' ids and already-registered system commands).
            let mut shadow_this = false;
            for key in built.lookup_keys() {
                if let Some(sys) = registry.get_with_type(&key) {
                    if matches!(sys, crate::registry::Routed::System(_)) {
                        // System shadowing is recorded by the registry on insert;
                        // nothing to do here beyond letting it happen.
                        continue;
                    }
                }
                match claimed.get(&key) {
                    None => {
                        claimed.insert(key, (candidate.source, built.id.clone()));
                    }
                    Some((winner_source, winner_id)) if *winner_id != built.id => {
                        if *winner_source >= candidate.source {
                            shadow_this = true;
                            tracing::debug!(
                                loser = %built.id, winner = %winner_id, key = %key,
                                "command key shadowed by a higher-priority source"
                            );
                        } else {
                            // Should not happen given descending-priority registration
                            // order, but keep the invariant honest if it ever does.
                            shadow_this = true;
                        }
                    }
                    _ => {}
                }
            }
            if shadow_this {
                built.shadowed = true;
                outcome.collisions += 1;
            }

            // Stage 6: lifecycle hooks (best-effort, failures are non-fatal).
            if let Some(hooks) = env.lifecycle_hooks.get(&candidate.package_name) {
                if let Err(e) = hooks.init(&candidate.package_name, &candidate.pkg_root) {
                    tracing::debug!(package = %candidate.package_name, error = %e, "lifecycle init hook failed");
                }
                if let Err(e) = hooks.on_register(&built) {
                    tracing::debug!(package = %candidate.package_name, error = %e, "lifecycle register hook failed");
                }
            }

            registry.insert_plugin_command(built.clone());
            outcome.registered.push(built);
        }
    }

    outcome
}

#[cfg(test)]
mod tests {
    use super::*;
    use kb_core::manifest::{CliCommandSpec, CliSection, DisplayInfo, EngineRequirement};
    use kb_core::policy::Policy;

    fn manifest(id: &str, commands: Vec<CliCommandSpec>) -> Manifest {
        Manifest {
            id: id.to_string(),
            version: "1.0.0".into(),
            manifest_version: "1.0".into(),
            display: DisplayInfo::default(),
            permissions: Policy::default(),
            cli: CliSection { commands },
            jobs: vec![],
            config_section: None,
            engine: EngineRequirement::default(),
            requires: vec![],
        }
    }

    fn command(id: &str) -> CliCommandSpec {
        CliCommandSpec {
            id: id.to_string(),
            handler_path: "handler.so".into(),
            flags: vec![],
            describe: None,
            examples: vec![],
            aliases: vec![],
            permissions: None,
        }
    }

    fn discovery(source: DiscoverySource, package: &str, manifests: Vec<Manifest>) -> DiscoveryResult {
        DiscoveryResult {
            source,
            package_name: package.to_string(),
            manifest_path: PathBuf::from(format!("/plugins/{package}/kb.plugin.toml")),
            pkg_root: PathBuf::from(format!("/plugins/{package}")),
            manifests,
        }
    }

    #[test]
    fn invalid_manifest_is_skipped_not_fatal() {
        let bad = manifest("Bad Id!", vec![]);
        let good = manifest("good-plugin", vec![command("run")]);
        let discoveries =
            vec![discovery(DiscoverySource::Workspace, "bad-pkg", vec![bad]), discovery(DiscoverySource::Workspace, "good-pkg", vec![good])];
        let mut registry = CommandRegistry::new();
        let env = PipelineEnv::new(PathBuf::from("/cwd"), PathBuf::from("/bin"));
        let outcome = run_registration_pipeline(discoveries, &mut registry, &env);
        assert_eq!(outcome.registered.len(), 1);
        assert_eq!(outcome.skipped.len(), 1);
    }

    #[test]
    fn higher_priority_source_wins_same_id() {
        let builtin = discovery(DiscoverySource::Builtin, "core", vec![manifest("health", vec![command("health")])]);
        let linked = discovery(DiscoverySource::Linked, "third-party", vec![manifest("health", vec![command("health")])]);
        let mut registry = CommandRegistry::new();
        let env = PipelineEnv::new(PathBuf::from("/cwd"), PathBuf::from("/bin"));
        let outcome = run_registration_pipeline(vec![linked, builtin], &mut registry, &env);

        let winner = outcome.registered.iter().find(|c| c.id == "health" && !c.shadowed);
        assert!(winner.is_some());
        assert_eq!(winner.unwrap().source, DiscoverySource::Builtin);
        let loser = outcome.registered.iter().find(|c| c.id == "health" && c.package_name == "third-party");
        assert!(loser.unwrap().shadowed);
    }

    #[test]
    fn duplicate_workspace_manifest_id_is_a_hard_error() {
        let a = discovery(DiscoverySource::Workspace, "pkg-a", vec![manifest("dup", vec![command("run")])]);
        let b = discovery(DiscoverySource::Workspace, "pkg-b", vec![manifest("dup", vec![command("run")])]);
        let mut registry = CommandRegistry::new();
        let env = PipelineEnv::new(PathBuf::from("/cwd"), PathBuf::from("/bin"));
        let outcome = run_registration_pipeline(vec![a, b], &mut registry, &env);
        assert!(!outcome.errors.is_empty());
        assert_eq!(outcome.registered.len(), 0);
    }

    #[test]
    fn unresolvable_requirement_marks_unavailable_with_hint() {
        let mut m = manifest("needs-thing", vec![command("run")]);
        m.requires.push("missing-dep".into());
        let discoveries = vec![discovery(DiscoverySource::Workspace, "needs-thing", vec![m])];
        let mut registry = CommandRegistry::new();
        let env = PipelineEnv::new(PathBuf::from("/cwd"), PathBuf::from("/bin")).with_resolver(|_, _| false);
        let outcome = run_registration_pipeline(discoveries, &mut registry, &env);
        let entry = &outcome.registered[0];
        assert!(!entry.available);
        assert!(entry.hint.is_some());
    }

    #[test]
    fn monorepo_relaxation_allows_unresolved_requirement() {
        let mut m = manifest("needs-thing", vec![command("run")]);
        m.requires.push("missing-dep".into());
        let discoveries = vec![discovery(DiscoverySource::Workspace, "needs-thing", vec![m])];
        let mut registry = CommandRegistry::new();
        let mut env = PipelineEnv::new(PathBuf::from("/cwd"), PathBuf::from("/bin")).with_resolver(|_, _| false);
        env.monorepo_detected = true;
        let outcome = run_registration_pipeline(discoveries, &mut registry, &env);
        assert!(outcome.registered[0].available);
    }

    #[test]
    fn invalid_command_alias_is_dropped_not_fatal() {
        let mut cmd = command("run");
        cmd.aliases.push("Bad Alias!".into());
        cmd.aliases.push("ok-alias".into());
        let discoveries = vec![discovery(DiscoverySource::Workspace, "pkg", vec![manifest("pkg", vec![cmd])])];
        let mut registry = CommandRegistry::new();
        let env = PipelineEnv::new(PathBuf::from("/cwd"), PathBuf::from("/bin"));
        let outcome = run_registration_pipeline(discoveries, &mut registry, &env);
        let entry = &outcome.registered[0];
        assert!(entry.aliases.contains(&"ok-alias".to_string()));
        assert!(!entry.aliases.iter().any(|a| a.contains('!')));
    }
}
