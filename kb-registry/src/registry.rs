//! Command Registry & Router (C7, spec.md §4.7): two disjoint indices plus a
//! convenience lookup, and the non-negotiable shadowing invariant.

use std::collections::HashMap;

use kb_core::manifest::normalise_lookup_key;

use crate::types::{CommandGroup, RegisteredCommand, SystemCommand};

/// Result of [`CommandRegistry::get_with_type`]: routing must switch on this, never
/// fall back to executing a plugin command as system (spec.md §4.7).
#[derive(Debug, Clone, Copy)]
pub enum CommandKind {
    System,
    Plugin,
}

/// Borrowed routing result carrying both the entry and its kind.
pub enum Routed<'a> {
    System(&'a SystemCommand),
    Plugin(&'a RegisteredCommand),
}

impl Routed<'_> {
    pub fn kind(&self) -> CommandKind {
        match self {
            Routed::System(_) => CommandKind::System,
            Routed::Plugin(_) => CommandKind::Plugin,
        }
    }
}

/// Anything a raw name lookup can resolve to, including non-executable groups
/// (spec.md §4.7 "Group handling").
pub enum Lookup<'a> {
    Group(&'a CommandGroup),
    System(&'a SystemCommand),
    Plugin(&'a RegisteredCommand),
}

/// The two-index registry plus group index (spec.md §4.7 "State").
#[derive(Default)]
pub struct CommandRegistry {
    system_index: HashMap<String, SystemCommand>,
    group_index: HashMap<String, CommandGroup>,
    plugin_commands: HashMap<String, RegisteredCommand>,
    plugin_key_index: HashMap<String, String>,
}

impl CommandRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an ungrouped system command under its id and every alias.
    pub fn register_system_command(&mut self, cmd: SystemCommand) {
        for key in Self::system_keys(&cmd.id, &cmd.aliases) {
            self.system_index.insert(key, cmd.clone());
        }
    }

    /// Register a trusted group: the bare group name resolves to the group itself;
    /// each member command is additionally reachable as `"<group> <name>"` (and its
    /// alias/colon variants), per spec.md §4.7 "names include... `<group> <name>`
    /// composites".
    pub fn register_group(&mut self, group: CommandGroup) {
        let group_key = normalise_lookup_key(&group.name);
        for cmd in &group.commands {
            let composite_id = format!("{} {}", group.name, cmd.id);
            let mut composite_aliases: Vec<String> =
                cmd.aliases.iter().map(|a| format!("{} {}", group.name, a)).collect();
            composite_aliases.push(format!("{}:{}", group.name, cmd.id));
            for key in Self::system_keys(&composite_id, &composite_aliases) {
                self.system_index.insert(key, cmd.clone());
            }
        }
        self.group_index.insert(group_key, group);
    }

    fn system_keys(id: &str, aliases: &[String]) -> Vec<String> {
        let mut keys = vec![normalise_lookup_key(id)];
        for alias in aliases {
            let key = normalise_lookup_key(alias);
            if !keys.contains(&key) {
                keys.push(key);
            }
        }
        keys
    }

    /// Insert a plugin command produced by the registration pipeline. Applies the
    /// shadowing invariant: any key already present in `systemIndex` flips
    /// `shadowed = true` on the stored entry and the key is never added to the
    /// plugin lookup index (spec.md §4.7, §3 `RegisteredCommand` invariant).
    pub fn insert_plugin_command(&mut self, mut cmd: RegisteredCommand) {
        let keys = cmd.lookup_keys();
        let shadowed_keys: Vec<&String> = keys.iter().filter(|k| self.system_index.contains_key(*k)).collect();
        if !shadowed_keys.is_empty() {
            cmd.shadowed = true;
            tracing::warn!(
                id = %cmd.id,
                keys = ?shadowed_keys,
                "plugin command shadowed by a system command, will not be routable"
            );
        }
        let id = cmd.id.clone();
        if !cmd.shadowed {
            for key in keys {
                self.plugin_key_index.entry(key).or_insert_with(|| id.clone());
            }
        }
        self.plugin_commands.insert(id, cmd);
    }

    /// Routing lookup (spec.md §4.7 `getWithType`). Tolerates `:`/` ` separators.
    /// Never returns a shadowed plugin entry.
    pub fn get_with_type(&self, name: &str) -> Option<Routed<'_>> {
        let key = normalise_lookup_key(name);
        if let Some(sys) = self.system_index.get(&key) {
            return Some(Routed::System(sys));
        }
        if let Some(id) = self.plugin_key_index.get(&key) {
            if let Some(cmd) = self.plugin_commands.get(id) {
                if !cmd.shadowed {
                    return Some(Routed::Plugin(cmd));
                }
            }
        }
        None
    }

    /// Raw lookup including groups, for callers that need to recognise "this name
    /// is a group, don't execute it" before falling back to [`Self::get_with_type`].
    pub fn lookup(&self, name: &str) -> Option<Lookup<'_>> {
        let key = normalise_lookup_key(name);
        if let Some(group) = self.group_index.get(&key) {
            return Some(Lookup::Group(group));
        }
        match self.get_with_type(name)? {
            Routed::System(s) => Some(Lookup::System(s)),
            Routed::Plugin(p) => Some(Lookup::Plugin(p)),
        }
    }

    /// All plugin entries including shadowed/unavailable ones, for `kb plugin list`.
    pub fn all_plugin_commands(&self) -> impl Iterator<Item = &RegisteredCommand> {
        self.plugin_commands.values()
    }

    pub fn plugin_command(&self, id: &str) -> Option<&RegisteredCommand> {
        self.plugin_commands.get(id)
    }

    pub fn group(&self, name: &str) -> Option<&CommandGroup> {
        self.group_index.get(&normalise_lookup_key(name))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{DiscoverySource, SystemInvocation};
    use kb_core::policy::Policy;
    use std::path::PathBuf;
    use std::sync::Arc;

    fn noop_handler() -> Arc<dyn Fn(&SystemInvocation) -> kb_core::Result<serde_json::Value> + Send + Sync> {
        Arc::new(|_| Ok(serde_json::json!(null)))
    }

    fn plugin_cmd(id: &str) -> RegisteredCommand {
        RegisteredCommand {
            id: id.to_string(),
            manifest_id: id.to_string(),
            plugin_version: "1.0.0".into(),
            package_name: "demo-pkg".into(),
            pkg_root: PathBuf::from("/tmp/demo"),
            handler_path: "handler.so".into(),
            source: DiscoverySource::Workspace,
            aliases: vec![],
            permissions: Policy::default(),
            describe: None,
            shadowed: false,
            available: true,
            unavailable_reason: None,
            hint: None,
        }
    }

    #[test]
    fn plugin_cannot_shadow_system_command() {
        let mut reg = CommandRegistry::new();
        reg.register_system_command(SystemCommand {
            id: "health".into(),
            describe: None,
            aliases: vec![],
            handler: noop_handler(),
        });
        reg.insert_plugin_command(plugin_cmd("health"));

        match reg.get_with_type("health") {
            Some(Routed::System(_)) => {}
            _ => panic!("expected system command to win"),
        }
        assert!(reg.plugin_command("health").unwrap().shadowed);
    }

    #[test]
    fn colon_and_space_separators_resolve_the_same_entry() {
        let mut reg = CommandRegistry::new();
        reg.insert_plugin_command(plugin_cmd("agent:trace:stats"));
        assert!(matches!(reg.get_with_type("agent:trace:stats"), Some(Routed::Plugin(_))));
        assert!(matches!(reg.get_with_type("agent trace stats"), Some(Routed::Plugin(_))));
    }

    #[test]
    fn group_name_resolves_to_group_not_a_command() {
        let mut reg = CommandRegistry::new();
        reg.register_group(CommandGroup {
            name: "plugin".into(),
            describe: Some("plugin management".into()),
            commands: vec![SystemCommand {
                id: "list".into(),
                describe: None,
                aliases: vec![],
                handler: noop_handler(),
            }],
        });

        assert!(matches!(reg.lookup("plugin"), Some(Lookup::Group(_))));
        assert!(matches!(reg.get_with_type("plugin list"), Some(Routed::System(_))));
        assert!(matches!(reg.get_with_type("plugin:list"), Some(Routed::System(_))));
    }

    #[test]
    fn shadowed_plugin_is_never_routable() {
        let mut reg = CommandRegistry::new();
        reg.register_system_command(SystemCommand {
            id: "config".into(),
            describe: None,
            aliases: vec![],
            handler: noop_handler(),
        });
        reg.insert_plugin_command(plugin_cmd("config"));
        assert!(reg.get_with_type("config").is_some());
        assert!(matches!(reg.get_with_type("config"), Some(Routed::System(_))));
    }
}
