//! Wires the built-in system commands and the discovered plugin commands into one
//! `CommandRegistry` (spec.md §4.7 "State" + §4.8 "Final output").

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use kb_core::Config;
use kb_registry::{CommandRegistry, PipelineEnv, PipelineOutcome};

use crate::commands::{config, health, plugin};
use crate::discovery;

/// Top-level names for the minimal usage banner `dispatch::run` prints.
pub const TOP_LEVEL_NAMES: &[&str] = &["health", "config", "plugin"];

pub struct Built {
    pub registry: Arc<CommandRegistry>,
    pub pipeline_outcome: PipelineOutcome,
    pub config: Arc<Config>,
}

pub fn build(cwd: &Path, config: Arc<Config>) -> Built {
    let mut registry = CommandRegistry::new();

    let install_dir = config
        .discovery
        .paths
        .first()
        .map(|p| if p.is_absolute() { p.clone() } else { cwd.join(p) })
        .unwrap_or_else(|| cwd.join("plugins"));
    let snapshot: plugin::PluginSnapshot = Arc::new(Mutex::new(Vec::new()));

    registry.register_system_command(health::command());
    registry.register_group(self::config::group(config.clone()));
    registry.register_group(plugin::group(snapshot.clone(), cwd.to_path_buf(), install_dir));

    let discoveries = discovery::discover(&config.discovery, cwd);
    let binary_root = std::env::current_exe().unwrap_or_else(|_| PathBuf::from("."));
    let env = PipelineEnv::new(cwd.to_path_buf(), binary_root);
    let outcome = kb_registry::run_registration_pipeline(discoveries, &mut registry, &env);

    {
        let mut guard = snapshot.lock().expect("plugin snapshot lock");
        *guard = registry.all_plugin_commands().cloned().collect();
    }

    Built { registry: Arc::new(registry), pipeline_outcome: outcome, config }
}
