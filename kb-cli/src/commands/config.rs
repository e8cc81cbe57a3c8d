//! `kb config show`: prints the effective `kb.toml` configuration as JSON.

use std::sync::Arc;

use kb_core::Config;
use kb_registry::{CommandGroup, SystemCommand};

pub fn group(config: Arc<Config>) -> CommandGroup {
    CommandGroup {
        name: "config".into(),
        describe: Some("Inspect the loaded configuration.".into()),
        commands: vec![show_command(config)],
    }
}

fn show_command(config: Arc<Config>) -> SystemCommand {
    SystemCommand {
        id: "show".into(),
        describe: Some("Print the effective configuration as JSON.".into()),
        aliases: vec![],
        handler: Arc::new(move |_inv| Ok(serde_json::to_value(config.as_ref())?)),
    }
}
