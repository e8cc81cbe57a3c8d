//! `kb plugin list`/`kb plugin install`: inspect the registry built at startup and
//! add a new manifest-bearing package directory to the first discovery path
//! (spec.md §4.8 describes the pipeline that consumes what `install` produces, not
//! how a package gets onto disk in the first place).

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use kb_core::error::Error;
use kb_core::manifest;
use kb_registry::{CommandGroup, RegisteredCommand, SystemCommand};

/// Snapshot of the registry's plugin commands, populated once discovery and the
/// registration pipeline have run (see `registry_setup::build`).
pub type PluginSnapshot = Arc<Mutex<Vec<RegisteredCommand>>>;

pub fn group(snapshot: PluginSnapshot, cwd: PathBuf, install_dir: PathBuf) -> CommandGroup {
    CommandGroup {
        name: "plugin".into(),
        describe: Some("Inspect and install plugin packages.".into()),
        commands: vec![list_command(snapshot), install_command(cwd, install_dir)],
    }
}

fn list_command(snapshot: PluginSnapshot) -> SystemCommand {
    SystemCommand {
        id: "list".into(),
        describe: Some("List every registered plugin command.".into()),
        aliases: vec!["ls".into()],
        handler: Arc::new(move |_inv| {
            let commands = snapshot.lock().expect("plugin snapshot lock");
            let rows: Vec<serde_json::Value> = commands
                .iter()
                .map(|c| {
                    serde_json::json!({
                        "id": c.id,
                        "manifestId": c.manifest_id,
                        "package": c.package_name,
                        "source": format!("{:?}", c.source).to_lowercase(),
                        "shadowed": c.shadowed,
                        "available": c.available,
                        "describe": c.describe,
                    })
                })
                .collect();
            Ok(serde_json::json!({ "commands": rows }))
        }),
    }
}

fn install_command(cwd: PathBuf, install_dir: PathBuf) -> SystemCommand {
    SystemCommand {
        id: "install".into(),
        describe: Some("Copy a plugin package directory into the discovery path.".into()),
        aliases: vec![],
        handler: Arc::new(move |inv| {
            let source = inv
                .argv
                .first()
                .ok_or_else(|| Error::Internal("usage: kb plugin install <path>".to_string()))?;
            let source_path = if Path::new(source).is_absolute() { PathBuf::from(source) } else { cwd.join(source) };
            install_plugin(&source_path, &install_dir)
        }),
    }
}

fn install_plugin(source: &Path, install_dir: &Path) -> kb_core::Result<serde_json::Value> {
    let manifest_path = source.join("kb-plugin.toml");
    let data = std::fs::read_to_string(&manifest_path)?;
    let parsed: manifest::Manifest = toml::from_str(&data)?;
    manifest::validate_structure(&parsed).map_err(|e| Error::Config(e.to_string()))?;

    let dir_name = source.file_name().ok_or_else(|| Error::Internal("source path has no directory name".to_string()))?;
    let dest = install_dir.join(dir_name);
    std::fs::create_dir_all(install_dir)?;
    copy_dir_recursive(source, &dest)?;

    Ok(serde_json::json!({ "installed": parsed.id, "path": dest.to_string_lossy() }))
}

fn copy_dir_recursive(src: &Path, dst: &Path) -> std::io::Result<()> {
    std::fs::create_dir_all(dst)?;
    for entry in std::fs::read_dir(src)? {
        let entry = entry?;
        let target = dst.join(entry.file_name());
        if entry.file_type()?.is_dir() {
            copy_dir_recursive(&entry.path(), &target)?;
        } else {
            std::fs::copy(entry.path(), target)?;
        }
    }
    Ok(())
}
