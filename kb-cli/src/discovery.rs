//! Walks the configured discovery paths for `kb-plugin.toml` manifests and turns
//! each package directory into a `DiscoveryResult` the registration pipeline consumes.

use std::path::Path;

use kb_core::config::DiscoveryConfig;
use kb_core::manifest::Manifest;
use kb_registry::{DiscoveryResult, DiscoverySource};

const MANIFEST_FILE: &str = "kb-plugin.toml";

pub fn discover(cfg: &DiscoveryConfig, cwd: &Path) -> Vec<DiscoveryResult> {
    let mut results = Vec::new();
    for configured in &cfg.paths {
        let root = if configured.is_absolute() { configured.clone() } else { cwd.join(configured) };
        let entries = match std::fs::read_dir(&root) {
            Ok(entries) => entries,
            Err(_) => continue,
        };
        for entry in entries.flatten() {
            let pkg_root = entry.path();
            if !pkg_root.is_dir() {
                continue;
            }
            let manifest_path = pkg_root.join(MANIFEST_FILE);
            let data = match std::fs::read_to_string(&manifest_path) {
                Ok(data) => data,
                Err(_) => continue,
            };
            let manifest: Manifest = match toml::from_str(&data) {
                Ok(m) => m,
                Err(err) => {
                    tracing::warn!(path = %manifest_path.display(), error = %err, "skipping unparsable manifest");
                    continue;
                }
            };
            if !cfg.trusted_ids.is_empty() && !cfg.trusted_ids.contains(&manifest.id) {
                tracing::warn!(id = %manifest.id, "skipping untrusted manifest");
                continue;
            }
            let package_name = entry.file_name().to_string_lossy().into_owned();
            results.push(DiscoveryResult {
                source: DiscoverySource::Workspace,
                package_name,
                manifest_path,
                pkg_root,
                manifests: vec![manifest],
            });
        }
    }
    results
}
