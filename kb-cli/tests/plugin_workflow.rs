#![forbid(unsafe_code)]

use assert_cmd::prelude::*;
use predicates::prelude::*;
use std::fs;
use std::process::Command;

const MANIFEST: &str = r#"
id = "demo-plugin"
version = "1.0.0"
manifestVersion = "1.0"

[[cli.commands]]
id = "demo-plugin:run"
handlerPath = "handler.so"
describe = "Run the demo plugin."
"#;

#[test]
fn install_then_list_round_trips_a_plugin() {
    let workspace = tempfile::tempdir().expect("workspace");
    let incoming = tempfile::tempdir().expect("incoming");
    let pkg_dir = incoming.path().join("demo-plugin");
    fs::create_dir_all(&pkg_dir).expect("mkdir");
    fs::write(pkg_dir.join("kb-plugin.toml"), MANIFEST).expect("write manifest");
    fs::write(pkg_dir.join("handler.so"), b"not a real cdylib, just a placeholder").expect("write handler stub");

    let mut install = Command::cargo_bin("kb").expect("binary");
    install.current_dir(workspace.path()).arg("plugin").arg("install").arg(&pkg_dir);
    install.assert().success().stdout(predicate::str::contains("demo-plugin"));

    assert!(workspace.path().join("plugins").join("demo-plugin").join("kb-plugin.toml").exists());

    let mut list = Command::cargo_bin("kb").expect("binary");
    list.current_dir(workspace.path()).arg("plugin").arg("list");
    list.assert().success().stdout(predicate::str::contains("demo-plugin:run"));
}

#[test]
fn system_command_shadows_a_plugin_with_the_same_id() {
    let workspace = tempfile::tempdir().expect("workspace");
    let plugins_dir = workspace.path().join("plugins").join("health");
    fs::create_dir_all(&plugins_dir).expect("mkdir");
    let manifest = r#"
        id = "health"
        version = "1.0.0"
        manifestVersion = "1.0"

        [[cli.commands]]
        id = "health"
        handlerPath = "handler.so"
    "#;
    fs::write(plugins_dir.join("kb-plugin.toml"), manifest).expect("write manifest");

    let mut cmd = Command::cargo_bin("kb").expect("binary");
    cmd.current_dir(workspace.path()).arg("health");
    // The built-in `health` system command wins; the plugin never runs.
    cmd.assert().success().stdout(predicate::str::contains("\"status\": \"ok\""));
}
