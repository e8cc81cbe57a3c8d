#![forbid(unsafe_code)]

use assert_cmd::prelude::*;
use predicates::prelude::*;
use std::process::Command;

#[test]
fn health_reports_ok_status() {
    let mut cmd = Command::cargo_bin("kb").expect("binary");
    cmd.arg("health");
    cmd.assert().success().stdout(predicate::str::contains("\"status\": \"ok\""));
}

#[test]
fn config_show_prints_effective_configuration() {
    let dir = tempfile::tempdir().expect("tempdir");
    let mut cmd = Command::cargo_bin("kb").expect("binary");
    cmd.current_dir(dir.path()).arg("config").arg("show");
    cmd.assert()
        .success()
        .stdout(predicate::str::contains("\"mode\": \"enforce\""))
        .stdout(predicate::str::contains("\"paths\""));
}

#[test]
fn unknown_command_fails_with_exit_code_one() {
    let mut cmd = Command::cargo_bin("kb").expect("binary");
    cmd.arg("does-not-exist");
    cmd.assert().code(1).stderr(predicate::str::contains("unknown command"));
}

#[test]
fn no_arguments_prints_usage() {
    let mut cmd = Command::cargo_bin("kb").expect("binary");
    cmd.assert().success().stdout(predicate::str::contains("usage: kb"));
}
