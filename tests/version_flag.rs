use assert_cmd::Command;
use predicates::prelude::*;

fn bin() -> Command {
    Command::cargo_bin("confession-board").unwrap()
}

#[test]
fn prints_version() {
    bin()
        .arg("--version")
        .assert()
        .success()
        .stdout(predicate::str::contains(env!("CARGO_PKG_VERSION")));
}

#[test]
fn prints_help() {
    bin()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("Confession Board"))
        .stdout(predicate::str::contains("--version"));
}

#[test]
fn unknown_command_exits_with_usage() {
    bin()
        .arg("dance")
        .assert()
        .code(2)
        .stderr(predicate::str::contains("unknown command"))
        .stderr(predicate::str::contains("Usage:"));
}
