use assert_cmd::cargo::cargo_bin_cmd;
use predicates::prelude::*;

fn vmforge() -> assert_cmd::Command {
    cargo_bin_cmd!("vmforge").into()
}

#[test]
fn help_works() {
    vmforge()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("Multi-tenant VM provisioning"));
}

#[test]
fn serve_help_mentions_bind_address() {
    vmforge()
        .args(["serve", "--help"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Bind address"));
}

#[test]
fn invalid_port_env_fails_fast() {
    vmforge()
        .env("START_PORT", "not-a-number")
        .arg("serve")
        .assert()
        .failure()
        .stderr(predicate::str::contains("invalid START_PORT"));
}

#[test]
fn unwritable_data_dir_fails_fast() {
    vmforge()
        .env("DATA_DIR", "/dev/null/nested")
        .arg("serve")
        .assert()
        .failure()
        .stderr(predicate::str::contains("creating directory"));
}
