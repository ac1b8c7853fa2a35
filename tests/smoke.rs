//! Smoke tests -- verify the binary runs and the CLI surface is wired.

use std::io::Write;

use assert_cmd::Command;
use predicates::str::contains;

fn abusescan() -> Command {
    let mut cmd = Command::cargo_bin("abusescan").unwrap();
    cmd.env_remove("ABUSESCAN_CONFIG").env_remove("RUST_LOG");
    cmd
}

fn config_file(body: &str) -> tempfile::NamedTempFile {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    file.write_all(body.as_bytes()).unwrap();
    file
}

#[test]
fn test_cli_help() {
    abusescan()
        .arg("--help")
        .assert()
        .success()
        .stdout(contains("Abuse-detection scanner"));
}

#[test]
fn test_cli_version() {
    abusescan()
        .arg("--version")
        .assert()
        .success()
        .stdout(contains("abusescan"));
}

#[test]
fn test_serve_subcommand_exists() {
    abusescan().args(["serve", "--help"]).assert().success();
}

#[test]
fn test_scan_subcommand_takes_container() {
    abusescan()
        .args(["scan", "--help"])
        .assert()
        .success()
        .stdout(contains("<CONTAINER>"))
        .stdout(contains("--json"));
}

#[test]
fn test_scan_requires_container_argument() {
    abusescan().arg("scan").assert().failure();
}

#[test]
fn test_missing_explicit_config_fails() {
    abusescan()
        .args(["--config", "/nonexistent/abusescan.toml", "containers"])
        .assert()
        .failure()
        .stderr(contains("failed to read config file"));
}

#[test]
fn test_invalid_config_rejected() {
    let file = config_file("[scanner]\nbatch_size = 0\n");
    abusescan()
        .arg("--config")
        .arg(file.path())
        .arg("containers")
        .assert()
        .failure()
        .stderr(contains("batch_size"));
}

#[test]
fn test_sync_hashes_without_authority_fails() {
    let file = config_file("[logging]\nlevel = \"error\"\n");
    abusescan()
        .arg("--config")
        .arg(file.path())
        .arg("sync-hashes")
        .assert()
        .failure()
        .stderr(contains("no hash authority configured"));
}

#[test]
fn test_containers_with_missing_runtime_binary_fails() {
    let file = config_file(
        "[scanner]\ndocker_bin = \"/nonexistent/docker-binary\"\n\n[logging]\nlevel = \"error\"\n",
    );
    abusescan()
        .arg("--config")
        .arg(file.path())
        .arg("containers")
        .assert()
        .failure();
}
