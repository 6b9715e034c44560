//! Integration tests for core CLI contract behavior.

use {
    predicates::prelude::*,
    std::{fs, path::Path},
    tempfile::tempdir,
};

const BLINK_HEX: &str = ":0300300002337A1E\n:00000001FF\n";
const BAD_CHECKSUM_HEX: &str = ":0300300002337A1F\n:00000001FF\n";

fn cli_cmd() -> assert_cmd::Command {
    let mut cmd = assert_cmd::cargo::cargo_bin_cmd!("caterflash");
    for var in [
        "CATERFLASH_PORT",
        "CATERFLASH_BAUD",
        "CATERFLASH_DEVICE",
        "CATERFLASH_NON_INTERACTIVE",
        "RUST_LOG",
    ] {
        cmd.env_remove(var);
    }
    cmd
}

/// Command isolated from the user's global and local config files.
fn cli_cmd_in(dir: &Path) -> assert_cmd::Command {
    let mut cmd = cli_cmd();
    cmd.current_dir(dir)
        .env("HOME", dir)
        .env("XDG_CONFIG_HOME", dir.join("config"));
    cmd
}

fn write_hex(dir: &Path, name: &str, text: &str) -> std::path::PathBuf {
    let path = dir.join(name);
    fs::write(&path, text).expect("write hex file");
    path
}

#[test]
fn help_exits_zero_and_writes_stdout_only() {
    cli_cmd()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("caterflash"))
        .stderr(predicate::str::is_empty());
}

#[test]
fn version_exits_zero_and_writes_stdout_only() {
    cli_cmd()
        .arg("--version")
        .assert()
        .success()
        .stdout(predicate::str::contains("caterflash"))
        .stderr(predicate::str::is_empty());
}

#[test]
fn list_ports_json_returns_envelope() {
    let dir = tempdir().expect("tempdir should be created");
    let output = cli_cmd_in(dir.path())
        .args(["list-ports", "--json"])
        .output()
        .expect("command should execute");

    assert!(output.status.success());
    let parsed: serde_json::Value =
        serde_json::from_slice(&output.stdout).expect("stdout should be JSON");
    assert_eq!(parsed["ok"], true);
    assert!(parsed["data"]["ports"].is_array());
}

#[test]
fn devices_lists_builtin_profiles() {
    cli_cmd()
        .arg("devices")
        .assert()
        .success()
        .stdout(predicate::str::contains("ATmega32U4"))
        .stdout(predicate::str::contains("2341:0036"))
        .stdout(predicate::str::contains("ATmega16U4"));
}

#[test]
fn devices_json() {
    let output = cli_cmd()
        .args(["devices", "--json"])
        .output()
        .expect("command should execute");
    assert!(output.status.success());

    let parsed: serde_json::Value =
        serde_json::from_slice(&output.stdout).expect("stdout should be JSON");
    let devices = parsed["data"]["devices"].as_array().expect("devices array");
    assert_eq!(devices.len(), 2);
    assert_eq!(devices[0]["flash_size"], 28_672);
    assert_eq!(devices[0]["page_size"], 128);
    assert_eq!(devices[0]["baud_rate"], 57_600);
}

#[test]
fn info_summarises_image() {
    let dir = tempdir().expect("tempdir should be created");
    let hex = write_hex(dir.path(), "blink.hex", BLINK_HEX);

    cli_cmd_in(dir.path())
        .arg("info")
        .arg(&hex)
        .assert()
        .success()
        .stdout(predicate::str::contains("51 bytes"))
        .stdout(predicate::str::contains("1 x 128 bytes"))
        .stdout(predicate::str::contains("ATmega32U4"));
}

#[test]
fn info_json_reports_layout() {
    let dir = tempdir().expect("tempdir should be created");
    let hex = write_hex(dir.path(), "blink.hex", BLINK_HEX);

    let output = cli_cmd_in(dir.path())
        .args(["info", "--json"])
        .arg(&hex)
        .output()
        .expect("command should execute");
    assert!(output.status.success());

    let parsed: serde_json::Value =
        serde_json::from_slice(&output.stdout).expect("stdout should be JSON");
    let data = &parsed["data"];
    assert_eq!(data["length"], 51);
    assert_eq!(data["pages"], 1);
    assert_eq!(data["programmed_bytes"], 3);
    assert!(data["start_linear_address"].is_null());
}

#[test]
fn info_page_size_follows_config() {
    let dir = tempdir().expect("tempdir should be created");
    let hex = write_hex(dir.path(), "blink.hex", BLINK_HEX);
    fs::write(dir.path().join("caterflash.toml"), "[flash]\npage_size = 16\n")
        .expect("write local config");

    cli_cmd_in(dir.path())
        .arg("info")
        .arg(&hex)
        .assert()
        .success()
        .stdout(predicate::str::contains("4 x 16 bytes"));
}

#[test]
fn info_bad_checksum_fails_with_line() {
    let dir = tempdir().expect("tempdir should be created");
    let hex = write_hex(dir.path(), "bad.hex", BAD_CHECKSUM_HEX);

    cli_cmd_in(dir.path())
        .arg("info")
        .arg(&hex)
        .assert()
        .failure()
        .code(1)
        .stderr(predicate::str::contains("line 1"))
        .stderr(predicate::str::contains("checksum"));
}

#[test]
fn info_json_error_keeps_stdout_clean() {
    let dir = tempdir().expect("tempdir should be created");
    let nonexistent = dir.path().join("not_exists.hex");

    cli_cmd_in(dir.path())
        .arg("info")
        .arg("--json")
        .arg(nonexistent.as_os_str())
        .assert()
        .failure()
        .code(1)
        .stdout(predicate::str::is_empty())
        .stderr(predicate::str::contains("Error"));
}

#[test]
fn unknown_device_is_usage_error() {
    let dir = tempdir().expect("tempdir should be created");
    let hex = write_hex(dir.path(), "blink.hex", BLINK_HEX);

    cli_cmd_in(dir.path())
        .args(["--device", "attiny85", "info"])
        .arg(&hex)
        .assert()
        .failure()
        .code(2)
        .stderr(predicate::str::contains("attiny85"));
}

#[test]
fn flash_bad_image_fails_before_port_selection() {
    let dir = tempdir().expect("tempdir should be created");
    let hex = write_hex(dir.path(), "bad.hex", BAD_CHECKSUM_HEX);

    cli_cmd_in(dir.path())
        .args(["--non-interactive", "flash"])
        .arg(&hex)
        .assert()
        .failure()
        .code(1)
        .stderr(predicate::str::contains("checksum"));
}

#[test]
fn flash_empty_image_fails() {
    let dir = tempdir().expect("tempdir should be created");
    let hex = write_hex(dir.path(), "empty.hex", ":00000001FF\n");

    cli_cmd_in(dir.path())
        .args(["--non-interactive", "flash"])
        .arg(&hex)
        .assert()
        .failure()
        .code(1)
        .stderr(predicate::str::contains("empty"));
}

#[test]
fn flash_to_missing_port_fails() {
    let dir = tempdir().expect("tempdir should be created");
    let hex = write_hex(dir.path(), "blink.hex", BLINK_HEX);

    let output = cli_cmd_in(dir.path())
        .args(["--non-interactive", "-p", "INVALID_PORT_NAME_XYZ", "flash"])
        .arg(&hex)
        .output()
        .expect("command should execute");

    assert!(!output.status.success(), "missing port should not succeed");
    assert!(output.stdout.is_empty());
}

#[test]
fn flash_without_file_is_usage_error() {
    cli_cmd()
        .arg("flash")
        .assert()
        .failure()
        .code(2)
        .stdout(predicate::str::is_empty())
        .stderr(predicate::str::is_empty().not());
}

#[test]
fn invalid_config_warns_and_continues() {
    let dir = tempdir().expect("tempdir should be created");
    fs::write(dir.path().join("caterflash.toml"), "invalid toml [[[").expect("write config");

    let output = cli_cmd_in(dir.path())
        .arg("devices")
        .output()
        .expect("command should execute");

    assert!(output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("TOML"), "should warn about invalid TOML");
}

#[test]
fn completions_command_writes_to_stdout() {
    cli_cmd()
        .args(["completions", "bash"])
        .assert()
        .success()
        .code(0)
        .stderr(predicate::str::is_empty())
        .stdout(predicate::str::contains("_caterflash()"));
}

#[test]
fn exit_code_two_for_unknown_command() {
    cli_cmd()
        .arg("unknown-command-xyz")
        .assert()
        .failure()
        .code(2);
}

#[test]
fn exit_code_two_for_missing_subcommand() {
    cli_cmd().assert().failure().code(2);
}

#[test]
fn unknown_command_suggests_similar() {
    cli_cmd()
        .arg("falsh")
        .assert()
        .failure()
        .stderr(predicate::str::contains("flash"));
}

#[test]
fn option_terminator_allows_dash_prefixed_operand() {
    let dir = tempdir().expect("tempdir should be created");
    write_hex(dir.path(), "-blink.hex", BLINK_HEX);

    cli_cmd_in(dir.path())
        .args(["info", "--", "-blink.hex"])
        .assert()
        .success()
        .stdout(predicate::str::contains("51 bytes"));
}
