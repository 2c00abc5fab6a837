//! CLI-level integration tests driving the compiled `lobster` binary
//! end-to-end (spec §10).

use assert_cmd::Command;
use predicates::str::contains;

const VALID_CONFIG: &str = r#"
storage:
  workdir: /tmp/lobster-cli-test

workflows:
  - label: w1
    category: process
    merge-size-bytes: 0
    unit-chunk-size: 10
    output-filename: output.root

categories:
  - name: process
    cores: 1
    memory-mb: 2000
    runtime-s: 3600
"#;

const CONFIG_WITH_UNKNOWN_CATEGORY: &str = r#"
storage:
  workdir: /tmp/lobster-cli-test

workflows:
  - label: w1
    category: does-not-exist
    merge-size-bytes: 0
    unit-chunk-size: 10
    output-filename: output.root

categories:
  - name: process
    cores: 1
    memory-mb: 2000
    runtime-s: 3600
"#;

#[test]
fn validate_config_accepts_a_consistent_config() {
    let dir = tempfile::tempdir().unwrap();
    let config_path = dir.path().join("lobster.yml");
    std::fs::write(&config_path, VALID_CONFIG).unwrap();

    Command::cargo_bin("lobster")
        .unwrap()
        .arg("--config")
        .arg(&config_path)
        .arg("validate-config")
        .assert()
        .success()
        .stdout(contains("config OK"));
}

#[test]
fn validate_config_rejects_an_unknown_category_reference() {
    let dir = tempfile::tempdir().unwrap();
    let config_path = dir.path().join("lobster.yml");
    std::fs::write(&config_path, CONFIG_WITH_UNKNOWN_CATEGORY).unwrap();

    Command::cargo_bin("lobster")
        .unwrap()
        .arg("--config")
        .arg(&config_path)
        .arg("validate-config")
        .assert()
        .failure()
        .stderr(contains("unknown category"));
}

#[test]
fn status_reports_no_cache_for_a_fresh_workdir() {
    let dir = tempfile::tempdir().unwrap();
    let config_path = dir.path().join("lobster.yml");
    std::fs::write(&config_path, VALID_CONFIG).unwrap();

    Command::cargo_bin("lobster")
        .unwrap()
        .arg("--config")
        .arg(&config_path)
        .arg("status")
        .assert()
        .success()
        .stdout(contains("no status available"));
}
