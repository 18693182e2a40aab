//! Integration tests for Foreman
//!
//! These drive the binary end to end against a temporary project directory.

use assert_cmd::Command;
use assert_cmd::cargo::cargo_bin_cmd;
use predicates::prelude::*;
use std::fs;
use std::path::Path;
use tempfile::TempDir;

/// Helper to create a foreman Command
fn foreman() -> Command {
    let mut cmd = cargo_bin_cmd!("foreman");
    cmd.env_remove("FOREMAN_MODE")
        .env_remove("FOREMAN_WORKER_CMD")
        .env_remove("RUST_LOG")
        .env_remove("FOREMAN_LOG");
    cmd
}

fn create_temp_project() -> TempDir {
    TempDir::new().unwrap()
}

fn init_foreman_project(dir: &TempDir) {
    foreman()
        .current_dir(dir.path())
        .arg("init")
        .assert()
        .success();
}

/// Config with support roles off so a loop iteration spawns nothing.
fn write_quiet_config(dir: &Path) {
    fs::write(
        dir.join(".foreman/foreman.toml"),
        r#"
[orchestrator]
max_workers = 2
poll_interval_secs = 1

[worker]
command = "true"

[roles.proposer]
enabled = false

[roles.triage]
enabled = false

[roles.auditor]
enabled = false
"#,
    )
    .unwrap();
}

fn signal_files(dir: &Path) -> Vec<String> {
    let mut files: Vec<String> = fs::read_dir(dir.join(".foreman/signals"))
        .unwrap()
        .filter_map(|e| e.ok())
        .map(|e| e.file_name().to_string_lossy().into_owned())
        .filter(|n| n.ends_with(".json"))
        .collect();
    files.sort();
    files
}

// =============================================================================
// Basic CLI Tests
// =============================================================================

mod cli_basics {
    use super::*;

    #[test]
    fn test_foreman_help() {
        foreman()
            .arg("--help")
            .assert()
            .success()
            .stdout(predicate::str::contains("drive"));
    }

    #[test]
    fn test_foreman_version() {
        foreman().arg("--version").assert().success();
    }

    #[test]
    fn test_init_creates_structure() {
        let dir = create_temp_project();

        foreman()
            .current_dir(dir.path())
            .arg("init")
            .assert()
            .success()
            .stdout(predicate::str::contains("Initialized foreman project"));

        let root = dir.path().join(".foreman");
        assert!(root.join("foreman.toml").exists());
        assert!(root.join("tracker.db").exists());
        assert!(root.join("signals").is_dir());
        assert!(root.join("progress").is_dir());
    }

    #[test]
    fn test_init_idempotent() {
        let dir = create_temp_project();
        init_foreman_project(&dir);

        foreman()
            .current_dir(dir.path())
            .arg("init")
            .assert()
            .success()
            .stdout(predicate::str::contains("already initialized"));
    }

    #[test]
    fn test_unknown_log_format_fails() {
        let dir = create_temp_project();
        foreman()
            .current_dir(dir.path())
            .args(["--log-format", "xml", "config"])
            .assert()
            .failure();
    }
}

// =============================================================================
// Tracker management
// =============================================================================

mod items {
    use super::*;

    #[test]
    fn test_item_add_and_list() {
        let dir = create_temp_project();
        init_foreman_project(&dir);

        foreman()
            .current_dir(dir.path())
            .args(["item", "add", "Fix the flaky login test", "--priority", "1"])
            .assert()
            .success()
            .stdout(predicate::str::contains("fm-1"));

        foreman()
            .current_dir(dir.path())
            .args(["item", "add", "Draft idea", "--state", "proposed"])
            .assert()
            .success();

        foreman()
            .current_dir(dir.path())
            .args(["item", "list", "--state", "ready"])
            .assert()
            .success()
            .stdout(predicate::str::contains("Fix the flaky login test"))
            .stdout(predicate::str::contains("Draft idea").not());
    }

    #[test]
    fn test_item_add_rejects_in_progress() {
        let dir = create_temp_project();
        init_foreman_project(&dir);

        foreman()
            .current_dir(dir.path())
            .args(["item", "add", "x", "--state", "in_progress"])
            .assert()
            .failure();
    }

    #[test]
    fn test_item_commands_require_init() {
        let dir = create_temp_project();
        foreman()
            .current_dir(dir.path())
            .args(["item", "list"])
            .assert()
            .failure()
            .stderr(predicate::str::contains("foreman init"));
    }

    #[test]
    fn test_artifact_add_and_set_shows_on_item() {
        let dir = create_temp_project();
        init_foreman_project(&dir);

        foreman()
            .current_dir(dir.path())
            .args(["item", "add", "Widget"])
            .assert()
            .success();
        foreman()
            .current_dir(dir.path())
            .args(["artifact", "add", "fm-1", "--size", "42"])
            .assert()
            .success()
            .stdout(predicate::str::contains("cr-1"));
        foreman()
            .current_dir(dir.path())
            .args(["artifact", "set", "cr-1", "--state", "approved"])
            .assert()
            .success()
            .stdout(predicate::str::contains("approved"));

        foreman()
            .current_dir(dir.path())
            .args(["item", "show", "fm-1"])
            .assert()
            .success()
            .stdout(predicate::str::contains("Artifact: cr-1 (approved)"));
    }

    #[test]
    fn test_artifact_for_unknown_item_fails() {
        let dir = create_temp_project();
        init_foreman_project(&dir);

        foreman()
            .current_dir(dir.path())
            .args(["artifact", "add", "fm-99"])
            .assert()
            .failure()
            .stderr(predicate::str::contains("not found"));
    }
}

// =============================================================================
// Signals and stop marker
// =============================================================================

mod control {
    use super::*;

    #[test]
    fn test_abort_writes_signal_file() {
        let dir = create_temp_project();
        init_foreman_project(&dir);

        foreman()
            .current_dir(dir.path())
            .args(["abort", "fm-3"])
            .assert()
            .success()
            .stdout(predicate::str::contains("Signal queued"));

        let files = signal_files(dir.path());
        assert_eq!(files.len(), 1);
        let content = fs::read_to_string(dir.path().join(".foreman/signals").join(&files[0])).unwrap();
        let json: serde_json::Value = serde_json::from_str(&content).unwrap();
        assert_eq!(json["action"], "abort");
        assert_eq!(json["target_item"], "fm-3");
    }

    #[test]
    fn test_signals_sort_in_send_order() {
        let dir = create_temp_project();
        init_foreman_project(&dir);

        for item in ["fm-1", "fm-2"] {
            foreman()
                .current_dir(dir.path())
                .args(["approve", item])
                .assert()
                .success();
        }
        let files = signal_files(dir.path());
        assert_eq!(files.len(), 2);
        let first = fs::read_to_string(dir.path().join(".foreman/signals").join(&files[0])).unwrap();
        assert!(first.contains("fm-1"));
    }

    #[test]
    fn test_set_mode_signal() {
        let dir = create_temp_project();
        init_foreman_project(&dir);

        foreman()
            .current_dir(dir.path())
            .args(["signal", "set-mode", "--mode", "aggressive"])
            .assert()
            .success();
        assert_eq!(signal_files(dir.path()).len(), 1);
    }

    #[test]
    fn test_invalid_signals_are_rejected() {
        let dir = create_temp_project();
        init_foreman_project(&dir);

        foreman()
            .current_dir(dir.path())
            .args(["signal", "explode"])
            .assert()
            .failure()
            .stderr(predicate::str::contains("Invalid signal action"));
        foreman()
            .current_dir(dir.path())
            .args(["signal", "set_mode"])
            .assert()
            .failure();
        foreman()
            .current_dir(dir.path())
            .args(["signal", "trigger_role", "--flag", "janitor"])
            .assert()
            .failure();

        assert!(signal_files(dir.path()).is_empty());
    }

    #[test]
    fn test_stop_writes_marker() {
        let dir = create_temp_project();
        init_foreman_project(&dir);

        foreman()
            .current_dir(dir.path())
            .arg("stop")
            .assert()
            .success()
            .stdout(predicate::str::contains("Stop signal sent"));
        assert!(dir.path().join(".foreman/STOP").exists());
    }
}

// =============================================================================
// Control loop
// =============================================================================

mod run_loop {
    use super::*;

    #[test]
    fn test_status_before_any_run() {
        let dir = create_temp_project();
        init_foreman_project(&dir);

        foreman()
            .current_dir(dir.path())
            .arg("status")
            .assert()
            .success()
            .stdout(predicate::str::contains("No orchestrator state"));
    }

    #[test]
    fn test_run_once_persists_state_and_consumes_signals() {
        let dir = create_temp_project();
        init_foreman_project(&dir);
        write_quiet_config(dir.path());

        foreman()
            .current_dir(dir.path())
            .args(["signal", "set_mode", "--mode", "aggressive"])
            .assert()
            .success();

        foreman()
            .current_dir(dir.path())
            .args(["run", "--once"])
            .assert()
            .success()
            .stdout(predicate::str::contains("Iteration limit reached"));

        assert!(dir.path().join(".foreman/state.json").exists());
        assert!(signal_files(dir.path()).is_empty());

        foreman()
            .current_dir(dir.path())
            .arg("status")
            .assert()
            .success()
            .stdout(predicate::str::contains("Mode: aggressive"))
            .stdout(predicate::str::contains("Workers: 0/2 busy"));

        let output = foreman()
            .current_dir(dir.path())
            .args(["status", "--json"])
            .output()
            .unwrap();
        assert!(output.status.success());
        let json: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
        assert_eq!(json["iteration_count"], 1);
        assert_eq!(json["worker_slots"].as_array().unwrap().len(), 2);
    }

    #[test]
    fn test_run_clears_stale_stop_marker() {
        let dir = create_temp_project();
        init_foreman_project(&dir);
        write_quiet_config(dir.path());
        fs::write(dir.path().join(".foreman/STOP"), "old").unwrap();

        foreman()
            .current_dir(dir.path())
            .args(["run", "--max-iterations", "1"])
            .assert()
            .success();
        assert!(!dir.path().join(".foreman/STOP").exists());
    }

    #[test]
    fn test_run_rejects_bad_mode() {
        let dir = create_temp_project();
        init_foreman_project(&dir);

        foreman()
            .current_dir(dir.path())
            .args(["run", "--once", "--mode", "reckless"])
            .assert()
            .failure()
            .stderr(predicate::str::contains("Invalid mode"));
    }
}

// =============================================================================
// Configuration
// =============================================================================

mod configuration {
    use super::*;

    #[test]
    fn test_config_show_defaults() {
        let dir = create_temp_project();
        foreman()
            .current_dir(dir.path())
            .arg("config")
            .assert()
            .success()
            .stdout(predicate::str::contains("No foreman.toml found"))
            .stdout(predicate::str::contains("max_workers = 3"));
    }

    #[test]
    fn test_config_validate_reports_warnings() {
        let dir = create_temp_project();
        fs::create_dir_all(dir.path().join(".foreman")).unwrap();
        fs::write(
            dir.path().join(".foreman/foreman.toml"),
            "[orchestrator]\nmax_workers = 0\n",
        )
        .unwrap();

        foreman()
            .current_dir(dir.path())
            .args(["config", "validate"])
            .assert()
            .success()
            .stdout(predicate::str::contains("max_workers is 0"));
    }

    #[test]
    fn test_config_init_does_not_overwrite() {
        let dir = create_temp_project();
        foreman()
            .current_dir(dir.path())
            .args(["config", "init"])
            .assert()
            .success()
            .stdout(predicate::str::contains("Created foreman.toml"));
        foreman()
            .current_dir(dir.path())
            .args(["config", "init"])
            .assert()
            .success()
            .stdout(predicate::str::contains("already exists"));
    }

    #[test]
    fn test_invalid_toml_fails() {
        let dir = create_temp_project();
        fs::create_dir_all(dir.path().join(".foreman")).unwrap();
        fs::write(dir.path().join(".foreman/foreman.toml"), "[orchestrator\n").unwrap();

        foreman()
            .current_dir(dir.path())
            .args(["config", "validate"])
            .assert()
            .failure();
    }
}
