//! Contract tests for the `gradequeue` command line.

mod common;

use std::path::Path;
use std::process::{Command, Output};

use serde_json::Value;

fn gradequeue(config: &Path, args: &[&str]) -> Output {
    Command::new(env!("CARGO_BIN_EXE_gradequeue"))
        .arg("--config")
        .arg(config)
        .args(args)
        .env_remove("GRADEQUEUE_DB")
        .env_remove("GRADEQUEUE_JAIL_HELPER")
        .env("RUST_LOG", "warn")
        .output()
        .expect("spawn gradequeue")
}

fn json_out(output: &Output) -> Value {
    assert!(
        output.status.success(),
        "stderr: {}",
        String::from_utf8_lossy(&output.stderr)
    );
    serde_json::from_slice(&output.stdout).expect("stdout is JSON")
}

#[test]
fn help_lists_subcommands() {
    let output = Command::new(env!("CARGO_BIN_EXE_gradequeue"))
        .arg("--help")
        .output()
        .unwrap();
    assert!(output.status.success());
    let text = String::from_utf8_lossy(&output.stdout);
    for cmd in ["serve", "enqueue", "schedule", "cancel", "status", "response", "clean"] {
        assert!(text.contains(cmd), "missing {cmd} in\n{text}");
    }
}

#[test]
fn enqueue_then_status_then_cancel() {
    let dir = tempfile::tempdir().unwrap();
    let config = common::prepare_root(dir.path());

    let out = json_out(&gradequeue(
        &config,
        &[
            "enqueue", "--pset", "lab1", "--runner", "make", "--user", "ada", "--tag", "final",
            "--setting", "SEED=7", "--hash", common::HASH,
        ],
    ));
    assert_eq!(out["ok"], true);
    let job = &out["jobs"][0];
    assert_eq!(job["status"], "scheduled");
    assert_eq!(job["chain"], Value::Null);
    let id = job["queueid"].as_i64().unwrap().to_string();

    let status = json_out(&gradequeue(&config, &["status", &id]));
    assert_eq!(status["status"], "scheduled");
    assert_eq!(status["chain"], Value::Null);

    let counts = json_out(&gradequeue(&config, &["status"]));
    assert_eq!(counts["counts"]["scheduled"], 1);

    let cancel = json_out(&gradequeue(&config, &["cancel", &id]));
    assert_eq!(cancel["changed"], true);
    assert_eq!(cancel["status"], "cancelled");
    let again = json_out(&gradequeue(&config, &["cancel", &id]));
    assert_eq!(again["changed"], false);
}

#[test]
fn several_users_form_a_chain() {
    let dir = tempfile::tempdir().unwrap();
    let config = common::prepare_root(dir.path());
    let out = json_out(&gradequeue(
        &config,
        &[
            "enqueue", "--pset", "lab1", "--runner", "plain", "--user", "ada", "--user", "bob:2",
            "--user", "cy",
        ],
    ));
    let jobs = out["jobs"].as_array().unwrap();
    assert_eq!(jobs.len(), 3);
    let chain = &jobs[0]["chain"];
    assert!(chain.is_i64());
    assert!(jobs.iter().all(|j| &j["chain"] == chain));
    let scheduled = jobs.iter().filter(|j| j["status"] == "scheduled").count();
    assert_eq!(scheduled, 1);
}

#[test]
fn unknown_job_exits_with_3() {
    let dir = tempfile::tempdir().unwrap();
    let config = common::prepare_root(dir.path());
    let output = gradequeue(&config, &["status", "999"]);
    assert_eq!(output.status.code(), Some(3));
    assert!(String::from_utf8_lossy(&output.stderr).contains("999"));
}

#[test]
fn missing_config_exits_with_2() {
    let dir = tempfile::tempdir().unwrap();
    let output = gradequeue(&dir.path().join("absent.yml"), &["status"]);
    assert_eq!(output.status.code(), Some(2));
}

#[test]
fn bad_setting_name_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let config = common::prepare_root(dir.path());
    let output = gradequeue(
        &config,
        &[
            "enqueue", "--pset", "lab1", "--runner", "make", "--user", "ada", "--setting",
            "1BAD=x",
        ],
    );
    assert_eq!(output.status.code(), Some(1));
    let counts = json_out(&gradequeue(&config, &["status"]));
    assert_eq!(counts["counts"], serde_json::json!({}));
}

#[test]
fn tag_with_whitespace_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let config = common::prepare_root(dir.path());
    let output = gradequeue(
        &config,
        &[
            "enqueue", "--pset", "lab1", "--runner", "make", "--user", "ada", "--tag",
            "final exam",
        ],
    );
    assert_eq!(output.status.code(), Some(1));
    assert!(String::from_utf8_lossy(&output.stderr).contains("final exam"));
    let counts = json_out(&gradequeue(&config, &["status"]));
    assert_eq!(counts["counts"], serde_json::json!({}));
}

#[test]
fn response_of_unstarted_job_is_empty() {
    let dir = tempfile::tempdir().unwrap();
    let config = common::prepare_root(dir.path());
    let out = json_out(&gradequeue(
        &config,
        &["enqueue", "--pset", "lab1", "--runner", "make", "--user", "ada", "--no-schedule"],
    ));
    let job = &out["jobs"][0];
    assert_eq!(job["status"], "unscheduled");
    let id = job["queueid"].as_i64().unwrap().to_string();
    let rr = json_out(&gradequeue(&config, &["response", &id]));
    assert_eq!(rr["ok"], true);
    assert_eq!(rr["done"], false);
    assert_eq!(rr["queueid"].as_i64().unwrap().to_string(), id);
}
