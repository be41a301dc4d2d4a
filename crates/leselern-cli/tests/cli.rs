use assert_cmd::Command;
use predicates::prelude::*;
use serde_json::Value;
use std::path::Path;

fn leselern(db: &Path) -> Command {
    let mut cmd = Command::cargo_bin("leselern").unwrap();
    cmd.env_remove("RUST_LOG").env("LESELERN_DB", db);
    cmd
}

fn json_of(cmd: &mut Command) -> Value {
    let out = cmd.assert().success().get_output().stdout.clone();
    serde_json::from_slice(&out).unwrap()
}

#[test]
fn cold_start_selects_first_configured_strategy() {
    let dir = tempfile::tempdir().unwrap();
    let db = dir.path().join("leselern.db");

    let choice = json_of(leselern(&db).args(["select", "--identity", "r1", "--mood", "curious"]));
    assert_eq!(choice["armId"], "mood_match");
    assert_eq!(choice["confidence"], 0.0);
    assert!(choice["explanation"]
        .as_str()
        .unwrap()
        .contains("mood=curious"));
}

#[test]
fn partial_arm_config_falls_back_to_first_arm() {
    let dir = tempfile::tempdir().unwrap();
    let db = dir.path().join("leselern.db");
    let config = dir.path().join("config.json");
    std::fs::write(
        &config,
        r#"{"bandit":{"arms":{"arms":[{"id":"short_reads","name":"Short reads"},{"id":"classics","name":"Classics"}]}}}"#,
    )
    .unwrap();

    let choice = json_of(leselern(&db).arg("--config").arg(&config).args([
        "select",
        "--identity",
        "r1",
    ]));
    assert_eq!(choice["armId"], "short_reads");
}

#[test]
fn impression_action_stats_flow() {
    let dir = tempfile::tempdir().unwrap();
    let db = dir.path().join("leselern.db");

    let imp = json_of(leselern(&db).args([
        "impression",
        "--identity",
        "r1",
        "--book",
        "B1",
        "--arm",
        "trending",
        "--mood",
        "calm",
    ]));
    assert!(imp["impressionId"].as_str().is_some());

    let report = json_of(leselern(&db).args([
        "action", "--identity", "r1", "--book", "B1", "--type", "save",
    ]));
    assert_eq!(report["outcomes"][0]["armId"], "trending");
    assert_eq!(report["outcomes"][0]["status"], "applied");

    let stats = json_of(leselern(&db).args(["stats", "--identity", "r1"]));
    assert_eq!(stats["totalInteractions"], 1);
    assert_eq!(stats["bestArm"], "trending");

    let reset = json_of(leselern(&db).args(["reset", "--identity", "r1"]));
    assert_eq!(reset["removed"], 1);
}

#[test]
fn negative_update_and_migration() {
    let dir = tempfile::tempdir().unwrap();
    let db = dir.path().join("leselern.db");

    let outcome = json_of(leselern(&db).args([
        "update",
        "--identity",
        "anon-7",
        "--arm",
        "popular",
        "--reward",
        "-1",
    ]));
    assert_eq!(outcome["newAverage"], -1.0);
    assert_eq!(outcome["interactions"], 1);

    let migrated = json_of(leselern(&db).args(["migrate", "--from", "anon-7", "--to", "user-7"]));
    assert_eq!(migrated["models"], 1);

    let stats = json_of(leselern(&db).args(["stats", "--identity", "user-7"]));
    assert_eq!(stats["totalInteractions"], 1);
}

#[test]
fn unknown_action_type_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let db = dir.path().join("leselern.db");
    leselern(&db)
        .args(["action", "--identity", "r", "--book", "B", "--type", "like"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("unknown action type"));
}

#[test]
fn ingest_file_resumes_from_state() {
    let dir = tempfile::tempdir().unwrap();
    let db = dir.path().join("leselern.db");
    let state = dir.path().join("state.json");
    let input = dir.path().join("actions.jsonl");
    std::fs::write(
        &input,
        "{\"identity\":\"r\",\"bookId\":\"B1\",\"type\":\"click\"}\n{\"identity\":\"r\",\"bookId\":\"B2\",\"type\":\"dismiss\"}\n",
    )
    .unwrap();

    let args = [
        "ingest",
        "file",
        "--path",
        input.to_str().unwrap(),
        "--state-file",
        state.to_str().unwrap(),
    ];
    let first = json_of(leselern(&db).args(args));
    assert_eq!(first["events"], 2);
    assert_eq!(first["cursor"], 2);

    let second = json_of(leselern(&db).args(args));
    assert_eq!(second["events"], 0);
    assert!(std::fs::read_to_string(&state).unwrap().contains("\"file\""));
}

#[test]
fn simulate_is_deterministic_for_a_seed() {
    let dir = tempfile::tempdir().unwrap();
    let db = dir.path().join("unused.db");
    let args = ["simulate", "--rounds", "60", "--seed", "7"];
    let a = json_of(leselern(&db).args(args));
    let b = json_of(leselern(&db).args(args));
    assert_eq!(a["selections"], b["selections"]);
    assert_eq!(a["stats"].as_array().unwrap().len(), 3);
    assert!(!db.exists());
}
