#![allow(deprecated)]
use assert_cmd::Command;
use predicates::prelude::*;
use tempfile::TempDir;

fn govengine(dir: &TempDir) -> Command {
    let mut cmd = Command::cargo_bin("govengine").unwrap();
    cmd.current_dir(dir.path())
        .env("GOVENGINE_ROOT", dir.path())
        .env("GOVENGINE_USER", "alice")
        .env_remove("RUST_LOG");
    cmd
}

fn init_project(dir: &TempDir) {
    govengine(dir).arg("init").assert().success();
}

/// Initiate an action and return its guid.
fn initiate(dir: &TempDir, args: &[&str]) -> String {
    let out = govengine(dir)
        .arg("initiate")
        .args(args)
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();
    String::from_utf8(out).unwrap().trim().to_string()
}

fn show_json(dir: &TempDir, guid: &str) -> serde_json::Value {
    let out = govengine(dir)
        .args(["show", guid, "--json"])
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();
    serde_json::from_slice(&out).unwrap()
}

// ---------------------------------------------------------------------------
// govengine init
// ---------------------------------------------------------------------------

#[test]
fn init_creates_project_files() {
    let dir = TempDir::new().unwrap();
    govengine(&dir)
        .arg("init")
        .assert()
        .success()
        .stdout(predicate::str::contains("created: .govengine/config.yaml"));

    assert!(dir.path().join(".govengine").is_dir());
    assert!(dir.path().join(".govengine/scripts").is_dir());
    assert!(dir.path().join(".govengine/config.yaml").exists());
    assert!(dir.path().join(".govengine/process.yaml").exists());
    assert!(dir.path().join(".govengine/repository.redb").exists());
}

#[test]
fn init_is_idempotent() {
    let dir = TempDir::new().unwrap();
    init_project(&dir);
    govengine(&dir)
        .arg("init")
        .assert()
        .success()
        .stdout(predicate::str::contains("exists:  .govengine/config.yaml"));
}

#[test]
fn commands_before_init_explain_themselves() {
    let dir = TempDir::new().unwrap();
    govengine(&dir)
        .arg("list")
        .assert()
        .failure()
        .stderr(predicate::str::contains("govengine init"));
}

// ---------------------------------------------------------------------------
// Engine actions
// ---------------------------------------------------------------------------

#[test]
fn initiate_then_status_and_show() {
    let dir = TempDir::new().unwrap();
    init_project(&dir);
    let guid = initiate(
        &dir,
        &[
            "nightly-owner-check",
            "--request-type",
            "verify-owner",
            "--target",
            "asset-1",
            "--param",
            "threshold=3",
        ],
    );
    assert!(!guid.is_empty());

    govengine(&dir)
        .args(["status", &guid])
        .assert()
        .success()
        .stdout("requested\n");

    govengine(&dir)
        .args(["show", &guid])
        .assert()
        .success()
        .stdout(predicate::str::contains("nightly-owner-check"))
        .stdout(predicate::str::contains("Requested by:"))
        .stdout(predicate::str::contains("alice"))
        .stdout(predicate::str::contains("threshold = 3"))
        .stdout(predicate::str::contains("asset-1 [requested]"));

    let action = show_json(&dir, &guid);
    assert_eq!(action["request_type"], "verify-owner");
    assert_eq!(action["request_parameters"]["threshold"], "3");
}

#[test]
fn duplicate_qualified_name_is_rejected() {
    let dir = TempDir::new().unwrap();
    init_project(&dir);
    initiate(&dir, &["q1", "--request-type", "verify-owner"]);

    govengine(&dir)
        .args(["initiate", "q1", "--request-type", "verify-owner"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("failed to initiate 'q1'"));
}

#[test]
fn initiate_json_returns_guid() {
    let dir = TempDir::new().unwrap();
    init_project(&dir);
    let out = govengine(&dir)
        .args(["initiate", "q1", "--request-type", "verify-owner", "--json"])
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();
    let v: serde_json::Value = serde_json::from_slice(&out).unwrap();
    assert!(v["guid"].as_str().is_some_and(|g| !g.is_empty()));
}

#[test]
fn bad_param_syntax_is_a_usage_error() {
    let dir = TempDir::new().unwrap();
    init_project(&dir);
    govengine(&dir)
        .args(["initiate", "q1", "--request-type", "x", "--param", "novalue"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("expected KEY=VALUE"));
}

#[test]
fn list_filters_by_status() {
    let dir = TempDir::new().unwrap();
    init_project(&dir);
    govengine(&dir)
        .arg("list")
        .assert()
        .success()
        .stdout(predicate::str::contains("No engine actions."));

    let first = initiate(&dir, &["q1", "--request-type", "verify-owner"]);
    let second = initiate(&dir, &["q2", "--request-type", "verify-owner"]);
    govengine(&dir).args(["cancel", &second]).assert().success();

    govengine(&dir)
        .arg("list")
        .assert()
        .success()
        .stdout(predicate::str::contains("REQUEST TYPE"))
        .stdout(predicate::str::contains(first.as_str()))
        .stdout(predicate::str::contains(second.as_str()));

    let out = govengine(&dir)
        .args(["list", "--status", "cancelled", "--json"])
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();
    let actions: Vec<serde_json::Value> = serde_json::from_slice(&out).unwrap();
    assert_eq!(actions.len(), 1);
    assert_eq!(actions[0]["guid"], second.as_str());
}

#[test]
fn list_rejects_unknown_status() {
    let dir = TempDir::new().unwrap();
    init_project(&dir);
    govengine(&dir)
        .args(["list", "--status", "sleeping"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("unknown engine action status"));
}

#[test]
fn cancel_records_the_user() {
    let dir = TempDir::new().unwrap();
    init_project(&dir);
    let guid = initiate(&dir, &["q1", "--request-type", "verify-owner"]);

    govengine(&dir)
        .args(["cancel", &guid])
        .assert()
        .success()
        .stdout(format!("Cancelled {guid}\n"));

    let action = show_json(&dir, &guid);
    assert_eq!(action["status"], "cancelled");
    assert_eq!(action["completion_message"], "cancelled by alice");
}

#[test]
fn approve_only_applies_to_requested_actions() {
    let dir = TempDir::new().unwrap();
    init_project(&dir);
    let guid = initiate(&dir, &["q1", "--request-type", "verify-owner"]);

    govengine(&dir)
        .args(["approve", &guid])
        .assert()
        .success()
        .stdout(format!("Approved {guid}\n"));
    govengine(&dir)
        .args(["status", &guid])
        .assert()
        .success()
        .stdout("approved\n");

    govengine(&dir).args(["approve", &guid]).assert().failure();
}

#[test]
fn unknown_guid_fails() {
    let dir = TempDir::new().unwrap();
    init_project(&dir);
    govengine(&dir)
        .args(["status", "no-such-action"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("unknown engine action no-such-action"));
}

#[test]
fn unauthorized_user_cannot_initiate() {
    let dir = TempDir::new().unwrap();
    init_project(&dir);
    std::fs::write(
        dir.path().join(".govengine/config.yaml"),
        "version: 1\nengine:\n  authorized_users: [bob]\n",
    )
    .unwrap();

    govengine(&dir)
        .args(["initiate", "q1", "--request-type", "verify-owner"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("alice"));

    govengine(&dir)
        .args(["--user", "bob", "initiate", "q1", "--request-type", "verify-owner"])
        .assert()
        .success();
}

// ---------------------------------------------------------------------------
// govengine run
// ---------------------------------------------------------------------------

#[test]
fn run_once_fails_actions_without_a_service() {
    let dir = TempDir::new().unwrap();
    init_project(&dir);
    let guid = initiate(&dir, &["q1", "--request-type", "verify-owner"]);

    govengine(&dir)
        .args(["run", "--once"])
        .assert()
        .success()
        .stdout(predicate::str::contains("failed: 1"));

    let action = show_json(&dir, &guid);
    assert_eq!(action["status"], "failed");
    assert!(action["completion_message"]
        .as_str()
        .unwrap()
        .contains("no governance service registered for request type 'verify-owner'"));
}

#[test]
fn run_once_leaves_future_actions_waiting() {
    let dir = TempDir::new().unwrap();
    init_project(&dir);
    let guid = initiate(
        &dir,
        &["q1", "--request-type", "verify-owner", "--start-in-secs", "3600"],
    );

    let out = govengine(&dir)
        .args(["run", "--once", "--json"])
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();
    let report: serde_json::Value = serde_json::from_slice(&out).unwrap();
    assert_eq!(report["deferred"], 1);
    assert_eq!(report["started"], 0);

    govengine(&dir)
        .args(["status", &guid])
        .assert()
        .success()
        .stdout("waiting\n");
}

#[cfg(unix)]
const SCRIPT_CONFIG: &str = r#"version: 1
engine:
  guid: engine-1
services:
  - name: check-owner
    role: verification
    command: sh
    args: [.govengine/scripts/check-owner.sh]
    produced_guards:
      - name: OWNER_FOUND
        description: the asset has an owner
    registrations:
      - request_type: verify-owner
"#;

#[cfg(unix)]
const FOLLOW_UP_PROCESS: &str = r#"name: owner-review
steps:
  - trigger_request_type: verify-owner
    trigger_guard: OWNER_FOUND
    next:
      - request_type: notify-owner
        wait_time_secs: 3600
"#;

#[cfg(unix)]
#[test]
fn run_once_executes_script_services_and_follows_the_process() {
    let dir = TempDir::new().unwrap();
    init_project(&dir);
    std::fs::write(dir.path().join(".govengine/config.yaml"), SCRIPT_CONFIG).unwrap();
    std::fs::write(dir.path().join(".govengine/process.yaml"), FOLLOW_UP_PROCESS).unwrap();
    std::fs::write(
        dir.path().join(".govengine/scripts/check-owner.sh"),
        "cat > /dev/null\necho '{\"status\":\"actioned\",\"guards\":[\"OWNER_FOUND\"],\"message\":\"owner is bob\"}'\n",
    )
    .unwrap();

    govengine(&dir)
        .args(["process", "validate"])
        .assert()
        .success()
        .stdout(predicate::str::contains("error").not());

    let guid = initiate(&dir, &["q1", "--request-type", "verify-owner", "--target", "asset-1"]);
    govengine(&dir)
        .args(["run", "--once"])
        .assert()
        .success()
        .stdout(predicate::str::contains("started: 1"));

    let action = show_json(&dir, &guid);
    assert_eq!(action["status"], "actioned");
    assert_eq!(action["completion_message"], "owner is bob");
    assert_eq!(action["completion_guards"][0], "OWNER_FOUND");

    let out = govengine(&dir)
        .args(["list", "--status", "waiting", "--json"])
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();
    let waiting: Vec<serde_json::Value> = serde_json::from_slice(&out).unwrap();
    assert_eq!(waiting.len(), 1);
    assert_eq!(waiting[0]["request_type"], "notify-owner");
    assert_eq!(waiting[0]["triggered_by"]["action_guid"], guid.as_str());
    assert_eq!(waiting[0]["action_targets"][0]["guid"], "asset-1");
}

// ---------------------------------------------------------------------------
// govengine process
// ---------------------------------------------------------------------------

#[test]
fn process_show_on_fresh_project() {
    let dir = TempDir::new().unwrap();
    init_project(&dir);
    govengine(&dir)
        .args(["process", "show"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Process: default"))
        .stdout(predicate::str::contains("(no steps)"));
}

#[test]
fn process_validate_clean_project() {
    let dir = TempDir::new().unwrap();
    init_project(&dir);
    govengine(&dir)
        .args(["process", "validate"])
        .assert()
        .success()
        .stdout(predicate::str::contains("No warnings."));
}

#[test]
fn process_validate_rejects_watchdog_scripts() {
    let dir = TempDir::new().unwrap();
    init_project(&dir);
    std::fs::write(
        dir.path().join(".govengine/config.yaml"),
        "version: 1\nservices:\n  - name: watcher\n    role: watchdog\n    command: sh\n    registrations:\n      - request_type: watch-assets\n",
    )
    .unwrap();

    govengine(&dir)
        .args(["process", "validate"])
        .assert()
        .failure()
        .stdout(predicate::str::contains("cannot take the watchdog role"))
        .stderr(predicate::str::contains("validation found errors"));
}

// ---------------------------------------------------------------------------
// govengine element
// ---------------------------------------------------------------------------

#[test]
fn element_create_show_list() {
    let dir = TempDir::new().unwrap();
    init_project(&dir);

    let out = govengine(&dir)
        .args([
            "element",
            "create",
            "Asset",
            "--prop",
            "qualifiedName=db.customers",
        ])
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();
    let guid = String::from_utf8(out).unwrap().trim().to_string();

    govengine(&dir)
        .args(["element", "show", &guid])
        .assert()
        .success()
        .stdout(predicate::str::contains("Type:"))
        .stdout(predicate::str::contains("Asset"))
        .stdout(predicate::str::contains("db.customers"));

    govengine(&dir)
        .args(["element", "list", "Asset"])
        .assert()
        .success()
        .stdout(predicate::str::contains("db.customers"));

    govengine(&dir)
        .args(["element", "list", "Glossary"])
        .assert()
        .success()
        .stdout(predicate::str::contains("No Glossary elements."));
}
