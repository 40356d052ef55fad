use std::ffi::OsStr;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Command, Output};
use std::time::{SystemTime, UNIX_EPOCH};

use serde_json::Value;

fn unique_temp_dir(prefix: &str) -> PathBuf {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_else(|err| panic!("clock should be >= UNIX_EPOCH: {err}"))
        .as_nanos();
    let dir = std::env::temp_dir().join(format!("{prefix}-{now}"));
    fs::create_dir_all(&dir)
        .unwrap_or_else(|err| panic!("failed to create temp dir {}: {err}", dir.display()));
    dir
}

fn run_plx<I, S>(args: I) -> Output
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    Command::new(env!("CARGO_BIN_EXE_plx"))
        .args(args)
        .output()
        .unwrap_or_else(|err| panic!("failed to execute plx binary: {err}"))
}

fn run_json<I, S>(args: I) -> Value
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    let output = run_plx(args);
    if !output.status.success() {
        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);
        panic!(
            "plx command failed (status={}):\nstdout:\n{}\nstderr:\n{}",
            output.status, stdout, stderr
        );
    }

    let stdout = String::from_utf8_lossy(&output.stdout).trim().to_string();
    serde_json::from_str(&stdout)
        .unwrap_or_else(|err| panic!("stdout is not valid JSON: {err}\nstdout:\n{stdout}"))
}

fn as_i64(value: &Value, key: &str) -> i64 {
    value
        .get(key)
        .and_then(Value::as_i64)
        .unwrap_or_else(|| panic!("missing integer field `{key}` in payload: {value}"))
}

fn as_str<'a>(value: &'a Value, key: &str) -> &'a str {
    value
        .get(key)
        .and_then(Value::as_str)
        .unwrap_or_else(|| panic!("missing string field `{key}` in payload: {value}"))
}

fn path_str(path: &Path) -> &str {
    path.to_str().unwrap_or_else(|| panic!("path should be valid UTF-8: {}", path.display()))
}

const SCENARIOS_JSON: &str = r#"[
  {
    "scenario_id": "balanced",
    "title": "Balanced",
    "summary": "Hold the headline price, add an annual tier",
    "metrics": [
      {"metric": "revenue", "value": 100.0},
      {"metric": "churn", "value": 5.0}
    ]
  },
  {
    "scenario_id": "aggressive",
    "title": "Aggressive",
    "summary": "Raise the headline price 20%",
    "metrics": [
      {"metric": "revenue", "value": 150.0},
      {"metric": "churn", "value": 8.0}
    ]
  }
]"#;

fn create_decision(db: &Path, user: &str, company: &str) -> String {
    let created = run_json([
        "--db",
        path_str(db),
        "decision",
        "create",
        "--user",
        user,
        "--company",
        company,
        "--website",
        "https://acme.example",
        "--context",
        r#"{"pricing_page": "three tiers", "arpu": 49}"#,
    ]);
    as_str(&created, "decision_id").to_string()
}

#[test]
fn db_schema_version_and_migrate_flow() {
    let dir = unique_temp_dir("plx-db");
    let db = dir.join("pricelens.sqlite3");

    let status = run_json(["--db", path_str(&db), "db", "schema-version"]);
    assert_eq!(as_i64(&status, "current_version"), 0);
    assert_eq!(as_i64(&status, "target_version"), 1);
    assert_eq!(as_str(&status, "contract_version"), "cli.v1");

    let planned = run_json(["--db", path_str(&db), "db", "migrate", "--dry-run"]);
    assert_eq!(planned["dry_run"], Value::Bool(true));
    assert_eq!(planned["would_apply_versions"], serde_json::json!([1]));

    let applied = run_json(["--db", path_str(&db), "db", "migrate"]);
    assert_eq!(applied["after_version"], serde_json::json!(1));
    assert_eq!(applied["up_to_date"], serde_json::json!(true));

    let status = run_json(["--db", path_str(&db), "db", "schema-version"]);
    assert_eq!(as_i64(&status, "current_version"), 1);
    assert_eq!(status["up_to_date"], Value::Bool(true));

    let _ = fs::remove_dir_all(&dir);
}

#[test]
fn decision_versioning_and_status_lifecycle() {
    let dir = unique_temp_dir("plx-decision");
    let db = dir.join("pricelens.sqlite3");
    let decision_id = create_decision(&db, "user_a", "Acme Analytics");

    let updated = run_json([
        "--db",
        path_str(&db),
        "decision",
        "update-context",
        "--user",
        "user_a",
        "--id",
        &decision_id,
        "--context",
        r#"{"pricing_page": "three tiers", "arpu": 55}"#,
    ]);
    assert_eq!(as_i64(&updated["context"], "version"), 2);

    let verdicted = run_json([
        "--db",
        path_str(&db),
        "decision",
        "regenerate-verdict",
        "--user",
        "user_a",
        "--id",
        &decision_id,
        "--verdict",
        r#"{"recommendation": "raise starter tier"}"#,
        "--model-meta",
        r#"{"model": "pricing-v2"}"#,
        "--reason",
        "stale market comps",
    ]);
    assert_eq!(as_i64(&verdicted["verdict"], "version"), 1);
    assert_eq!(
        verdicted["verdict_model_meta"]["regeneration_reason"],
        serde_json::json!("stale market comps")
    );

    // Rejection without a reason must fail before anything is written.
    let refused = run_plx([
        "--db",
        path_str(&db),
        "decision",
        "update-status",
        "--user",
        "user_a",
        "--id",
        &decision_id,
        "--status",
        "rejected",
    ]);
    assert!(!refused.status.success());

    let rejected = run_json([
        "--db",
        path_str(&db),
        "decision",
        "update-status",
        "--user",
        "user_a",
        "--id",
        &decision_id,
        "--status",
        "rejected",
        "--reason",
        "bad market fit",
    ]);
    assert_eq!(as_str(&rejected, "status"), "rejected");
    assert_eq!(as_str(&rejected, "rejection_reason"), "bad market fit");
    assert_eq!(
        rejected["status_events"].as_array().map(Vec::len),
        Some(1)
    );

    let listed = run_json([
        "--db",
        path_str(&db),
        "decision",
        "list",
        "--user",
        "user_a",
        "--status",
        "rejected",
    ]);
    assert_eq!(listed["decisions"].as_array().map(Vec::len), Some(1));

    // Soft delete removes the decision from default reads only.
    run_json([
        "--db",
        path_str(&db),
        "decision",
        "soft-delete",
        "--user",
        "user_a",
        "--id",
        &decision_id,
    ]);
    let hidden = run_plx([
        "--db",
        path_str(&db),
        "decision",
        "get",
        "--user",
        "user_a",
        "--id",
        &decision_id,
    ]);
    assert!(!hidden.status.success());
    let audited = run_json([
        "--db",
        path_str(&db),
        "decision",
        "get",
        "--user",
        "user_a",
        "--id",
        &decision_id,
        "--include-deleted",
    ]);
    assert_eq!(audited["is_deleted"], Value::Bool(true));

    let _ = fs::remove_dir_all(&dir);
}

#[test]
fn scenario_generation_choice_and_delta() {
    let dir = unique_temp_dir("plx-scenario");
    let db = dir.join("pricelens.sqlite3");
    let decision_id = create_decision(&db, "user_a", "Acme Analytics");

    let set = run_json([
        "--db",
        path_str(&db),
        "scenario",
        "generate",
        "--user",
        "user_a",
        "--decision",
        &decision_id,
        "--scenarios",
        SCENARIOS_JSON,
    ]);
    assert_eq!(as_i64(&set, "version"), 1);

    // Without --force the existing current set is returned unchanged.
    let unchanged = run_json([
        "--db",
        path_str(&db),
        "scenario",
        "generate",
        "--user",
        "user_a",
        "--decision",
        &decision_id,
        "--scenarios",
        SCENARIOS_JSON,
    ]);
    assert_eq!(as_str(&unchanged, "scenario_set_id"), as_str(&set, "scenario_set_id"));

    let chosen = run_json([
        "--db",
        path_str(&db),
        "decision",
        "choose-scenario",
        "--user",
        "user_a",
        "--id",
        &decision_id,
        "--scenario",
        "aggressive",
    ]);
    assert_eq!(as_str(&chosen, "chosen_scenario_id"), "aggressive");
    assert_eq!(as_str(&chosen, "episode_status"), "path_chosen");

    // The chosen scenario becomes the default baseline.
    let delta = run_json([
        "--db",
        path_str(&db),
        "scenario",
        "delta",
        "--user",
        "user_a",
        "--decision",
        &decision_id,
        "--candidate",
        "balanced",
    ]);
    assert_eq!(as_str(&delta, "baseline_scenario_id"), "aggressive");
    assert_eq!(delta["deltas"].as_array().map(Vec::len), Some(2));

    let regenerated = run_json([
        "--db",
        path_str(&db),
        "scenario",
        "generate",
        "--user",
        "user_a",
        "--decision",
        &decision_id,
        "--scenarios",
        SCENARIOS_JSON,
        "--force",
    ]);
    assert_eq!(as_i64(&regenerated, "version"), 2);

    let _ = fs::remove_dir_all(&dir);
}

#[test]
fn outcome_corrections_resolve_effective_truth() {
    let dir = unique_temp_dir("plx-outcome");
    let db = dir.join("pricelens.sqlite3");
    let decision_id = create_decision(&db, "user_a", "Acme Analytics");

    let first = run_json([
        "--db",
        path_str(&db),
        "outcome",
        "add",
        "--user",
        "user_a",
        "--decision",
        &decision_id,
        "--metric",
        "revenue",
        "--timeframe-days",
        "30",
        "--kpi",
        "mrr=1000:1200",
    ]);
    let first_id = as_str(&first, "outcome_id").to_string();

    let measured = run_json([
        "--db",
        path_str(&db),
        "outcome",
        "update-kpi",
        "--user",
        "user_a",
        "--decision",
        &decision_id,
        "--key",
        "mrr",
        "--actual",
        "1100",
    ]);
    assert_eq!(measured["kpis"][0]["actual"], serde_json::json!(1100.0));
    assert_eq!(measured["kpis"][0]["delta_pct"], serde_json::json!(10.0));

    let correction = run_json([
        "--db",
        path_str(&db),
        "outcome",
        "add",
        "--user",
        "user_a",
        "--decision",
        &decision_id,
        "--metric",
        "revenue",
        "--timeframe-days",
        "30",
        "--status",
        "achieved",
        "--kpi",
        "mrr=1000:1200:1250",
        "--corrects",
        &first_id,
    ]);
    assert_eq!(correction["is_correction"], Value::Bool(true));

    let effective = run_json([
        "--db",
        path_str(&db),
        "outcome",
        "effective",
        "--user",
        "user_a",
        "--decision",
        &decision_id,
    ]);
    assert_eq!(
        as_str(&effective["effective"], "outcome_id"),
        as_str(&correction, "outcome_id")
    );
    assert_eq!(as_str(&effective["effective"], "status"), "achieved");

    let listed = run_json([
        "--db",
        path_str(&db),
        "outcome",
        "list",
        "--user",
        "user_a",
        "--decision",
        &decision_id,
    ]);
    assert_eq!(listed["outcomes"].as_array().map(Vec::len), Some(2));

    let _ = fs::remove_dir_all(&dir);
}

#[test]
fn compare_is_bounded_and_owner_scoped() {
    let dir = unique_temp_dir("plx-compare");
    let db = dir.join("pricelens.sqlite3");
    let first = create_decision(&db, "user_a", "Acme Analytics");
    let second = create_decision(&db, "user_a", "Globex");
    let foreign = create_decision(&db, "user_b", "Initech");

    let single = run_plx([
        "--db",
        path_str(&db),
        "decision",
        "compare",
        "--user",
        "user_a",
        "--id",
        &first,
    ]);
    assert!(!single.status.success());

    let items = run_json([
        "--db",
        path_str(&db),
        "decision",
        "compare",
        "--user",
        "user_a",
        "--id",
        &first,
        "--id",
        &second,
    ]);
    assert_eq!(items["items"].as_array().map(Vec::len), Some(2));
    assert_eq!(as_str(&items["items"][0], "baseline_scenario_id"), "balanced");

    // Another user's decision stays invisible even inside a compare.
    let cross_tenant = run_plx([
        "--db",
        path_str(&db),
        "decision",
        "compare",
        "--user",
        "user_a",
        "--id",
        &first,
        "--id",
        &foreign,
    ]);
    assert!(!cross_tenant.status.success());

    let _ = fs::remove_dir_all(&dir);
}
