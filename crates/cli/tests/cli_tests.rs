// Integration tests for the fcalc binary: stdout contract and exit codes.
//
// Run with: cargo test -p formcalc-cli --test cli_tests -- --nocapture

use std::process::{Command, Output};

fn fcalc() -> Command {
    let mut cmd = Command::new(env!("CARGO_BIN_EXE_fcalc"));
    cmd.current_dir(env!("CARGO_MANIFEST_DIR"));
    // Never pick up the developer's own settings file.
    cmd.env("FORMCALC_SETTINGS", "tests/fixtures/defaults.json");
    cmd.env_remove("RUST_LOG");
    cmd
}

fn run(args: &[&str]) -> Output {
    fcalc().args(args).output().expect("run fcalc")
}

fn stdout(output: &Output) -> String {
    String::from_utf8_lossy(&output.stdout).trim_end().to_string()
}

fn stderr(output: &Output) -> String {
    String::from_utf8_lossy(&output.stderr).to_string()
}

const HEATING: &str = "tests/fixtures/heating.toml";
const CYCLE: &str = "tests/fixtures/cycle.json";

// ===========================================================================
// fcalc eval
// ===========================================================================

#[test]
fn eval_prints_number() {
    let output = run(&["eval", "(10 * 3) / 4"]);
    assert!(output.status.success(), "stderr: {}", stderr(&output));
    assert_eq!(stdout(&output), "7.5");
}

#[test]
fn eval_unbalanced_exits_1() {
    let output = run(&["eval", "(10*3"]);
    assert_eq!(output.status.code(), Some(1));
    assert!(stderr(&output).contains("Unbalanced parentheses"));
    assert!(stdout(&output).is_empty());
}

#[test]
fn eval_rejects_foreign_identifiers() {
    for expr in ["2+__proto__", "2+fetch(1)"] {
        let output = run(&["eval", expr]);
        assert_eq!(output.status.code(), Some(1), "{} should fail", expr);
        assert!(stderr(&output).contains("Unsafe expression"));
    }
}

// ===========================================================================
// fcalc process
// ===========================================================================

#[test]
fn process_field_sum() {
    let output = run(&["process", "[calc:total]", "--defs", HEATING, "-F", "a=3", "-F", "b=4"]);
    assert!(output.status.success(), "stderr: {}", stderr(&output));
    assert_eq!(stdout(&output), "7");
}

#[test]
fn process_lookup_uses_unit_and_locale() {
    let output = run(&["process", "[lookup:heating]", "--defs", HEATING, "-F", "valitse=oil", "-F", "area=100"]);
    assert!(output.status.success(), "stderr: {}", stderr(&output));
    assert_eq!(stdout(&output), "1\u{a0}250 kWh");
}

#[test]
fn process_settings_switch_locale() {
    let output = run(&[
        "process",
        "[lookup:heating]",
        "--defs",
        HEATING,
        "--settings",
        "tests/fixtures/settings.json",
        "-F",
        "valitse=electric",
        "-F",
        "area=1000",
    ]);
    assert!(output.status.success(), "stderr: {}", stderr(&output));
    assert_eq!(stdout(&output), "8,000 kWh");
}

#[test]
fn process_reference_table() {
    let output = run(&["process", "[lookup:tariff] * 100", "--defs", HEATING, "-F", "zone=north"]);
    assert!(output.status.success(), "stderr: {}", stderr(&output));
    assert_eq!(stdout(&output), "15");
}

#[test]
fn process_json_shape_with_inline_error() {
    let output = run(&["process", "Total: [calc:nope]", "--defs", HEATING, "--json"]);
    assert!(output.status.success(), "stderr: {}", stderr(&output));

    let val: serde_json::Value = serde_json::from_str(&stdout(&output)).expect("stdout is JSON");
    assert_eq!(val["success"], true);
    assert_eq!(val["result"], "Total: [Error: Formula 'nope' not found]");
    assert_eq!(val["dependencies"], serde_json::json!(["calc:nope"]));
    assert_eq!(val["processedCount"], 1);
    assert!(val["executionTimeMs"].is_u64());
    assert_eq!(val["maxDepthExceeded"], false);
}

#[test]
fn process_strict_fails() {
    let output = run(&["process", "Total: [calc:nope]", "--defs", HEATING, "--strict"]);
    assert_eq!(output.status.code(), Some(1));
    assert!(stderr(&output).contains("Formula 'nope' not found"));
}

#[test]
fn process_strict_json_still_prints_outcome() {
    let output = run(&["process", "[calc:nope]", "--defs", HEATING, "--strict", "--json"]);
    assert_eq!(output.status.code(), Some(1));
    let val: serde_json::Value = serde_json::from_str(&stdout(&output)).expect("stdout is JSON");
    assert_eq!(val["success"], false);
    assert!(val.get("result").is_none());
}

#[test]
fn process_bad_field_is_usage_error() {
    let output = run(&["process", "[calc:total]", "--defs", HEATING, "-F", "novalue"]);
    assert_eq!(output.status.code(), Some(2));
    assert!(stderr(&output).contains("invalid --field"));
}

#[test]
fn process_missing_defs_file() {
    let output = run(&["process", "[calc:total]", "--defs", "tests/fixtures/absent.toml"]);
    assert_eq!(output.status.code(), Some(5));
}

#[test]
fn process_records_to_stderr() {
    let output = run(&[
        "process",
        "[lookup:heating]",
        "--defs",
        HEATING,
        "-F",
        "valitse=oil",
        "-F",
        "area=2",
        "--records",
    ]);
    assert!(output.status.success(), "stderr: {}", stderr(&output));
    let records: Vec<serde_json::Value> = stderr(&output)
        .lines()
        .filter_map(|l| serde_json::from_str(l).ok())
        .collect();
    assert!(records
        .iter()
        .any(|r| r["kind"] == "lookup" && r["lookup"] == "heating" && r["matched_rule"] == 1));
    assert!(records
        .iter()
        .any(|r| r["kind"] == "calculation" && r["name"] == "oil-form" && r["value"] == 25.0));
}

// ===========================================================================
// fcalc deps / check / list-functions
// ===========================================================================

#[test]
fn deps_follow_lookup_rules() {
    let output = run(&["deps", "[lookup:heating] [field:owner]", "--defs", HEATING]);
    assert!(output.status.success(), "stderr: {}", stderr(&output));
    assert_eq!(stdout(&output), "area\nowner\nvalitse");
}

#[test]
fn deps_json() {
    let output = run(&["deps", "[lookup:tariff]", "--defs", HEATING, "--json"]);
    assert!(output.status.success(), "stderr: {}", stderr(&output));
    let val: serde_json::Value = serde_json::from_str(&stdout(&output)).expect("stdout is JSON");
    assert_eq!(val, serde_json::json!(["zone"]));
}

#[test]
fn check_reports_cycles() {
    let output = run(&["check", "--defs", CYCLE]);
    assert_eq!(output.status.code(), Some(3));
    let out = stdout(&output);
    assert!(out.contains("cycle: a → b"), "stdout: {}", out);
    assert!(out.contains("missing: calc:ghost (referenced by c)"), "stdout: {}", out);
    assert!(out.contains("loop: b → a → b (closed by b)"), "stdout: {}", out);
}

#[test]
fn check_json_names_closing_definition() {
    let output = run(&["check", "--defs", CYCLE, "--json"]);
    assert_eq!(output.status.code(), Some(3));
    let val: serde_json::Value = serde_json::from_str(&stdout(&output)).expect("stdout is JSON");
    assert_eq!(val["cycles"], serde_json::json!([["a", "b"]]));
    assert_eq!(
        val["closedBy"],
        serde_json::json!([{ "definition": "b", "path": ["b", "a", "b"] }])
    );
    assert_eq!(
        val["missing"],
        serde_json::json!([{ "token": "calc:ghost", "referencedBy": "c" }])
    );
}

#[test]
fn check_clean_definitions() {
    let output = run(&["check", "--defs", HEATING, "--json"]);
    assert!(output.status.success(), "stderr: {}", stderr(&output));
    let val: serde_json::Value = serde_json::from_str(&stdout(&output)).expect("stdout is JSON");
    assert_eq!(val["formulas"], 4);
    assert_eq!(val["lookups"], 2);
    assert_eq!(val["cycles"], serde_json::json!([]));
    assert_eq!(val["closedBy"], serde_json::json!([]));
}

#[test]
fn list_functions_includes_round() {
    let output = run(&["list-functions"]);
    assert!(output.status.success());
    let out = stdout(&output);
    assert!(out.lines().any(|l| l == "round(x[, digits])"));
    assert_eq!(out.lines().count(), 8);
}
