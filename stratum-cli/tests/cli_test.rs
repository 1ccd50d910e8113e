use std::process::Command;

use insta_cmd::get_cargo_bin;

fn run_cli() -> Command {
    Command::new(get_cargo_bin("stratum"))
}

#[test]
fn test_cli_help_lists_workload() {
    let output = run_cli().arg("--help").output().unwrap();
    assert!(output.status.success());
    assert!(String::from_utf8_lossy(&output.stdout).contains("workload"));
}

#[test]
fn test_workload_json_report() {
    let output = run_cli()
        .args(["workload", "--threads", "2", "--accounts", "8", "--transfers", "50"])
        .args(["--seed", "1", "--json"])
        .output()
        .unwrap();
    assert!(output.status.success());
    let report: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(report["final_total"], report["expected_total"]);
    assert_eq!(report["expected_total"], 8000);
}

#[test]
fn test_missing_config_file_fails() {
    let output = run_cli()
        .args(["workload", "--config", "/nonexistent/stratum.json"])
        .output()
        .unwrap();
    assert!(!output.status.success());
}
