use std::process::Command;

fn run_cli(args: &[&str]) -> std::process::Output {
    Command::new("cargo")
        .args(["run", "--quiet", "--bin", "request-coalesce", "--"])
        .args(args)
        .output()
        .expect("failed to run CLI")
}

#[test]
fn cli_prints_derived_key() {
    if std::env::var("CLI_SMOKE").is_err() {
        eprintln!("CLI_SMOKE not set; skipping CLI smoke test.");
        return;
    }

    let output = run_cli(&["key", r#"{"b":2,"a":1}"#, "7"]);
    assert!(
        output.status.success(),
        "cli failed: stdout={} stderr={}",
        String::from_utf8_lossy(&output.stdout),
        String::from_utf8_lossy(&output.stderr)
    );
    assert_eq!(
        String::from_utf8_lossy(&output.stdout).trim(),
        r#"[{"a":1,"b":2},7]"#
    );
}

#[test]
fn cli_demo_coalesces_callers() {
    if std::env::var("CLI_SMOKE").is_err() {
        eprintln!("CLI_SMOKE not set; skipping CLI smoke test.");
        return;
    }

    let output = run_cli(&["demo", "--callers", "6", "--keys", "2", "--latency-ms", "5"]);
    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("invocations: 2"), "{stdout}");
    assert!(stdout.contains("joined: 4"), "{stdout}");
}
