use std::path::Path;

use assert_cmd::Command;
use predicates::prelude::*;

fn tlib(dir: &Path) -> Command {
    let mut cmd = Command::cargo_bin("tlib").unwrap();
    cmd.current_dir(dir);
    cmd
}

fn write_config(dir: &Path, body: &str) {
    std::fs::write(dir.join("tlib.toml"), body).unwrap();
}

#[test]
fn init_writes_a_valid_config() {
    let dir = tempfile::tempdir().unwrap();

    tlib(dir.path())
        .arg("init")
        .assert()
        .success()
        .stdout(predicate::str::contains("Created tlib.toml"));
    assert!(dir.path().join("tlib.toml").exists());

    tlib(dir.path())
        .arg("validate")
        .assert()
        .success()
        .stdout(predicate::str::contains("Configuration is valid!"));

    tlib(dir.path()).arg("init").assert().failure();
}

#[test]
fn validate_rejects_zero_loop() {
    let dir = tempfile::tempdir().unwrap();
    write_config(dir.path(), "[run]\nloop = 0\n");

    tlib(dir.path())
        .arg("validate")
        .assert()
        .failure()
        .stderr(predicate::str::contains("run.loop"));
}

#[test]
fn list_shows_case_flags() {
    let dir = tempfile::tempdir().unwrap();
    write_config(
        dir.path(),
        r#"
[[cases]]
id = "alpha"
command = "true"
serial = true

[[cases]]
id = "beta"
command = "true"
skip = "broken upstream"
"#,
    );

    tlib(dir.path())
        .arg("list")
        .assert()
        .success()
        .stdout(predicate::str::contains("alpha [serial]"))
        .stdout(predicate::str::contains("beta [skip: broken upstream]"));
}

#[cfg(unix)]
#[test]
fn run_writes_reports_and_passes() {
    let dir = tempfile::tempdir().unwrap();
    write_config(
        dir.path(),
        r#"
[run]
title = "cli smoke"
iterations = 2
loop = 2

[report]
output_dir = "out"
json = true

[[cases]]
id = "echo"
command = "echo iteration $TLIB_ITERATION"
"#,
    );

    tlib(dir.path())
        .args(["run", "--junit", "--plain"])
        .assert()
        .code(0);

    let html = std::fs::read_to_string(dir.path().join("out/report.html")).unwrap();
    assert!(html.contains("cli smoke"));
    assert!(dir.path().join("out/junit.xml").exists());

    let json: serde_json::Value = serde_json::from_str(
        &std::fs::read_to_string(dir.path().join("out/report.json")).unwrap(),
    )
    .unwrap();
    assert_eq!(json["counts"]["passed"], 4);
}

#[cfg(unix)]
#[test]
fn run_exits_nonzero_on_failure() {
    let dir = tempfile::tempdir().unwrap();
    write_config(
        dir.path(),
        r#"
[report]
html = false

[[cases]]
id = "ok"
command = "true"

[[cases]]
id = "broken"
command = "echo nope >&2; exit 4"
"#,
    );

    tlib(dir.path())
        .args(["run", "--workers", "2"])
        .assert()
        .code(1)
        .stdout(predicate::str::contains("broken"));
}

#[cfg(unix)]
#[test]
fn run_case_filter() {
    let dir = tempfile::tempdir().unwrap();
    write_config(
        dir.path(),
        r#"
[report]
output_dir = "out"
html = false
json = true

[[cases]]
id = "keep"
command = "true"

[[cases]]
id = "drop"
command = "false"
"#,
    );

    tlib(dir.path())
        .args(["run", "--plain", "--case", "keep"])
        .assert()
        .code(0);

    tlib(dir.path())
        .args(["run", "--case", "missing"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("Unknown case: missing"));
}

#[cfg(unix)]
fn interrupt(pid: u32) {
    let status = std::process::Command::new("kill")
        .args(["-INT", &pid.to_string()])
        .status()
        .unwrap();
    assert!(status.success());
}

#[cfg(unix)]
#[test]
fn second_interrupt_exits_immediately() {
    use std::process::Stdio;
    use std::time::{Duration, Instant};

    let dir = tempfile::tempdir().unwrap();
    write_config(
        dir.path(),
        r#"
[report]
html = false

[[cases]]
id = "hang"
command = "touch started; sleep 15"
"#,
    );

    let mut child = std::process::Command::new(env!("CARGO_BIN_EXE_tlib"))
        .args(["run", "--plain"])
        .current_dir(dir.path())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()
        .unwrap();

    let marker = dir.path().join("started");
    let deadline = Instant::now() + Duration::from_secs(10);
    while !marker.exists() {
        assert!(Instant::now() < deadline, "case never started");
        std::thread::sleep(Duration::from_millis(20));
    }
    std::thread::sleep(Duration::from_millis(200));

    interrupt(child.id());
    std::thread::sleep(Duration::from_millis(200));
    assert!(child.try_wait().unwrap().is_none(), "first interrupt must not exit");
    interrupt(child.id());

    let deadline = Instant::now() + Duration::from_secs(5);
    let status = loop {
        if let Some(status) = child.try_wait().unwrap() {
            break status;
        }
        if Instant::now() >= deadline {
            child.kill().unwrap();
            panic!("second interrupt did not stop the run");
        }
        std::thread::sleep(Duration::from_millis(20));
    };
    assert_eq!(status.code(), Some(130));
}
