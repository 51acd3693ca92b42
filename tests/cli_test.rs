use std::process::{Command, Output};

fn clpipe(args: &[&str]) -> Output {
    Command::new(env!("CARGO_BIN_EXE_clpipe"))
        .args(args)
        .env_remove("RUST_LOG")
        .output()
        .expect("spawn clpipe")
}

fn stdout(output: &Output) -> String {
    String::from_utf8(output.stdout.clone()).expect("utf-8 stdout")
}

fn stderr(output: &Output) -> String {
    String::from_utf8(output.stderr.clone()).expect("utf-8 stderr")
}

#[test]
fn test_run_prints_grid() {
    let output = clpipe(&["run"]);
    assert_eq!(output.status.code(), Some(0), "stderr: {}", stderr(&output));

    let text = stdout(&output);
    let rows: Vec<&str> = text.lines().collect();
    assert_eq!(rows.len(), 8);
    assert_eq!(rows[0], "0x0 0x1 0x2 0x3 0x4 0x5 0x6 0x7 ");
    assert!(rows[7].ends_with("0x707 "));
}

#[test]
fn test_devices_lists_standard_platform() {
    let output = clpipe(&["devices"]);
    assert_eq!(output.status.code(), Some(0), "stderr: {}", stderr(&output));

    let text = stdout(&output);
    assert!(text.starts_with("Got 1 platform ids:\n"));
    assert!(text.contains("Platform 0 has 2 devices"));
    assert!(text.contains("type: GPU"));
}

#[test]
fn test_missing_device_type_exits_with_one() {
    let output = clpipe(&["run", "--device-type", "accelerator"]);
    assert_eq!(output.status.code(), Some(1));

    let message = stderr(&output);
    assert_eq!(message.lines().count(), 1, "stderr: {}", message);
    assert!(message.starts_with("error:"));
    assert!(stdout(&output).is_empty());
}

#[test]
fn test_invalid_config_exits_with_one() {
    let output = clpipe(&["run", "--log-capacity", "1"]);
    assert_eq!(output.status.code(), Some(1));
    assert!(stderr(&output).starts_with("error:"));
}

#[test]
fn test_describe_and_color() {
    let output = clpipe(&["run", "--describe", "--color", "0.25,0.5,1"]);
    assert_eq!(output.status.code(), Some(0), "stderr: {}", stderr(&output));

    let text = stdout(&output);
    let lines: Vec<&str> = text.lines().collect();
    assert_eq!(lines[0], "dims: [8, 8]");
    assert_eq!(lines[1], "device: clpipe emulated GPU");
    assert_eq!(lines[2], "0x0 0x1 0x2 0x3 0x4 0x5 0x6 0x7 ");
    assert_eq!(lines.last(), Some(&"out: 1.75"));
}
