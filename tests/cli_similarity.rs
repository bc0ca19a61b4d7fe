use std::fs;
use std::process::Command;

use tempfile::tempdir;

fn expression_tsv(samples: usize) -> String {
    let mut text = String::from("gene");
    for s in 0..samples {
        text.push_str(&format!("\ts{s}"));
    }
    text.push('\n');
    let rows: [(&str, fn(usize) -> String); 3] = [
        ("alpha", |i| i.to_string()),
        ("beta", |i| format!("{}", 3 * i + 2)),
        ("gamma", |i| if i % 5 == 0 { "NA".to_string() } else { format!("{}", 40 - i) }),
    ];
    for (name, value) in rows {
        text.push_str(name);
        for i in 0..samples {
            text.push('\t');
            text.push_str(&value(i));
        }
        text.push('\n');
    }
    text
}

#[test]
fn similarity_then_dump_lists_stored_pairs() {
    let tmp = tempdir().expect("temporary directory");
    let input = tmp.path().join("expression.tsv");
    let cmx = tmp.path().join("out.cmx");
    let ccm = tmp.path().join("out.ccm");
    fs::write(&input, expression_tsv(40)).expect("write expression matrix");

    let exe = env!("CARGO_BIN_EXE_kinc");
    let status = Command::new(exe)
        .args([
            "similarity",
            input.to_str().expect("path str"),
            "--cmx",
            cmx.to_str().expect("path str"),
            "--ccm",
            ccm.to_str().expect("path str"),
            "--workers",
            "2",
            "--backend",
            "host",
            "--work-block-size",
            "1",
        ])
        .status()
        .expect("run kinc similarity");
    assert!(status.success(), "CLI exited with status {status:?}");

    let output = Command::new(exe)
        .args(["dump", cmx.to_str().expect("path str")])
        .output()
        .expect("run kinc dump");
    assert!(output.status.success());
    let text = String::from_utf8(output.stdout).expect("utf8 output");
    let lines: Vec<&str> = text.lines().collect();
    assert_eq!(lines.len(), 3, "unexpected dump:\n{text}");
    assert!(lines[0].starts_with("beta\talpha\t1\t"));
    assert!(lines[1].starts_with("gamma\talpha\t1\t-"));
    assert!(lines[2].starts_with("gamma\tbeta\t1\t-"));

    let table = Command::new(exe)
        .args(["dump", ccm.to_str().expect("path str"), "--format", "table"])
        .output()
        .expect("run kinc dump table");
    assert!(table.status.success());
    let text = String::from_utf8(table.stdout).expect("utf8 output");
    assert_eq!(text.lines().count(), 4);
    assert!(text.lines().nth(1).is_some_and(|l| l.starts_with("alpha\t(1)")));
}

#[test]
fn invalid_configuration_exits_with_error() {
    let tmp = tempdir().expect("temporary directory");
    let input = tmp.path().join("expression.tsv");
    fs::write(&input, expression_tsv(10)).expect("write expression matrix");

    let output = Command::new(env!("CARGO_BIN_EXE_kinc"))
        .args([
            "similarity",
            input.to_str().expect("path str"),
            "--cmx",
            tmp.path().join("a.cmx").to_str().expect("path str"),
            "--ccm",
            tmp.path().join("a.ccm").to_str().expect("path str"),
            "--min-clusters",
            "4",
            "--max-clusters",
            "2",
        ])
        .output()
        .expect("run kinc similarity");
    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("Error: minimum clusters (4) exceeds maximum clusters (2)"));
}

#[test]
fn expired_time_limit_reports_an_interrupted_run() {
    let tmp = tempdir().expect("temporary directory");
    let input = tmp.path().join("expression.tsv");
    let cmx = tmp.path().join("stopped.cmx");
    fs::write(&input, expression_tsv(20)).expect("write expression matrix");

    let output = Command::new(env!("CARGO_BIN_EXE_kinc"))
        .args([
            "similarity",
            input.to_str().expect("path str"),
            "--cmx",
            cmx.to_str().expect("path str"),
            "--ccm",
            tmp.path().join("stopped.ccm").to_str().expect("path str"),
            "--time-limit",
            "0",
        ])
        .output()
        .expect("run kinc similarity");
    assert!(output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(
        stderr.contains("> Interrupted after 0 work units; outputs hold 0 correlation pairs"),
        "unexpected stderr:\n{stderr}"
    );
    assert!(!stderr.contains("> Done"));
    assert!(cmx.exists());

    let rejected = Command::new(env!("CARGO_BIN_EXE_kinc"))
        .args([
            "similarity",
            input.to_str().expect("path str"),
            "--cmx",
            cmx.to_str().expect("path str"),
            "--ccm",
            tmp.path().join("stopped.ccm").to_str().expect("path str"),
            "--time-limit",
            "-1",
        ])
        .output()
        .expect("run kinc similarity");
    assert!(!rejected.status.success());
}
