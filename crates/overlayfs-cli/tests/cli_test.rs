//! Integration tests for the `overlayfs` control CLI.

use std::process::Command;

fn overlayfs(args: &[&str]) -> std::process::Output {
    Command::new("cargo")
        .args(["run", "--package", "overlayfs-cli", "--bin", "overlayfs", "--quiet", "--"])
        .args(args)
        .output()
        .expect("failed to execute overlayfs")
}

#[test]
fn help_lists_mount_lifecycle_subcommands() {
    let output = overlayfs(&["--help"]);
    let stdout = String::from_utf8_lossy(&output.stdout);

    assert!(output.status.success());
    assert!(stdout.contains("mount"));
    assert!(stdout.contains("unmount"));
    assert!(stdout.contains("doctor"));
}

#[test]
fn status_without_a_live_daemon_fails_with_a_clear_message() {
    let temp = tempfile::tempdir().unwrap();
    let target = temp.path().join("target");
    std::fs::create_dir_all(&target).unwrap();

    let output = overlayfs(&["status", "--target", target.to_str().unwrap()]);
    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("overlayfsd") || stderr.contains("mounted"));
}

#[test]
fn doctor_reports_missing_target_as_a_warning_not_a_crash() {
    let temp = tempfile::tempdir().unwrap();
    let target = temp.path().join("never-created");

    let output = overlayfs(&["doctor", "--target", target.to_str().unwrap()]);
    let stderr = String::from_utf8_lossy(&output.stderr);

    assert!(stderr.contains("overlayfs doctor"));
    assert!(stderr.contains("TARGET does not exist yet") || stderr.contains("not currently mounted"));
}
