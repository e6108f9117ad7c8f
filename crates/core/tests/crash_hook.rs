use std::{
    collections::HashMap,
    fs,
    path::{Path, PathBuf},
    process::Command,
};

use chrono::{DateTime, Utc};
use tempfile::tempdir;
use daybreak_core::logging::{crash_dir_for, install_panic_hook, PanicHookInstallPlan};

fn run_panic_child(mode: &str, data_dir: &Path) -> std::process::Output {
    Command::new(std::env::current_exe().expect("test executable path"))
        .arg("panic_hook_child_entrypoint")
        .arg("--exact")
        .arg("--nocapture")
        .env("DAYBREAK_PANIC_CHILD_MODE", mode)
        .env("DAYBREAK_PANIC_CHILD_DATA_DIR", data_dir)
        .env("RUST_BACKTRACE", "0")
        .env("RUST_LIB_BACKTRACE", "0")
        .output()
        .expect("run panic hook child")
}

fn collect_crash_artifacts(crash_dir: &Path) -> Vec<PathBuf> {
    let mut paths = fs::read_dir(crash_dir)
        .expect("read crash directory")
        .map(|entry| entry.expect("read crash directory entry").path())
        .filter(|path| path.extension().and_then(|ext| ext.to_str()) == Some("log"))
        .collect::<Vec<_>>();
    paths.sort();
    paths
}

/// `key=value` header lines preceding the `backtrace:` section.
fn artifact_fields(contents: &str) -> HashMap<&str, &str> {
    contents
        .lines()
        .take_while(|line| *line != "backtrace:")
        .filter_map(|line| line.split_once('='))
        .collect()
}

#[test]
fn panic_hook_child_entrypoint() {
    let Ok(mode) = std::env::var("DAYBREAK_PANIC_CHILD_MODE") else {
        return;
    };

    let data_dir = PathBuf::from(
        std::env::var("DAYBREAK_PANIC_CHILD_DATA_DIR")
            .expect("DAYBREAK_PANIC_CHILD_DATA_DIR must be set"),
    );

    let first_install = install_panic_hook(Some(data_dir.as_path()));
    assert!(matches!(
        first_install,
        PanicHookInstallPlan::Installed { .. } | PanicHookInstallPlan::AlreadyInstalled { .. }
    ));

    let second_install = install_panic_hook(Some(data_dir.as_path()));
    assert!(matches!(
        second_install,
        PanicHookInstallPlan::AlreadyInstalled { .. }
    ));

    match mode.as_str() {
        "write_success" => panic!("generator worker panicked mid-frame"),
        "write_failure" => {
            let crash_dir = crash_dir_for(&data_dir);
            if crash_dir.exists() {
                fs::remove_dir_all(&crash_dir).expect("remove crash directory");
            }
            fs::write(&crash_dir, b"not-a-directory").expect("replace crash directory with file");
            panic!("crash directory replaced by a file");
        }
        other => panic!("unknown panic hook child mode: {other}"),
    }
}

#[test]
fn crash_hook_writes_crash_file() {
    let data_dir = tempdir().expect("tempdir");
    let output = run_panic_child("write_success", data_dir.path());

    assert!(!output.status.success(), "child process should panic");

    let crash_artifacts = collect_crash_artifacts(&crash_dir_for(data_dir.path()));
    assert_eq!(crash_artifacts.len(), 1, "expected one crash artifact: {crash_artifacts:?}");

    let artifact = &crash_artifacts[0];
    let contents = fs::read_to_string(artifact).expect("read crash artifact");
    let fields = artifact_fields(&contents);

    assert_eq!(fields.get("payload"), Some(&"generator worker panicked mid-frame"));
    assert_eq!(
        fields.get("backtrace_policy"),
        Some(&"disabled (set RUST_BACKTRACE=1 to enable)")
    );
    let location = fields.get("location").expect("location field");
    assert!(location.contains("crash_hook.rs:"), "location={location}");
    let thread = fields.get("thread").expect("thread field");
    assert!(
        ["panic_hook_child_entrypoint", "main"].contains(thread),
        "thread={thread}"
    );
    assert!(contents.contains("\nbacktrace:\n"));

    // panic-<YYYYmmdd-HHMMSS-nanos>-<sequence>.log, stamped with the header's timestamp
    let timestamp: DateTime<Utc> = fields
        .get("timestamp_utc")
        .expect("timestamp_utc field")
        .parse()
        .expect("timestamp_utc is RFC 3339");
    let file_name = artifact.file_name().and_then(|n| n.to_str()).expect("utf-8 file name");
    assert_eq!(
        file_name,
        format!("panic-{}-0000.log", timestamp.format("%Y%m%d-%H%M%S-%f"))
    );

    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(!stderr.contains("thread panicked while panicking"));
}

#[test]
fn crash_hook_unwritable_crash_dir_warns_and_does_not_repanic() {
    let data_dir = tempdir().expect("tempdir");
    let output = run_panic_child("write_failure", data_dir.path());

    assert!(!output.status.success(), "child process should panic");

    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("crash directory replaced by a file"));
    assert!(stderr.contains("Warning: failed to write panic crash artifact under"));
    assert!(!stderr.contains("thread panicked while panicking"));
}
