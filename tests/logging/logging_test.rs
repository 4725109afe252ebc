//! Tests for `src/logging.rs`.

use nonceshell::logging::LoggingGuard;

#[test]
fn logging_guard_is_send() {
    fn assert_send<T: Send>() {}
    assert_send::<LoggingGuard>();
}

#[test]
fn init_production_creates_logs_dir() {
    let tmp = tempfile::tempdir().expect("should create temp dir");
    let logs_dir = tmp.path().join("logs");
    assert!(!logs_dir.exists());

    // Install a global subscriber first so the outcome is deterministic
    // regardless of test order.
    nonceshell::logging::init_cli("info");

    let err = nonceshell::logging::init_production(&logs_dir, "info")
        .err()
        .expect("second subscriber install should be rejected");
    assert!(
        err.to_string().contains("failed to install log subscriber"),
        "unexpected error: {err}"
    );
    assert!(logs_dir.exists(), "logs directory should be created");
}

#[test]
fn init_production_reports_unusable_logs_dir() {
    let tmp = tempfile::tempdir().expect("should create temp dir");
    let blocker = tmp.path().join("not-a-dir");
    std::fs::write(&blocker, "file").expect("should write file");

    let err = nonceshell::logging::init_production(&blocker.join("logs"), "info")
        .err()
        .expect("logs dir under a file cannot be created");
    assert!(
        err.to_string().contains("failed to create logs directory"),
        "unexpected error: {err}"
    );
}

#[test]
fn init_cli_tolerates_existing_subscriber() {
    nonceshell::logging::init_cli("debug");
    nonceshell::logging::init_cli("debug");
}
