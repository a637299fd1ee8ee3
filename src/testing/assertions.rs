//! Assertions about a task's files after a run.

use crate::layout::{TaskPaths, TaskState};
use std::fs;

/// Assert that the task completed and its target holds exactly `expected`.
///
/// # Panics
///
/// Panics if the target is missing, differs from `expected`, or pending
/// files of the task are left behind.
pub fn assert_target_eq(paths: &TaskPaths, expected: impl AsRef<[u8]>) {
    let expected = expected.as_ref();
    let actual = fs::read(paths.target())
        .unwrap_or_else(|e| panic!("target {} unreadable: {e}", paths.target().display()));
    assert!(
        actual == expected,
        "Target mismatch for {}:\n  Expected: {:?}\n  Actual: {:?}",
        paths.target().display(),
        String::from_utf8_lossy(expected),
        String::from_utf8_lossy(&actual)
    );
    assert_no_partials(paths);
}

/// Assert that no pending file of the task exists.
///
/// # Panics
///
/// Panics if any pending file is found.
pub fn assert_no_partials(paths: &TaskPaths) {
    let partials = paths
        .partials()
        .unwrap_or_else(|e| panic!("cannot list partials: {e:#}"));
    assert!(
        partials.is_empty(),
        "Expected no pending files, found: {partials:?}"
    );
}

/// Assert that the task is quarantined and has no target.
///
/// # Panics
///
/// Panics if the task is in any other state.
pub fn assert_quarantined(paths: &TaskPaths) {
    let state = paths
        .state()
        .unwrap_or_else(|e| panic!("cannot read task state: {e:#}"));
    assert_eq!(state, TaskState::Quarantined, "task is not quarantined");
    assert!(!paths.target().exists(), "quarantined task has a target");
}

/// Assert that the task is either complete with `expected` or quarantined.
///
/// # Panics
///
/// Panics if the task ended anywhere else, or completed with other bytes.
pub fn assert_terminal(paths: &TaskPaths, expected: impl AsRef<[u8]>) {
    if paths.is_complete() {
        assert_target_eq(paths, expected);
    } else {
        assert_quarantined(paths);
    }
}
