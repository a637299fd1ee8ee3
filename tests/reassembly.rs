//! Reassembler protocol: admission, stalls, quarantine and terminal states.

use anyhow::Result;
use rowrelay::testing::*;
use rowrelay::{
    Fragment, FragmentOutcome, MetricsCollector, Reassembler, ReassemblerConfig, RetryPolicy,
    TaskRef, TaskState,
};
use rowrelay::metrics::{FRAGMENTS_DROPPED, FRAGMENTS_REQUEUED, TASKS_QUARANTINED};
use std::fs;

fn frag(fields: &[&str], n: u64, eof: bool) -> Fragment {
    Fragment::new(fields.iter().map(|s| (*s).to_string()).collect(), n, eof)
}

fn two_row_task() -> (TaskRef, Vec<Fragment>) {
    (
        TaskRef::new("a1b2c3", "data.csv"),
        vec![
            frag(&["1.a", "1.b", "1.notes"], 0, false),
            frag(&["2.a", "2.b", "2.notes"], 1, false),
            frag(&[], 2, true),
        ],
    )
}

#[test]
fn test_in_order_delivery_produces_expected_bytes() -> Result<()> {
    let dirs = RelayDirs::new()?;
    let r = Reassembler::new(ReassemblerConfig::in_dir(dirs.work_dir()))?;
    let (task, fragments) = two_row_task();

    let (report, outcomes) = r.apply_fragments(fragments.into_iter().map(|f| (task.clone(), f)));
    assert_eq!(
        outcomes,
        vec![
            FragmentOutcome::Written { line_number: 0 },
            FragmentOutcome::Written { line_number: 1 },
            FragmentOutcome::Completed { line_number: 2 },
        ]
    );
    assert_eq!(report.requeued, 0);
    assert_target_eq(&r.paths(&task), "1.a,1.b,1.notes\n2.a,2.b,2.notes\n");
    Ok(())
}

#[test]
fn test_token_moves_one_step_per_fragment() -> Result<()> {
    let dirs = RelayDirs::new()?;
    let r = Reassembler::new(ReassemblerConfig::in_dir(dirs.work_dir()))?;
    let (task, fragments) = two_row_task();
    let paths = r.paths(&task);

    for fragment in fragments {
        let n = fragment.line_number;
        let eof = fragment.eof;
        r.apply_fragments([(task.clone(), fragment)]);
        let partials: Vec<u64> = paths.partials()?.into_iter().map(|(k, _)| k).collect();
        if eof {
            assert!(partials.is_empty());
            assert_eq!(paths.state()?, TaskState::Complete);
        } else {
            assert_eq!(partials, vec![n + 1]);
            assert_eq!(paths.state()?, TaskState::InProgress { next: n + 1 });
        }
    }
    Ok(())
}

#[test]
fn test_missing_row_quarantines_after_bounded_retries() -> Result<()> {
    let dirs = RelayDirs::new()?;
    let metrics = MetricsCollector::new();
    let r = Reassembler::new(ReassemblerConfig {
        retry: RetryPolicy::immediate(3, 4),
        ..ReassemblerConfig::in_dir(dirs.work_dir())
    })?
    .with_metrics(metrics.clone());
    let (task, fragments) = two_row_task();

    // Row 1 never arrives.
    let (report, outcomes) = r.apply_fragments([
        (task.clone(), fragments[2].clone()),
        (task.clone(), fragments[0].clone()),
    ]);
    assert_eq!(report.requeued, 4);
    assert!(matches!(outcomes[0], FragmentOutcome::Quarantined(_)));
    assert_eq!(outcomes[1], FragmentOutcome::Written { line_number: 0 });
    assert_eq!(metrics.counter(TASKS_QUARANTINED), 1);
    assert_eq!(metrics.counter(FRAGMENTS_REQUEUED), 4);

    let paths = r.paths(&task);
    assert_quarantined(&paths);
    assert_eq!(fs::read_to_string(paths.failed())?, "1.a,1.b,1.notes\n");
    Ok(())
}

#[test]
fn test_predecessor_in_a_later_batch_is_too_late() -> Result<()> {
    let dirs = RelayDirs::new()?;
    let r = Reassembler::new(ReassemblerConfig {
        retry: RetryPolicy::immediate(2, 2),
        ..ReassemblerConfig::in_dir(dirs.work_dir())
    })?;
    let (task, fragments) = two_row_task();

    r.apply_fragments([(task.clone(), fragments[0].clone())]);
    let (first, _) = r.apply_fragments([(task.clone(), fragments[2].clone())]);
    assert_eq!(first.quarantined, 1);

    let (second, outcomes) = r.apply_fragments([(task.clone(), fragments[1].clone())]);
    assert_eq!(second.written, 0);
    assert_eq!(outcomes, vec![FragmentOutcome::DroppedQuarantined]);
    assert_quarantined(&r.paths(&task));
    Ok(())
}

#[test]
fn test_quarantine_without_partials_leaves_empty_marker() -> Result<()> {
    let dirs = RelayDirs::new()?;
    let r = Reassembler::new(ReassemblerConfig {
        retry: RetryPolicy::immediate(0, 1),
        ..ReassemblerConfig::in_dir(dirs.work_dir())
    })?;
    let task = TaskRef::new("t", "lonely.csv");

    let (report, _) = r.apply_fragments([(task.clone(), frag(&["x"], 5, true))]);
    assert_eq!(report.quarantined, 1);
    let paths = r.paths(&task);
    assert_quarantined(&paths);
    assert!(fs::read(paths.failed())?.is_empty());
    Ok(())
}

#[test]
fn test_quarantined_task_accepts_nothing() -> Result<()> {
    let dirs = RelayDirs::new()?;
    let metrics = MetricsCollector::new();
    let r = Reassembler::new(ReassemblerConfig {
        retry: RetryPolicy::immediate(0, 0),
        ..ReassemblerConfig::in_dir(dirs.work_dir())
    })?
    .with_metrics(metrics.clone());
    let (task, fragments) = two_row_task();
    r.apply_fragments([(task.clone(), fragments[1].clone())]);
    let paths = r.paths(&task);
    assert_quarantined(&paths);
    let before = task_files(dirs.work_dir(), "output_", &task)?;

    // Row 0 would otherwise always be admitted.
    let (_, outcomes) = r.apply_fragments(fragments.into_iter().map(|f| (task.clone(), f)));
    assert!(outcomes.iter().all(|o| *o == FragmentOutcome::DroppedQuarantined));
    assert_eq!(task_files(dirs.work_dir(), "output_", &task)?, before);
    assert_eq!(metrics.counter(FRAGMENTS_DROPPED), 3);
    Ok(())
}

#[test]
fn test_completed_task_ignores_redelivery() -> Result<()> {
    let dirs = RelayDirs::new()?;
    let r = Reassembler::new(ReassemblerConfig::in_dir(dirs.work_dir()))?;
    let (task, fragments) = two_row_task();
    r.apply_fragments(fragments.iter().cloned().map(|f| (task.clone(), f)));
    let target = r.paths(&task).target().to_path_buf();
    let before = fs::read(&target)?;

    let (report, _) = r.apply_fragments(fragments.into_iter().rev().map(|f| (task.clone(), f)));
    assert_eq!(report.dropped, 3);
    assert_eq!(report.written, 0);
    assert_eq!(fs::read(&target)?, before);
    Ok(())
}

#[test]
fn test_late_row_zero_restarts_the_task() -> Result<()> {
    let dirs = RelayDirs::new()?;
    let r = Reassembler::new(ReassemblerConfig {
        retry: RetryPolicy::immediate(0, 0),
        ..ReassemblerConfig::in_dir(dirs.work_dir())
    })?;
    let (task, fragments) = two_row_task();
    let paths = r.paths(&task);
    r.apply_fragments([
        (task.clone(), fragments[0].clone()),
        (task.clone(), fragments[1].clone()),
    ]);
    assert!(paths.pending(2).exists());

    // A redelivered row 0 writes a fresh token next to the real one.
    r.apply_fragments([(task.clone(), fragments[0].clone())]);
    let partials: Vec<u64> = paths.partials()?.into_iter().map(|(k, _)| k).collect();
    assert_eq!(partials, vec![1, 2]);
    Ok(())
}

#[test]
fn test_tasks_are_independent() -> Result<()> {
    let dirs = RelayDirs::new()?;
    let r = Reassembler::new(ReassemblerConfig {
        retry: RetryPolicy::immediate(0, 2),
        worker_threads: Some(4),
        ..ReassemblerConfig::in_dir(dirs.work_dir())
    })?;
    let good = TaskRef::new("good01", "data.csv");
    let bad = TaskRef::new("bad001", "data.csv");

    let (report, _) = r.apply_fragments([
        (bad.clone(), frag(&["z"], 3, true)),
        (good.clone(), frag(&["b"], 1, true)),
        (good.clone(), frag(&["a"], 0, false)),
    ]);
    assert_eq!(report.completed, 1);
    assert_eq!(report.quarantined, 1);
    assert_target_eq(&r.paths(&good), "a\nb");
    assert_quarantined(&r.paths(&bad));
    Ok(())
}

#[test]
fn test_custom_prefix_and_sync_writes() -> Result<()> {
    let dirs = RelayDirs::new()?;
    let r = Reassembler::new(ReassemblerConfig {
        output_prefix: "relay_".to_string(),
        sync_writes: true,
        ..ReassemblerConfig::in_dir(dirs.work_dir())
    })?;
    let task = TaskRef::new("t", "x.csv");
    r.apply_fragments([(task.clone(), frag(&["only"], 0, true))]);
    assert!(dirs.work_dir().join("relay_t.x.csv").exists());
    assert_eq!(task_files(dirs.work_dir(), "relay_", &task)?, vec!["relay_t.x.csv"]);
    Ok(())
}
