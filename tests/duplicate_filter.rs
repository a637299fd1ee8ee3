//! Duplicate suppression on the producer side.

#[cfg(feature = "filter-snapshots")]
mod snapshot_tests {
    use anyhow::Result;
    use rowrelay::filter::snapshot_path;
    use rowrelay::metrics::ROWS_SUPPRESSED;
    use rowrelay::testing::*;
    use rowrelay::{
        BusError, MetricsCollector, OutboundMessage, Publisher, Sequencer, SequencerConfig,
    };
    use std::fs;
    use std::path::PathBuf;
    use std::sync::Mutex;
    use tempfile::TempDir;

    fn config(snapshots: &TempDir) -> SequencerConfig {
        SequencerConfig {
            use_duplicate_filter: true,
            filter_snapshot_dir: Some(snapshots.path().to_path_buf()),
            ..Default::default()
        }
    }

    #[test]
    fn test_rerun_only_publishes_new_rows() -> Result<()> {
        let dirs = RelayDirs::new()?;
        let snapshots = TempDir::new()?;
        let metrics = MetricsCollector::new();
        let seq = Sequencer::new(config(&snapshots)).with_metrics(metrics.clone());

        let source = dirs.write_source("growing.csv", generated_rows(5, true))?;
        let first = seq.publish_file(&source, RecordingPublisher::new())?;
        assert_eq!(first.published, 6);
        assert!(snapshot_path(snapshots.path(), "growing.csv").exists());

        // Same file name, three rows appended.
        fs::write(&source, generated_rows(8, true))?;
        let publisher = RecordingPublisher::new();
        let second = seq.publish_file(&source, &publisher)?;
        assert_eq!(second.suppressed, 5);
        assert_eq!(second.published, 4);
        assert_eq!(metrics.counter(ROWS_SUPPRESSED), 5);

        let fragments = publisher.fragments()?;
        let numbers: Vec<u64> = fragments.iter().map(|(_, f)| f.line_number).collect();
        assert_eq!(numbers, vec![0, 1, 2, 3]);
        assert_eq!(fragments[0].1.row, vec!["5", "row-5", "15"]);
        assert!(fragments[3].1.eof);
        assert!(fragments[3].1.row.is_empty());
        Ok(())
    }

    #[test]
    fn test_failed_run_leaves_a_snapshot_of_what_got_out() -> Result<()> {
        let dirs = RelayDirs::new()?;
        let snapshots = TempDir::new()?;
        let seq = Sequencer::new(config(&snapshots));
        let source = dirs.write_source("flaky.csv", generated_rows(8, true))?;

        let flaky = RecordingPublisher::disconnecting_after(3);
        assert!(seq.publish_file(&source, &flaky).is_err());
        assert_eq!(flaky.messages().len(), 3);
        assert_eq!(flaky.close_count(), 1);
        assert!(snapshot_path(snapshots.path(), "flaky.csv").exists());

        let publisher = RecordingPublisher::new();
        let rerun = seq.publish_file(&source, &publisher)?;
        assert_eq!(rerun.suppressed, 3);
        assert_eq!(rerun.published, 6);

        let fragments = publisher.fragments()?;
        let numbers: Vec<u64> = fragments.iter().map(|(_, f)| f.line_number).collect();
        assert_eq!(numbers, vec![0, 1, 2, 3, 4, 5]);
        // The row the bus refused goes out again.
        assert_eq!(fragments[0].1.row, vec!["3", "x, 3", "9"]);
        Ok(())
    }

    /// Notes, for every message, whether a snapshot was on disk by then.
    struct SnapshotWatcher {
        path: PathBuf,
        seen: Mutex<Vec<bool>>,
    }

    impl Publisher for SnapshotWatcher {
        fn publish(&self, _message: OutboundMessage) -> Result<(), BusError> {
            self.seen.lock().unwrap().push(self.path.exists());
            Ok(())
        }
    }

    #[test]
    fn test_snapshot_is_saved_while_publishing() -> Result<()> {
        let dirs = RelayDirs::new()?;
        let snapshots = TempDir::new()?;
        let seq = Sequencer::new(SequencerConfig {
            filter_snapshot_every: 2,
            ..config(&snapshots)
        });
        let source = dirs.write_source("long.csv", generated_rows(4, false))?;

        let watcher = SnapshotWatcher {
            path: snapshot_path(snapshots.path(), "long.csv"),
            seen: Mutex::new(Vec::new()),
        };
        seq.publish_file(&source, &watcher)?;
        assert_eq!(*watcher.seen.lock().unwrap(), vec![false, false, true, true]);
        assert!(watcher.path.exists());
        Ok(())
    }

    #[test]
    fn test_unusable_snapshot_is_ignored() -> Result<()> {
        let dirs = RelayDirs::new()?;
        let snapshots = TempDir::new()?;
        fs::write(snapshot_path(snapshots.path(), "data.csv"), b"garbage")?;

        let source = dirs.write_source("data.csv", TWO_ROWS_TRAILING_NEWLINE)?;
        let report = Sequencer::new(config(&snapshots)).publish_file(&source, RecordingPublisher::new())?;
        assert_eq!(report.published, 3);
        assert_eq!(report.suppressed, 0);
        Ok(())
    }

    #[test]
    fn test_filter_off_publishes_everything_again() -> Result<()> {
        let dirs = RelayDirs::new()?;
        let snapshots = TempDir::new()?;
        let seq = Sequencer::new(SequencerConfig {
            use_duplicate_filter: false,
            ..config(&snapshots)
        });
        let source = dirs.write_source("plain.csv", TWO_ROWS_NO_TRAILING_NEWLINE)?;
        seq.publish_file(&source, RecordingPublisher::new())?;
        let again = seq.publish_file(&source, RecordingPublisher::new())?;
        assert_eq!(again.published, 2);
        assert!(!snapshot_path(snapshots.path(), "plain.csv").exists());
        Ok(())
    }
}

mod sizing_tests {
    use anyhow::Result;
    use rowrelay::testing::*;
    use rowrelay::{Sequencer, SequencerConfig};

    #[test]
    fn test_small_file_with_default_sizing_keeps_unique_rows() -> Result<()> {
        let dirs = RelayDirs::new()?;
        let contents = generated_rows(60, true);
        assert!(contents.len() < 2_000);
        let source = dirs.write_source("small.csv", &contents)?;

        let seq = Sequencer::new(SequencerConfig {
            use_duplicate_filter: true,
            ..Default::default()
        });
        let report = seq.publish_file(&source, RecordingPublisher::new())?;
        assert_eq!(report.suppressed, 0);
        assert_eq!(report.published, 61);
        Ok(())
    }
}

mod rate_tests {
    use rowrelay::DuplicateFilter;

    #[test]
    fn test_false_positive_rate_near_target() {
        let mut filter = DuplicateFilter::with_params(10_000, 0.02, 3);
        for i in 0..10_000 {
            filter.add(format!("[\"inserted\",\"{i}\"]"));
        }
        for i in 0..10_000 {
            assert!(filter.contains(format!("[\"inserted\",\"{i}\"]")));
        }
        let hits = (0..10_000)
            .filter(|i| filter.contains(format!("[\"absent\",\"{i}\"]")))
            .count();
        assert!(hits <= 350, "false positive rate too high: {hits}/10000");
    }
}
