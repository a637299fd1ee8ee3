//! End-to-end relay over the in-memory bus.
//!
//! Demonstrates:
//! - Generating a CRLF source file with a header row
//! - Sequencing it onto a bus that shuffles and redelivers
//! - Reassembling it and checking the bytes match
//! - Reading the run's counters
//!
//! Run with: cargo run --example relay_demo
//! Set `RUST_LOG=rowrelay=debug` for per-task events.

use anyhow::{Result, ensure};
use rowrelay::*;
use std::fmt::Write as _;
use std::fs;
use std::sync::atomic::AtomicBool;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

fn generate_source(rows: usize) -> String {
    let mut out = String::from("FieldA,FieldB,Notes\r\n");
    for line in 1..=rows {
        let _ = write!(out, "{line}.a,{line}.b,{line}.notes\r\n");
    }
    out
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    println!("Row relay demo\n");

    let root = tempfile::tempdir()?;
    let source = root.path().join("example-file.csv");
    let contents = generate_source(100);
    fs::write(&source, &contents)?;

    let metrics = MetricsCollector::new();
    metrics.record_start();

    // =============================================================================
    // Producer: one message per row, plus the end-of-file marker
    // =============================================================================
    let bus = MemoryBus::new(MemoryBusOptions {
        shuffle_seed: Some(2024),
        duplicate_every: Some(9),
        ..Default::default()
    });
    let sequencer = Sequencer::new(SequencerConfig::default()).with_metrics(metrics.clone());
    let report = sequencer.publish_file(&source, &bus)?;
    println!(
        "Published {} fragments for task {} ({} queued with redeliveries)",
        report.published,
        report.task,
        bus.outstanding()
    );

    // =============================================================================
    // Consumer: rebuild the file from one shuffled batch
    // =============================================================================
    let mut config = RelayConfig::default();
    config.reassembler.work_dir = root.path().join("out");
    config.reassembler.terminator = "\r\n".to_string();
    config.reassembler.retry = RetryPolicy::immediate(1, 128);
    config.batch_size = bus.outstanding();
    config.validate()?;

    let reassembler = Reassembler::new(config.reassembler.clone())?.with_metrics(metrics.clone());
    let options = ConsumeOptions {
        batch_size: config.batch_size,
        idle_poll: Duration::from_millis(10),
        stop_when_idle: true,
    };
    let total = reassembler.consume(&mut bus.subscriber(), options, &AtomicBool::new(false))?;
    metrics.record_end();

    println!(
        "Received {} messages: {} written, {} dropped, {} re-queued locally",
        total.received, total.written, total.dropped, total.requeued
    );

    // =============================================================================
    // Verify
    // =============================================================================
    let paths = reassembler.paths(&report.task);
    let rebuilt = fs::read(paths.target())?;
    ensure!(
        rebuilt == contents.as_bytes(),
        "reassembled file differs from the source"
    );
    println!("Target {} matches the source byte for byte", paths.target().display());

    metrics.print();
    Ok(())
}
