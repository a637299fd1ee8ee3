//! Producer role: turn a source file into a numbered fragment stream.
//!
//! Rows are read with the `csv` parser, so a quoted field may hold the
//! delimiter or a line break and still count as one row. The parser skips
//! blank lines; the stream finds them again from the byte offsets the parser
//! reports and emits each one as a zero-field fragment, so they survive
//! reassembly.
//!
//! The stream looks one row ahead to find the last one, then checks the
//! file's final byte to decide how the task ends:
//!
//! - the file ends with `\n`: the last row goes out with `eof = false`,
//!   followed by a zero-field terminal fragment with `eof = true`;
//! - otherwise the last row itself carries `eof = true`.
//!
//! Either way the reassembled file reproduces the source's trailing bytes.
//! Line numbers start at 0 and only advance for fragments actually emitted,
//! so rows dropped by the duplicate filter leave no gap.
//!
//! A row enters the duplicate filter only once the stream is asked for the
//! fragment after it, that is, once the caller is done publishing it. A
//! snapshot saved after a failed publish therefore never covers the row that
//! failed.

use crate::bus::{OutboundMessage, Publisher, PublisherGuard};
use crate::config::SequencerConfig;
use crate::filter::{DuplicateFilter, estimate_items};
use crate::fragment::{Fragment, TaskRef, message_key};
use crate::metrics::{FRAGMENTS_PUBLISHED, MetricsCollector, ROWS_SUPPRESSED};
use anyhow::{Context, Result};
use csv::{Reader, ReaderBuilder, StringRecord};
use sha2::{Digest, Sha256};
use std::collections::VecDeque;
use std::fs::File;
use std::io::{self, BufRead, BufReader, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;
use tracing::{debug, error, info, trace, warn};

/// Source-side failures that are reported instead of retried.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum SequencerError {
    #[error("source file {0} has no rows")]
    EmptySource(PathBuf),

    #[error("source path {0} has no usable file name")]
    NoFileName(PathBuf),
}

/// A fresh 6-character task identifier.
#[must_use]
pub fn generate_task_id() -> String {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos();
    let mut hasher = Sha256::new();
    hasher.update(nanos.to_le_bytes());
    hasher.update(std::process::id().to_le_bytes());
    hasher.finalize().iter().take(3).map(|b| format!("{b:02x}")).collect()
}

/// Whether the last byte of `path` is a line feed.
fn ends_with_newline(file: &mut File) -> Result<bool> {
    let len = file.metadata()?.len();
    if len == 0 {
        return Ok(false);
    }
    file.seek(SeekFrom::End(-1))?;
    let mut last = [0u8; 1];
    file.read_exact(&mut last)?;
    Ok(last[0] == b'\n')
}

/// Second, forward-only view of the source used to count the blank lines
/// the parser skipped between two records.
struct BlankLines {
    reader: BufReader<File>,
    pos: u64,
}

impl BlankLines {
    fn new(file: File) -> Self {
        Self {
            reader: BufReader::new(file),
            pos: 0,
        }
    }

    fn seek_to(&mut self, offset: u64) -> io::Result<()> {
        let delta = i64::try_from(offset).map_err(io::Error::other)?
            - i64::try_from(self.pos).map_err(io::Error::other)?;
        self.reader.seek_relative(delta)?;
        self.pos = offset;
        Ok(())
    }

    fn peek(&mut self) -> io::Result<Option<u8>> {
        Ok(self.reader.fill_buf()?.first().copied())
    }

    fn bump(&mut self) {
        self.reader.consume(1);
        self.pos += 1;
    }

    /// Line breaks in the run of `\r`/`\n` bytes starting at `offset`.
    ///
    /// `offset` is where the parser stopped after the previous record, just
    /// past the first byte of its terminator. A `\n` completing a `\r\n`
    /// started there belongs to that terminator and is not counted.
    fn count_at(&mut self, offset: u64) -> io::Result<u64> {
        let mut after_cr = false;
        if offset > 0 {
            self.seek_to(offset - 1)?;
            after_cr = self.peek()? == Some(b'\r');
            self.bump();
        } else {
            self.seek_to(0)?;
        }
        let mut breaks = 0;
        while let Some(b) = self.peek()? {
            match b {
                b'\n' if after_cr => after_cr = false,
                b'\n' => breaks += 1,
                b'\r' => {
                    breaks += 1;
                    after_cr = true;
                }
                _ => break,
            }
            self.bump();
        }
        Ok(breaks)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Phase {
    Rows,
    Terminal,
    Done,
}

/// Lazy, finite stream of a task's fragments.
///
/// Yields exactly one fragment with `eof = true`, always last. Holds one
/// parsed record plus the blank lines in front of it in memory.
pub struct FragmentStream {
    source: PathBuf,
    reader: Reader<File>,
    record: StringRecord,
    blank_lines: BlankLines,
    /// Byte offset where the parser stopped after the last record.
    record_end: u64,
    pending: VecDeque<Vec<String>>,
    exhausted: bool,
    trailing_newline: bool,
    next_line: u64,
    rows_read: u64,
    phase: Phase,
    filter: Option<DuplicateFilter>,
    /// Key of the last emitted row, added to the filter on the next advance.
    uncommitted: Option<Vec<u8>>,
    suppressed: u64,
    debug: bool,
}

impl FragmentStream {
    /// Parse one more record, queueing the blank lines in front of it. At
    /// the end of the source, queue the trailing blank lines instead.
    fn fill(&mut self) -> Result<()> {
        let more = self.reader.read_record(&mut self.record).with_context(|| {
            format!(
                "parse row {} of {}",
                self.rows_read + 1,
                self.source.display()
            )
        })?;
        let gap_start = if more {
            self.record
                .position()
                .map_or(self.record_end, csv::Position::byte)
        } else {
            self.record_end
        };
        let blanks = self
            .blank_lines
            .count_at(gap_start)
            .with_context(|| format!("scan blank lines of {}", self.source.display()))?;
        for _ in 0..blanks {
            self.pending.push_back(Vec::new());
        }
        if more {
            self.rows_read += 1;
            self.record_end = self.reader.position().byte();
            self.pending
                .push_back(self.record.iter().map(str::to_string).collect());
        } else {
            self.exhausted = true;
        }
        Ok(())
    }

    fn commit(&mut self) {
        if let (Some(filter), Some(key)) = (self.filter.as_mut(), self.uncommitted.take()) {
            filter.add(key);
        }
    }

    /// Emit `row` unless the filter has seen it. `last` rows and blank rows
    /// are never filtered.
    fn emit(&mut self, row: Vec<String>, last: bool) -> Result<Option<Fragment>> {
        match &self.filter {
            Some(filter) if !row.is_empty() => {
                let key = serde_json::to_vec(&row).context("hash row for duplicate filter")?;
                if !last && filter.contains(&key) {
                    self.suppressed += 1;
                    trace!(
                        source = %self.source.display(),
                        line_number = self.next_line,
                        "row already published, skipping"
                    );
                    return Ok(None);
                }
                self.uncommitted = Some(key);
            }
            _ => {}
        }

        let fragment = Fragment::new(row, self.next_line, last);
        self.next_line += 1;
        if self.debug {
            debug!(line_number = fragment.line_number, eof = last, "sequenced row");
        } else {
            trace!(line_number = fragment.line_number, eof = last, "sequenced row");
        }
        Ok(Some(fragment))
    }

    fn advance(&mut self) -> Result<Option<Fragment>> {
        self.commit();
        loop {
            match self.phase {
                Phase::Done => return Ok(None),
                Phase::Terminal => {
                    self.phase = Phase::Done;
                    return self.emit(Vec::new(), true);
                }
                Phase::Rows => {
                    while self.pending.len() < 2 && !self.exhausted {
                        self.fill()?;
                    }
                    let Some(current) = self.pending.pop_front() else {
                        self.phase = Phase::Done;
                        return Ok(None);
                    };
                    if !self.pending.is_empty() {
                        if let Some(fragment) = self.emit(current, false)? {
                            return Ok(Some(fragment));
                        }
                    } else if self.trailing_newline {
                        self.phase = Phase::Terminal;
                        if let Some(fragment) = self.emit(current, false)? {
                            return Ok(Some(fragment));
                        }
                    } else {
                        self.phase = Phase::Done;
                        return self.emit(current, true);
                    }
                }
            }
        }
    }

    /// Rows dropped by the duplicate filter so far.
    #[must_use]
    pub const fn suppressed(&self) -> u64 {
        self.suppressed
    }

    /// Line number the next emitted fragment will get.
    #[must_use]
    pub const fn next_line_number(&self) -> u64 {
        self.next_line
    }

    /// Whether the source ends with a line feed.
    #[must_use]
    pub const fn has_trailing_newline(&self) -> bool {
        self.trailing_newline
    }

    /// The filter as of now: every emitted row except the most recent one.
    #[must_use]
    pub const fn filter(&self) -> Option<&DuplicateFilter> {
        self.filter.as_ref()
    }
}

impl Iterator for FragmentStream {
    type Item = Result<Fragment>;

    fn next(&mut self) -> Option<Self::Item> {
        match self.advance() {
            Ok(Some(fragment)) => Some(Ok(fragment)),
            Ok(None) => None,
            Err(e) => {
                self.phase = Phase::Done;
                Some(Err(e))
            }
        }
    }
}

/// Outcome of [`Sequencer::publish_file`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PublishReport {
    pub task: TaskRef,
    /// Fragments handed to the bus, terminal fragment included.
    pub published: u64,
    pub suppressed: u64,
    pub trailing_newline: bool,
}

/// Producer role.
#[derive(Clone, Default)]
pub struct Sequencer {
    config: SequencerConfig,
    metrics: Option<MetricsCollector>,
}

impl Sequencer {
    #[must_use]
    pub fn new(config: SequencerConfig) -> Self {
        Self {
            config,
            metrics: None,
        }
    }

    #[must_use]
    pub fn with_metrics(mut self, metrics: MetricsCollector) -> Self {
        self.metrics = Some(metrics);
        self
    }

    #[must_use]
    pub const fn config(&self) -> &SequencerConfig {
        &self.config
    }

    fn build_filter(&self, filename: &str, file_size: u64) -> Option<DuplicateFilter> {
        if !self.config.use_duplicate_filter {
            return None;
        }
        #[cfg(feature = "filter-snapshots")]
        if let Some(dir) = &self.config.filter_snapshot_dir {
            match DuplicateFilter::load_snapshot(dir, filename) {
                Ok(Some(filter)) => {
                    debug!(filename, inserted = filter.inserted(), "resuming duplicate filter");
                    return Some(filter);
                }
                Ok(None) => {}
                Err(e) => warn!(filename, error = %e, "ignoring unusable filter snapshot"),
            }
        }
        #[cfg(not(feature = "filter-snapshots"))]
        let _ = filename;

        let items = estimate_items(
            file_size,
            self.config.typical_row_size_bytes,
            self.config.filter_min_items,
            self.config.filter_max_items,
        );
        let filter = DuplicateFilter::with_params(
            items,
            self.config.false_positive_probability,
            self.config.hash_count,
        );
        debug!(items, bits = filter.bit_size(), "sized duplicate filter");
        Some(filter)
    }

    /// Save the stream's filter, if there is one and a snapshot directory
    /// is configured.
    #[cfg(feature = "filter-snapshots")]
    fn save_filter(&self, stream: &FragmentStream, filename: &str) -> Result<()> {
        if let (Some(dir), Some(filter)) = (&self.config.filter_snapshot_dir, stream.filter()) {
            let path = filter.save_snapshot(dir, filename)?;
            trace!(path = %path.display(), inserted = filter.inserted(), "saved duplicate filter");
        }
        Ok(())
    }

    #[cfg(not(feature = "filter-snapshots"))]
    #[allow(clippy::unused_self, clippy::unnecessary_wraps)]
    fn save_filter(&self, _stream: &FragmentStream, _filename: &str) -> Result<()> {
        Ok(())
    }

    /// Open `path` as a lazily read fragment stream.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be opened or read, or
    /// [`SequencerError::EmptySource`] if it holds no bytes.
    pub fn open(&self, path: impl AsRef<Path>) -> Result<FragmentStream> {
        let path = path.as_ref();
        let filename = source_filename(path)?;
        let mut file = File::open(path).with_context(|| format!("open {}", path.display()))?;
        let file_size = file
            .metadata()
            .with_context(|| format!("stat {}", path.display()))?
            .len();
        let trailing_newline = ends_with_newline(&mut file)
            .with_context(|| format!("read last byte of {}", path.display()))?;
        file.rewind()
            .with_context(|| format!("rewind {}", path.display()))?;
        let gaps = File::open(path).with_context(|| format!("open {}", path.display()))?;

        let reader = ReaderBuilder::new()
            .has_headers(false)
            .flexible(true)
            .delimiter(self.config.delimiter)
            .from_reader(file);

        let mut stream = FragmentStream {
            source: path.to_path_buf(),
            reader,
            record: StringRecord::new(),
            blank_lines: BlankLines::new(gaps),
            record_end: 0,
            pending: VecDeque::new(),
            exhausted: false,
            trailing_newline,
            next_line: 0,
            rows_read: 0,
            phase: Phase::Rows,
            filter: self.build_filter(&filename, file_size),
            uncommitted: None,
            suppressed: 0,
            debug: self.config.debug,
        };
        while stream.pending.is_empty() && !stream.exhausted {
            stream.fill()?;
        }
        if stream.pending.is_empty() {
            return Err(SequencerError::EmptySource(path.to_path_buf()).into());
        }
        Ok(stream)
    }

    /// Sequence `path` under a new task and publish every fragment.
    ///
    /// The publisher is closed on every exit path. When the duplicate filter
    /// is enabled and a snapshot directory is configured, the filter is saved
    /// every `filter_snapshot_every` fragments and again when publishing
    /// stops, whether it finished or failed, so a rerun skips what the
    /// failed run got onto the bus.
    ///
    /// # Errors
    ///
    /// Returns an error if the file is empty or unreadable, or if the bus
    /// rejects a message.
    pub fn publish_file<P: Publisher>(
        &self,
        path: impl AsRef<Path>,
        publisher: P,
    ) -> Result<PublishReport> {
        let task = TaskRef::new(generate_task_id(), source_filename(path.as_ref())?);
        self.publish_task(path, task, publisher)
    }

    /// Like [`publish_file`](Self::publish_file) with a caller-chosen task.
    ///
    /// # Errors
    ///
    /// See [`publish_file`](Self::publish_file).
    pub fn publish_task<P: Publisher>(
        &self,
        path: impl AsRef<Path>,
        task: TaskRef,
        publisher: P,
    ) -> Result<PublishReport> {
        let path = path.as_ref();
        let publisher = PublisherGuard::new(publisher);
        let mut stream = match self.open(path) {
            Ok(stream) => stream,
            Err(e) => {
                error!(source = %path.display(), error = %e, "cannot sequence source");
                return Err(e);
            }
        };

        let mut published = 0u64;
        let sent = self.send_all(&mut stream, &task, publisher.get(), &mut published);
        let saved = self.save_filter(&stream, &task.filename);

        let suppressed = stream.suppressed();
        if let Some(metrics) = &self.metrics {
            metrics.increment_counter(FRAGMENTS_PUBLISHED, published);
            metrics.increment_counter(ROWS_SUPPRESSED, suppressed);
        }
        if let Err(e) = sent {
            if let Err(save_error) = saved {
                warn!(filename = %task.filename, error = %save_error, "could not save duplicate filter");
            }
            error!(
                task_id = %task.task_id,
                filename = %task.filename,
                published,
                error = %e,
                "publishing stopped"
            );
            return Err(e);
        }
        saved?;

        info!(
            task_id = %task.task_id,
            filename = %task.filename,
            published,
            suppressed,
            "source sequenced"
        );
        Ok(PublishReport {
            task,
            published,
            suppressed,
            trailing_newline: stream.has_trailing_newline(),
        })
    }

    fn send_all<P: Publisher>(
        &self,
        stream: &mut FragmentStream,
        task: &TaskRef,
        publisher: &P,
        published: &mut u64,
    ) -> Result<()> {
        let headers = task.headers();
        let every = self.config.filter_snapshot_every;
        while let Some(fragment) = stream.next() {
            let fragment = fragment?;
            let message = OutboundMessage {
                key: message_key(&task.filename, fragment.line_number),
                payload: fragment.to_payload()?,
                headers: headers.clone(),
            };
            publisher
                .publish(message)
                .with_context(|| format!("publish {task} #{}", fragment.line_number))?;
            *published += 1;
            if every > 0 && *published % every == 0 {
                self.save_filter(stream, &task.filename)?;
            }
        }
        Ok(())
    }
}

fn source_filename(path: &Path) -> Result<String> {
    path.file_name()
        .and_then(|n| n.to_str())
        .map(str::to_string)
        .ok_or_else(|| SequencerError::NoFileName(path.to_path_buf()).into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn collect(seq: &Sequencer, path: &Path) -> Result<Vec<Fragment>> {
        seq.open(path)?.collect()
    }

    fn row(fields: &[&str]) -> Vec<String> {
        fields.iter().map(|s| (*s).to_string()).collect()
    }

    #[test]
    fn trailing_newline_adds_terminal_fragment() -> Result<()> {
        let tmp = tempfile::tempdir()?;
        let path = tmp.path().join("data.csv");
        fs::write(&path, "1.a,1.b,1.notes\n2.a,2.b,2.notes\n")?;

        let got = collect(&Sequencer::default(), &path)?;
        assert_eq!(
            got,
            vec![
                Fragment::new(row(&["1.a", "1.b", "1.notes"]), 0, false),
                Fragment::new(row(&["2.a", "2.b", "2.notes"]), 1, false),
                Fragment::new(vec![], 2, true),
            ]
        );
        Ok(())
    }

    #[test]
    fn missing_newline_marks_last_row() -> Result<()> {
        let tmp = tempfile::tempdir()?;
        let path = tmp.path().join("data.csv");
        fs::write(&path, "1.a,1.b,1.notes\n2.a,2.b,2.notes")?;

        let got = collect(&Sequencer::default(), &path)?;
        assert_eq!(
            got,
            vec![
                Fragment::new(row(&["1.a", "1.b", "1.notes"]), 0, false),
                Fragment::new(row(&["2.a", "2.b", "2.notes"]), 1, true),
            ]
        );
        Ok(())
    }

    #[test]
    fn single_row_without_newline_is_one_fragment() -> Result<()> {
        let tmp = tempfile::tempdir()?;
        let path = tmp.path().join("one.csv");
        fs::write(&path, "only,row")?;
        let got = collect(&Sequencer::default(), &path)?;
        assert_eq!(got, vec![Fragment::new(row(&["only", "row"]), 0, true)]);
        Ok(())
    }

    #[test]
    fn quoted_newlines_stay_in_one_row() -> Result<()> {
        let tmp = tempfile::tempdir()?;
        let path = tmp.path().join("quoted.csv");
        fs::write(&path, "a,\"multi\nline\",c\nd,e,f\n")?;
        let got = collect(&Sequencer::default(), &path)?;
        assert_eq!(got.len(), 3);
        assert_eq!(got[0].row, row(&["a", "multi\nline", "c"]));
        Ok(())
    }

    #[test]
    fn blank_lines_become_empty_fragments() -> Result<()> {
        let tmp = tempfile::tempdir()?;
        let path = tmp.path().join("gaps.csv");
        fs::write(&path, "a,1\n\nb,2\n\n")?;

        let got = collect(&Sequencer::default(), &path)?;
        assert_eq!(
            got,
            vec![
                Fragment::new(row(&["a", "1"]), 0, false),
                Fragment::new(vec![], 1, false),
                Fragment::new(row(&["b", "2"]), 2, false),
                Fragment::new(vec![], 3, false),
                Fragment::new(vec![], 4, true),
            ]
        );
        Ok(())
    }

    #[test]
    fn blank_lines_are_counted_once_with_crlf() -> Result<()> {
        let tmp = tempfile::tempdir()?;
        let path = tmp.path().join("gaps.csv");
        fs::write(&path, "a\r\n\r\n\r\nb\r\n")?;

        let got = collect(&Sequencer::default(), &path)?;
        let rows: Vec<Vec<String>> = got.iter().map(|f| f.row.clone()).collect();
        assert_eq!(
            rows,
            vec![row(&["a"]), vec![], vec![], row(&["b"]), vec![]]
        );
        assert!(got[4].eof);
        Ok(())
    }

    #[test]
    fn leading_and_only_blank_lines() -> Result<()> {
        let tmp = tempfile::tempdir()?;
        let leading = tmp.path().join("leading.csv");
        fs::write(&leading, "\nx")?;
        assert_eq!(
            collect(&Sequencer::default(), &leading)?,
            vec![Fragment::new(vec![], 0, false), Fragment::new(row(&["x"]), 1, true)]
        );

        let blank = tmp.path().join("blank.csv");
        fs::write(&blank, "\n\n")?;
        assert_eq!(
            collect(&Sequencer::default(), &blank)?,
            vec![
                Fragment::new(vec![], 0, false),
                Fragment::new(vec![], 1, false),
                Fragment::new(vec![], 2, true),
            ]
        );
        Ok(())
    }

    #[test]
    fn empty_source_is_reported() -> Result<()> {
        let tmp = tempfile::tempdir()?;
        let path = tmp.path().join("empty.csv");
        fs::write(&path, "")?;
        let Err(err) = Sequencer::default().open(&path) else {
            panic!("empty source must not sequence");
        };
        assert_eq!(
            err.downcast_ref::<SequencerError>(),
            Some(&SequencerError::EmptySource(path))
        );
        Ok(())
    }

    #[test]
    fn duplicate_filter_keeps_numbers_dense() -> Result<()> {
        let tmp = tempfile::tempdir()?;
        let path = tmp.path().join("dups.csv");
        fs::write(&path, "a,1\nb,2\na,1\nc,3\n")?;
        let seq = Sequencer::new(SequencerConfig {
            use_duplicate_filter: true,
            ..Default::default()
        });

        let mut stream = seq.open(&path)?;
        let got: Vec<Fragment> = stream.by_ref().collect::<Result<_>>()?;
        let numbers: Vec<u64> = got.iter().map(|f| f.line_number).collect();
        assert_eq!(numbers, vec![0, 1, 2, 3]);
        assert_eq!(got[2].row, row(&["c", "3"]));
        assert!(got[3].eof && got[3].row.is_empty());
        assert_eq!(stream.suppressed(), 1);
        Ok(())
    }

    #[test]
    fn rows_enter_filter_once_the_next_fragment_is_requested() -> Result<()> {
        let tmp = tempfile::tempdir()?;
        let path = tmp.path().join("rows.csv");
        fs::write(&path, "a,1\nb,2\n")?;
        let seq = Sequencer::new(SequencerConfig {
            use_duplicate_filter: true,
            ..Default::default()
        });
        let key = serde_json::to_vec(&row(&["a", "1"]))?;

        let mut stream = seq.open(&path)?;
        let first = stream.next().transpose()?;
        assert_eq!(first.map(|f| f.line_number), Some(0));
        assert!(!FragmentStream::filter(&stream).is_some_and(|f| f.contains(&key)));

        stream.next().transpose()?;
        assert!(FragmentStream::filter(&stream).is_some_and(|f| f.contains(&key)));
        Ok(())
    }

    #[test]
    fn blank_rows_bypass_the_filter() -> Result<()> {
        let tmp = tempfile::tempdir()?;
        let path = tmp.path().join("gaps.csv");
        fs::write(&path, "a\n\n\nb\n")?;
        let seq = Sequencer::new(SequencerConfig {
            use_duplicate_filter: true,
            ..Default::default()
        });
        let mut stream = seq.open(&path)?;
        let got: Vec<Fragment> = stream.by_ref().collect::<Result<_>>()?;
        assert_eq!(got.len(), 5);
        assert_eq!(stream.suppressed(), 0);
        Ok(())
    }

    #[test]
    fn filter_is_off_by_default() -> Result<()> {
        let tmp = tempfile::tempdir()?;
        let path = tmp.path().join("dups.csv");
        fs::write(&path, "a,1\na,1")?;
        let got = collect(&Sequencer::default(), &path)?;
        assert_eq!(got.len(), 2);
        Ok(())
    }

    #[test]
    fn task_ids_are_short_hex() {
        let id = generate_task_id();
        assert_eq!(id.len(), 6);
        assert!(id.bytes().all(|b| b.is_ascii_hexdigit()));
    }
}
