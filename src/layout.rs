//! On-disk state of a task, and the renames that move it forward.
//!
//! Every file of a task lives in the reassembler's working directory and
//! shares one base name, `<prefix><task_id>.<filename>`:
//!
//! | name                 | meaning                                         |
//! |----------------------|-------------------------------------------------|
//! | `<base>`             | target; the task is complete                    |
//! | `<base>.<n>`         | pending token; rows `0..n` written, `n` is next |
//! | `<base>.failed`      | quarantine marker; the task takes no more rows  |
//! | `<base>.<n>.failed`  | stray partial preserved by quarantine           |
//!
//! Name existence is the only synchronization between fragments of a task.
//! Ownership of `<base>.<n>` passes to the next writer by [`std::fs::rename`],
//! which is atomic within a filesystem and fails if the source is gone.

use crate::fragment::TaskRef;
use anyhow::{Context, Result};
use std::ffi::OsString;
use std::fs::{OpenOptions, read_dir, rename};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

/// Suffix of quarantined artifacts.
pub const FAILED_SUFFIX: &str = "failed";

/// Where a task stands, as far as the filesystem can tell.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TaskState {
    /// Nothing on disk yet.
    NotStarted,
    /// `next` is the lowest pending token present.
    InProgress { next: u64 },
    Complete,
    Quarantined,
}

/// What a quarantine did on disk.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Quarantine {
    /// Partials that were renamed, as `(from, to)`.
    pub renamed: Vec<(PathBuf, PathBuf)>,
    /// Whether an empty marker had to be created.
    pub marker_created: bool,
}

/// File names of one task inside a working directory.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TaskPaths {
    dir: PathBuf,
    base_name: String,
    target: PathBuf,
}

impl TaskPaths {
    pub fn new(work_dir: impl AsRef<Path>, prefix: &str, task: &TaskRef) -> Self {
        let dir = work_dir.as_ref().to_path_buf();
        let base_name = format!("{prefix}{}.{}", task.task_id, task.filename);
        let target = dir.join(&base_name);
        Self {
            dir,
            base_name,
            target,
        }
    }

    fn with_suffix(&self, suffix: &str) -> PathBuf {
        let mut name = OsString::from(&self.base_name);
        name.push(".");
        name.push(suffix);
        self.dir.join(name)
    }

    /// The finished file.
    #[must_use]
    pub fn target(&self) -> &Path {
        &self.target
    }

    /// The token that authorizes writing row `line_number`.
    #[must_use]
    pub fn pending(&self, line_number: u64) -> PathBuf {
        self.with_suffix(&line_number.to_string())
    }

    /// The quarantine marker.
    #[must_use]
    pub fn failed(&self) -> PathBuf {
        self.with_suffix(FAILED_SUFFIX)
    }

    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.target.exists()
    }

    #[must_use]
    pub fn is_quarantined(&self) -> bool {
        self.failed().exists()
    }

    /// Every pending token of this task, sorted by line number.
    ///
    /// More than one means the row-0 restart path ran while the task was
    /// already past row 0.
    ///
    /// # Errors
    ///
    /// Returns an error if the working directory cannot be listed.
    pub fn partials(&self) -> Result<Vec<(u64, PathBuf)>> {
        let prefix = format!("{}.", self.base_name);
        let mut out = Vec::new();
        let entries =
            read_dir(&self.dir).with_context(|| format!("list {}", self.dir.display()))?;
        for entry in entries {
            let entry = entry.with_context(|| format!("list {}", self.dir.display()))?;
            let name = entry.file_name();
            let Some(rest) = name.to_str().and_then(|n| n.strip_prefix(&prefix)) else {
                continue;
            };
            if rest.is_empty() || !rest.bytes().all(|b| b.is_ascii_digit()) {
                continue;
            }
            if let Ok(n) = rest.parse::<u64>() {
                out.push((n, entry.path()));
            }
        }
        out.sort_by_key(|(n, _)| *n);
        Ok(out)
    }

    /// Inspect the task.
    ///
    /// # Errors
    ///
    /// Returns an error if the working directory cannot be listed.
    pub fn state(&self) -> Result<TaskState> {
        if self.is_complete() {
            return Ok(TaskState::Complete);
        }
        if self.is_quarantined() {
            return Ok(TaskState::Quarantined);
        }
        Ok(match self.partials()?.first() {
            Some((next, _)) => TaskState::InProgress { next: *next },
            None => TaskState::NotStarted,
        })
    }

    /// Hand the token for row `line_number` to its successor.
    ///
    /// Renames `<base>.<n>` to `<base>.<n+1>`, or to the target when `eof`.
    ///
    /// # Errors
    ///
    /// Fails if the token no longer exists, which means another writer moved
    /// it first.
    pub fn advance(&self, line_number: u64, eof: bool) -> Result<PathBuf> {
        let from = self.pending(line_number);
        let to = if eof {
            self.target.clone()
        } else {
            self.pending(line_number + 1)
        };
        rename(&from, &to)
            .with_context(|| format!("rename {} -> {}", from.display(), to.display()))?;
        Ok(to)
    }

    /// Mark the task as failed, keeping whatever it wrote.
    ///
    /// The highest pending token becomes the marker itself; any other token
    /// gets a `.failed` suffix. With no tokens an empty marker is created.
    /// A token that disappears mid-way is skipped.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be listed or a rename or
    /// marker creation fails for a reason other than a vanished source.
    pub fn quarantine(&self) -> Result<Quarantine> {
        let mut report = Quarantine::default();
        let marker = self.failed();
        let mut partials = self.partials()?;

        let newest = if marker.exists() { None } else { partials.pop() };
        if let Some((_, newest)) = newest {
            match rename(&newest, &marker) {
                Ok(()) => report.renamed.push((newest, marker.clone())),
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => {
                    return Err(e).with_context(|| {
                        format!("rename {} -> {}", newest.display(), marker.display())
                    });
                }
            }
        }

        for (_, path) in partials {
            let mut failed_name = path.clone().into_os_string();
            failed_name.push(".");
            failed_name.push(FAILED_SUFFIX);
            let to = PathBuf::from(failed_name);
            match rename(&path, &to) {
                Ok(()) => report.renamed.push((path, to)),
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => {
                    return Err(e)
                        .with_context(|| format!("rename {} -> {}", path.display(), to.display()));
                }
            }
        }

        if !marker.exists() {
            OpenOptions::new()
                .create(true)
                .truncate(false)
                .write(true)
                .open(&marker)
                .with_context(|| format!("create {}", marker.display()))?;
            report.marker_created = true;
        }
        Ok(report)
    }
}
