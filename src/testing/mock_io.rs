//! Temporary directories for relay tests.

use crate::fragment::TaskRef;
use crate::layout::TaskPaths;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

/// A source directory and a working directory, both removed when dropped.
pub struct RelayDirs {
    #[allow(dead_code)]
    root: TempDir,
    source_dir: PathBuf,
    work_dir: PathBuf,
}

impl RelayDirs {
    /// Create both directories under a fresh temporary root.
    ///
    /// # Errors
    ///
    /// Returns an error if a directory cannot be created.
    pub fn new() -> io::Result<Self> {
        let root = TempDir::new()?;
        let source_dir = root.path().join("source");
        let work_dir = root.path().join("work");
        fs::create_dir(&source_dir)?;
        fs::create_dir(&work_dir)?;
        Ok(Self {
            root,
            source_dir,
            work_dir,
        })
    }

    #[must_use]
    pub fn source_dir(&self) -> &Path {
        &self.source_dir
    }

    #[must_use]
    pub fn work_dir(&self) -> &Path {
        &self.work_dir
    }

    /// Write `contents` to `name` in the source directory.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be written.
    pub fn write_source(&self, name: &str, contents: impl AsRef<[u8]>) -> io::Result<PathBuf> {
        let path = self.source_dir.join(name);
        fs::write(&path, contents)?;
        Ok(path)
    }

    /// File names of `task` with the default prefix.
    #[must_use]
    pub fn paths(&self, task: &TaskRef) -> TaskPaths {
        TaskPaths::new(&self.work_dir, "output_", task)
    }
}

/// Names of every file in `dir` that belongs to `task`, sorted.
///
/// # Errors
///
/// Returns an error if the directory cannot be read.
pub fn task_files(dir: &Path, prefix: &str, task: &TaskRef) -> io::Result<Vec<String>> {
    let base = format!("{prefix}{}.{}", task.task_id, task.filename);
    let mut names: Vec<String> = fs::read_dir(dir)?
        .filter_map(|entry| entry.ok())
        .filter_map(|entry| entry.file_name().into_string().ok())
        .filter(|name| name.starts_with(&base))
        .collect();
    names.sort();
    Ok(names)
}
