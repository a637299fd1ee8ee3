//! Approximate-membership set used to suppress rows already published.
//!
//! A classic Bloom filter: `k` hashed bit positions in an `m`-bit array, with
//!
//! ```text
//! m = floor(-(items_count * ln p) / (ln 2)^2)
//! ```
//!
//! Bit `i` of an item is `xxh3_64_with_seed(item, i) mod m`. Membership
//! never yields a false negative; false positives stay near `p` while the
//! number of inserted items stays near `items_count`.
//!
//! With the `filter-snapshots` feature a filter can be written next to the
//! sequencer's state and reloaded by the next run of the same file, which is
//! what makes suppression span a crashed run.

use serde::{Deserialize, Serialize};
use xxhash_rust::xxh3::xxh3_64_with_seed;

#[cfg(feature = "filter-snapshots")]
use anyhow::{Context, Result, anyhow};
#[cfg(feature = "filter-snapshots")]
use sha2::{Digest, Sha256};
#[cfg(feature = "filter-snapshots")]
use std::fs::{File, create_dir_all, rename};
#[cfg(feature = "filter-snapshots")]
use std::io::{Read, Write};
#[cfg(feature = "filter-snapshots")]
use std::path::{Path, PathBuf};

/// Default target false-positive probability.
pub const DEFAULT_FALSE_POSITIVE_PROBABILITY: f64 = 0.02;
/// Default number of hash functions per item.
pub const DEFAULT_HASH_COUNT: u32 = 3;

/// Fixed-capacity Bloom filter.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DuplicateFilter {
    items_count: u64,
    false_positive_probability: f64,
    hash_count: u32,
    size: u64,
    bits: Vec<u64>,
    inserted: u64,
}

impl DuplicateFilter {
    /// A filter for `items_count` items with the default probability and
    /// hash count.
    #[must_use]
    pub fn new(items_count: u64) -> Self {
        Self::with_params(
            items_count,
            DEFAULT_FALSE_POSITIVE_PROBABILITY,
            DEFAULT_HASH_COUNT,
        )
    }

    /// A filter with explicit parameters.
    ///
    /// `items_count`, `hash_count` and the bit count are at least 1. A
    /// probability outside `(0, 1)` falls back to
    /// [`DEFAULT_FALSE_POSITIVE_PROBABILITY`].
    #[must_use]
    pub fn with_params(items_count: u64, false_positive_probability: f64, hash_count: u32) -> Self {
        let items_count = items_count.max(1);
        let false_positive_probability = usable_probability(false_positive_probability);
        let size = optimal_size(items_count, false_positive_probability);
        let words = usize::try_from(size.div_ceil(64)).unwrap_or(usize::MAX);
        Self {
            items_count,
            false_positive_probability,
            hash_count: hash_count.max(1),
            size,
            bits: vec![0; words],
            inserted: 0,
        }
    }

    /// Number of bits (`m`).
    #[must_use]
    pub const fn bit_size(&self) -> u64 {
        self.size
    }

    #[must_use]
    pub const fn hash_count(&self) -> u32 {
        self.hash_count
    }

    #[must_use]
    pub const fn items_count(&self) -> u64 {
        self.items_count
    }

    /// How many `add` calls the filter has seen.
    #[must_use]
    pub const fn inserted(&self) -> u64 {
        self.inserted
    }

    #[inline]
    fn bit_index(&self, item: &[u8], i: u32) -> u64 {
        xxh3_64_with_seed(item, u64::from(i)) % self.size
    }

    pub fn add(&mut self, item: impl AsRef<[u8]>) {
        let item = item.as_ref();
        for i in 0..self.hash_count {
            let bit = self.bit_index(item, i);
            #[allow(clippy::cast_possible_truncation)]
            let word = (bit / 64) as usize;
            self.bits[word] |= 1 << (bit % 64);
        }
        self.inserted += 1;
    }

    #[must_use]
    pub fn contains(&self, item: impl AsRef<[u8]>) -> bool {
        let item = item.as_ref();
        (0..self.hash_count).all(|i| {
            let bit = self.bit_index(item, i);
            #[allow(clippy::cast_possible_truncation)]
            let word = (bit / 64) as usize;
            self.bits[word] & (1 << (bit % 64)) != 0
        })
    }
}

fn usable_probability(p: f64) -> f64 {
    if p.is_finite() && p > 0.0 && p < 1.0 {
        p
    } else {
        DEFAULT_FALSE_POSITIVE_PROBABILITY
    }
}

/// `floor(-(n * ln p) / (ln 2)^2)`, at least 1.
///
/// `p` outside `(0, 1)` is treated as [`DEFAULT_FALSE_POSITIVE_PROBABILITY`].
#[must_use]
#[allow(
    clippy::cast_precision_loss,
    clippy::cast_possible_truncation,
    clippy::cast_sign_loss
)]
pub fn optimal_size(items_count: u64, false_positive_probability: f64) -> u64 {
    let n = items_count as f64;
    let ln2 = std::f64::consts::LN_2;
    let m = -(n * usable_probability(false_positive_probability).ln()) / (ln2 * ln2);
    (m as u64).max(1)
}

/// Estimate a file's row count from its size instead of scanning it.
///
/// Undercounts files with unusually large rows and overcounts files with
/// small ones. The estimate never drops below `min_items`, so a small file
/// still gets a filter sparse enough not to reject its own rows, and never
/// exceeds `max_items`.
#[must_use]
pub fn estimate_items(
    file_size: u64,
    typical_row_size_bytes: u64,
    min_items: u64,
    max_items: u64,
) -> u64 {
    file_size
        .div_ceil(typical_row_size_bytes.max(1))
        .max(min_items)
        .min(max_items)
        .max(1)
}

#[cfg(feature = "filter-snapshots")]
#[derive(Serialize, Deserialize)]
struct FilterSnapshot {
    filename: String,
    filter: DuplicateFilter,
    checksum: String,
}

#[cfg(feature = "filter-snapshots")]
fn snapshot_checksum(filename: &str, filter: &DuplicateFilter) -> String {
    let mut hasher = Sha256::new();
    hasher.update(filename.as_bytes());
    hasher.update(filter.size.to_le_bytes());
    hasher.update(filter.hash_count.to_le_bytes());
    hasher.update(filter.inserted.to_le_bytes());
    for word in &filter.bits {
        hasher.update(word.to_le_bytes());
    }
    hasher.finalize().iter().map(|b| format!("{b:02x}")).collect()
}

/// Path of the snapshot for `filename` inside `dir`.
#[cfg(feature = "filter-snapshots")]
#[must_use]
pub fn snapshot_path(dir: &Path, filename: &str) -> PathBuf {
    let digest = Sha256::digest(filename.as_bytes());
    let id: String = digest.iter().take(8).map(|b| format!("{b:02x}")).collect();
    dir.join(format!("filter_{id}.bin"))
}

#[cfg(feature = "filter-snapshots")]
impl DuplicateFilter {
    /// Persist the filter for `filename`, replacing any previous snapshot.
    ///
    /// The snapshot is written to a temporary name and renamed into place.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory or file cannot be written.
    pub fn save_snapshot(&self, dir: &Path, filename: &str) -> Result<PathBuf> {
        create_dir_all(dir).with_context(|| format!("mkdir -p {}", dir.display()))?;
        let path = snapshot_path(dir, filename);
        let snapshot = FilterSnapshot {
            filename: filename.to_string(),
            filter: self.clone(),
            checksum: snapshot_checksum(filename, self),
        };
        let encoded = postcard::to_allocvec(&snapshot).context("serialize filter snapshot")?;

        let tmp = path.with_extension("bin.tmp");
        let mut file =
            File::create(&tmp).with_context(|| format!("create {}", tmp.display()))?;
        file.write_all(&encoded)
            .with_context(|| format!("write {}", tmp.display()))?;
        file.sync_all()
            .with_context(|| format!("sync {}", tmp.display()))?;
        rename(&tmp, &path)
            .with_context(|| format!("rename {} -> {}", tmp.display(), path.display()))?;
        Ok(path)
    }

    /// Load the snapshot for `filename`, if one exists.
    ///
    /// # Errors
    ///
    /// Returns an error if the snapshot exists but cannot be read, decoded,
    /// belongs to another file, or fails its integrity check.
    pub fn load_snapshot(dir: &Path, filename: &str) -> Result<Option<Self>> {
        let path = snapshot_path(dir, filename);
        if !path.exists() {
            return Ok(None);
        }
        let mut file = File::open(&path).with_context(|| format!("open {}", path.display()))?;
        let mut encoded = Vec::new();
        file.read_to_end(&mut encoded)
            .with_context(|| format!("read {}", path.display()))?;
        let snapshot: FilterSnapshot =
            postcard::from_bytes(&encoded).context("deserialize filter snapshot")?;

        if snapshot.filename != filename {
            return Err(anyhow!(
                "filter snapshot {} belongs to {:?}",
                path.display(),
                snapshot.filename
            ));
        }
        if snapshot_checksum(filename, &snapshot.filter) != snapshot.checksum {
            return Err(anyhow!(
                "filter snapshot {} failed its integrity check",
                path.display()
            ));
        }
        let words = usize::try_from(snapshot.filter.size.div_ceil(64)).unwrap_or(usize::MAX);
        if snapshot.filter.size == 0 || snapshot.filter.bits.len() != words {
            return Err(anyhow!("filter snapshot {} is malformed", path.display()));
        }
        Ok(Some(snapshot.filter))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn size_follows_the_textbook_formula() {
        // -(10000 * ln 0.02) / ln(2)^2 = 81423.5...
        assert_eq!(optimal_size(10_000, 0.02), 81_423);
        let f = DuplicateFilter::new(10_000);
        assert_eq!(f.bit_size(), 81_423);
        assert_eq!(f.hash_count(), 3);
    }

    #[test]
    fn added_items_are_always_found() {
        let mut f = DuplicateFilter::new(500);
        for i in 0..500 {
            f.add(format!("row-{i}"));
        }
        for i in 0..500 {
            assert!(f.contains(format!("row-{i}")), "lost row-{i}");
        }
        assert_eq!(f.inserted(), 500);
    }

    #[test]
    fn false_positive_rate_stays_near_target() {
        let mut f = DuplicateFilter::new(10_000);
        for i in 0..10_000 {
            f.add(format!("inserted:{i}"));
        }
        let hits = (0..10_000)
            .filter(|i| f.contains(format!("absent:{i}")))
            .count();
        // p = 0.02 with k = 3 lands a little above 2%.
        assert!(hits <= 350, "false positives: {hits}");
    }

    #[test]
    fn estimate_is_floored_capped_and_never_zero() {
        assert_eq!(estimate_items(0, 200, 0, 10_000), 1);
        assert_eq!(estimate_items(1_000, 200, 0, 10_000), 5);
        assert_eq!(estimate_items(1_001, 200, 0, 10_000), 6);
        assert_eq!(estimate_items(1_000, 200, 1_000, 10_000), 1_000);
        assert_eq!(estimate_items(u64::MAX, 200, 1_000, 10_000), 10_000);
        // A floor above the cap yields the cap.
        assert_eq!(estimate_items(10, 200, 50, 20), 20);
    }

    #[test]
    fn out_of_range_probability_falls_back_to_default() {
        let expected = optimal_size(1_000, DEFAULT_FALSE_POSITIVE_PROBABILITY);
        for p in [0.0, -1.0, 1.0, 7.5, f64::NAN, f64::INFINITY] {
            let f = DuplicateFilter::with_params(1_000, p, 3);
            assert_eq!(f.bit_size(), expected, "p = {p}");
        }
        let mut f = DuplicateFilter::with_params(10, 0.0, 0);
        assert_eq!(f.hash_count(), 1);
        f.add("row");
        assert!(f.contains("row"));
    }

    #[cfg(feature = "filter-snapshots")]
    #[test]
    fn snapshots_survive_a_restart() -> Result<()> {
        let tmp = tempfile::tempdir()?;
        let mut f = DuplicateFilter::new(100);
        f.add("a,b,c");
        f.save_snapshot(tmp.path(), "data.csv")?;

        let loaded = DuplicateFilter::load_snapshot(tmp.path(), "data.csv")?.unwrap();
        assert!(loaded.contains("a,b,c"));
        assert_eq!(loaded, f);
        assert!(DuplicateFilter::load_snapshot(tmp.path(), "other.csv")?.is_none());
        Ok(())
    }

    #[cfg(feature = "filter-snapshots")]
    #[test]
    fn corrupt_snapshots_are_rejected() -> Result<()> {
        let tmp = tempfile::tempdir()?;
        let f = DuplicateFilter::new(100);
        let path = f.save_snapshot(tmp.path(), "data.csv")?;
        let mut bytes = std::fs::read(&path)?;
        let last = bytes.len() - 1;
        bytes[last] ^= 0xff;
        std::fs::write(&path, bytes)?;
        assert!(DuplicateFilter::load_snapshot(tmp.path(), "data.csv").is_err());
        Ok(())
    }
}
