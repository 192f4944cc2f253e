//! Nearest-neighbour search over command embeddings.
//!
//! The searchable state is an immutable [`IndexSnapshot`]. New entries go
//! into a staging buffer; [`SnapshotIndex::rebuild`] turns the buffer into a
//! fresh snapshot and swaps it in. Readers holding the old `Arc` keep a
//! consistent view until they drop it.
//!
//! Snapshot file format: a bincode-encoded [`SnapshotFile`] whose `version`
//! must equal [`FORMAT_VERSION`].

use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{BufReader, BufWriter, Write};
use std::path::Path;
use std::sync::{Arc, Mutex, RwLock};

use crate::embedding::similarity;

pub const FORMAT_VERSION: u8 = 1;

#[derive(Debug, thiserror::Error)]
pub enum IndexError {
    #[error("Index has not been built")]
    NotBuilt,

    #[error("Dimension mismatch: expected {expected}, got {got}")]
    DimensionMismatch { expected: usize, got: usize },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid snapshot file: {0}")]
    Format(#[from] bincode::Error),

    #[error("Version mismatch: file version {0}, supported version {1}")]
    VersionMismatch(u8, u8),

    #[error("Index lock was poisoned")]
    Poisoned,
}

#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
pub struct EntryMetadata {
    pub frequency: u32,
    pub last_used: f64,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct IndexEntry {
    pub command: String,
    pub vector: Vec<f32>,
    pub metadata: EntryMetadata,
}

#[derive(Debug, Clone, PartialEq)]
pub struct IndexHit {
    pub command: String,
    /// In [0, 1].
    pub similarity: f32,
    pub metadata: EntryMetadata,
}

pub trait SimilarityIndex: Send + Sync {
    fn search(&self, vector: &[f32], k: usize) -> Result<Vec<IndexHit>, IndexError>;
    fn is_built(&self) -> bool;
}

#[derive(Debug, Clone, Default)]
pub struct IndexSnapshot {
    dimensions: usize,
    entries: Vec<IndexEntry>,
    built_at: f64,
}

#[derive(Serialize, Deserialize)]
struct SnapshotFile {
    version: u8,
    dimensions: usize,
    built_at: f64,
    entries: Vec<IndexEntry>,
}

impl IndexSnapshot {
    pub fn build(dimensions: usize, entries: Vec<IndexEntry>, built_at: f64) -> Result<Self, IndexError> {
        if let Some(bad) = entries.iter().find(|e| e.vector.len() != dimensions) {
            return Err(IndexError::DimensionMismatch {
                expected: dimensions,
                got: bad.vector.len(),
            });
        }
        Ok(IndexSnapshot {
            dimensions,
            entries,
            built_at,
        })
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn dimensions(&self) -> usize {
        self.dimensions
    }

    pub fn built_at(&self) -> f64 {
        self.built_at
    }

    pub fn search(&self, vector: &[f32], k: usize) -> Result<Vec<IndexHit>, IndexError> {
        if vector.len() != self.dimensions {
            return Err(IndexError::DimensionMismatch {
                expected: self.dimensions,
                got: vector.len(),
            });
        }
        let mut scored: Vec<(f32, &IndexEntry)> = self
            .entries
            .iter()
            .map(|e| (similarity(vector, &e.vector), e))
            .collect();
        scored.sort_by(|a, b| b.0.total_cmp(&a.0));
        Ok(scored
            .into_iter()
            .take(k)
            .map(|(score, e)| IndexHit {
                command: e.command.clone(),
                similarity: score,
                metadata: e.metadata.clone(),
            })
            .collect())
    }

    /// Write to `path` through a temporary sibling so a crash never leaves a
    /// truncated snapshot behind.
    pub fn save(&self, path: &Path) -> Result<(), IndexError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let tmp = path.with_extension("tmp");
        {
            let mut writer = BufWriter::new(File::create(&tmp)?);
            let file = SnapshotFile {
                version: FORMAT_VERSION,
                dimensions: self.dimensions,
                built_at: self.built_at,
                entries: self.entries.clone(),
            };
            bincode::serialize_into(&mut writer, &file)?;
            writer.flush()?;
        }
        std::fs::rename(&tmp, path)?;
        Ok(())
    }

    pub fn load(path: &Path) -> Result<Self, IndexError> {
        let reader = BufReader::new(File::open(path)?);
        let file: SnapshotFile = bincode::deserialize_from(reader)?;
        if file.version != FORMAT_VERSION {
            return Err(IndexError::VersionMismatch(file.version, FORMAT_VERSION));
        }
        IndexSnapshot::build(file.dimensions, file.entries, file.built_at)
    }
}

/// An index that is searched through an immutable snapshot and only
/// changes by wholesale replacement.
#[derive(Default)]
pub struct SnapshotIndex {
    current: RwLock<Option<Arc<IndexSnapshot>>>,
    staging: Mutex<Vec<IndexEntry>>,
}

impl SnapshotIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> Option<Arc<IndexSnapshot>> {
        self.current.read().ok().and_then(|guard| guard.clone())
    }

    /// Replace the searchable snapshot. Returns the previous one.
    pub fn swap(&self, snapshot: IndexSnapshot) -> Result<Option<Arc<IndexSnapshot>>, IndexError> {
        let mut guard = self.current.write().map_err(|_| IndexError::Poisoned)?;
        Ok(guard.replace(Arc::new(snapshot)))
    }

    pub fn stage(&self, entry: IndexEntry) -> Result<(), IndexError> {
        self.staging
            .lock()
            .map_err(|_| IndexError::Poisoned)?
            .push(entry);
        Ok(())
    }

    pub fn staged(&self) -> usize {
        self.staging.lock().map(|s| s.len()).unwrap_or(0)
    }

    /// Build a snapshot from everything staged, swap it in and clear the
    /// buffer. Staged entries survive a failed build.
    pub fn rebuild(&self, dimensions: usize, built_at: f64) -> Result<Arc<IndexSnapshot>, IndexError> {
        let mut staging = self.staging.lock().map_err(|_| IndexError::Poisoned)?;
        let snapshot = IndexSnapshot::build(dimensions, staging.clone(), built_at)?;
        staging.clear();
        drop(staging);
        self.swap(snapshot)?;
        self.snapshot().ok_or(IndexError::NotBuilt)
    }
}

impl SimilarityIndex for SnapshotIndex {
    fn search(&self, vector: &[f32], k: usize) -> Result<Vec<IndexHit>, IndexError> {
        match self.snapshot() {
            Some(snapshot) => snapshot.search(vector, k),
            None => Err(IndexError::NotBuilt),
        }
    }

    fn is_built(&self) -> bool {
        self.snapshot().is_some()
    }
}
