//! On-disk persistence of the build cache
//!
//! Each entry is stored as two files named by the hex content hash:
//! `<hash>.shape` holds whatever bytes the kernel exported for the shape and
//! `<hash>.ron` holds the summary and named references.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::{BuildCache, CacheEntry, NamedReferences};
use crate::hash::ContentHash;
use crate::kernel::{CadError, CadKernel, ShapeSummary};

/// Bumped whenever the record layout or hashing scheme changes
const RECORD_VERSION: u32 = 1;

/// Persistence errors
#[derive(Debug, Clone, thiserror::Error)]
pub enum PersistError {
    #[error("IO error: {0}")]
    Io(String),
    #[error("Serialization error: {0}")]
    Serialize(String),
    #[error("Deserialization error: {0}")]
    Deserialize(String),
}

#[derive(Debug, Serialize, Deserialize)]
struct EntryRecord {
    version: u32,
    /// Shape id at save time, used to re-point stored sub-shape sets
    shape_id: Uuid,
    summary: ShapeSummary,
    references: NamedReferences,
}

/// Directory holding a persisted cache
#[derive(Debug, Clone)]
pub struct CacheDirectory {
    dir: PathBuf,
}

impl CacheDirectory {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn shape_path(&self, hash: &ContentHash) -> PathBuf {
        self.dir.join(format!("{}.shape", hash.to_hex()))
    }

    fn record_path(&self, hash: &ContentHash) -> PathBuf {
        self.dir.join(format!("{}.ron", hash.to_hex()))
    }

    /// Write every entry not yet on disk; returns the number written
    ///
    /// Entries whose shape the kernel cannot export are skipped.
    pub fn save(&self, cache: &BuildCache, kernel: &dyn CadKernel) -> Result<usize, PersistError> {
        std::fs::create_dir_all(&self.dir).map_err(|e| PersistError::Io(e.to_string()))?;

        let mut written = 0;
        for (hash, entry) in cache.entries() {
            let record_path = self.record_path(&hash);
            if record_path.exists() {
                continue;
            }

            let bytes = match kernel.export_shape(&entry.shape) {
                Ok(bytes) => bytes,
                Err(CadError::Unsupported(reason)) => {
                    tracing::warn!("Cache not persisted: {}", reason);
                    return Ok(written);
                }
                Err(e) => {
                    tracing::warn!(hash = %hash.short(), "Skipping cache entry: {}", e);
                    continue;
                }
            };

            let record = EntryRecord {
                version: RECORD_VERSION,
                shape_id: entry.shape.id,
                summary: entry.summary,
                references: entry.references.clone(),
            };
            let content = ron::ser::to_string_pretty(&record, ron::ser::PrettyConfig::default())
                .map_err(|e| PersistError::Serialize(e.to_string()))?;

            // Shape first: a record without its shape is never read back
            std::fs::write(self.shape_path(&hash), bytes)
                .map_err(|e| PersistError::Io(e.to_string()))?;
            std::fs::write(&record_path, content).map_err(|e| PersistError::Io(e.to_string()))?;
            written += 1;
        }

        tracing::debug!(written, dir = %self.dir.display(), "Persisted cache entries");
        Ok(written)
    }

    /// Read persisted entries into `cache`; returns the number loaded
    ///
    /// A missing directory is an empty cache. Unreadable or outdated entries
    /// are skipped.
    pub fn load(&self, cache: &BuildCache, kernel: &dyn CadKernel) -> Result<usize, PersistError> {
        if !self.dir.is_dir() {
            return Ok(0);
        }

        let listing = std::fs::read_dir(&self.dir).map_err(|e| PersistError::Io(e.to_string()))?;
        let mut loaded = 0;
        for item in listing {
            let path = item.map_err(|e| PersistError::Io(e.to_string()))?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("ron") {
                continue;
            }
            let Some(hash) = path
                .file_stem()
                .and_then(|s| s.to_str())
                .and_then(ContentHash::from_hex)
            else {
                continue;
            };

            match self.load_entry(&hash, &path, kernel) {
                Ok(Some(entry)) => {
                    cache.put(hash, entry);
                    loaded += 1;
                }
                Ok(None) => {}
                Err(e) => tracing::warn!(hash = %hash.short(), "Skipping persisted entry: {}", e),
            }
        }

        tracing::debug!(loaded, dir = %self.dir.display(), "Loaded persisted cache entries");
        Ok(loaded)
    }

    fn load_entry(
        &self,
        hash: &ContentHash,
        record_path: &Path,
        kernel: &dyn CadKernel,
    ) -> Result<Option<CacheEntry>, PersistError> {
        let content =
            std::fs::read_to_string(record_path).map_err(|e| PersistError::Io(e.to_string()))?;
        let record: EntryRecord =
            ron::from_str(&content).map_err(|e| PersistError::Deserialize(e.to_string()))?;
        if record.version != RECORD_VERSION {
            tracing::debug!(hash = %hash.short(), version = record.version, "Outdated record");
            return Ok(None);
        }

        let bytes =
            std::fs::read(self.shape_path(hash)).map_err(|e| PersistError::Io(e.to_string()))?;
        let shape = kernel
            .import_shape(&bytes)
            .map_err(|e| PersistError::Deserialize(e.to_string()))?;

        let mut references = record.references;
        for set in references.subshapes.values_mut() {
            if set.shape.id == record.shape_id {
                set.shape = shape.clone();
            }
        }

        Ok(Some(CacheEntry {
            shape,
            summary: record.summary,
            references,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::{EntityKind, KernelOp, NullKernel, StubKernel};
    use crate::selection::FeatureSet;
    use glam::DVec3;

    fn cached_box(cache: &BuildCache, kernel: &StubKernel) -> ContentHash {
        let shape = kernel
            .build(&KernelOp::Box {
                origin: DVec3::ZERO,
                extent: DVec3::ONE,
                centered: false,
            })
            .unwrap();
        let mut references = NamedReferences::default();
        references.points.insert("origin".into(), DVec3::ZERO);
        references.subshapes.insert(
            "top".into(),
            FeatureSet::new(shape.clone(), EntityKind::Face, vec![5]),
        );
        let hash = crate::hash::scalar_value_hash(42.0);
        cache.put(
            hash,
            CacheEntry {
                summary: kernel.summarize(&shape).unwrap(),
                shape,
                references,
            },
        );
        hash
    }

    #[test]
    fn test_save_and_reload() {
        let dir = tempfile::tempdir().unwrap();
        let store = CacheDirectory::new(dir.path());

        let kernel = StubKernel::new();
        let cache = BuildCache::default();
        let hash = cached_box(&cache, &kernel);
        assert_eq!(store.save(&cache, &kernel).unwrap(), 1);
        // Already on disk
        assert_eq!(store.save(&cache, &kernel).unwrap(), 0);

        let fresh_kernel = StubKernel::new();
        let fresh = BuildCache::default();
        assert_eq!(store.load(&fresh, &fresh_kernel).unwrap(), 1);

        let entry = fresh.get(&hash).unwrap();
        assert_eq!(entry.references.points["origin"], DVec3::ZERO);
        assert_eq!(entry.references.subshapes["top"].shape, entry.shape);
        assert_eq!(fresh_kernel.summarize(&entry.shape).unwrap().faces, 6);
        assert_eq!(fresh_kernel.build_calls(), 0);
    }

    #[test]
    fn test_unsupported_kernel_writes_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let store = CacheDirectory::new(dir.path().join("cache"));
        let kernel = StubKernel::new();
        let cache = BuildCache::default();
        cached_box(&cache, &kernel);

        assert_eq!(store.save(&cache, &NullKernel).unwrap(), 0);
    }

    #[test]
    fn test_missing_directory_loads_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let store = CacheDirectory::new(dir.path().join("absent"));
        let cache = BuildCache::default();
        assert_eq!(store.load(&cache, &StubKernel::new()).unwrap(), 0);
        assert!(cache.is_empty());
    }
}
