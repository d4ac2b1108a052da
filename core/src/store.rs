use crate::detector::Detection;
use crate::reporting::{self, ReportError};
use crate::scanner::ContentHash;
use serde::{Deserialize, Serialize};
use std::collections::btree_map::{self, BTreeMap};
use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;
use time::{format_description::well_known::Rfc3339, OffsetDateTime};
use tracing::info;

const SNAPSHOT_VERSION: u32 = 1;

/// Detections recorded for one file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageRecord {
    pub path: PathBuf,
    pub hash: ContentHash,
    pub detections: Vec<Detection>,
}

impl ImageRecord {
    pub fn new(path: PathBuf, hash: ContentHash, detections: Vec<Detection>) -> Self {
        Self {
            path,
            hash,
            detections,
        }
    }
}

/// Every file's detections for one run, keyed and iterated by path.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DetectionStore {
    records: BTreeMap<PathBuf, ImageRecord>,
}

#[derive(Serialize, Deserialize)]
struct Snapshot<S> {
    version: u32,
    generated_at: String,
    store: S,
}

impl DetectionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_records(records: impl IntoIterator<Item = ImageRecord>) -> Self {
        let mut store = Self::new();
        for record in records {
            store.insert(record);
        }
        store
    }

    /// Inserts or replaces the record for `record.path`.
    pub fn insert(&mut self, record: ImageRecord) -> Option<ImageRecord> {
        self.records.insert(record.path.clone(), record)
    }

    pub fn get(&self, path: &Path) -> Option<&ImageRecord> {
        self.records.get(path)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn iter(&self) -> btree_map::Values<'_, PathBuf, ImageRecord> {
        self.records.values()
    }

    /// Groups of two or more paths sharing one content hash, each group and
    /// the list sorted.
    pub fn duplicates(&self) -> Vec<Vec<PathBuf>> {
        let mut by_hash: BTreeMap<ContentHash, Vec<PathBuf>> = BTreeMap::new();
        for record in self.iter() {
            by_hash
                .entry(record.hash)
                .or_default()
                .push(record.path.clone());
        }
        let mut groups: Vec<Vec<PathBuf>> = by_hash
            .into_values()
            .filter(|paths| paths.len() > 1)
            .collect();
        groups.sort();
        groups
    }

    /// Writes the binary snapshot, replacing any previous one atomically.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), StoreSaveError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(|source| StoreSaveError::Io {
                source,
                path: parent.to_path_buf(),
            })?;
        }

        let snapshot = Snapshot {
            version: SNAPSHOT_VERSION,
            generated_at: OffsetDateTime::now_utc()
                .format(&Rfc3339)
                .unwrap_or_else(|_| String::from("unknown")),
            store: self,
        };

        let temp = path.with_extension("tmp");
        let file = File::create(&temp).map_err(|source| StoreSaveError::Io {
            source,
            path: temp.clone(),
        })?;
        let mut writer = BufWriter::new(file);
        rmp_serde::encode::write_named(&mut writer, &snapshot).map_err(StoreSaveError::Encode)?;
        writer.flush().map_err(|source| StoreSaveError::Io {
            source,
            path: temp.clone(),
        })?;
        drop(writer);
        fs::rename(&temp, path).map_err(|source| StoreSaveError::Io {
            source,
            path: path.to_path_buf(),
        })?;

        info!(path = %path.display(), records = self.len(), "detection snapshot saved");
        Ok(())
    }

    /// Reads a snapshot written by [`DetectionStore::save`].
    pub fn load(path: impl AsRef<Path>) -> Result<Self, StoreLoadError> {
        let path = path.as_ref();
        let file = File::open(path).map_err(|source| {
            if source.kind() == std::io::ErrorKind::NotFound {
                StoreLoadError::Missing {
                    path: path.to_path_buf(),
                }
            } else {
                StoreLoadError::Io {
                    source,
                    path: path.to_path_buf(),
                }
            }
        })?;
        let reader = BufReader::new(file);
        let snapshot: Snapshot<DetectionStore> =
            rmp_serde::from_read(reader).map_err(|source| StoreLoadError::Decode {
                source,
                path: path.to_path_buf(),
            })?;
        if snapshot.version != SNAPSHOT_VERSION {
            return Err(StoreLoadError::UnsupportedVersion {
                found: snapshot.version,
                path: path.to_path_buf(),
            });
        }
        Ok(snapshot.store)
    }

    /// Loads the snapshot at `path` if one exists, otherwise an empty store.
    /// A snapshot that exists but cannot be read is still an error.
    pub fn load_or_empty(path: impl AsRef<Path>) -> Result<Self, StoreLoadError> {
        match Self::load(path) {
            Err(StoreLoadError::Missing { .. }) => Ok(Self::new()),
            other => other,
        }
    }

    /// Writes `{ path: [{class, confidence, box}] }` JSON, keys sorted.
    pub fn export_json(&self, path: impl AsRef<Path>) -> Result<(), ReportError> {
        reporting::write_detections_json(self, path.as_ref())
    }
}

impl<'a> IntoIterator for &'a DetectionStore {
    type Item = &'a ImageRecord;
    type IntoIter = btree_map::Values<'a, PathBuf, ImageRecord>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

#[derive(Debug, Error)]
pub enum StoreLoadError {
    #[error("no detection snapshot at {}; run process-images first", path.display())]
    Missing { path: PathBuf },
    #[error("io error for {}: {source}", path.display())]
    Io {
        #[source]
        source: std::io::Error,
        path: PathBuf,
    },
    #[error("detection snapshot {} is corrupted: {source}", path.display())]
    Decode {
        #[source]
        source: rmp_serde::decode::Error,
        path: PathBuf,
    },
    #[error("detection snapshot {} has unsupported version {found}", path.display())]
    UnsupportedVersion { found: u32, path: PathBuf },
}

#[derive(Debug, Error)]
pub enum StoreSaveError {
    #[error("io error for {}: {source}", path.display())]
    Io {
        #[source]
        source: std::io::Error,
        path: PathBuf,
    },
    #[error("failed to encode detection snapshot: {0}")]
    Encode(#[source] rmp_serde::encode::Error),
}
