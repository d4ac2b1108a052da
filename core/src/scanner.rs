use crate::cache::ResultCache;
use crate::detector::{Detection, DetectorError, ObjectDetector};
use crate::store::{DetectionStore, ImageRecord};
use indicatif::ProgressBar;
use rayon::prelude::*;
use rustc_hash::FxHashSet;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt::{Display, Formatter};
use std::fs::File;
use std::hash::Hasher;
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use thiserror::Error;
use tracing::{debug, info, warn};
use twox_hash::XxHash64;
use walkdir::WalkDir;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ThreadingMode {
    #[default]
    Parallel,
    Sequential,
}

/// Parameters that control how the detection pass walks the input.
#[derive(Clone, Debug)]
pub struct ScanConfig {
    /// Lowercase extensions without the leading dot.
    pub extensions: Vec<String>,
    pub threading: ThreadingMode,
    pub recursive: bool,
}

impl ScanConfig {
    pub fn new(extensions: Vec<String>, threading: ThreadingMode) -> Self {
        Self {
            extensions: extensions
                .into_iter()
                .map(|ext| ext.trim_start_matches('.').to_lowercase())
                .collect(),
            threading,
            recursive: true,
        }
    }

    pub fn with_recursion(mut self, recursive: bool) -> Self {
        self.recursive = recursive;
        self
    }
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self::new(default_extensions(), ThreadingMode::Parallel)
    }
}

pub fn default_extensions() -> Vec<String> {
    vec![
        "png".to_string(),
        "jpg".to_string(),
        "jpeg".to_string(),
        "bmp".to_string(),
    ]
}

/// xxHash64 digest of a file's full contents.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ContentHash(pub u64);

impl Display for ContentHash {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

/// Why a single file dropped out of a batch.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    FileRead,
    DetectorInvocation,
    FileWrite,
}

impl Display for FailureKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::FileRead => write!(f, "read"),
            Self::DetectorInvocation => write!(f, "detect"),
            Self::FileWrite => write!(f, "write"),
        }
    }
}

/// A recoverable per-file error, recorded instead of aborting the batch.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileFailure {
    pub path: PathBuf,
    pub kind: FailureKind,
    pub message: String,
}

impl FileFailure {
    pub fn new(path: impl Into<PathBuf>, kind: FailureKind, message: impl Display) -> Self {
        Self {
            path: path.into(),
            kind,
            message: message.to_string(),
        }
    }
}

/// Outcome of a detection pass.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ScanReport {
    /// Image files found under the input.
    pub scanned: usize,
    /// Files whose detections came from the cache.
    pub cache_hits: usize,
    /// Detector invocations that succeeded.
    pub detected: usize,
    pub failures: Vec<FileFailure>,
}

#[derive(Debug, Error)]
pub enum ScanError {
    #[error("input path {} does not exist", .0.display())]
    MissingInput(PathBuf),
    #[error(transparent)]
    Detector(#[from] DetectorError),
}

/// Lists image files under `root`, or `root` itself when it is a file.
/// Unreadable directory entries are reported as failures.
pub fn collect_image_files(root: &Path, config: &ScanConfig) -> (Vec<PathBuf>, Vec<FileFailure>) {
    if root.is_file() {
        return (vec![root.to_path_buf()], Vec::new());
    }

    let mut walker = WalkDir::new(root).sort_by_file_name();
    if !config.recursive {
        walker = walker.max_depth(1);
    }

    let mut files = Vec::new();
    let mut failures = Vec::new();
    for entry in walker {
        match entry {
            Ok(entry) => {
                let path = entry.path();
                if entry.file_type().is_file() && has_image_extension(path, &config.extensions) {
                    files.push(path.to_path_buf());
                }
            }
            Err(error) => {
                let path = error.path().map(Path::to_path_buf).unwrap_or_default();
                warn!(path = %path.display(), %error, "skipping unreadable entry");
                failures.push(FileFailure::new(path, FailureKind::FileRead, error));
            }
        }
    }
    (files, failures)
}

pub fn count_entries(root: &Path, config: &ScanConfig) -> u64 {
    collect_image_files(root, config).0.len() as u64
}

/// Runs the detection pass over `root`.
///
/// Every file is hashed; the detector is invoked once per distinct hash that
/// the cache does not already hold, and every file sharing that hash reuses
/// the result. Read and per-image detector failures are recorded in the
/// report, while a fatal detector error aborts the whole pass. When every
/// hash is cached the detector is never called.
pub fn process_images<D>(
    root: &Path,
    config: &ScanConfig,
    cache: &ResultCache,
    detector: &Mutex<D>,
    progress_bar: &ProgressBar,
) -> Result<(DetectionStore, ScanReport), ScanError>
where
    D: ObjectDetector + ?Sized,
{
    if !root.exists() {
        return Err(ScanError::MissingInput(root.to_path_buf()));
    }

    let (files, failures) = collect_image_files(root, config);
    info!(root = %root.display(), files = files.len(), "scanning images");
    detect_files(&files, failures, config, cache, detector, progress_bar)
}

/// Runs the detection pass over an explicit list of files, as
/// [`process_images`] does for a walked directory.
pub fn process_files<D>(
    files: &[PathBuf],
    config: &ScanConfig,
    cache: &ResultCache,
    detector: &Mutex<D>,
    progress_bar: &ProgressBar,
) -> Result<(DetectionStore, ScanReport), ScanError>
where
    D: ObjectDetector + ?Sized,
{
    detect_files(files, Vec::new(), config, cache, detector, progress_bar)
}

fn detect_files<D>(
    files: &[PathBuf],
    mut failures: Vec<FileFailure>,
    config: &ScanConfig,
    cache: &ResultCache,
    detector: &Mutex<D>,
    progress_bar: &ProgressBar,
) -> Result<(DetectionStore, ScanReport), ScanError>
where
    D: ObjectDetector + ?Sized,
{
    let scanned = files.len();
    progress_bar.set_length(scanned as u64);

    let hashed = match config.threading {
        ThreadingMode::Parallel => files
            .par_iter()
            .map(|path| hash_entry(path, progress_bar))
            .collect::<Vec<_>>(),
        ThreadingMode::Sequential => files
            .iter()
            .map(|path| hash_entry(path, progress_bar))
            .collect::<Vec<_>>(),
    };

    let mut by_hash: BTreeMap<ContentHash, Vec<PathBuf>> = BTreeMap::new();
    for (path, result) in hashed {
        match result {
            Ok(hash) => by_hash.entry(hash).or_default().push(path),
            Err(error) => {
                warn!(path = %path.display(), %error, "skipping unreadable file");
                failures.push(FileFailure::new(path, FailureKind::FileRead, error));
            }
        }
    }

    // One representative per uncached hash; duplicates ride on its result.
    let pending: Vec<(ContentHash, &Path)> = by_hash
        .iter()
        .filter(|(hash, _)| !cache.contains(**hash))
        .map(|(hash, paths)| (*hash, paths[0].as_path()))
        .collect();
    progress_bar.set_message(format!("Detecting objects in {} new images", pending.len()));

    let outcomes = match config.threading {
        ThreadingMode::Parallel => pending
            .par_iter()
            .map(|(hash, path)| (*hash, *path, run_detector(detector, path)))
            .collect::<Vec<_>>(),
        ThreadingMode::Sequential => pending
            .iter()
            .map(|(hash, path)| (*hash, *path, run_detector(detector, path)))
            .collect::<Vec<_>>(),
    };

    let mut detected = 0;
    for (hash, path, outcome) in outcomes {
        match outcome {
            Ok(detections) => {
                cache.store(hash, detections);
                detected += 1;
            }
            Err(error) if error.is_fatal() => return Err(ScanError::Detector(error)),
            Err(error) => {
                warn!(path = %path.display(), %error, "detector failed");
                for sibling in &by_hash[&hash] {
                    failures.push(FileFailure::new(
                        sibling.clone(),
                        FailureKind::DetectorInvocation,
                        &error,
                    ));
                }
            }
        }
    }

    let newly_detected: FxHashSet<ContentHash> = pending.iter().map(|(hash, _)| *hash).collect();
    let mut store = DetectionStore::new();
    let mut cache_hits = 0;
    for (hash, paths) in &by_hash {
        let newly_detected = newly_detected.contains(hash);
        for (index, path) in paths.iter().enumerate() {
            let Some(detections) = cache.lookup(*hash) else {
                continue;
            };
            if !newly_detected || index > 0 {
                cache_hits += 1;
                debug!(path = %path.display(), hash = %hash, "cache hit");
            }
            store.insert(ImageRecord::new(path.clone(), *hash, detections));
        }
    }

    let report = ScanReport {
        scanned,
        cache_hits,
        detected,
        failures,
    };
    info!(
        records = store.len(),
        cache_hits = report.cache_hits,
        detected = report.detected,
        failures = report.failures.len(),
        "detection pass complete"
    );
    Ok((store, report))
}

fn hash_entry(path: &Path, progress_bar: &ProgressBar) -> (PathBuf, io::Result<ContentHash>) {
    progress_bar.inc(1);
    progress_bar.set_message(format!("Hashing: {}", path.display()));
    // Snapshots and reports key records by UTF-8 path strings.
    let hash = if path.to_str().is_none() {
        Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "path is not valid UTF-8 and cannot be recorded",
        ))
    } else {
        compute_checksum(path)
    };
    (path.to_path_buf(), hash)
}

fn run_detector<D>(
    detector: &Mutex<D>,
    path: &Path,
) -> Result<Vec<Detection>, DetectorError>
where
    D: ObjectDetector + ?Sized,
{
    let mut guard = detector.lock().map_err(|_| DetectorError::Invocation {
        path: path.to_path_buf(),
        message: String::from("detector poisoned by an earlier panic"),
    })?;
    guard.detect(path)
}

pub fn has_image_extension(path: &Path, extensions: &[String]) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| {
            let lower = ext.to_lowercase();
            extensions.iter().any(|candidate| candidate == &lower)
        })
        .unwrap_or(false)
}

pub fn compute_checksum(path: &Path) -> io::Result<ContentHash> {
    let mut file = File::open(path)?;
    let mut hasher = XxHash64::default();
    let mut buffer = [0; 8192];

    loop {
        let count = file.read(&mut buffer)?;
        if count == 0 {
            break;
        }
        hasher.write(&buffer[..count]);
    }

    Ok(ContentHash(hasher.finish()))
}
