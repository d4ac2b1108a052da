//! Bundling of the image and results directories into one `.tar.zst`, and
//! removal of directories only once they are known to be archived.

use std::collections::{BTreeMap, BTreeSet};
use std::fs::{self, File};
use std::io::{self, BufReader};
use std::path::{Component, Path, PathBuf};
use tar::{Archive, Builder};
use thiserror::Error;
use tracing::{debug, info, warn};
use walkdir::WalkDir;
use zstd::stream::{read::Decoder as ZstdDecoder, write::Encoder as ZstdEncoder};

const COMPRESSION_LEVEL: i32 = 3;

/// Proof that an archive exists and which top-level directories it holds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveReceipt {
    pub archive: PathBuf,
    /// Base names of the archived directories.
    pub roots: BTreeSet<String>,
    /// Canonical path of each directory written, mapped to its root name.
    /// Empty for a receipt read back with [`ArchiveReceipt::verify`], which
    /// can only match directories by base name.
    pub sources: BTreeMap<PathBuf, String>,
    /// Archive paths of the regular files stored.
    pub entries: BTreeSet<PathBuf>,
}

impl ArchiveReceipt {
    /// Reads an existing archive back and describes what it contains.
    pub fn verify(archive: impl AsRef<Path>) -> Result<Self, ArchiveError> {
        let archive = archive.as_ref();
        let mut roots = BTreeSet::new();
        let mut entries = BTreeSet::new();
        for (path, is_file) in read_entries(archive)? {
            if let Some(Component::Normal(root)) = path.components().next() {
                roots.insert(root.to_string_lossy().into_owned());
            }
            if is_file {
                entries.insert(path);
            }
        }
        Ok(Self {
            archive: archive.to_path_buf(),
            roots,
            sources: BTreeMap::new(),
            entries,
        })
    }

    pub fn files(&self) -> usize {
        self.entries.len()
    }

    pub fn contains_root(&self, dir: &Path) -> bool {
        self.root_for(dir).is_some()
    }

    /// Name `dir` was stored under. A receipt from [`archive`] matches the
    /// exact directory; a verified one falls back to the base name.
    fn root_for(&self, dir: &Path) -> Option<String> {
        if self.sources.is_empty() {
            return root_name(dir).filter(|name| self.roots.contains(name));
        }
        let canonical = fs::canonicalize(dir).ok()?;
        self.sources.get(&canonical).cloned()
    }
}

#[derive(Debug, Error)]
pub enum ArchiveError {
    #[error("nothing to archive: none of the given paths is a directory")]
    Empty,
    #[error("failed to write archive {}: {source}", path.display())]
    Io {
        #[source]
        source: io::Error,
        path: PathBuf,
    },
    #[error("cannot read archive {}: {source}", path.display())]
    Verify {
        #[source]
        source: io::Error,
        path: PathBuf,
    },
}

#[derive(Debug, Error)]
pub enum CleanupError {
    #[error("{} is not part of archive {}; refusing to delete it", path.display(), archive.display())]
    NotArchived { path: PathBuf, archive: PathBuf },
    #[error("archive {} no longer exists; refusing to delete {}", archive.display(), path.display())]
    ArchiveMissing { path: PathBuf, archive: PathBuf },
    #[error("archive {} lies inside {}; refusing to delete it", archive.display(), path.display())]
    ArchiveInsideTarget { path: PathBuf, archive: PathBuf },
    #[error("{} is not in archive {}; refusing to delete {}", missing.display(), archive.display(), path.display())]
    Unarchived {
        path: PathBuf,
        missing: PathBuf,
        archive: PathBuf,
    },
    #[error("failed to delete {}: {source}", path.display())]
    Io {
        #[source]
        source: io::Error,
        path: PathBuf,
    },
}

/// Writes `dirs` into a zstd-compressed tar at `output`, each directory under
/// its own base name. Paths that are not directories are skipped. A partial
/// archive is removed on failure.
pub fn archive(dirs: &[PathBuf], output: &Path) -> Result<ArchiveReceipt, ArchiveError> {
    let sources: Vec<(&Path, String)> = dirs
        .iter()
        .filter_map(|dir| {
            if !dir.is_dir() {
                warn!(path = %dir.display(), "not a directory, skipping");
                return None;
            }
            root_name(dir).map(|name| (dir.as_path(), name))
        })
        .collect();
    if sources.is_empty() {
        return Err(ArchiveError::Empty);
    }

    if let Some(parent) = output.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent).map_err(|source| ArchiveError::Io {
            source,
            path: parent.to_path_buf(),
        })?;
    }

    match write_archive(&sources, output) {
        Ok(receipt) => {
            info!(
                path = %output.display(),
                files = receipt.files(),
                roots = receipt.roots.len(),
                "archive written"
            );
            Ok(receipt)
        }
        Err(source) => {
            let _ = fs::remove_file(output);
            Err(ArchiveError::Io {
                source,
                path: output.to_path_buf(),
            })
        }
    }
}

fn write_archive(sources: &[(&Path, String)], output: &Path) -> io::Result<ArchiveReceipt> {
    let out = File::create(output)?;
    let output_canonical = fs::canonicalize(output)?;
    let encoder = ZstdEncoder::new(out, COMPRESSION_LEVEL)?;
    let mut tar = Builder::new(encoder);

    let mut roots = BTreeSet::new();
    let mut written = BTreeMap::new();
    let mut entries = BTreeSet::new();
    for (dir, name) in sources {
        let dir_canonical = fs::canonicalize(dir)?;
        for entry in WalkDir::new(dir).sort_by_file_name() {
            let entry = entry.map_err(io::Error::from)?;
            let relative = entry
                .path()
                .strip_prefix(dir)
                .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
            if dir_canonical.join(relative) == output_canonical {
                debug!(path = %entry.path().display(), "skipping the archive itself");
                continue;
            }
            let entry_name = Path::new(name).join(relative);
            let file_type = entry.file_type();
            if file_type.is_dir() {
                tar.append_dir(&entry_name, entry.path())?;
            } else if file_type.is_file() {
                tar.append_path_with_name(entry.path(), &entry_name)?;
                entries.insert(entry_name);
            } else {
                debug!(path = %entry.path().display(), "skipping non-regular file");
            }
        }
        roots.insert(name.clone());
        written.insert(dir_canonical, name.clone());
    }

    let encoder = tar.into_inner()?;
    encoder.finish()?;

    Ok(ArchiveReceipt {
        archive: output.to_path_buf(),
        roots,
        sources: written,
        entries,
    })
}

/// Deletes `dir` if `receipt` shows it was archived and the archive is still
/// on disk.
///
/// Nothing is removed when the archive itself sits inside `dir`, or when
/// `dir` holds a regular file the archive does not contain.
pub fn cleanup(dir: &Path, receipt: &ArchiveReceipt) -> Result<(), CleanupError> {
    if !dir.exists() {
        debug!(path = %dir.display(), "already removed");
        return Ok(());
    }
    let Some(root) = receipt.root_for(dir) else {
        return Err(CleanupError::NotArchived {
            path: dir.to_path_buf(),
            archive: receipt.archive.clone(),
        });
    };
    if !receipt.archive.is_file() {
        return Err(CleanupError::ArchiveMissing {
            path: dir.to_path_buf(),
            archive: receipt.archive.clone(),
        });
    }

    let io_error = |source: io::Error, path: &Path| CleanupError::Io {
        source,
        path: path.to_path_buf(),
    };
    let dir_canonical = fs::canonicalize(dir).map_err(|e| io_error(e, dir))?;
    let archive_canonical =
        fs::canonicalize(&receipt.archive).map_err(|e| io_error(e, &receipt.archive))?;
    if archive_canonical.starts_with(&dir_canonical) {
        return Err(CleanupError::ArchiveInsideTarget {
            path: dir.to_path_buf(),
            archive: receipt.archive.clone(),
        });
    }

    for entry in WalkDir::new(dir) {
        let entry = entry.map_err(|e| io_error(e.into(), dir))?;
        if !entry.file_type().is_file() {
            continue;
        }
        let Ok(relative) = entry.path().strip_prefix(dir) else {
            continue;
        };
        if !receipt.entries.contains(&Path::new(&root).join(relative)) {
            return Err(CleanupError::Unarchived {
                path: dir.to_path_buf(),
                missing: entry.path().to_path_buf(),
                archive: receipt.archive.clone(),
            });
        }
    }

    fs::remove_dir_all(dir).map_err(|e| io_error(e, dir))?;
    info!(path = %dir.display(), "directory removed after archiving");
    Ok(())
}

/// Regular files stored in `archive`, in archive order.
pub fn list_entries(archive: &Path) -> Result<Vec<PathBuf>, ArchiveError> {
    Ok(read_entries(archive)?
        .into_iter()
        .filter_map(|(path, is_file)| is_file.then_some(path))
        .collect())
}

/// Unpacks `archive` into `destination`, recreating the archived directories.
pub fn extract(archive: &Path, destination: &Path) -> Result<(), ArchiveError> {
    let verify_error = |source| ArchiveError::Verify {
        source,
        path: archive.to_path_buf(),
    };
    fs::create_dir_all(destination).map_err(|source| ArchiveError::Io {
        source,
        path: destination.to_path_buf(),
    })?;
    open(archive)
        .and_then(|mut tar| tar.unpack(destination))
        .map_err(verify_error)?;
    info!(archive = %archive.display(), destination = %destination.display(), "archive extracted");
    Ok(())
}

fn open(archive: &Path) -> io::Result<Archive<ZstdDecoder<'static, BufReader<File>>>> {
    let file = File::open(archive)?;
    Ok(Archive::new(ZstdDecoder::new(file)?))
}

fn read_entries(archive: &Path) -> Result<Vec<(PathBuf, bool)>, ArchiveError> {
    let read = || -> io::Result<Vec<(PathBuf, bool)>> {
        let mut tar = open(archive)?;
        let mut entries = Vec::new();
        for entry in tar.entries()? {
            let entry = entry?;
            let is_file = entry.header().entry_type().is_file();
            entries.push((entry.path()?.into_owned(), is_file));
        }
        Ok(entries)
    };
    read().map_err(|source| ArchiveError::Verify {
        source,
        path: archive.to_path_buf(),
    })
}

fn root_name(dir: &Path) -> Option<String> {
    dir.file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .or_else(|| {
            fs::canonicalize(dir)
                .ok()?
                .file_name()
                .map(|name| name.to_string_lossy().into_owned())
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn populated(root: &Path, name: &str, files: &[&str]) -> PathBuf {
        let dir = root.join(name);
        for file in files {
            let path = dir.join(file);
            fs::create_dir_all(path.parent().unwrap()).unwrap();
            fs::write(&path, file.as_bytes()).unwrap();
        }
        dir
    }

    #[test]
    fn archive_then_cleanup_keeps_every_file() {
        let work = tempdir().unwrap();
        let img = populated(work.path(), "img", &["a.jpg", "b.png", "nested/c.jpg"]);
        let output = work.path().join("out").join("data.tar.zst");

        let receipt = archive(&[img.clone()], &output).unwrap();
        assert_eq!(receipt.files(), 3);
        cleanup(&img, &receipt).unwrap();
        assert!(!img.exists());

        let entries = list_entries(&output).unwrap();
        assert_eq!(
            entries,
            vec![
                PathBuf::from("img/a.jpg"),
                PathBuf::from("img/b.png"),
                PathBuf::from("img/nested/c.jpg"),
            ]
        );
    }

    #[test]
    fn stores_each_directory_under_its_name_and_extracts() {
        let work = tempdir().unwrap();
        let img = populated(work.path(), "img", &["a.jpg"]);
        let results = populated(work.path(), "results", &["processed.json"]);
        let output = work.path().join("data.tar.zst");

        let receipt = archive(&[img, results], &output).unwrap();
        assert_eq!(
            receipt.roots.iter().map(String::as_str).collect::<Vec<_>>(),
            vec!["img", "results"]
        );
        let verified = ArchiveReceipt::verify(&output).unwrap();
        assert_eq!(verified.roots, receipt.roots);
        assert_eq!(verified.entries, receipt.entries);
        assert!(verified.sources.is_empty());

        let restored = work.path().join("restored");
        extract(&output, &restored).unwrap();
        assert_eq!(fs::read(restored.join("img/a.jpg")).unwrap(), b"a.jpg");
        assert_eq!(
            fs::read(restored.join("results/processed.json")).unwrap(),
            b"processed.json"
        );
    }

    #[test]
    fn archive_inside_an_archived_directory_is_not_stored() {
        let work = tempdir().unwrap();
        let results = populated(work.path(), "results", &["detections.bin"]);
        let output = results.join("data.tar.zst");

        let receipt = archive(&[results], &output).unwrap();
        assert_eq!(receipt.files(), 1);
        assert_eq!(
            list_entries(&output).unwrap(),
            vec![PathBuf::from("results/detections.bin")]
        );
    }

    #[test]
    fn non_directories_are_skipped_and_nothing_left_is_an_error() {
        let work = tempdir().unwrap();
        let file = work.path().join("loose.jpg");
        fs::write(&file, b"x").unwrap();
        let output = work.path().join("data.tar.zst");

        let err = archive(&[file, work.path().join("absent")], &output).unwrap_err();
        assert!(matches!(err, ArchiveError::Empty));
        assert!(!output.exists());
    }

    #[test]
    fn cleanup_requires_a_matching_receipt() {
        let work = tempdir().unwrap();
        let img = populated(work.path(), "img", &["a.jpg"]);
        let other = populated(work.path(), "other", &["b.jpg"]);
        let output = work.path().join("data.tar.zst");
        let receipt = archive(&[img.clone()], &output).unwrap();

        let err = cleanup(&other, &receipt).unwrap_err();
        assert!(matches!(err, CleanupError::NotArchived { .. }));
        assert!(other.exists());

        fs::remove_file(&output).unwrap();
        let err = cleanup(&img, &receipt).unwrap_err();
        assert!(matches!(err, CleanupError::ArchiveMissing { .. }));
        assert!(img.exists());
    }

    #[test]
    fn cleanup_refuses_when_the_archive_lives_in_the_directory() {
        let work = tempdir().unwrap();
        let results = populated(work.path(), "results", &["detections.bin"]);
        let output = results.join("data.tar.zst");
        let receipt = archive(&[results.clone()], &output).unwrap();

        let err = cleanup(&results, &receipt).unwrap_err();
        assert!(matches!(err, CleanupError::ArchiveInsideTarget { .. }));
        assert!(output.is_file());
        assert!(results.join("detections.bin").is_file());

        let verified = ArchiveReceipt::verify(&output).unwrap();
        assert!(matches!(
            cleanup(&results, &verified),
            Err(CleanupError::ArchiveInsideTarget { .. })
        ));
        assert!(output.is_file());
    }

    #[test]
    fn receipt_only_covers_the_directory_it_archived() {
        let work = tempdir().unwrap();
        let archived = populated(&work.path().join("first"), "results", &["a.json"]);
        let unrelated = populated(&work.path().join("second"), "results", &["b.json"]);
        let output = work.path().join("data.tar.zst");
        let receipt = archive(&[archived.clone()], &output).unwrap();

        let err = cleanup(&unrelated, &receipt).unwrap_err();
        assert!(matches!(err, CleanupError::NotArchived { .. }));
        assert!(unrelated.join("b.json").is_file());

        // A re-read receipt only knows base names, but the stored file list
        // still rejects a directory whose contents differ.
        let verified = ArchiveReceipt::verify(&output).unwrap();
        let err = cleanup(&unrelated, &verified).unwrap_err();
        assert!(matches!(err, CleanupError::Unarchived { .. }));
        assert!(unrelated.join("b.json").is_file());

        cleanup(&archived, &verified).unwrap();
        assert!(!archived.exists());
    }

    #[test]
    fn files_added_after_archiving_block_cleanup() {
        let work = tempdir().unwrap();
        let img = populated(work.path(), "img", &["a.jpg"]);
        let output = work.path().join("data.tar.zst");
        let receipt = archive(&[img.clone()], &output).unwrap();

        fs::write(img.join("late.jpg"), b"late").unwrap();
        let err = cleanup(&img, &receipt).unwrap_err();
        assert!(matches!(err, CleanupError::Unarchived { ref missing, .. } if missing.ends_with("late.jpg")));
        assert!(img.join("a.jpg").is_file());
    }

    #[test]
    fn verify_rejects_garbage() {
        let work = tempdir().unwrap();
        let bogus = work.path().join("data.tar.zst");
        fs::write(&bogus, b"not an archive").unwrap();
        assert!(matches!(
            ArchiveReceipt::verify(&bogus),
            Err(ArchiveError::Verify { .. })
        ));
        assert!(matches!(
            ArchiveReceipt::verify(work.path().join("missing.tar.zst")),
            Err(ArchiveError::Verify { .. })
        ));
    }
}
