use crate::classify::ClassificationIndex;
use crate::scanner::{FailureKind, FileFailure};
use indicatif::ProgressBar;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt::{Display, Formatter};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Operation {
    /// Each file ends up in exactly one label folder.
    #[default]
    Move,
    /// Each file is duplicated into every label folder it belongs to.
    Copy,
}

impl Display for Operation {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Move => f.write_str("move"),
            Self::Copy => f.write_str("copy"),
        }
    }
}

#[derive(Debug)]
pub struct OrganizeStats {
    pub operation: Operation,
    /// Files written into label folders.
    pub placed: usize,
    /// Label → destinations written under it.
    pub placements: BTreeMap<String, Vec<PathBuf>>,
    pub failures: Vec<FileFailure>,
}

#[derive(Debug, Error)]
pub enum OrganizeError {
    #[error("failed to create {}: {source}", path.display())]
    CreateDir {
        #[source]
        source: io::Error,
        path: PathBuf,
    },
}

/// Places every file of `index` under `dest_root/<label>`.
///
/// Under [`Operation::Move`] a multi-labelled file goes to its first label in
/// index order and is skipped under the rest. Per-file problems, including a
/// label folder that cannot be created, are recorded in the returned stats;
/// only an unusable `dest_root` aborts.
pub fn organize(
    index: &ClassificationIndex,
    source_dir: &Path,
    dest_root: &Path,
    operation: Operation,
    progress_bar: &ProgressBar,
) -> Result<OrganizeStats, OrganizeError> {
    let total: usize = index.iter().map(|(_, files)| files.len()).sum();
    progress_bar.set_length(total as u64);

    let mut stats = OrganizeStats {
        operation,
        placed: 0,
        placements: BTreeMap::new(),
        failures: Vec::new(),
    };
    let mut handled: BTreeSet<&Path> = BTreeSet::new();

    fs::create_dir_all(dest_root).map_err(|source| OrganizeError::CreateDir {
        source,
        path: dest_root.to_path_buf(),
    })?;

    for (label, files) in index {
        let folder = dest_root.join(folder_name(label));
        let folder_error = fs::create_dir_all(&folder).err();
        if let Some(error) = &folder_error {
            warn!(path = %folder.display(), label = %label, %error, "cannot create label folder");
        }

        for file in files {
            progress_bar.inc(1);
            if operation == Operation::Move && !handled.insert(file.as_path()) {
                debug!(path = %file.display(), label = %label, "already moved under an earlier label");
                continue;
            }

            let source = resolve_source(source_dir, file);
            if let Some(error) = &folder_error {
                stats.failures.push(FileFailure::new(
                    source,
                    FailureKind::FileWrite,
                    format!("cannot create {}: {error}", folder.display()),
                ));
                continue;
            }
            match place(&source, &folder, operation) {
                Ok(destination) => {
                    progress_bar.set_message(format!("{}: {}", operation, destination.display()));
                    stats.placed += 1;
                    stats
                        .placements
                        .entry(label.clone())
                        .or_default()
                        .push(destination);
                }
                Err(error) => {
                    warn!(path = %source.display(), label = %label, %error, "failed to place file");
                    stats
                        .failures
                        .push(FileFailure::new(source, FailureKind::FileWrite, error));
                }
            }
        }
    }

    progress_bar.finish_with_message("File organizing complete");
    info!(
        %operation,
        placed = stats.placed,
        failed = stats.failures.len(),
        "files organized"
    );
    Ok(stats)
}

/// Folder name for `label`, with path separators and dot-only names replaced
/// so the folder always stays directly under the destination root.
pub fn folder_name(label: &str) -> String {
    let name: String = label
        .chars()
        .map(|c| if c == '/' || c == '\\' || c == '\0' { '_' } else { c })
        .collect();
    match name.trim() {
        "" | "." | ".." => String::from("_"),
        _ => name,
    }
}

fn resolve_source(source_dir: &Path, file: &Path) -> PathBuf {
    if file.is_relative() && !file.exists() {
        let candidate = source_dir.join(file);
        if candidate.exists() {
            return candidate;
        }
    }
    file.to_path_buf()
}

fn place(source: &Path, folder: &Path, operation: Operation) -> io::Result<PathBuf> {
    if !source.is_file() {
        return Err(io::Error::new(
            io::ErrorKind::NotFound,
            format!("source file {} not found", source.display()),
        ));
    }
    let destination = resolve_destination(folder, source)?;
    match operation {
        Operation::Copy => {
            fs::copy(source, &destination)?;
        }
        Operation::Move => move_file(source, &destination)?,
    }
    Ok(destination)
}

fn move_file(source: &Path, destination: &Path) -> io::Result<()> {
    match fs::rename(source, destination) {
        Ok(()) => Ok(()),
        Err(rename_error) => {
            // Rename cannot cross filesystems; fall back to copy + remove.
            debug!(path = %source.display(), %rename_error, "rename failed, copying instead");
            fs::copy(source, destination)?;
            fs::remove_file(source).map_err(|error| {
                let _ = fs::remove_file(destination);
                error
            })
        }
    }
}

fn resolve_destination(target_directory: &Path, source: &Path) -> io::Result<PathBuf> {
    let file_name = source.file_name().ok_or_else(|| {
        io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("file name not found for {}", source.display()),
        )
    })?;

    let mut candidate = target_directory.join(file_name);
    if !candidate.exists() {
        return Ok(candidate);
    }

    let stem = source
        .file_stem()
        .map(|stem| stem.to_string_lossy().into_owned())
        .unwrap_or_else(|| String::from("file"));
    let extension = source.extension().map(|ext| ext.to_string_lossy());
    let mut index = 1;

    loop {
        let mut name = format!("{} ({})", stem, index);
        if let Some(ext) = &extension {
            name.push('.');
            name.push_str(ext);
        }
        candidate = target_directory.join(name);
        if !candidate.exists() {
            return Ok(candidate);
        }
        index += 1;
    }
}
