//! Run configuration, loaded from `kestrel.toml`.
//!
//! ```toml
//! image_dir = "img"
//! results_dir = "results"
//! confidence_threshold = 0.5
//! operation = "move"
//!
//! [detector]
//! model_path = "models/yolo11x.onnx"
//! ```

use crate::detector::DetectorConfig;
use crate::operations::Operation;
use crate::scanner::{default_extensions, ScanConfig, ThreadingMode};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::debug;

pub const DEFAULT_CONFIG_FILE: &str = "kestrel.toml";

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct KestrelConfig {
    pub image_dir: PathBuf,
    pub results_dir: PathBuf,
    pub archive_path: PathBuf,
    /// Image extensions to scan, without the dot; matched case-insensitively.
    pub extensions: Vec<String>,
    pub recursive: bool,
    pub threading: ThreadingMode,
    /// Detections below this confidence are ignored when grouping.
    pub confidence_threshold: f32,
    /// Folder for images left without labels; none when unset.
    pub unclassified_label: Option<String>,
    pub operation: Operation,
    pub detector: DetectorConfig,
}

impl Default for KestrelConfig {
    fn default() -> Self {
        Self {
            image_dir: PathBuf::from("img"),
            results_dir: PathBuf::from("results"),
            archive_path: PathBuf::from("data.tar.zst"),
            extensions: default_extensions(),
            recursive: true,
            threading: ThreadingMode::Parallel,
            confidence_threshold: 0.0,
            unclassified_label: None,
            operation: Operation::Move,
            detector: DetectorConfig::default(),
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("config file not found: {}", path.display())]
    NotFound { path: PathBuf },
    #[error("failed to access config {}: {source}", path.display())]
    Io {
        #[source]
        source: std::io::Error,
        path: PathBuf,
    },
    #[error("invalid config TOML in {}: {source}", path.display())]
    Parse {
        #[source]
        source: toml::de::Error,
        path: PathBuf,
    },
    #[error("failed to serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
}

impl KestrelConfig {
    /// Loads and validates the configuration at `path`.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(ConfigError::NotFound {
                path: path.to_path_buf(),
            });
        }
        let content = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            source,
            path: path.to_path_buf(),
        })?;
        let config: Self = toml::from_str(&content).map_err(|source| ConfigError::Parse {
            source,
            path: path.to_path_buf(),
        })?;
        config.validate()?;
        debug!(path = %path.display(), "configuration loaded");
        Ok(config)
    }

    /// Tries `kestrel.toml` in the working directory, then the per-user data
    /// directory. Only a missing file falls through; a broken one is an error.
    pub fn load_or_default() -> Result<Self, ConfigError> {
        let mut candidates = vec![PathBuf::from(DEFAULT_CONFIG_FILE)];
        if let Some(path) = user_config_path() {
            candidates.push(path);
        }
        for candidate in candidates {
            match Self::load(&candidate) {
                Err(ConfigError::NotFound { .. }) => continue,
                other => return other,
            }
        }
        Ok(Self::default())
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), ConfigError> {
        let path = path.as_ref();
        let content = toml::to_string_pretty(self)?;
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(|source| ConfigError::Io {
                source,
                path: parent.to_path_buf(),
            })?;
        }
        fs::write(path, content).map_err(|source| ConfigError::Io {
            source,
            path: path.to_path_buf(),
        })
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        for (name, value) in [
            ("confidence_threshold", self.confidence_threshold),
            ("detector.score_threshold", self.detector.score_threshold),
            ("detector.iou_threshold", self.detector.iou_threshold),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return Err(ConfigError::Invalid(format!(
                    "{name} must be within 0..=1, got {value}"
                )));
            }
        }
        if self.extensions.iter().all(|ext| ext.trim().is_empty()) {
            return Err(ConfigError::Invalid(String::from(
                "extensions must name at least one file type",
            )));
        }
        if self.detector.input_size == 0 {
            return Err(ConfigError::Invalid(String::from(
                "detector.input_size must be positive",
            )));
        }
        Ok(())
    }

    pub fn scan_config(&self) -> ScanConfig {
        ScanConfig::new(self.extensions.clone(), self.threading).with_recursion(self.recursive)
    }

    pub fn layout(&self) -> ResultsLayout {
        ResultsLayout::new(&self.results_dir)
    }
}

fn user_config_path() -> Option<PathBuf> {
    dirs::data_local_dir().map(|mut path| {
        path.push("Kestrel");
        path.push(DEFAULT_CONFIG_FILE);
        path
    })
}

/// Where each step reads and writes inside the results directory.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ResultsLayout {
    root: PathBuf,
}

impl ResultsLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Binary detection snapshot.
    pub fn snapshot(&self) -> PathBuf {
        self.root.join("detections.bin")
    }

    pub fn detections_json(&self) -> PathBuf {
        self.root.join("detections.json")
    }

    /// Classification report.
    pub fn report(&self) -> PathBuf {
        self.root.join("processed.json")
    }

    /// Root of the label folders.
    pub fn organized_dir(&self) -> PathBuf {
        self.root.join("processed_images")
    }
}
