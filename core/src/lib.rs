//! Core batch classification engine for Kestrel.
//!
//! The pipeline runs an object detector over a folder of images, memoising
//! results by content hash, then groups the images by detected class,
//! organizes them into label folders and archives the run. Every stage is a
//! plain function over explicit configuration, so the CLI can run any subset
//! of them in order.

pub mod archive;
pub mod cache;
pub mod classify;
pub mod config;
pub mod detector;
pub mod operations;
pub mod progress;
pub mod reporting;
pub mod scanner;
pub mod store;

pub use archive::{archive, cleanup, extract, list_entries, ArchiveError, ArchiveReceipt, CleanupError};
pub use cache::ResultCache;
pub use classify::{group, labels_for, ClassificationIndex};
pub use config::{ConfigError, KestrelConfig, ResultsLayout, DEFAULT_CONFIG_FILE};
pub use detector::{
    BoundingBox, Detection, DetectorConfig, DetectorError, LazyDetector, ObjectDetector,
};
pub use operations::{organize, Operation, OrganizeError, OrganizeStats};
pub use reporting::{
    print_index, print_records, print_scan_report, ClassificationReport, ReportError,
};
pub use scanner::{
    compute_checksum, count_entries, process_files, process_images, ContentHash, FailureKind,
    FileFailure, ScanConfig, ScanError, ScanReport, ThreadingMode,
};
pub use store::{DetectionStore, ImageRecord, StoreLoadError, StoreSaveError};

#[cfg(feature = "onnx")]
pub use detector::{init_ort_runtime, YoloDetector};
