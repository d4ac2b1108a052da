use crate::classify::ClassificationIndex;
use crate::detector::Detection;
use crate::scanner::ScanReport;
use crate::store::DetectionStore;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::info;

/// One file under a label in the classification report.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LabelledFile {
    pub path: PathBuf,
    pub hash: String,
    /// Best surviving confidence for the label in this file; 0 for the
    /// unclassified bucket.
    pub confidence: f32,
    /// Surviving detections of the label in this file.
    pub count: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ReportMetadata {
    pub all_files: Vec<PathBuf>,
    pub duplicates: Vec<Vec<PathBuf>>,
    pub folder_names: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unclassified: Option<String>,
}

/// Contents of `processed.json`: the grouping outcome plus file metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassificationReport {
    pub threshold: f32,
    pub labels: BTreeMap<String, Vec<LabelledFile>>,
    pub metadata: ReportMetadata,
}

impl ClassificationReport {
    /// Describes `index`, which must have been grouped from `store` with the
    /// same `threshold`. `unclassified` names the catch-all label, if any.
    pub fn build(
        store: &DetectionStore,
        index: &ClassificationIndex,
        threshold: f32,
        unclassified: Option<&str>,
    ) -> Self {
        let mut labels = BTreeMap::new();
        for (label, files) in index {
            let entries = files
                .iter()
                .filter_map(|path| store.get(path))
                .map(|record| {
                    let matching: Vec<&Detection> = record
                        .detections
                        .iter()
                        .filter(|d| d.confidence >= threshold && &d.label == label)
                        .collect();
                    LabelledFile {
                        path: record.path.clone(),
                        hash: record.hash.to_string(),
                        confidence: matching
                            .iter()
                            .map(|d| d.confidence)
                            .fold(0.0, f32::max),
                        count: matching.len(),
                    }
                })
                .collect();
            labels.insert(label.clone(), entries);
        }

        Self {
            threshold,
            labels,
            metadata: ReportMetadata {
                all_files: store.iter().map(|record| record.path.clone()).collect(),
                duplicates: store.duplicates(),
                folder_names: index.labels().map(str::to_string).collect(),
                unclassified: unclassified.map(str::to_string),
            },
        }
    }

    pub fn to_index(&self) -> ClassificationIndex {
        ClassificationIndex::from_groups(self.labels.iter().map(|(label, files)| {
            (
                label.clone(),
                files.iter().map(|file| file.path.clone()).collect::<Vec<_>>(),
            )
        }))
    }

    pub fn write(&self, path: &Path) -> Result<(), ReportError> {
        write_pretty(self, path)?;
        info!(path = %path.display(), labels = self.labels.len(), "classification report written");
        Ok(())
    }

    /// Reads `processed.json`; a missing file means classification has not
    /// run yet.
    pub fn read(path: &Path) -> Result<Self, ReportError> {
        let file = File::open(path).map_err(|source| {
            if source.kind() == std::io::ErrorKind::NotFound {
                ReportError::Missing {
                    path: path.to_path_buf(),
                }
            } else {
                ReportError::Io {
                    source,
                    path: path.to_path_buf(),
                }
            }
        })?;
        serde_json::from_reader(BufReader::new(file)).map_err(ReportError::Serialization)
    }
}

#[derive(Debug, Error)]
pub enum ReportError {
    #[error("io error for {}: {source}", path.display())]
    Io {
        #[source]
        source: std::io::Error,
        path: PathBuf,
    },
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("no classification report at {}; run process-json first", path.display())]
    Missing { path: PathBuf },
}

/// Writes the detection export. Keys are the lossy string form of each path,
/// sorted, so repeated exports of one store are byte-identical.
pub fn write_detections_json(store: &DetectionStore, output_path: &Path) -> Result<(), ReportError> {
    let entries: BTreeMap<String, &Vec<Detection>> = store
        .iter()
        .map(|record| (record.path.to_string_lossy().into_owned(), &record.detections))
        .collect();
    write_pretty(&entries, output_path)?;
    info!(path = %output_path.display(), records = entries.len(), "detections exported");
    Ok(())
}

fn write_pretty<T: Serialize + ?Sized>(value: &T, output_path: &Path) -> Result<(), ReportError> {
    if let Some(parent) = output_path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent).map_err(|source| ReportError::Io {
            source,
            path: parent.to_path_buf(),
        })?;
    }
    let file = File::create(output_path).map_err(|source| ReportError::Io {
        source,
        path: output_path.to_path_buf(),
    })?;
    let mut writer = BufWriter::new(file);
    serde_json::to_writer_pretty(&mut writer, value)?;
    writer.flush().map_err(|source| ReportError::Io {
        source,
        path: output_path.to_path_buf(),
    })
}

pub fn print_records(store: &DetectionStore) {
    for record in store {
        println!("{} [{}]", record.path.display(), record.hash);
        if record.detections.is_empty() {
            println!("  (no detections)");
        }
        for detection in &record.detections {
            let b = detection.bounding_box;
            println!(
                "  {:<16} {:.2}  [{:.1}, {:.1}, {:.1}, {:.1}]",
                detection.label, detection.confidence, b.x1, b.y1, b.x2, b.y2
            );
        }
    }
}

pub fn print_scan_report(report: &ScanReport) {
    println!(
        "Scanned {} images: {} from cache, {} detected, {} failed",
        report.scanned,
        report.cache_hits,
        report.detected,
        report.failures.len()
    );
    for failure in &report.failures {
        println!(
            "  {} error: {}: {}",
            failure.kind,
            failure.path.display(),
            failure.message
        );
    }
}

pub fn print_index(index: &ClassificationIndex) {
    for (label, files) in index {
        println!("{} ({})", label, files.len());
        for file in files {
            println!("  {}", file.display());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classify::group;
    use crate::detector::BoundingBox;
    use crate::scanner::ContentHash;
    use crate::store::ImageRecord;
    use tempfile::tempdir;

    fn store() -> DetectionStore {
        DetectionStore::from_records(vec![
            ImageRecord::new(
                PathBuf::from("img/pets.jpg"),
                ContentHash(0xabc),
                vec![
                    Detection::new("cat", 0.9, BoundingBox::new(1.0, 2.0, 3.0, 4.0)),
                    Detection::new("cat", 0.6, BoundingBox::new(5.0, 5.0, 9.0, 9.0)),
                    Detection::new("dog", 0.3, BoundingBox::new(0.0, 0.0, 2.0, 2.0)),
                ],
            ),
            ImageRecord::new(PathBuf::from("img/copy.jpg"), ContentHash(0xabc), vec![
                Detection::new("cat", 0.9, BoundingBox::new(1.0, 2.0, 3.0, 4.0)),
            ]),
            ImageRecord::new(PathBuf::from("img/blank.jpg"), ContentHash(0xdef), Vec::new()),
        ])
    }

    #[test]
    fn export_uses_documented_shape_and_is_deterministic() {
        let dir = tempdir().unwrap();
        let first = dir.path().join("detections.json");
        let second = dir.path().join("again.json");
        let store = store();
        store.export_json(&first).unwrap();
        store.export_json(&second).unwrap();
        let first_bytes = fs::read(&first).unwrap();
        assert_eq!(first_bytes, fs::read(&second).unwrap());

        let value: serde_json::Value = serde_json::from_slice(&first_bytes).unwrap();
        let keys: Vec<_> = value.as_object().unwrap().keys().cloned().collect();
        assert_eq!(keys, vec!["img/blank.jpg", "img/copy.jpg", "img/pets.jpg"]);
        let pets = &value["img/pets.jpg"];
        assert_eq!(pets.as_array().unwrap().len(), 3);
        assert_eq!(pets[0]["class"], "cat");
        assert_eq!(pets[0]["box"], serde_json::json!([1.0, 2.0, 3.0, 4.0]));
        assert!((pets[2]["confidence"].as_f64().unwrap() - 0.3).abs() < 1e-6);
        assert_eq!(value["img/blank.jpg"], serde_json::json!([]));
    }

    #[test]
    fn report_summarises_labels_and_metadata() {
        let store = store();
        let mut index = group(&store, 0.5);
        index.include_unclassified(&store, 0.5, "others");
        let report = ClassificationReport::build(&store, &index, 0.5, Some("others"));

        assert_eq!(
            report.metadata.folder_names,
            vec!["cat".to_string(), "others".to_string()]
        );
        let cats = &report.labels["cat"];
        assert_eq!(cats.len(), 2);
        let pets = cats.iter().find(|f| f.path.ends_with("pets.jpg")).unwrap();
        assert_eq!(pets.count, 2);
        assert!((pets.confidence - 0.9).abs() < 1e-6);
        assert_eq!(pets.hash, "0000000000000abc");
        assert_eq!(report.labels["others"][0].count, 0);
        assert_eq!(report.metadata.all_files.len(), 3);
        assert_eq!(
            report.metadata.duplicates,
            vec![vec![PathBuf::from("img/copy.jpg"), PathBuf::from("img/pets.jpg")]]
        );
        assert_eq!(report.to_index(), index);
    }

    #[test]
    fn report_round_trips_through_disk() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("results").join("processed.json");
        let store = store();
        let index = group(&store, 0.0);
        let report = ClassificationReport::build(&store, &index, 0.0, None);
        report.write(&path).unwrap();
        let loaded = ClassificationReport::read(&path).unwrap();
        assert_eq!(loaded, report);
        assert_eq!(loaded.to_index(), index);
    }

    #[test]
    fn missing_report_asks_for_classification_first() {
        let dir = tempdir().unwrap();
        let err = ClassificationReport::read(&dir.path().join("processed.json")).unwrap_err();
        assert!(matches!(err, ReportError::Missing { .. }));
        assert!(err.to_string().contains("run process-json first"));
    }
}
