//! Grouping of images by the object classes detected in them.

use crate::store::{DetectionStore, ImageRecord};
use std::collections::btree_map::{self, BTreeMap};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

/// Label → files carrying that label. Keys iterate lexicographically.
///
/// An image with several surviving labels appears under each of them.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClassificationIndex {
    groups: BTreeMap<String, BTreeSet<PathBuf>>,
}

/// Distinct labels among `record`'s detections at or above `threshold`, in
/// the order they were first detected.
pub fn labels_for(record: &ImageRecord, threshold: f32) -> Vec<&str> {
    let mut labels: Vec<&str> = Vec::new();
    for detection in record
        .detections
        .iter()
        .filter(|d| d.confidence >= threshold)
    {
        if !labels.contains(&detection.label.as_str()) {
            labels.push(detection.label.as_str());
        }
    }
    labels
}

/// Builds the index for `store`, dropping detections below `threshold`.
/// Images left without detections are not indexed.
pub fn group(store: &DetectionStore, threshold: f32) -> ClassificationIndex {
    let mut index = ClassificationIndex::default();
    for record in store {
        for label in labels_for(record, threshold) {
            index.add(label, record.path.clone());
        }
    }
    index
}

impl ClassificationIndex {
    pub fn from_groups<I, P>(groups: I) -> Self
    where
        I: IntoIterator<Item = (String, P)>,
        P: IntoIterator<Item = PathBuf>,
    {
        let mut index = Self::default();
        for (label, paths) in groups {
            for path in paths {
                index.add(&label, path);
            }
        }
        index
    }

    /// Files the threshold left unlabelled go under `label`. Opt-in; plain
    /// [`group`] never produces a catch-all bucket.
    pub fn include_unclassified(&mut self, store: &DetectionStore, threshold: f32, label: &str) {
        for record in store {
            if labels_for(record, threshold).is_empty() {
                self.add(label, record.path.clone());
            }
        }
    }

    pub fn add(&mut self, label: &str, path: PathBuf) {
        self.groups.entry(label.to_string()).or_default().insert(path);
    }

    pub fn labels(&self) -> impl Iterator<Item = &str> {
        self.groups.keys().map(String::as_str)
    }

    pub fn files(&self, label: &str) -> Option<&BTreeSet<PathBuf>> {
        self.groups.get(label)
    }

    pub fn iter(&self) -> btree_map::Iter<'_, String, BTreeSet<PathBuf>> {
        self.groups.iter()
    }

    /// Every indexed file, once.
    pub fn all_files(&self) -> BTreeSet<&Path> {
        self.groups
            .values()
            .flat_map(|files| files.iter().map(PathBuf::as_path))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.groups.len()
    }

    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }
}

impl<'a> IntoIterator for &'a ClassificationIndex {
    type Item = (&'a String, &'a BTreeSet<PathBuf>);
    type IntoIter = btree_map::Iter<'a, String, BTreeSet<PathBuf>>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}
