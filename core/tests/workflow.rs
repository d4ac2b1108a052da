use indicatif::ProgressBar;
use kestrel_core::{
    archive, cleanup, group, list_entries, organize, process_images, BoundingBox,
    ClassificationReport, Detection, DetectionStore, DetectorError, ObjectDetector, Operation,
    ResultCache, ResultsLayout, ScanConfig, ThreadingMode,
};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tempfile::tempdir;

/// Reads labels straight from the image bytes: `"cat:0.9 dog:0.3"`.
struct TextDetector {
    calls: usize,
}

impl ObjectDetector for TextDetector {
    fn detect(&mut self, image: &Path) -> Result<Vec<Detection>, DetectorError> {
        self.calls += 1;
        let text = fs::read_to_string(image).map_err(|e| DetectorError::Invocation {
            path: image.to_path_buf(),
            message: e.to_string(),
        })?;
        Ok(text
            .split_whitespace()
            .filter_map(|token| token.split_once(':'))
            .map(|(label, confidence)| {
                Detection::new(
                    label,
                    confidence.parse().unwrap_or(0.0),
                    BoundingBox::new(0.0, 0.0, 10.0, 10.0),
                )
            })
            .collect())
    }
}

fn write_images(dir: &Path) {
    fs::create_dir_all(dir.join("nested")).unwrap();
    fs::write(dir.join("pets.jpg"), "cat:0.9 dog:0.3").unwrap();
    fs::write(dir.join("nested").join("pets-copy.jpg"), "cat:0.9 dog:0.3").unwrap();
    fs::write(dir.join("street.png"), "car:0.8").unwrap();
    fs::write(dir.join("empty.jpg"), "").unwrap();
    fs::write(dir.join("notes.txt"), "cat:1.0").unwrap();
}

fn detect(
    image_dir: &Path,
    cache: &ResultCache,
    detector: &Mutex<TextDetector>,
) -> DetectionStore {
    let config = ScanConfig::new(vec![String::from("jpg"), String::from("png")], ThreadingMode::Parallel);
    let (store, report) =
        process_images(image_dir, &config, cache, detector, &ProgressBar::hidden()).unwrap();
    assert!(report.failures.is_empty());
    store
}

#[test]
fn full_run_detects_groups_organizes_and_archives() {
    let work = tempdir().unwrap();
    let image_dir = work.path().join("img");
    let results_dir = work.path().join("results");
    write_images(&image_dir);
    let layout = ResultsLayout::new(&results_dir);

    let detector = Mutex::new(TextDetector { calls: 0 });
    let store = detect(&image_dir, &ResultCache::new(), &detector);
    assert_eq!(store.len(), 4);
    // pets.jpg and its copy share content, so the detector ran three times.
    assert_eq!(detector.lock().unwrap().calls, 3);
    store.save(layout.snapshot()).unwrap();

    let loaded = DetectionStore::load(layout.snapshot()).unwrap();
    assert_eq!(loaded, store);
    loaded.export_json(layout.detections_json()).unwrap();
    assert!(layout.detections_json().is_file());

    let index = group(&loaded, 0.5);
    assert_eq!(index.labels().collect::<Vec<_>>(), vec!["car", "cat"]);
    let report = ClassificationReport::build(&loaded, &index, 0.5, None);
    report.write(&layout.report()).unwrap();
    let reread = ClassificationReport::read(&layout.report()).unwrap().to_index();
    assert_eq!(reread, group(&DetectionStore::load(layout.snapshot()).unwrap(), 0.5));

    let stats = organize(
        &reread,
        &image_dir,
        &layout.organized_dir(),
        Operation::Copy,
        &ProgressBar::hidden(),
    )
    .unwrap();
    assert_eq!(stats.placed, 3);
    assert!(layout.organized_dir().join("cat").join("pets.jpg").is_file());
    assert!(layout.organized_dir().join("cat").join("pets-copy.jpg").is_file());
    assert!(layout.organized_dir().join("car").join("street.png").is_file());

    let archive_path = work.path().join("data.tar.zst");
    let receipt = archive(&[image_dir.clone(), results_dir.clone()], &archive_path).unwrap();
    cleanup(&results_dir, &receipt).unwrap();
    assert!(!results_dir.exists());
    assert!(image_dir.exists());

    let entries = list_entries(&archive_path).unwrap();
    for expected in [
        "img/pets.jpg",
        "results/detections.bin",
        "results/detections.json",
        "results/processed.json",
        "results/processed_images/cat/pets.jpg",
    ] {
        assert!(entries.contains(&PathBuf::from(expected)), "missing {expected}");
    }
    assert_eq!(entries.len(), receipt.files());
}

#[test]
fn second_run_reuses_the_saved_snapshot() {
    let work = tempdir().unwrap();
    let image_dir = work.path().join("img");
    write_images(&image_dir);
    let layout = ResultsLayout::new(work.path().join("results"));

    let first = Mutex::new(TextDetector { calls: 0 });
    let store = detect(&image_dir, &ResultCache::new(), &first);
    store.save(layout.snapshot()).unwrap();

    fs::rename(image_dir.join("street.png"), image_dir.join("renamed.png")).unwrap();
    fs::write(image_dir.join("new.jpg"), "bird:0.7").unwrap();

    let previous = DetectionStore::load_or_empty(layout.snapshot()).unwrap();
    let second = Mutex::new(TextDetector { calls: 0 });
    let rerun = detect(&image_dir, &ResultCache::seeded_from(&previous), &second);

    assert_eq!(second.lock().unwrap().calls, 1);
    assert_eq!(rerun.len(), 5);
    assert_eq!(
        rerun.get(&image_dir.join("renamed.png")).unwrap().detections,
        store.get(&image_dir.join("street.png")).unwrap().detections
    );
}

#[test]
fn move_keeps_a_single_copy_of_multi_label_files() {
    let work = tempdir().unwrap();
    let image_dir = work.path().join("img");
    write_images(&image_dir);
    let dest = work.path().join("sorted");

    let detector = Mutex::new(TextDetector { calls: 0 });
    let store = detect(&image_dir, &ResultCache::new(), &detector);
    let index = group(&store, 0.0);

    let stats = organize(&index, &image_dir, &dest, Operation::Move, &ProgressBar::hidden()).unwrap();
    assert!(stats.failures.is_empty());
    assert!(!image_dir.join("pets.jpg").exists());
    assert!(dest.join("cat").join("pets.jpg").is_file());
    assert!(!dest.join("dog").join("pets.jpg").exists());
    assert!(dest.join("dog").is_dir());
    assert!(image_dir.join("empty.jpg").exists());
}
