mod cli;

use anyhow::{bail, Context, Result};
use clap::Parser;
use cli::{Cli, Steps};
use kestrel_core::operations::folder_name;
use kestrel_core::{
    archive, cleanup, count_entries, group, organize, print_index, print_records,
    print_scan_report, process_images, progress, ArchiveReceipt, ClassificationReport,
    DetectionStore, DetectorConfig, DetectorError, KestrelConfig, LazyDetector, ObjectDetector,
    ResultCache, ResultsLayout,
};
use std::fs;
use std::sync::Mutex;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

fn main() -> Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| cli.log_filter().into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let steps = cli.steps();
    if steps.is_empty() {
        bail!(
            "no step selected; pass --all or any of --process-images, --process-json, \
             --export-json, --move-files, --zip, --delete-files"
        );
    }

    let mut config = match &cli.config {
        Some(path) => KestrelConfig::load(path)
            .with_context(|| format!("failed to load configuration {}", path.display()))?,
        None => KestrelConfig::load_or_default().context("failed to load configuration")?,
    };
    cli.apply(&mut config);
    config.validate()?;

    run(&config, &steps)
}

fn run(config: &KestrelConfig, steps: &Steps) -> Result<()> {
    let layout = config.layout();
    let mut receipt = None;
    info!(steps = ?steps.names(), "running steps");

    if steps.process_images {
        println!("Processing images...");
        run_detection(config, &layout)?;
    }

    if steps.process_json {
        println!("Grouping detections by label...");
        run_classification(config, &layout)?;
    }

    if steps.export_json {
        println!("Exporting detections to JSON...");
        let store = DetectionStore::load(layout.snapshot())?;
        store.export_json(layout.detections_json())?;
        println!(
            "JSON output written to {}",
            layout.detections_json().display()
        );
    }

    if steps.move_files {
        println!("Organizing files ({})...", config.operation);
        run_organize(config, &layout)?;
    }

    if steps.zip {
        println!("Archiving {} and {}...", config.image_dir.display(), config.results_dir.display());
        let dirs = [config.image_dir.clone(), config.results_dir.clone()];
        let written = archive(&dirs, &config.archive_path)
            .with_context(|| format!("failed to archive into {}", config.archive_path.display()))?;
        println!(
            "Archive written to {} ({} files)",
            written.archive.display(),
            written.files()
        );
        receipt = Some(written);
    }

    if steps.delete_files {
        println!("Deleting results directory...");
        if !layout.root().exists() {
            warn!(path = %layout.root().display(), "results directory does not exist, nothing to delete");
            return Ok(());
        }
        let receipt = match receipt {
            Some(receipt) => receipt,
            None => ArchiveReceipt::verify(&config.archive_path).with_context(|| {
                format!(
                    "no readable archive at {}; run --zip first",
                    config.archive_path.display()
                )
            })?,
        };
        cleanup(layout.root(), &receipt)?;
        println!("Removed {}", layout.root().display());
    }

    Ok(())
}

fn run_detection(config: &KestrelConfig, layout: &ResultsLayout) -> Result<()> {
    let previous = DetectionStore::load_or_empty(layout.snapshot())
        .context("failed to read the previous detection snapshot")?;
    let cache = ResultCache::seeded_from(&previous);
    info!(cached = cache.len(), "result cache seeded");

    let detector = Mutex::new(LazyDetector::new(|| load_detector(&config.detector)));
    let scan_config = config.scan_config();
    let progress_bar = progress::bar(count_entries(&config.image_dir, &scan_config));

    let (store, report) = process_images(
        &config.image_dir,
        &scan_config,
        &cache,
        &detector,
        &progress_bar,
    )?;
    progress_bar.finish_with_message("Detection complete");

    store
        .save(layout.snapshot())
        .context("failed to save the detection snapshot")?;
    print_records(&store);
    print_scan_report(&report);
    Ok(())
}

#[cfg(feature = "onnx")]
fn load_detector(config: &DetectorConfig) -> Result<Box<dyn ObjectDetector>, DetectorError> {
    let detector = kestrel_core::YoloDetector::load(config.clone())?;
    Ok(Box::new(detector))
}

#[cfg(not(feature = "onnx"))]
fn load_detector(config: &DetectorConfig) -> Result<Box<dyn ObjectDetector>, DetectorError> {
    Err(DetectorError::ModelLoad {
        path: config.model_path.clone(),
        message: String::from("kestrel was built without the `onnx` feature"),
    })
}

fn run_classification(config: &KestrelConfig, layout: &ResultsLayout) -> Result<()> {
    let store = DetectionStore::load(layout.snapshot())?;
    let threshold = config.confidence_threshold;
    let mut index = group(&store, threshold);
    if let Some(label) = &config.unclassified_label {
        index.include_unclassified(&store, threshold, label);
    }

    let report = ClassificationReport::build(
        &store,
        &index,
        threshold,
        config.unclassified_label.as_deref(),
    );
    report.write(&layout.report())?;

    let organized = layout.organized_dir();
    for label in index.labels() {
        let folder = organized.join(folder_name(label));
        fs::create_dir_all(&folder)
            .with_context(|| format!("failed to create {}", folder.display()))?;
    }

    print_index(&index);
    println!(
        "{} labels across {} files written to {}",
        index.len(),
        index.all_files().len(),
        layout.report().display()
    );
    Ok(())
}

fn run_organize(config: &KestrelConfig, layout: &ResultsLayout) -> Result<()> {
    let report = ClassificationReport::read(&layout.report())?;
    let index = report.to_index();
    let progress_bar = progress::bar(0);
    let stats = organize(
        &index,
        &config.image_dir,
        &layout.organized_dir(),
        config.operation,
        &progress_bar,
    )?;

    println!(
        "{} files placed under {}",
        stats.placed,
        layout.organized_dir().display()
    );
    for failure in &stats.failures {
        println!(
            "  {} error: {}: {}",
            failure.kind,
            failure.path.display(),
            failure.message
        );
    }
    Ok(())
}
