use clap::{ArgAction, Parser, ValueEnum};
use kestrel_core::{KestrelConfig, Operation, ThreadingMode};
use std::path::PathBuf;

/// Detect objects in a folder of images, group the images by what was found
/// and organize or archive the results.
#[derive(Parser, Debug)]
#[command(name = "kestrel", version)]
pub struct Cli {
    /// Run object detection over the image directory and save the snapshot
    #[arg(long)]
    pub process_images: bool,

    /// Group detections by label and write the classification report
    #[arg(long)]
    pub process_json: bool,

    /// Export the detection snapshot as JSON
    #[arg(long, alias = "pkltojson")]
    pub export_json: bool,

    /// Move or copy images into label folders according to the report
    #[arg(long)]
    pub move_files: bool,

    /// Archive the image and results directories
    #[arg(long, alias = "zip-process")]
    pub zip: bool,

    /// Delete the results directory once it is archived
    #[arg(long)]
    pub delete_files: bool,

    /// Run every step: detect, classify, export, organize, archive, delete
    #[arg(long)]
    pub all: bool,

    /// Whether --move-files moves or copies
    #[arg(long, value_enum)]
    pub operation: Option<OperationArg>,

    /// Folder containing the input images
    #[arg(long)]
    pub image_dir: Option<PathBuf>,

    /// Folder for snapshots, reports and organized images
    #[arg(long)]
    pub results_dir: Option<PathBuf>,

    /// Output archive path
    #[arg(long)]
    pub archive: Option<PathBuf>,

    /// Configuration file (default: kestrel.toml, then the user data dir)
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Minimum confidence for a detection to count when grouping
    #[arg(long)]
    pub threshold: Option<f32>,

    /// Put images without detections under this label
    #[arg(long, value_name = "LABEL")]
    pub unclassified: Option<String>,

    /// ONNX model to load
    #[arg(long)]
    pub model: Option<PathBuf>,

    /// Only scan the top level of the image directory
    #[arg(long)]
    pub no_recursive: bool,

    /// Process files on a single thread
    #[arg(long)]
    pub no_thread: bool,

    /// More log output (-v debug, -vv trace)
    #[arg(short, long, action = ArgAction::Count)]
    pub verbose: u8,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum OperationArg {
    Move,
    Copy,
}

impl From<OperationArg> for Operation {
    fn from(value: OperationArg) -> Self {
        match value {
            OperationArg::Move => Operation::Move,
            OperationArg::Copy => Operation::Copy,
        }
    }
}

/// Steps selected for this run, in execution order.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct Steps {
    pub process_images: bool,
    pub process_json: bool,
    pub export_json: bool,
    pub move_files: bool,
    pub zip: bool,
    pub delete_files: bool,
}

impl Steps {
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }

    /// Flag names of the selected steps, in the order `run` executes them.
    pub fn names(&self) -> Vec<&'static str> {
        [
            (self.process_images, "process-images"),
            (self.process_json, "process-json"),
            (self.export_json, "export-json"),
            (self.move_files, "move-files"),
            (self.zip, "zip"),
            (self.delete_files, "delete-files"),
        ]
        .into_iter()
        .filter_map(|(selected, name)| selected.then_some(name))
        .collect()
    }
}

impl Cli {
    pub fn steps(&self) -> Steps {
        Steps {
            process_images: self.all || self.process_images,
            process_json: self.all || self.process_json,
            export_json: self.all || self.export_json,
            move_files: self.all || self.move_files,
            zip: self.all || self.zip,
            delete_files: self.all || self.delete_files,
        }
    }

    /// Applies command-line overrides on top of file configuration.
    pub fn apply(&self, config: &mut KestrelConfig) {
        if let Some(dir) = &self.image_dir {
            config.image_dir = dir.clone();
        }
        if let Some(dir) = &self.results_dir {
            config.results_dir = dir.clone();
        }
        if let Some(path) = &self.archive {
            config.archive_path = path.clone();
        }
        if let Some(threshold) = self.threshold {
            config.confidence_threshold = threshold;
        }
        if let Some(label) = &self.unclassified {
            config.unclassified_label = Some(label.clone());
        }
        if let Some(model) = &self.model {
            config.detector.model_path = model.clone();
        }
        if let Some(operation) = self.operation {
            config.operation = operation.into();
        }
        if self.no_recursive {
            config.recursive = false;
        }
        if self.no_thread {
            config.threading = ThreadingMode::Sequential;
        }
    }

    pub fn log_filter(&self) -> &'static str {
        match self.verbose {
            0 => "kestrel=info,kestrel_core=info",
            1 => "kestrel=debug,kestrel_core=debug",
            _ => "kestrel=trace,kestrel_core=trace",
        }
    }
}
