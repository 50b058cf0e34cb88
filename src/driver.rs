use std::{
    collections::HashMap,
    fs,
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

use image::ImageFormat;
use indicatif::{ProgressBar, ProgressStyle};
use rayon::{prelude::*, ThreadPoolBuilder};
use tracing::{info, warn};
use walkdir::WalkDir;

use crate::{
    config::Config,
    draw::DrawOptions,
    errors::{Result, VisionError},
    traits::ObjectDetector,
};

/// Shared stop request checked before each file.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SkippedFile {
    pub path: PathBuf,
    pub reason: String,
}

/// Outcome of one batch run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchReport {
    pub processed: usize,
    pub skipped: Vec<SkippedFile>,
    /// Files left untouched after cancellation
    pub cancelled: usize,
}

enum FileOutcome {
    Processed,
    Skipped(SkippedFile),
    Cancelled,
}

/// Applies one detector to every image of a directory and writes annotated
/// copies under the output directory.
pub struct BatchDriver<D: ObjectDetector> {
    detector: D,
    config: Config,
    draw_options: DrawOptions,
    cancel: CancelFlag,
}

impl<D: ObjectDetector> BatchDriver<D> {
    pub fn new(detector: D, config: Config) -> Result<Self> {
        let draw_options = match &config.font {
            Some(path) => DrawOptions::with_font_path(path)?,
            None => DrawOptions::with_system_font(),
        };
        Ok(Self::with_draw_options(detector, config, draw_options))
    }

    pub fn with_draw_options(detector: D, config: Config, draw_options: DrawOptions) -> Self {
        Self {
            detector,
            config,
            draw_options,
            cancel: CancelFlag::new(),
        }
    }

    pub fn with_cancel_flag(mut self, cancel: CancelFlag) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn cancel_flag(&self) -> CancelFlag {
        self.cancel.clone()
    }

    pub fn detector(&self) -> &D {
        &self.detector
    }

    /// Input files with an accepted extension, in file-name order. The
    /// output directory is never descended into, so earlier results are not
    /// picked up again when it lives inside the input directory.
    pub fn enumerate(&self) -> Result<Vec<PathBuf>> {
        let input_dir = &self.config.input_dir;
        if !input_dir.is_dir() {
            return Err(VisionError::FileSystem {
                path: input_dir.clone(),
                operation: "list input directory".to_string(),
                source: std::io::Error::new(
                    std::io::ErrorKind::NotFound,
                    "input directory does not exist",
                ),
            });
        }

        let max_depth = if self.config.recursive { usize::MAX } else { 1 };
        let output_dir = fs::canonicalize(&self.config.output_dir).ok();
        let is_output_dir = |entry: &walkdir::DirEntry| {
            entry.file_type().is_dir()
                && output_dir.as_ref().is_some_and(|out| {
                    fs::canonicalize(entry.path()).is_ok_and(|path| &path == out)
                })
        };
        let files = WalkDir::new(input_dir)
            .min_depth(1)
            .max_depth(max_depth)
            .sort_by_file_name()
            .into_iter()
            .filter_entry(|entry| !is_output_dir(entry))
            .filter_map(|entry| match entry {
                Ok(entry) => Some(entry),
                Err(e) => {
                    warn!(error = %e, "skipping unreadable directory entry");
                    None
                }
            })
            .filter(|entry| entry.file_type().is_file())
            .map(|entry| entry.into_path())
            .filter(|path| self.config.accepts_extension(path))
            .collect();
        Ok(files)
    }

    /// `output_dir` joined with the path of `input` relative to `input_dir`.
    /// Only the extension changes, and only when an output format is set.
    pub fn output_path(&self, input: &Path) -> Result<PathBuf> {
        let relative = input
            .strip_prefix(&self.config.input_dir)
            .map_err(|_| VisionError::FileSystem {
                path: input.to_path_buf(),
                operation: "resolve relative path".to_string(),
                source: std::io::Error::new(
                    std::io::ErrorKind::InvalidInput,
                    "file is outside the input directory",
                ),
            })?;
        let output = self.config.output_dir.join(relative);
        Ok(match &self.config.format {
            Some(format) => output.with_extension(format),
            None => output,
        })
    }

    /// Fails when two inputs would be written to the same output file,
    /// which happens when `--format` unifies their extensions.
    fn check_output_collisions(&self, files: &[PathBuf]) -> Result<()> {
        let mut targets: HashMap<PathBuf, &PathBuf> = HashMap::with_capacity(files.len());
        for input in files {
            let output = self.output_path(input)?;
            if let Some(previous) = targets.insert(output.clone(), input) {
                return Err(VisionError::validation(
                    format!("output path {}", output.display()),
                    format!(
                        "produced by both {} and {}",
                        previous.display(),
                        input.display()
                    ),
                ));
            }
        }
        Ok(())
    }

    pub fn process(&self) -> Result<BatchReport> {
        let files = self.enumerate()?;
        self.check_output_collisions(&files)?;

        let output_dir = &self.config.output_dir;
        fs::create_dir_all(output_dir).map_err(|e| VisionError::FileSystem {
            path: output_dir.clone(),
            operation: "create output directory".to_string(),
            source: e,
        })?;

        if files.is_empty() {
            warn!(input_dir = %self.config.input_dir.display(), "no images to process");
            return Ok(BatchReport::default());
        }
        info!(
            files = files.len(),
            workers = self.config.workers,
            "processing images"
        );

        let progress_bar = ProgressBar::new(files.len() as u64);
        progress_bar.set_style(
            ProgressStyle::with_template(
                "{spinner:.green} [{elapsed}] [{bar:40.cyan/blue}] {pos}/{len} ({per_sec} {eta})",
            )
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("#>-"),
        );

        let step = |path: &PathBuf| {
            let outcome = self.process_file(path);
            progress_bar.inc(1);
            outcome
        };
        let outcomes: Vec<FileOutcome> = if self.config.workers <= 1 {
            files.iter().map(step).collect::<Result<_>>()?
        } else {
            let pool = ThreadPoolBuilder::new()
                .num_threads(self.config.workers)
                .build()
                .map_err(|e| VisionError::configuration(format!("worker pool: {e}")))?;
            pool.install(|| files.par_iter().map(step).collect::<Result<_>>())?
        };
        progress_bar.finish();

        let mut report = BatchReport::default();
        for outcome in outcomes {
            match outcome {
                FileOutcome::Processed => report.processed += 1,
                FileOutcome::Skipped(skipped) => report.skipped.push(skipped),
                FileOutcome::Cancelled => report.cancelled += 1,
            }
        }
        info!(
            processed = report.processed,
            skipped = report.skipped.len(),
            cancelled = report.cancelled,
            "batch finished"
        );
        Ok(report)
    }

    fn process_file(&self, path: &Path) -> Result<FileOutcome> {
        if self.cancel.is_cancelled() {
            return Ok(FileOutcome::Cancelled);
        }
        match self.annotate(path) {
            Ok(()) => Ok(FileOutcome::Processed),
            Err(e) if e.is_recoverable() => {
                warn!(path = %path.display(), error = %e, "skipping image");
                Ok(FileOutcome::Skipped(SkippedFile {
                    path: path.to_path_buf(),
                    reason: e.to_string(),
                }))
            }
            Err(e) => Err(e),
        }
    }

    fn annotate(&self, path: &Path) -> Result<()> {
        let image = image::open(path)
            .map_err(|e| VisionError::ImageDecode {
                path: path.to_path_buf(),
                source: e,
            })?
            .into_rgb8();

        let objects = self.detector.detect(&image)?;
        let canvas = self.detector.task().draw(
            &image,
            &objects,
            self.detector.class_names(),
            &self.draw_options,
        )?;

        let output = self.output_path(path)?;
        if let Some(parent) = output.parent() {
            fs::create_dir_all(parent).map_err(|e| VisionError::FileSystem {
                path: parent.to_path_buf(),
                operation: "create output directory".to_string(),
                source: e,
            })?;
        }

        let saved = match self
            .config
            .format
            .as_deref()
            .and_then(ImageFormat::from_extension)
        {
            Some(format) => canvas.save_with_format(&output, format),
            None => canvas.save(&output),
        };
        saved.map_err(|e| VisionError::ImageProcessing {
            path: output.display().to_string(),
            operation: "save annotated image".to_string(),
            source: Box::new(e),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mocks::MockDetector;
    use crate::traits::Task;

    fn driver(config: Config) -> BatchDriver<MockDetector> {
        let detector = MockDetector::new(Task::Detect);
        BatchDriver::with_draw_options(detector, config, DrawOptions::default())
    }

    #[test]
    fn test_output_path_keeps_relative_name() -> Result<()> {
        let mut config = Config::new("model.yaml".into(), "in".into(), "out".into());
        let same_name = driver(config.clone());
        assert_eq!(
            same_name.output_path(Path::new("in/sub/cat.JPG"))?,
            PathBuf::from("out/sub/cat.JPG")
        );

        config.format = Some("png".to_string());
        let converted = driver(config);
        assert_eq!(
            converted.output_path(Path::new("in/dog.jpg"))?,
            PathBuf::from("out/dog.png")
        );
        assert!(converted.output_path(Path::new("elsewhere/dog.jpg")).is_err());
        Ok(())
    }

    #[test]
    fn test_missing_input_directory() {
        let config = Config::new("model.yaml".into(), "/nonexistent/input".into(), "out".into());
        assert!(matches!(
            driver(config).enumerate(),
            Err(VisionError::FileSystem { .. })
        ));
    }

    #[test]
    fn test_cancel_flag_is_shared() {
        let flag = CancelFlag::new();
        let config = Config::new("model.yaml".into(), "in".into(), "out".into());
        let driver = driver(config).with_cancel_flag(flag.clone());
        assert!(!driver.cancel_flag().is_cancelled());
        flag.cancel();
        assert!(driver.cancel_flag().is_cancelled());
    }
}
