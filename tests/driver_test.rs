use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};

use image::{Rgb, RgbImage};
use tempfile::TempDir;

use vision_facade_rs::mocks::MockDetector;
use vision_facade_rs::{
    BatchDriver, CancelFlag, Config, DrawOptions, Object, ObjectDetector, Task, VisionError,
};

fn write_image(path: &Path, width: u32, height: u32) {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).unwrap();
    }
    RgbImage::from_pixel(width, height, Rgb([40, 80, 120]))
        .save(path)
        .unwrap();
}

fn setup() -> (TempDir, Config) {
    let temp_dir = TempDir::new().unwrap();
    let input_dir = temp_dir.path().join("input");
    let output_dir = temp_dir.path().join("output");
    fs::create_dir_all(&input_dir).unwrap();

    let config = Config::new("model.yaml".into(), input_dir, output_dir);
    (temp_dir, config)
}

fn driver<D: ObjectDetector>(detector: D, config: Config) -> BatchDriver<D> {
    BatchDriver::with_draw_options(detector, config, DrawOptions::default())
}

fn file_names(dir: &Path) -> BTreeSet<String> {
    walkdir::WalkDir::new(dir)
        .min_depth(1)
        .into_iter()
        .filter_map(Result::ok)
        .filter(|e| e.file_type().is_file())
        .map(|e| {
            e.path()
                .strip_prefix(dir)
                .unwrap()
                .to_string_lossy()
                .replace('\\', "/")
        })
        .collect()
}

#[test]
fn test_enumerate_matches_supported_extensions() {
    let (_temp_dir, mut config) = setup();
    let input = config.input_dir.clone();
    write_image(&input.join("a.jpg"), 8, 8);
    write_image(&input.join("b.PNG"), 8, 8);
    write_image(&input.join("sub/c.png"), 8, 8);
    fs::write(input.join("notes.txt"), b"text").unwrap();
    fs::write(input.join("README"), b"text").unwrap();

    let flat: BTreeSet<PathBuf> = driver(MockDetector::new(Task::Detect), config.clone())
        .enumerate()
        .unwrap()
        .into_iter()
        .collect();
    let expected: BTreeSet<PathBuf> = [input.join("a.jpg"), input.join("b.PNG")]
        .into_iter()
        .collect();
    assert_eq!(flat, expected);

    config.recursive = true;
    let recursive: BTreeSet<PathBuf> = driver(MockDetector::new(Task::Detect), config)
        .enumerate()
        .unwrap()
        .into_iter()
        .collect();
    assert_eq!(recursive.len(), 3);
    assert!(recursive.contains(&input.join("sub/c.png")));
}

#[test]
fn test_one_output_per_input_with_same_name() {
    let (_temp_dir, mut config) = setup();
    config.recursive = true;
    write_image(&config.input_dir.join("a.png"), 32, 24);
    write_image(&config.input_dir.join("b.jpg"), 16, 16);
    write_image(&config.input_dir.join("nested/c.jpeg"), 20, 10);

    let detector = MockDetector::new(Task::Detect);
    let report = driver(detector.clone(), config.clone()).process().unwrap();

    assert_eq!(report.processed, 3);
    assert!(report.skipped.is_empty());
    assert_eq!(
        file_names(&config.output_dir),
        file_names(&config.input_dir)
    );

    let annotated = image::open(config.output_dir.join("a.png")).unwrap().into_rgb8();
    assert_eq!(annotated.dimensions(), (32, 24));
    assert_ne!(*annotated.get_pixel(0, 5), Rgb([40, 80, 120]));
}

#[test]
fn test_segmentation_results_are_overlaid() {
    let (_temp_dir, config) = setup();
    write_image(&config.input_dir.join("a.png"), 64, 64);

    let report = driver(MockDetector::new(Task::Segment), config.clone())
        .process()
        .unwrap();
    assert_eq!(report.processed, 1);

    // マスク内部は元の色から変化する
    let annotated = image::open(config.output_dir.join("a.png")).unwrap().into_rgb8();
    assert_ne!(*annotated.get_pixel(16, 28), Rgb([40, 80, 120]));
    assert_eq!(*annotated.get_pixel(48, 48), Rgb([40, 80, 120]));
}

#[test]
fn test_output_format_changes_extension_only() {
    let (_temp_dir, mut config) = setup();
    config.format = Some("png".to_string());
    write_image(&config.input_dir.join("photo.jpg"), 16, 16);

    driver(MockDetector::new(Task::Detect), config.clone())
        .process()
        .unwrap();

    assert_eq!(
        file_names(&config.output_dir),
        ["photo.png".to_string()].into_iter().collect()
    );
}

#[test]
fn test_decode_failure_is_skipped() {
    let (_temp_dir, config) = setup();
    write_image(&config.input_dir.join("good.png"), 16, 16);
    fs::write(config.input_dir.join("broken.jpg"), b"not an image").unwrap();

    let report = driver(MockDetector::new(Task::Detect), config.clone())
        .process()
        .unwrap();

    assert_eq!(report.processed, 1);
    assert_eq!(report.skipped.len(), 1);
    assert_eq!(report.skipped[0].path, config.input_dir.join("broken.jpg"));
    assert_eq!(
        file_names(&config.output_dir),
        ["good.png".to_string()].into_iter().collect()
    );
}

#[test]
fn test_inference_failure_is_skipped() {
    let (_temp_dir, config) = setup();
    write_image(&config.input_dir.join("a.png"), 16, 16);
    write_image(&config.input_dir.join("b.png"), 13, 16);

    let detector = MockDetector::new(Task::Detect).failing_on_width(13);
    let batch = driver(detector, config.clone());
    let report = batch.process().unwrap();

    assert_eq!(report.processed, 1);
    assert_eq!(report.skipped.len(), 1);
    assert_eq!(batch.detector().calls(), 2);
    assert!(!config.output_dir.join("b.png").exists());
}

/// 検出タスクを名乗りながらマスク付きの結果を返す検出器
struct MislabeledDetector(MockDetector);

impl ObjectDetector for MislabeledDetector {
    fn detect(&self, image: &RgbImage) -> vision_facade_rs::Result<Vec<Object>> {
        self.0.detect(image)
    }

    fn task(&self) -> Task {
        Task::Detect
    }
}

#[test]
fn test_cross_task_results_abort_the_batch() {
    let (_temp_dir, config) = setup();
    write_image(&config.input_dir.join("a.png"), 16, 16);

    let detector = MislabeledDetector(MockDetector::new(Task::Segment));
    let result = driver(detector, config).process();

    assert!(matches!(result, Err(VisionError::TaskMismatch { .. })));
}

#[test]
fn test_cross_task_results_abort_parallel_batch() {
    let (_temp_dir, mut config) = setup();
    for i in 0..8 {
        write_image(&config.input_dir.join(format!("{i}.png")), 16, 16);
    }
    config.workers = 3;

    let detector = MislabeledDetector(MockDetector::new(Task::Segment));
    let result = driver(detector, config).process();

    assert!(matches!(result, Err(VisionError::TaskMismatch { .. })));
}

#[test]
fn test_output_name_collision_is_rejected() {
    let (_temp_dir, mut config) = setup();
    write_image(&config.input_dir.join("a.jpg"), 16, 16);
    write_image(&config.input_dir.join("a.png"), 16, 16);
    write_image(&config.input_dir.join("b.png"), 16, 16);
    config.format = Some("png".to_string());

    let batch = driver(MockDetector::new(Task::Detect), config.clone());
    let result = batch.process();

    assert!(matches!(result, Err(VisionError::Validation { .. })));
    assert_eq!(batch.detector().calls(), 0);
    assert!(file_names(&config.output_dir).is_empty());
}

#[test]
fn test_output_dir_inside_input_is_not_enumerated() {
    let (_temp_dir, mut config) = setup();
    config.recursive = true;
    config.output_dir = config.input_dir.join("annotated");
    write_image(&config.input_dir.join("a.png"), 16, 16);
    write_image(&config.input_dir.join("sub/b.png"), 16, 16);

    let batch = driver(MockDetector::new(Task::Detect), config.clone());
    assert_eq!(batch.process().unwrap().processed, 2);

    let again = driver(MockDetector::new(Task::Detect), config.clone());
    let files = again.enumerate().unwrap();
    assert_eq!(
        files,
        vec![config.input_dir.join("a.png"), config.input_dir.join("sub/b.png")]
    );
    assert_eq!(again.process().unwrap().processed, 2);
    assert!(!config.output_dir.join("annotated").exists());
}

#[test]
fn test_cancelled_batch_leaves_files_untouched() {
    let (_temp_dir, config) = setup();
    write_image(&config.input_dir.join("a.png"), 16, 16);
    write_image(&config.input_dir.join("b.png"), 16, 16);

    let cancel = CancelFlag::new();
    cancel.cancel();
    let batch = driver(MockDetector::new(Task::Detect), config.clone()).with_cancel_flag(cancel);
    let report = batch.process().unwrap();

    assert_eq!(report.processed, 0);
    assert_eq!(report.cancelled, 2);
    assert_eq!(batch.detector().calls(), 0);
    assert!(file_names(&config.output_dir).is_empty());
}

#[test]
fn test_parallel_workers_match_sequential_output() {
    let (_temp_dir, mut config) = setup();
    for i in 0..6 {
        write_image(&config.input_dir.join(format!("{i}.png")), 16 + i, 16);
    }

    let sequential = driver(MockDetector::new(Task::Detect), config.clone())
        .process()
        .unwrap();

    config.workers = 3;
    config.output_dir = config.output_dir.with_file_name("parallel");
    let parallel = driver(MockDetector::new(Task::Detect), config.clone())
        .process()
        .unwrap();

    assert_eq!(sequential, parallel);
    assert_eq!(parallel.processed, 6);
    for i in 0..6 {
        let name = format!("{i}.png");
        let a = image::open(config.output_dir.with_file_name("output").join(&name)).unwrap();
        let b = image::open(config.output_dir.join(&name)).unwrap();
        assert_eq!(a, b);
    }
}

#[test]
fn test_empty_input_directory() {
    let (_temp_dir, config) = setup();
    let report = driver(MockDetector::new(Task::Detect), config.clone())
        .process()
        .unwrap();

    assert_eq!(report.processed, 0);
    assert!(config.output_dir.is_dir());
}
