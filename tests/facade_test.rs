use std::fs;

use image::{Rgb, RgbImage};
use ndarray::Array3;
use tempfile::TempDir;

use vision_facade_rs::config::{EngineConfig, Framework, YoloConfig, YoloVariant};
use vision_facade_rs::mocks::MockBackend;
use vision_facade_rs::{
    BBox, BatchDriver, Config, DrawOptions, ObjectDetector, TensorBundle, TensorSpec,
    YoloDetector, COLORS,
};

/// 128x64 の画像をレターボックスした 64x64 入力上に、クラス1の箱を1つ置く
fn single_box_detector() -> YoloDetector {
    let mut pred = Array3::<f32>::zeros((1, 6, 3));
    for (c, v) in [32.0, 32.0, 20.0, 10.0, 0.1, 0.9].into_iter().enumerate() {
        pred[[0, c, 0]] = v;
    }
    let backend = MockBackend::fixed(
        vec![TensorSpec::new("images", vec![1, 3, 64, 64])],
        TensorBundle::new().with("output0", pred.into_dyn()),
    );
    let config = YoloConfig::new(
        EngineConfig::new("yolov8n.onnx", Framework::OnnxRuntime),
        YoloVariant::Normal,
    );
    YoloDetector::with_backend(
        Box::new(backend),
        &config,
        vec!["person".to_string(), "bicycle".to_string()],
    )
    .unwrap()
}

#[test]
fn test_detector_maps_boxes_to_source_image() {
    let detector = single_box_detector();
    let objects = detector.detect(&RgbImage::new(128, 64)).unwrap();

    assert_eq!(objects.len(), 1);
    assert_eq!(objects[0].label, 1);
    assert_eq!(objects[0].prob, 0.9);
    assert_eq!(objects[0].bbox, BBox::from_xyxy(44.0, 22.0, 84.0, 42.0));
    assert_eq!(detector.class_names()[objects[0].label], "bicycle");
}

#[test]
fn test_yolo_detector_through_batch_driver() {
    let temp_dir = TempDir::new().unwrap();
    let input_dir = temp_dir.path().join("input");
    fs::create_dir_all(&input_dir).unwrap();
    RgbImage::from_pixel(128, 64, Rgb([200, 200, 200]))
        .save(input_dir.join("street.png"))
        .unwrap();

    let config = Config::new(
        "yolo.yaml".into(),
        input_dir,
        temp_dir.path().join("output"),
    );
    let output_dir = config.output_dir.clone();
    let driver =
        BatchDriver::with_draw_options(single_box_detector(), config, DrawOptions::default());
    let report = driver.process().unwrap();

    assert_eq!(report.processed, 1);
    let annotated = image::open(output_dir.join("street.png")).unwrap().into_rgb8();
    assert_eq!(*annotated.get_pixel(44, 30), COLORS[1]);
    assert_eq!(*annotated.get_pixel(64, 32), Rgb([200, 200, 200]));
}

#[test]
fn test_yolo_config_file_resolves_relative_paths() {
    let temp_dir = TempDir::new().unwrap();
    let config_path = temp_dir.path().join("yolo.yaml");
    fs::write(
        &config_path,
        "model_path: models/yolov8n-seg.onnx\nframework: cuda\nvariant: seg\nconf_threshold: 0.4\n",
    )
    .unwrap();

    let config = YoloConfig::load(&config_path).unwrap();
    assert_eq!(
        config.engine.model_path,
        temp_dir.path().join("models/yolov8n-seg.onnx")
    );
    assert_eq!(config.engine.framework, Framework::Cuda);
    assert_eq!(config.variant, YoloVariant::Segment);
    assert_eq!(config.conf_threshold, 0.4);

    // モデルファイルが無ければ構築は失敗する
    assert!(YoloDetector::from_config(&config_path).is_err());
}
