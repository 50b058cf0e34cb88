use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc,
};

use image::RgbImage;

use crate::clip::TextTokenizer;
use crate::errors::{Result, VisionError};
use crate::object::{BBox, Object};
use crate::session::{Backend, TensorSpec};
use crate::tensor::TensorBundle;
use crate::traits::{ObjectDetector, Task};

type Responder = Box<dyn FnMut(&TensorBundle) -> Result<TensorBundle> + Send>;

/// テスト用のスクリプト化されたバックエンド
pub struct MockBackend {
    inputs: Vec<TensorSpec>,
    outputs: Vec<TensorSpec>,
    responder: Responder,
    calls: Arc<AtomicUsize>,
    last_inputs: Arc<parking_lot::Mutex<Option<TensorBundle>>>,
}

impl MockBackend {
    pub fn new(
        inputs: Vec<TensorSpec>,
        outputs: Vec<TensorSpec>,
        responder: impl FnMut(&TensorBundle) -> Result<TensorBundle> + Send + 'static,
    ) -> Self {
        Self {
            inputs,
            outputs,
            responder: Box::new(responder),
            calls: Arc::new(AtomicUsize::new(0)),
            last_inputs: Arc::new(parking_lot::Mutex::new(None)),
        }
    }

    /// Returns the same outputs for every call.
    pub fn fixed(inputs: Vec<TensorSpec>, response: TensorBundle) -> Self {
        let outputs = response
            .iter()
            .map(|(name, value)| {
                TensorSpec::new(name, value.shape().iter().map(|&d| d as i64).collect())
            })
            .collect();
        Self::new(inputs, outputs, move |_| Ok(response.clone()))
    }

    /// Counter shared with the backend, readable after it moved into a facade.
    pub fn call_counter(&self) -> Arc<AtomicUsize> {
        Arc::clone(&self.calls)
    }

    pub fn last_inputs(&self) -> Arc<parking_lot::Mutex<Option<TensorBundle>>> {
        Arc::clone(&self.last_inputs)
    }
}

impl Backend for MockBackend {
    fn run(&mut self, inputs: TensorBundle) -> Result<TensorBundle> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let response = (self.responder)(&inputs);
        *self.last_inputs.lock() = Some(inputs);
        response
    }

    fn inputs(&self) -> &[TensorSpec] {
        &self.inputs
    }

    fn outputs(&self) -> &[TensorSpec] {
        &self.outputs
    }
}

/// テスト用のモック検出器
///
/// 画像の左上に固定サイズの検出結果を1件返す。`fail_on_width` に一致する幅の
/// 画像では推論エラーを返す。
#[derive(Debug, Clone)]
pub struct MockDetector {
    pub task: Task,
    pub fail_on_width: Option<u32>,
    pub class_names: Vec<String>,
    calls: Arc<AtomicUsize>,
}

impl MockDetector {
    pub fn new(task: Task) -> Self {
        Self {
            task,
            fail_on_width: None,
            class_names: vec!["person".to_string()],
            calls: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn failing_on_width(mut self, width: u32) -> Self {
        self.fail_on_width = Some(width);
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl ObjectDetector for MockDetector {
    fn detect(&self, image: &RgbImage) -> Result<Vec<Object>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let (width, height) = image.dimensions();
        if self.fail_on_width == Some(width) {
            return Err(VisionError::inference(
                "mock detect",
                format!("refusing image of width {width}"),
            ));
        }

        let bbox = BBox::new(0.0, 0.0, (width / 2) as f32, (height / 2) as f32);
        let object = Object::new(bbox, 0, 0.9);
        Ok(vec![match self.task {
            Task::Detect => object,
            Task::Segment => {
                let (_, _, w, h) = bbox.pixel_region();
                object.with_mask(image::GrayImage::from_pixel(w, h, image::Luma([255])))
            }
        }])
    }

    fn task(&self) -> Task {
        self.task
    }

    fn class_names(&self) -> &[String] {
        &self.class_names
    }
}

/// テスト用のトークナイザー
///
/// 空白区切りの単語を文字コードの和に写像し、先頭に 1、末尾に `eot` を付与する。
#[derive(Debug, Clone)]
pub struct MockTokenizer {
    pub eot: u32,
}

impl MockTokenizer {
    pub const fn new() -> Self {
        Self { eot: 49407 }
    }
}

impl Default for MockTokenizer {
    fn default() -> Self {
        Self::new()
    }
}

impl TextTokenizer for MockTokenizer {
    fn encode(&self, text: &str) -> Result<Vec<u32>> {
        let mut ids = vec![1];
        ids.extend(
            text.split_whitespace()
                .map(|word| 2 + word.chars().map(|c| c as u32).sum::<u32>() % 40000),
        );
        ids.push(self.eot);
        Ok(ids)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mock_detector_masks_follow_task() -> Result<()> {
        let image = RgbImage::new(40, 20);

        let detect = MockDetector::new(Task::Detect).detect(&image)?;
        assert!(detect[0].mask.is_none());

        let segment = MockDetector::new(Task::Segment).detect(&image)?;
        let mask = segment[0].mask.as_ref().map(|m| m.dimensions());
        assert_eq!(mask, Some((20, 10)));
        Ok(())
    }

    #[test]
    fn test_mock_tokenizer_is_deterministic() -> Result<()> {
        let tokenizer = MockTokenizer::new();
        assert_eq!(tokenizer.encode("a dog")?, tokenizer.encode("a dog")?);
        assert_eq!(tokenizer.encode("")?, vec![1, 49407]);
        Ok(())
    }
}
