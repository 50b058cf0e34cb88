use std::path::Path;

use image::{imageops, imageops::FilterType, GrayImage, ImageBuffer, Luma, RgbImage};
use ndarray::prelude::*;
use parking_lot::Mutex;
use tracing::{debug, info};

use crate::{
    config::{SamDecoderConfig, SamEncoderConfig},
    errors::{Result, VisionError},
    letterbox::{to_nchw_normalized, PreParam},
    session::{Backend, OrtBackend},
    tensor::{TensorBundle, TensorValue},
};

const PIXEL_MEAN: [f32; 3] = [123.675, 116.28, 103.53];
const PIXEL_STD: [f32; 3] = [58.395, 57.12, 57.375];

/// Low-resolution mask prompt expected by the exported decoder.
const MASK_INPUT_SIZE: usize = 256;

/// Image embeddings of the current image together with the resize geometry.
struct ImageFeatures {
    embeddings: TensorValue,
    param: PreParam,
}

/// Segment Anything: an image encoder run once per image and a prompt
/// decoder run once per point set.
pub struct Sam {
    encoder: Mutex<Box<dyn Backend>>,
    decoder: Mutex<Box<dyn Backend>>,
    image_size: u32,
    input_name: String,
    output_name: String,
    features: Option<ImageFeatures>,
}

impl Sam {
    pub fn new(encoder_config: &Path, decoder_config: &Path) -> Result<Self> {
        let encoder_config = SamEncoderConfig::load(encoder_config)?;
        let decoder_config = SamDecoderConfig::load(decoder_config)?;
        let encoder = OrtBackend::from_config(&encoder_config.engine)?;
        let decoder = OrtBackend::from_config(&decoder_config.engine)?;
        Self::with_backends(Box::new(encoder), Box::new(decoder), &encoder_config)
    }

    pub fn with_backends(
        encoder: Box<dyn Backend>,
        decoder: Box<dyn Backend>,
        config: &SamEncoderConfig,
    ) -> Result<Self> {
        let size = config.image_size as usize;
        if let Some(input) = encoder.inputs().iter().find(|s| s.name == config.input_name) {
            let static_dims = [input.dim(2), input.dim(3)];
            if static_dims.iter().flatten().any(|&d| d != size) {
                return Err(VisionError::tensor_shape(
                    input.name.clone(),
                    format!("[1, 3, {size}, {size}]"),
                    &input
                        .shape
                        .iter()
                        .map(|&d| d.max(0) as usize)
                        .collect::<Vec<_>>(),
                ));
            }
        } else {
            return Err(VisionError::configuration(format!(
                "image encoder has no input named `{}`",
                config.input_name
            )));
        }

        info!(image_size = config.image_size, "SAM ready");

        Ok(Self {
            encoder: Mutex::new(encoder),
            decoder: Mutex::new(decoder),
            image_size: config.image_size,
            input_name: config.input_name.clone(),
            output_name: config.output_name.clone(),
            features: None,
        })
    }

    /// Encodes `image` and keeps its embeddings for subsequent predictions.
    pub fn set_image(&mut self, image: &RgbImage) -> Result<()> {
        let (tensor, param) = self.preprocess(image)?;
        let inputs = TensorBundle::new().with(self.input_name.clone(), tensor.into_dyn());
        let mut outputs = self.encoder.lock().run(inputs)?;
        let embeddings = outputs.remove(&self.output_name).ok_or_else(|| {
            VisionError::validation(
                format!("tensor `{}`", self.output_name),
                "missing from image encoder outputs",
            )
        })?;
        debug!(shape = ?embeddings.shape(), "image embeddings computed");

        self.features = Some(ImageFeatures { embeddings, param });
        Ok(())
    }

    pub fn has_image(&self) -> bool {
        self.features.is_some()
    }

    /// Binary mask (255 inside) of the object selected by the point prompts,
    /// at the resolution of the image passed to [`Sam::set_image`].
    ///
    /// Labels follow SAM: 1 foreground, 0 background.
    pub fn predict(&self, points: &[(i32, i32)], labels: &[f32]) -> Result<GrayImage> {
        let features = self.features.as_ref().ok_or_else(|| {
            VisionError::validation("image", "set_image must be called before predict")
        })?;
        if points.len() != labels.len() {
            return Err(VisionError::validation(
                "point_labels",
                format!("{} labels for {} points", labels.len(), points.len()),
            ));
        }
        if points.is_empty() {
            return Err(VisionError::validation("point_coords", "at least one point is required"));
        }

        let inputs = self.prompt_inputs(features, points, labels);
        let outputs = self.decoder.lock().run(inputs)?;
        postprocess(&outputs, &features.param)
    }

    fn preprocess(&self, image: &RgbImage) -> Result<(Array4<f32>, PreParam)> {
        let (width, height) = image.dimensions();
        if width == 0 || height == 0 {
            return Err(VisionError::validation("image", "is empty"));
        }
        let size = self.image_size;
        let ratio = size as f32 / width.max(height) as f32;
        let new_w = ((width as f32 * ratio + 0.5).floor() as u32).clamp(1, size);
        let new_h = ((height as f32 * ratio + 0.5).floor() as u32).clamp(1, size);

        let resized = imageops::resize(image, new_w, new_h, FilterType::Triangle);
        let normalized = to_nchw_normalized(&resized, PIXEL_MEAN, PIXEL_STD);

        // padding stays at zero, bottom and right
        let mut tensor = Array4::<f32>::zeros((1, 3, size as usize, size as usize));
        tensor
            .slice_mut(s![.., .., ..new_h as usize, ..new_w as usize])
            .assign(&normalized);

        Ok((
            tensor,
            PreParam {
                ratio,
                dw: 0.0,
                dh: 0.0,
                width,
                height,
            },
        ))
    }

    fn prompt_inputs(
        &self,
        features: &ImageFeatures,
        points: &[(i32, i32)],
        labels: &[f32],
    ) -> TensorBundle {
        let param = &features.param;
        let (new_w, new_h) = param.content_size();
        let sx = new_w as f32 / param.width as f32;
        let sy = new_h as f32 / param.height as f32;

        let n = points.len() + 1;
        let mut coords = Array3::<f32>::zeros((1, n, 2));
        let mut point_labels = Array2::<f32>::from_elem((1, n), -1.0);
        for (i, (&(x, y), &label)) in points.iter().zip(labels).enumerate() {
            coords[[0, i, 0]] = x as f32 * sx;
            coords[[0, i, 1]] = y as f32 * sy;
            point_labels[[0, i]] = label;
        }

        TensorBundle::new()
            .with("image_embeddings", features.embeddings.clone())
            .with("point_coords", coords.into_dyn())
            .with("point_labels", point_labels.into_dyn())
            .with(
                "mask_input",
                Array4::<f32>::zeros((1, 1, MASK_INPUT_SIZE, MASK_INPUT_SIZE)).into_dyn(),
            )
            .with("has_mask_input", Array1::<f32>::zeros(1).into_dyn())
            .with(
                "orig_im_size",
                arr1(&[param.height as f32, param.width as f32]).into_dyn(),
            )
    }
}

fn postprocess(outputs: &TensorBundle, param: &PreParam) -> Result<GrayImage> {
    let masks = match outputs.get("masks") {
        Some(_) => outputs.f32_view("masks")?,
        None => {
            let (name, _) = outputs
                .find_by_rank(4)
                .ok_or_else(|| VisionError::validation("masks", "decoder produced no 4-D output"))?;
            outputs.f32_view(name)?
        }
    };
    let masks = masks.into_dimensionality::<Ix4>()?;
    let candidates = masks.shape()[1];
    if masks.shape()[0] != 1 || candidates == 0 {
        return Err(VisionError::tensor_shape("masks", "[1, K, H, W] with K > 0", masks.shape()));
    }

    let best = match outputs.get("iou_predictions") {
        Some(scores) => {
            let scores = scores.to_f32();
            if scores.len() != candidates {
                return Err(VisionError::tensor_shape(
                    "iou_predictions",
                    format!("[1, {candidates}]"),
                    scores.shape(),
                ));
            }
            scores
                .iter()
                .enumerate()
                .fold((0, f32::MIN), |best, (i, &v)| if v > best.1 { (i, v) } else { best })
                .0
        }
        None => 0,
    };

    let plane = masks.slice(s![0, best, .., ..]);
    let (mh, mw) = plane.dim();
    let logits: ImageBuffer<Luma<f32>, Vec<f32>> =
        ImageBuffer::from_raw(mw as u32, mh as u32, plane.iter().copied().collect())
            .ok_or_else(|| VisionError::tensor_shape("masks", "contiguous mask plane", &[mh, mw]))?;
    let logits = if logits.dimensions() == (param.width, param.height) {
        logits
    } else {
        imageops::resize(&logits, param.width, param.height, FilterType::Triangle)
    };

    Ok(GrayImage::from_fn(param.width, param.height, |x, y| {
        Luma([if logits.get_pixel(x, y)[0] > 0.0 { 255 } else { 0 }])
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{EngineConfig, Framework};
    use crate::mocks::MockBackend;
    use crate::session::TensorSpec;

    fn encoder_config() -> SamEncoderConfig {
        let engine = EngineConfig::new("enc.onnx", Framework::OnnxRuntime);
        let mut config = SamEncoderConfig::new(engine);
        config.image_size = 32;
        config
    }

    fn encoder_backend() -> MockBackend {
        MockBackend::fixed(
            vec![TensorSpec::new("image", vec![1, 3, 32, 32])],
            TensorBundle::new()
                .with("image_embeddings", Array4::<f32>::ones((1, 2, 4, 4)).into_dyn()),
        )
    }

    /// Two candidate masks; the second has the higher score and covers the
    /// left half of a `h x w` image.
    fn decoder_backend(h: usize, w: usize) -> MockBackend {
        let masks = Array4::from_shape_fn((1, 2, h, w), |(_, k, _, x)| {
            if k == 1 && x < w / 2 {
                4.0
            } else {
                -4.0
            }
        });
        MockBackend::fixed(
            vec![TensorSpec::new("image_embeddings", vec![1, 2, 4, 4])],
            TensorBundle::new()
                .with("masks", masks.into_dyn())
                .with("iou_predictions", arr2(&[[0.2f32, 0.9]]).into_dyn()),
        )
    }

    #[test]
    fn test_predict_requires_image() -> Result<()> {
        let sam = Sam::with_backends(
            Box::new(encoder_backend()),
            Box::new(decoder_backend(4, 4)),
            &encoder_config(),
        )?;
        assert!(!sam.has_image());
        assert!(matches!(
            sam.predict(&[(1, 1)], &[1.0]),
            Err(VisionError::Validation { .. })
        ));
        Ok(())
    }

    #[test]
    fn test_encoder_input_tensor() -> Result<()> {
        let encoder = encoder_backend();
        let last_inputs = encoder.last_inputs();
        let mut sam = Sam::with_backends(
            Box::new(encoder),
            Box::new(decoder_backend(32, 64)),
            &encoder_config(),
        )?;

        sam.set_image(&RgbImage::from_pixel(64, 32, image::Rgb([255, 255, 255])))?;
        let inputs = last_inputs.lock().clone().unwrap_or_default();
        let tensor = inputs.f32_view("image")?;
        assert_eq!(tensor.shape(), &[1, 3, 32, 32]);
        let expected = (255.0 - PIXEL_MEAN[0]) / PIXEL_STD[0];
        assert!((tensor[[0, 0, 0, 0]] - expected).abs() < 1e-4);
        assert_eq!(tensor[[0, 0, 20, 0]], 0.0);
        Ok(())
    }

    #[test]
    fn test_predict_scales_points_and_selects_best_mask() -> Result<()> {
        let decoder = decoder_backend(32, 64);
        let last_inputs = decoder.last_inputs();
        let mut sam =
            Sam::with_backends(Box::new(encoder_backend()), Box::new(decoder), &encoder_config())?;
        sam.set_image(&RgbImage::new(64, 32))?;

        let mask = sam.predict(&[(10, 20)], &[1.0])?;
        assert_eq!(mask.dimensions(), (64, 32));
        assert_eq!(mask.get_pixel(5, 5)[0], 255);
        assert_eq!(mask.get_pixel(60, 5)[0], 0);

        let inputs = last_inputs.lock().clone().unwrap_or_default();
        let coords = inputs.f32_view("point_coords")?;
        assert_eq!(coords.shape(), &[1, 2, 2]);
        assert_eq!((coords[[0, 0, 0]], coords[[0, 0, 1]]), (5.0, 10.0));
        let labels = inputs.f32_view("point_labels")?;
        assert_eq!(labels.iter().copied().collect::<Vec<_>>(), vec![1.0, -1.0]);
        let size = inputs.f32_view("orig_im_size")?;
        assert_eq!(size.iter().copied().collect::<Vec<_>>(), vec![32.0, 64.0]);
        assert_eq!(inputs.f32_view("mask_input")?.shape(), &[1, 1, 256, 256]);
        Ok(())
    }

    #[test]
    fn test_low_resolution_mask_is_resized() -> Result<()> {
        let mut sam = Sam::with_backends(
            Box::new(encoder_backend()),
            Box::new(decoder_backend(8, 16)),
            &encoder_config(),
        )?;
        sam.set_image(&RgbImage::new(64, 32))?;

        let mask = sam.predict(&[(3, 3)], &[1.0])?;
        assert_eq!(mask.dimensions(), (64, 32));
        assert_eq!(mask.get_pixel(2, 16)[0], 255);
        assert_eq!(mask.get_pixel(62, 16)[0], 0);
        Ok(())
    }

    #[test]
    fn test_point_label_count_mismatch() -> Result<()> {
        let mut sam = Sam::with_backends(
            Box::new(encoder_backend()),
            Box::new(decoder_backend(32, 64)),
            &encoder_config(),
        )?;
        sam.set_image(&RgbImage::new(64, 32))?;
        assert!(matches!(
            sam.predict(&[(1, 1), (2, 2)], &[1.0]),
            Err(VisionError::Validation { .. })
        ));
        Ok(())
    }

    #[test]
    fn test_encoder_size_mismatch_is_fatal() {
        let encoder = MockBackend::fixed(
            vec![TensorSpec::new("image", vec![1, 3, 1024, 1024])],
            TensorBundle::new(),
        );
        let result = Sam::with_backends(
            Box::new(encoder),
            Box::new(decoder_backend(4, 4)),
            &encoder_config(),
        );
        assert!(matches!(result, Err(VisionError::TensorShape { .. })));
    }
}
