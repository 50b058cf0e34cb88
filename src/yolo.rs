use std::path::Path;

use image::{imageops, imageops::FilterType, GrayImage, ImageBuffer, Luma, RgbImage};
use ndarray::prelude::*;
use parking_lot::Mutex;
use tracing::debug;

use crate::{
    config::{read_class_names, YoloConfig, YoloVariant},
    errors::{Result, VisionError},
    letterbox::{letterbox, to_nchw_unit, PreParam},
    object::{nms_indices, BBox, Object},
    session::{Backend, OrtBackend},
    tensor::{TensorBundle, TensorValue},
    traits::{ObjectDetector, Task},
};

/// Score and overlap settings applied while decoding raw outputs.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Thresholds {
    pub conf: f32,
    pub iou: f32,
    pub topk: usize,
    pub mask: f32,
}

impl From<&YoloConfig> for Thresholds {
    fn from(config: &YoloConfig) -> Self {
        Self {
            conf: config.conf_threshold,
            iou: config.iou_threshold,
            topk: config.topk,
            mask: config.mask_threshold,
        }
    }
}

/// YOLOv8 facade covering plain, end-to-end (NMS inside the graph) and
/// instance-segmentation exports.
pub struct YoloDetector {
    backend: Mutex<Box<dyn Backend>>,
    input_name: String,
    input_width: u32,
    input_height: u32,
    variant: YoloVariant,
    thresholds: Thresholds,
    class_names: Vec<String>,
}

impl YoloDetector {
    pub fn from_config(path: &Path) -> Result<Self> {
        Self::new(YoloConfig::load(path)?)
    }

    pub fn new(config: YoloConfig) -> Result<Self> {
        let class_names = match &config.class_names {
            Some(path) => read_class_names(path)?,
            None => Vec::new(),
        };
        let backend = OrtBackend::from_config(&config.engine)?;
        Self::with_backend(Box::new(backend), &config, class_names)
    }

    pub fn with_backend(
        backend: Box<dyn Backend>,
        config: &YoloConfig,
        class_names: Vec<String>,
    ) -> Result<Self> {
        let input = backend
            .inputs()
            .first()
            .ok_or_else(|| VisionError::configuration("model declares no inputs"))?;

        let (input_width, input_height) = match config.input_size {
            Some(size) => (size, size),
            None => match (input.dim(3), input.dim(2)) {
                (Some(w), Some(h)) => (w as u32, h as u32),
                _ => {
                    return Err(VisionError::configuration(format!(
                        "input `{}` has dynamic spatial dimensions {:?}; set `input_size`",
                        input.name, input.shape
                    )))
                }
            },
        };

        let required_outputs = match config.variant {
            YoloVariant::Normal => 1,
            YoloVariant::End2End => 4,
            YoloVariant::Segment => 2,
        };
        if backend.outputs().len() < required_outputs {
            return Err(VisionError::configuration(format!(
                "{:?} variant needs {required_outputs} outputs, model declares {}",
                config.variant,
                backend.outputs().len()
            )));
        }

        Ok(Self {
            input_name: input.name.clone(),
            input_width,
            input_height,
            variant: config.variant,
            thresholds: Thresholds::from(config),
            class_names,
            backend: Mutex::new(backend),
        })
    }

    pub const fn variant(&self) -> YoloVariant {
        self.variant
    }

    pub const fn input_size(&self) -> (u32, u32) {
        (self.input_width, self.input_height)
    }

    fn infer(&self, image: &RgbImage) -> Result<(TensorBundle, PreParam)> {
        let (canvas, param) = letterbox(image, self.input_width, self.input_height);
        let tensor = to_nchw_unit(&canvas).into_dyn();
        let inputs = TensorBundle::new().with(self.input_name.clone(), tensor);

        let outputs = self.backend.lock().run(inputs)?;
        Ok((outputs, param))
    }
}

impl ObjectDetector for YoloDetector {
    fn detect(&self, image: &RgbImage) -> Result<Vec<Object>> {
        let (outputs, param) = self.infer(image)?;
        let objects = match self.variant {
            YoloVariant::Normal => decode_normal(&outputs, &param, &self.thresholds)?,
            YoloVariant::End2End => decode_end2end(&outputs, &param, &self.thresholds)?,
            YoloVariant::Segment => decode_segment(
                &outputs,
                &param,
                (self.input_width, self.input_height),
                &self.thresholds,
            )?,
        };
        debug!(count = objects.len(), variant = ?self.variant, "decoded detections");
        Ok(objects)
    }

    fn task(&self) -> Task {
        match self.variant {
            YoloVariant::Segment => Task::Segment,
            YoloVariant::Normal | YoloVariant::End2End => Task::Detect,
        }
    }

    fn class_names(&self) -> &[String] {
        &self.class_names
    }
}

/// A decoded box in model-input coordinates and the anchor it came from.
struct Candidate {
    bbox: BBox,
    label: usize,
    score: f32,
    anchor: usize,
}

fn rank3(outputs: &TensorBundle) -> Result<(String, Array3<f32>)> {
    let (name, value) = outputs
        .find_by_rank(3)
        .ok_or_else(|| VisionError::tensor_shape("predictions", "a rank-3 output", &[]))?;
    let array = value.to_f32().into_dimensionality::<Ix3>()?;
    if array.shape()[0] != 1 {
        return Err(VisionError::tensor_shape(name, "batch size 1", array.shape()));
    }
    Ok((name.to_string(), array))
}

/// Channel-major predictions `[4 + nc (+ nm), N]`: `cx, cy, w, h`, class
/// scores, then optional mask coefficients.
fn decode_raw(pred: ArrayView2<f32>, num_classes: usize, conf: f32) -> Vec<Candidate> {
    pred.axis_iter(Axis(1))
        .enumerate()
        .filter_map(|(anchor, column)| {
            let (label, score) = column
                .slice(s![4..4 + num_classes])
                .iter()
                .copied()
                .enumerate()
                .fold((0, f32::NEG_INFINITY), |best, (i, s)| {
                    if s > best.1 {
                        (i, s)
                    } else {
                        best
                    }
                });
            (score >= conf).then(|| Candidate {
                bbox: BBox::from_cxcywh(column[0], column[1], column[2], column[3]),
                label,
                score,
                anchor,
            })
        })
        .collect()
}

/// Maps candidates back to the source image, drops empty boxes, runs NMS.
fn finalize(
    candidates: Vec<Candidate>,
    param: &PreParam,
    thresholds: &Thresholds,
) -> Vec<(Object, usize)> {
    let (objects, anchors): (Vec<Object>, Vec<usize>) = candidates
        .into_iter()
        .map(|c| (Object::new(param.unmap(c.bbox), c.label, c.score), c.anchor))
        .filter(|(object, _)| object.bbox.area() > 0.0)
        .unzip();

    nms_indices(&objects, thresholds.iou, thresholds.topk)
        .into_iter()
        .map(|i| (objects[i].clone(), anchors[i]))
        .collect()
}

pub fn decode_normal(
    outputs: &TensorBundle,
    param: &PreParam,
    thresholds: &Thresholds,
) -> Result<Vec<Object>> {
    let (name, pred) = rank3(outputs)?;
    let pred = pred.index_axis(Axis(0), 0);
    let (rows, cols) = pred.dim();

    let candidates = if cols == 6 {
        // (x1, y1, x2, y2, score, label) per row
        pred.axis_iter(Axis(0))
            .enumerate()
            .filter(|(_, row)| row[4] >= thresholds.conf && row[5] >= 0.0)
            .map(|(anchor, row)| Candidate {
                bbox: BBox::from_xyxy(row[0], row[1], row[2], row[3]),
                label: row[5].round() as usize,
                score: row[4],
                anchor,
            })
            .collect()
    } else {
        if rows <= 4 {
            return Err(VisionError::tensor_shape(
                name,
                "[1, N, 6] or [1, 4 + classes, N]",
                &[1, rows, cols],
            ));
        }
        decode_raw(pred, rows - 4, thresholds.conf)
    };

    Ok(finalize(candidates, param, thresholds)
        .into_iter()
        .map(|(object, _)| object)
        .collect())
}

fn first_present<'a>(outputs: &'a TensorBundle, names: &[&str]) -> Result<&'a TensorValue> {
    names
        .iter()
        .find_map(|name| outputs.get(name))
        .ok_or_else(|| {
            VisionError::validation(
                format!("output `{}`", names[0]),
                format!(
                    "is missing (available: {})",
                    outputs.names().collect::<Vec<_>>().join(", ")
                ),
            )
        })
}

pub fn decode_end2end(
    outputs: &TensorBundle,
    param: &PreParam,
    thresholds: &Thresholds,
) -> Result<Vec<Object>> {
    let num_dets = first_present(outputs, &["num_dets", "num_detections"])?.to_f32();
    let boxes = first_present(outputs, &["bboxes", "det_boxes", "boxes"])?.to_f32();
    let scores = first_present(outputs, &["scores", "det_scores"])?.to_f32();
    let labels = first_present(outputs, &["labels", "det_classes", "classes"])?.to_f32();

    let boxes = boxes
        .into_dimensionality::<Ix3>()
        .map_err(|_| VisionError::tensor_shape("bboxes", "[1, topk, 4]", &[]))?;
    if boxes.shape()[2] != 4 {
        return Err(VisionError::tensor_shape("bboxes", "[1, topk, 4]", boxes.shape()));
    }
    let scores: Vec<f32> = scores.iter().copied().collect();
    let labels: Vec<f32> = labels.iter().copied().collect();

    let count = num_dets
        .iter()
        .next()
        .copied()
        .unwrap_or(0.0)
        .max(0.0) as usize;
    let count = count
        .min(boxes.shape()[1])
        .min(scores.len())
        .min(labels.len());

    let mut objects: Vec<Object> = (0..count)
        .filter(|&i| scores[i] >= thresholds.conf && labels[i] >= 0.0)
        .map(|i| {
            let b: ArrayView1<f32> = boxes.slice(s![0, i, ..]);
            let bbox = param.unmap(BBox::from_xyxy(b[0], b[1], b[2], b[3]));
            Object::new(bbox, labels[i].round() as usize, scores[i])
        })
        .filter(|object| object.bbox.area() > 0.0)
        .collect();
    objects.sort_by(|a, b| b.prob.total_cmp(&a.prob));
    objects.truncate(thresholds.topk);
    Ok(objects)
}

pub fn decode_segment(
    outputs: &TensorBundle,
    param: &PreParam,
    input_size: (u32, u32),
    thresholds: &Thresholds,
) -> Result<Vec<Object>> {
    let (name, pred) = rank3(outputs)?;
    let (proto_name, protos) = outputs
        .find_by_rank(4)
        .ok_or_else(|| {
            VisionError::tensor_shape("protos", "a rank-4 output [1, nm, mh, mw]", &[])
        })?;
    let protos = protos.to_f32().into_dimensionality::<Ix4>()?;
    let (_, nm, mh, mw) = protos.dim();
    let pred = pred.index_axis(Axis(0), 0);
    let (rows, cols) = pred.dim();

    if nm == 0 || rows <= 4 + nm {
        return Err(VisionError::tensor_shape(
            name,
            format!("[1, 4 + classes + {nm}, N] to match `{proto_name}`"),
            &[1, rows, cols],
        ));
    }
    let num_classes = rows - 4 - nm;

    let candidates = decode_raw(pred, num_classes, thresholds.conf);
    let kept = finalize(candidates, param, thresholds);

    let protos = protos
        .index_axis(Axis(0), 0)
        .to_owned()
        .into_shape_with_order((nm, mh * mw))?;

    // content region of the letterbox expressed in prototype pixels
    let sx = mw as f32 / input_size.0 as f32;
    let sy = mh as f32 / input_size.1 as f32;
    let (content_w, content_h) = param.content_size();
    let crop_x = ((param.dw * sx).floor() as u32).min(mw as u32 - 1);
    let crop_y = ((param.dh * sy).floor() as u32).min(mh as u32 - 1);
    let crop_w = ((content_w as f32 * sx).round() as u32).clamp(1, mw as u32 - crop_x);
    let crop_h = ((content_h as f32 * sy).round() as u32).clamp(1, mh as u32 - crop_y);

    let mut objects = Vec::with_capacity(kept.len());
    for (object, anchor) in kept {
        let coeffs = pred.slice(s![4 + num_classes.., anchor]);
        let logits = coeffs.dot(&protos);
        let values: Vec<f32> = logits.iter().map(|&v| sigmoid(v)).collect();

        let proto_mask: ImageBuffer<Luma<f32>, Vec<f32>> =
            ImageBuffer::from_raw(mw as u32, mh as u32, values).ok_or_else(|| {
                VisionError::tensor_shape(proto_name, "mh * mw mask values", &[mh, mw])
            })?;
        let cropped = imageops::crop_imm(&proto_mask, crop_x, crop_y, crop_w, crop_h).to_image();
        let full = imageops::resize(&cropped, param.width, param.height, FilterType::Triangle);

        let (x, y, w, h) = object.bbox.pixel_region();
        let w = w.min(param.width.saturating_sub(x));
        let h = h.min(param.height.saturating_sub(y));
        let mask = GrayImage::from_fn(w, h, |i, j| {
            if full.get_pixel(x + i, y + j)[0] > thresholds.mask {
                Luma([255])
            } else {
                Luma([0])
            }
        });
        objects.push(object.with_mask(mask));
    }
    Ok(objects)
}

fn sigmoid(v: f32) -> f32 {
    1.0 / (1.0 + (-v).exp())
}
