use image::GrayImage;

/// Axis-aligned box in original-image pixel coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct BBox {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
}

impl BBox {
    pub const fn new(x: f32, y: f32, width: f32, height: f32) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    pub fn from_xyxy(x1: f32, y1: f32, x2: f32, y2: f32) -> Self {
        Self::new(x1, y1, (x2 - x1).max(0.0), (y2 - y1).max(0.0))
    }

    pub fn from_cxcywh(cx: f32, cy: f32, w: f32, h: f32) -> Self {
        Self::new(cx - w / 2.0, cy - h / 2.0, w, h)
    }

    pub fn right(&self) -> f32 {
        self.x + self.width
    }

    pub fn bottom(&self) -> f32 {
        self.y + self.height
    }

    pub fn area(&self) -> f32 {
        self.width * self.height
    }

    pub fn intersection(&self, other: &Self) -> f32 {
        let w = (self.right().min(other.right()) - self.x.max(other.x)).max(0.0);
        let h = (self.bottom().min(other.bottom()) - self.y.max(other.y)).max(0.0);
        w * h
    }

    pub fn iou(&self, other: &Self) -> f32 {
        let inter = self.intersection(other);
        let union = self.area() + other.area() - inter;
        if union <= 0.0 {
            0.0
        } else {
            inter / union
        }
    }

    /// Clamp to `[0, width] x [0, height]`.
    pub fn clamp(&self, width: u32, height: u32) -> Self {
        let (w, h) = (width as f32, height as f32);
        let x1 = self.x.clamp(0.0, w);
        let y1 = self.y.clamp(0.0, h);
        let x2 = self.right().clamp(0.0, w);
        let y2 = self.bottom().clamp(0.0, h);
        Self::from_xyxy(x1, y1, x2, y2)
    }

    /// Integer pixel region `(x, y, w, h)` covering the box.
    pub fn pixel_region(&self) -> (u32, u32, u32, u32) {
        let x = self.x.floor().max(0.0) as u32;
        let y = self.y.floor().max(0.0) as u32;
        let w = (self.right().ceil().max(0.0) as u32).saturating_sub(x);
        let h = (self.bottom().ceil().max(0.0) as u32).saturating_sub(y);
        (x, y, w, h)
    }
}

/// One detection: geometry, class label, confidence and, for segmentation
/// models, a binary mask covering `bbox.pixel_region()`.
#[derive(Debug, Clone, PartialEq)]
pub struct Object {
    pub bbox: BBox,
    pub label: usize,
    pub prob: f32,
    pub mask: Option<GrayImage>,
}

impl Object {
    pub const fn new(bbox: BBox, label: usize, prob: f32) -> Self {
        Self {
            bbox,
            label,
            prob,
            mask: None,
        }
    }

    pub fn with_mask(mut self, mask: GrayImage) -> Self {
        self.mask = Some(mask);
        self
    }
}

/// Class-aware non-maximum suppression.
///
/// Visits objects in descending score order (ties keep input order) and
/// drops any object whose IoU with an already kept object of the same label
/// exceeds `iou_threshold`. Returns the indices of at most `topk` survivors.
pub fn nms_indices(objects: &[Object], iou_threshold: f32, topk: usize) -> Vec<usize> {
    let mut order: Vec<usize> = (0..objects.len()).collect();
    order.sort_by(|&a, &b| objects[b].prob.total_cmp(&objects[a].prob));

    let mut kept: Vec<usize> = Vec::with_capacity(objects.len().min(topk));
    for candidate in order {
        if kept.len() >= topk {
            break;
        }
        let current = &objects[candidate];
        let suppressed = kept.iter().any(|&k| {
            objects[k].label == current.label && objects[k].bbox.iou(&current.bbox) > iou_threshold
        });
        if !suppressed {
            kept.push(candidate);
        }
    }
    kept
}
