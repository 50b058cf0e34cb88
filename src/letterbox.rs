use image::{
    imageops, imageops::FilterType, GenericImageView, ImageBuffer, Pixel, Primitive, Rgb, RgbImage,
};
use ndarray::prelude::*;
use nshare::AsNdarray3;
use num_traits::AsPrimitive;

use crate::object::BBox;

/// Gray used by YOLO exports for letterbox borders.
pub const PAD_COLOR: Rgb<u8> = Rgb([114, 114, 114]);

/// Offset that centers a `width x height` image on the padded canvas.
pub fn center_offset(width: u32, height: u32, pad_width: u32, pad_height: u32) -> Option<(i64, i64)> {
    if width > pad_width || height > pad_height {
        return None;
    }

    let x = (pad_width - width) / 2;
    let y = (pad_height - height) / 2;
    Some((x.as_(), y.as_()))
}

pub fn padding<I, P, S>(
    image: &I,
    pad_width: u32,
    pad_height: u32,
    color: P,
) -> Option<ImageBuffer<P, Vec<S>>>
where
    I: GenericImageView<Pixel = P>,
    P: Pixel<Subpixel = S>,
    S: Primitive,
{
    let (width, height) = image.dimensions();

    center_offset(width, height, pad_width, pad_height).map(|(x, y)| {
        let mut canvas = ImageBuffer::from_pixel(pad_width, pad_height, color);
        imageops::overlay(&mut canvas, image, x, y);
        canvas
    })
}

/// Geometry of one resize-and-pad step, kept to map model coordinates
/// back to the source image.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PreParam {
    pub ratio: f32,
    pub dw: f32,
    pub dh: f32,
    pub width: u32,
    pub height: u32,
}

impl PreParam {
    /// Inverse of the letterbox for a box in model-input coordinates,
    /// clamped to the source image.
    pub fn unmap(&self, bbox: BBox) -> BBox {
        BBox::from_xyxy(
            (bbox.x - self.dw) / self.ratio,
            (bbox.y - self.dh) / self.ratio,
            (bbox.right() - self.dw) / self.ratio,
            (bbox.bottom() - self.dh) / self.ratio,
        )
        .clamp(self.width, self.height)
    }

    /// Size of the resized image inside the padded canvas.
    pub fn content_size(&self) -> (u32, u32) {
        (
            (self.width as f32 * self.ratio).round() as u32,
            (self.height as f32 * self.ratio).round() as u32,
        )
    }
}

/// Aspect-preserving resize into `target_w x target_h`, centered on gray.
pub fn letterbox(image: &RgbImage, target_w: u32, target_h: u32) -> (RgbImage, PreParam) {
    let (width, height) = image.dimensions();
    let ratio = (target_w as f32 / width as f32).min(target_h as f32 / height as f32);
    let new_w = ((width as f32 * ratio).round() as u32).clamp(1, target_w);
    let new_h = ((height as f32 * ratio).round() as u32).clamp(1, target_h);

    let resized = imageops::resize(image, new_w, new_h, FilterType::Triangle);
    let (dw, dh) = center_offset(new_w, new_h, target_w, target_h).unwrap_or((0, 0));
    let canvas = padding(&resized, target_w, target_h, PAD_COLOR).unwrap_or(resized);

    (
        canvas,
        PreParam {
            ratio,
            dw: dw as f32,
            dh: dh as f32,
            width,
            height,
        },
    )
}

/// `[1, 3, H, W]` tensor scaled to `[0, 1]`.
pub fn to_nchw_unit(image: &RgbImage) -> Array4<f32> {
    image
        .as_ndarray3()
        .mapv(|v| v as f32 / 255.0)
        .insert_axis(Axis(0))
}

/// `[1, 3, H, W]` tensor normalized per channel with `(v - mean) / std`.
pub fn to_nchw_normalized(image: &RgbImage, mean: [f32; 3], std: [f32; 3]) -> Array4<f32> {
    let mut tensor = image.as_ndarray3().mapv(|v| v as f32);
    for (c, mut channel) in tensor.axis_iter_mut(Axis(0)).enumerate() {
        channel.mapv_inplace(|v| (v - mean[c]) / std[c]);
    }
    tensor.insert_axis(Axis(0))
}
