use std::{fs, path::Path};

use ab_glyph::{Font, FontVec, ScaleFont};
use image::{Rgb, RgbImage};
use imageproc::{
    drawing::{draw_filled_rect_mut, draw_hollow_rect_mut, draw_text_mut},
    rect::Rect,
};
use tracing::{debug, warn};

use crate::{
    errors::{Result, VisionError},
    object::Object,
    traits::Task,
};

/// Box colors, indexed by class label.
pub const COLORS: [Rgb<u8>; 20] = [
    Rgb([0, 114, 189]),
    Rgb([217, 83, 25]),
    Rgb([237, 177, 32]),
    Rgb([126, 47, 142]),
    Rgb([119, 172, 48]),
    Rgb([77, 190, 238]),
    Rgb([162, 20, 47]),
    Rgb([76, 76, 76]),
    Rgb([153, 153, 153]),
    Rgb([255, 0, 0]),
    Rgb([255, 128, 0]),
    Rgb([191, 191, 0]),
    Rgb([0, 255, 0]),
    Rgb([0, 0, 255]),
    Rgb([170, 0, 255]),
    Rgb([85, 85, 0]),
    Rgb([85, 170, 0]),
    Rgb([85, 255, 0]),
    Rgb([170, 85, 0]),
    Rgb([170, 170, 0]),
];

/// Mask overlay colors, indexed by object position.
pub const MASK_COLORS: [Rgb<u8>; 20] = [
    Rgb([0xFF, 0x38, 0x38]),
    Rgb([0xFF, 0x9D, 0x97]),
    Rgb([0xFF, 0x70, 0x1F]),
    Rgb([0xFF, 0xB2, 0x1D]),
    Rgb([0xCF, 0xD2, 0x31]),
    Rgb([0x48, 0xF9, 0x0A]),
    Rgb([0x92, 0xCC, 0x17]),
    Rgb([0x3D, 0xDB, 0x86]),
    Rgb([0x1A, 0x93, 0x34]),
    Rgb([0x00, 0xD4, 0xBB]),
    Rgb([0x2C, 0x99, 0xA8]),
    Rgb([0x00, 0xC2, 0xFF]),
    Rgb([0x34, 0x45, 0x93]),
    Rgb([0x64, 0x73, 0xFF]),
    Rgb([0x00, 0x18, 0xEC]),
    Rgb([0x84, 0x38, 0xFF]),
    Rgb([0x52, 0x00, 0x85]),
    Rgb([0xCB, 0x38, 0xFF]),
    Rgb([0xFF, 0x95, 0xC8]),
    Rgb([0xFF, 0x37, 0xC7]),
];

const MASK_ALPHA: f32 = 0.5;

/// Styling for annotated output images.
pub struct DrawOptions {
    /// Label text is skipped when no font is loaded
    pub font: Option<FontVec>,
    pub font_scale: f32,
    pub thickness: u32,
}

impl Default for DrawOptions {
    fn default() -> Self {
        Self {
            font: None,
            font_scale: 16.0,
            thickness: 2,
        }
    }
}

/// Fonts tried, in order, when no font file is given.
pub const SYSTEM_FONTS: [&str; 4] = [
    "/usr/share/fonts/truetype/dejavu/DejaVuSans.ttf",
    "/usr/share/fonts/TTF/DejaVuSans.ttf",
    "/System/Library/Fonts/Supplemental/Arial.ttf",
    "C:\\Windows\\Fonts\\arial.ttf",
];

impl DrawOptions {
    /// First loadable entry of [`SYSTEM_FONTS`]. Without one, labels are
    /// left out and only boxes and masks are drawn.
    pub fn with_system_font() -> Self {
        for path in SYSTEM_FONTS {
            let Ok(data) = fs::read(path) else {
                continue;
            };
            if let Ok(font) = FontVec::try_from_vec(data) {
                debug!(font = path, "system font loaded");
                return Self {
                    font: Some(font),
                    ..Self::default()
                };
            }
        }
        warn!("no system font found, class labels will not be drawn");
        Self::default()
    }

    pub fn with_font_path(font_path: &Path) -> Result<Self> {
        let data = fs::read(font_path).map_err(|e| VisionError::FileSystem {
            path: font_path.to_path_buf(),
            operation: "read font".to_string(),
            source: e,
        })?;
        let font = FontVec::try_from_vec(data).map_err(|_| {
            VisionError::configuration(format!(
                "failed to parse font file: {}",
                font_path.display()
            ))
        })?;
        debug!(font = %font_path.display(), "font loaded");

        Ok(Self {
            font: Some(font),
            ..Self::default()
        })
    }
}

impl Task {
    /// Draws `objects` with the routine that matches this task.
    pub fn draw(
        self,
        image: &RgbImage,
        objects: &[Object],
        class_names: &[String],
        options: &DrawOptions,
    ) -> Result<RgbImage> {
        match self {
            Self::Detect => draw_objects(image, objects, class_names, options),
            Self::Segment => draw_objects_masks(image, objects, class_names, options),
        }
    }
}

/// Boxes and label tabs for detection results.
pub fn draw_objects(
    image: &RgbImage,
    objects: &[Object],
    class_names: &[String],
    options: &DrawOptions,
) -> Result<RgbImage> {
    if objects.iter().any(|o| o.mask.is_some()) {
        return Err(VisionError::TaskMismatch {
            message: "draw_objects received segmentation results; use draw_objects_masks"
                .to_string(),
        });
    }

    let mut canvas = image.clone();
    for object in objects {
        draw_box(&mut canvas, object, class_names, options);
    }
    Ok(canvas)
}

/// Mask overlays followed by boxes and label tabs for segmentation results.
pub fn draw_objects_masks(
    image: &RgbImage,
    objects: &[Object],
    class_names: &[String],
    options: &DrawOptions,
) -> Result<RgbImage> {
    if objects.iter().any(|o| o.mask.is_none()) {
        return Err(VisionError::TaskMismatch {
            message: "draw_objects_masks received objects without masks; use draw_objects"
                .to_string(),
        });
    }

    let mut canvas = image.clone();
    for (i, object) in objects.iter().enumerate() {
        blend_mask(&mut canvas, object, MASK_COLORS[i % MASK_COLORS.len()]);
    }
    for object in objects {
        draw_box(&mut canvas, object, class_names, options);
    }
    Ok(canvas)
}

fn blend_mask(canvas: &mut RgbImage, object: &Object, color: Rgb<u8>) {
    let Some(mask) = &object.mask else { return };
    let (x0, y0, _, _) = object.bbox.pixel_region();
    let (width, height) = canvas.dimensions();

    for (mx, my, value) in mask.enumerate_pixels() {
        let (x, y) = (x0 + mx, y0 + my);
        if value[0] == 0 || x >= width || y >= height {
            continue;
        }
        let pixel = canvas.get_pixel_mut(x, y);
        for c in 0..3 {
            let mixed = pixel[c] as f32 * (1.0 - MASK_ALPHA) + color[c] as f32 * MASK_ALPHA;
            pixel[c] = mixed.round() as u8;
        }
    }
}

fn draw_box(canvas: &mut RgbImage, object: &Object, class_names: &[String], options: &DrawOptions) {
    let (x0, y0, w, h) = object.bbox.pixel_region();
    if w == 0 || h == 0 {
        return;
    }
    let color = COLORS[object.label % COLORS.len()];

    for t in 0..options.thickness {
        if t * 2 >= w || t * 2 >= h {
            break;
        }
        let rect = Rect::at((x0 + t) as i32, (y0 + t) as i32).of_size(w - 2 * t, h - 2 * t);
        draw_hollow_rect_mut(canvas, rect, color);
    }

    let text = label_text(object, class_names);
    let scale = options.font_scale;
    let tab_w = match &options.font {
        Some(font) => measure_text_width(&text, font, scale),
        None => text.chars().count() as f32 * scale * 0.5,
    }
    .ceil() as u32
        + 4;
    let tab_h = (scale * 1.25).ceil() as u32;
    // above the box, or inside it when there is no room
    let tab_y = if y0 >= tab_h { y0 - tab_h } else { y0 };

    let tab = Rect::at(x0 as i32, tab_y as i32).of_size(tab_w.max(1), tab_h.max(1));
    draw_filled_rect_mut(canvas, tab, color);

    if let Some(font) = &options.font {
        draw_text_mut(
            canvas,
            text_color(color),
            x0 as i32 + 2,
            tab_y as i32,
            scale,
            font,
            &text,
        );
    }
}

fn label_text(object: &Object, class_names: &[String]) -> String {
    let name = class_names
        .get(object.label)
        .cloned()
        .unwrap_or_else(|| object.label.to_string());
    format!("{name} {:.1}%", object.prob * 100.0)
}

/// Black on light tabs, white on dark ones.
fn text_color(background: Rgb<u8>) -> Rgb<u8> {
    let mean = background.0.iter().map(|&c| c as u32).sum::<u32>() / 3;
    if mean > 127 {
        Rgb([0, 0, 0])
    } else {
        Rgb([255, 255, 255])
    }
}

fn measure_text_width(text: &str, font: &FontVec, scale: f32) -> f32 {
    let scaled = font.as_scaled(scale);
    text.chars()
        .map(|ch| scaled.h_advance(scaled.scaled_glyph(ch).id))
        .sum()
}
