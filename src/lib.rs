pub mod clip;
pub mod config;
pub mod draw;
pub mod driver;
pub mod errors;
pub mod letterbox;
pub mod object;
pub mod sam;
pub mod session;
pub mod tensor;
pub mod traits;
pub mod yolo;

pub mod mocks;

pub use clip::{HfTokenizer, TextEncoder, TextTokenizer, TEXT_EMBEDDINGS};
pub use config::Config;
pub use draw::{draw_objects, draw_objects_masks, DrawOptions, COLORS, MASK_COLORS, SYSTEM_FONTS};
pub use driver::{BatchDriver, BatchReport, CancelFlag, SkippedFile};
pub use errors::{Result, VisionError};
pub use object::{BBox, Object};
pub use sam::Sam;
pub use session::{Backend, OrtBackend, TensorSpec};
pub use tensor::{TensorBundle, TensorValue};
pub use traits::*;
pub use yolo::YoloDetector;
