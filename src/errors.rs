use std::path::PathBuf;
use thiserror::Error;

type BoxedSource = Box<dyn std::error::Error + Send + Sync>;

/// Structured error types for the model facades and the batch driver.
///
/// Each variant carries the context of its domain (filesystem, decoding,
/// inference, tensor layout) so the driver can decide between skipping a file
/// and aborting the batch without parsing error strings.
#[derive(Error, Debug)]
pub enum VisionError {
    #[error("Configuration error: {message}")]
    Configuration { message: String },

    #[error("Filesystem error: {operation} failed for {path:?}")]
    FileSystem {
        path: PathBuf,
        operation: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Image decode error: failed to read {path:?}")]
    ImageDecode {
        path: PathBuf,
        #[source]
        source: image::ImageError,
    },

    #[error("Image processing error: {operation} failed (file: {path})")]
    ImageProcessing {
        path: String,
        operation: String,
        #[source]
        source: BoxedSource,
    },

    #[error("Inference error: {operation} failed")]
    Inference {
        operation: String,
        #[source]
        source: BoxedSource,
    },

    #[error("Tensor shape mismatch for `{tensor}`: expected {expected}, got {actual:?}")]
    TensorShape {
        tensor: String,
        expected: String,
        actual: Vec<usize>,
    },

    #[error("Tokenizer error: {message}")]
    Tokenizer { message: String },

    #[error("Task mismatch: {message}")]
    TaskMismatch { message: String },

    #[error("Validation error: {field} {reason}")]
    Validation { field: String, reason: String },
}

pub type Result<T> = std::result::Result<T, VisionError>;

impl VisionError {
    pub(crate) fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    pub(crate) fn inference(
        operation: impl Into<String>,
        source: impl Into<BoxedSource>,
    ) -> Self {
        Self::Inference {
            operation: operation.into(),
            source: source.into(),
        }
    }

    pub(crate) fn tensor_shape(
        tensor: impl Into<String>,
        expected: impl Into<String>,
        actual: &[usize],
    ) -> Self {
        Self::TensorShape {
            tensor: tensor.into(),
            expected: expected.into(),
            actual: actual.to_vec(),
        }
    }

    pub(crate) fn validation(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Validation {
            field: field.into(),
            reason: reason.into(),
        }
    }

    /// Whether the batch driver may skip the current file and continue.
    ///
    /// Decode, inference and per-file I/O failures only concern one image.
    /// Shape, task and configuration errors would repeat for every file.
    pub const fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::ImageDecode { .. }
                | Self::ImageProcessing { .. }
                | Self::Inference { .. }
                | Self::FileSystem { .. }
        )
    }
}

/// Convert anyhow errors to configuration errors.
///
/// Only used at the boundary with helpers that report through anyhow.
impl From<anyhow::Error> for VisionError {
    fn from(err: anyhow::Error) -> Self {
        Self::Configuration {
            message: err.to_string(),
        }
    }
}

/// Convert I/O errors to filesystem errors.
///
/// Code that knows the path and operation should build
/// `VisionError::FileSystem` directly instead.
impl From<std::io::Error> for VisionError {
    fn from(err: std::io::Error) -> Self {
        Self::FileSystem {
            path: PathBuf::from("unknown"),
            operation: "unknown".to_string(),
            source: err,
        }
    }
}

impl From<image::ImageError> for VisionError {
    fn from(err: image::ImageError) -> Self {
        Self::ImageProcessing {
            path: "unknown".to_string(),
            operation: "image processing".to_string(),
            source: Box::new(err),
        }
    }
}

impl From<ort::Error> for VisionError {
    fn from(err: ort::Error) -> Self {
        Self::Inference {
            operation: "ort operation".to_string(),
            source: Box::new(err),
        }
    }
}

/// Shape errors come from reshaping engine outputs, so they are reported as
/// tensor layout problems rather than engine failures.
impl From<ndarray::ShapeError> for VisionError {
    fn from(err: ndarray::ShapeError) -> Self {
        Self::TensorShape {
            tensor: "ndarray".to_string(),
            expected: err.to_string(),
            actual: Vec::new(),
        }
    }
}

impl From<serde_yaml::Error> for VisionError {
    fn from(err: serde_yaml::Error) -> Self {
        Self::Configuration {
            message: format!("invalid YAML: {err}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recoverable_policy() {
        let decode = VisionError::ImageDecode {
            path: "a.jpg".into(),
            source: image::ImageError::IoError(std::io::Error::other("broken")),
        };
        assert!(decode.is_recoverable());
        assert!(VisionError::inference("run", "engine failed").is_recoverable());

        assert!(!VisionError::tensor_shape("output0", "[1, 84, N]", &[1, 2]).is_recoverable());
        assert!(!VisionError::configuration("bad yaml").is_recoverable());
        assert!(!VisionError::TaskMismatch {
            message: "masks".to_string()
        }
        .is_recoverable());
    }

    #[test]
    fn test_shape_error_message() {
        let err = VisionError::tensor_shape("bboxes", "[1, topk, 4]", &[1, 100, 5]);
        assert_eq!(
            err.to_string(),
            "Tensor shape mismatch for `bboxes`: expected [1, topk, 4], got [1, 100, 5]"
        );
    }
}
