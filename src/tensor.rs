use std::collections::BTreeMap;

use ndarray::{ArrayD, ArrayViewD};

use crate::errors::{Result, VisionError};

/// A typed tensor buffer exchanged with the inference engine.
#[derive(Debug, Clone, PartialEq)]
pub enum TensorValue {
    Float32(ArrayD<f32>),
    Int64(ArrayD<i64>),
    Int32(ArrayD<i32>),
}

impl TensorValue {
    pub fn shape(&self) -> &[usize] {
        match self {
            Self::Float32(a) => a.shape(),
            Self::Int64(a) => a.shape(),
            Self::Int32(a) => a.shape(),
        }
    }

    pub const fn dtype(&self) -> &'static str {
        match self {
            Self::Float32(_) => "float32",
            Self::Int64(_) => "int64",
            Self::Int32(_) => "int32",
        }
    }

    /// Integer tensors are widened so postprocessing can treat label and
    /// count outputs uniformly regardless of the export's dtype.
    pub fn to_f32(&self) -> ArrayD<f32> {
        match self {
            Self::Float32(a) => a.clone(),
            Self::Int64(a) => a.mapv(|v| v as f32),
            Self::Int32(a) => a.mapv(|v| v as f32),
        }
    }
}

impl From<ArrayD<f32>> for TensorValue {
    fn from(value: ArrayD<f32>) -> Self {
        Self::Float32(value)
    }
}

impl From<ArrayD<i64>> for TensorValue {
    fn from(value: ArrayD<i64>) -> Self {
        Self::Int64(value)
    }
}

impl From<ArrayD<i32>> for TensorValue {
    fn from(value: ArrayD<i32>) -> Self {
        Self::Int32(value)
    }
}

/// Named tensor slots passed between preprocessing, inference and
/// postprocessing. Ordered by name so iteration is deterministic.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TensorBundle {
    slots: BTreeMap<String, TensorValue>,
}

impl TensorBundle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<TensorValue>) {
        self.slots.insert(name.into(), value.into());
    }

    pub fn with(mut self, name: impl Into<String>, value: impl Into<TensorValue>) -> Self {
        self.insert(name, value);
        self
    }

    pub fn get(&self, name: &str) -> Option<&TensorValue> {
        self.slots.get(name)
    }

    pub fn remove(&mut self, name: &str) -> Option<TensorValue> {
        self.slots.remove(name)
    }

    pub fn clear(&mut self) {
        self.slots.clear();
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.slots.keys().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &TensorValue)> {
        self.slots.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn require(&self, name: &str) -> Result<&TensorValue> {
        self.slots.get(name).ok_or_else(|| {
            VisionError::validation(
                format!("tensor `{name}`"),
                format!(
                    "is missing (available: {})",
                    self.names().collect::<Vec<_>>().join(", ")
                ),
            )
        })
    }

    /// Borrow a float tensor, failing if the slot holds another dtype.
    pub fn f32_view(&self, name: &str) -> Result<ArrayViewD<'_, f32>> {
        match self.require(name)? {
            TensorValue::Float32(a) => Ok(a.view()),
            other => Err(VisionError::tensor_shape(
                name,
                format!("float32 tensor, found {}", other.dtype()),
                other.shape(),
            )),
        }
    }

    /// The first tensor whose rank is `ndim`, in name order.
    pub fn find_by_rank(&self, ndim: usize) -> Option<(&str, &TensorValue)> {
        self.iter().find(|(_, v)| v.shape().len() == ndim)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{Array2, IxDyn};

    #[test]
    fn test_bundle_slots_are_ordered_and_typed() -> Result<()> {
        let mut bundle = TensorBundle::new();
        bundle.insert("scores", Array2::<f32>::zeros((1, 3)).into_dyn());
        bundle.insert("labels", Array2::<i64>::ones((1, 3)).into_dyn());

        assert_eq!(bundle.names().collect::<Vec<_>>(), vec!["labels", "scores"]);
        assert_eq!(bundle.f32_view("scores")?.shape(), &[1, 3]);
        assert!(bundle.f32_view("labels").is_err());
        assert_eq!(bundle.require("labels")?.to_f32()[[0, 2]], 1.0);
        assert!(bundle.require("boxes").is_err());
        Ok(())
    }

    #[test]
    fn test_find_by_rank() {
        let bundle = TensorBundle::new()
            .with("output0", ArrayD::<f32>::zeros(IxDyn(&[1, 116, 10])))
            .with("output1", ArrayD::<f32>::zeros(IxDyn(&[1, 32, 4, 4])));

        assert_eq!(bundle.find_by_rank(4).map(|(n, _)| n), Some("output1"));
        assert_eq!(bundle.find_by_rank(3).map(|(n, _)| n), Some("output0"));
        assert!(bundle.find_by_rank(2).is_none());
    }
}
