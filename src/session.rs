use std::path::Path;

use ort::{
    execution_providers::{
        CPUExecutionProvider, CUDAExecutionProvider, ExecutionProviderDispatch,
        TensorRTExecutionProvider,
    },
    session::{builder::SessionBuilder, Session, SessionInputValue},
    value::Tensor,
};
use tracing::{debug, info};

use crate::{
    config::{EngineConfig, Framework},
    errors::{Result, VisionError},
    tensor::{TensorBundle, TensorValue},
};

/// Name and declared shape of a model input or output. Dynamic dimensions
/// are reported as `-1`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TensorSpec {
    pub name: String,
    pub shape: Vec<i64>,
}

impl TensorSpec {
    pub fn new(name: impl Into<String>, shape: Vec<i64>) -> Self {
        Self {
            name: name.into(),
            shape,
        }
    }

    /// The dimension at `axis` if it is static.
    pub fn dim(&self, axis: usize) -> Option<usize> {
        self.shape
            .get(axis)
            .copied()
            .filter(|d| *d > 0)
            .map(|d| d as usize)
    }
}

/// A loaded model that runs forward passes on named tensors.
///
/// `run` takes `&mut self`: a backend executes one call at a time. Facades
/// keep their backend behind a mutex to uphold this across threads.
pub trait Backend: Send {
    fn run(&mut self, inputs: TensorBundle) -> Result<TensorBundle>;

    fn inputs(&self) -> &[TensorSpec];

    fn outputs(&self) -> &[TensorSpec];
}

/// ONNX Runtime session.
pub struct OrtBackend {
    session: Session,
    inputs: Vec<TensorSpec>,
    outputs: Vec<TensorSpec>,
}

impl OrtBackend {
    pub fn new(model_path: &Path, framework: Framework, device_id: i32) -> Result<Self> {
        let mut engine = EngineConfig::new(model_path, framework);
        engine.device_id = device_id;
        Self::from_config(&engine)
    }

    pub fn from_config(config: &EngineConfig) -> Result<Self> {
        let model_path = config.model_path.as_path();
        if !model_path.exists() {
            return Err(VisionError::FileSystem {
                path: model_path.to_path_buf(),
                operation: "model file existence check".to_string(),
                source: std::io::Error::new(
                    std::io::ErrorKind::NotFound,
                    "model file does not exist",
                ),
            });
        }

        let session = SessionBuilder::new()
            .map_err(|e| VisionError::inference("session builder initialization", e))?
            .with_execution_providers(execution_providers(config.framework, config.device_id))
            .map_err(|e| VisionError::inference("execution provider registration", e))?
            .with_intra_threads(config.num_threads)
            .map_err(|e| VisionError::inference("intra-op thread configuration", e))?
            .with_memory_pattern(true)
            .map_err(|e| VisionError::inference("memory pattern configuration", e))?
            .commit_from_file(model_path)
            .map_err(|e| VisionError::Configuration {
                message: format!("failed to load model {}: {e}", model_path.display()),
            })?;

        let inputs = session
            .inputs
            .iter()
            .map(|input| {
                let shape = input
                    .input_type
                    .tensor_shape()
                    .map(|s| s.to_vec())
                    .unwrap_or_default();
                TensorSpec::new(input.name.clone(), shape)
            })
            .collect::<Vec<_>>();
        let outputs = session
            .outputs
            .iter()
            .map(|output| {
                let shape = output
                    .output_type
                    .tensor_shape()
                    .map(|s| s.to_vec())
                    .unwrap_or_default();
                TensorSpec::new(output.name.clone(), shape)
            })
            .collect::<Vec<_>>();

        info!(
            model = %model_path.display(),
            framework = ?config.framework,
            inputs = ?inputs,
            outputs = ?outputs,
            "model loaded"
        );

        Ok(Self {
            session,
            inputs,
            outputs,
        })
    }
}

fn execution_providers(framework: Framework, device_id: i32) -> Vec<ExecutionProviderDispatch> {
    let cpu = CPUExecutionProvider::default().build();
    let cuda = CUDAExecutionProvider::default()
        .with_device_id(device_id)
        .build();
    match framework {
        Framework::OnnxRuntime => vec![cpu],
        Framework::Cuda => vec![cuda, cpu],
        Framework::TensorRt => vec![
            TensorRTExecutionProvider::default()
                .with_device_id(device_id)
                .build(),
            cuda,
            cpu,
        ],
    }
}

impl Backend for OrtBackend {
    fn run(&mut self, inputs: TensorBundle) -> Result<TensorBundle> {
        let mut values: Vec<(String, SessionInputValue<'static>)> =
            Vec::with_capacity(inputs.len());
        for (name, tensor) in inputs.iter() {
            let value: SessionInputValue<'static> = match tensor {
                TensorValue::Float32(a) => {
                    Tensor::from_array(a.as_standard_layout().into_owned())?.into()
                }
                TensorValue::Int64(a) => {
                    Tensor::from_array(a.as_standard_layout().into_owned())?.into()
                }
                TensorValue::Int32(a) => {
                    Tensor::from_array(a.as_standard_layout().into_owned())?.into()
                }
            };
            values.push((name.to_string(), value));
        }

        let outputs = self
            .session
            .run(values)
            .map_err(|e| VisionError::inference("session run", e))?;

        let mut bundle = TensorBundle::new();
        for spec in &self.outputs {
            let value = &outputs[spec.name.as_str()];
            let tensor = if let Ok(a) = value.try_extract_array::<f32>() {
                TensorValue::Float32(a.to_owned())
            } else if let Ok(a) = value.try_extract_array::<i64>() {
                TensorValue::Int64(a.to_owned())
            } else {
                let a = value
                    .try_extract_array::<i32>()
                    .map_err(|e| VisionError::inference(format!("extract `{}`", spec.name), e))?;
                TensorValue::Int32(a.to_owned())
            };
            debug!(output = %spec.name, shape = ?tensor.shape(), "extracted output");
            bundle.insert(spec.name.clone(), tensor);
        }

        Ok(bundle)
    }

    fn inputs(&self) -> &[TensorSpec] {
        &self.inputs
    }

    fn outputs(&self) -> &[TensorSpec] {
        &self.outputs
    }
}
