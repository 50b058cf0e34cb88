use std::{collections::BTreeMap, path::Path};

use ndarray::prelude::*;
use parking_lot::Mutex;
use tokenizers::Tokenizer;
use tracing::{debug, info};

use crate::{
    config::{EngineConfig, Framework, TextEncoderConfig, TokenDtype},
    errors::{Result, VisionError},
    session::{Backend, OrtBackend},
    tensor::TensorBundle,
};

/// Slot written by [`TextEncoder::forward`].
pub const TEXT_EMBEDDINGS: &str = "text_embeddings";

/// String to token ids, special tokens included.
pub trait TextTokenizer: Send + Sync {
    fn encode(&self, text: &str) -> Result<Vec<u32>>;
}

/// HuggingFace `tokenizer.json` (CLIP BPE vocabulary and merges).
pub struct HfTokenizer {
    inner: Tokenizer,
}

impl HfTokenizer {
    pub fn from_file(path: &Path) -> Result<Self> {
        let inner = Tokenizer::from_file(path).map_err(|e| VisionError::Tokenizer {
            message: format!("failed to load {}: {e}", path.display()),
        })?;
        Ok(Self { inner })
    }
}

impl TextTokenizer for HfTokenizer {
    fn encode(&self, text: &str) -> Result<Vec<u32>> {
        let encoding = self
            .inner
            .encode(text, true)
            .map_err(|e| VisionError::Tokenizer {
                message: format!("failed to encode {text:?}: {e}"),
            })?;
        Ok(encoding.get_ids().to_vec())
    }
}

/// Fits a token sequence to exactly `len` ids.
///
/// Longer sequences keep their first `len - 1` ids followed by their last id
/// (end-of-text); shorter ones are right-padded with `pad_id`.
pub fn fit_tokens(ids: &[u32], len: usize, pad_id: u32) -> Vec<u32> {
    if len == 0 {
        return Vec::new();
    }
    if ids.len() > len {
        let mut fitted = ids[..len - 1].to_vec();
        fitted.extend(ids.last().copied());
        fitted
    } else {
        let mut fitted = ids.to_vec();
        fitted.resize(len, pad_id);
        fitted
    }
}

/// CLIP text encoder: fixed-length token rows in, one embedding per text out.
pub struct TextEncoder {
    backend: Mutex<Box<dyn Backend>>,
    tokenizer: Box<dyn TextTokenizer>,
    input_size: usize,
    output_size: usize,
    pad_id: u32,
    token_dtype: TokenDtype,
    input_name: String,
    attention_mask_name: Option<String>,
    output_name: String,
    normalize: bool,
    online: bool,
    prompts: BTreeMap<String, Vec<f32>>,
}

impl TextEncoder {
    pub fn from_config(path: &Path) -> Result<Self> {
        Self::new(TextEncoderConfig::load(path)?)
    }

    /// Explicit construction from a model, a framework tag and a tokenizer
    /// file, with default settings otherwise.
    pub fn from_paths(model_path: &Path, framework: &str, tokenizer_path: &Path) -> Result<Self> {
        let engine = EngineConfig::new(model_path, framework.parse::<Framework>()?);
        Self::new(TextEncoderConfig::new(engine, tokenizer_path))
    }

    pub fn new(config: TextEncoderConfig) -> Result<Self> {
        let tokenizer = HfTokenizer::from_file(&config.tokenizer_path)?;
        let backend = OrtBackend::from_config(&config.engine)?;
        Self::with_backend(Box::new(backend), Box::new(tokenizer), &config)
    }

    pub fn with_backend(
        backend: Box<dyn Backend>,
        tokenizer: Box<dyn TextTokenizer>,
        config: &TextEncoderConfig,
    ) -> Result<Self> {
        let input = backend
            .inputs()
            .iter()
            .find(|spec| spec.name == config.input_name)
            .ok_or_else(|| {
                VisionError::configuration(format!(
                    "model has no input named `{}`",
                    config.input_name
                ))
            })?;
        if let Some(len) = input.dim(1) {
            if len != config.context_length {
                return Err(VisionError::tensor_shape(
                    input.name.clone(),
                    format!("[N, {}] token rows", config.context_length),
                    &[1, len],
                ));
            }
        }

        let output = match &config.output_name {
            Some(name) => backend.outputs().iter().find(|spec| &spec.name == name),
            None => backend.outputs().first(),
        }
        .ok_or_else(|| VisionError::configuration("text encoder output not found"))?;
        let output_size = output
            .shape
            .last()
            .copied()
            .filter(|d| *d > 0)
            .map(|d| d as usize)
            .ok_or_else(|| {
                VisionError::configuration(format!(
                    "output `{}` has a dynamic embedding dimension {:?}",
                    output.name, output.shape
                ))
            })?;
        let output_name = output.name.clone();

        info!(
            context_length = config.context_length,
            output_size, "text encoder ready"
        );

        Ok(Self {
            backend: Mutex::new(backend),
            tokenizer,
            input_size: config.context_length,
            output_size,
            pad_id: config.pad_id,
            token_dtype: config.token_dtype,
            input_name: config.input_name.clone(),
            attention_mask_name: config.attention_mask_name.clone(),
            output_name,
            normalize: config.normalize,
            online: config.online,
            prompts: BTreeMap::new(),
        })
    }

    pub const fn input_size(&self) -> usize {
        self.input_size
    }

    pub const fn output_size(&self) -> usize {
        self.output_size
    }

    /// Encodes and caches the embeddings of a prompt list.
    pub fn set_prompt<S: AsRef<str>>(&mut self, texts: &[S]) -> Result<()> {
        let pending: Vec<&str> = unique(texts.iter().map(AsRef::as_ref))
            .into_iter()
            .filter(|text| !self.prompts.contains_key(*text))
            .collect();
        if pending.is_empty() {
            return Ok(());
        }

        let embeddings = self.encode_batch(&pending)?;
        for (text, row) in pending.iter().zip(embeddings.outer_iter()) {
            self.prompts.insert(text.to_string(), row.to_vec());
        }
        debug!(cached = self.prompts.len(), "prompt embeddings cached");
        Ok(())
    }

    pub fn cached_prompts(&self) -> impl Iterator<Item = &str> {
        self.prompts.keys().map(String::as_str)
    }

    /// Writes a `[texts.len(), output_size]` tensor to `features` under
    /// [`TEXT_EMBEDDINGS`]. Cached prompts are served without inference.
    pub fn forward<S: AsRef<str>>(&self, texts: &[S], features: &mut TensorBundle) -> Result<()> {
        let embeddings = self.encode(texts)?;
        features.insert(TEXT_EMBEDDINGS, embeddings.into_dyn());
        Ok(())
    }

    pub fn encode<S: AsRef<str>>(&self, texts: &[S]) -> Result<Array2<f32>> {
        let texts: Vec<&str> = texts.iter().map(AsRef::as_ref).collect();
        let misses: Vec<&str> = unique(texts.iter().copied())
            .into_iter()
            .filter(|text| !self.prompts.contains_key(*text))
            .collect();

        if !misses.is_empty() && !self.online {
            return Err(VisionError::validation(
                format!("text {:?}", misses[0]),
                "is not a registered prompt and the encoder is offline",
            ));
        }

        let fresh = if misses.is_empty() {
            Array2::zeros((0, self.output_size))
        } else {
            self.encode_batch(&misses)?
        };

        let mut result = Array2::<f32>::zeros((texts.len(), self.output_size));
        for (mut row, text) in result.outer_iter_mut().zip(&texts) {
            match self.prompts.get(*text) {
                Some(cached) => row.assign(&ArrayView1::from(cached.as_slice())),
                None => {
                    let index = misses.iter().position(|m| m == text).ok_or_else(|| {
                        VisionError::validation(format!("text {text:?}"), "was not encoded")
                    })?;
                    row.assign(&fresh.row(index));
                }
            }
        }
        Ok(result)
    }

    /// Token rows for `texts`, fitted to `input_size`.
    pub fn tokenize(&self, texts: &[&str]) -> Result<Array2<i64>> {
        let mut tokens = Array2::<i64>::zeros((texts.len(), self.input_size));
        for (mut row, text) in tokens.outer_iter_mut().zip(texts) {
            let ids = self.tokenizer.encode(text)?;
            let fitted = fit_tokens(&ids, self.input_size, self.pad_id);
            row.assign(&Array1::from_iter(fitted.into_iter().map(i64::from)));
        }
        Ok(tokens)
    }

    fn preprocess(&self, texts: &[&str]) -> Result<(TensorBundle, Array2<i64>)> {
        let tokens = self.tokenize(texts)?;
        let mut inputs = TensorBundle::new();
        let pad = i64::from(self.pad_id);
        let mask = tokens.mapv(|id| i64::from(id != pad));

        match self.token_dtype {
            TokenDtype::Int64 => {
                inputs.insert(self.input_name.clone(), tokens.clone().into_dyn());
                if let Some(name) = &self.attention_mask_name {
                    inputs.insert(name.clone(), mask.into_dyn());
                }
            }
            TokenDtype::Int32 => {
                inputs.insert(
                    self.input_name.clone(),
                    tokens.mapv(|v| v as i32).into_dyn(),
                );
                if let Some(name) = &self.attention_mask_name {
                    inputs.insert(name.clone(), mask.mapv(|v| v as i32).into_dyn());
                }
            }
        }
        Ok((inputs, tokens))
    }

    fn encode_batch(&self, texts: &[&str]) -> Result<Array2<f32>> {
        let (inputs, tokens) = self.preprocess(texts)?;
        let outputs = self.backend.lock().run(inputs)?;
        let raw = outputs.f32_view(&self.output_name)?;

        let mut embeddings = match raw.ndim() {
            2 => raw.into_dimensionality::<Ix2>()?.to_owned(),
            // [N, L, D] hidden states: take the end-of-text position, which
            // holds the largest id of each row
            3 => {
                let hidden = raw.into_dimensionality::<Ix3>()?;
                if hidden.shape()[..2] != *tokens.shape() {
                    return Err(VisionError::tensor_shape(
                        self.output_name.clone(),
                        format!("[{}, {}, D]", tokens.nrows(), tokens.ncols()),
                        hidden.shape(),
                    ));
                }
                let mut pooled = Array2::<f32>::zeros((hidden.shape()[0], hidden.shape()[2]));
                for ((mut row, ids), states) in pooled
                    .outer_iter_mut()
                    .zip(tokens.outer_iter())
                    .zip(hidden.outer_iter())
                {
                    row.assign(&states.row(argmax(ids)));
                }
                pooled
            }
            _ => {
                return Err(VisionError::tensor_shape(
                    self.output_name.clone(),
                    "[N, D] or [N, L, D]",
                    raw.shape(),
                ))
            }
        };

        if embeddings.shape() != [texts.len(), self.output_size] {
            return Err(VisionError::tensor_shape(
                self.output_name.clone(),
                format!("[{}, {}]", texts.len(), self.output_size),
                embeddings.shape(),
            ));
        }

        if self.normalize {
            for mut row in embeddings.outer_iter_mut() {
                let norm = row.dot(&row).sqrt();
                if norm > 0.0 {
                    row.mapv_inplace(|v| v / norm);
                }
            }
        }
        Ok(embeddings)
    }
}

fn unique<'a>(texts: impl Iterator<Item = &'a str>) -> Vec<&'a str> {
    let mut seen: Vec<&str> = Vec::new();
    for text in texts {
        if !seen.contains(&text) {
            seen.push(text);
        }
    }
    seen
}

fn argmax(row: ArrayView1<i64>) -> usize {
    row.iter()
        .enumerate()
        .fold((0, i64::MIN), |best, (i, &v)| if v > best.1 { (i, v) } else { best })
        .0
}
