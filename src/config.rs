use std::{
    fs,
    path::{Path, PathBuf},
    str::FromStr,
};

use clap::{Args, Parser, Subcommand};
use image::ImageFormat;
use serde::{de::DeserializeOwned, Deserialize};

use crate::errors::{Result, VisionError};

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run a YOLO facade over every image of a directory and write annotated copies
    Detect(Config),
    /// Segment one image with SAM from point prompts
    Sam(SamArgs),
    /// Encode prompts with the CLIP text encoder and print the embeddings summary
    EncodeText(EncodeTextArgs),
}

/// Batch driver settings.
#[derive(Args, Clone, Debug)]
pub struct Config {
    /// YAML file describing the detection model
    #[arg(short, long)]
    pub config: PathBuf,

    #[arg(short, long)]
    pub input_dir: PathBuf,

    #[arg(short, long, default_value = "output")]
    pub output_dir: PathBuf,

    /// File extensions picked up from the input directory
    #[arg(
        short,
        long,
        value_delimiter = ',',
        default_values_t = default_extensions()
    )]
    pub extensions: Vec<String>,

    #[arg(short, long, default_value_t = false)]
    pub recursive: bool,

    #[arg(short, long, default_value_t = 1)]
    pub workers: usize,

    /// Re-encode annotated images with this format instead of keeping the input name
    #[arg(short, long, value_parser = check_format)]
    pub format: Option<String>,

    /// TrueType font used to print class names next to the boxes. Defaults to
    /// a common system font; labels are omitted when none is installed
    #[arg(long)]
    pub font: Option<PathBuf>,
}

impl Config {
    pub fn new(config: PathBuf, input_dir: PathBuf, output_dir: PathBuf) -> Self {
        Self {
            config,
            input_dir,
            output_dir,
            extensions: default_extensions(),
            recursive: false,
            workers: 1,
            format: None,
            font: None,
        }
    }

    pub fn accepts_extension(&self, path: &Path) -> bool {
        path.extension()
            .and_then(|ext| ext.to_str())
            .map(|ext| {
                self.extensions
                    .iter()
                    .any(|accepted| accepted.eq_ignore_ascii_case(ext))
            })
            .unwrap_or(false)
    }
}

/// Extensions of every format this build can decode.
pub fn default_extensions() -> Vec<String> {
    ImageFormat::all()
        .filter(|format| format.reading_enabled())
        .flat_map(|format| format.extensions_str().iter())
        .map(|ext| ext.to_string())
        .collect()
}

#[derive(Args, Clone, Debug)]
pub struct SamArgs {
    #[arg(long)]
    pub encoder: PathBuf,

    #[arg(long)]
    pub decoder: PathBuf,

    #[arg(long)]
    pub image: PathBuf,

    /// Prompt point as `x,y` (foreground) or `x,y,label`
    #[arg(short, long = "point", required = true, value_parser = parse_point)]
    pub points: Vec<PromptPoint>,

    #[arg(short, long, default_value = "mask.png")]
    pub output: PathBuf,
}

#[derive(Args, Clone, Debug)]
pub struct EncodeTextArgs {
    #[arg(short, long)]
    pub config: PathBuf,

    pub texts: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PromptPoint {
    pub x: i32,
    pub y: i32,
    pub label: f32,
}

fn parse_point(s: &str) -> std::result::Result<PromptPoint, String> {
    let parts: Vec<&str> = s.split(',').map(str::trim).collect();
    let int = |v: &str| {
        v.parse::<i32>()
            .map_err(|e| format!("invalid coordinate `{v}`: {e}"))
    };
    match parts.as_slice() {
        [x, y] => Ok(PromptPoint {
            x: int(x)?,
            y: int(y)?,
            label: 1.0,
        }),
        [x, y, label] => Ok(PromptPoint {
            x: int(x)?,
            y: int(y)?,
            label: label
                .parse::<f32>()
                .map_err(|e| format!("invalid label `{label}`: {e}"))?,
        }),
        _ => Err(format!("expected `x,y` or `x,y,label`, got `{s}`")),
    }
}

fn check_format(s: &str) -> std::result::Result<String, String> {
    let supported: Vec<_> = ImageFormat::all()
        .filter(|f| f.writing_enabled())
        .flat_map(|f| f.extensions_str())
        .map(|s| format!("`{}`", s))
        .collect();
    let supported_message = format!("Supported formats: {}", supported.join(", "));

    let format = ImageFormat::from_extension(s)
        .ok_or(format!("{} is not supported. {}", s, supported_message))?;
    if !format.writing_enabled() {
        return Err(format!("{} is not supported. {}", s, supported_message));
    }

    Ok(s.to_string())
}

/// Inference engine selected by the `framework` tag of a model configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(try_from = "String")]
pub enum Framework {
    #[default]
    OnnxRuntime,
    Cuda,
    TensorRt,
}

impl FromStr for Framework {
    type Err = VisionError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "onnxruntime" | "ort" | "onnx" | "cpu" => Ok(Self::OnnxRuntime),
            "cuda" => Ok(Self::Cuda),
            "tensorrt" | "trt" => Ok(Self::TensorRt),
            other => Err(VisionError::configuration(format!(
                "unknown framework `{other}` (expected onnxruntime, cuda or tensorrt)"
            ))),
        }
    }
}

impl TryFrom<String> for Framework {
    type Error = VisionError;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

/// Engine settings shared by every facade configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct EngineConfig {
    pub model_path: PathBuf,

    #[serde(default)]
    pub framework: Framework,

    #[serde(default)]
    pub device_id: i32,

    #[serde(default = "default_num_threads")]
    pub num_threads: usize,
}

impl EngineConfig {
    pub fn new(model_path: impl Into<PathBuf>, framework: Framework) -> Self {
        Self {
            model_path: model_path.into(),
            framework,
            device_id: 0,
            num_threads: default_num_threads(),
        }
    }

    fn resolve(&mut self, base: &Path) {
        self.model_path = resolve_path(base, &self.model_path);
    }
}

const fn default_num_threads() -> usize {
    4
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum YoloVariant {
    Normal,
    #[serde(alias = "e2e", alias = "end-to-end")]
    End2End,
    #[serde(alias = "seg", alias = "segmentation")]
    Segment,
}

#[derive(Debug, Clone, Deserialize)]
pub struct YoloConfig {
    #[serde(flatten)]
    pub engine: EngineConfig,

    pub variant: YoloVariant,

    #[serde(default)]
    pub class_names: Option<PathBuf>,

    /// Overrides the square input size read from the model
    #[serde(default)]
    pub input_size: Option<u32>,

    #[serde(default = "default_conf_threshold")]
    pub conf_threshold: f32,

    #[serde(default = "default_iou_threshold")]
    pub iou_threshold: f32,

    #[serde(default = "default_topk")]
    pub topk: usize,

    #[serde(default = "default_mask_threshold")]
    pub mask_threshold: f32,
}

impl YoloConfig {
    pub fn new(engine: EngineConfig, variant: YoloVariant) -> Self {
        Self {
            engine,
            variant,
            class_names: None,
            input_size: None,
            conf_threshold: default_conf_threshold(),
            iou_threshold: default_iou_threshold(),
            topk: default_topk(),
            mask_threshold: default_mask_threshold(),
        }
    }

    pub fn load(path: &Path) -> Result<Self> {
        let mut config: Self = load_yaml(path)?;
        let base = config_dir(path);
        config.engine.resolve(&base);
        config.class_names = config.class_names.map(|p| resolve_path(&base, &p));
        Ok(config)
    }
}

const fn default_conf_threshold() -> f32 {
    0.25
}

const fn default_iou_threshold() -> f32 {
    0.65
}

const fn default_topk() -> usize {
    100
}

const fn default_mask_threshold() -> f32 {
    0.5
}

#[derive(Debug, Clone, Deserialize)]
pub struct SamEncoderConfig {
    #[serde(flatten)]
    pub engine: EngineConfig,

    #[serde(default = "default_sam_image_size")]
    pub image_size: u32,

    #[serde(default = "default_sam_input_name")]
    pub input_name: String,

    #[serde(default = "default_sam_output_name")]
    pub output_name: String,
}

impl SamEncoderConfig {
    pub fn new(engine: EngineConfig) -> Self {
        Self {
            engine,
            image_size: default_sam_image_size(),
            input_name: default_sam_input_name(),
            output_name: default_sam_output_name(),
        }
    }

    pub fn load(path: &Path) -> Result<Self> {
        let mut config: Self = load_yaml(path)?;
        config.engine.resolve(&config_dir(path));
        Ok(config)
    }
}

const fn default_sam_image_size() -> u32 {
    1024
}

fn default_sam_input_name() -> String {
    "image".to_string()
}

fn default_sam_output_name() -> String {
    "image_embeddings".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct SamDecoderConfig {
    #[serde(flatten)]
    pub engine: EngineConfig,
}

impl SamDecoderConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let mut config: Self = load_yaml(path)?;
        config.engine.resolve(&config_dir(path));
        Ok(config)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TokenDtype {
    #[default]
    Int64,
    Int32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TextEncoderConfig {
    #[serde(flatten)]
    pub engine: EngineConfig,

    pub tokenizer_path: PathBuf,

    #[serde(default = "default_context_length")]
    pub context_length: usize,

    #[serde(default)]
    pub pad_id: u32,

    #[serde(default)]
    pub token_dtype: TokenDtype,

    #[serde(default = "default_text_input_name")]
    pub input_name: String,

    #[serde(default)]
    pub attention_mask_name: Option<String>,

    /// Defaults to the first output of the model
    #[serde(default)]
    pub output_name: Option<String>,

    #[serde(default = "default_true")]
    pub normalize: bool,

    /// When false only prompts registered with `set_prompt` can be encoded
    #[serde(default = "default_true")]
    pub online: bool,
}

impl TextEncoderConfig {
    pub fn new(engine: EngineConfig, tokenizer_path: impl Into<PathBuf>) -> Self {
        Self {
            engine,
            tokenizer_path: tokenizer_path.into(),
            context_length: default_context_length(),
            pad_id: 0,
            token_dtype: TokenDtype::default(),
            input_name: default_text_input_name(),
            attention_mask_name: None,
            output_name: None,
            normalize: true,
            online: true,
        }
    }

    pub fn load(path: &Path) -> Result<Self> {
        let mut config: Self = load_yaml(path)?;
        let base = config_dir(path);
        config.engine.resolve(&base);
        config.tokenizer_path = resolve_path(&base, &config.tokenizer_path);
        Ok(config)
    }
}

const fn default_context_length() -> usize {
    77
}

fn default_text_input_name() -> String {
    "input_ids".to_string()
}

const fn default_true() -> bool {
    true
}

fn load_yaml<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let text = fs::read_to_string(path).map_err(|e| VisionError::FileSystem {
        path: path.to_path_buf(),
        operation: "read model configuration".to_string(),
        source: e,
    })?;
    serde_yaml::from_str(&text).map_err(|e| {
        VisionError::configuration(format!("{}: {e}", path.display()))
    })
}

fn config_dir(path: &Path) -> PathBuf {
    path.parent().map(Path::to_path_buf).unwrap_or_default()
}

fn resolve_path(base: &Path, path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        base.join(path)
    }
}

/// Reads one class name per line, skipping blank lines.
pub fn read_class_names(path: &Path) -> Result<Vec<String>> {
    let text = fs::read_to_string(path).map_err(|e| VisionError::FileSystem {
        path: path.to_path_buf(),
        operation: "read class names".to_string(),
        source: e,
    })?;
    Ok(text
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(String::from)
        .collect())
}
