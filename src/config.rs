//! `meta.json` / `features.json` schema and validation.

use std::path::Path;

use serde::Deserialize;

use crate::graph_io::DType;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("input '{name}' has shape[0] = {got}, expected -1 (dynamic batch)")]
    NonDynamicBatch { name: String, got: i64 },
    #[error("input '{name}' has unknown dtype code {code}")]
    UnknownDType { name: String, code: i32 },
    #[error("output '{name}' has shape[0] = {got}, expected -1 (dynamic batch)")]
    OutputNonDynamicBatch { name: String, got: i64 },
    #[error("input '{0}' has an empty shape")]
    EmptyShape(String),
    #[error("features.json references slot {0}, but meta.json declares only {1} inputs")]
    SlotOutOfRange(usize, usize),
}

#[derive(Debug, Deserialize)]
pub struct InputSpecRaw {
    pub name: String,
    pub shape: Vec<i64>,
    pub dtype: i32,
}

#[derive(Debug, Deserialize)]
pub struct OutputSpecRaw {
    pub name: String,
    pub shape: Vec<i64>,
}

#[derive(Debug, Deserialize)]
struct MetaRaw {
    model: String,
    #[serde(default)]
    threads: i64,
    inputs: Vec<InputSpecRaw>,
    outputs: Vec<OutputSpecRaw>,
}

/// A validated input slot: static width (product of shape dims after the
/// batch dimension) and decoded dtype.
#[derive(Debug, Clone)]
pub struct InputSpec {
    pub name: String,
    pub width: usize,
    pub dtype: DType,
}

#[derive(Debug, Clone)]
pub struct OutputSpec {
    pub name: String,
    pub width: usize,
}

/// Validated `meta.json` graph/model fields (the `embeddings` array is
/// parsed and validated separately by `EmbeddingRegistry::load`).
#[derive(Debug, Clone)]
pub struct MetaConfig {
    pub model_file: String,
    pub threads: usize,
    pub inputs: Vec<InputSpec>,
    pub outputs: Vec<OutputSpec>,
}

impl MetaConfig {
    pub fn load(workdir: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(workdir.as_ref().join("meta.json"))?;
        let meta: MetaRaw = serde_json::from_str(&raw)?;

        let mut inputs = Vec::with_capacity(meta.inputs.len());
        for input in meta.inputs {
            if input.shape.is_empty() {
                return Err(ConfigError::EmptyShape(input.name));
            }
            if input.shape[0] != -1 {
                return Err(ConfigError::NonDynamicBatch {
                    name: input.name,
                    got: input.shape[0],
                });
            }
            let dtype = DType::from_meta_code(input.dtype).ok_or_else(|| ConfigError::UnknownDType {
                name: input.name.clone(),
                code: input.dtype,
            })?;
            let width = static_width(&input.shape);
            inputs.push(InputSpec {
                name: input.name,
                width,
                dtype,
            });
        }

        let mut outputs = Vec::with_capacity(meta.outputs.len());
        for output in meta.outputs {
            if output.shape.is_empty() {
                return Err(ConfigError::EmptyShape(output.name));
            }
            if output.shape[0] != -1 {
                return Err(ConfigError::OutputNonDynamicBatch {
                    name: output.name,
                    got: output.shape[0],
                });
            }
            let width = static_width(&output.shape);
            outputs.push(OutputSpec {
                name: output.name,
                width,
            });
        }

        Ok(Self {
            model_file: meta.model,
            threads: meta.threads.max(0) as usize,
            inputs,
            outputs,
        })
    }
}

fn static_width(shape: &[i64]) -> usize {
    shape[1..].iter().map(|&d| d.max(1) as usize).product::<usize>().max(1)
}

#[derive(Debug, Clone, Deserialize)]
pub struct ExprSpec {
    pub slot: usize,
    pub expr: String,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct FeaturesConfig {
    #[serde(default)]
    pub user: Vec<ExprSpec>,
    #[serde(default)]
    pub item: Vec<ExprSpec>,
    #[serde(default)]
    pub cross: Vec<ExprSpec>,
}

impl FeaturesConfig {
    pub fn load(workdir: impl AsRef<Path>, num_inputs: usize) -> Result<Self, ConfigError> {
        let path = workdir.as_ref().join("features.json");
        let raw = std::fs::read_to_string(&path)?;
        let config: FeaturesConfig = serde_json::from_str(&raw)?;

        for spec in config.user.iter().chain(&config.item).chain(&config.cross) {
            if spec.slot >= num_inputs {
                return Err(ConfigError::SlotOutOfRange(spec.slot, num_inputs));
            }
        }
        Ok(config)
    }
}
