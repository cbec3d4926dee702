//! The graph session: a fixed two-layer feed-forward ranking head wired to
//! the sparse embedding lookups declared by `meta.json`.
//!
//! The on-disk "graph" format is treated as opaque by callers; this stack
//! (`candle_core`/`candle_nn`) has no generic-IR loader, so the graph here
//! is the fixed shape `concat(inputs) -> Linear -> relu -> Linear ->
//! sigmoid`, with weights loaded from the `safetensors` file named by
//! `meta.json.model`, the same way `ShardedLlama::load` loads its
//! transformer weights.

use std::sync::Arc;

use candle_core::{DType as CandleDType, Device, Tensor};
use candle_nn::{linear, Linear, Module, VarBuilder};
use tracing::error;

use crate::config::MetaConfig;
use crate::embedding_registry::EmbeddingRegistry;
use crate::graph_io::{DType, GraphIo};
use crate::sparse_embedding_op::SparseEmbeddingLookupOp;

const HIDDEN_DIM: usize = 128;

#[derive(Debug, thiserror::Error)]
pub enum GraphError {
    #[error("candle error: {0}")]
    Candle(#[from] candle_core::Error),
    #[error("output buffer too small for slot {0}")]
    OutputBufferTooSmall(usize),
}

struct InputBinding {
    width: usize,
    dtype: DType,
    group: Option<u32>,
}

/// A loaded graph session: embedding-aware input projection followed by a
/// fixed feed-forward ranking head.
pub struct CPUGraph {
    device: Device,
    bindings: Vec<InputBinding>,
    registry: Arc<EmbeddingRegistry>,
    embedding_dim_total: usize,
    layer1: Linear,
    layer2: Linear,
}

impl CPUGraph {
    pub fn load(
        workdir: &std::path::Path,
        meta: &MetaConfig,
        registry: Arc<EmbeddingRegistry>,
    ) -> Result<Self, GraphError> {
        let threads = if meta.threads == 0 {
            num_cpus::get()
        } else {
            meta.threads.min(num_cpus::get())
        };
        rayon_thread_hint(threads);

        let device = Device::Cpu;
        let groups = registry.groups();
        let mut group_iter = groups.iter();

        let mut bindings = Vec::with_capacity(meta.inputs.len());
        let mut total_width = 0usize;
        for input in &meta.inputs {
            match input.dtype {
                DType::Int64 => {
                    let group = group_iter.next().copied();
                    // Only a group-bound input expands to `width * dim`
                    // embedding columns; forward()'s (Int64, None) branch
                    // casts the raw ids to floats one-for-one, contributing
                    // exactly `input.width` columns, so total_width must
                    // match that, not a `width * width` fallback.
                    match group.and_then(|g| registry.dimension(g)) {
                        Some(dim) => total_width += input.width * dim,
                        None => total_width += input.width,
                    }
                    bindings.push(InputBinding {
                        width: input.width,
                        dtype: input.dtype,
                        group,
                    });
                }
                DType::Float32 => {
                    total_width += input.width;
                    bindings.push(InputBinding {
                        width: input.width,
                        dtype: input.dtype,
                        group: None,
                    });
                }
            }
        }

        let out_width: usize = meta.outputs.iter().map(|o| o.width).sum::<usize>().max(1);

        let model_path = workdir.join(&meta.model_file);
        let vb = unsafe {
            VarBuilder::from_mmaped_safetensors(&[model_path], CandleDType::F32, &device)?
        };
        let layer1 = linear(total_width.max(1), HIDDEN_DIM, vb.pp("layer1"))?;
        let layer2 = linear(HIDDEN_DIM, out_width, vb.pp("layer2"))?;

        Ok(Self {
            device,
            bindings,
            registry,
            embedding_dim_total: total_width,
            layer1,
            layer2,
        })
    }

    /// Materializes tensors over `io`'s input buffers, runs the ranking
    /// head, and copies results into `io`'s output buffers. Returns `Ok(())`
    /// on success; any runtime exception is logged and surfaced as a
    /// `GraphError` (the caller maps this to FFI status `-1`).
    pub fn forward(&self, io: &mut GraphIo) -> Result<(), GraphError> {
        let batch = io.batch.max(1);
        let mut parts = Vec::with_capacity(self.bindings.len());

        for (i, binding) in self.bindings.iter().enumerate() {
            let input = &io.inputs[i];
            match (binding.dtype, binding.group) {
                (DType::Int64, Some(group)) => {
                    let data = &input.as_i64()[..batch * binding.width];
                    let tensor = Tensor::from_slice(data, (batch, binding.width), &self.device)?;
                    let dim = self.registry.dimension(group).unwrap_or(binding.width);
                    let op = SparseEmbeddingLookupOp::new(group, dim, self.registry.clone());
                    let looked_up = tensor.apply_op1_no_bwd(&op)?;
                    parts.push(looked_up.reshape((batch, binding.width * dim))?);
                }
                (DType::Int64, None) => {
                    let data = &input.as_i64()[..batch * binding.width];
                    let floats: Vec<f32> = data.iter().map(|&v| v as f32).collect();
                    parts.push(Tensor::from_slice(&floats, (batch, binding.width), &self.device)?);
                }
                (DType::Float32, _) => {
                    let data = &input.as_f32()[..batch * binding.width];
                    parts.push(Tensor::from_slice(data, (batch, binding.width), &self.device)?);
                }
            }
        }

        let x = if parts.len() == 1 {
            parts.remove(0)
        } else {
            Tensor::cat(&parts, 1)?
        };

        let hidden = self.layer1.forward(&x)?.relu()?;
        let logits = self.layer2.forward(&hidden)?;
        let scores = candle_nn::ops::sigmoid(&logits)?;
        let scores = scores.flatten_all()?.to_vec1::<f32>()?;

        // `scores` is row-major [batch, total_output_width]: row r holds
        // output0's w0 values immediately followed by output1's w1 values,
        // and so on. Each declared output's caller buffer is output-
        // contiguous (batch*width, not interleaved with other outputs), so
        // distribution must stride by the row width rather than slice the
        // flat vector in one contiguous chunk per output.
        let total_out_width: usize = io.outputs.iter().map(|o| o.width).sum::<usize>().max(1);
        let mut col_offset = 0;
        for (i, output) in io.outputs.iter_mut().enumerate() {
            let width = output.width;
            let dst = output
                .as_mut_slice()
                .ok_or(GraphError::OutputBufferTooSmall(i))?;
            for row in 0..batch {
                let dst_start = row * width;
                if dst_start >= dst.len() {
                    break;
                }
                let src_start = row * total_out_width + col_offset;
                if src_start >= scores.len() {
                    break;
                }
                let n = width
                    .min(dst.len() - dst_start)
                    .min(scores.len() - src_start);
                dst[dst_start..dst_start + n].copy_from_slice(&scores[src_start..src_start + n]);
            }
            col_offset += width;
        }

        Ok(())
    }

    pub fn total_input_width(&self) -> usize {
        self.embedding_dim_total
    }
}

fn rayon_thread_hint(threads: usize) {
    // candle's CPU backend uses the global rayon pool; building it more than
    // once is a no-op error we deliberately ignore.
    let _ = rayon::ThreadPoolBuilder::new()
        .num_threads(threads.max(1))
        .build_global();
}

impl std::fmt::Debug for CPUGraph {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CPUGraph")
            .field("total_input_width", &self.embedding_dim_total)
            .finish()
    }
}
