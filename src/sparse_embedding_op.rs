//! The single interface between the graph runtime and the sparse embedding
//! store: a `candle_core::CustomOp1` that looks up an `[B, L]` int64 key
//! tensor in one `EmbeddingTable` and produces an `[B, L, dim]` float32
//! tensor.
//!
//! Conceptually this is a custom operator registered with the graph runtime
//! in a private domain. `candle_core`'s `CustomOp1` trait (`cpu_fwd` entry
//! point, dispatched per-node at graph build time) is the idiomatic
//! equivalent in this stack.

use std::sync::Arc;

use candle_core::{CpuStorage, CustomOp1, Error as CandleError, Layout, Shape};
use tracing::error;

use crate::embedding_registry::EmbeddingRegistry;

#[derive(Debug, thiserror::Error)]
pub enum SparseOpError {
    #[error("expected rank-2 input, got shape {0:?}")]
    BadRank(Vec<usize>),
    #[error("embedding group {0} is not loaded")]
    GroupNotLoaded(u32),
    #[error("op dim {op_dim} does not match registry dim {registry_dim} for group {group}")]
    DimMismatch {
        group: u32,
        op_dim: usize,
        registry_dim: usize,
    },
    #[error("input tensor must be contiguous")]
    NotContiguous,
}

/// One instance per graph node; `group`/`dim` are fixed at construction and
/// read-only thereafter, shared registry handle for concurrent lookups.
pub struct SparseEmbeddingLookupOp {
    pub group: u32,
    pub dim: usize,
    registry: Arc<EmbeddingRegistry>,
}

impl SparseEmbeddingLookupOp {
    pub fn new(group: u32, dim: usize, registry: Arc<EmbeddingRegistry>) -> Self {
        Self {
            group,
            dim,
            registry,
        }
    }

    fn validate(&self, layout: &Layout) -> Result<(usize, usize), SparseOpError> {
        let dims = layout.shape().dims();
        if dims.len() != 2 {
            return Err(SparseOpError::BadRank(dims.to_vec()));
        }
        if !self.registry.is_loaded(self.group) {
            return Err(SparseOpError::GroupNotLoaded(self.group));
        }
        let registry_dim = self.registry.dimension(self.group).unwrap_or(0);
        if registry_dim != self.dim {
            return Err(SparseOpError::DimMismatch {
                group: self.group,
                op_dim: self.dim,
                registry_dim,
            });
        }
        Ok((dims[0], dims[1]))
    }
}

impl CustomOp1 for SparseEmbeddingLookupOp {
    fn name(&self) -> &'static str {
        "sparse_embedding_lookup"
    }

    fn cpu_fwd(&self, storage: &CpuStorage, layout: &Layout) -> candle_core::Result<(CpuStorage, Shape)> {
        let (batch, seq_len) = self.validate(layout).map_err(|e| {
            error!(error = %e, "sparse embedding lookup validation failed");
            CandleError::Msg(e.to_string())
        })?;

        let keys = storage.as_slice::<i64>()?;
        let (start, end) = layout
            .contiguous_offsets()
            .ok_or_else(|| CandleError::Msg(SparseOpError::NotContiguous.to_string()))?;
        let keys = &keys[start..end];

        let mut out = vec![0f32; batch * seq_len * self.dim];
        self.registry.batch_lookup(self.group, keys, &mut out);

        Ok((CpuStorage::F32(out), Shape::from((batch, seq_len, self.dim))))
    }
}
