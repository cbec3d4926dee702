//! Top-level façade: owns the Arena, graph session, and Placement for one
//! loaded model artifact.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{error, info};

use crate::arena::{Arena, ArenaError};
use crate::config::{ConfigError, FeaturesConfig, MetaConfig};
use crate::embedding_registry::{EmbeddingRegistry, RegistryError};
use crate::graph::{CPUGraph, GraphError};
use crate::placement::{Placement, PlacementError};
use crate::pool::PoolError;

#[derive(Debug, thiserror::Error)]
pub enum ModelError {
    #[error("workdir does not exist or is not a directory: {0}")]
    BadWorkdir(PathBuf),
    #[error("config error: {0}")]
    Config(#[from] ConfigError),
    #[error("embedding registry error: {0}")]
    Registry(#[from] RegistryError),
    #[error("graph error: {0}")]
    Graph(#[from] GraphError),
    #[error("placement error: {0}")]
    Placement(#[from] PlacementError),
}

/// A fully loaded ranking model: embeddings, arena, graph session, and
/// feature placement, wired to one on-disk working directory.
pub struct Model {
    arena: Arena,
    graph: CPUGraph,
    placement: Placement,
}

impl Model {
    pub fn load(workdir: impl AsRef<Path>) -> Result<Self, ModelError> {
        let workdir = workdir.as_ref();
        if !workdir.is_dir() {
            return Err(ModelError::BadWorkdir(workdir.to_path_buf()));
        }

        let meta = MetaConfig::load(workdir)?;
        let registry = Arc::new(EmbeddingRegistry::load(workdir)?);
        let features = FeaturesConfig::load(workdir, meta.inputs.len())?;

        let input_specs = meta
            .inputs
            .iter()
            .enumerate()
            .map(|(i, input)| (i, input.width, input.dtype))
            .collect();
        let output_specs = meta
            .outputs
            .iter()
            .enumerate()
            .map(|(i, output)| (i, output.width))
            .collect();

        let arena = Arena::new(input_specs, output_specs);
        let graph = CPUGraph::load(workdir, &meta, registry)?;
        let placement = Placement::new(&features, &meta)?;

        info!(workdir = %workdir.display(), "model loaded");
        Ok(Self {
            arena,
            graph,
            placement,
        })
    }

    /// Runs one inference batch. `items[row]` is the pool id for that row;
    /// `scores` is a flat caller-owned buffer sized `batch * total output
    /// width`. `batch <= 0` is a documented no-op: `scores` is zeroed, the
    /// active pool version is reported, and nothing else runs.
    pub fn forward(
        &self,
        user_features: &str,
        items: &[String],
        batch: i64,
        scores: &mut [f32],
        version: &mut i64,
    ) -> Result<(), ModelError> {
        if batch <= 0 {
            scores.fill(0.0);
            *version = self.placement.current_version();
            return Ok(());
        }

        let mut io = self
            .placement
            .put(&self.arena, user_features, items, scores, batch, version)?;

        let result = self.graph.forward(&mut io);
        if let Err(e) = &result {
            error!(error = %e, "graph forward failed");
        }
        self.arena.put(io);
        result.map_err(ModelError::from)
    }

    /// Atomically swaps in a new item pool. A failed reflush logs and keeps
    /// the previous pool active; it is not surfaced as a fatal Model error.
    pub fn reflush(&self, path: impl AsRef<Path>, version: i64) -> Result<(), PoolError> {
        self.placement.reflush(path, version)
    }
}
