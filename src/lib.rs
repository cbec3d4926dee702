//! Sharded sparse-embedding ranking inference core.
//!
//! ## Architecture
//!
//! ```text
//! workdir/
//!   meta.json          embeddings, graph I/O, model file, threads
//!   features.json      user/item/cross expression programs
//!   <model_file>        ranking head weights (safetensors)
//!   embedding<g>/
//!     shard0.dat ... shard31.dat
//! ```
//!
//! `Model::load(workdir)` wires together an [`EmbeddingRegistry`] (sharded
//! sparse embedding store), an [`Arena`] of pooled [`GraphIo`] buffers, a
//! [`CPUGraph`] ranking head, and a [`Placement`] engine that compiles
//! `features.json` into Minia expression programs. `Model::forward` is the
//! per-request hot path; `Model::reflush` atomically swaps the item pool.
//!
//! The `ffi` module exposes the same surface as a C ABI for an external
//! transport layer to link against.

pub mod arena;
pub mod config;
pub mod embedding_registry;
pub mod embedding_table;
pub mod feature;
pub mod ffi;
pub mod graph;
pub mod graph_io;
pub mod minia;
pub mod model;
pub mod placement;
pub mod pool;
pub mod shard;
pub mod sparse_embedding_op;

pub use arena::{Arena, ArenaError};
pub use config::{ConfigError, FeaturesConfig, MetaConfig};
pub use embedding_registry::{EmbeddingRegistry, RegistryError};
pub use embedding_table::{EmbeddingTable, EmbeddingTableError};
pub use feature::{FeatureMap, FeatureValue};
pub use graph::{CPUGraph, GraphError};
pub use graph_io::{DType, GraphIo, GraphIoError, Input, Output};
pub use model::{Model, ModelError};
pub use placement::{Placement, PlacementError};
pub use pool::{Pool, PoolError};
pub use shard::{Shard, ShardError};
pub use sparse_embedding_op::{SparseEmbeddingLookupOp, SparseOpError};
