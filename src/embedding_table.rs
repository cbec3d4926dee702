//! A group of 32 [`Shard`]s partitioned by the low 5 bits of the key.

use std::path::Path;

use tracing::{info, warn};

use crate::shard::{Shard, ShardError};

pub const NUM_SHARDS: usize = 32;

#[derive(Debug, thiserror::Error)]
pub enum EmbeddingTableError {
    #[error("shard error: {0}")]
    Shard(#[from] ShardError),
    #[error("missing shard file for shard {0}")]
    MissingShard(usize),
}

/// A sharded embedding group: all lookups route to `key & 31`.
#[derive(Debug)]
pub struct EmbeddingTable {
    group_id: u32,
    dim: usize,
    shards: Vec<Shard>,
}

fn shard_index(key: i64) -> usize {
    (key & (NUM_SHARDS as i64 - 1)) as usize
}

impl EmbeddingTable {
    /// Loads `workdir/embedding{group}/shard{i}.dat` for `i in 0..32`, all of
    /// which must exist and share `dim`.
    pub fn load(
        workdir: impl AsRef<Path>,
        group_id: u32,
        dim: usize,
    ) -> Result<Self, EmbeddingTableError> {
        let group_dir = workdir.as_ref().join(format!("embedding{group_id}"));
        let mut shards = Vec::with_capacity(NUM_SHARDS);
        for i in 0..NUM_SHARDS {
            let path = group_dir.join(format!("shard{i}.dat"));
            if !path.exists() {
                return Err(EmbeddingTableError::MissingShard(i));
            }
            shards.push(Shard::load(&path, dim)?);
        }
        info!(group = group_id, dim, "loaded embedding table");
        Ok(Self {
            group_id,
            dim,
            shards,
        })
    }

    pub fn group_id(&self) -> u32 {
        self.group_id
    }

    pub fn dim(&self) -> usize {
        self.dim
    }

    pub fn count(&self) -> usize {
        self.shards.iter().map(Shard::len).sum()
    }

    /// Looks up `keys`, writing `dim` floats per key contiguously into `out`.
    /// Missing shards or out-of-range routing are local zero-fills, never a
    /// hard error, matching the per-row fail-open contract.
    pub fn batch_lookup(&self, keys: &[i64], out: &mut [f32]) {
        debug_assert_eq!(out.len(), keys.len() * self.dim);
        for (i, key) in keys.iter().enumerate() {
            let row = &mut out[i * self.dim..(i + 1) * self.dim];
            let idx = shard_index(*key);
            match self.shards.get(idx) {
                Some(shard) => {
                    shard.lookup(*key, row);
                }
                None => {
                    warn!(shard = idx, "shard index out of range, zero-filling");
                    row.fill(0.0);
                }
            }
        }
    }
}
