//! Process-wide singleton mapping `group_id -> EmbeddingTable`.

use std::path::Path;

use serde::Deserialize;
use tracing::info;

use crate::embedding_table::{EmbeddingTable, EmbeddingTableError};

pub const MAX_GROUPS: usize = 256;

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("meta.json read error: {0}")]
    Io(#[from] std::io::Error),
    #[error("meta.json parse error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("embedding group {0} out of range [0, {MAX_GROUPS})")]
    GroupOutOfRange(u32),
    #[error("embedding group {0} has invalid dim {1} (must be in 1..=512)")]
    InvalidDim(u32, i64),
    #[error("duplicate embedding group {0} in meta.json")]
    DuplicateGroup(u32),
    #[error("embedding table load failed for group {group}: {source}")]
    Table {
        group: u32,
        #[source]
        source: EmbeddingTableError,
    },
}

#[derive(Debug, Deserialize)]
struct EmbeddingSpec {
    group: u32,
    dim: i64,
}

#[derive(Debug, Deserialize)]
struct MetaEmbeddings {
    #[serde(default)]
    embeddings: Vec<EmbeddingSpec>,
}

/// Fixed 256-slot table-of-tables. Write-once at `load`, read-only and
/// lock-free afterward, so concurrent `batch_lookup` callers need no
/// synchronization.
#[derive(Debug, Default)]
pub struct EmbeddingRegistry {
    tables: Vec<Option<EmbeddingTable>>,
}

impl EmbeddingRegistry {
    /// Parses `workdir/meta.json`'s `embeddings` array and loads each group's
    /// shards.
    pub fn load(workdir: impl AsRef<Path>) -> Result<Self, RegistryError> {
        let workdir = workdir.as_ref();
        let raw = std::fs::read_to_string(workdir.join("meta.json"))?;
        let meta: MetaEmbeddings = serde_json::from_str(&raw)?;

        let mut tables: Vec<Option<EmbeddingTable>> = (0..MAX_GROUPS).map(|_| None).collect();
        let mut seen = vec![false; MAX_GROUPS];

        for spec in meta.embeddings {
            if spec.group as usize >= MAX_GROUPS {
                return Err(RegistryError::GroupOutOfRange(spec.group));
            }
            if spec.dim <= 0 || spec.dim > 512 {
                return Err(RegistryError::InvalidDim(spec.group, spec.dim));
            }
            if seen[spec.group as usize] {
                return Err(RegistryError::DuplicateGroup(spec.group));
            }
            seen[spec.group as usize] = true;

            let table = EmbeddingTable::load(workdir, spec.group, spec.dim as usize).map_err(
                |source| RegistryError::Table {
                    group: spec.group,
                    source,
                },
            )?;
            tables[spec.group as usize] = Some(table);
        }

        info!(groups = seen.iter().filter(|&&b| b).count(), "registry loaded");
        Ok(Self { tables })
    }

    pub fn is_loaded(&self, group: u32) -> bool {
        self.table(group).is_some()
    }

    pub fn dimension(&self, group: u32) -> Option<usize> {
        self.table(group).map(EmbeddingTable::dim)
    }

    pub fn count(&self, group: u32) -> Option<usize> {
        self.table(group).map(EmbeddingTable::count)
    }

    fn table(&self, group: u32) -> Option<&EmbeddingTable> {
        self.tables.get(group as usize).and_then(|t| t.as_ref())
    }

    /// Looks up `keys` in `group`'s table, writing `dim` floats per key into
    /// `out`. Unloaded groups zero-fill the whole output.
    pub fn batch_lookup(&self, group: u32, keys: &[i64], out: &mut [f32]) {
        match self.table(group) {
            Some(table) => table.batch_lookup(keys, out),
            None => out.fill(0.0),
        }
    }

    /// Loaded group ids in ascending order. `CPUGraph` uses this to assign
    /// each int64-typed graph input to an embedding group, in declaration
    /// order, since `meta.json` doesn't otherwise name the association.
    pub fn groups(&self) -> Vec<u32> {
        self.tables
            .iter()
            .enumerate()
            .filter_map(|(i, t)| t.as_ref().map(|_| i as u32))
            .collect()
    }
}
