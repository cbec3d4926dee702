//! The item feature pool: an immutable snapshot of `item_id -> FeatureMap`,
//! loaded once and swapped atomically by [`crate::placement::Placement`].

use std::collections::HashMap;
use std::fs;
use std::path::Path;

use tracing::warn;

use crate::feature::{hash_str_to_i64, parse_feature_map, FeatureMap, RESERVED_ID_KEY};
use crate::minia::Program;

#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    #[error("io error reading pool file: {0}")]
    Io(#[from] std::io::Error),
    #[error("pool file produced zero usable entries")]
    Empty,
}

/// An immutable, versioned snapshot of the item pool.
#[derive(Debug)]
pub struct Pool {
    version: i64,
    entries: HashMap<String, FeatureMap>,
}

impl Pool {
    /// Loads a TSV pool file: `<item_id>\t<json_feature_map>\n` per line.
    /// Malformed lines (no tab, empty id, bad JSON) are skipped and logged,
    /// not fatal. If an item expression program is supplied, it runs against
    /// each line's FeatureMap at load time (so pool-time preprocessing is
    /// already applied by the time `get` is called), with the item's raw id
    /// injected as the reserved `id` feature first unless already present.
    pub fn load(
        path: impl AsRef<Path>,
        version: i64,
        item_program: Option<&Program>,
    ) -> Result<Self, PoolError> {
        let raw = fs::read_to_string(path)?;
        let mut entries = HashMap::new();
        let mut skipped = 0usize;

        for line in raw.lines() {
            if line.is_empty() {
                continue;
            }
            let Some((id, json)) = line.split_once('\t') else {
                skipped += 1;
                warn!("pool line missing tab separator, skipping");
                continue;
            };
            let id = id.trim();
            let json = json.trim();
            if id.is_empty() {
                skipped += 1;
                warn!("pool line has empty id, skipping");
                continue;
            }

            let mut map = parse_feature_map(json);
            if json_is_malformed(json) {
                skipped += 1;
                warn!(item = id, "pool line has malformed JSON, skipping");
                continue;
            }
            map.entry(RESERVED_ID_KEY.to_string())
                .or_insert_with(|| crate::feature::FeatureValue::Int(hash_str_to_i64(id)));

            if let Some(program) = item_program {
                if let Err(e) = program.call(&mut map) {
                    skipped += 1;
                    warn!(item = id, error = %e, "item program failed, skipping line");
                    continue;
                }
            }

            entries.insert(id.to_string(), map);
        }

        if skipped > 0 {
            warn!(skipped, "pool load skipped malformed lines");
        }
        if entries.is_empty() {
            return Err(PoolError::Empty);
        }

        Ok(Self { version, entries })
    }

    pub fn version(&self) -> i64 {
        self.version
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, id: &str) -> Option<&FeatureMap> {
        self.entries.get(id)
    }
}

/// `parse_feature_map` is fail-open (returns an empty map on syntax error),
/// so the pool loader separately checks validity to distinguish "truly
/// empty JSON object" from "unparseable JSON" for the skip-and-warn count.
fn json_is_malformed(json: &str) -> bool {
    serde_json::from_str::<serde_json::Value>(json).is_err()
}
