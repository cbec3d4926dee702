//! Compiles `features.json` into Minia programs and wires their outputs into
//! GraphIO input slots for each `forward` call; owns the atomically
//! swappable item [`Pool`].

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use arc_swap::ArcSwapOption;
use tracing::warn;

use crate::arena::{Arena, ArenaError};
use crate::config::{ConfigError, FeaturesConfig, MetaConfig};
use crate::feature::{parse_feature_map, FeatureMap};
use crate::graph_io::{GraphIo, GraphIoError};
use crate::minia::{MiniaError, Program};
use crate::pool::{Pool, PoolError};

#[derive(Debug, thiserror::Error)]
pub enum PlacementError {
    #[error("config error: {0}")]
    Config(#[from] ConfigError),
    #[error("minia compile error: {0}")]
    Minia(#[from] MiniaError),
    #[error("arena error: {0}")]
    Arena(#[from] ArenaError),
    #[error("graph io error: {0}")]
    GraphIo(#[from] GraphIoError),
    #[error("slot '{0}' produced by an expression program is not a declared input")]
    UnknownSlotName(String),
}

/// Builds `name = expr;` source for one program kind: each declared
/// `{slot, expr}` entry is rewritten as `<input_name> = <expr>;`, so the
/// program's output names are exactly the input names it feeds.
fn build_program_source(entries: &[crate::config::ExprSpec], meta: &MetaConfig) -> String {
    let mut src = String::new();
    for entry in entries {
        if let Some(input) = meta.inputs.get(entry.slot) {
            src.push_str(&input.name);
            src.push_str(" = ");
            src.push_str(&entry.expr);
            src.push_str(";\n");
        }
    }
    src
}

pub struct Placement {
    user_program: Option<Program>,
    item_program: Option<Program>,
    cross_program: Option<Program>,
    slot_by_name: HashMap<String, usize>,
    pool: ArcSwapOption<Pool>,
}

impl Placement {
    pub fn new(features: &FeaturesConfig, meta: &MetaConfig) -> Result<Self, PlacementError> {
        let slot_by_name = meta
            .inputs
            .iter()
            .enumerate()
            .map(|(i, input)| (input.name.clone(), i))
            .collect();

        let user_program = compile_kind(&features.user, meta)?;
        let item_program = compile_kind(&features.item, meta)?;
        let cross_program = compile_kind(&features.cross, meta)?;

        Ok(Self {
            user_program,
            item_program,
            cross_program,
            slot_by_name,
            pool: ArcSwapOption::empty(),
        })
    }

    /// The item program used by `Pool::load` to preprocess each pool line at
    /// load time.
    pub fn item_program(&self) -> Option<&Program> {
        self.item_program.as_ref()
    }

    /// The active pool's version, or `-1` if no pool has been loaded yet.
    pub fn current_version(&self) -> i64 {
        self.pool.load().as_ref().map(|p| p.version()).unwrap_or(-1)
    }

    /// Atomically loads and swaps in a new pool snapshot. On any failure
    /// (missing file, zero usable entries) the previous pool stays active.
    pub fn reflush(&self, path: impl AsRef<Path>, version: i64) -> Result<(), PoolError> {
        match Pool::load(path, version, self.item_program.as_ref()) {
            Ok(pool) => {
                self.pool.store(Some(Arc::new(pool)));
                Ok(())
            }
            Err(e) => {
                warn!(error = %e, version, "reflush failed, keeping previous pool");
                Err(e)
            }
        }
    }

    fn slot_of(&self, name: &str) -> Result<usize, PlacementError> {
        self.slot_by_name
            .get(name)
            .copied()
            .ok_or_else(|| PlacementError::UnknownSlotName(name.to_string()))
    }

    /// Prepares a `GraphIo` for one `forward` call: pins the current pool,
    /// runs user/item/cross programs, and routes every produced feature into
    /// its declared input slot.
    #[allow(clippy::too_many_arguments)]
    pub fn put(
        &self,
        arena: &Arena,
        user_json: &str,
        items: &[String],
        out_scores: &mut [f32],
        batch: i64,
        version_out: &mut i64,
    ) -> Result<GraphIo, PlacementError> {
        let batch_usize = if batch <= 0 { 1 } else { batch as usize };
        let mut io = arena.get(batch)?;
        io.set_batch(batch_usize);
        io.set_outputs(out_scores);
        io.zero();

        // Pin the pool for the whole call: a single atomic load up front.
        let pool_guard = self.pool.load_full();
        *version_out = pool_guard.as_ref().map(|p| p.version()).unwrap_or(-1);

        let request_map = if user_json.is_empty() {
            FeatureMap::new()
        } else {
            parse_feature_map(user_json)
        };

        if let Some(program) = &self.user_program {
            if !user_json.is_empty() {
                let mut map = request_map.clone();
                program.call(&mut map)?;
                for name in program.output_names() {
                    let slot = self.slot_of(name)?;
                    if let Some(value) = map.get(name) {
                        io.inputs[slot].set_value_with_broadcast(batch_usize, value)?;
                    }
                }
            }
        }

        if let Some(program) = &self.item_program {
            for (row, item_id) in items.iter().enumerate() {
                let Some(pool) = pool_guard.as_ref() else {
                    continue;
                };
                let Some(item_map) = pool.get(item_id) else {
                    continue;
                };
                let mut map = item_map.clone();
                program.call(&mut map)?;
                for name in program.output_names() {
                    let slot = self.slot_of(name)?;
                    if let Some(value) = map.get(name) {
                        io.inputs[slot].set_value(row, value)?;
                    }
                }
            }
        }

        if let Some(program) = &self.cross_program {
            for (row, item_id) in items.iter().enumerate() {
                let Some(pool) = pool_guard.as_ref() else {
                    continue;
                };
                let Some(item_map) = pool.get(item_id) else {
                    continue;
                };
                let mut out = FeatureMap::new();
                program.call_cross(&mut out, &request_map, item_map)?;
                for name in program.output_names() {
                    let slot = self.slot_of(name)?;
                    if let Some(value) = out.get(name) {
                        io.inputs[slot].set_value(row, value)?;
                    }
                }
            }
        }

        Ok(io)
    }
}

fn compile_kind(
    entries: &[crate::config::ExprSpec],
    meta: &MetaConfig,
) -> Result<Option<Program>, PlacementError> {
    if entries.is_empty() {
        return Ok(None);
    }
    let source = build_program_source(entries, meta);
    Ok(Some(Program::compile(&source)?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ExprSpec, InputSpec, OutputSpec};
    use crate::graph_io::DType;

    fn meta_with_inputs(names: &[&str]) -> MetaConfig {
        MetaConfig {
            model_file: "graph.bin".into(),
            threads: 0,
            inputs: names
                .iter()
                .map(|n| InputSpec {
                    name: n.to_string(),
                    width: 1,
                    dtype: DType::Int64,
                })
                .collect(),
            outputs: vec![OutputSpec {
                name: "y".into(),
                width: 1,
            }],
        }
    }

    #[test]
    fn user_program_broadcasts_across_batch() {
        let meta = meta_with_inputs(&["x"]);
        let features = FeaturesConfig {
            user: vec![ExprSpec { slot: 0, expr: "7".into() }],
            item: vec![],
            cross: vec![],
        };
        let placement = Placement::new(&features, &meta).unwrap();
        let arena = Arena::new(vec![(0, 1, DType::Int64)], vec![(0, 1)]);

        let mut scores = vec![0f32; 3];
        let mut version = -2;
        let io = placement
            .put(&arena, "{}", &["A".into(), "B".into(), "C".into()], &mut scores, 3, &mut version)
            .unwrap();
        assert_eq!(io.inputs[0].as_i64(), &[7, 7, 7]);
        assert_eq!(version, -1); // no pool loaded yet
    }

    #[test]
    fn empty_user_blob_skips_user_program_and_leaves_slot_zero() {
        let meta = meta_with_inputs(&["x"]);
        let features = FeaturesConfig {
            user: vec![ExprSpec { slot: 0, expr: "7".into() }],
            item: vec![],
            cross: vec![],
        };
        let placement = Placement::new(&features, &meta).unwrap();
        let arena = Arena::new(vec![(0, 1, DType::Int64)], vec![(0, 1)]);

        let mut scores = vec![0f32; 2];
        let mut version = -2;
        let io = placement
            .put(&arena, "", &["A".into(), "B".into()], &mut scores, 2, &mut version)
            .unwrap();
        // user_len == 0 means the user program must not run at all, even
        // though it exists and would otherwise write a nonzero broadcast.
        assert_eq!(io.inputs[0].as_i64(), &[0, 0]);
    }

    #[test]
    fn item_program_misses_leave_zero_row() {
        let meta = meta_with_inputs(&["x"]);
        let features = FeaturesConfig {
            user: vec![],
            item: vec![ExprSpec { slot: 0, expr: "hash(id)".into() }],
            cross: vec![],
        };
        let placement = Placement::new(&features, &meta).unwrap();
        let arena = Arena::new(vec![(0, 1, DType::Int64)], vec![(0, 1)]);

        let dir = tempfile::tempdir().unwrap();
        let pool_path = dir.path().join("pool.tsv");
        std::fs::write(&pool_path, "A\t{}\n").unwrap();
        placement.reflush(&pool_path, 1).unwrap();

        let mut scores = vec![0f32; 2];
        let mut version = -2;
        let io = placement
            .put(&arena, "", &["A".into(), "missing".into()], &mut scores, 2, &mut version)
            .unwrap();
        assert_eq!(version, 1);
        assert_eq!(
            io.inputs[0].as_i64()[0],
            crate::feature::hash_str_to_i64("A")
        );
        assert_eq!(io.inputs[0].as_i64()[1], 0);
    }
}
