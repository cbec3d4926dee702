//! Integration tests exercising `Model` end-to-end over a real on-disk
//! working directory: embeddings, expression programs, pool, and a
//! deterministic (all-zero-weight) ranking head.

use std::collections::HashMap;
use std::fs;
use std::path::Path;

use byteorder::{LittleEndian, WriteBytesExt};
use half::f16;
use rankcore::Model;
use safetensors::tensor::{Dtype, TensorView};

const NUM_SHARDS: usize = 32;

fn write_embedding_group(workdir: &Path, group: u32, dim: usize, values: &HashMap<i64, Vec<f32>>) {
    let group_dir = workdir.join(format!("embedding{group}"));
    fs::create_dir_all(&group_dir).unwrap();
    for shard_idx in 0..NUM_SHARDS {
        let mut keys: Vec<i64> = values
            .keys()
            .copied()
            .filter(|k| (k & 31) as usize == shard_idx)
            .collect();
        keys.sort_unstable();

        let mut buf = Vec::new();
        buf.write_i64::<LittleEndian>(keys.len() as i64).unwrap();
        buf.write_i32::<LittleEndian>(dim as i32).unwrap();
        for k in &keys {
            buf.write_i64::<LittleEndian>(*k).unwrap();
        }
        for k in &keys {
            for v in &values[k] {
                buf.write_u16::<LittleEndian>(f16::from_f32(*v).to_bits()).unwrap();
            }
        }
        fs::write(group_dir.join(format!("shard{shard_idx}.dat")), buf).unwrap();
    }
}

fn f32_bytes(v: &[f32]) -> Vec<u8> {
    v.iter().flat_map(|f| f.to_le_bytes()).collect()
}

/// A ranking head with all-zero weights: regardless of input, `layer1`
/// output is zero, `relu` keeps it zero, `layer2` output is zero, and
/// `sigmoid(0) = 0.5`. This isolates the test from the (untrained) FFN's
/// arbitrary weights while still exercising the full tensor pipeline.
fn write_zero_ranking_head(path: &Path, total_width: usize, hidden: usize, out_width: usize) {
    let w1 = f32_bytes(&vec![0f32; hidden * total_width]);
    let b1 = f32_bytes(&vec![0f32; hidden]);
    let w2 = f32_bytes(&vec![0f32; out_width * hidden]);
    let b2 = f32_bytes(&vec![0f32; out_width]);

    let tensors = vec![
        (
            "layer1.weight".to_string(),
            TensorView::new(Dtype::F32, vec![hidden, total_width], &w1).unwrap(),
        ),
        (
            "layer1.bias".to_string(),
            TensorView::new(Dtype::F32, vec![hidden], &b1).unwrap(),
        ),
        (
            "layer2.weight".to_string(),
            TensorView::new(Dtype::F32, vec![out_width, hidden], &w2).unwrap(),
        ),
        (
            "layer2.bias".to_string(),
            TensorView::new(Dtype::F32, vec![out_width], &b2).unwrap(),
        ),
    ];
    safetensors::serialize_to_file(tensors, &None, path).unwrap();
}

/// A ranking head whose logits are exact linear multiples of the single
/// scalar input: `layer1` passes `x` through unchanged to every hidden unit
/// (weight column of all-ones, zero bias, and `x >= 0` so `relu` is a
/// no-op), and each `layer2` output row sums its hidden units back down to
/// `x * coeff[row]` by giving every hidden weight in that row `coeff[row] /
/// hidden`. This makes every output channel's value distinct and input-
/// dependent, so a row/column transposition in output distribution produces
/// a detectably wrong value instead of coincidentally matching.
fn write_linear_ranking_head(path: &Path, hidden: usize, coeffs: &[f32]) {
    let total_width = 1;
    let out_width = coeffs.len();

    let w1 = f32_bytes(&vec![1.0f32; hidden * total_width]);
    let b1 = f32_bytes(&vec![0f32; hidden]);
    let mut w2 = Vec::with_capacity(out_width * hidden);
    for &coeff in coeffs {
        w2.extend(std::iter::repeat(coeff / hidden as f32).take(hidden));
    }
    let w2 = f32_bytes(&w2);
    let b2 = f32_bytes(&vec![0f32; out_width]);

    let tensors = vec![
        (
            "layer1.weight".to_string(),
            TensorView::new(Dtype::F32, vec![hidden, total_width], &w1).unwrap(),
        ),
        (
            "layer1.bias".to_string(),
            TensorView::new(Dtype::F32, vec![hidden], &b1).unwrap(),
        ),
        (
            "layer2.weight".to_string(),
            TensorView::new(Dtype::F32, vec![out_width, hidden], &w2).unwrap(),
        ),
        (
            "layer2.bias".to_string(),
            TensorView::new(Dtype::F32, vec![out_width], &b2).unwrap(),
        ),
    ];
    safetensors::serialize_to_file(tensors, &None, path).unwrap();
}

fn sigmoid(x: f32) -> f32 {
    1.0 / (1.0 + (-x).exp())
}

fn build_workdir() -> tempfile::TempDir {
    let dir = tempfile::tempdir().unwrap();

    let mut embeddings = HashMap::new();
    embeddings.insert(rankcore::feature::hash_str_to_i64("A"), vec![1.0f32]);
    write_embedding_group(dir.path(), 0, 1, &embeddings);

    write_zero_ranking_head(&dir.path().join("graph.safetensors"), 1, 128, 1);

    fs::write(
        dir.path().join("meta.json"),
        r#"{
            "model": "graph.safetensors",
            "threads": 0,
            "inputs": [{"name":"x","shape":[-1,1],"dtype":7}],
            "outputs": [{"name":"y","shape":[-1,1]}],
            "embeddings": [{"group":0,"dim":1}]
        }"#,
    )
    .unwrap();

    fs::write(
        dir.path().join("features.json"),
        r#"{"item":[{"slot":0,"expr":"hash(id)"}]}"#,
    )
    .unwrap();

    fs::write(dir.path().join("pool_v1.tsv"), "A\t{}\nB\t{}\n").unwrap();
    fs::write(dir.path().join("pool_v2.tsv"), "A\t{}\n").unwrap();

    dir
}

#[test]
fn forward_runs_end_to_end_and_reports_pool_version() {
    let dir = build_workdir();
    let model = Model::load(dir.path()).unwrap();
    model.reflush(dir.path().join("pool_v1.tsv"), 1).unwrap();

    let mut scores = vec![0f32; 3];
    let mut version = -2i64;
    model
        .forward(
            "",
            &["A".to_string(), "B".to_string(), "C".to_string()],
            3,
            &mut scores,
            &mut version,
        )
        .unwrap();

    assert_eq!(version, 1);
    // sigmoid(0) for every row, since the ranking head's weights are zero.
    for s in scores {
        assert!((s - 0.5).abs() < 1e-6);
    }
}

#[test]
fn reflush_swaps_pool_version_s2() {
    let dir = build_workdir();
    let model = Model::load(dir.path()).unwrap();

    model.reflush(dir.path().join("pool_v1.tsv"), 1).unwrap();
    let mut scores = vec![0f32; 1];
    let mut version = -2;
    model.forward("", &["A".to_string()], 1, &mut scores, &mut version).unwrap();
    assert_eq!(version, 1);

    model.reflush(dir.path().join("pool_v2.tsv"), 2).unwrap();
    model.forward("", &["A".to_string()], 1, &mut scores, &mut version).unwrap();
    assert_eq!(version, 2);
}

#[test]
fn malformed_pool_line_is_skipped_not_fatal_s3() {
    let dir = build_workdir();
    fs::write(
        dir.path().join("pool_bad.tsv"),
        "A\t{}\nno-tab-here\nB\tnot-json\n",
    )
    .unwrap();

    let model = Model::load(dir.path()).unwrap();
    model.reflush(dir.path().join("pool_bad.tsv"), 5).unwrap();

    let mut scores = vec![0f32; 1];
    let mut version = -2;
    let result = model.forward("", &["A".to_string()], 1, &mut scores, &mut version);
    assert!(result.is_ok());
    assert_eq!(version, 5);
}

#[test]
fn batch_zero_is_a_no_op_s4() {
    let dir = build_workdir();
    let model = Model::load(dir.path()).unwrap();

    let mut scores = vec![9f32; 2];
    let mut version = -2;
    model.forward("", &[], 0, &mut scores, &mut version).unwrap();
    assert_eq!(scores, vec![0.0, 0.0]);
    assert_eq!(version, -1);
}

#[test]
fn item_miss_leaves_valid_non_error_result_property_9() {
    let dir = build_workdir();
    let model = Model::load(dir.path()).unwrap();
    model.reflush(dir.path().join("pool_v1.tsv"), 1).unwrap();

    let mut scores = vec![0f32; 1];
    let mut version = -2;
    let result = model.forward("", &["not-in-pool".to_string()], 1, &mut scores, &mut version);
    assert!(result.is_ok());
    assert_eq!(version, 1);
}

#[test]
fn non_dynamic_batch_shape_fails_construction_s6() {
    let dir = build_workdir();
    fs::write(
        dir.path().join("meta.json"),
        r#"{
            "model": "graph.safetensors",
            "threads": 0,
            "inputs": [{"name":"x","shape":[8,1],"dtype":7}],
            "outputs": [{"name":"y","shape":[-1,1]}],
            "embeddings": [{"group":0,"dim":1}]
        }"#,
    )
    .unwrap();

    let err = Model::load(dir.path()).unwrap_err();
    assert!(matches!(err, rankcore::ModelError::Config(_)));
}

#[test]
fn large_batch_allocates_distinct_unpooled_instances_s5() {
    let dir = build_workdir();
    let model = Model::load(dir.path()).unwrap();
    model.reflush(dir.path().join("pool_v1.tsv"), 1).unwrap();

    let items: Vec<String> = (0..600).map(|i| format!("item-{i}")).collect();
    let mut scores = vec![0f32; 600];
    let mut version = -2;
    model.forward("", &items, 600, &mut scores, &mut version).unwrap();
    assert_eq!(version, 1);
    assert_eq!(scores.len(), 600);
}

/// An Int64 input with no corresponding registered embedding group (more
/// declared Int64 inputs than embedding groups) must contribute its raw
/// width to the ranking head's expected input width, not `width * width`
/// from a stale dim fallback — otherwise every `forward()` call fails with a
/// tensor shape mismatch the moment such a model is loaded.
#[test]
fn unbound_int64_input_does_not_inflate_expected_width() {
    let dir = tempfile::tempdir().unwrap();

    let mut embeddings = HashMap::new();
    embeddings.insert(rankcore::feature::hash_str_to_i64("A"), vec![1.0f32]);
    write_embedding_group(dir.path(), 0, 1, &embeddings);

    // total width = "x" (embedded, dim 1) + "raw" (unbound, width 2) = 3.
    write_zero_ranking_head(&dir.path().join("graph.safetensors"), 3, 128, 1);

    fs::write(
        dir.path().join("meta.json"),
        r#"{
            "model": "graph.safetensors",
            "threads": 0,
            "inputs": [
                {"name":"x","shape":[-1,1],"dtype":7},
                {"name":"raw","shape":[-1,2],"dtype":7}
            ],
            "outputs": [{"name":"y","shape":[-1,1]}],
            "embeddings": [{"group":0,"dim":1}]
        }"#,
    )
    .unwrap();

    fs::write(
        dir.path().join("features.json"),
        r#"{"item":[{"slot":0,"expr":"hash(id)"}]}"#,
    )
    .unwrap();

    fs::write(dir.path().join("pool.tsv"), "A\t{}\n").unwrap();

    let model = Model::load(dir.path()).unwrap();
    model.reflush(dir.path().join("pool.tsv"), 1).unwrap();

    let mut scores = vec![0f32; 1];
    let mut version = -2;
    model
        .forward("", &["A".to_string()], 1, &mut scores, &mut version)
        .unwrap();
    assert!((scores[0] - 0.5).abs() < 1e-6);
}

/// Two declared outputs of different widths (`y0`: width 1, `y1`: width 2)
/// over a batch of two rows whose embedding-driven input differs per row.
/// Exercises the row-major-to-output-contiguous distribution in
/// `CPUGraph::forward`: a caller that flattens `out_scores` as
/// `[y0_row0, y1_row0.., y0_row1, y1_row1..]` per output (the documented
/// layout) must see each output's own values, not another row's.
#[test]
fn multi_output_scores_are_not_scrambled_across_rows() {
    let dir = tempfile::tempdir().unwrap();

    let mut embeddings = HashMap::new();
    embeddings.insert(rankcore::feature::hash_str_to_i64("A"), vec![1.0f32]);
    embeddings.insert(rankcore::feature::hash_str_to_i64("B"), vec![5.0f32]);
    write_embedding_group(dir.path(), 0, 1, &embeddings);

    // logits = [x, 2x, 3x] for output channels [y0, y1a, y1b].
    write_linear_ranking_head(&dir.path().join("graph.safetensors"), 128, &[1.0, 2.0, 3.0]);

    fs::write(
        dir.path().join("meta.json"),
        r#"{
            "model": "graph.safetensors",
            "threads": 0,
            "inputs": [{"name":"x","shape":[-1,1],"dtype":7}],
            "outputs": [{"name":"y0","shape":[-1,1]}, {"name":"y1","shape":[-1,2]}],
            "embeddings": [{"group":0,"dim":1}]
        }"#,
    )
    .unwrap();

    fs::write(
        dir.path().join("features.json"),
        r#"{"item":[{"slot":0,"expr":"hash(id)"}]}"#,
    )
    .unwrap();

    fs::write(dir.path().join("pool.tsv"), "A\t{}\nB\t{}\n").unwrap();

    let model = Model::load(dir.path()).unwrap();
    model.reflush(dir.path().join("pool.tsv"), 1).unwrap();

    // out_scores is laid out output-contiguous: y0's batch*1 floats first,
    // then y1's batch*2 floats, per `GraphIo::set_outputs`.
    let mut scores = vec![0f32; 2 * 1 + 2 * 2];
    let mut version = -2;
    model
        .forward("", &["A".to_string(), "B".to_string()], 2, &mut scores, &mut version)
        .unwrap();

    let (x_a, x_b) = (1.0f32, 5.0f32);
    let expected_y0 = [sigmoid(x_a), sigmoid(x_b)];
    let expected_y1 = [
        sigmoid(2.0 * x_a),
        sigmoid(3.0 * x_a),
        sigmoid(2.0 * x_b),
        sigmoid(3.0 * x_b),
    ];

    let (y0, y1) = scores.split_at(2);
    for (got, want) in y0.iter().zip(expected_y0.iter()) {
        assert!((got - want).abs() < 1e-5, "y0: got {got}, want {want}");
    }
    for (got, want) in y1.iter().zip(expected_y1.iter()) {
        assert!((got - want).abs() < 1e-5, "y1: got {got}, want {want}");
    }
}
