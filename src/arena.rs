//! Bounded per-bucket pool of [`GraphIo`] instances, keyed by batch-size
//! bucket, so the hot path avoids allocating on every request.

use std::collections::VecDeque;

use parking_lot::Mutex;

use crate::graph_io::{DType, GraphIo, GraphIoError};

const NUM_BUCKETS: usize = 16;
const BUCKET_STEP: usize = 32;
const MAX_POOLED_BATCH: usize = NUM_BUCKETS * BUCKET_STEP; // 512
const MAX_PER_BUCKET: usize = 32;

#[derive(Debug, thiserror::Error)]
pub enum ArenaError {
    #[error("graph io construction failed: {0}")]
    GraphIo(#[from] GraphIoError),
}

/// `(slot_index, width, dtype)` for each declared graph input, and
/// `(slot_index, width)` for each declared output, in the order the graph
/// expects them.
pub struct Arena {
    input_specs: Vec<(usize, usize, DType)>,
    output_specs: Vec<(usize, usize)>,
    buckets: Vec<Mutex<VecDeque<GraphIo>>>,
}

fn bucket_label(batch: usize) -> usize {
    // ceil(batch / 32) - 1, batch already clamped to >= 1
    (batch + BUCKET_STEP - 1) / BUCKET_STEP - 1
}

impl Arena {
    pub fn new(input_specs: Vec<(usize, usize, DType)>, output_specs: Vec<(usize, usize)>) -> Self {
        let buckets = (0..NUM_BUCKETS).map(|_| Mutex::new(VecDeque::new())).collect();
        Self {
            input_specs,
            output_specs,
            buckets,
        }
    }

    /// Returns a `GraphIo` with capacity large enough for `batch` rows.
    /// `batch <= 0` is treated as 1. `batch > 512` always allocates a fresh,
    /// unpooled instance of exact capacity.
    pub fn get(&self, batch: i64) -> Result<GraphIo, ArenaError> {
        let batch = if batch <= 0 { 1 } else { batch as usize };

        if batch > MAX_POOLED_BATCH {
            return Ok(self.build(batch)?);
        }

        let label = bucket_label(batch);
        {
            let mut bucket = self.buckets[label].lock();
            if let Some(io) = bucket.pop_front() {
                return Ok(io);
            }
        }
        let capacity = (label + 1) * BUCKET_STEP;
        Ok(self.build(capacity)?)
    }

    /// Returns `io` to its bucket if its capacity is one of the pooled
    /// sizes and the bucket has room; otherwise it is dropped (freed).
    pub fn put(&self, mut io: GraphIo) {
        if io.capacity == 0 || io.capacity > MAX_POOLED_BATCH || io.capacity % BUCKET_STEP != 0 {
            return;
        }
        io.reset();
        io.zero();

        let label = io.capacity / BUCKET_STEP - 1;
        let mut bucket = self.buckets[label].lock();
        if bucket.len() < MAX_PER_BUCKET {
            bucket.push_back(io);
        }
    }

    fn build(&self, capacity: usize) -> Result<GraphIo, GraphIoError> {
        GraphIo::new(capacity, &self.input_specs, &self.output_specs)
    }
}
