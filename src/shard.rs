//! A single sorted FP16 key -> vector block inside one embedding group.
//!
//! On-disk format (little-endian):
//! ```text
//! int64  count
//! int32  dim
//! int64  keys[count]          // strictly ascending
//! uint16 values[count * dim]  // IEEE-754 half
//! ```

use std::fs::File;
use std::io::{self, BufReader, Read};
use std::path::Path;

use byteorder::{LittleEndian, ReadBytesExt};
use half::f16;

#[derive(Debug, thiserror::Error)]
pub enum ShardError {
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("dim mismatch: header says {found}, table expects {expected}")]
    DimMismatch { expected: u32, found: u32 },
    #[error("keys not strictly ascending at index {0}")]
    KeysNotSorted(usize),
    #[error("shard has {0} keys, exceeding the 1e8 limit")]
    TooManyKeys(i64),
    #[error("dim {0} exceeds the 512 limit")]
    DimTooLarge(u32),
    #[error("shard size overflows usize")]
    SizeOverflow,
}

/// A sorted key -> vector block. Keys are strictly ascending; every vector
/// has the table's `dim` width, stored on disk as FP16 and decoded to FP32
/// on read.
#[derive(Debug, Default)]
pub struct Shard {
    dim: usize,
    keys: Vec<i64>,
    // count * dim, row-major: values[i*dim .. i*dim+dim] is the vector for keys[i]
    values: Vec<u16>,
}

const MAX_KEYS: i64 = 100_000_000;
const MAX_DIM: u32 = 512;

impl Shard {
    /// An empty shard, used both as the "rolled back on error" state and as
    /// a building block for tests.
    pub fn empty(dim: usize) -> Self {
        Self {
            dim,
            keys: Vec::new(),
            values: Vec::new(),
        }
    }

    pub fn dim(&self) -> usize {
        self.dim
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    /// Loads a shard from disk, validating it against `expected_dim`. On any
    /// error the shard is never partially constructed — the caller gets the
    /// error and no Shard at all (construction rolls back to empty).
    pub fn load(path: impl AsRef<Path>, expected_dim: usize) -> Result<Self, ShardError> {
        let mut reader = BufReader::new(File::open(path)?);
        Self::read_from(&mut reader, expected_dim)
    }

    fn read_from<R: Read>(reader: &mut R, expected_dim: usize) -> Result<Self, ShardError> {
        let count = reader.read_i64::<LittleEndian>()?;
        let dim = reader.read_i32::<LittleEndian>()? as u32;

        if dim != expected_dim as u32 {
            return Err(ShardError::DimMismatch {
                expected: expected_dim as u32,
                found: dim,
            });
        }
        if dim == 0 || dim > MAX_DIM {
            return Err(ShardError::DimTooLarge(dim));
        }
        if count < 0 || count > MAX_KEYS {
            return Err(ShardError::TooManyKeys(count));
        }

        let count = count as usize;
        let dim_usize = dim as usize;
        let value_count = count
            .checked_mul(dim_usize)
            .ok_or(ShardError::SizeOverflow)?;

        let mut keys = Vec::with_capacity(count);
        for i in 0..count {
            let key = reader.read_i64::<LittleEndian>()?;
            if let Some(&prev) = keys.last() {
                if key <= prev {
                    return Err(ShardError::KeysNotSorted(i));
                }
            }
            keys.push(key);
        }

        let mut values = vec![0u16; value_count];
        for v in values.iter_mut() {
            *v = reader.read_u16::<LittleEndian>()?;
        }

        Ok(Shard {
            dim: dim_usize,
            keys,
            values,
        })
    }

    /// Binary searches `key`; on hit decodes the `dim` FP16 values into
    /// `out` and returns true. On miss, zero-fills `out` and returns false.
    pub fn lookup(&self, key: i64, out: &mut [f32]) -> bool {
        debug_assert_eq!(out.len(), self.dim);
        match self.keys.binary_search(&key) {
            Ok(idx) => {
                let base = idx * self.dim;
                for (o, bits) in out.iter_mut().zip(&self.values[base..base + self.dim]) {
                    *o = f16::from_bits(*bits).to_f32();
                }
                true
            }
            Err(_) => {
                out.fill(0.0);
                false
            }
        }
    }

    /// Looks up `keys`, writing `dim` floats per key into consecutive
    /// `dim`-sized rows of `out`. Returns the hit count.
    pub fn batch_lookup(&self, keys: &[i64], out: &mut [f32]) -> usize {
        debug_assert_eq!(out.len(), keys.len() * self.dim);
        let mut hits = 0;
        for (i, key) in keys.iter().enumerate() {
            let row = &mut out[i * self.dim..(i + 1) * self.dim];
            if self.lookup(*key, row) {
                hits += 1;
            }
        }
        hits
    }
}
