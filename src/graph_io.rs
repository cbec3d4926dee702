//! Cache-aligned input/output buffers handed between [`crate::arena::Arena`],
//! [`crate::placement::Placement`], and [`crate::graph::CPUGraph`].
//!
//! No crate in the stack provides a 64-byte-aligned raw buffer directly, so
//! this reaches for `std::alloc` directly, the same way this codebase drops
//! to raw `unsafe` at the one boundary a safe wrapper doesn't cover
//! (`unsafe { VarBuilder::from_mmaped_safetensors(..) }` in the graph loader).

use std::alloc::{alloc_zeroed, dealloc, Layout};

use tracing::warn;

use crate::feature::FeatureValue;

const ALIGNMENT: usize = 64;

#[derive(Debug, thiserror::Error)]
pub enum GraphIoError {
    #[error("allocation of {0} bytes failed")]
    AllocFailed(usize),
    #[error("row {row} out of range for batch {batch}")]
    RowOutOfRange { row: usize, batch: usize },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DType {
    Float32,
    Int64,
}

impl DType {
    pub fn from_meta_code(code: i32) -> Option<DType> {
        match code {
            1 => Some(DType::Float32),
            7 => Some(DType::Int64),
            _ => None,
        }
    }

    fn elem_size(self) -> usize {
        match self {
            DType::Float32 => 4,
            DType::Int64 => 8,
        }
    }
}

/// A heap buffer aligned to 64 bytes, zeroed at construction and on demand.
#[derive(Debug)]
struct AlignedBuffer {
    ptr: *mut u8,
    len_bytes: usize,
    layout: Layout,
}

// Safety: the buffer is exclusively owned by its Input/Output and never
// aliased across threads while mutated; GraphIO instances are single-owner
// per the concurrency model (lent out by Arena to one caller at a time).
unsafe impl Send for AlignedBuffer {}

impl AlignedBuffer {
    fn new(len_bytes: usize) -> Result<Self, GraphIoError> {
        let len_bytes = len_bytes.max(1);
        let layout = Layout::from_size_align(len_bytes, ALIGNMENT)
            .map_err(|_| GraphIoError::AllocFailed(len_bytes))?;
        let ptr = unsafe { alloc_zeroed(layout) };
        if ptr.is_null() {
            return Err(GraphIoError::AllocFailed(len_bytes));
        }
        Ok(Self {
            ptr,
            len_bytes,
            layout,
        })
    }

    fn zero(&mut self) {
        unsafe {
            std::ptr::write_bytes(self.ptr, 0, self.len_bytes);
        }
    }

    fn as_bytes_mut(&mut self) -> &mut [u8] {
        unsafe { std::slice::from_raw_parts_mut(self.ptr, self.len_bytes) }
    }

    fn as_bytes(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.ptr, self.len_bytes) }
    }
}

impl Drop for AlignedBuffer {
    fn drop(&mut self) {
        unsafe {
            dealloc(self.ptr, self.layout);
        }
    }
}

/// A single graph input slot: `capacity * width` elements of `dtype`,
/// cache-aligned.
#[derive(Debug)]
pub struct Input {
    pub slot_index: usize,
    pub capacity: usize,
    pub batch: usize,
    pub width: usize,
    pub dtype: DType,
    buffer: AlignedBuffer,
}

impl Input {
    pub fn new(
        slot_index: usize,
        capacity: usize,
        width: usize,
        dtype: DType,
    ) -> Result<Self, GraphIoError> {
        let buffer = AlignedBuffer::new(capacity * width * dtype.elem_size())?;
        Ok(Self {
            slot_index,
            capacity,
            batch: 0,
            width,
            dtype,
            buffer,
        })
    }

    pub fn zero(&mut self) {
        self.buffer.zero();
    }

    pub fn data(&self) -> &[u8] {
        self.buffer.as_bytes()
    }

    fn float_slice_mut(&mut self) -> &mut [f32] {
        let bytes = self.buffer.as_bytes_mut();
        unsafe {
            std::slice::from_raw_parts_mut(bytes.as_mut_ptr() as *mut f32, bytes.len() / 4)
        }
    }

    fn int_slice_mut(&mut self) -> &mut [i64] {
        let bytes = self.buffer.as_bytes_mut();
        unsafe {
            std::slice::from_raw_parts_mut(bytes.as_mut_ptr() as *mut i64, bytes.len() / 8)
        }
    }

    pub fn as_f32(&self) -> &[f32] {
        let bytes = self.buffer.as_bytes();
        unsafe { std::slice::from_raw_parts(bytes.as_ptr() as *const f32, bytes.len() / 4) }
    }

    pub fn as_i64(&self) -> &[i64] {
        let bytes = self.buffer.as_bytes();
        unsafe { std::slice::from_raw_parts(bytes.as_ptr() as *const i64, bytes.len() / 8) }
    }

    /// Writes one row. Scalars write a single element at `row*width`; arrays
    /// copy `min(len, width)` elements and truncate silently (logged) when
    /// longer than `width`.
    pub fn set_value(&mut self, row: usize, value: &FeatureValue) -> Result<(), GraphIoError> {
        if row >= self.capacity {
            return Err(GraphIoError::RowOutOfRange {
                row,
                batch: self.capacity,
            });
        }
        let width = self.width;
        match self.dtype {
            DType::Float32 => {
                let floats = extract_floats(value);
                let dst = &mut self.float_slice_mut()[row * width..(row + 1) * width];
                write_row(dst, &floats);
            }
            DType::Int64 => {
                let ints = extract_ints(value);
                let dst = &mut self.int_slice_mut()[row * width..(row + 1) * width];
                write_row(dst, &ints);
            }
        }
        Ok(())
    }

    /// Writes `value` to row 0, then replicates row 0 across rows
    /// `1..batch`. Used for user features, identical across the whole batch.
    pub fn set_value_with_broadcast(
        &mut self,
        batch: usize,
        value: &FeatureValue,
    ) -> Result<(), GraphIoError> {
        self.set_value(0, value)?;
        let width = self.width;
        match self.dtype {
            DType::Float32 => {
                let row0: Vec<f32> = self.float_slice_mut()[0..width].to_vec();
                let slice = self.float_slice_mut();
                for b in 1..batch.min(self.capacity) {
                    slice[b * width..(b + 1) * width].copy_from_slice(&row0);
                }
            }
            DType::Int64 => {
                let row0: Vec<i64> = self.int_slice_mut()[0..width].to_vec();
                let slice = self.int_slice_mut();
                for b in 1..batch.min(self.capacity) {
                    slice[b * width..(b + 1) * width].copy_from_slice(&row0);
                }
            }
        }
        Ok(())
    }
}

fn write_row<T: Copy + Default>(dst: &mut [T], src: &[T]) {
    let width = dst.len();
    if src.len() > width {
        warn!(width, got = src.len(), "truncating oversized feature value");
    }
    let n = src.len().min(width);
    dst[..n].copy_from_slice(&src[..n]);
    for slot in dst.iter_mut().skip(n) {
        *slot = T::default();
    }
}

fn extract_floats(value: &FeatureValue) -> Vec<f32> {
    match value {
        FeatureValue::Int(v) => vec![*v as f32],
        FeatureValue::Float(v) => vec![*v],
        FeatureValue::IntArray(v) => v.iter().map(|x| *x as f32).collect(),
        FeatureValue::FloatArray(v) => v.clone(),
    }
}

fn extract_ints(value: &FeatureValue) -> Vec<i64> {
    match value {
        FeatureValue::Int(v) => vec![*v],
        FeatureValue::Float(v) => vec![*v as i64],
        FeatureValue::IntArray(v) => v.clone(),
        FeatureValue::FloatArray(v) => v.iter().map(|x| *x as i64).collect(),
    }
}

/// A single graph output slot. Holds a non-owning pointer into the caller's
/// score buffer; width/dtype come from model metadata (always float32 per
/// spec).
#[derive(Debug)]
pub struct Output {
    pub slot_index: usize,
    pub width: usize,
    ptr: Option<*mut f32>,
    len: usize,
}

// Safety: same single-owner-at-a-time contract as AlignedBuffer.
unsafe impl Send for Output {}

impl Output {
    pub fn new(slot_index: usize, width: usize) -> Self {
        Self {
            slot_index,
            width,
            ptr: None,
            len: 0,
        }
    }

    /// Binds this output to a caller-owned buffer for the duration of one
    /// `forward` call.
    pub fn bind(&mut self, buf: &mut [f32]) {
        self.ptr = Some(buf.as_mut_ptr());
        self.len = buf.len();
    }

    /// Clears the external buffer pointer. Called by `Arena::put` before an
    /// instance re-enters a bucket, so a pooled GraphIO never outlives the
    /// caller buffer it was bound to.
    pub fn reset(&mut self) {
        self.ptr = None;
        self.len = 0;
    }

    pub fn zero(&mut self) {
        if let Some(ptr) = self.ptr {
            unsafe {
                std::ptr::write_bytes(ptr, 0, self.len);
            }
        }
    }

    pub fn as_mut_slice(&mut self) -> Option<&mut [f32]> {
        self.ptr.map(|ptr| unsafe { std::slice::from_raw_parts_mut(ptr, self.len) })
    }
}

/// The full set of input/output buffers for one `forward` call, lent out by
/// [`crate::arena::Arena`].
#[derive(Debug)]
pub struct GraphIo {
    pub capacity: usize,
    pub batch: usize,
    pub inputs: Vec<Input>,
    pub outputs: Vec<Output>,
}

impl GraphIo {
    pub fn new(
        capacity: usize,
        input_specs: &[(usize, usize, DType)],
        output_specs: &[(usize, usize)],
    ) -> Result<Self, GraphIoError> {
        let inputs = input_specs
            .iter()
            .map(|(slot, width, dtype)| Input::new(*slot, capacity, *width, *dtype))
            .collect::<Result<Vec<_>, _>>()?;
        let outputs = output_specs
            .iter()
            .map(|(slot, width)| Output::new(*slot, *width))
            .collect();
        Ok(Self {
            capacity,
            batch: 0,
            inputs,
            outputs,
        })
    }

    pub fn set_batch(&mut self, batch: usize) {
        self.batch = batch;
    }

    /// Binds each declared output slot to a contiguous region of the
    /// caller's flat score buffer, `batch * width` floats per slot in
    /// declaration order.
    pub fn set_outputs(&mut self, out_scores: &mut [f32]) {
        let mut offset = 0;
        for output in &mut self.outputs {
            let len = self.batch * output.width;
            let end = (offset + len).min(out_scores.len());
            output.bind(&mut out_scores[offset..end]);
            offset = end;
        }
    }

    pub fn zero(&mut self) {
        for input in &mut self.inputs {
            input.zero();
        }
        for output in &mut self.outputs {
            output.zero();
        }
    }

    /// Clears external output pointers before returning to the Arena pool.
    pub fn reset(&mut self) {
        for output in &mut self.outputs {
            output.reset();
        }
    }
}
