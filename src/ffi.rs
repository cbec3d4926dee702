//! C-facing surface consumed by the (out-of-scope) transport layer: one
//! object lifecycle plus `forward`/`reflush`. Every entry point validates
//! pointers before dereferencing and catches panics at the boundary so the
//! hot path never unwinds across FFI.

use std::ffi::CStr;
use std::os::raw::c_char;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::slice;

use tracing::error;

use crate::model::Model;

const STATUS_OK: i32 = 0;
const STATUS_ERROR: i32 = -1;

/// Creates a `Model` from `workdir` (a NUL-terminated UTF-8 path). Returns
/// null on any load failure or invalid pointer.
///
/// # Safety
/// `workdir` must be a valid pointer to a NUL-terminated C string.
#[no_mangle]
pub unsafe extern "C" fn create_model(workdir: *const c_char) -> *mut Model {
    if workdir.is_null() {
        return std::ptr::null_mut();
    }
    let result = catch_unwind(|| {
        let path = match CStr::from_ptr(workdir).to_str() {
            Ok(s) => s,
            Err(_) => return None,
        };
        Model::load(path).ok()
    });
    match result {
        Ok(Some(model)) => Box::into_raw(Box::new(model)),
        Ok(None) => std::ptr::null_mut(),
        Err(_) => {
            error!("panic inside create_model");
            std::ptr::null_mut()
        }
    }
}

/// Releases a `Model` previously returned by `create_model`. No-op on null.
///
/// # Safety
/// `model` must either be null or a pointer previously returned by
/// `create_model`, not yet released.
#[no_mangle]
pub unsafe extern "C" fn release_model(model: *mut Model) {
    if model.is_null() {
        return;
    }
    let _ = catch_unwind(AssertUnwindSafe(|| {
        drop(Box::from_raw(model));
    }));
}

/// Runs one inference batch. `item_ids`/`item_lens` are parallel arrays of
/// length `batch`; `out_scores` must be large enough for
/// `batch * total_output_width` floats. Returns `0` on success, `-1` on any
/// failure (logged); `version` receives the Pool version used, or `-1` if no
/// pool is loaded.
///
/// # Safety
/// All pointer arguments must be valid for the lengths described above, or
/// null where permitted (`user_bytes` with `user_len == 0`).
#[no_mangle]
pub unsafe extern "C" fn forward(
    model: *mut Model,
    user_bytes: *const u8,
    user_len: usize,
    item_ids: *const *const c_char,
    item_lens: *const usize,
    batch: i64,
    out_scores: *mut f32,
    out_scores_len: usize,
    version: *mut i64,
) -> i32 {
    if model.is_null() || version.is_null() {
        return STATUS_ERROR;
    }
    if batch > 0 && (item_ids.is_null() || item_lens.is_null()) {
        return STATUS_ERROR;
    }
    if out_scores.is_null() && out_scores_len > 0 {
        return STATUS_ERROR;
    }

    let result = catch_unwind(AssertUnwindSafe(|| {
        let model = &*model;

        let user = if user_len == 0 || user_bytes.is_null() {
            ""
        } else {
            let bytes = slice::from_raw_parts(user_bytes, user_len);
            std::str::from_utf8(bytes).unwrap_or("")
        };

        let items: Vec<String> = if batch <= 0 {
            Vec::new()
        } else {
            let ids = slice::from_raw_parts(item_ids, batch as usize);
            let lens = slice::from_raw_parts(item_lens, batch as usize);
            ids.iter()
                .zip(lens.iter())
                .map(|(&ptr, &len)| {
                    if ptr.is_null() {
                        String::new()
                    } else {
                        let bytes = slice::from_raw_parts(ptr as *const u8, len);
                        std::str::from_utf8(bytes).unwrap_or("").to_string()
                    }
                })
                .collect()
        };

        let scores = if out_scores.is_null() {
            &mut [][..]
        } else {
            slice::from_raw_parts_mut(out_scores, out_scores_len)
        };

        let mut v = -1i64;
        let status = match model.forward(user, &items, batch, scores, &mut v) {
            Ok(()) => STATUS_OK,
            Err(e) => {
                error!(error = %e, "forward failed");
                STATUS_ERROR
            }
        };
        *version = v;
        status
    }));

    match result {
        Ok(status) => status,
        Err(_) => {
            error!("panic inside forward");
            *version = -1;
            STATUS_ERROR
        }
    }
}

/// Atomically swaps in a new item pool from the file at `path`. Returns `0`
/// on success, `-1` on any failure (the previous pool remains active).
///
/// # Safety
/// `path` must be a valid pointer to `path_len` bytes of UTF-8.
#[no_mangle]
pub unsafe extern "C" fn reflush(
    model: *mut Model,
    path: *const u8,
    path_len: usize,
    version: i64,
) -> i32 {
    if model.is_null() || path.is_null() {
        return STATUS_ERROR;
    }

    let result = catch_unwind(AssertUnwindSafe(|| {
        let model = &*model;
        let bytes = slice::from_raw_parts(path, path_len);
        let Ok(path_str) = std::str::from_utf8(bytes) else {
            return STATUS_ERROR;
        };
        match model.reflush(path_str, version) {
            Ok(()) => STATUS_OK,
            Err(e) => {
                error!(error = %e, "reflush failed");
                STATUS_ERROR
            }
        }
    }));

    result.unwrap_or_else(|_| {
        error!("panic inside reflush");
        STATUS_ERROR
    })
}
