//! Raw C ABI of librkllm_wrapper.
//!
//! Everything here mirrors `rkllm_wrapper.h` bit-for-bit. Safe code should go
//! through [`Session`](super::Session) instead.

use std::ffi::{c_char, c_int, c_void};

// Input mode tags
pub const RKLLM_INPUT_PROMPT: c_int = 0;
pub const RKLLM_INPUT_TOKEN: c_int = 1;
pub const RKLLM_INPUT_EMBED: c_int = 2;
pub const RKLLM_INPUT_MULTIMODAL: c_int = 3;

/// Status returned by every entry point on success. Anything else is a failure.
pub const RKLLM_SUCCESS: c_int = 0;

/// `rkllm_run_ex` status when the reply does not fit the output buffer.
pub const RKLLM_OUTPUT_TOO_SMALL: c_int = -2;

/// Sentinel line the wrapper writes to the FIFO once generation finishes.
pub const RKLLM_EOS_MARKER: &str = "[[EOS]]";

/// Output buffer size the reference demo allocates.
pub const DEFAULT_OUTPUT_CAPACITY: usize = 8192;

// Legacy entry points: init, run and run-with-FIFO as separate calls.
pub const SYM_INIT_SIMPLE: &str = "rkllm_init_simple";
pub const SYM_RUN_SIMPLE: &str = "rkllm_run_simple";
pub const SYM_RUN_SIMPLE_WITH_FIFO: &str = "rkllm_run_simple_with_fifo";

// Shared by both generations of the wrapper.
pub const SYM_DESTROY_SIMPLE: &str = "rkllm_destroy_simple";

// Current entry points: options struct on init, one run call for everything.
pub const SYM_WRAPPER_INIT: &str = "rkllmwrapper_init";
pub const SYM_RUN_EX: &str = "rkllm_run_ex";

// Optional control calls.
pub const SYM_WRAPPER_IS_RUNNING: &str = "rkllmwrapper_is_running";
pub const SYM_WRAPPER_ABORT: &str = "rkllmwrapper_abort";

/// A library exporting all of these (plus `rkllm_destroy_simple`) is usable.
pub const SIMPLE_API_SYMBOLS: [&str; 3] = [SYM_INIT_SIMPLE, SYM_RUN_SIMPLE, SYM_RUN_SIMPLE_WITH_FIFO];

/// Likewise: the alternative complete set.
pub const EX_API_SYMBOLS: [&str; 2] = [SYM_WRAPPER_INIT, SYM_RUN_EX];

/// Everything beyond the legacy set that a library may export.
pub const EXTENDED_SYMBOLS: [&str; 4] = [
    SYM_WRAPPER_INIT,
    SYM_RUN_EX,
    SYM_WRAPPER_IS_RUNNING,
    SYM_WRAPPER_ABORT,
];

/// `RkllmOptions` from rkllm_wrapper.h.
///
/// A zero field (or `-1` for `mirostat`) leaves the runtime default in place.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct RkllmOptions {
    pub max_new_tokens: i32,
    pub max_context_len: i32,
    pub top_k: i32,
    pub top_p: f32,
    pub temperature: f32,
    pub repeat_penalty: f32,
    pub frequency_penalty: f32,
    pub presence_penalty: f32,
    pub mirostat: i32,
    pub mirostat_tau: f32,
    pub mirostat_eta: f32,
    pub n_keep: i32,
    pub skip_special_token: c_int,
    pub num_cpus: c_int,
}

// Function type signatures for libloading
pub type FnRkllmInitSimple = unsafe extern "C" fn(*const c_char, c_int, c_int) -> c_int;

pub type FnRkllmRunSimple = unsafe extern "C" fn(*const c_char, c_int, *mut c_char, c_int) -> c_int;

pub type FnRkllmRunSimpleWithFifo = unsafe extern "C" fn(
    *const c_void,
    c_int,
    *const c_char,
    *mut c_char,
    c_int,
    usize,
) -> c_int;

pub type FnRkllmDestroySimple = unsafe extern "C" fn();

/// `rkllm_run_ex`: note the FIFO path comes last, after the token count.
pub type FnRkllmRunEx = unsafe extern "C" fn(
    *const c_void,
    c_int,
    *mut c_char,
    c_int,
    usize,
    *const c_char,
) -> c_int;

pub type FnRkllmWrapperInit = unsafe extern "C" fn(*const c_char, *const RkllmOptions) -> c_int;

pub type FnRkllmWrapperIsRunning = unsafe extern "C" fn() -> c_int;

pub type FnRkllmWrapperAbort = unsafe extern "C" fn() -> c_int;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_options_layout_matches_header() {
        // 14 four-byte fields, no padding
        assert_eq!(std::mem::size_of::<RkllmOptions>(), 14 * 4);
        assert_eq!(std::mem::align_of::<RkllmOptions>(), 4);
    }

    #[test]
    fn test_mode_tags() {
        assert_eq!(RKLLM_INPUT_PROMPT, 0);
        assert_eq!(RKLLM_INPUT_TOKEN, 1);
        assert_eq!(RKLLM_INPUT_EMBED, 2);
        assert_eq!(RKLLM_INPUT_MULTIMODAL, 3);
    }
}
