//! Safe Rust bindings for librkllm_wrapper.
//!
//! This module provides safe wrappers around the wrapper's C API, ensuring:
//! - Strings and token arrays are marshalled into NUL-terminated native memory
//!   that is released exactly once, on every path
//! - The runtime's single global model is owned by one [`Session`] at a time
//! - Clear error handling via Result types

mod alloc;
mod error;
pub mod ffi;
mod library;
mod marshal;
mod params;
mod session;

#[cfg(test)]
pub(crate) mod testing;

pub use alloc::{AllocationScope, AllocationTracker};
pub use error::{Result, RkllmError};
pub use library::{missing_symbols, ApiSets, RkllmApi, DEFAULT_LIB_PATH};
#[cfg(any(feature = "dynamic", feature = "static-link"))]
pub use library::NativeLibrary;
#[cfg(feature = "dynamic")]
pub use library::{probe_library, LibraryProbe};
pub use marshal::{
    c_string, marshal_input, nul_terminated, text_until_nul, Input, InputMode, MarshalledInput,
    OutputBuffer, RawPayload,
};
pub use params::{InitParams, SamplingOptions, DEFAULT_MAX_CONTEXT_LEN, DEFAULT_MAX_NEW_TOKENS};
pub use session::{Session, SessionState};
