//! rkllm: bindings for the Rockchip RKLLM runtime.
//!
//! [`wrapper`] wraps the `librkllm_wrapper` entry points behind a safe
//! [`Session`]; [`stream`] implements the named-pipe protocol the runtime
//! uses to deliver tokens while a run is in progress.

pub mod wrapper;
pub mod stream;

pub use wrapper::ffi::{DEFAULT_OUTPUT_CAPACITY, RKLLM_EOS_MARKER};
pub use wrapper::{
    InitParams, Input, InputMode, RawPayload, Result, RkllmApi, RkllmError, SamplingOptions,
    Session, SessionState,
};
#[cfg(any(feature = "dynamic", feature = "static-link"))]
pub use wrapper::NativeLibrary;
pub use stream::{
    default_fifo_path, ensure_fifo, spawn_streaming, StreamOutcome, StreamReport, StreamState,
    StreamingRun,
};
