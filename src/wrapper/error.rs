//! Error types for RKLLM operations.

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Errors that can occur while driving the RKLLM runtime.
///
/// The native library reports nothing beyond "zero or not", so native
/// failures only carry the raw status code.
#[derive(Error, Debug)]
pub enum RkllmError {
    /// The shared library could not be loaded.
    #[error("failed to load library '{path}': {reason}")]
    LibraryNotFound { path: String, reason: String },

    /// A required symbol is missing from the library.
    #[error("symbol not found: {0}")]
    SymbolNotFound(String),

    /// The loaded library does not export an optional entry point.
    #[error("operation not supported by this librkllm_wrapper build: {0}")]
    Unsupported(&'static str),

    /// `rkllm_init_simple` / `rkllmwrapper_init` returned non-zero.
    #[error("failed to initialise RKLLM (code {code})")]
    InitFailed { code: i32 },

    /// `rkllm_run_simple*` / `rkllm_run_ex` returned non-zero.
    #[error("LLM inference error (code {code})")]
    InferenceFailed { code: i32 },

    /// A run or destroy was attempted without an active model.
    #[error("no model is initialised")]
    NotInitialized,

    /// `init` was called on a session that already holds a model.
    #[error("model already initialised; destroy it first")]
    AlreadyInitialized,

    /// Another session over the same library holds the native model.
    #[error("another session already owns the RKLLM runtime")]
    SessionBusy,

    /// Token input with no tokens.
    #[error("tokens slice is empty")]
    EmptyTokens,

    /// A string argument contains a NUL before its end.
    #[error("string contains an interior NUL byte at position {position}")]
    InteriorNul { position: usize },

    /// Path is not valid UTF-8.
    #[error("path is not valid UTF-8")]
    InvalidPathEncoding,

    /// Invalid parameter value.
    #[error("invalid parameter: {0}")]
    InvalidParam(String),

    /// malloc returned null.
    #[error("out of memory allocating {0} bytes")]
    OutOfMemory(usize),

    /// The FIFO could not be created.
    #[error("failed to create FIFO {path:?}: {source}")]
    FifoCreate {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The FIFO could not be opened for reading.
    #[error("failed to open FIFO {path:?}: {source}")]
    FifoOpen {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Reading from the FIFO failed mid-stream.
    #[error("failed to read from FIFO: {0}")]
    FifoRead(#[source] std::io::Error),

    /// The writer closed the FIFO before sending the end-of-stream marker.
    #[error("stream closed after {chunks} chunks without end-of-stream marker")]
    StreamClosed { chunks: usize },

    /// A run missed its deadline and was abandoned.
    ///
    /// The foreign call may still be executing and holding the session, so
    /// the model must not be used again in this process.
    #[error("generation did not finish within {after:?} (abort sent: {aborted})")]
    Timeout { after: Duration, aborted: bool },

    /// A blocking worker panicked or was cancelled.
    #[error("task join: {0}")]
    TaskJoin(String),
}

/// Result type alias for RKLLM operations.
pub type Result<T> = std::result::Result<T, RkllmError>;
