//! Safe, single-session handle over the RKLLM runtime.

use std::ffi::c_char;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use super::alloc::AllocationTracker;
use super::error::{RkllmError, Result};
use super::ffi::{DEFAULT_OUTPUT_CAPACITY, RKLLM_SUCCESS};
use super::library::RkllmApi;
use super::marshal::{c_string, marshal_input, Input, InputMode, OutputBuffer};
use super::params::{path_to_str, InitParams};

/// Lifecycle of the native model as seen by a [`Session`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Uninitialized,
    Active,
    Destroyed,
}

/// Owner of the runtime's global model.
///
/// The runtime has no handle parameter: `init`, `run*` and `destroy` all act
/// on hidden process-wide state. A `Session` makes that explicit. Calls are
/// serialised by an internal lock, runs before `init` (or after `destroy`)
/// are rejected, and only one session per library can be active at a time.
///
/// A `Session` is `Send + Sync`; share it with `Arc` to stream from a
/// background task (see [`crate::stream::spawn_streaming`]).
///
/// ```rust,no_run
/// use std::sync::Arc;
/// use rkllm::{InitParams, Input, NativeLibrary, Session};
///
/// let lib = Arc::new(NativeLibrary::open("/usr/lib/librkllm_wrapper.so")?);
/// let session = Session::new(lib);
/// session.init(&InitParams::new("/models/qwen.rkllm"))?;
/// let reply = session.run(&Input::prompt("Hello, How are you?"), 8192)?;
/// println!("{}", reply);
/// session.destroy()?;
/// # Ok::<(), rkllm::RkllmError>(())
/// ```
pub struct Session<A: RkllmApi> {
    api: Arc<A>,
    state: Mutex<SessionState>,
    // Mirrors `state == Active` for calls that must not wait on the lock.
    active: AtomicBool,
    // Native memory for the call in progress; empty between calls.
    allocs: AllocationTracker,
}

impl<A: RkllmApi> Session<A> {
    /// Create an uninitialised session over `api`.
    pub fn new(api: Arc<A>) -> Self {
        Self {
            api,
            state: Mutex::new(SessionState::Uninitialized),
            active: AtomicBool::new(false),
            allocs: AllocationTracker::new(),
        }
    }

    pub fn api(&self) -> &Arc<A> {
        &self.api
    }

    pub fn state(&self) -> SessionState {
        *self.lock_state()
    }

    /// Native allocations still held by this session. Zero whenever no call
    /// is in progress.
    pub fn outstanding_allocations(&self) -> usize {
        self.allocs.len()
    }

    fn lock_state(&self) -> MutexGuard<'_, SessionState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn set_state(&self, state: &mut SessionState, next: SessionState) {
        *state = next;
        self.active
            .store(next == SessionState::Active, Ordering::SeqCst);
    }

    /// Load the model.
    ///
    /// # Errors
    ///
    /// - [`RkllmError::AlreadyInitialized`] if this session holds a model.
    /// - [`RkllmError::SessionBusy`] if another session owns the runtime.
    /// - [`RkllmError::Unsupported`] if sampling options are set but the
    ///   library lacks `rkllmwrapper_init`.
    /// - [`RkllmError::InitFailed`] if the runtime rejects the model.
    pub fn init(&self, params: &InitParams) -> Result<()> {
        let mut state = self.lock_state();
        if *state == SessionState::Active {
            return Err(RkllmError::AlreadyInitialized);
        }

        let path = params.model_path_str()?;
        let flag = self.api.session_flag();
        if flag
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(RkllmError::SessionBusy);
        }

        if let Err(e) = self.call_init(path, params) {
            flag.store(false, Ordering::SeqCst);
            return Err(e);
        }

        self.set_state(&mut state, SessionState::Active);
        tracing::info!(
            "Initialised RKLLM model {} (max_new_tokens={}, max_context_len={})",
            path,
            params.max_new_tokens,
            params.max_context_len
        );
        Ok(())
    }

    fn call_init(&self, path: &str, params: &InitParams) -> Result<()> {
        let scope = self.allocs.scope();
        let c_path = c_string(path, &scope)?;
        let options = params.to_raw_options();

        let code = match params.sampling {
            // Builds without rkllm_init_simple take the limits through the
            // options struct instead.
            None => unsafe {
                self.api
                    .init_simple(c_path, params.max_new_tokens, params.max_context_len)
                    .or_else(|| self.api.init_with_options(c_path, &options))
            }
            .ok_or(RkllmError::Unsupported("rkllm_init_simple"))?,
            Some(_) => unsafe { self.api.init_with_options(c_path, &options) }
                .ok_or(RkllmError::Unsupported("rkllmwrapper_init"))?,
        };

        if code != RKLLM_SUCCESS {
            return Err(RkllmError::InitFailed { code });
        }
        Ok(())
    }

    /// Run a generation and return the final text.
    ///
    /// Prompts go through `rkllm_run_simple`. Other inputs need a count or a
    /// pointer the plain call cannot carry, so they use
    /// `rkllm_run_simple_with_fifo` with an empty FIFO path (no streaming).
    /// Libraries that only export `rkllm_run_ex` get every input through it.
    pub fn run(&self, input: &Input, output_capacity: usize) -> Result<String> {
        self.call_run(input, None, output_capacity)
    }

    /// Run a generation while the runtime streams chunks into `fifo_path`.
    ///
    /// Someone must be reading the FIFO: the runtime blocks opening it until a
    /// reader shows up. [`crate::stream::spawn_streaming`] takes care of that.
    pub fn run_with_fifo(
        &self,
        input: &Input,
        fifo_path: &Path,
        output_capacity: usize,
    ) -> Result<String> {
        let fifo = path_to_str(fifo_path)?;
        if fifo.is_empty() {
            return Err(RkllmError::InvalidParam("empty FIFO path".to_string()));
        }
        self.call_run(input, Some(fifo), output_capacity)
    }

    fn call_run(&self, input: &Input, fifo: Option<&str>, output_capacity: usize) -> Result<String> {
        let state = self.lock_state();
        if *state != SessionState::Active {
            return Err(RkllmError::NotInitialized);
        }

        let mut output = OutputBuffer::with_capacity(output_capacity)?;
        let out = output.as_mut_ptr();
        let out_len = output.capacity_raw();

        let code = {
            let scope = self.allocs.scope();
            let marshalled = marshal_input(input, &scope)?;
            let mode = marshalled.mode.as_raw();

            let plain = match (marshalled.mode, fifo) {
                (InputMode::Prompt, None) => unsafe {
                    self.api
                        .run_simple(marshalled.ptr as *const c_char, mode, out, out_len)
                },
                _ => None,
            };

            match plain {
                Some(code) => code,
                None => {
                    let c_fifo = c_string(fifo.unwrap_or(""), &scope)?;
                    tracing::debug!(
                        "Running {:?} input ({} tokens) with FIFO {:?}",
                        marshalled.mode,
                        marshalled.token_count,
                        fifo
                    );
                    unsafe {
                        self.api
                            .run_simple_with_fifo(
                                marshalled.ptr,
                                mode,
                                c_fifo,
                                out,
                                out_len,
                                marshalled.token_count,
                            )
                            .or_else(|| {
                                self.api.run_ex(
                                    marshalled.ptr,
                                    mode,
                                    out,
                                    out_len,
                                    marshalled.token_count,
                                    c_fifo,
                                )
                            })
                    }
                    .ok_or(RkllmError::Unsupported("rkllm_run_ex"))?
                }
            }
        };
        drop(state);

        if code != RKLLM_SUCCESS {
            return Err(RkllmError::InferenceFailed { code });
        }
        Ok(output.into_text())
    }

    /// Prompt in, text out, with the default 8 KiB output buffer.
    pub fn generate(&self, prompt: &str) -> Result<String> {
        self.run(&Input::prompt(prompt), DEFAULT_OUTPUT_CAPACITY)
    }

    /// Like [`generate`](Self::generate) but streaming into `fifo_path`.
    pub fn generate_with_fifo(&self, prompt: &str, fifo_path: &Path) -> Result<String> {
        self.run_with_fifo(&Input::prompt(prompt), fifo_path, DEFAULT_OUTPUT_CAPACITY)
    }

    /// Token variant of [`generate_with_fifo`](Self::generate_with_fifo).
    ///
    /// An empty slice fails without calling into the runtime.
    pub fn generate_tokens_with_fifo(&self, tokens: &[i32], fifo_path: &Path) -> Result<String> {
        if tokens.is_empty() {
            return Err(RkllmError::EmptyTokens);
        }
        self.run_with_fifo(&Input::Tokens(tokens.to_vec()), fifo_path, DEFAULT_OUTPUT_CAPACITY)
    }

    /// Release the native model. Waits for any run in progress.
    pub fn destroy(&self) -> Result<()> {
        let mut state = self.lock_state();
        if *state != SessionState::Active {
            return Err(RkllmError::NotInitialized);
        }

        unsafe { self.api.destroy_simple() };
        self.set_state(&mut state, SessionState::Destroyed);
        self.api.session_flag().store(false, Ordering::SeqCst);

        tracing::info!("Destroyed RKLLM model");
        Ok(())
    }

    /// Ask the runtime to stop the generation in progress.
    ///
    /// Does not wait for the session lock, so it can be called while another
    /// thread is blocked in a run. Requires `rkllmwrapper_abort`.
    pub fn abort(&self) -> Result<()> {
        if !self.active.load(Ordering::SeqCst) {
            return Err(RkllmError::NotInitialized);
        }
        match self.api.abort() {
            None => Err(RkllmError::Unsupported("rkllmwrapper_abort")),
            Some(RKLLM_SUCCESS) => {
                tracing::warn!("Aborted RKLLM generation");
                Ok(())
            }
            Some(code) => Err(RkllmError::InferenceFailed { code }),
        }
    }

    /// Whether a generation is in progress. Requires `rkllmwrapper_is_running`,
    /// which forwards `rkllm_is_running`: `0` means a task is running.
    pub fn is_running(&self) -> Result<bool> {
        if !self.active.load(Ordering::SeqCst) {
            return Err(RkllmError::NotInitialized);
        }
        match self.api.is_running() {
            None => Err(RkllmError::Unsupported("rkllmwrapper_is_running")),
            Some(code) => Ok(code == RKLLM_SUCCESS),
        }
    }
}

impl<A: RkllmApi> Drop for Session<A> {
    fn drop(&mut self) {
        if self.active.load(Ordering::SeqCst) {
            tracing::warn!("Session dropped with an active model, destroying it");
            let _ = self.destroy();
        }
    }
}
