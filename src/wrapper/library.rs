//! Resolution of the librkllm_wrapper entry points.
//!
//! [`RkllmApi`] is the seam between the safe layer and the native library.
//! [`NativeLibrary`] implements it over the real `.so`, either loaded at
//! runtime (`dynamic` feature) or linked at build time (`static-link`).
//!
//! Two generations of the wrapper exist. Older builds export the
//! `rkllm_*_simple` calls; newer ones export `rkllmwrapper_init` and a single
//! `rkllm_run_ex`. Both export `rkllm_destroy_simple`. A library is usable
//! when either set is complete.

use std::ffi::{c_char, c_int, c_void};
use std::sync::atomic::AtomicBool;

use serde::Serialize;

#[cfg(any(feature = "dynamic", feature = "static-link"))]
use super::error::{Result, RkllmError};
use super::ffi::*;

/// Default install location of the wrapper on Rockchip board images.
pub const DEFAULT_LIB_PATH: &str = "/usr/lib/librkllm_wrapper.so";

/// The native entry points, one method per C function.
///
/// Every call except `destroy_simple` returns `None` when the library does
/// not export it; [`Session`](super::Session) falls back between the two
/// entry-point sets.
pub trait RkllmApi: Send + Sync {
    /// `rkllm_init_simple`.
    ///
    /// # Safety
    ///
    /// `model_path` must be a valid NUL-terminated string.
    unsafe fn init_simple(
        &self,
        model_path: *const c_char,
        max_new_tokens: c_int,
        max_context_len: c_int,
    ) -> Option<c_int>;

    /// `rkllm_run_simple`.
    ///
    /// # Safety
    ///
    /// `prompt` must be NUL-terminated and `output` writable for `output_size`
    /// bytes.
    unsafe fn run_simple(
        &self,
        prompt: *const c_char,
        input_mode: c_int,
        output: *mut c_char,
        output_size: c_int,
    ) -> Option<c_int>;

    /// `rkllm_run_simple_with_fifo`.
    ///
    /// # Safety
    ///
    /// `input` must match `input_mode` (and hold `token_count` tokens for token
    /// input), `fifo_path` must be NUL-terminated and `output` writable for
    /// `output_size` bytes.
    unsafe fn run_simple_with_fifo(
        &self,
        input: *const c_void,
        input_mode: c_int,
        fifo_path: *const c_char,
        output: *mut c_char,
        output_size: c_int,
        token_count: usize,
    ) -> Option<c_int>;

    /// `rkllm_run_ex`. An empty `fifo_path` disables streaming.
    ///
    /// # Safety
    ///
    /// Same as [`run_simple_with_fifo`](Self::run_simple_with_fifo).
    unsafe fn run_ex(
        &self,
        _input: *const c_void,
        _input_mode: c_int,
        _output: *mut c_char,
        _output_size: c_int,
        _token_count: usize,
        _fifo_path: *const c_char,
    ) -> Option<c_int> {
        None
    }

    /// `rkllm_destroy_simple`.
    ///
    /// # Safety
    ///
    /// No run may be in flight.
    unsafe fn destroy_simple(&self);

    /// `rkllmwrapper_init`.
    ///
    /// # Safety
    ///
    /// Same as [`init_simple`](Self::init_simple); `options` must be valid.
    unsafe fn init_with_options(
        &self,
        _model_path: *const c_char,
        _options: *const RkllmOptions,
    ) -> Option<c_int> {
        None
    }

    /// `rkllmwrapper_is_running`: `0` while a generation is in flight.
    fn is_running(&self) -> Option<c_int> {
        None
    }

    /// `rkllmwrapper_abort`.
    fn abort(&self) -> Option<c_int> {
        None
    }

    /// Flag claimed by the session that currently owns the native model.
    ///
    /// The runtime keeps a single global model, so every handle onto the same
    /// library must return the same flag.
    fn session_flag(&self) -> &AtomicBool;
}

/// Which complete entry-point sets a library exports.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ApiSets {
    /// `rkllm_init_simple`, `rkllm_run_simple`, `rkllm_run_simple_with_fifo`.
    pub simple: bool,
    /// `rkllmwrapper_init`, `rkllm_run_ex`.
    pub ex: bool,
}

impl ApiSets {
    pub fn detect(exports: impl Fn(&str) -> bool) -> Self {
        Self {
            simple: SIMPLE_API_SYMBOLS.iter().all(|name| exports(name)),
            ex: EX_API_SYMBOLS.iter().all(|name| exports(name)),
        }
    }

    pub fn any(&self) -> bool {
        self.simple || self.ex
    }
}

/// Symbols a library lacks before it can be used, empty if usable.
///
/// When neither entry-point set is complete, the gaps are reported against
/// the legacy set.
pub fn missing_symbols(exports: impl Fn(&str) -> bool) -> Vec<&'static str> {
    let mut missing = Vec::new();
    if !ApiSets::detect(&exports).any() {
        missing.extend(SIMPLE_API_SYMBOLS.iter().filter(|name| !exports(name)));
    }
    if !exports(SYM_DESTROY_SIMPLE) {
        missing.push(SYM_DESTROY_SIMPLE);
    }
    missing
}

/// Process-wide ownership flag for the real runtime.
#[cfg(any(feature = "dynamic", feature = "static-link"))]
static NATIVE_SESSION: AtomicBool = AtomicBool::new(false);

/// Function pointers resolved from librkllm_wrapper.so (or linked statically).
#[cfg(any(feature = "dynamic", feature = "static-link"))]
struct RkllmFunctions {
    init_simple: Option<FnRkllmInitSimple>,
    run_simple: Option<FnRkllmRunSimple>,
    run_simple_with_fifo: Option<FnRkllmRunSimpleWithFifo>,
    run_ex: Option<FnRkllmRunEx>,
    destroy_simple: FnRkllmDestroySimple,
    wrapper_init: Option<FnRkllmWrapperInit>,
    wrapper_is_running: Option<FnRkllmWrapperIsRunning>,
    wrapper_abort: Option<FnRkllmWrapperAbort>,
}

#[cfg(any(feature = "dynamic", feature = "static-link"))]
impl RkllmFunctions {
    fn api_sets(&self) -> ApiSets {
        ApiSets {
            simple: self.init_simple.is_some()
                && self.run_simple.is_some()
                && self.run_simple_with_fifo.is_some(),
            ex: self.wrapper_init.is_some() && self.run_ex.is_some(),
        }
    }
}

/// Handle onto the real native library.
///
/// The `_lib` field keeps the dynamically loaded library alive.
#[cfg(any(feature = "dynamic", feature = "static-link"))]
pub struct NativeLibrary {
    funcs: RkllmFunctions,
    #[cfg(feature = "dynamic")]
    _lib: Option<libloading::Library>,
}

#[cfg(any(feature = "dynamic", feature = "static-link"))]
impl NativeLibrary {
    /// Load librkllm_wrapper.so at runtime and resolve its entry points.
    #[cfg(feature = "dynamic")]
    pub fn open(lib_path: &str) -> Result<Self> {
        let lib = unsafe {
            libloading::Library::new(lib_path).map_err(|e| RkllmError::LibraryNotFound {
                path: lib_path.to_string(),
                reason: e.to_string(),
            })?
        };

        let exports = |name: &str| unsafe { lib.get::<*const c_void>(name.as_bytes()).is_ok() };
        if let Some(name) = missing_symbols(exports).first() {
            return Err(RkllmError::SymbolNotFound(name.to_string()));
        }

        let funcs = unsafe {
            RkllmFunctions {
                init_simple: optional(&lib, SYM_INIT_SIMPLE),
                run_simple: optional(&lib, SYM_RUN_SIMPLE),
                run_simple_with_fifo: optional(&lib, SYM_RUN_SIMPLE_WITH_FIFO),
                run_ex: optional(&lib, SYM_RUN_EX),
                destroy_simple: required(&lib, SYM_DESTROY_SIMPLE)?,
                wrapper_init: optional(&lib, SYM_WRAPPER_INIT),
                wrapper_is_running: optional(&lib, SYM_WRAPPER_IS_RUNNING),
                wrapper_abort: optional(&lib, SYM_WRAPPER_ABORT),
            }
        };

        tracing::debug!("Loaded {} ({:?})", lib_path, funcs.api_sets());

        Ok(Self {
            funcs,
            _lib: Some(lib),
        })
    }

    /// Static-link variant.
    ///
    /// `rkllm_destroy_simple` is referenced directly so the linker keeps the
    /// library; everything else is looked up in the process image, so either
    /// wrapper generation links.
    #[cfg(feature = "static-link")]
    pub fn linked() -> Result<Self> {
        extern "C" {
            fn rkllm_destroy_simple();
        }

        let exports = |name: &str| unsafe { linked_symbol::<*mut c_void>(name).is_some() };
        if let Some(name) = missing_symbols(exports)
            .into_iter()
            .find(|name| *name != SYM_DESTROY_SIMPLE)
        {
            return Err(RkllmError::SymbolNotFound(name.to_string()));
        }

        let funcs = unsafe {
            RkllmFunctions {
                init_simple: linked_symbol(SYM_INIT_SIMPLE),
                run_simple: linked_symbol(SYM_RUN_SIMPLE),
                run_simple_with_fifo: linked_symbol(SYM_RUN_SIMPLE_WITH_FIFO),
                run_ex: linked_symbol(SYM_RUN_EX),
                destroy_simple: rkllm_destroy_simple,
                wrapper_init: linked_symbol(SYM_WRAPPER_INIT),
                wrapper_is_running: linked_symbol(SYM_WRAPPER_IS_RUNNING),
                wrapper_abort: linked_symbol(SYM_WRAPPER_ABORT),
            }
        };

        Ok(Self {
            funcs,
            #[cfg(feature = "dynamic")]
            _lib: None,
        })
    }

    /// Entry-point sets this library provides.
    pub fn api_sets(&self) -> ApiSets {
        self.funcs.api_sets()
    }

    /// Whether `rkllmwrapper_init` (sampling options) is available.
    pub fn has_extended_api(&self) -> bool {
        self.funcs.wrapper_init.is_some()
    }
}

#[cfg(feature = "dynamic")]
unsafe fn required<T: Copy>(lib: &libloading::Library, name: &str) -> Result<T> {
    lib.get::<T>(name.as_bytes())
        .map(|sym| *sym)
        .map_err(|_| RkllmError::SymbolNotFound(name.to_string()))
}

#[cfg(feature = "dynamic")]
unsafe fn optional<T: Copy>(lib: &libloading::Library, name: &str) -> Option<T> {
    lib.get::<T>(name.as_bytes()).map(|sym| *sym).ok()
}

/// Look `name` up among the symbols already linked into the process.
///
/// `T` must be a pointer-sized function pointer type matching the symbol.
#[cfg(feature = "static-link")]
unsafe fn linked_symbol<T: Copy>(name: &str) -> Option<T> {
    let c_name = std::ffi::CString::new(name).ok()?;
    let ptr = libc::dlsym(libc::RTLD_DEFAULT, c_name.as_ptr());
    if ptr.is_null() {
        None
    } else {
        Some(std::mem::transmute_copy::<*mut c_void, T>(&ptr))
    }
}

#[cfg(any(feature = "dynamic", feature = "static-link"))]
impl RkllmApi for NativeLibrary {
    unsafe fn init_simple(
        &self,
        model_path: *const c_char,
        max_new_tokens: c_int,
        max_context_len: c_int,
    ) -> Option<c_int> {
        self.funcs
            .init_simple
            .map(|f| f(model_path, max_new_tokens, max_context_len))
    }

    unsafe fn run_simple(
        &self,
        prompt: *const c_char,
        input_mode: c_int,
        output: *mut c_char,
        output_size: c_int,
    ) -> Option<c_int> {
        self.funcs
            .run_simple
            .map(|f| f(prompt, input_mode, output, output_size))
    }

    unsafe fn run_simple_with_fifo(
        &self,
        input: *const c_void,
        input_mode: c_int,
        fifo_path: *const c_char,
        output: *mut c_char,
        output_size: c_int,
        token_count: usize,
    ) -> Option<c_int> {
        self.funcs
            .run_simple_with_fifo
            .map(|f| f(input, input_mode, fifo_path, output, output_size, token_count))
    }

    unsafe fn run_ex(
        &self,
        input: *const c_void,
        input_mode: c_int,
        output: *mut c_char,
        output_size: c_int,
        token_count: usize,
        fifo_path: *const c_char,
    ) -> Option<c_int> {
        self.funcs
            .run_ex
            .map(|f| f(input, input_mode, output, output_size, token_count, fifo_path))
    }

    unsafe fn destroy_simple(&self) {
        (self.funcs.destroy_simple)()
    }

    unsafe fn init_with_options(
        &self,
        model_path: *const c_char,
        options: *const RkllmOptions,
    ) -> Option<c_int> {
        self.funcs.wrapper_init.map(|f| f(model_path, options))
    }

    fn is_running(&self) -> Option<c_int> {
        self.funcs.wrapper_is_running.map(|f| unsafe { f() })
    }

    fn abort(&self) -> Option<c_int> {
        self.funcs.wrapper_abort.map(|f| unsafe { f() })
    }

    fn session_flag(&self) -> &AtomicBool {
        &NATIVE_SESSION
    }
}

/// Result of probing a candidate library, as printed by `rkllm-probe`.
#[cfg(feature = "dynamic")]
#[derive(Debug, Clone, Serialize)]
pub struct LibraryProbe {
    pub path: String,
    pub loaded: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub api_sets: ApiSets,
    pub missing_required: Vec<String>,
    pub extended_symbols: Vec<String>,
}

#[cfg(feature = "dynamic")]
impl LibraryProbe {
    /// Usable by [`NativeLibrary::open`].
    pub fn is_usable(&self) -> bool {
        self.loaded && self.missing_required.is_empty()
    }
}

/// `dlopen` `lib_path` and report which RKLLM symbols it exports.
///
/// Never calls into the library.
#[cfg(feature = "dynamic")]
pub fn probe_library(lib_path: &str) -> LibraryProbe {
    let mut probe = LibraryProbe {
        path: lib_path.to_string(),
        loaded: false,
        error: None,
        api_sets: ApiSets::default(),
        missing_required: Vec::new(),
        extended_symbols: Vec::new(),
    };

    let lib = match unsafe { libloading::Library::new(lib_path) } {
        Ok(lib) => lib,
        Err(e) => {
            probe.error = Some(e.to_string());
            probe.missing_required = missing_symbols(|_| false)
                .into_iter()
                .map(String::from)
                .collect();
            return probe;
        }
    };
    probe.loaded = true;

    let exports = |name: &str| unsafe { lib.get::<*const c_void>(name.as_bytes()).is_ok() };

    probe.api_sets = ApiSets::detect(exports);
    probe.missing_required = missing_symbols(exports)
        .into_iter()
        .map(String::from)
        .collect();
    probe.extended_symbols = EXTENDED_SYMBOLS
        .iter()
        .filter(|name| exports(name))
        .map(|s| s.to_string())
        .collect();

    probe
}
