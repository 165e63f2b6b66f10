//! Parameter structs for model initialisation.

use std::path::{Path, PathBuf};

use super::error::{RkllmError, Result};
use super::ffi::RkllmOptions;

/// Default per-run generation limit.
pub const DEFAULT_MAX_NEW_TOKENS: i32 = 4096;

/// Default context window.
pub const DEFAULT_MAX_CONTEXT_LEN: i32 = 4096;

/// Parameters for loading a model.
#[derive(Debug, Clone)]
pub struct InitParams {
    /// Path to the `.rkllm` model file.
    pub model_path: PathBuf,

    /// Maximum number of tokens to generate per run.
    pub max_new_tokens: i32,

    /// Maximum context length (prompt + generation).
    pub max_context_len: i32,

    /// Sampling overrides. `None` uses `rkllm_init_simple`.
    pub sampling: Option<SamplingOptions>,
}

impl InitParams {
    /// Params for `model_path` with the default limits.
    pub fn new(model_path: impl Into<PathBuf>) -> Self {
        Self {
            model_path: model_path.into(),
            max_new_tokens: DEFAULT_MAX_NEW_TOKENS,
            max_context_len: DEFAULT_MAX_CONTEXT_LEN,
            sampling: None,
        }
    }

    pub fn with_limits(mut self, max_new_tokens: i32, max_context_len: i32) -> Self {
        self.max_new_tokens = max_new_tokens;
        self.max_context_len = max_context_len;
        self
    }

    pub fn with_sampling(mut self, sampling: SamplingOptions) -> Self {
        self.sampling = Some(sampling);
        self
    }

    /// The model path as UTF-8, which is what the C side receives.
    pub(crate) fn model_path_str(&self) -> Result<&str> {
        path_to_str(&self.model_path)
    }

    /// Convert to the raw options struct for `rkllmwrapper_init`.
    pub(crate) fn to_raw_options(&self) -> RkllmOptions {
        self.sampling
            .clone()
            .unwrap_or_default()
            .into_raw(self.max_new_tokens, self.max_context_len)
    }
}

pub(crate) fn path_to_str(path: &Path) -> Result<&str> {
    path.to_str().ok_or(RkllmError::InvalidPathEncoding)
}

/// Sampling and scheduling overrides.
///
/// Zero-valued fields keep the runtime's own defaults, as does a negative
/// `mirostat`.
#[derive(Debug, Clone, PartialEq)]
pub struct SamplingOptions {
    pub top_k: i32,
    pub top_p: f32,
    pub temperature: f32,
    pub repeat_penalty: f32,
    pub frequency_penalty: f32,
    pub presence_penalty: f32,
    /// Mirostat mode (0 = off, 1 or 2). Negative keeps the default.
    pub mirostat: i32,
    pub mirostat_tau: f32,
    pub mirostat_eta: f32,
    /// Tokens kept when the context window shifts.
    pub n_keep: i32,
    pub skip_special_token: bool,
    /// Pin inference to the first `num_cpus` cores.
    pub num_cpus: i32,
}

impl Default for SamplingOptions {
    fn default() -> Self {
        Self {
            top_k: 0,
            top_p: 0.0,
            temperature: 0.0,
            repeat_penalty: 0.0,
            frequency_penalty: 0.0,
            presence_penalty: 0.0,
            mirostat: -1,
            mirostat_tau: 0.0,
            mirostat_eta: 0.0,
            n_keep: 0,
            skip_special_token: true,
            num_cpus: 0,
        }
    }
}

impl SamplingOptions {
    /// Greedy-ish decoding: top-1, no temperature.
    pub fn greedy() -> Self {
        Self {
            top_k: 1,
            temperature: 0.01,
            ..Default::default()
        }
    }

    /// Convert to raw wrapper options.
    pub(crate) fn into_raw(self, max_new_tokens: i32, max_context_len: i32) -> RkllmOptions {
        RkllmOptions {
            max_new_tokens,
            max_context_len,
            top_k: self.top_k,
            top_p: self.top_p,
            temperature: self.temperature,
            repeat_penalty: self.repeat_penalty,
            frequency_penalty: self.frequency_penalty,
            presence_penalty: self.presence_penalty,
            mirostat: self.mirostat,
            mirostat_tau: self.mirostat_tau,
            mirostat_eta: self.mirostat_eta,
            n_keep: self.n_keep,
            skip_special_token: self.skip_special_token as i32,
            num_cpus: self.num_cpus,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_params_defaults() {
        let params = InitParams::new("/models/qwen.rkllm");
        assert_eq!(params.max_new_tokens, 4096);
        assert_eq!(params.max_context_len, 4096);
        assert!(params.sampling.is_none());
    }

    #[test]
    fn test_raw_options_keep_library_defaults() {
        let raw = InitParams::new("m.rkllm").with_limits(256, 1024).to_raw_options();
        assert_eq!(raw.max_new_tokens, 256);
        assert_eq!(raw.max_context_len, 1024);
        assert_eq!(raw.top_k, 0);
        assert_eq!(raw.mirostat, -1);
        assert_eq!(raw.skip_special_token, 1);
    }

    #[test]
    fn test_greedy_sampling() {
        let raw = SamplingOptions::greedy().into_raw(1, 2);
        assert_eq!(raw.top_k, 1);
        assert!(raw.temperature > 0.0);
    }

    #[cfg(unix)]
    #[test]
    fn test_non_utf8_path_rejected() {
        use std::ffi::OsStr;
        use std::os::unix::ffi::OsStrExt;

        let params = InitParams::new(OsStr::from_bytes(b"/models/\xff.rkllm"));
        assert!(matches!(
            params.model_path_str(),
            Err(RkllmError::InvalidPathEncoding)
        ));
    }
}
