//! Conversions between Rust values and the shapes librkllm_wrapper expects.

use std::borrow::Cow;
use std::ffi::{c_char, c_int, c_void};
use std::ptr::NonNull;

use super::alloc::AllocationScope;
use super::error::{RkllmError, Result};
use super::ffi;

/// Input mode tag passed next to every input pointer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum InputMode {
    Prompt = ffi::RKLLM_INPUT_PROMPT,
    Token = ffi::RKLLM_INPUT_TOKEN,
    Embed = ffi::RKLLM_INPUT_EMBED,
    Multimodal = ffi::RKLLM_INPUT_MULTIMODAL,
}

impl InputMode {
    pub fn as_raw(self) -> c_int {
        self as c_int
    }
}

impl TryFrom<i32> for InputMode {
    type Error = RkllmError;

    fn try_from(value: i32) -> Result<Self> {
        match value {
            ffi::RKLLM_INPUT_PROMPT => Ok(InputMode::Prompt),
            ffi::RKLLM_INPUT_TOKEN => Ok(InputMode::Token),
            ffi::RKLLM_INPUT_EMBED => Ok(InputMode::Embed),
            ffi::RKLLM_INPUT_MULTIMODAL => Ok(InputMode::Multimodal),
            other => Err(RkllmError::InvalidParam(format!("unknown input mode {}", other))),
        }
    }
}

/// Pointer to an embedding or multimodal payload whose layout only the
/// runtime knows. The binding forwards it untouched.
#[derive(Debug, Clone, Copy)]
pub struct RawPayload {
    ptr: NonNull<c_void>,
}

// SAFETY: the constructor's contract makes the caller responsible for the
// pointee staying valid and unaliased for the duration of the call.
unsafe impl Send for RawPayload {}
unsafe impl Sync for RawPayload {}

impl RawPayload {
    /// Wrap a payload pointer. Returns `None` for null.
    ///
    /// # Safety
    ///
    /// `ptr` must point to a payload in the layout the runtime expects for the
    /// chosen mode and must stay valid until every run using it has returned.
    pub unsafe fn new(ptr: *const c_void) -> Option<Self> {
        NonNull::new(ptr as *mut c_void).map(|ptr| Self { ptr })
    }

    pub fn as_ptr(&self) -> *const c_void {
        self.ptr.as_ptr()
    }
}

/// What is fed to the model.
#[derive(Debug, Clone)]
pub enum Input {
    /// Prompt text.
    Prompt(String),
    /// Pre-tokenised input.
    Tokens(Vec<i32>),
    /// Embedding vector.
    Embed(RawPayload),
    /// Multimodal payload.
    Multimodal(RawPayload),
}

impl Input {
    pub fn prompt(text: impl Into<String>) -> Self {
        Input::Prompt(text.into())
    }

    pub fn mode(&self) -> InputMode {
        match self {
            Input::Prompt(_) => InputMode::Prompt,
            Input::Tokens(_) => InputMode::Token,
            Input::Embed(_) => InputMode::Embed,
            Input::Multimodal(_) => InputMode::Multimodal,
        }
    }
}

/// An input converted to its boundary shape.
///
/// Any memory behind `ptr` is owned by the scope it was marshalled into, so
/// this must not outlive that scope.
#[derive(Debug)]
pub struct MarshalledInput {
    pub ptr: *const c_void,
    pub mode: InputMode,
    /// Element count for token input, 0 otherwise.
    pub token_count: usize,
}

/// Ensure `bytes` ends with exactly the terminator the C side reads up to.
///
/// An empty input becomes a lone terminator, an already-terminated input is
/// borrowed as-is, and a NUL anywhere before the last byte is rejected.
pub fn nul_terminated(bytes: &[u8]) -> Result<Cow<'_, [u8]>> {
    let body = match bytes.split_last() {
        Some((&0, body)) => body,
        _ => bytes,
    };
    if let Some(position) = body.iter().position(|&b| b == 0) {
        return Err(RkllmError::InteriorNul { position });
    }

    if body.len() < bytes.len() {
        Ok(Cow::Borrowed(bytes))
    } else {
        let mut owned = Vec::with_capacity(bytes.len() + 1);
        owned.extend_from_slice(bytes);
        owned.push(0);
        Ok(Cow::Owned(owned))
    }
}

/// Copy `s` into native memory as a C string owned by `allocs`.
pub fn c_string(s: &str, allocs: &AllocationScope<'_>) -> Result<*const c_char> {
    let bytes = nul_terminated(s.as_bytes())?;
    Ok(allocs.alloc_c_string(&bytes)?.as_ptr())
}

/// Convert `input` per its mode, recording any native memory in `allocs`.
///
/// Fails before touching native memory for an empty token sequence.
pub fn marshal_input(input: &Input, allocs: &AllocationScope<'_>) -> Result<MarshalledInput> {
    let mode = input.mode();
    let (ptr, token_count) = match input {
        Input::Prompt(text) => (c_string(text, allocs)? as *const c_void, 0),
        Input::Tokens(tokens) => {
            if tokens.is_empty() {
                return Err(RkllmError::EmptyTokens);
            }
            let ptr = allocs.alloc_tokens(tokens)?;
            (ptr.as_ptr() as *const c_void, tokens.len())
        }
        Input::Embed(payload) | Input::Multimodal(payload) => (payload.as_ptr(), 0),
    };
    Ok(MarshalledInput {
        ptr,
        mode,
        token_count,
    })
}

/// Caller-owned, zero-filled buffer the runtime writes its final output into.
pub struct OutputBuffer {
    buf: Vec<u8>,
}

impl OutputBuffer {
    /// Allocate a buffer of `capacity` bytes.
    pub fn with_capacity(capacity: usize) -> Result<Self> {
        if capacity == 0 || capacity > i32::MAX as usize {
            return Err(RkllmError::InvalidParam(format!(
                "output capacity must be in 1..={}, got {}",
                i32::MAX,
                capacity
            )));
        }
        Ok(Self {
            buf: vec![0u8; capacity],
        })
    }

    pub fn capacity(&self) -> usize {
        self.buf.len()
    }

    /// Capacity as the `int` the C side takes. Bounded at construction.
    pub fn capacity_raw(&self) -> c_int {
        self.buf.len() as c_int
    }

    pub fn as_mut_ptr(&mut self) -> *mut c_char {
        self.buf.as_mut_ptr() as *mut c_char
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.buf
    }

    /// Text written by the runtime: everything before the first NUL.
    pub fn into_text(self) -> String {
        text_until_nul(&self.buf)
    }
}

/// Decode a NUL-terminated (or NUL-padded) byte buffer.
pub fn text_until_nul(buf: &[u8]) -> String {
    let end = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
    String::from_utf8_lossy(&buf[..end]).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wrapper::alloc::AllocationTracker;
    use std::ffi::CStr;

    #[test]
    fn test_nul_terminated_appends() {
        assert_eq!(&*nul_terminated(b"model.rkllm").unwrap(), b"model.rkllm\0");
    }

    #[test]
    fn test_nul_terminated_keeps_existing_terminator() {
        let out = nul_terminated(b"abc\0").unwrap();
        assert!(matches!(out, Cow::Borrowed(_)));
        assert_eq!(&*out, b"abc\0");
    }

    #[test]
    fn test_nul_terminated_empty() {
        assert_eq!(&*nul_terminated(b"").unwrap(), b"\0");
        assert_eq!(&*nul_terminated(b"\0").unwrap(), b"\0");
    }

    #[test]
    fn test_nul_terminated_rejects_interior_nul() {
        let err = nul_terminated(b"ab\0cd").unwrap_err();
        assert!(matches!(err, RkllmError::InteriorNul { position: 2 }));

        let err = nul_terminated(b"ab\0\0").unwrap_err();
        assert!(matches!(err, RkllmError::InteriorNul { position: 2 }));
    }

    #[test]
    fn test_c_string_is_readable_by_c() {
        let tracker = AllocationTracker::new();
        let allocs = tracker.scope();
        let ptr = c_string("Hello, How are you?", &allocs).unwrap();
        let read = unsafe { CStr::from_ptr(ptr) };
        assert_eq!(read.to_str().unwrap(), "Hello, How are you?");
        assert_eq!(allocs.len(), 1);
    }

    #[test]
    fn test_marshal_prompt() {
        let tracker = AllocationTracker::new();
        let allocs = tracker.scope();
        let m = marshal_input(&Input::prompt("hi"), &allocs).unwrap();
        assert_eq!(m.mode, InputMode::Prompt);
        assert_eq!(m.token_count, 0);
        let read = unsafe { CStr::from_ptr(m.ptr as *const c_char) };
        assert_eq!(read.to_bytes(), b"hi");
    }

    #[test]
    fn test_marshal_tokens() {
        let tracker = AllocationTracker::new();
        let allocs = tracker.scope();
        let m = marshal_input(&Input::Tokens(vec![151644, 872, 198]), &allocs).unwrap();
        assert_eq!(m.mode, InputMode::Token);
        assert_eq!(m.token_count, 3);
        let read = unsafe { std::slice::from_raw_parts(m.ptr as *const i32, 3) };
        assert_eq!(read, &[151644, 872, 198]);
    }

    #[test]
    fn test_marshal_empty_tokens_allocates_nothing() {
        let tracker = AllocationTracker::new();
        let allocs = tracker.scope();
        let err = marshal_input(&Input::Tokens(vec![]), &allocs).unwrap_err();
        assert!(matches!(err, RkllmError::EmptyTokens));
        assert!(allocs.is_empty());
    }

    #[test]
    fn test_marshal_embed_passthrough() {
        let embedding = [0.25f32; 8];
        let payload = unsafe { RawPayload::new(embedding.as_ptr() as *const c_void) }.unwrap();
        let tracker = AllocationTracker::new();
        let allocs = tracker.scope();

        let m = marshal_input(&Input::Embed(payload), &allocs).unwrap();
        assert_eq!(m.mode, InputMode::Embed);
        assert_eq!(m.ptr, embedding.as_ptr() as *const c_void);
        assert_eq!(m.token_count, 0);
        assert!(allocs.is_empty());
    }

    #[test]
    fn test_raw_payload_rejects_null() {
        assert!(unsafe { RawPayload::new(std::ptr::null()) }.is_none());
    }

    #[test]
    fn test_input_mode_round_trip_from_raw() {
        assert_eq!(InputMode::try_from(3).unwrap(), InputMode::Multimodal);
        assert!(InputMode::try_from(4).is_err());
        assert_eq!(InputMode::Token.as_raw(), 1);
    }

    #[test]
    fn test_output_buffer_bounds() {
        assert!(OutputBuffer::with_capacity(0).is_err());
        let buf = OutputBuffer::with_capacity(ffi::DEFAULT_OUTPUT_CAPACITY).unwrap();
        assert_eq!(buf.capacity_raw(), 8192);
        assert!(buf.as_bytes().iter().all(|&b| b == 0));
    }

    #[test]
    fn test_text_until_nul_trims_padding() {
        assert_eq!(text_until_nul(b"I am fine.\0\0\0\0"), "I am fine.");
        assert_eq!(text_until_nul(b"no terminator"), "no terminator");
        assert_eq!(text_until_nul(b"\0\0"), "");
    }

    #[test]
    fn test_text_until_nul_keeps_content_before_first_nul() {
        // Stale bytes after the terminator are not part of the result.
        assert_eq!(text_until_nul(b"new\0old text"), "new");
        assert_eq!(text_until_nul(" caf\u{e9} \0".as_bytes()), " caf\u{e9} ");
    }
}
