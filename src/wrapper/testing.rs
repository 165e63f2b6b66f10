//! In-process stand-in for librkllm_wrapper, used by unit tests.
//!
//! Behaves like the real wrapper as far as the binding can observe: it reads
//! its arguments as C data, streams chunks plus the EOS marker into the FIFO,
//! and writes the final text into the caller's buffer.

use std::ffi::{c_char, c_int, c_void, CStr};
use std::io::Write;
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::{Condvar, Mutex, MutexGuard};
use std::time::Duration;

use super::ffi::{self, RkllmOptions};
use super::library::RkllmApi;

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum FakeInput {
    Text(Vec<u8>),
    Tokens(Vec<i32>),
    Opaque(usize),
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum FakeCall {
    Init {
        path: Vec<u8>,
        max_new_tokens: i32,
        max_context_len: i32,
    },
    InitWithOptions {
        path: Vec<u8>,
        options: RkllmOptions,
    },
    Run {
        input: FakeInput,
        mode: i32,
        fifo: Option<String>,
        output_size: i32,
        token_count: usize,
    },
    RunEx {
        input: FakeInput,
        mode: i32,
        fifo: String,
        output_size: i32,
        token_count: usize,
    },
    Destroy,
    Abort,
}

pub(crate) struct FakeRuntime {
    flag: AtomicBool,
    initialized: AtomicBool,
    init_status: AtomicI32,
    run_status: AtomicI32,
    simple: bool,
    extended: bool,
    running: AtomicBool,
    open_fifo: bool,
    write_eos: bool,
    stall: Option<Duration>,
    honor_abort: bool,
    aborted: Mutex<bool>,
    abort_signal: Condvar,
    chunks: Vec<String>,
    reply: String,
    calls: Mutex<Vec<FakeCall>>,
}

impl FakeRuntime {
    pub fn new() -> Self {
        Self {
            flag: AtomicBool::new(false),
            initialized: AtomicBool::new(false),
            init_status: AtomicI32::new(0),
            run_status: AtomicI32::new(0),
            simple: true,
            extended: false,
            running: AtomicBool::new(false),
            open_fifo: true,
            write_eos: true,
            stall: None,
            honor_abort: true,
            aborted: Mutex::new(false),
            abort_signal: Condvar::new(),
            chunks: vec!["I am".into(), " fine,".into(), " thank you.".into()],
            reply: "I am fine, thank you.".into(),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn with_init_status(self, code: i32) -> Self {
        self.init_status.store(code, Ordering::SeqCst);
        self
    }

    pub fn with_run_status(self, code: i32) -> Self {
        self.run_status.store(code, Ordering::SeqCst);
        self
    }

    pub fn with_stream(mut self, chunks: &[&str], write_eos: bool) -> Self {
        self.chunks = chunks.iter().map(|c| c.to_string()).collect();
        self.write_eos = write_eos;
        self
    }

    pub fn with_reply(mut self, reply: &str) -> Self {
        self.reply = reply.to_string();
        self
    }

    /// Fail before ever touching the FIFO, like a run without a loaded model.
    pub fn without_fifo_open(mut self) -> Self {
        self.open_fifo = false;
        self
    }

    /// Export the `rkllmwrapper_*` calls and `rkllm_run_ex` as well.
    pub fn with_extended_api(mut self) -> Self {
        self.extended = true;
        self
    }

    /// Only what current rkllm_wrapper.h builds export: no `*_simple` calls
    /// besides destroy.
    pub fn ex_only() -> Self {
        let mut fake = Self::new().with_extended_api();
        fake.simple = false;
        fake
    }

    pub fn with_running(self, running: bool) -> Self {
        self.running.store(running, Ordering::SeqCst);
        self
    }

    /// After streaming the chunks, hold the FIFO open and block until aborted
    /// or until `limit` passes. No EOS marker is written.
    pub fn stalling(mut self, limit: Duration) -> Self {
        self.stall = Some(limit);
        self.write_eos = false;
        self
    }

    /// Accept `rkllmwrapper_abort` but keep generating.
    pub fn ignoring_abort(mut self) -> Self {
        self.honor_abort = false;
        self
    }

    pub fn calls(&self) -> MutexGuard<'_, Vec<FakeCall>> {
        self.calls.lock().unwrap()
    }

    pub fn run_calls(&self) -> usize {
        self.calls()
            .iter()
            .filter(|c| matches!(c, FakeCall::Run { .. } | FakeCall::RunEx { .. }))
            .count()
    }

    fn record(&self, call: FakeCall) {
        self.calls.lock().unwrap().push(call);
    }

    fn do_init(&self) -> c_int {
        let status = self.init_status.load(Ordering::SeqCst);
        self.initialized.store(status == 0, Ordering::SeqCst);
        status
    }

    unsafe fn finish_run(&self, output: *mut c_char, output_size: c_int) -> c_int {
        if !self.initialized.load(Ordering::SeqCst) {
            return -1;
        }
        let status = self.run_status.load(Ordering::SeqCst);
        if status != 0 {
            return status;
        }
        let reply = self.reply.as_bytes();
        if reply.len() >= output_size as usize {
            return ffi::RKLLM_OUTPUT_TOO_SMALL;
        }
        std::ptr::copy_nonoverlapping(reply.as_ptr(), output as *mut u8, reply.len());
        *output.add(reply.len()) = 0;
        0
    }

    fn stream_to(&self, fifo: &str) {
        if !self.open_fifo || !self.initialized.load(Ordering::SeqCst) || fifo.is_empty() {
            return;
        }
        let mut pipe = match std::fs::OpenOptions::new().write(true).open(fifo) {
            Ok(pipe) => pipe,
            Err(_) => return,
        };
        for chunk in &self.chunks {
            let _ = writeln!(pipe, "{}", chunk);
        }
        if let Some(limit) = self.stall {
            let aborted = self.aborted.lock().unwrap();
            let _ = self
                .abort_signal
                .wait_timeout_while(aborted, limit, |aborted| !*aborted)
                .unwrap();
        }
        if self.write_eos {
            let _ = writeln!(pipe, "{}", ffi::RKLLM_EOS_MARKER);
        }
    }
}

unsafe fn c_bytes(ptr: *const c_char) -> Vec<u8> {
    CStr::from_ptr(ptr).to_bytes_with_nul().to_vec()
}

unsafe fn read_input(input: *const c_void, input_mode: c_int, token_count: usize) -> FakeInput {
    match input_mode {
        ffi::RKLLM_INPUT_PROMPT => FakeInput::Text(c_bytes(input as *const c_char)),
        ffi::RKLLM_INPUT_TOKEN => {
            FakeInput::Tokens(std::slice::from_raw_parts(input as *const i32, token_count).to_vec())
        }
        _ => FakeInput::Opaque(input as usize),
    }
}

impl RkllmApi for FakeRuntime {
    unsafe fn init_simple(
        &self,
        model_path: *const c_char,
        max_new_tokens: c_int,
        max_context_len: c_int,
    ) -> Option<c_int> {
        if !self.simple {
            return None;
        }
        self.record(FakeCall::Init {
            path: c_bytes(model_path),
            max_new_tokens,
            max_context_len,
        });
        Some(self.do_init())
    }

    unsafe fn run_simple(
        &self,
        prompt: *const c_char,
        input_mode: c_int,
        output: *mut c_char,
        output_size: c_int,
    ) -> Option<c_int> {
        if !self.simple {
            return None;
        }
        self.record(FakeCall::Run {
            input: FakeInput::Text(c_bytes(prompt)),
            mode: input_mode,
            fifo: None,
            output_size,
            token_count: 0,
        });
        Some(self.finish_run(output, output_size))
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
        if !self.simple {
            return None;
        }
        let fifo = CStr::from_ptr(fifo_path).to_string_lossy().into_owned();
        self.record(FakeCall::Run {
            input: read_input(input, input_mode, token_count),
            mode: input_mode,
            fifo: Some(fifo.clone()),
            output_size,
            token_count,
        });
        self.stream_to(&fifo);
        Some(self.finish_run(output, output_size))
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
        if !self.extended {
            return None;
        }
        let fifo = CStr::from_ptr(fifo_path).to_string_lossy().into_owned();
        self.record(FakeCall::RunEx {
            input: read_input(input, input_mode, token_count),
            mode: input_mode,
            fifo: fifo.clone(),
            output_size,
            token_count,
        });
        self.stream_to(&fifo);
        Some(self.finish_run(output, output_size))
    }

    unsafe fn destroy_simple(&self) {
        self.record(FakeCall::Destroy);
        self.initialized.store(false, Ordering::SeqCst);
    }

    unsafe fn init_with_options(
        &self,
        model_path: *const c_char,
        options: *const RkllmOptions,
    ) -> Option<c_int> {
        if !self.extended {
            return None;
        }
        self.record(FakeCall::InitWithOptions {
            path: c_bytes(model_path),
            options: *options,
        });
        Some(self.do_init())
    }

    fn is_running(&self) -> Option<c_int> {
        if !self.extended {
            return None;
        }
        // 0 while a generation is in flight, like rkllm_is_running.
        Some(if self.running.load(Ordering::SeqCst) { 0 } else { 1 })
    }

    fn abort(&self) -> Option<c_int> {
        if !self.extended {
            return None;
        }
        self.record(FakeCall::Abort);
        if self.honor_abort {
            *self.aborted.lock().unwrap() = true;
            self.abort_signal.notify_all();
        }
        Some(0)
    }

    fn session_flag(&self) -> &AtomicBool {
        &self.flag
    }
}
