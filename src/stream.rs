//! Streaming completion protocol over a named pipe.
//!
//! While `rkllm_run_simple_with_fifo` blocks, the runtime writes every
//! generated piece of text to a FIFO as its own line and finishes with the
//! `[[EOS]]` marker. The reader side moves through
//! `AwaitingPipeOpen -> Streaming -> {Completed, PipeError}`:
//!
//! - opening the FIFO for reading blocks until the runtime opens its end;
//! - each line, minus trailing whitespace, is one chunk, in write order;
//! - the marker ends the stream and is never surfaced as content;
//! - EOF before the marker means the writer went away: `PipeError`.
//!
//! [`spawn_streaming`] runs the pipe reader and the blocking call side by
//! side and joins both before reporting. [`StreamingRun::drain_within`] puts
//! a deadline on the whole run.

use std::ffi::CString;
use std::fs::{File, OpenOptions};
use std::io::{self, BufRead, BufReader, ErrorKind};
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::{FileTypeExt, OpenOptionsExt};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinHandle;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, info, warn};

use crate::wrapper::ffi::RKLLM_EOS_MARKER;
use crate::wrapper::{Input, Result, RkllmApi, RkllmError, Session};

/// Permissions requested for a new FIFO (before umask).
pub const FIFO_MODE: libc::mode_t = 0o666;

/// How often a reader still parked in `open` is nudged once the call is over.
const READER_RELEASE_INTERVAL: Duration = Duration::from_millis(50);

/// Chunks held for a caller that is not reading. Further chunks are dropped
/// from the channel (never from the pipe) until the caller catches up.
pub const CHUNK_BUFFER: usize = 1024;

/// How long [`StreamingRun::drain_within`] waits for the run to wind down
/// after an abort.
pub const ABORT_GRACE_PERIOD: Duration = Duration::from_secs(5);

/// `/tmp/llm_output_<pid>.fifo`.
pub fn default_fifo_path() -> PathBuf {
    PathBuf::from(format!("/tmp/llm_output_{}.fifo", std::process::id()))
}

/// Create the FIFO at `path` unless one is already there.
///
/// A path that exists but is not a FIFO is an error. The FIFO is never
/// removed by this crate.
pub fn ensure_fifo(path: &Path) -> Result<()> {
    let create_err = |source: io::Error| RkllmError::FifoCreate {
        path: path.to_path_buf(),
        source,
    };

    match std::fs::metadata(path) {
        Ok(meta) if meta.file_type().is_fifo() => {
            debug!("Reusing FIFO {:?}", path);
            return Ok(());
        }
        Ok(_) => {
            return Err(create_err(io::Error::new(
                ErrorKind::AlreadyExists,
                "path exists and is not a FIFO",
            )))
        }
        Err(e) if e.kind() == ErrorKind::NotFound => {}
        Err(e) => return Err(create_err(e)),
    }

    let c_path = CString::new(path.as_os_str().as_bytes()).map_err(|e| RkllmError::InteriorNul {
        position: e.nul_position(),
    })?;

    let ret = unsafe { libc::mkfifo(c_path.as_ptr(), FIFO_MODE) };
    if ret != 0 {
        let err = io::Error::last_os_error();
        // Lost a race with another creator; theirs is just as good.
        if err.kind() == ErrorKind::AlreadyExists {
            return Ok(());
        }
        return Err(create_err(err));
    }

    info!("Created FIFO {:?}", path);
    Ok(())
}

/// Where the reader is in the protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    AwaitingPipeOpen,
    Streaming,
    Completed,
    PipeError,
}

/// What a single line means to the consumer.
#[derive(Debug, PartialEq, Eq)]
pub enum LineEvent<'a> {
    Chunk(&'a str),
    Completed,
    Ignored,
}

/// The reader-side state machine, independent of any I/O.
#[derive(Debug)]
pub struct StreamConsumer {
    state: StreamState,
    chunks: usize,
}

impl Default for StreamConsumer {
    fn default() -> Self {
        Self::new()
    }
}

impl StreamConsumer {
    pub fn new() -> Self {
        Self {
            state: StreamState::AwaitingPipeOpen,
            chunks: 0,
        }
    }

    pub fn state(&self) -> StreamState {
        self.state
    }

    /// Chunks surfaced so far.
    pub fn chunks(&self) -> usize {
        self.chunks
    }

    pub fn pipe_opened(&mut self) {
        if self.state == StreamState::AwaitingPipeOpen {
            self.state = StreamState::Streaming;
        }
    }

    /// Classify one raw line (with or without its newline).
    pub fn on_line<'a>(&mut self, line: &'a str) -> LineEvent<'a> {
        if self.state != StreamState::Streaming {
            return LineEvent::Ignored;
        }
        if line.trim() == RKLLM_EOS_MARKER {
            self.state = StreamState::Completed;
            return LineEvent::Completed;
        }
        self.chunks += 1;
        LineEvent::Chunk(line.trim_end())
    }

    /// The writer closed the pipe.
    pub fn on_eof(&mut self) -> StreamState {
        self.on_error();
        self.state
    }

    /// Opening or reading the pipe failed.
    pub fn on_error(&mut self) {
        if self.state != StreamState::Completed {
            self.state = StreamState::PipeError;
        }
    }
}

/// Terminal result of reading a stream.
#[derive(Debug)]
pub enum StreamOutcome {
    /// The `[[EOS]]` marker arrived.
    Completed { chunks: usize },
    /// The pipe failed or closed before the marker.
    PipeError { chunks: usize, error: RkllmError },
}

impl StreamOutcome {
    pub fn state(&self) -> StreamState {
        match self {
            StreamOutcome::Completed { .. } => StreamState::Completed,
            StreamOutcome::PipeError { .. } => StreamState::PipeError,
        }
    }

    pub fn chunks(&self) -> usize {
        match self {
            StreamOutcome::Completed { chunks } | StreamOutcome::PipeError { chunks, .. } => *chunks,
        }
    }

    pub fn is_completed(&self) -> bool {
        matches!(self, StreamOutcome::Completed { .. })
    }
}

/// Drive `consumer` over an already-open pipe until it reaches a terminal
/// state, handing each chunk to `on_chunk` as it arrives.
pub fn read_stream<R: BufRead>(
    mut reader: R,
    consumer: &mut StreamConsumer,
    mut on_chunk: impl FnMut(&str),
) -> StreamOutcome {
    consumer.pipe_opened();
    // Bytes, not String: a chunk may end in the middle of a UTF-8 sequence.
    let mut buf = Vec::new();

    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf) {
            Ok(0) => {
                consumer.on_eof();
                let chunks = consumer.chunks();
                return StreamOutcome::PipeError {
                    chunks,
                    error: RkllmError::StreamClosed { chunks },
                };
            }
            Ok(_) => {
                let line = String::from_utf8_lossy(&buf);
                match consumer.on_line(&line) {
                    LineEvent::Chunk(chunk) => on_chunk(chunk),
                    LineEvent::Completed => {
                        debug!("Received EOS marker, ending stream");
                        return StreamOutcome::Completed {
                            chunks: consumer.chunks(),
                        };
                    }
                    LineEvent::Ignored => {}
                }
            }
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => {
                consumer.on_error();
                return StreamOutcome::PipeError {
                    chunks: consumer.chunks(),
                    error: RkllmError::FifoRead(e),
                };
            }
        }
    }
}

/// Open the FIFO for reading (blocking until a writer appears) and read it
/// to a terminal state.
pub fn read_fifo(path: &Path, on_chunk: impl FnMut(&str)) -> StreamOutcome {
    let mut consumer = StreamConsumer::new();
    let file = match File::open(path) {
        Ok(file) => file,
        Err(source) => {
            consumer.on_error();
            return StreamOutcome::PipeError {
                chunks: 0,
                error: RkllmError::FifoOpen {
                    path: path.to_path_buf(),
                    source,
                },
            };
        }
    };
    debug!("Opened FIFO {:?} for reading", path);
    read_stream(BufReader::new(file), &mut consumer, on_chunk)
}

/// Unblock a reader parked in `open` by briefly opening the write end.
///
/// Harmless when the reader is already past `open`: no data is written.
fn release_reader(path: &Path) {
    match OpenOptions::new()
        .write(true)
        .custom_flags(libc::O_NONBLOCK)
        .open(path)
    {
        Ok(_) => debug!("Released FIFO reader on {:?}", path),
        // ENXIO: nobody has the read end open yet.
        Err(e) if e.raw_os_error() == Some(libc::ENXIO) => {}
        Err(e) => debug!("Could not open {:?} to release reader: {}", path, e),
    }
}

/// Final result of a streaming run.
#[derive(Debug)]
pub struct StreamReport {
    /// Complete text from the output buffer.
    pub output: String,
    /// How the pipe stream ended.
    pub outcome: StreamOutcome,
    /// Chunks read from the pipe but not delivered because the channel was
    /// full. The text is still part of `output`.
    pub dropped_chunks: usize,
}

/// A streaming run in progress.
///
/// Chunks arrive through [`next_chunk`](Self::next_chunk) (or as a `Stream`
/// via [`into_parts`](Self::into_parts)); [`finish`](Self::finish) waits for
/// both the blocking call and the pipe reader.
///
/// The chunk channel holds at most [`CHUNK_BUFFER`] chunks. The pipe is
/// always drained so the runtime never blocks on a slow caller; chunks that
/// do not fit are counted in [`StreamReport::dropped_chunks`]. A caller that
/// only wants the final text can go straight to `finish`.
pub struct StreamingRun {
    chunks: mpsc::Receiver<String>,
    handle: JoinHandle<Result<StreamReport>>,
}

fn joined(
    result: std::result::Result<Result<StreamReport>, tokio::task::JoinError>,
) -> Result<StreamReport> {
    result.map_err(|e| RkllmError::TaskJoin(e.to_string()))?
}

impl StreamingRun {
    /// Next chunk, or `None` once the reader is done.
    pub async fn next_chunk(&mut self) -> Option<String> {
        self.chunks.recv().await
    }

    /// Split into a chunk stream and the completion handle.
    pub fn into_parts(self) -> (ReceiverStream<String>, JoinHandle<Result<StreamReport>>) {
        (ReceiverStream::new(self.chunks), self.handle)
    }

    /// Wait for the run and the reader. Unread chunks are discarded.
    pub async fn finish(self) -> Result<StreamReport> {
        joined(self.handle.await)
    }

    /// Hand every chunk to `on_chunk` and finish, giving up after `limit`.
    ///
    /// On the deadline the generation is aborted through `session` and the
    /// run gets `grace` to return. If the abort is unsupported or fails, or
    /// the grace period passes, the run is abandoned and
    /// [`RkllmError::Timeout`] is returned. An abandoned call may still hold
    /// the session; the model must not be used again.
    pub async fn drain_within<A: RkllmApi>(
        self,
        session: &Session<A>,
        limit: Duration,
        grace: Duration,
        mut on_chunk: impl FnMut(String),
    ) -> Result<StreamReport> {
        let StreamingRun {
            mut chunks,
            mut handle,
        } = self;

        let within = tokio::time::timeout(limit, async {
            while let Some(chunk) = chunks.recv().await {
                on_chunk(chunk);
            }
            (&mut handle).await
        })
        .await;
        if let Ok(result) = within {
            return joined(result);
        }

        warn!("No result after {:?}, aborting generation", limit);
        if let Err(e) = session.abort() {
            warn!("Cannot abort generation: {}", e);
            return Err(RkllmError::Timeout {
                after: limit,
                aborted: false,
            });
        }
        match tokio::time::timeout(grace, &mut handle).await {
            Ok(result) => joined(result),
            Err(_) => Err(RkllmError::Timeout {
                after: limit,
                aborted: true,
            }),
        }
    }
}

/// Start `run_with_fifo` on a blocking thread with a pipe reader beside it.
///
/// The FIFO is created first if needed. Must be called inside a Tokio
/// runtime.
///
/// # Errors
///
/// Fails immediately for FIFO creation errors and empty token input; every
/// other failure is reported by [`StreamingRun::finish`].
pub fn spawn_streaming<A>(
    session: Arc<Session<A>>,
    input: Input,
    fifo_path: PathBuf,
    output_capacity: usize,
) -> Result<StreamingRun>
where
    A: RkllmApi + 'static,
{
    spawn_with_buffer(session, input, fifo_path, output_capacity, CHUNK_BUFFER)
}

fn spawn_with_buffer<A>(
    session: Arc<Session<A>>,
    input: Input,
    fifo_path: PathBuf,
    output_capacity: usize,
    buffer: usize,
) -> Result<StreamingRun>
where
    A: RkllmApi + 'static,
{
    if matches!(&input, Input::Tokens(tokens) if tokens.is_empty()) {
        return Err(RkllmError::EmptyTokens);
    }
    ensure_fifo(&fifo_path)?;

    let (tx, rx) = mpsc::channel(buffer);
    let handle = tokio::spawn(drive(session, input, fifo_path, output_capacity, tx));

    Ok(StreamingRun { chunks: rx, handle })
}

async fn drive<A>(
    session: Arc<Session<A>>,
    input: Input,
    fifo_path: PathBuf,
    output_capacity: usize,
    tx: mpsc::Sender<String>,
) -> Result<StreamReport>
where
    A: RkllmApi + 'static,
{
    let reader_path = fifo_path.clone();
    let mut reader = tokio::task::spawn_blocking(move || {
        let mut dropped = 0;
        // Never wait on the receiver: the writer must not block on us.
        let outcome = read_fifo(&reader_path, |chunk| {
            if let Err(TrySendError::Full(_)) = tx.try_send(chunk.to_string()) {
                dropped += 1;
            }
        });
        (outcome, dropped)
    });

    let call_path = fifo_path.clone();
    let call = tokio::task::spawn_blocking(move || {
        session.run_with_fifo(&input, &call_path, output_capacity)
    })
    .await
    .map_err(|e| RkllmError::TaskJoin(e.to_string()))
    .and_then(|result| result);

    // If the runtime returned without opening its end, the reader is still
    // parked in open().
    let (outcome, dropped_chunks) = loop {
        match tokio::time::timeout(READER_RELEASE_INTERVAL, &mut reader).await {
            Ok(joined) => break joined.map_err(|e| RkllmError::TaskJoin(e.to_string()))?,
            Err(_) => release_reader(&fifo_path),
        }
    };

    let output = call?;
    match &outcome {
        StreamOutcome::Completed { chunks } => {
            debug!("Stream completed after {} chunks", chunks)
        }
        StreamOutcome::PipeError { error, .. } => {
            warn!("Stream ended without EOS marker: {}", error)
        }
    }

    if dropped_chunks > 0 {
        warn!("{} chunks dropped, caller was not reading", dropped_chunks);
    }

    Ok(StreamReport {
        output,
        outcome,
        dropped_chunks,
    })
}
