//! rkllm-stream: run one prompt on the NPU and print tokens as they stream.
//!
//! Creates the FIFO, loads the model, runs the prompt with the pipe reader
//! beside it, prints every chunk as it arrives and then the full output.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{error, info, warn};

use rkllm::stream::{default_fifo_path, ABORT_GRACE_PERIOD};
use rkllm::wrapper::{DEFAULT_MAX_CONTEXT_LEN, DEFAULT_MAX_NEW_TOKENS};
use rkllm::{
    spawn_streaming, InitParams, Input, NativeLibrary, RkllmError, Session,
    DEFAULT_OUTPUT_CAPACITY,
};

#[derive(Parser)]
#[command(name = "rkllm-stream")]
#[command(about = "Stream a completion from the RKLLM runtime through a named pipe")]
#[command(version)]
struct Cli {
    /// Path to the .rkllm model file
    #[arg(long, env = "RKLLM_MODEL_PATH")]
    model_path: PathBuf,

    /// Path to librkllm_wrapper.so
    #[cfg(feature = "dynamic")]
    #[arg(long, env = "RKLLM_LIB_PATH", default_value = rkllm::wrapper::DEFAULT_LIB_PATH)]
    lib_path: String,

    /// FIFO the runtime streams into [default: /tmp/llm_output_<pid>.fifo]
    #[arg(long, env = "RKLLM_FIFO_PATH")]
    fifo: Option<PathBuf>,

    /// Prompt text
    #[arg(long, default_value = "Hello, How are you?")]
    prompt: String,

    #[arg(long, default_value_t = DEFAULT_MAX_NEW_TOKENS)]
    max_new_tokens: i32,

    #[arg(long, default_value_t = DEFAULT_MAX_CONTEXT_LEN)]
    max_context_len: i32,

    /// Size of the final output buffer in bytes
    #[arg(long, default_value_t = DEFAULT_OUTPUT_CAPACITY)]
    output_capacity: usize,

    /// Abort generation after this long (e.g., "30s", "2m"); exits non-zero
    /// if the runtime does not stop
    #[arg(long, value_parser = parse_duration)]
    timeout: Option<Duration>,
}

/// Parse a duration string (e.g., "30s", "2m", "1h30m").
fn parse_duration(s: &str) -> Result<Duration, String> {
    let s = s.trim();
    if s.is_empty() {
        return Err("empty duration".to_string());
    }

    let mut total = Duration::ZERO;
    let mut digits = String::new();
    let mut chars = s.chars().peekable();

    while let Some(c) = chars.next() {
        if c.is_ascii_digit() {
            digits.push(c);
            continue;
        }
        if !c.is_alphabetic() {
            return Err(format!("invalid character in duration: '{}'", c));
        }
        if digits.is_empty() {
            return Err(format!("invalid duration: missing number before '{}'", c));
        }

        let mut unit = c.to_string();
        while let Some(&next) = chars.peek() {
            if !next.is_alphabetic() {
                break;
            }
            unit.push(next);
            chars.next();
        }

        let num: u64 = digits
            .parse()
            .map_err(|_| format!("invalid number: {}", digits))?;
        digits.clear();

        total += match unit.as_str() {
            "ms" => Duration::from_millis(num),
            "s" => Duration::from_secs(num),
            "m" => Duration::from_secs(num * 60),
            "h" => Duration::from_secs(num * 3600),
            _ => return Err(format!("unknown unit: {}", unit)),
        };
    }

    // Bare trailing number: seconds
    if !digits.is_empty() {
        let num: u64 = digits
            .parse()
            .map_err(|_| format!("invalid number: {}", digits))?;
        total += Duration::from_secs(num);
    }

    if total.is_zero() {
        return Err("duration must be positive".to_string());
    }

    Ok(total)
}

fn open_library(cli: &Cli) -> Result<NativeLibrary> {
    #[cfg(feature = "dynamic")]
    {
        NativeLibrary::open(&cli.lib_path)
            .with_context(|| format!("Failed to load {}", cli.lib_path))
    }

    #[cfg(not(feature = "dynamic"))]
    {
        let _ = cli;
        NativeLibrary::linked().context("Failed to bind linked RKLLM runtime")
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env().add_directive("rkllm=info".parse()?),
        )
        .init();

    let cli = Cli::parse();
    let fifo = cli.fifo.clone().unwrap_or_else(default_fifo_path);

    let library = open_library(&cli)?;
    let session = Arc::new(Session::new(Arc::new(library)));

    let params = InitParams::new(&cli.model_path).with_limits(cli.max_new_tokens, cli.max_context_len);
    session
        .init(&params)
        .with_context(|| format!("Failed to initialize model {:?}", cli.model_path))?;

    info!("Streaming through {:?}", fifo);
    let result = stream_prompt(&session, &cli, fifo).await;

    if let Err(e) = &result {
        if let Some(RkllmError::Timeout { .. }) = e.downcast_ref::<RkllmError>() {
            // The abandoned call still owns the model: destroy would wait on
            // it, and so would runtime shutdown.
            error!("{:#}", e);
            std::process::exit(1);
        }
    }

    if let Err(e) = session.destroy() {
        warn!("Failed to destroy session: {}", e);
    }
    result
}

async fn stream_prompt(
    session: &Arc<Session<NativeLibrary>>,
    cli: &Cli,
    fifo: PathBuf,
) -> Result<()> {
    let mut run = spawn_streaming(
        Arc::clone(session),
        Input::prompt(cli.prompt.as_str()),
        fifo,
        cli.output_capacity,
    )
    .context("Failed to start streaming run")?;

    let print = |chunk: String| println!("Received chunk: {}", chunk);

    let report = match cli.timeout {
        Some(limit) => run.drain_within(session, limit, ABORT_GRACE_PERIOD, print).await,
        None => {
            while let Some(chunk) = run.next_chunk().await {
                print(chunk);
            }
            run.finish().await
        }
    }
    .context("Inference failed")?;
    if !report.outcome.is_completed() {
        warn!(
            "Stream ended after {} chunks without EOS marker",
            report.outcome.chunks()
        );
    }

    println!("LLM Final Output:");
    println!("{}", report.output);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_duration_seconds() {
        assert_eq!(parse_duration("30s").unwrap(), Duration::from_secs(30));
        assert_eq!(parse_duration("300s").unwrap(), Duration::from_secs(300));
    }

    #[test]
    fn test_parse_duration_minutes() {
        assert_eq!(parse_duration("5m").unwrap(), Duration::from_secs(300));
    }

    #[test]
    fn test_parse_duration_combined() {
        assert_eq!(parse_duration("1h30m").unwrap(), Duration::from_secs(5400));
        assert_eq!(parse_duration("2m30s").unwrap(), Duration::from_secs(150));
    }

    #[test]
    fn test_parse_duration_millis() {
        assert_eq!(parse_duration("1500ms").unwrap(), Duration::from_millis(1500));
    }

    #[test]
    fn test_parse_duration_bare_number() {
        assert_eq!(parse_duration("45").unwrap(), Duration::from_secs(45));
    }

    #[test]
    fn test_parse_duration_errors() {
        assert!(parse_duration("").is_err());
        assert!(parse_duration("0s").is_err());
        assert!(parse_duration("abc").is_err());
        assert!(parse_duration("5d").is_err());
        assert!(parse_duration("-5s").is_err());
    }

    #[test]
    fn test_cli_defaults() {
        let cli = Cli::try_parse_from(["rkllm-stream", "--model-path", "/models/qwen.rkllm"]).unwrap();
        assert_eq!(cli.prompt, "Hello, How are you?");
        assert_eq!(cli.max_new_tokens, 4096);
        assert_eq!(cli.max_context_len, 4096);
        assert_eq!(cli.output_capacity, 8192);
        assert!(cli.timeout.is_none());
    }

    #[test]
    fn test_cli_timeout() {
        let cli = Cli::try_parse_from([
            "rkllm-stream",
            "--model-path",
            "m.rkllm",
            "--timeout",
            "2m",
        ])
        .unwrap();
        assert_eq!(cli.timeout, Some(Duration::from_secs(120)));
    }
}
