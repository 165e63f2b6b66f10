use std::env;
use std::process::ExitCode;

use rkllm::wrapper::{probe_library, DEFAULT_LIB_PATH};

const VERSION: &str = env!("CARGO_PKG_VERSION");

fn main() -> ExitCode {
    let args: Vec<String> = env::args().skip(1).collect();

    if args.len() == 1 && args[0] == "--version" {
        eprintln!("rkllm-probe v{}", VERSION);
        return ExitCode::SUCCESS;
    }
    if args.iter().any(|a| a.starts_with('-')) {
        eprintln!("rkllm-probe v{}", VERSION);
        eprintln!("usage: rkllm-probe [<path>...]");
        return ExitCode::from(2);
    }

    let paths = if args.is_empty() {
        vec![DEFAULT_LIB_PATH.to_string()]
    } else {
        args
    };

    let probes: Vec<_> = paths.iter().map(|p| probe_library(p)).collect();
    let usable = probes.iter().all(|p| p.is_usable());

    match serde_json::to_string_pretty(&probes) {
        Ok(json) => println!("{}", json),
        Err(e) => {
            eprintln!("failed to encode probe results: {}", e);
            return ExitCode::FAILURE;
        }
    }

    if usable {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    }
}
