//! RPCX-CORE service entry point.
//!
//! ## CLI Subcommands
//!
//! - `rpcx-core-cli` or `rpcx-core-cli serve` - Run the service (default)
//! - `rpcx-core-cli config show|validate` - Inspect the config file
//! - `rpcx-core-cli call <service> <path> [k=v ...]` - One outbound call

use std::process::ExitCode;
use std::time::Duration;

use rpcx_core::cli::{self, call_cmd, config_cmd};
use rpcx_core::config;
use rpcx_core::server::{self, Lifecycle};
use rpcx_core::service::registry::HandlerRegistry;
use rpcx_core::telemetry::{init_logging, LogConfig, LogFormat};
use rpcx_core::{Backends, Runtime};

const CLOSE_TIMEOUT: Duration = Duration::from_secs(5);

#[tokio::main]
async fn main() -> ExitCode {
    let args: Vec<String> = std::env::args().collect();
    let command = args.get(1).map(|s| s.as_str()).unwrap_or("serve");

    match command {
        "serve" | "" => match run_serve().await {
            Ok(()) => ExitCode::SUCCESS,
            Err(e) => {
                eprintln!("Server error: {}", e);
                ExitCode::from(cli::serve_exit_code(e.as_ref()))
            }
        },
        "config" => {
            let path = cli::config_path();
            let subcommand = args.get(2).map(|s| s.as_str()).unwrap_or("show");
            match subcommand {
                "show" => ExitCode::from(config_cmd::run_show(&path) as u8),
                "validate" => ExitCode::from(config_cmd::run_validate(&path) as u8),
                _ => {
                    eprintln!("Unknown config subcommand: {}", subcommand);
                    print_usage();
                    ExitCode::FAILURE
                }
            }
        }
        "call" => run_call(&args[2..]).await,
        "help" | "--help" | "-h" => {
            print_usage();
            ExitCode::SUCCESS
        }
        "version" | "--version" | "-V" => {
            println!("rpcx-core {}", env!("CARGO_PKG_VERSION"));
            ExitCode::SUCCESS
        }
        _ => {
            eprintln!("Unknown command: {}", command);
            print_usage();
            ExitCode::FAILURE
        }
    }
}

/// Serve until SIGINT/SIGTERM. SIGHUP reloads the config and serves again.
async fn run_serve() -> Result<(), Box<dyn std::error::Error>> {
    let path = cli::config_path();
    let mut config = config::load(&path)?;
    let _log_guard = init_logging(&LogConfig {
        format: LogFormat::Json,
        level: "info".to_string(),
        dir: Some(config.log_dir.clone().into()),
        file_name: format!("{}.log", config.identity.name),
    })?;

    loop {
        let registry = HandlerRegistry::register(Vec::new())?;
        let runtime = Runtime::new(config, registry, Backends::in_memory());
        let stop = async {
            match server::wait_for_signal().await {
                Ok(event) => event,
                Err(e) => {
                    tracing::error!(error = %e, "signal handler install failed");
                    Lifecycle::Shutdown
                }
            }
        };
        let event = server::serve(&runtime, runtime.registrar(), stop).await?;
        runtime.close(CLOSE_TIMEOUT).await;

        if event != Lifecycle::Restart {
            return Ok(());
        }
        tracing::info!("reloading config and restarting");
        config = config::load(&path)?;
    }
}

async fn run_call(words: &[String]) -> ExitCode {
    let (Some(service), Some(path)) = (words.first(), words.get(1)) else {
        eprintln!("usage: rpcx-core-cli call <service> <path> [--addr HOST:PORT] [key=value ...]");
        return ExitCode::FAILURE;
    };

    let mut addr = call_cmd::default_addr();
    let mut pairs = Vec::new();
    let mut rest = words[2..].iter();
    while let Some(word) = rest.next() {
        if word == "--addr" {
            match rest.next() {
                Some(a) => addr = a.clone(),
                None => {
                    eprintln!("--addr needs a value");
                    return ExitCode::FAILURE;
                }
            }
        } else {
            pairs.push(word.as_str());
        }
    }

    let args = match cli::parse_args(pairs) {
        Ok(args) => args,
        Err(e) => {
            eprintln!("{}", e);
            return ExitCode::FAILURE;
        }
    };
    ExitCode::from(call_cmd::run_call(service, path, args, &addr).await as u8)
}

fn print_usage() {
    let version = env!("CARGO_PKG_VERSION");
    eprintln!(
        "rpcx-core - versioned RPC service runtime v{}

USAGE:
    rpcx-core-cli [COMMAND] [OPTIONS]

COMMANDS:
    serve        Run the service (default when no command given)
    config       Inspect configuration (show, validate)
    call         Call a service: call <service> <path> [--addr HOST:PORT] [key=value ...]
    version      Show version information
    help         Show this help message

ENVIRONMENT:
    RPCX_CONFIG              Config file path (default: service.toml)
    RPCX_SERVICE_NAME        Override service.name
    RPCX_SERVICE_ADDR        Override service.addr
    RPCX_LOG_DIR             Override service.log_dir
    RPCX_CALL_TIMEOUT_MS     Outbound call deadline in ms
    RPCX_RENEW_ONE_IN        Pool renewal odds, 0 disables
    RPCX_LOG_SINK_CAPACITY   Max resident named log sinks
    RPCX_CALL_ADDR           Member address for `call` (default: 127.0.0.1:9000)
    RUST_LOG                 Log filter (debug, info, warn, error)

SIGNALS:
    SIGHUP           Drain, reload config and serve again
    SIGINT, SIGTERM  Drain and exit

EXIT CODES:
    0  Success
    1  Failure
    2  Configuration error
",
        version
    );
}
