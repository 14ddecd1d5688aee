#![deny(warnings)]
#![deny(clippy::unwrap_used)]

//! One-shot remote command runner.
//!
//! ```text
//! SSH_HOST=build.example.com SSH_USER=deploy SSH_KEY_PATH=~/.ssh/id_ed25519 \
//!     remote-exec uname -a
//! ```
//!
//! Remote stdout is copied to stdout. Failures are printed to stderr as a
//! JSON report and mapped to the exit code: the remote exit code for a
//! failed command, 124 on timeout, 130 on Ctrl-C, 1 otherwise.

use std::env;
use std::error::Error;
use std::path::PathBuf;
use std::process::ExitCode;

use dotenv::dotenv;
use remote_exec::exec::parse_address;
use remote_exec::{
    CommandOutput, CommandRunner, ConnectionConfig, ErrorKind, ExecError, ExitStatus,
    HostKeyPolicy, RemoteExecutor,
};
use serde::Serialize;
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

const EXIT_FAILURE: u8 = 1;
const EXIT_TIMEOUT: u8 = 124;
const EXIT_CANCELLED: u8 = 130;

/// Failure summary written to stderr.
#[derive(Debug, Serialize)]
struct FailureReport<'a> {
    kind: ErrorKind,
    message: String,
    transient: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    exit_status: Option<&'a ExitStatus>,
    #[serde(skip_serializing_if = "Option::is_none")]
    stderr: Option<&'a str>,
}

impl<'a> From<&'a ExecError> for FailureReport<'a> {
    fn from(e: &'a ExecError) -> Self {
        Self {
            kind: e.kind(),
            message: e.to_string(),
            transient: e.kind().is_transient(),
            exit_status: e.exit_status(),
            stderr: e.stderr(),
        }
    }
}

fn exit_code(e: &ExecError) -> u8 {
    match e.primary() {
        ExecError::CommandFailed {
            status: ExitStatus::Code(code),
            ..
        } => u8::try_from(*code)
            .ok()
            .filter(|code| *code != 0)
            .unwrap_or(EXIT_FAILURE),
        ExecError::DeadlineExceeded(_) => EXIT_TIMEOUT,
        ExecError::Cancelled => EXIT_CANCELLED,
        _ => EXIT_FAILURE,
    }
}

fn env_flag(name: &str) -> bool {
    env::var(name)
        .map(|value| matches!(value.trim().to_lowercase().as_str(), "1" | "true" | "yes"))
        .unwrap_or(false)
}

fn required_env(name: &str) -> Result<String, Box<dyn Error>> {
    env::var(name).map_err(|_| format!("{} is not set", name).into())
}

/// Build the connection config from `SSH_*` variables.
///
/// `SSH_PORT` overrides a port given in `SSH_HOST`.
fn config_from_env() -> Result<ConnectionConfig, Box<dyn Error>> {
    let (host, mut port) = parse_address(&required_env("SSH_HOST")?)?;
    if let Ok(value) = env::var("SSH_PORT") {
        port = value
            .parse()
            .map_err(|e| format!("Invalid SSH_PORT: {}", e))?;
    }
    let user = required_env("SSH_USER")?;
    let key_path = required_env("SSH_KEY_PATH")?;
    let key = std::fs::read_to_string(&key_path)
        .map_err(|e| format!("Failed to read key file {}: {}", key_path, e))?;

    let policy = if env_flag("SSH_ACCEPT_ANY_HOST_KEY") {
        warn!("Host key verification disabled by SSH_ACCEPT_ANY_HOST_KEY");
        HostKeyPolicy::AcceptAny
    } else {
        HostKeyPolicy::KnownHosts {
            path: env::var_os("SSH_KNOWN_HOSTS").map(PathBuf::from),
        }
    };

    Ok(ConnectionConfig::new(host, user, key, policy).port(port))
}

async fn write_stdout(output: &CommandOutput) {
    let mut stdout = tokio::io::stdout();
    if let Err(e) = stdout.write_all(&output.stdout).await {
        error!("Failed to write command output: {}", e);
    }
    let _ = stdout.flush().await;
}

fn report(e: &ExecError) -> ExitCode {
    match serde_json::to_string(&FailureReport::from(e)) {
        Ok(json) => eprintln!("{}", json),
        Err(_) => eprintln!("{}", e),
    }
    ExitCode::from(exit_code(e))
}

async fn run() -> Result<ExitCode, Box<dyn Error>> {
    let command = env::args().skip(1).collect::<Vec<_>>().join(" ");
    if command.is_empty() {
        return Err("usage: remote-exec <command> [args...]".into());
    }
    let config = config_from_env()?;

    let cancel = CancellationToken::new();
    let on_interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Interrupted, cancelling");
            on_interrupt.cancel();
        }
    });

    let connected = tokio::select! {
        connected = RemoteExecutor::connect(&config, None) => connected,
        _ = cancel.cancelled() => Err(ExecError::Cancelled),
    };
    let executor = match connected {
        Ok(executor) => executor,
        Err(e) => return Ok(report(&e)),
    };

    let outcome = executor.run(&command, &cancel).await;
    if let Err(e) = executor.close().await {
        warn!("Failed to close connection: {}", e);
    }

    match outcome {
        Ok(output) => {
            write_stdout(&output).await;
            Ok(ExitCode::SUCCESS)
        }
        Err(e) => {
            if let ExecError::CloseFailed {
                output: Some(output),
                ..
            } = &e
            {
                write_stdout(output).await;
            }
            Ok(report(&e))
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    dotenv().ok();

    // Logs go to stderr; stdout carries the remote output
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("info".parse().expect("valid directive")),
        )
        .init();

    match run().await {
        Ok(code) => code,
        Err(e) => {
            error!("{}", e);
            ExitCode::from(EXIT_FAILURE)
        }
    }
}
