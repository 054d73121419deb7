// SPDX-License-Identifier: Apache-2.0

use clap::{Parser, ValueEnum};
use skidder::config::value::Section;
use skidder::config::AgentConfig;
use skidder::supervisor;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use tracing::{error, info};
use tracing_log::LogTracer;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::{EnvFilter, Registry};

#[derive(Copy, Clone, PartialEq, Eq, Debug, ValueEnum)]
pub enum LogFormatArg {
    Text,
    Json,
}

#[derive(Debug, Parser)]
#[command(name = "skidder")]
#[command(bin_name = "skidder")]
#[command(version, about = "Log-shipping agent", long_about = None)]
struct Arguments {
    /// Configuration file
    config: PathBuf,

    /// PID file
    pidfile: PathBuf,

    /// Log filter; overrides the config's logger block
    #[arg(long, env = "SKIDDER_LOG_LEVEL")]
    log_level: Option<String>,

    /// Log format; overrides the config's logger block
    #[arg(value_enum, long, env = "SKIDDER_LOG_FORMAT")]
    log_format: Option<LogFormatArg>,
}

fn main() -> ExitCode {
    let args = Arguments::parse();

    let config = match AgentConfig::load(&args.config) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("ERROR: {}", e);
            return ExitCode::from(1);
        }
    };

    let _guard = match setup_logging(&args, config.logger.as_ref()) {
        Ok(guard) => guard,
        Err(e) => {
            eprintln!("ERROR: failed to set up logging: {}", e);
            return ExitCode::from(1);
        }
    };

    if let Err(e) = write_pid_file(&args.pidfile) {
        error!(pidfile = %args.pidfile.display(), error = %e, "unable to write pid file");
        return ExitCode::from(1);
    }

    info!(
        config = %args.config.display(),
        inputs = config.inputs.len(),
        outputs = config.outputs.len(),
        "starting skidder"
    );

    let result = run_agent(config);
    let _ = fs::remove_file(&args.pidfile);

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "agent failed");
            ExitCode::from(1)
        }
    }
}

#[tokio::main]
async fn run_agent(config: AgentConfig) -> supervisor::Result<()> {
    supervisor::run(config).await
}

fn write_pid_file(path: &Path) -> std::io::Result<()> {
    fs::write(path, format!("{}\n", std::process::id()))
}

type LoggerGuard = tracing_appender::non_blocking::WorkerGuard;

/// Logging goes through a non-blocking writer to stdout or to the file named
/// in the `logger { file ... }` block. CLI flags win over the block.
fn setup_logging(args: &Arguments, logger: Option<&Section>) -> std::io::Result<LoggerGuard> {
    LogTracer::init().expect("unable to set up log tracer");

    let level = args
        .log_level
        .clone()
        .or_else(|| logger.and_then(|l| l.scalar("level").map(str::to_string)))
        .unwrap_or_else(|| "info".to_string());

    let format = args.log_format.unwrap_or_else(|| {
        match logger.and_then(|l| l.scalar("format")) {
            Some("json") => LogFormatArg::Json,
            _ => LogFormatArg::Text,
        }
    });

    let (writer, guard) = match logger.and_then(|l| l.scalar("file")) {
        Some(path) => {
            let file = fs::OpenOptions::new().create(true).append(true).open(path)?;
            tracing_appender::non_blocking(file)
        }
        None => tracing_appender::non_blocking(std::io::stdout()),
    };

    if format == LogFormatArg::Json {
        let layer = tracing_subscriber::fmt::layer()
            .with_writer(writer)
            .json();
        let subscriber = Registry::default().with(EnvFilter::new(level)).with(layer);
        tracing::subscriber::set_global_default(subscriber).unwrap();
    } else {
        let layer = tracing_subscriber::fmt::layer()
            .with_writer(writer)
            .with_target(false)
            .with_level(true)
            .compact();
        let subscriber = Registry::default().with(EnvFilter::new(level)).with(layer);
        tracing::subscriber::set_global_default(subscriber).unwrap();
    }

    Ok(guard)
}
