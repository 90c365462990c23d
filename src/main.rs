//! nofp-bridge - MQTT telemetry bridge
//!
//! Usage:
//!   nofp-bridge [OPTIONS]
//!
//! Options:
//!   -c, --config <FILE>    Bridge descriptor (default: hal-nofp-bridge.json)
//!   -l, --log-level        Log level (error, warn, info, debug, trace)
//!   -h, --help             Print help

use std::path::PathBuf;

use clap::{Parser, ValueEnum};
use tracing::{info, warn, Level};
use tracing_subscriber::FmtSubscriber;

use nofp_bridge::config::BridgeConfig;
use nofp_bridge::supervisor::{ConnectionSupervisor, StopFlag, TokioSleeper};
use nofp_bridge::transport::{ClientOptions, MqttClient};

/// Log level for CLI
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum, Default)]
enum LogLevel {
    /// Only errors
    Error,
    /// Warnings and errors
    #[default]
    Warn,
    /// Informational messages
    Info,
    /// Debug messages
    Debug,
    /// Trace messages (very verbose)
    Trace,
}

impl LogLevel {
    fn to_tracing_level(self) -> Level {
        match self {
            LogLevel::Error => Level::ERROR,
            LogLevel::Warn => Level::WARN,
            LogLevel::Info => Level::INFO,
            LogLevel::Debug => Level::DEBUG,
            LogLevel::Trace => Level::TRACE,
        }
    }

    /// Level names accepted in the descriptor file
    fn from_config_name(name: &str) -> Option<Self> {
        match name.trim().to_lowercase().as_str() {
            "critical" | "fatal" | "error" => Some(LogLevel::Error),
            "warning" | "warn" => Some(LogLevel::Warn),
            "info" => Some(LogLevel::Info),
            "debug" => Some(LogLevel::Debug),
            "trace" | "notset" => Some(LogLevel::Trace),
            _ => None,
        }
    }
}

/// nofp-bridge - MQTT telemetry bridge
#[derive(Parser, Debug)]
#[command(name = "nofp-bridge")]
#[command(version)]
#[command(about = "Republishes JSON telemetry fields as milli-unit MQTT topics")]
struct Args {
    /// Bridge descriptor (TOML or JSON)
    #[arg(short, long, default_value = "hal-nofp-bridge.json")]
    config: PathBuf,

    /// Log level (error, warn, info, debug, trace)
    #[arg(short, long, value_enum)]
    log_level: Option<LogLevel>,
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    let config = match BridgeConfig::load(&args.config) {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("Error loading config file {:?}: {}", args.config, e);
            std::process::exit(1);
        }
    };

    // CLI overrides config, config overrides default (warn)
    let (log_level, level_note) = match (args.log_level, &config.log_level) {
        (Some(level), _) => (level, None),
        (None, Some(name)) => match LogLevel::from_config_name(name) {
            Some(level) => (level, None),
            None => (
                LogLevel::Warn,
                Some(format!("Unknown log level '{}'. Defaulting to WARNING.", name)),
            ),
        },
        (None, None) => (
            LogLevel::Warn,
            Some("Log level not configured. Defaulting to WARNING.".to_string()),
        ),
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level.to_tracing_level())
        .with_target(false)
        .with_file(false)
        .with_line_number(false)
        .compact()
        .finish();

    if let Err(e) = tracing::subscriber::set_global_default(subscriber) {
        eprintln!("Failed to set up logging: {}", e);
        std::process::exit(1);
    }

    if let Some(note) = level_note {
        warn!("{}", note);
    }
    info!("Loaded configuration from {:?}", args.config);
    info!(
        "Starting bridge '{}' ({}): {} -> {}/*",
        config.name, config.description, config.topic, config.name
    );

    let stop = StopFlag::new();
    tokio::spawn(watch_signals(stop.clone()));

    let transport = MqttClient::new(ClientOptions::from_config(&config));
    let mut supervisor = ConnectionSupervisor::new(&config, transport, TokioSleeper, stop);
    let termination = supervisor.run().await;

    info!("Bridge '{}' exiting: {}", config.name, termination);
    std::process::exit(termination.exit_code());
}

/// Flip the stop flag on SIGINT/SIGTERM (Ctrl+C elsewhere)
async fn watch_signals(stop: StopFlag) {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        match (
            signal(SignalKind::terminate()),
            signal(SignalKind::interrupt()),
        ) {
            (Ok(mut sigterm), Ok(mut sigint)) => loop {
                let name = tokio::select! {
                    Some(()) = sigterm.recv() => "SIGTERM",
                    Some(()) = sigint.recv() => "SIGINT",
                    else => break,
                };
                warn!("Caught a deadly signal: {}!", name);
                stop.request_stop();
            },
            _ => warn!("Failed to set up signal handlers, running without signal handling"),
        }
    }

    #[cfg(not(unix))]
    {
        while tokio::signal::ctrl_c().await.is_ok() {
            warn!("Caught a deadly signal: Ctrl+C!");
            stop.request_stop();
        }
    }
}
