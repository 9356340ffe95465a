use anyhow::{bail, Context, Result};
use clap::Parser;
use log::{error, info, warn};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::Arc;
use std::time::Duration;
use trafficwatch::alerts::{AlertNotification, ThresholdAlert};
use trafficwatch::collectors::FileTailer;
use trafficwatch::config::Config;
use trafficwatch::error::ConfigError;
use trafficwatch::parser::CommonLogParser;
use trafficwatch::reporter::{SectionReporter, SectionSnapshot};
use trafficwatch::runner::TaskRunner;

/// How often the main loop checks for output, shutdown and tailer health
const MAIN_LOOP_INTERVAL: Duration = Duration::from_millis(100);

/// Command-line arguments for the traffic monitor
#[derive(Parser)]
#[command(
    name = "trafficwatch",
    about = "Live section statistics and traffic alerts for an HTTP access log",
    long_about = "Tails a Common Log Format access log, prints per-section hit counts for a \
                  sliding window, and raises an alert when total traffic over a longer window \
                  crosses a threshold."
)]
struct Cli {
    /// Path to configuration file
    #[arg(
        short,
        long,
        value_name = "FILE",
        help = "Configuration file path (TOML format)"
    )]
    config: Option<PathBuf>,

    /// Log file to tail, overrides `tail.path`
    #[arg(short, long, value_name = "LOG")]
    file: Option<PathBuf>,

    /// Print snapshots and alerts as JSON lines
    #[arg(long)]
    json: bool,

    /// Enable verbose logging
    #[arg(short, long, help = "Enable verbose logging output (debug level)")]
    verbose: bool,
}

impl Cli {
    /// Validate the CLI arguments
    ///
    /// A missing config file is allowed (defaults are used); a directory is not.
    fn validate(&self) -> Result<(), String> {
        if let Some(ref config_path) = self.config {
            if config_path.exists() {
                if !config_path.is_file() {
                    return Err(format!(
                        "Configuration path is not a file: {}",
                        config_path.display()
                    ));
                }
                if let Some(extension) = config_path.extension() {
                    if extension != "toml" {
                        warn!(
                            "Configuration file does not have .toml extension: {}",
                            config_path.display()
                        );
                    }
                }
            }
        }

        if let Some(ref log_path) = self.file {
            if log_path.is_dir() {
                return Err(format!("Log path is a directory: {}", log_path.display()));
            }
        }

        Ok(())
    }

    fn output_format(&self) -> OutputFormat {
        if self.json {
            OutputFormat::Json
        } else {
            OutputFormat::Text
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OutputFormat {
    Text,
    Json,
}

/// One JSON output line
#[derive(Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum OutputRecord<'a> {
    Snapshot(&'a SectionSnapshot),
    Alert(&'a AlertNotification),
}

/// Wires the tailer to the section reporter and the threshold alert
///
/// Each consumer gets its own subscription and runs on its own thread; this
/// struct only prints what they emit and manages their lifecycle.
struct TrafficMonitor {
    tailer: FileTailer,
    reporter: TaskRunner<SectionReporter>,
    alert: TaskRunner<ThresholdAlert>,
    snapshots: Receiver<SectionSnapshot>,
    notifications: Receiver<AlertNotification>,
    format: OutputFormat,
    shutdown_sender: Sender<()>,
    shutdown_receiver: Receiver<()>,
}

impl TrafficMonitor {
    fn new(config: &Config, format: OutputFormat) -> Self {
        let tailer = FileTailer::new(
            &config.tail.path,
            Arc::new(CommonLogParser::new()),
            config.tailer_config(),
        );

        let (snapshot_sender, snapshots) = mpsc::channel();
        let reporter = TaskRunner::new(SectionReporter::new(config.report_window()), snapshot_sender);

        let (notification_sender, notifications) = mpsc::channel();
        let alert = TaskRunner::new(
            ThresholdAlert::new(
                config.alert.name.clone(),
                config.alert_window(),
                config.alert.threshold,
            ),
            notification_sender,
        );

        let (shutdown_sender, shutdown_receiver) = mpsc::channel();

        Self {
            tailer,
            reporter,
            alert,
            snapshots,
            notifications,
            format,
            shutdown_sender,
            shutdown_receiver,
        }
    }

    /// Load configuration from file or use defaults
    ///
    /// A missing file falls back to defaults with a warning; an unreadable or
    /// invalid file is an error.
    fn load_config(config_path: Option<&Path>) -> Result<Config, ConfigError> {
        match config_path {
            Some(path) => {
                info!("Loading configuration from: {}", path.display());
                match Config::from_file(path) {
                    Ok(config) => Ok(config),
                    Err(ConfigError::ReadError(reason)) => {
                        warn!("Configuration file not found ({}), using defaults", reason);
                        Ok(Config::default())
                    }
                    Err(e) => Err(e),
                }
            }
            None => {
                info!("Using default configuration");
                Ok(Config::default())
            }
        }
    }

    fn start(&mut self) -> Result<()> {
        let report_events = self
            .tailer
            .subscribe()
            .context("Failed to subscribe section reporter")?;
        let alert_events = self
            .tailer
            .subscribe()
            .context("Failed to subscribe threshold alert")?;

        self.reporter.start(report_events)?;
        self.alert.start(alert_events)?;
        self.tailer
            .start()
            .with_context(|| format!("Failed to start tailing {}", self.tailer.path().display()))?;

        info!("Monitoring {}", self.tailer.path().display());
        Ok(())
    }

    /// Print output until Ctrl+C or until the tailer dies
    fn run_until_shutdown(&self) -> Result<()> {
        loop {
            self.print_pending()?;

            match self.shutdown_receiver.recv_timeout(MAIN_LOOP_INTERVAL) {
                Ok(()) | Err(RecvTimeoutError::Disconnected) => {
                    info!("Shutdown signal received");
                    return Ok(());
                }
                Err(RecvTimeoutError::Timeout) => {}
            }

            if !self.tailer.is_running() {
                bail!("Tailer for {} stopped unexpectedly", self.tailer.path().display());
            }
        }
    }

    fn print_pending(&self) -> Result<()> {
        for snapshot in self.snapshots.try_iter() {
            self.print(OutputRecord::Snapshot(&snapshot))?;
        }
        for notification in self.notifications.try_iter() {
            self.print(OutputRecord::Alert(&notification))?;
        }
        Ok(())
    }

    fn print(&self, record: OutputRecord<'_>) -> Result<()> {
        match self.format {
            OutputFormat::Json => {
                let line = serde_json::to_string(&record).context("Failed to encode output")?;
                println!("{}", line);
            }
            OutputFormat::Text => match record {
                OutputRecord::Snapshot(snapshot) => println!("{}", snapshot),
                OutputRecord::Alert(notification) => println!("*** {}", notification),
            },
        }
        Ok(())
    }

    /// Stop every component, tailer first so the runners see end-of-stream
    fn stop(&mut self) -> Result<()> {
        info!("Stopping traffic monitor");
        let tail_result = match self.tailer.stop() {
            Err(trafficwatch::TailerError::NotRunning(_)) => Ok(()),
            other => other,
        };

        if let Err(e) = self.reporter.stop() {
            warn!("Section reporter: {}", e);
        }
        if let Err(e) = self.alert.stop() {
            warn!("Threshold alert: {}", e);
        }
        self.print_pending()?;

        tail_result.context("Tailer ended with an error")?;
        info!("Traffic monitor stopped");
        Ok(())
    }
}

fn run(cli: Cli) -> Result<()> {
    cli.validate().map_err(anyhow::Error::msg)?;

    let mut config = TrafficMonitor::load_config(cli.config.as_deref())
        .context("Failed to load configuration")?;
    if let Some(path) = &cli.file {
        config.tail.path = path.clone();
    }
    config.validate().context("Invalid configuration")?;

    let mut monitor = TrafficMonitor::new(&config, cli.output_format());

    let shutdown_sender = monitor.shutdown_sender.clone();
    ctrlc::set_handler(move || {
        info!("Received interrupt signal (SIGINT), shutting down gracefully...");
        if let Err(e) = shutdown_sender.send(()) {
            error!("Failed to send shutdown signal: {}", e);
        }
    })
    .context("Error setting SIGINT handler")?;

    if let Err(e) = monitor.start() {
        if let Err(stop_error) = monitor.stop() {
            warn!("Cleanup after failed start: {:#}", stop_error);
        }
        return Err(e);
    }
    info!("Traffic monitor is running. Press Ctrl+C to stop.");

    let outcome = monitor.run_until_shutdown();
    let stopped = monitor.stop();
    outcome.and(stopped)
}

fn main() {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_level))
        .init();

    if let Err(e) = run(cli) {
        error!("{:#}", e);
        std::process::exit(1);
    }
}
