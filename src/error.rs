use std::path::PathBuf;
use thiserror::Error;

/// Errors produced while turning a raw log line into an event
#[derive(Error, Debug)]
pub enum ParseError {
    #[error("Malformed log line: {0}")]
    Malformed(String),

    #[error("Missing request line: {0}")]
    MissingRequest(String),

    #[error("Invalid timestamp '{value}': {source}")]
    InvalidTimestamp {
        value: String,
        #[source]
        source: chrono::ParseError,
    },
}

/// Errors raised when a resource path cannot be mapped to a section
#[derive(Error, Debug)]
pub enum SectionError {
    #[error("Unable to parse resource path '{path}': {source}")]
    InvalidPath {
        path: String,
        #[source]
        source: url::ParseError,
    },
}

/// Errors returned by the event distributor
#[derive(Error, Debug, PartialEq, Eq)]
pub enum DistributorError {
    #[error("Distributor is closed")]
    Closed,

    #[error("Delivery cancelled by shutdown")]
    Cancelled,
}

/// Errors that can occur in the file tailer
#[derive(Error, Debug)]
pub enum TailerError {
    #[error("Tailer for {} is already running", .0.display())]
    AlreadyRunning(PathBuf),

    #[error("Tailer for {} is not running", .0.display())]
    NotRunning(PathBuf),

    #[error("Tailer for {} has already finished and cannot be restarted", .0.display())]
    Finished(PathBuf),

    #[error("Failed to open {}: {source}", .path.display())]
    Open {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to spawn tailer thread: {0}")]
    Spawn(String),

    #[error("Tailer thread panicked: {0}")]
    Panicked(String),

    #[error("Subscription failed: {0}")]
    Subscribe(#[from] DistributorError),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

/// Errors for the lifecycle of reporter and alert tasks
#[derive(Error, Debug)]
pub enum TaskError {
    #[error("{0} is already running")]
    AlreadyRunning(String),

    #[error("{0} is not running")]
    NotRunning(String),

    #[error("Failed to spawn {name} thread: {source}")]
    Spawn {
        name: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{0} thread panicked: {1}")]
    Panicked(String, String),
}

/// Errors that can occur during configuration loading
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    ReadError(String),

    #[error("Failed to parse config: {0}")]
    ParseError(String),

    #[error("Invalid configuration value: {0}")]
    ValidationError(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("TOML parse error: {0}")]
    TomlError(#[from] toml::de::Error),
}
