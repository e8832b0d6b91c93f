//! Error types for scenario runs

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Coarse failure category, used for reporting
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Bad runner or scenario configuration; raised before any I/O
    Configuration,
    /// Purge, seed or copy failed while preparing fixtures
    Fixture,
    /// The request never produced a response
    Transport,
    /// The response body was not JSON
    Parse,
    /// Status, body, row or upload mismatch
    Assertion,
    /// A `before` or `after` hook failed
    Hook,
    /// The scenario exceeded its wall-clock budget
    Timeout,
    /// Anything else (store read failures, join errors)
    Internal,
}

#[derive(Error, Debug)]
pub enum RestamentError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Cannot upload files with data in JSON format")]
    UploadsWithJson,

    #[error("Scenario spec parse error: {0}")]
    SpecParse(String),

    #[error("Fixture {phase} failed: {source}")]
    Fixture {
        phase: &'static str,
        #[source]
        source: restament_common::Error,
    },

    #[error("Fixture copy {src} -> {dest} failed: {source}")]
    FixtureCopy {
        src: PathBuf,
        dest: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Store error: {0}")]
    Store(#[from] restament_common::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error(
        "Response body is not JSON! Response body is:\n--------------------\n{body}\n--------------------\n"
    )]
    NonJsonBody { body: String },

    #[error("Expected status {expected} but got {actual}")]
    StatusMismatch { expected: u16, actual: u16 },

    #[error("Response body mismatch: expected {expected} but got {actual}")]
    BodyMismatch { expected: Value, actual: Value },

    #[error("Table {table}: expected {expected} row(s) but found {actual}")]
    RowCountMismatch {
        table: String,
        expected: usize,
        actual: usize,
    },

    #[error("Table {table}, row {row}, column {column}: expected {expected} but got {actual}")]
    ColumnMismatch {
        table: String,
        row: usize,
        column: String,
        expected: String,
        actual: Value,
    },

    #[error("Uploaded file {filename} does not match {original}")]
    UploadMismatch { filename: String, original: PathBuf },

    #[error("{} doesn't exist!", .0.display())]
    FileMissing(PathBuf),

    #[error("Image comparison of {filename} failed: {reason}")]
    ImageCompare { filename: String, reason: String },

    #[error("{hook} hook failed: {reason}")]
    Hook { hook: &'static str, reason: String },

    #[error("Scenario timed out after {0} ms")]
    Timeout(u64),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("Image error: {0}")]
    Image(#[from] image::ImageError),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl RestamentError {
    /// Classify this error for reporting
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Config(_) | Self::UploadsWithJson | Self::SpecParse(_) | Self::Yaml(_) => {
                ErrorKind::Configuration
            }
            Self::Fixture { .. } | Self::FixtureCopy { .. } => ErrorKind::Fixture,
            Self::Http(_) => ErrorKind::Transport,
            Self::NonJsonBody { .. } => ErrorKind::Parse,
            Self::StatusMismatch { .. }
            | Self::BodyMismatch { .. }
            | Self::RowCountMismatch { .. }
            | Self::ColumnMismatch { .. }
            | Self::UploadMismatch { .. }
            | Self::FileMissing(_)
            | Self::ImageCompare { .. } => ErrorKind::Assertion,
            Self::Hook { .. } => ErrorKind::Hook,
            Self::Timeout(_) => ErrorKind::Timeout,
            Self::Store(_) | Self::Io(_) | Self::Json(_) | Self::Image(_) | Self::Internal(_) => {
                ErrorKind::Internal
            }
        }
    }

    pub(crate) fn fixture(phase: &'static str, source: restament_common::Error) -> Self {
        Self::Fixture { phase, source }
    }

    pub(crate) fn hook(hook: &'static str, reason: impl ToString) -> Self {
        Self::Hook {
            hook,
            reason: reason.to_string(),
        }
    }
}

pub type RunResult<T> = Result<T, RestamentError>;
