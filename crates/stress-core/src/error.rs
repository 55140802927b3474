use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Invalid or contradictory run parameters, detected before any request is sent.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("number or duration must be set to a positive value")]
    MissingBound,

    #[error("number and duration are mutually exclusive, set only one")]
    ConflictingBounds,

    #[error("concurrency cannot be smaller than 1")]
    Concurrency,

    #[error("number ({number}) cannot be less than concurrency ({concurrency})")]
    NumberBelowConcurrency { number: u64, concurrency: u64 },

    #[error("number ({number}) must be an integer multiple of concurrency ({concurrency})")]
    NumberNotMultiple { number: u64, concurrency: u64 },

    #[error("a transaction needs at least one step")]
    NoSteps,

    #[error("step {index}: url and method cannot be empty")]
    MissingUrlOrMethod { index: usize },

    #[error("step {index}: invalid url {url:?}: {reason}")]
    InvalidUrl {
        index: usize,
        url: String,
        reason: String,
    },

    #[error("step {index}: invalid method {method:?}")]
    InvalidMethod { index: usize, method: String },

    #[error("step {index}: body file {path:?} was not loaded")]
    UnloadedBody { index: usize, path: PathBuf },

    #[error("invalid header {name:?}: {reason}")]
    InvalidHeader { name: String, reason: String },

    #[error("invalid proxy address {address:?}: {reason}")]
    InvalidProxy { address: String, reason: String },

    #[error("cannot create output directory {path:?}: {source}")]
    OutputDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Failure of a single request. Recorded on the step's detail; never aborts a run.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
pub enum RequestError {
    #[error("dns lookup failed: {0}")]
    Dns(String),

    #[error("connect failed: {0}")]
    Connect(String),

    #[error("tls handshake failed: {0}")]
    Tls(String),

    #[error("proxy tunnel failed: {0}")]
    Proxy(String),

    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    #[error("http error: {0}")]
    Http(String),

    #[error("{0}")]
    Redirect(String),
}

impl RequestError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, RequestError::Timeout(_))
    }
}

impl From<hyper::Error> for RequestError {
    fn from(e: hyper::Error) -> Self {
        RequestError::Http(e.to_string())
    }
}

/// Top-level error of a run.
#[derive(Debug, Error)]
pub enum StressError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("failed to start the worker runtime: {0}")]
    Runtime(#[source] std::io::Error),

    #[error("run interrupted after {completed} completed iterations")]
    Interrupted { completed: usize },
}
