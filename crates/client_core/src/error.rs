use std::{fmt, path::PathBuf, time::Duration};

use shared::{domain::IdempotencyKey, error::ApiError};
use thiserror::Error;

use crate::{pipeline::Stage, state::DisconnectSource};

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("transport failure: {0}")]
    Transport(#[from] TransportError),
    #[error("authentication expired")]
    AuthExpired,
    #[error(transparent)]
    Wait(#[from] WaitError),
    #[error("mutation {key} failed permanently: {reason}")]
    PermanentMutationFailure {
        key: IdempotencyKey,
        reason: MutationFailure,
    },
    #[error("protocol decode failure: {0}")]
    Decode(#[from] CodecError),
    #[error("not connected")]
    NotConnected,
    #[error("disconnect in progress")]
    DisconnectInProgress,
    #[error("storage failure: {0:#}")]
    Storage(#[source] anyhow::Error),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Pipeline(#[from] PipelineConfigError),
    #[error("client has shut down")]
    Closed,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum WaitError {
    #[error("timed out after {0:?}")]
    Timeout(Duration),
    #[error("wait cancelled: {0}")]
    Cancelled(DisconnectSource),
    #[error("waiter withdrawn before resolution")]
    Withdrawn,
    #[error("{0}")]
    Failed(String),
}

/// Why a queued mutation was given up on. Always reported to the caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MutationFailure {
    Expired { max_age: Duration },
    AttemptsExhausted { attempts: u32, last_error: String },
    Rejected(ApiError),
}

impl fmt::Display for MutationFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Expired { max_age } => write!(f, "expired after {max_age:?} in the queue"),
            Self::AttemptsExhausted {
                attempts,
                last_error,
            } => write!(f, "gave up after {attempts} attempts: {last_error}"),
            Self::Rejected(error) => {
                write!(f, "rejected by server ({:?}): {}", error.code, error.message)
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DeliveryError {
    #[error("transient delivery failure: {0}")]
    Transient(String),
    #[error("rejected by server ({:?}): {}", .0.code, .0.message)]
    Rejected(ApiError),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PipelineConfigError {
    #[error("middleware '{name}' declares stage {stage:?} after a {previous:?} stage")]
    StageOutOfOrder {
        name: &'static str,
        stage: Stage,
        previous: Stage,
    },
    #[error("middleware '{0}' is registered twice")]
    DuplicateName(&'static str),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{middleware}: {message}")]
pub struct MiddlewareError {
    pub middleware: &'static str,
    pub message: String,
}

impl MiddlewareError {
    pub fn new(middleware: &'static str, message: impl Into<String>) -> Self {
        Self {
            middleware,
            message: message.into(),
        }
    }
}

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("failed to decode frame: {0}")]
    Decode(#[source] serde_json::Error),
    #[error("failed to encode frame: {0}")]
    Encode(#[source] serde_json::Error),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("invalid server url: {0}")]
    InvalidUrl(String),
    #[error("failed to open connection: {0}")]
    Connect(String),
    #[error("connection closed")]
    Closed,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid value for {key}: {value}")]
    InvalidOverride { key: String, value: String },
    #[error("invalid config: {0}")]
    Invalid(String),
}
