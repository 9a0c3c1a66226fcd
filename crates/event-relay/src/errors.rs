// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use reqwest::header::InvalidHeaderValue;
use reqwest::StatusCode;

/// Error constructing a [`crate::path::Path`] from pre-split segments.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PathError {
    #[error("path must contain at least one segment")]
    Empty,
}

/// Errors raised while loading mapping tables or rule sets from configuration data.
#[derive(Debug, thiserror::Error)]
pub enum MappingError {
    #[error("Failed to parse mapping rules: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Fallback chain for `{destination}` must contain only path strings")]
    InvalidFallback { destination: String },
}

/// Reasons a single delivery attempt failed. These never leave the dispatcher.
#[derive(Debug, thiserror::Error)]
pub enum DeliveryError {
    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("collector responded with {status}: {body}")]
    Status { status: StatusCode, body: String },

    #[error("failed to serialize batch: {0}")]
    Payload(#[from] serde_json::Error),

    #[error("invalid credential header: {0}")]
    Header(#[from] InvalidHeaderValue),

    #[error("failed to format delivery timestamp: {0}")]
    Timestamp(#[from] time::error::Format),
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable {0}")]
    Missing(&'static str),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Startup failures of the relay.
#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("Failed to build HTTP client: {0}")]
    Client(#[from] reqwest::Error),

    #[error(transparent)]
    Mapping(#[from] MappingError),

    #[error("Failed to read mapping rules: {0}")]
    Io(#[from] std::io::Error),
}
