// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use crate::cluster::ClusterError;
use crate::config::ConfigError;
use std::error::Error;
use std::fmt::{Debug, Display};

/// Represents different kinds of errors that can occur during the builder
/// process.
#[derive(Debug, PartialEq)]
pub enum BuilderErrorKind {
    /// No downstream consumer was supplied.
    MissingDownstream,
}

impl Display for BuilderErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BuilderErrorKind::MissingDownstream => {
                write!(f, "a downstream trace consumer is required")
            }
        }
    }
}

/// Represents different kinds of internal errors.
#[derive(Debug, PartialEq)]
pub enum InternalErrorKind {
    /// Indicates that some background workers are in an invalid state. The
    /// associated `String` contains the error message.
    InvalidWorkerState(String),
    /// The processor was started twice without a shutdown in between.
    AlreadyStarted,
}

impl Display for InternalErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            InternalErrorKind::InvalidWorkerState(msg) => {
                write!(f, "invalid worker state: {}", msg)
            }
            InternalErrorKind::AlreadyStarted => write!(f, "processor already started"),
        }
    }
}

/// ProcessorError holds the error surface of the processor's lifecycle
/// boundaries. Per-span classification never surfaces errors.
#[derive(Debug)]
pub enum ProcessorError {
    /// Invalid builder input.
    Builder(BuilderErrorKind),
    /// Gossip layer failed to start.
    Cluster(ClusterError),
    /// Rejected configuration values.
    Config(ConfigError),
    /// The downstream consumer refused a batch.
    Downstream(anyhow::Error),
    /// Error internal to the processor.
    Internal(InternalErrorKind),
    /// Generic IO error.
    Io(std::io::Error),
}

impl From<ConfigError> for ProcessorError {
    fn from(value: ConfigError) -> Self {
        ProcessorError::Config(value)
    }
}

impl From<ClusterError> for ProcessorError {
    fn from(value: ClusterError) -> Self {
        ProcessorError::Cluster(value)
    }
}

impl From<std::io::Error> for ProcessorError {
    fn from(value: std::io::Error) -> Self {
        ProcessorError::Io(value)
    }
}

impl Display for ProcessorError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProcessorError::Builder(e) => std::fmt::Display::fmt(e, f),
            ProcessorError::Cluster(e) => std::fmt::Display::fmt(e, f),
            ProcessorError::Config(e) => std::fmt::Display::fmt(e, f),
            ProcessorError::Downstream(e) => write!(f, "downstream consumer failed: {}", e),
            ProcessorError::Internal(e) => std::fmt::Display::fmt(e, f),
            ProcessorError::Io(e) => std::fmt::Display::fmt(e, f),
        }
    }
}

impl Error for ProcessorError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            ProcessorError::Cluster(e) => Some(e),
            ProcessorError::Config(e) => Some(e),
            ProcessorError::Io(e) => Some(e),
            _ => None,
        }
    }
}
