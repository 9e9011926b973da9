// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use crate::config::Config;
use crate::ewma::EwmaEstimator;
use crate::processor::error::{BuilderErrorKind, ProcessorError};
use crate::processor::{ProcessorWorkers, SpanProcessor, TraceConsumer};
use crate::trace_buffer::TraceBuffer;
use std::sync::{Arc, Mutex};

/// Builder for [`SpanProcessor`].
///
/// The configuration is validated at `build`; a downstream consumer is
/// mandatory.
#[derive(Default)]
pub struct SpanProcessorBuilder {
    config: Config,
    downstream: Option<Arc<dyn TraceConsumer>>,
}

impl SpanProcessorBuilder {
    pub fn new() -> Self {
        Self {
            config: Config::default(),
            downstream: None,
        }
    }

    /// Set the processor configuration.
    pub fn set_config(&mut self, config: Config) -> &mut Self {
        self.config = config;
        self
    }

    /// Set the consumer receiving the pruned and promoted batches.
    pub fn set_downstream(&mut self, downstream: Arc<dyn TraceConsumer>) -> &mut Self {
        self.downstream = Some(downstream);
        self
    }

    /// Validate the configuration and assemble the processor. The gossip
    /// layer and background workers stay down until `start`.
    pub fn build(&mut self) -> Result<SpanProcessor, ProcessorError> {
        self.config.validate()?;
        let downstream = self
            .downstream
            .take()
            .ok_or(ProcessorError::Builder(BuilderErrorKind::MissingDownstream))?;

        Ok(SpanProcessor {
            estimator: Arc::new(EwmaEstimator::new(&self.config)),
            buffer: Arc::new(Mutex::new(TraceBuffer::new(
                self.config.buffer_capacity,
                self.config.buffer_ttl,
            ))),
            downstream,
            config: self.config.clone(),
            runtime: Mutex::new(None),
            cluster: Mutex::new(None),
            workers: Mutex::new(ProcessorWorkers::default()),
        })
    }
}

impl std::fmt::Debug for SpanProcessorBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SpanProcessorBuilder")
            .field("config", &self.config)
            .field("has_downstream", &self.downstream.is_some())
            .finish()
    }
}
