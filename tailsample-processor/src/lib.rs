// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0
#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

//! Streaming tail-sampling processor for trace pipelines.
//!
//! The processor watches span latencies per peer group with an exponentially
//! weighted moving average, forwards only the spans that deviate from the
//! recent norm, and buffers the rest for a bounded time so that an anomaly
//! detected anywhere in the cluster can pull the sibling spans of the same
//! trace back out. Anomaly findings travel between processor instances over
//! a lossy gossip layer; receivers are idempotent by construction.

pub mod cluster;
pub mod config;
pub mod ewma;
pub mod processor;
pub mod trace_buffer;
mod worker_task;

pub use config::{ClusterConfig, Config};
pub use processor::{SpanProcessor, SpanProcessorBuilder, TraceConsumer};
