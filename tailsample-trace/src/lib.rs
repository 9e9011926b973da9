// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0
#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

//! Data model for trace batches flowing through the tail-sampling pipeline.
//!
//! Batches are organized the way the host pipeline delivers them: a batch
//! holds resource groups, each resource group holds scope groups, and scopes
//! hold the spans themselves.

mod batch;
mod ids;
mod span;

pub use batch::{ResourceSpans, ScopeSpans, TraceBatch};
pub use ids::{ParseIdError, SpanId, TraceId};
pub use span::{InstrumentationScope, Resource, Span};
