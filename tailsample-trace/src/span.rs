// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use crate::ids::{SpanId, TraceId};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// The entity a batch of spans was produced by, described as a flat set of
/// string attributes (e.g. `service.name`).
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Resource {
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub attributes: HashMap<String, String>,
}

impl Resource {
    pub fn new(attributes: HashMap<String, String>) -> Self {
        Self { attributes }
    }

    /// Look up a resource attribute by key.
    pub fn attribute(&self, key: &str) -> Option<&str> {
        self.attributes.get(key).map(String::as_str)
    }
}

/// The instrumentation library that produced a group of spans.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct InstrumentationScope {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub version: String,
}

/// A single span. The core reads identifiers, timestamps and the name; any
/// other fields ride along untouched.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Span {
    pub trace_id: TraceId,
    pub span_id: SpanId,
    #[serde(default, skip_serializing_if = "SpanId::is_zero")]
    pub parent_span_id: SpanId,
    pub name: String,
    pub start_unix_nano: u64,
    pub end_unix_nano: u64,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub attributes: HashMap<String, String>,
}

impl Span {
    /// Wall-clock duration of the span in nanoseconds.
    ///
    /// Timestamps are untrusted input; an end before the start yields zero
    /// rather than wrapping.
    pub fn duration_nanos(&self) -> u64 {
        self.end_unix_nano.saturating_sub(self.start_unix_nano)
    }
}
