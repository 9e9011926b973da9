// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use crate::span::{InstrumentationScope, Resource, Span};
use serde::{Deserialize, Serialize};

/// Spans produced by one instrumentation scope.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ScopeSpans {
    #[serde(default)]
    pub scope: InstrumentationScope,
    pub spans: Vec<Span>,
}

/// All spans of a batch that share one resource.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourceSpans {
    pub resource: Resource,
    pub scopes: Vec<ScopeSpans>,
}

/// A batch of spans as delivered by the host pipeline: resource groups
/// containing scope groups containing spans.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct TraceBatch {
    pub resource_spans: Vec<ResourceSpans>,
}

impl TraceBatch {
    pub fn new() -> Self {
        Self::default()
    }

    /// Total number of spans across all resource and scope groups.
    pub fn span_count(&self) -> usize {
        self.resource_spans
            .iter()
            .flat_map(|rs| rs.scopes.iter())
            .map(|ss| ss.spans.len())
            .sum()
    }

    pub fn is_empty(&self) -> bool {
        self.span_count() == 0
    }

    /// Iterate over every span together with its resource.
    pub fn iter_spans(&self) -> impl Iterator<Item = (&Resource, &Span)> {
        self.resource_spans.iter().flat_map(|rs| {
            rs.scopes
                .iter()
                .flat_map(move |ss| ss.spans.iter().map(move |span| (&rs.resource, span)))
        })
    }

    /// Keep only the spans for which `keep` returns true, pruning scope and
    /// resource groups that end up empty.
    ///
    /// The predicate observes spans in encounter order and is the only way
    /// this type mutates a batch; span contents are never altered.
    pub fn retain_spans<F>(&mut self, mut keep: F)
    where
        F: FnMut(&Resource, &Span) -> bool,
    {
        for rs in &mut self.resource_spans {
            let resource = &rs.resource;
            for ss in &mut rs.scopes {
                ss.spans.retain(|span| keep(resource, span));
            }
            rs.scopes.retain(|ss| !ss.spans.is_empty());
        }
        self.resource_spans.retain(|rs| !rs.scopes.is_empty());
    }

    /// Append a span under its resource group, creating the group (with a
    /// default scope) when the resource has not been seen in this batch.
    ///
    /// Used when synthesizing batches out of buffered spans, where the
    /// original scope grouping is no longer available.
    pub fn push_span(&mut self, resource: Resource, span: Span) {
        if let Some(rs) = self
            .resource_spans
            .iter_mut()
            .find(|rs| rs.resource == resource)
        {
            // Synthesized resource groups always hold exactly one scope.
            if let Some(ss) = rs.scopes.first_mut() {
                ss.spans.push(span);
                return;
            }
        }
        self.resource_spans.push(ResourceSpans {
            resource,
            scopes: vec![ScopeSpans {
                scope: InstrumentationScope::default(),
                spans: vec![span],
            }],
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids::{SpanId, TraceId};
    use std::collections::HashMap;

    fn test_resource(service: &str) -> Resource {
        Resource::new(HashMap::from([(
            "service.name".to_owned(),
            service.to_owned(),
        )]))
    }

    fn test_span(name: &str) -> Span {
        Span {
            trace_id: TraceId::from_bytes([1; 16]),
            span_id: SpanId::from_bytes([2; 8]),
            name: name.to_owned(),
            ..Default::default()
        }
    }

    fn test_batch(service: &str, names: &[&str]) -> TraceBatch {
        TraceBatch {
            resource_spans: vec![ResourceSpans {
                resource: test_resource(service),
                scopes: vec![ScopeSpans {
                    scope: InstrumentationScope::default(),
                    spans: names.iter().map(|name| test_span(name)).collect(),
                }],
            }],
        }
    }

    #[test]
    fn test_span_count() {
        let batch = test_batch("a", &["s1", "s2", "s3"]);
        assert_eq!(batch.span_count(), 3);
        assert!(!batch.is_empty());
        assert!(TraceBatch::new().is_empty());
    }

    #[test]
    fn test_retain_prunes_empty_groups() {
        let mut batch = test_batch("a", &["keep", "drop"]);
        batch.retain_spans(|_, span| span.name == "keep");
        assert_eq!(batch.span_count(), 1);

        batch.retain_spans(|_, _| false);
        assert!(batch.resource_spans.is_empty());
    }

    #[test]
    fn test_retain_sees_resource() {
        let mut batch = test_batch("checkout", &["s1"]);
        let mut seen = Vec::new();
        batch.retain_spans(|resource, _| {
            seen.push(resource.attribute("service.name").unwrap().to_owned());
            true
        });
        assert_eq!(seen, vec!["checkout"]);
    }

    #[test]
    fn test_push_span_groups_by_resource() {
        let mut batch = TraceBatch::new();
        batch.push_span(test_resource("a"), test_span("s1"));
        batch.push_span(test_resource("b"), test_span("s2"));
        batch.push_span(test_resource("a"), test_span("s3"));

        assert_eq!(batch.resource_spans.len(), 2);
        assert_eq!(batch.resource_spans[0].scopes[0].spans.len(), 2);
        assert_eq!(batch.span_count(), 3);
    }
}
