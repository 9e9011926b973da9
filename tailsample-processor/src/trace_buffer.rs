// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Time- and capacity-bounded retention of not-yet-decided spans, keyed by
//! trace identifier.

use std::collections::HashMap;
use std::time::{Duration, Instant};
use tailsample_trace::{Resource, Span, TraceId};
use tracing::{debug, warn};

/// One buffered trace: its spans in arrival order (with the resource each
/// span arrived under), the retention deadline, and the anomaly flag.
#[derive(Debug)]
struct TraceBucket {
    spans: Vec<(Resource, Span)>,
    expires_at: Instant,
    anomalous: bool,
}

/// What `add_span` did with the span.
#[derive(Debug)]
pub enum AddOutcome {
    /// The span was appended to its trace's bucket.
    Buffered,
    /// The trace was already flagged anomalous by a peer before any of its
    /// spans arrived here; the span is handed back for immediate
    /// forwarding instead of being buffered.
    Promoted(Resource, Span),
}

/// What `mark_trace` found.
#[derive(Debug, PartialEq)]
pub enum MarkOutcome {
    /// A buffered bucket was flagged.
    Marked,
    /// No bucket existed; a tombstone now promotes later arrivals. Not an
    /// error: the trace may have been evicted or never buffered here.
    Tombstoned,
}

/// Buffer of recently seen normal spans, bounded by a trace capacity and a
/// per-trace ttl.
///
/// Buckets flagged anomalous are exempt from both bounds: they survive the
/// expiry sweep and are skipped by capacity eviction until they are drained.
/// All operations take `&mut self`; callers serialize access behind one
/// mutex, which the per-span insertion workload tolerates.
#[derive(Debug)]
pub struct TraceBuffer {
    buckets: HashMap<TraceId, TraceBucket>,
    /// Traces flagged by a peer before any local span arrived, with the
    /// instant the marker lapses.
    tombstones: HashMap<TraceId, Instant>,
    capacity: usize,
    ttl: Duration,
}

impl TraceBuffer {
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        Self {
            buckets: HashMap::new(),
            tombstones: HashMap::new(),
            capacity,
            ttl,
        }
    }

    /// Append a span to its trace's bucket, refreshing the bucket's
    /// retention deadline.
    ///
    /// Inserting a new trace past capacity evicts the bucket with the
    /// earliest deadline among non-anomalous buckets. When every bucket is
    /// anomalous nothing is evicted and the buffer temporarily exceeds its
    /// capacity; gossip-driven draining bounds the growth.
    pub fn add_span(&mut self, resource: Resource, span: Span, now: Instant) -> AddOutcome {
        let trace_id = span.trace_id;
        if self
            .tombstones
            .get(&trace_id)
            .is_some_and(|lapse| *lapse > now)
        {
            debug!(trace_id = %trace_id, "releasing span of tombstoned trace");
            return AddOutcome::Promoted(resource, span);
        }

        let bucket = self.buckets.entry(trace_id).or_insert_with(|| TraceBucket {
            spans: Vec::new(),
            expires_at: now + self.ttl,
            anomalous: false,
        });
        bucket.spans.push((resource, span));
        bucket.expires_at = now + self.ttl;

        while self.buckets.len() > self.capacity {
            // The bucket just inserted is not a candidate; pressure falls on
            // the rest of the population.
            let evictable = self
                .buckets
                .iter()
                .filter(|(id, bucket)| !bucket.anomalous && **id != trace_id)
                .min_by_key(|(_, bucket)| bucket.expires_at)
                .map(|(id, _)| *id);
            match evictable {
                Some(id) => {
                    debug!(trace_id = %id, "evicting trace on capacity pressure");
                    self.buckets.remove(&id);
                }
                None => {
                    warn!(
                        buckets = self.buckets.len(),
                        capacity = self.capacity,
                        "buffer over capacity with only anomalous traces, skipping eviction"
                    );
                    break;
                }
            }
        }
        AddOutcome::Buffered
    }

    /// Buffered spans of a trace in arrival order; empty when the trace is
    /// unknown. Non-destructive.
    pub fn get_spans(&self, trace_id: &TraceId) -> Vec<Span> {
        self.buckets
            .get(trace_id)
            .map(|bucket| bucket.spans.iter().map(|(_, span)| span.clone()).collect())
            .unwrap_or_default()
    }

    /// Set the anomaly flag of a trace's bucket. Idempotent.
    ///
    /// Marking an unknown trace records a tombstone so spans arriving after
    /// the mark are released at insertion time.
    pub fn mark_trace(&mut self, trace_id: TraceId, anomalous: bool, now: Instant) -> MarkOutcome {
        if let Some(bucket) = self.buckets.get_mut(&trace_id) {
            bucket.anomalous = anomalous;
            return MarkOutcome::Marked;
        }
        if anomalous {
            debug!(trace_id = %trace_id, "mark for unknown trace, recording tombstone");
            self.tombstones.insert(trace_id, now + self.ttl);
        } else {
            self.tombstones.remove(&trace_id);
        }
        MarkOutcome::Tombstoned
    }

    /// Remove and return every bucket flagged anomalous.
    pub fn drain_marked(&mut self) -> Vec<(TraceId, Vec<(Resource, Span)>)> {
        let marked: Vec<TraceId> = self
            .buckets
            .iter()
            .filter(|(_, bucket)| bucket.anomalous)
            .map(|(id, _)| *id)
            .collect();
        marked
            .into_iter()
            .filter_map(|id| self.buckets.remove(&id).map(|bucket| (id, bucket.spans)))
            .collect()
    }

    /// Drop buckets and tombstones whose deadline has passed. Anomalous
    /// buckets are kept regardless; they leave the buffer only through
    /// `drain_marked`.
    pub fn discard_expired(&mut self, now: Instant) {
        let before = self.buckets.len();
        self.buckets
            .retain(|_, bucket| bucket.anomalous || bucket.expires_at > now);
        self.tombstones.retain(|_, lapse| *lapse > now);
        let discarded = before - self.buckets.len();
        if discarded > 0 {
            debug!(discarded, remaining = self.buckets.len(), "expired traces discarded");
        }
    }

    /// Number of buffered traces.
    pub fn len(&self) -> usize {
        self.buckets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buckets.is_empty()
    }
}
