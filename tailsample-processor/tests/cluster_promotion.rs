// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Cross-node promotion: an anomaly detected on one node releases the
//! sibling spans of the same trace buffered on another node.

use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tailsample_processor::{ClusterConfig, Config, SpanProcessor, TraceConsumer};
use tailsample_trace::{
    InstrumentationScope, Resource, ResourceSpans, ScopeSpans, Span, SpanId, TraceBatch, TraceId,
};

#[derive(Default)]
struct CapturingConsumer {
    batches: Mutex<Vec<TraceBatch>>,
}

impl TraceConsumer for CapturingConsumer {
    fn consume_traces(&self, batch: TraceBatch) -> anyhow::Result<()> {
        self.batches.lock().unwrap().push(batch);
        Ok(())
    }
}

impl CapturingConsumer {
    fn span_names(&self) -> Vec<String> {
        self.batches
            .lock()
            .unwrap()
            .iter()
            .flat_map(|batch| batch.iter_spans().map(|(_, span)| span.name.clone()))
            .collect()
    }
}

fn node_config(name: &str, seeds: Vec<String>) -> Config {
    Config {
        cluster: ClusterConfig {
            node_name: name.to_owned(),
            port: 0,
            bind_ip: IpAddr::V4(Ipv4Addr::LOCALHOST),
            seed_peers: seeds,
            gossip_interval: Duration::from_millis(50),
            ..Default::default()
        },
        ..Default::default()
    }
}

fn service_batch(service: &str, spans: Vec<Span>) -> TraceBatch {
    TraceBatch {
        resource_spans: vec![ResourceSpans {
            resource: Resource::new(HashMap::from([(
                "service.name".to_owned(),
                service.to_owned(),
            )])),
            scopes: vec![ScopeSpans {
                scope: InstrumentationScope::default(),
                spans,
            }],
        }],
    }
}

fn span_with_duration(trace_id: TraceId, name: &str, duration_ms: u64) -> Span {
    Span {
        trace_id,
        span_id: SpanId::from_bytes([1, 2, 3, 4, 5, 6, 7, 8]),
        name: name.to_owned(),
        start_unix_nano: 1_000_000,
        end_unix_nano: 1_000_000 + duration_ms * 1_000_000,
        ..Default::default()
    }
}

fn start_node(
    name: &str,
    seeds: Vec<String>,
) -> (SpanProcessor, Arc<CapturingConsumer>) {
    let consumer = Arc::new(CapturingConsumer::default());
    let processor = SpanProcessor::builder()
        .set_config(node_config(name, seeds))
        .set_downstream(consumer.clone())
        .build()
        .unwrap();
    processor.start().unwrap();
    (processor, consumer)
}

#[test]
fn test_anomaly_on_one_node_releases_buffered_siblings_on_another() {
    let (node_x, consumer_x) = start_node("node-x", vec![]);
    let seed = node_x.local_member().unwrap().addr.to_string();
    let (node_y, consumer_y) = start_node("node-y", vec![seed]);

    let trace_t = TraceId::from_bytes([0xaa; 16]);
    let trace_other = TraceId::from_bytes([0xbb; 16]);

    // Node X buffers a normal span of trace T.
    node_x
        .consume(service_batch(
            "A",
            vec![span_with_duration(trace_t, "sibling", 100)],
        ))
        .unwrap();
    assert_eq!(node_x.buffered_traces(), 1);
    assert!(consumer_x.span_names().is_empty());

    // Node Y sees a latency spike on trace T and broadcasts the finding.
    node_y
        .consume(service_batch(
            "A",
            vec![span_with_duration(trace_other, "baseline", 100)],
        ))
        .unwrap();
    node_y
        .consume(service_batch(
            "A",
            vec![span_with_duration(trace_t, "spike", 300)],
        ))
        .unwrap();
    assert_eq!(consumer_y.span_names(), vec!["spike"]);

    // Node X promotes the buffered sibling within one inbound cycle.
    let deadline = Instant::now() + Duration::from_secs(5);
    while consumer_x.span_names().is_empty() {
        assert!(
            Instant::now() < deadline,
            "buffered sibling span was not promoted in time"
        );
        std::thread::sleep(Duration::from_millis(20));
    }
    assert_eq!(consumer_x.span_names(), vec!["sibling"]);
    assert_eq!(node_x.buffered_traces(), 0);

    node_y.shutdown().unwrap();
    node_x.shutdown().unwrap();
}
