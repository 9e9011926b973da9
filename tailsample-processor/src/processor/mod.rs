// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! The span processor binding the estimator, the trace buffer and the
//! cluster coordinator into the pipeline's consume path.

pub mod builder;
pub mod error;

pub use builder::SpanProcessorBuilder;

use crate::cluster::{AnomalyAction, AnomalyNotification, ClusterCoordinator, Member};
use crate::config::Config;
use crate::ewma::EwmaEstimator;
use crate::processor::error::{InternalErrorKind, ProcessorError};
use crate::trace_buffer::{AddOutcome, TraceBuffer};
use crate::worker_task::WorkerTask;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tailsample_common::{worker::Worker, MutexExt};
use tailsample_trace::TraceBatch;
use tokio::runtime::Runtime;
use tokio::sync::mpsc;
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

/// Consumer of pruned and promoted batches; implemented by the host
/// pipeline's next stage.
pub trait TraceConsumer: Send + Sync {
    fn consume_traces(&self, batch: TraceBatch) -> anyhow::Result<()>;
}

/// What the processor does to the data passing through it.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Capabilities {
    pub mutates_data: bool,
}

#[derive(Default)]
pub(crate) struct ProcessorWorkers {
    notifications: Option<WorkerTask<NotificationWorker>>,
    sweeper: Option<WorkerTask<SweepWorker>>,
}

/// Tail-sampling span processor.
///
/// `consume` runs synchronously on the pipeline's dispatch threads and
/// decides, span by span, whether to forward (anomalous), buffer (normal) or
/// release early (trace already flagged by a peer). Two background workers,
/// the inbound notification loop and the expiry sweeper, run together with
/// the gossip coordinator on a processor-owned runtime between `start` and
/// `shutdown`.
pub struct SpanProcessor {
    pub(crate) config: Config,
    pub(crate) estimator: Arc<EwmaEstimator>,
    pub(crate) buffer: Arc<Mutex<TraceBuffer>>,
    pub(crate) downstream: Arc<dyn TraceConsumer>,
    pub(crate) runtime: Mutex<Option<Arc<Runtime>>>,
    pub(crate) cluster: Mutex<Option<Arc<ClusterCoordinator>>>,
    pub(crate) workers: Mutex<ProcessorWorkers>,
}

impl SpanProcessor {
    pub fn builder() -> SpanProcessorBuilder {
        SpanProcessorBuilder::new()
    }

    /// The processor removes spans from batches but never alters span data.
    pub fn capabilities(&self) -> Capabilities {
        Capabilities {
            mutates_data: false,
        }
    }

    /// Join the gossip cluster and spawn the background workers.
    pub fn start(&self) -> Result<(), ProcessorError> {
        let mut runtime_guard = self.runtime.lock_or_panic();
        if runtime_guard.is_some() {
            return Err(ProcessorError::Internal(InternalErrorKind::AlreadyStarted));
        }
        let runtime = Arc::new(
            tokio::runtime::Builder::new_multi_thread()
                .worker_threads(1)
                .enable_all()
                .build()?,
        );

        let cluster = Arc::new(
            runtime.block_on(ClusterCoordinator::start(self.config.cluster.clone()))?,
        );
        let inbound = cluster.inbound().ok_or_else(|| {
            ProcessorError::Internal(InternalErrorKind::InvalidWorkerState(
                "inbound notification stream already taken".to_owned(),
            ))
        })?;

        let mut notifications = WorkerTask::new(NotificationWorker {
            inbound,
            buffer: self.buffer.clone(),
            downstream: self.downstream.clone(),
        });
        let mut sweeper = WorkerTask::new(SweepWorker {
            buffer: self.buffer.clone(),
            interval: self.config.sweep_interval,
        });
        notifications.start(&runtime).map_err(|e| {
            ProcessorError::Internal(InternalErrorKind::InvalidWorkerState(e.to_string()))
        })?;
        sweeper.start(&runtime).map_err(|e| {
            ProcessorError::Internal(InternalErrorKind::InvalidWorkerState(e.to_string()))
        })?;

        let mut workers = self.workers.lock_or_panic();
        workers.notifications = Some(notifications);
        workers.sweeper = Some(sweeper);
        drop(workers);
        *self.cluster.lock_or_panic() = Some(cluster);
        *runtime_guard = Some(runtime);
        info!("span processor started");
        Ok(())
    }

    /// Stop the background workers, leave the cluster and release the
    /// runtime. Spans still buffered are dropped; no flush happens.
    ///
    /// Inflight `consume` calls run to completion; their broadcasts after
    /// this point are silently discarded with the coordinator.
    pub fn shutdown(&self) -> Result<(), ProcessorError> {
        let Some(runtime) = self.runtime.lock_or_panic().take() else {
            return Ok(());
        };
        let cluster = self.cluster.lock_or_panic().take();
        let (notifications, sweeper) = {
            let mut workers = self.workers.lock_or_panic();
            (workers.notifications.take(), workers.sweeper.take())
        };

        runtime.block_on(async {
            if let Some(mut worker) = notifications {
                if let Err(err) = worker.stop().await {
                    warn!(%err, "notification worker did not stop cleanly");
                }
            }
            if let Some(mut worker) = sweeper {
                if let Err(err) = worker.stop().await {
                    warn!(%err, "sweep worker did not stop cleanly");
                }
            }
            if let Some(cluster) = cluster.as_ref() {
                cluster.stop().await;
            }
        });
        drop(runtime);
        info!("span processor shut down");
        Ok(())
    }

    /// Classify every span of the batch, forward the pruned batch downstream
    /// and broadcast an anomaly notification per kept span.
    ///
    /// Spans are classified in encounter order. Normal spans are moved into
    /// the trace buffer as copies; the batch itself only ever shrinks.
    pub fn consume(&self, mut batch: TraceBatch) -> Result<(), ProcessorError> {
        let now = Instant::now();
        let cluster = self.cluster.lock_or_panic().clone();

        for rs in &mut batch.resource_spans {
            let group_key = self.estimator.group_key_of(&rs.resource);
            let resource = &rs.resource;
            for ss in &mut rs.scopes {
                ss.spans.retain(|span| {
                    let duration = Duration::from_nanos(span.duration_nanos());
                    let anomalous = self.estimator.update_and_check(&group_key, duration);
                    if anomalous {
                        debug!(
                            name = %span.name,
                            group_key = %group_key,
                            duration_ms = duration.as_millis() as u64,
                            "keeping anomalous span"
                        );
                        match cluster.as_ref() {
                            Some(cluster) => cluster.broadcast(AnomalyNotification::start(
                                span.trace_id,
                                span.span_id,
                                group_key.clone(),
                            )),
                            None => debug!("processor not started, skipping broadcast"),
                        }
                        return true;
                    }
                    let outcome = self.buffer.lock_or_panic().add_span(
                        resource.clone(),
                        span.clone(),
                        now,
                    );
                    match outcome {
                        AddOutcome::Buffered => {
                            debug!(
                                name = %span.name,
                                group_key = %group_key,
                                duration_ms = duration.as_millis() as u64,
                                "filtering normal span"
                            );
                            false
                        }
                        // The trace was flagged by a peer before this span
                        // arrived; it stays in the outbound batch.
                        AddOutcome::Promoted(..) => {
                            debug!(
                                name = %span.name,
                                trace_id = %span.trace_id,
                                "keeping span of peer-flagged trace"
                            );
                            true
                        }
                    }
                });
            }
            rs.scopes.retain(|ss| !ss.spans.is_empty());
        }
        batch.resource_spans.retain(|rs| !rs.scopes.is_empty());

        self.downstream
            .consume_traces(batch)
            .map_err(ProcessorError::Downstream)
    }

    /// The local cluster identity once started. The advertised port matters
    /// when the gossip layer was configured with port 0.
    pub fn local_member(&self) -> Option<Member> {
        self.cluster
            .lock_or_panic()
            .as_ref()
            .map(|cluster| cluster.local_member())
    }

    /// Number of traces currently buffered.
    pub fn buffered_traces(&self) -> usize {
        self.buffer.lock_or_panic().len()
    }
}

impl std::fmt::Debug for SpanProcessor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SpanProcessor")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

/// Consumes the coordinator's inbound notification stream: marks flagged
/// traces, drains the promoted buckets and forwards them downstream as a
/// synthesized batch.
struct NotificationWorker {
    inbound: mpsc::Receiver<AnomalyNotification>,
    buffer: Arc<Mutex<TraceBuffer>>,
    downstream: Arc<dyn TraceConsumer>,
}

impl Worker for NotificationWorker {
    async fn run(&mut self) {
        while let Some(notification) = self.inbound.recv().await {
            self.handle(notification);
        }
    }
}

impl NotificationWorker {
    fn handle(&self, notification: AnomalyNotification) {
        match notification.action {
            AnomalyAction::Start => {}
            other => {
                debug!(action = ?other, "ignoring notification action");
                return;
            }
        }

        let drained = {
            let mut buffer = self.buffer.lock_or_panic();
            let outcome = buffer.mark_trace(notification.trace_id, true, Instant::now());
            debug!(
                trace_id = %notification.trace_id,
                group_key = %notification.group_key,
                outcome = ?outcome,
                "peer flagged trace anomalous"
            );
            buffer.drain_marked()
        };
        if drained.is_empty() {
            return;
        }

        let mut batch = TraceBatch::new();
        let mut released = 0usize;
        for (_, spans) in drained {
            for (resource, span) in spans {
                released += 1;
                batch.push_span(resource, span);
            }
        }
        info!(released, "releasing buffered spans of peer-flagged traces");
        if let Err(err) = self.downstream.consume_traces(batch) {
            error!(%err, "failed to forward promoted spans downstream");
        }
    }
}

/// Periodically discards expired traces from the buffer.
struct SweepWorker {
    buffer: Arc<Mutex<TraceBuffer>>,
    interval: Duration,
}

impl Worker for SweepWorker {
    async fn run(&mut self) {
        loop {
            sleep(self.interval).await;
            self.buffer.lock_or_panic().discard_expired(Instant::now());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ClusterConfig;
    use std::collections::HashMap;
    use std::net::{IpAddr, Ipv4Addr};
    use tailsample_trace::{
        InstrumentationScope, Resource, ResourceSpans, ScopeSpans, Span, SpanId, TraceId,
    };

    /// Downstream consumer capturing every forwarded batch.
    #[derive(Default)]
    struct CapturingConsumer {
        batches: Mutex<Vec<TraceBatch>>,
    }

    impl TraceConsumer for CapturingConsumer {
        fn consume_traces(&self, batch: TraceBatch) -> anyhow::Result<()> {
            self.batches.lock_or_panic().push(batch);
            Ok(())
        }
    }

    impl CapturingConsumer {
        fn span_count(&self) -> usize {
            self.batches
                .lock_or_panic()
                .iter()
                .map(TraceBatch::span_count)
                .sum()
        }

        fn span_names(&self) -> Vec<String> {
            self.batches
                .lock_or_panic()
                .iter()
                .flat_map(|batch| batch.iter_spans().map(|(_, span)| span.name.clone()))
                .collect()
        }
    }

    fn test_config() -> Config {
        Config {
            cluster: ClusterConfig {
                node_name: "test-node".to_owned(),
                port: 0,
                bind_ip: IpAddr::V4(Ipv4Addr::LOCALHOST),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    fn test_processor() -> (SpanProcessor, Arc<CapturingConsumer>) {
        let consumer = Arc::new(CapturingConsumer::default());
        let processor = SpanProcessor::builder()
            .set_config(test_config())
            .set_downstream(consumer.clone())
            .build()
            .unwrap();
        (processor, consumer)
    }

    fn span_with_duration(trace: u8, name: &str, duration_ms: u64) -> Span {
        Span {
            trace_id: TraceId::from_bytes([trace; 16]),
            span_id: SpanId::from_bytes([trace, 0, 0, 0, 0, 0, 0, 1]),
            name: name.to_owned(),
            start_unix_nano: 1_000_000,
            end_unix_nano: 1_000_000 + duration_ms * 1_000_000,
            ..Default::default()
        }
    }

    fn batch_for_service(service: &str, spans: Vec<Span>) -> TraceBatch {
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

    fn pending_broadcasts(processor: &SpanProcessor) -> usize {
        processor
            .cluster
            .lock_or_panic()
            .as_ref()
            .map(|cluster| cluster.pending_broadcast_count())
            .unwrap_or(0)
    }

    #[test]
    fn test_baseline_batch_is_fully_buffered() {
        let (processor, consumer) = test_processor();
        processor.start().unwrap();

        let spans: Vec<Span> = [100u64, 110, 120, 105, 115]
            .iter()
            .enumerate()
            .map(|(i, duration)| span_with_duration(i as u8 + 1, "baseline", *duration))
            .collect();
        processor.consume(batch_for_service("A", spans)).unwrap();

        assert_eq!(consumer.span_count(), 0);
        assert_eq!(processor.buffered_traces(), 5);
        assert_eq!(pending_broadcasts(&processor), 0);

        processor.shutdown().unwrap();
    }

    #[test]
    fn test_spike_is_forwarded_and_broadcast() {
        let (processor, consumer) = test_processor();
        processor.start().unwrap();

        let baseline: Vec<Span> = [100u64, 110, 120, 105, 115]
            .iter()
            .enumerate()
            .map(|(i, duration)| span_with_duration(i as u8 + 1, "baseline", *duration))
            .collect();
        processor.consume(batch_for_service("A", baseline)).unwrap();

        let spike = span_with_duration(42, "spike", 300);
        processor
            .consume(batch_for_service("A", vec![spike]))
            .unwrap();

        assert_eq!(consumer.span_count(), 1);
        assert_eq!(consumer.span_names(), vec!["spike"]);
        // The anomalous span itself is never buffered.
        assert_eq!(processor.buffered_traces(), 5);
        assert_eq!(pending_broadcasts(&processor), 1);

        processor.shutdown().unwrap();
    }

    #[test]
    fn test_low_outlier_is_forwarded() {
        let (processor, consumer) = test_processor();
        processor.start().unwrap();

        let spans = vec![
            span_with_duration(1, "first", 100),
            span_with_duration(2, "second", 100),
            span_with_duration(3, "low", 40),
        ];
        processor.consume(batch_for_service("B", spans)).unwrap();

        assert_eq!(consumer.span_names(), vec!["low"]);
        assert_eq!(processor.buffered_traces(), 2);
        assert_eq!(pending_broadcasts(&processor), 1);

        processor.shutdown().unwrap();
    }

    #[test]
    fn test_forwarded_spans_are_unaltered() {
        let (processor, consumer) = test_processor();
        processor.start().unwrap();

        processor
            .consume(batch_for_service("C", vec![span_with_duration(1, "seed", 100)]))
            .unwrap();
        let spike = span_with_duration(9, "spike", 400);
        processor
            .consume(batch_for_service("C", vec![spike.clone()]))
            .unwrap();

        let batches = consumer.batches.lock_or_panic();
        let forwarded: Vec<&Span> = batches
            .iter()
            .flat_map(|batch| batch.iter_spans().map(|(_, span)| span))
            .collect();
        assert_eq!(forwarded, vec![&spike]);

        drop(batches);
        processor.shutdown().unwrap();
    }

    #[test]
    fn test_consume_works_before_start_without_broadcast() {
        let (processor, consumer) = test_processor();

        processor
            .consume(batch_for_service("D", vec![span_with_duration(1, "seed", 100)]))
            .unwrap();
        processor
            .consume(batch_for_service("D", vec![span_with_duration(2, "spike", 500)]))
            .unwrap();

        assert_eq!(consumer.span_names(), vec!["spike"]);
        assert_eq!(processor.buffered_traces(), 1);
    }

    #[test]
    fn test_start_twice_is_rejected() {
        let (processor, _consumer) = test_processor();
        processor.start().unwrap();
        assert!(matches!(
            processor.start(),
            Err(ProcessorError::Internal(InternalErrorKind::AlreadyStarted))
        ));
        processor.shutdown().unwrap();
        // A second shutdown is a no-op.
        processor.shutdown().unwrap();
    }

    #[test]
    fn test_capabilities_declare_no_mutation() {
        let (processor, _consumer) = test_processor();
        assert!(!processor.capabilities().mutates_data);
    }
}
