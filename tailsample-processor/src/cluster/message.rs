// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Wire messages of the gossip layer.
//!
//! Only [`AnomalyNotification`] is contractual for the rest of the pipeline;
//! the surrounding envelope is internal to the coordinator and may change
//! between versions as long as peers run the same build.

use crate::cluster::member::Member;
use serde::{Deserialize, Serialize};
use tailsample_trace::{SpanId, TraceId};

/// Action carried by an anomaly notification.
///
/// Encoded as a bare integer on the wire. Values this build does not know
/// are preserved on decode and ignored by consumers, so newer peers can ship
/// new actions without breaking older ones.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "u8", into = "u8")]
pub enum AnomalyAction {
    None,
    Start,
    Stop,
    Unknown(u8),
}

impl From<u8> for AnomalyAction {
    fn from(value: u8) -> Self {
        match value {
            0 => AnomalyAction::None,
            1 => AnomalyAction::Start,
            2 => AnomalyAction::Stop,
            other => AnomalyAction::Unknown(other),
        }
    }
}

impl From<AnomalyAction> for u8 {
    fn from(action: AnomalyAction) -> Self {
        match action {
            AnomalyAction::None => 0,
            AnomalyAction::Start => 1,
            AnomalyAction::Stop => 2,
            AnomalyAction::Unknown(other) => other,
        }
    }
}

/// Anomaly finding broadcast to all peers so that every node holding sibling
/// spans of the trace preserves and releases them.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AnomalyNotification {
    pub action: AnomalyAction,
    pub trace_id: TraceId,
    pub span_id: SpanId,
    pub group_key: String,
}

impl AnomalyNotification {
    /// Notification announcing the start of an anomaly on a trace.
    pub fn start(trace_id: TraceId, span_id: SpanId, group_key: String) -> Self {
        Self {
            action: AnomalyAction::Start,
            trace_id,
            span_id,
            group_key,
        }
    }
}

/// Envelope for a single gossip datagram, and for the frames of the TCP
/// state sync.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub(crate) enum GossipMessage {
    /// Rendezvous join announcement sent to seed peers.
    Join { from: Member },
    /// Membership snapshot answering a join.
    JoinAck { members: Vec<Member> },
    /// Failure-detector probe.
    Ping { seq: u64, from: Member },
    Ack { seq: u64 },
    /// Graceful departure.
    Leave { node: String },
    /// Anomaly notification payload.
    Notify { payload: AnomalyNotification },
    /// Full membership exchange over TCP.
    StateSync { from: Member, members: Vec<Member> },
}

impl GossipMessage {
    pub(crate) fn encode(&self) -> serde_json::Result<Vec<u8>> {
        serde_json::to_vec(self)
    }

    pub(crate) fn decode(bytes: &[u8]) -> serde_json::Result<Self> {
        serde_json::from_slice(bytes)
    }
}
