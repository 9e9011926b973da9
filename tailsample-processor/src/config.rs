// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Processor configuration and validation.

use serde::Deserialize;
use std::fmt;
use std::net::{IpAddr, Ipv4Addr};
use std::time::Duration;

/// Default gossip port; bind and advertise ports are equal.
pub const DEFAULT_CLUSTER_PORT: u16 = 7947;

const DEFAULT_GROUPING_KEY: &str = "service.name";
const DEFAULT_ALPHA: f64 = 0.2;
const DEFAULT_THRESHOLD: f64 = 0.25;
const DEFAULT_BUFFER_CAPACITY: usize = 20;
const DEFAULT_BUFFER_TTL: Duration = Duration::from_secs(120);
const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// Configuration of the tail-sampling processor.
///
/// `grouping_keys`, `alpha` and `threshold` drive the anomaly judgement;
/// the buffer fields bound retention of not-yet-decided spans; `cluster`
/// configures the gossip layer.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Resource attribute keys whose values cluster spans into peer groups.
    pub grouping_keys: Vec<String>,
    /// EWMA smoothing factor in (0, 1].
    pub alpha: f64,
    /// Acceptance band half-width as a fraction of the average, in (0, 1).
    pub threshold: f64,
    /// Maximum number of traces retained in the buffer.
    pub buffer_capacity: usize,
    /// Retention of a buffered trace, refreshed on every insertion.
    pub buffer_ttl: Duration,
    /// Interval of the background expiry sweep.
    pub sweep_interval: Duration,
    pub cluster: ClusterConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            grouping_keys: vec![DEFAULT_GROUPING_KEY.to_owned()],
            alpha: DEFAULT_ALPHA,
            threshold: DEFAULT_THRESHOLD,
            buffer_capacity: DEFAULT_BUFFER_CAPACITY,
            buffer_ttl: DEFAULT_BUFFER_TTL,
            sweep_interval: DEFAULT_SWEEP_INTERVAL,
            cluster: ClusterConfig::default(),
        }
    }
}

/// Configuration of the gossip cluster layer.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct ClusterConfig {
    /// Cluster-local node identity. Defaults to the `HOSTNAME` environment
    /// variable, falling back to `localhost`.
    pub node_name: String,
    /// UDP/TCP port for gossip traffic. Bind and advertise ports are equal.
    pub port: u16,
    /// Local address the gossip sockets bind to.
    pub bind_ip: IpAddr,
    /// Address advertised to peers. Defaults to `bind_ip`, or loopback when
    /// binding to the unspecified address.
    pub advertise_ip: Option<IpAddr>,
    /// `host:port` addresses used for the rendezvous join. Empty means the
    /// node starts as a single-member cluster.
    pub seed_peers: Vec<String>,
    /// Interval between failure-detector probes.
    pub probe_interval: Duration,
    /// How long a probed peer has to answer before the probe counts as
    /// failed.
    pub probe_timeout: Duration,
    /// Interval between gossip transmissions of queued notifications.
    pub gossip_interval: Duration,
    /// Number of random peers addressed per gossip transmission.
    pub fanout: usize,
    /// Multiplier on the per-notification retransmission budget.
    pub retransmit_mult: u32,
    /// Consecutive failed probes after which a peer is removed.
    pub max_failed_probes: u32,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            node_name: tailsample_common::node_name(),
            port: DEFAULT_CLUSTER_PORT,
            bind_ip: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            advertise_ip: None,
            seed_peers: Vec::new(),
            probe_interval: Duration::from_secs(1),
            probe_timeout: Duration::from_millis(500),
            gossip_interval: Duration::from_millis(200),
            fanout: 3,
            retransmit_mult: 2,
            max_failed_probes: 3,
        }
    }
}

/// Rejected configuration values. Fatal at construction.
#[derive(Debug, PartialEq)]
pub enum ConfigError {
    EmptyGroupingKeys,
    AlphaOutOfRange(f64),
    ThresholdOutOfRange(f64),
    ZeroBufferCapacity,
    ZeroBufferTtl,
    EmptyNodeName,
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::EmptyGroupingKeys => write!(f, "grouping_keys must not be empty"),
            ConfigError::AlphaOutOfRange(alpha) => {
                write!(f, "alpha must be between 0 and 1, got {}", alpha)
            }
            ConfigError::ThresholdOutOfRange(threshold) => {
                write!(
                    f,
                    "threshold must be between 0 and 1 (e.g. 0.25 for 25% deviation), got {}",
                    threshold
                )
            }
            ConfigError::ZeroBufferCapacity => write!(f, "buffer_capacity must not be zero"),
            ConfigError::ZeroBufferTtl => write!(f, "buffer_ttl must not be zero"),
            ConfigError::EmptyNodeName => write!(f, "cluster.node_name must not be empty"),
        }
    }
}

impl std::error::Error for ConfigError {}

impl Config {
    /// Check the configuration for values the processor cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.grouping_keys.is_empty() {
            return Err(ConfigError::EmptyGroupingKeys);
        }
        if !(self.alpha > 0.0 && self.alpha <= 1.0) {
            return Err(ConfigError::AlphaOutOfRange(self.alpha));
        }
        if !(self.threshold > 0.0 && self.threshold < 1.0) {
            return Err(ConfigError::ThresholdOutOfRange(self.threshold));
        }
        if self.buffer_capacity == 0 {
            return Err(ConfigError::ZeroBufferCapacity);
        }
        if self.buffer_ttl.is_zero() {
            return Err(ConfigError::ZeroBufferTtl);
        }
        if self.cluster.node_name.is_empty() {
            return Err(ConfigError::EmptyNodeName);
        }
        Ok(())
    }
}
