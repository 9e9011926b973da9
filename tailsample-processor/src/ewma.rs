// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Per-group latency estimator based on an exponentially weighted moving
//! average of span durations.

use crate::config::Config;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;
use tailsample_common::MutexExt;
use tailsample_trace::Resource;

/// Separator joining grouping-key values before hashing. Reserved; attribute
/// values containing it can alias groups, which the digest cannot undo.
const GROUP_KEY_SEPARATOR: char = '|';

/// Tracks one moving average of span duration per peer group and judges each
/// new duration against the group's acceptance band.
///
/// Entries are created on the first span of a group and never removed; the
/// number of distinct groups is assumed small. The map is guarded by a single
/// mutex, which the per-span workload tolerates.
#[derive(Debug)]
pub struct EwmaEstimator {
    /// Current average per group key, in milliseconds.
    averages: Mutex<HashMap<String, f64>>,
    alpha: f64,
    threshold: f64,
    grouping_keys: Vec<String>,
}

impl EwmaEstimator {
    /// Build an estimator from a validated configuration.
    pub fn new(config: &Config) -> Self {
        Self {
            averages: Mutex::new(HashMap::new()),
            alpha: config.alpha,
            threshold: config.threshold,
            grouping_keys: config.grouping_keys.clone(),
        }
    }

    /// Derive the peer-group key of a resource.
    ///
    /// The configured attribute keys are looked up in order, absent
    /// attributes contribute an empty string, and the joined values are
    /// digested so the key is stable, collision-resistant and independent of
    /// attribute insertion order.
    pub fn group_key_of(&self, resource: &Resource) -> String {
        let mut joined = String::new();
        for (i, key) in self.grouping_keys.iter().enumerate() {
            if i > 0 {
                joined.push(GROUP_KEY_SEPARATOR);
            }
            if let Some(value) = resource.attribute(key) {
                joined.push_str(value);
            }
        }
        format!("{:x}", Sha256::digest(joined.as_bytes()))
    }

    /// Fold `duration` into the group's average and report whether it fell
    /// outside the acceptance band.
    ///
    /// The band is computed from the average as it stood *before* this
    /// update, so a spike cannot widen the band enough to cover itself; the
    /// average is always updated afterwards so the estimator keeps tracking
    /// gradual drift. The first duration of a group seeds the average and is
    /// never judged anomalous.
    pub fn update_and_check(&self, group_key: &str, duration: Duration) -> bool {
        // Whole milliseconds, truncated; sub-millisecond jitter is noise at
        // the scales the band operates on.
        let duration_ms = duration.as_millis() as f64;

        let mut averages = self.averages.lock_or_panic();
        let Some(&current) = averages.get(group_key) else {
            averages.insert(group_key.to_owned(), duration_ms);
            return false;
        };

        let upper = current * (1.0 + self.threshold);
        let lower = current * (1.0 - self.threshold);

        let updated = self.alpha * duration_ms + (1.0 - self.alpha) * current;
        averages.insert(group_key.to_owned(), updated);

        duration_ms > upper || duration_ms < lower
    }

    /// Current average of a group in milliseconds, if the group has been
    /// seeded.
    pub fn average(&self, group_key: &str) -> Option<f64> {
        self.averages.lock_or_panic().get(group_key).copied()
    }
}
