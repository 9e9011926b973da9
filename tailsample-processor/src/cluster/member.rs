// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::SocketAddr;

/// One node of the gossip cluster as advertised to its peers.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Member {
    pub name: String,
    pub addr: SocketAddr,
}

#[derive(Debug)]
struct PeerState {
    member: Member,
    failed_probes: u32,
}

/// Membership table keyed by node name.
///
/// The local node is implicitly a member and never appears in the peer map;
/// transmissions iterate peers only, so nothing is ever addressed to self.
#[derive(Debug)]
pub(crate) struct Membership {
    local: Member,
    peers: HashMap<String, PeerState>,
}

impl Membership {
    pub(crate) fn new(local: Member) -> Self {
        Self {
            local,
            peers: HashMap::new(),
        }
    }

    pub(crate) fn local(&self) -> &Member {
        &self.local
    }

    /// Insert or refresh a peer. Returns true when the peer was not known
    /// before. The local node's own name is ignored.
    pub(crate) fn upsert(&mut self, member: Member) -> bool {
        if member.name == self.local.name {
            return false;
        }
        match self.peers.insert(
            member.name.clone(),
            PeerState {
                member,
                failed_probes: 0,
            },
        ) {
            Some(_) => false,
            None => true,
        }
    }

    /// Merge a remote membership snapshot.
    pub(crate) fn merge(&mut self, members: impl IntoIterator<Item = Member>) -> usize {
        members
            .into_iter()
            .filter(|member| self.upsert(member.clone()))
            .count()
    }

    pub(crate) fn remove(&mut self, name: &str) -> Option<Member> {
        self.peers.remove(name).map(|state| state.member)
    }

    /// Every member, local node included. This is what state sync exchanges.
    pub(crate) fn snapshot(&self) -> Vec<Member> {
        std::iter::once(self.local.clone())
            .chain(self.peers.values().map(|state| state.member.clone()))
            .collect()
    }

    pub(crate) fn peers(&self) -> Vec<Member> {
        self.peers.values().map(|state| state.member.clone()).collect()
    }

    /// Up to `n` distinct random peers.
    pub(crate) fn sample_peers(&self, n: usize) -> Vec<Member> {
        let mut peers = self.peers();
        peers.shuffle(&mut rand::thread_rng());
        peers.truncate(n);
        peers
    }

    /// Cluster size including the local node.
    pub(crate) fn len(&self) -> usize {
        self.peers.len() + 1
    }

    pub(crate) fn record_probe_failure(&mut self, name: &str) -> u32 {
        match self.peers.get_mut(name) {
            Some(state) => {
                state.failed_probes += 1;
                state.failed_probes
            }
            None => 0,
        }
    }

    pub(crate) fn record_probe_success(&mut self, name: &str) {
        if let Some(state) = self.peers.get_mut(name) {
            state.failed_probes = 0;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn member(name: &str, port: u16) -> Member {
        Member {
            name: name.to_owned(),
            addr: SocketAddr::from(([127, 0, 0, 1], port)),
        }
    }

    #[test]
    fn test_upsert_ignores_self() {
        let mut membership = Membership::new(member("local", 7947));
        assert!(!membership.upsert(member("local", 7000)));
        assert_eq!(membership.len(), 1);
        assert!(membership.peers().is_empty());
    }

    #[test]
    fn test_upsert_refreshes_known_peer() {
        let mut membership = Membership::new(member("local", 7947));
        assert!(membership.upsert(member("peer", 7948)));
        // Same name, new address: refreshed, not duplicated.
        assert!(!membership.upsert(member("peer", 7949)));
        assert_eq!(membership.len(), 2);
        assert_eq!(membership.peers()[0].addr.port(), 7949);
    }

    #[test]
    fn test_merge_counts_new_peers() {
        let mut membership = Membership::new(member("local", 7947));
        let added = membership.merge(vec![
            member("local", 7947),
            member("a", 1),
            member("b", 2),
            member("a", 1),
        ]);
        assert_eq!(added, 2);
        assert_eq!(membership.len(), 3);
    }

    #[test]
    fn test_snapshot_includes_local() {
        let mut membership = Membership::new(member("local", 7947));
        membership.upsert(member("peer", 7948));
        let snapshot = membership.snapshot();
        assert_eq!(snapshot.len(), 2);
        assert!(snapshot.iter().any(|m| m.name == "local"));
    }

    #[test]
    fn test_sample_is_bounded_and_excludes_local() {
        let mut membership = Membership::new(member("local", 7947));
        for n in 0..10 {
            membership.upsert(member(&format!("peer-{}", n), 8000 + n));
        }
        let sample = membership.sample_peers(3);
        assert_eq!(sample.len(), 3);
        assert!(sample.iter().all(|m| m.name != "local"));
        assert!(membership.sample_peers(100).len() == 10);
    }

    #[test]
    fn test_probe_counters() {
        let mut membership = Membership::new(member("local", 7947));
        membership.upsert(member("peer", 7948));
        assert_eq!(membership.record_probe_failure("peer"), 1);
        assert_eq!(membership.record_probe_failure("peer"), 2);
        membership.record_probe_success("peer");
        assert_eq!(membership.record_probe_failure("peer"), 1);
        assert_eq!(membership.record_probe_failure("gone"), 0);
    }
}
