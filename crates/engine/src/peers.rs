//! Peer routing table and outbound message assembly.

use rbft_core::Action;
use rbft_messages::{ConsensusMessage, Envelope, TraceContext};
use rbft_types::{Epoch, EpochInfo, ReplicaId, ValidatorInfo};
use std::collections::BTreeMap;

/// Maps replica ids to addressing identities and stamps outbound envelopes.
#[derive(Debug)]
pub struct PeerManager {
    /// This replica.
    pub self_id: ReplicaId,
    /// This replica's addressing identity.
    pub hostname: String,
    /// Routing table for the current epoch.
    pub nodes: BTreeMap<ReplicaId, ValidatorInfo>,
}

impl PeerManager {
    /// Build the routing table from an epoch's validator set.
    pub fn new(self_id: ReplicaId, epoch_info: &EpochInfo) -> PeerManager {
        let nodes: BTreeMap<ReplicaId, ValidatorInfo> = epoch_info
            .validator_set
            .iter()
            .map(|v| (v.id, v.clone()))
            .collect();
        let hostname = nodes
            .get(&self_id)
            .map(|v| v.hostname.clone())
            .unwrap_or_default();
        PeerManager {
            self_id,
            hostname,
            nodes,
        }
    }

    /// Rebuild the routing table after an epoch change.
    pub fn update_routing(&mut self, epoch_info: &EpochInfo) {
        self.nodes = epoch_info
            .validator_set
            .iter()
            .map(|v| (v.id, v.clone()))
            .collect();
        if let Some(v) = self.nodes.get(&self.self_id) {
            self.hostname = v.hostname.clone();
        }
    }

    /// Whether `id` is in the routing table.
    pub fn contains(&self, id: ReplicaId) -> bool {
        self.nodes.contains_key(&id)
    }

    /// Whether `hostname` belongs to a routed peer.
    pub fn contains_hostname(&self, hostname: &str) -> bool {
        self.nodes.values().any(|v| v.hostname == hostname)
    }

    /// Staking account of a replica, empty if unknown.
    pub fn account_of(&self, id: ReplicaId) -> String {
        self.nodes
            .get(&id)
            .map(|v| v.account_address.clone())
            .unwrap_or_default()
    }

    fn envelope(&self, epoch: Epoch, msg: ConsensusMessage) -> Box<Envelope> {
        Box::new(Envelope {
            epoch,
            from: self.self_id,
            trace: TraceContext::from_current(),
            msg,
        })
    }

    /// Broadcast `msg` to every peer.
    pub fn broadcast<T>(&self, epoch: Epoch, msg: ConsensusMessage) -> Action<T> {
        Action::Broadcast {
            envelope: self.envelope(epoch, msg),
        }
    }

    /// Send `msg` to one replica.
    pub fn unicast<T>(&self, epoch: Epoch, msg: ConsensusMessage, to: ReplicaId) -> Action<T> {
        Action::Unicast {
            envelope: self.envelope(epoch, msg),
            to,
        }
    }

    /// Send `msg` to a replica addressed by hostname.
    pub fn unicast_by_hostname<T>(
        &self,
        epoch: Epoch,
        msg: ConsensusMessage,
        hostname: String,
    ) -> Action<T> {
        Action::UnicastByHostname {
            envelope: self.envelope(epoch, msg),
            hostname,
        }
    }
}
