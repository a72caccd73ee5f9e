//! Network adapter surface.
//!
//! Delivery is best-effort; duplication and reordering across senders are
//! tolerated by the engine. Per-sender FIFO is expected from the transport.

use rbft_messages::Envelope;
use rbft_types::ReplicaId;
use std::collections::HashMap;
use std::sync::Mutex;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Outbound transport used by the runner.
pub trait Network: Send + Sync {
    /// Send to every peer.
    fn broadcast(&self, envelope: &Envelope);

    /// Send to one replica.
    fn unicast(&self, envelope: &Envelope, to: ReplicaId);

    /// Send to a replica addressed by hostname.
    fn unicast_by_hostname(&self, envelope: &Envelope, hostname: &str);
}

/// In-process transport connecting runners through channels. Used by tests
/// and single-process clusters.
pub struct LoopbackNetwork {
    self_id: ReplicaId,
    peers: Mutex<HashMap<ReplicaId, (String, mpsc::UnboundedSender<Envelope>)>>,
}

impl LoopbackNetwork {
    /// A transport for `self_id` with no peers yet.
    pub fn new(self_id: ReplicaId) -> LoopbackNetwork {
        LoopbackNetwork {
            self_id,
            peers: Mutex::new(HashMap::new()),
        }
    }

    /// Connect a peer's inbound channel.
    pub fn connect(&self, id: ReplicaId, hostname: String, tx: mpsc::UnboundedSender<Envelope>) {
        self.peers.lock().expect("peers lock").insert(id, (hostname, tx));
    }

    fn send(&self, envelope: &Envelope, id: ReplicaId) {
        let peers = self.peers.lock().expect("peers lock");
        match peers.get(&id) {
            Some((_, tx)) => {
                if tx.send(envelope.clone()).is_err() {
                    debug!(to = %id, "peer channel closed");
                }
            }
            None => warn!(to = %id, "no route to peer"),
        }
    }
}

impl Network for LoopbackNetwork {
    fn broadcast(&self, envelope: &Envelope) {
        let ids: Vec<ReplicaId> = {
            let peers = self.peers.lock().expect("peers lock");
            peers.keys().copied().collect()
        };
        for id in ids {
            if id != self.self_id {
                self.send(envelope, id);
            }
        }
    }

    fn unicast(&self, envelope: &Envelope, to: ReplicaId) {
        if to != self.self_id {
            self.send(envelope, to);
        }
    }

    fn unicast_by_hostname(&self, envelope: &Envelope, hostname: &str) {
        let id = {
            let peers = self.peers.lock().expect("peers lock");
            peers
                .iter()
                .find(|(_, (host, _))| host == hostname)
                .map(|(id, _)| *id)
        };
        match id {
            Some(id) => self.unicast(envelope, id),
            None => warn!(hostname, "no route to hostname"),
        }
    }
}
