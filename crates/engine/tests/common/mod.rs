//! In-process cluster harness.
//!
//! Wires N replicas with in-memory storage, keyed crypto, and in-memory
//! pools, then routes every action deterministically: broadcasts and
//! unicasts become inbox events, executions apply to a simulated ledger,
//! and timers are recorded so tests fire them explicitly.

use rbft_core::{
    Action, CryptoService, EpochService, Event, FilterEvent, KeyedCrypto, MemoryStorage, Storage,
    TimerId,
};
use rbft_engine::{EngineConfig, Replica};
use rbft_mempool::{MemPool, MemPoolConfig};
use rbft_messages::{ConsensusMessage, Envelope, QuorumCheckpoint, TraceContext};
use rbft_types::{
    ConsensusParams, Digest, Epoch, EpochInfo, Hash, Height, KeyPair, MetaState, PublicKey,
    ReplicaId, RequestSet, ServiceState, Transaction, ValidatorInfo,
};
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::{Arc, RwLock};

use borsh::{BorshDeserialize, BorshSerialize};

/// A trivially orderable transaction.
#[derive(Debug, Clone, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct TestTx(pub u64);

impl Transaction for TestTx {
    fn tx_hash(&self) -> Hash {
        Hash::digest(&self.0.to_le_bytes())
    }
}

/// Shared mutable epoch state, playing the ledger's role.
#[derive(Debug)]
pub struct EpochState {
    pub current: EpochInfo,
    pub config_blocks: HashSet<Height>,
    pub sealed: BTreeMap<Epoch, QuorumCheckpoint>,
}

/// Test epoch service backed by [`EpochState`].
pub struct StaticEpochService {
    pub state: Arc<RwLock<EpochState>>,
}

impl EpochService for StaticEpochService {
    fn reconfiguration(&self) -> EpochInfo {
        self.state.read().unwrap().current.clone()
    }

    fn current_epoch_info(&self) -> EpochInfo {
        self.state.read().unwrap().current.clone()
    }

    fn epoch_info(&self, epoch: Epoch) -> Option<EpochInfo> {
        let state = self.state.read().unwrap();
        (state.current.epoch == epoch).then(|| state.current.clone())
    }

    fn is_config_block(&self, height: Height) -> bool {
        self.state.read().unwrap().config_blocks.contains(&height)
    }

    fn checkpoint_of_epoch(&self, epoch: Epoch) -> Option<QuorumCheckpoint> {
        self.state.read().unwrap().sealed.get(&epoch).cloned()
    }
}

/// One executed block as seen by the simulated executor.
#[derive(Debug, Clone)]
pub struct ExecutedBlock {
    pub seq_no: u64,
    pub txs: Vec<TestTx>,
    pub local_flags: Vec<bool>,
    pub timestamp: i64,
    pub proposer_account: String,
}

/// A state-update request captured from the engine.
#[derive(Debug, Clone)]
pub struct StateUpdateRequest {
    pub target: MetaState,
}

type TestReplica = Replica<TestTx, MemPool<TestTx>>;

pub struct Cluster {
    pub replicas: Vec<TestReplica>,
    pub storages: Vec<Arc<MemoryStorage>>,
    pub keys: Vec<KeyPair>,
    pub epoch_state: Arc<RwLock<EpochState>>,
    pub epoch_info: EpochInfo,
    /// Executed blocks per replica.
    pub executed: Vec<Vec<ExecutedBlock>>,
    /// Simulated ledger position per replica: (height, digest).
    pub chain_state: Vec<(Height, Hash)>,
    /// Armed timers per replica.
    pub armed: Vec<HashMap<TimerId, Event<TestTx>>>,
    /// Every digest the simulated ledger produced, per replica.
    pub digests: Vec<HashMap<Height, Hash>>,
    /// Filter events per replica.
    pub filter_events: Vec<Vec<&'static str>>,
    /// Captured state-update requests per replica.
    pub state_updates: Vec<Vec<StateUpdateRequest>>,
    /// Fatal-stop reasons per replica.
    pub stopped: Vec<Option<String>>,
    /// Message type names observed in flight.
    pub message_log: Vec<(ReplicaId, String)>,
    inbox: VecDeque<(usize, Event<TestTx>)>,
    now_ns: i64,
}

pub fn epoch_with(n: u64, params: ConsensusParams) -> EpochInfo {
    EpochInfo {
        epoch: 1,
        start_block: 1,
        epoch_period: 100_000,
        validator_set: (1..=n)
            .map(|i| ValidatorInfo {
                id: ReplicaId(i),
                hostname: format!("node{i}"),
                account_address: format!("0x{i:02x}"),
            })
            .collect(),
        consensus_params: params,
    }
}

impl Cluster {
    /// Build an N-replica cluster with single-transaction batches.
    pub fn new(n: u64) -> Cluster {
        Cluster::with_params(n, ConsensusParams::default())
    }

    pub fn with_params(n: u64, params: ConsensusParams) -> Cluster {
        let epoch_info = epoch_with(n, params);
        let keys: Vec<KeyPair> = (0..n)
            .map(|i| {
                let mut seed = [0u8; 32];
                seed[0] = (i + 1) as u8;
                KeyPair::from_seed(seed)
            })
            .collect();
        let public_keys: BTreeMap<ReplicaId, PublicKey> = keys
            .iter()
            .enumerate()
            .map(|(i, kp)| (ReplicaId(i as u64 + 1), kp.public_key()))
            .collect();

        let epoch_state = Arc::new(RwLock::new(EpochState {
            current: epoch_info.clone(),
            config_blocks: HashSet::new(),
            sealed: BTreeMap::new(),
        }));

        let mut replicas = Vec::new();
        let mut storages = Vec::new();
        for i in 0..n {
            let id = ReplicaId(i + 1);
            let storage = Arc::new(MemoryStorage::new());
            storages.push(storage.clone());
            replicas.push(build_replica(
                id,
                &epoch_info,
                &keys[i as usize],
                &public_keys,
                storage,
                epoch_state.clone(),
            ));
        }

        Cluster {
            executed: vec![Vec::new(); n as usize],
            chain_state: vec![(0, Hash::ZERO); n as usize],
            armed: vec![HashMap::new(); n as usize],
            digests: vec![HashMap::new(); n as usize],
            filter_events: vec![Vec::new(); n as usize],
            state_updates: vec![Vec::new(); n as usize],
            stopped: vec![None; n as usize],
            message_log: Vec::new(),
            inbox: VecDeque::new(),
            now_ns: 1_000_000_000,
            replicas,
            storages,
            keys,
            epoch_state,
            epoch_info,
        }
    }

    /// Start every replica and run the recovery handshake to quiescence.
    pub fn start(&mut self) {
        for i in 0..self.replicas.len() {
            self.tick();
            self.replicas[i].set_time(self.now_ns);
            let actions = self.replicas[i].start();
            self.dispatch(i, actions);
        }
        self.run();
    }

    fn tick(&mut self) {
        self.now_ns += 1_000_000;
    }

    /// Submit a transaction set to one replica.
    pub fn submit(&mut self, to: usize, txs: Vec<TestTx>, local: bool) {
        self.inbox.push_back((
            to,
            Event::RequestSet(RequestSet {
                requests: txs,
                local,
            }),
        ));
        self.run();
    }

    /// Inject a raw consensus message as if `from` had sent it.
    pub fn inject(&mut self, to: usize, from: ReplicaId, epoch: Epoch, msg: ConsensusMessage) {
        self.inbox.push_back((
            to,
            Event::ConsensusMessage(Box::new(Envelope {
                epoch,
                from,
                trace: TraceContext::default(),
                msg,
            })),
        ));
        self.run();
    }

    /// Fire an armed timer on one replica, if armed.
    pub fn fire_timer(&mut self, on: usize, id: TimerId) -> bool {
        let Some(event) = self.armed[on].remove(&id) else {
            return false;
        };
        self.inbox.push_back((on, event));
        self.run();
        true
    }

    /// Deliver queued events until the cluster is quiet.
    pub fn run(&mut self) {
        let mut steps = 0;
        while let Some((to, event)) = self.inbox.pop_front() {
            steps += 1;
            assert!(steps < 100_000, "cluster did not quiesce");
            if self.stopped[to].is_some() {
                continue;
            }
            self.tick();
            self.replicas[to].set_time(self.now_ns);
            let actions = self.replicas[to].process(event);
            self.dispatch(to, actions);
        }
    }

    fn dispatch(&mut self, from: usize, actions: Vec<Action<TestTx>>) {
        for action in actions {
            match action {
                Action::Broadcast { envelope } => {
                    self.message_log
                        .push((envelope.from, envelope.msg.type_name().to_string()));
                    for to in 0..self.replicas.len() {
                        if to != from {
                            self.inbox
                                .push_back((to, Event::ConsensusMessage(envelope.clone())));
                        }
                    }
                }
                Action::Unicast { envelope, to } => {
                    self.message_log
                        .push((envelope.from, envelope.msg.type_name().to_string()));
                    let target = (to.0 - 1) as usize;
                    if target != from && target < self.replicas.len() {
                        self.inbox
                            .push_back((target, Event::ConsensusMessage(envelope)));
                    }
                }
                Action::UnicastByHostname { envelope, hostname } => {
                    self.message_log
                        .push((envelope.from, envelope.msg.type_name().to_string()));
                    if let Some(target) = self
                        .epoch_info
                        .validator_set
                        .iter()
                        .position(|v| v.hostname == hostname)
                    {
                        if target != from {
                            self.inbox
                                .push_back((target, Event::ConsensusMessage(envelope)));
                        }
                    }
                }
                Action::StartTimer { id, event, .. } => {
                    self.armed[from].insert(id, *event);
                }
                Action::StopTimer { id } => {
                    self.armed[from].remove(&id);
                }
                Action::Execute {
                    txs,
                    local_flags,
                    seq_no,
                    timestamp,
                    proposer_account,
                } => {
                    self.apply_execution(
                        from,
                        ExecutedBlock {
                            seq_no,
                            txs,
                            local_flags,
                            timestamp,
                            proposer_account,
                        },
                    );
                }
                Action::StateUpdate { target, .. } => {
                    self.state_updates[from].push(StateUpdateRequest { target });
                }
                Action::SendFilterEvent { event } => {
                    let name = match event {
                        FilterEvent::StableCheckpoint(_) => "StableCheckpoint",
                        FilterEvent::FinishConfigChange(_) => "FinishConfigChange",
                        FilterEvent::FinishRecovery(_) => "FinishRecovery",
                        FilterEvent::FinishViewChange(_) => "FinishViewChange",
                        FilterEvent::FinishStateUpdate(_) => "FinishStateUpdate",
                    };
                    self.filter_events[from].push(name);
                }
                Action::EnqueueInternal { event } => {
                    self.inbox.push_back((from, *event));
                }
                Action::StopNamespace { reason } => {
                    self.stopped[from] = Some(reason);
                }
            }
        }
    }

    /// Apply an execution to the simulated ledger and report checkpoints.
    fn apply_execution(&mut self, on: usize, block: ExecutedBlock) {
        let (prev_height, prev_digest) = self.chain_state[on];
        assert_eq!(
            block.seq_no,
            prev_height + 1,
            "replica {} executed out of order",
            on + 1
        );
        let mut bytes = prev_digest.as_bytes().to_vec();
        bytes.extend_from_slice(&block.seq_no.to_le_bytes());
        for tx in &block.txs {
            bytes.extend_from_slice(tx.tx_hash().as_bytes());
        }
        let digest = Hash::digest(&bytes);
        self.chain_state[on] = (block.seq_no, digest);
        self.digests[on].insert(block.seq_no, digest);
        let seq_no = block.seq_no;
        self.executed[on].push(block);

        let is_config = {
            let state = self.epoch_state.read().unwrap();
            state.config_blocks.contains(&seq_no)
        };
        if is_config {
            // The ledger applies the configuration and opens the next epoch.
            let mut state = self.epoch_state.write().unwrap();
            if state.current.start_block <= seq_no {
                state.current.epoch += 1;
                state.current.start_block = seq_no + 1;
            }
        }

        let k = self.epoch_info.consensus_params.checkpoint_period;
        if is_config || (k > 0 && seq_no % k == 0) {
            let epoch = self.epoch_state.read().unwrap().current.epoch;
            self.inbox.push_back((
                on,
                Event::CheckpointBlockExecuted(ServiceState {
                    meta_state: MetaState {
                        height: seq_no,
                        digest,
                    },
                    batch_digest: Digest::EMPTY,
                    epoch,
                }),
            ));
        }
    }

    /// Complete a pending state transfer on one replica: jump the ledger to
    /// the target and report back.
    pub fn complete_state_update(&mut self, on: usize) {
        let Some(req) = self.state_updates[on].pop() else {
            panic!("no state update pending on replica {}", on + 1);
        };
        self.chain_state[on] = (req.target.height, req.target.digest);
        let epoch = self.epoch_state.read().unwrap().current.epoch;
        self.inbox.push_back((
            on,
            Event::StateUpdated(ServiceState {
                meta_state: req.target,
                batch_digest: Digest::EMPTY,
                epoch,
            }),
        ));
        self.run();
    }

    /// Sign a checkpoint body with a replica's key, for crafted messages.
    pub fn sign_checkpoint(
        &self,
        author: usize,
        checkpoint: &rbft_messages::Checkpoint,
    ) -> rbft_messages::SignedCheckpoint {
        rbft_messages::SignedCheckpoint {
            author: ReplicaId(author as u64 + 1),
            checkpoint: checkpoint.clone(),
            signature: self.keys[author].sign(checkpoint.hash().as_bytes()),
        }
    }

    /// Count logged messages of one type.
    pub fn count_messages(&self, type_name: &str) -> usize {
        self.message_log
            .iter()
            .filter(|(_, name)| name == type_name)
            .count()
    }

    /// Rebuild one replica from its persisted storage, as after a restart.
    /// The simulated ledger rolls back to the replica's stable checkpoint.
    pub fn restart_replica(&mut self, on: usize) {
        let id = ReplicaId(on as u64 + 1);
        let public_keys: BTreeMap<ReplicaId, PublicKey> = self
            .keys
            .iter()
            .enumerate()
            .map(|(i, kp)| (ReplicaId(i as u64 + 1), kp.public_key()))
            .collect();
        let replica = build_replica(
            id,
            &self.epoch_info,
            &self.keys[on],
            &public_keys,
            self.storages[on].clone(),
            self.epoch_state.clone(),
        );
        let h = replica.status().h;
        let digest = self
            .digests[on]
            .get(&h)
            .copied()
            .unwrap_or(Hash::ZERO);
        self.chain_state[on] = (h, digest);
        self.replicas[on] = replica;
        self.armed[on].clear();
    }

    /// Start one replica after the cluster is already running.
    pub fn start_replica(&mut self, on: usize) {
        self.tick();
        self.replicas[on].set_time(self.now_ns);
        let actions = self.replicas[on].start();
        self.dispatch(on, actions);
        self.run();
    }
}

fn build_replica(
    id: ReplicaId,
    epoch_info: &EpochInfo,
    keypair: &KeyPair,
    public_keys: &BTreeMap<ReplicaId, PublicKey>,
    storage: Arc<MemoryStorage>,
    epoch_state: Arc<RwLock<EpochState>>,
) -> TestReplica {
    let config = EngineConfig::new(id, epoch_info.clone());
    let pool = MemPool::new(MemPoolConfig {
        batch_size: 1,
        pool_size: 10_000,
        tolerance_ns: 60_000_000_000,
        tolerance_remove_ns: 600_000_000_000,
    });
    let crypto: Arc<dyn CryptoService> =
        Arc::new(KeyedCrypto::new(keypair.clone(), public_keys.clone()));
    let epoch_service: Arc<dyn EpochService> = Arc::new(StaticEpochService { state: epoch_state });
    let storage: Arc<dyn Storage> = storage;
    Replica::new(config, pool, storage, crypto, epoch_service)
}
