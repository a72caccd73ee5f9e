//! End-to-end: four runners over the loopback transport order and execute a
//! batch.

use borsh::{BorshDeserialize, BorshSerialize};
use rbft_core::{
    CryptoService, EpochService, FilterEvent, KeyedCrypto, MemoryStorage, Storage,
};
use rbft_engine::{EngineConfig, Replica};
use rbft_mempool::{MemPool, MemPoolConfig};
use rbft_messages::{QuorumCheckpoint, SignedCheckpoint};
use rbft_runtime::{ExecutionService, LoopbackNetwork, Runner, RunnerHandle};
use rbft_types::{
    ConsensusParams, EpochInfo, Hash, Height, KeyPair, MetaState, PublicKey, ReplicaId,
    Transaction, ValidatorInfo,
};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;

#[derive(Debug, Clone, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
struct TestTx(u64);

impl Transaction for TestTx {
    fn tx_hash(&self) -> Hash {
        Hash::digest(&self.0.to_le_bytes())
    }
}

/// Epoch service frozen at the genesis epoch.
struct FixedEpochService {
    info: EpochInfo,
}

impl EpochService for FixedEpochService {
    fn reconfiguration(&self) -> EpochInfo {
        self.info.clone()
    }
    fn current_epoch_info(&self) -> EpochInfo {
        self.info.clone()
    }
    fn epoch_info(&self, epoch: u64) -> Option<EpochInfo> {
        (self.info.epoch == epoch).then(|| self.info.clone())
    }
    fn is_config_block(&self, _height: Height) -> bool {
        false
    }
    fn checkpoint_of_epoch(&self, _epoch: u64) -> Option<QuorumCheckpoint> {
        None
    }
}

/// Records executed batches; no real ledger behind it.
struct RecordingExecutor {
    executed: Arc<Mutex<Vec<(u64, Vec<TestTx>)>>>,
}

impl ExecutionService<TestTx> for RecordingExecutor {
    fn execute(
        &self,
        txs: Vec<TestTx>,
        _local_flags: Vec<bool>,
        seq_no: u64,
        _timestamp: i64,
        _proposer_account: String,
    ) {
        self.executed.lock().unwrap().push((seq_no, txs));
    }

    fn state_update(
        &self,
        _target: MetaState,
        _checkpoint_set: Vec<SignedCheckpoint>,
        _epoch_changes: Vec<QuorumCheckpoint>,
    ) {
    }

    fn send_filter_event(&self, _event: FilterEvent) {}
}

fn test_epoch(n: u64) -> EpochInfo {
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
        consensus_params: ConsensusParams::default(),
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn four_replicas_order_a_batch() {
    let n = 4u64;
    let epoch = test_epoch(n);
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

    let networks: Vec<Arc<LoopbackNetwork>> = (1..=n)
        .map(|i| Arc::new(LoopbackNetwork::new(ReplicaId(i))))
        .collect();

    let mut handles: Vec<RunnerHandle<TestTx>> = Vec::new();
    let executed_logs: Vec<Arc<Mutex<Vec<(u64, Vec<TestTx>)>>>> =
        (0..n).map(|_| Arc::new(Mutex::new(Vec::new()))).collect();

    for i in 0..n as usize {
        let id = ReplicaId(i as u64 + 1);
        let config = EngineConfig::new(id, epoch.clone());
        let pool = MemPool::new(MemPoolConfig {
            batch_size: 1,
            ..MemPoolConfig::default()
        });
        let crypto: Arc<dyn CryptoService> =
            Arc::new(KeyedCrypto::new(keys[i].clone(), public_keys.clone()));
        let epoch_service: Arc<dyn EpochService> = Arc::new(FixedEpochService {
            info: epoch.clone(),
        });
        let storage: Arc<dyn Storage> = Arc::new(MemoryStorage::new());
        let replica = Replica::new(config, pool, storage, crypto, epoch_service);

        let executor = Arc::new(RecordingExecutor {
            executed: executed_logs[i].clone(),
        });
        let (runner, handle) = Runner::new(replica, networks[i].clone(), executor, 1024);
        handles.push(handle.clone());

        // Pump inbound envelopes from the transport into the runner.
        let (tx, mut rx) = mpsc::unbounded_channel();
        for network in &networks {
            network.connect(id, format!("node{}", i + 1), tx.clone());
        }
        let pump_handle = handle.clone();
        tokio::spawn(async move {
            while let Some(envelope) = rx.recv().await {
                pump_handle.step(envelope).await;
            }
        });
        tokio::spawn(async move {
            let _ = runner.run().await;
        });
    }

    // Let the staggered start and the recovery handshake settle; the first
    // probe may fire before every peer is connected and is retried on the
    // sync-state timers.
    tokio::time::sleep(Duration::from_secs(3)).await;

    let tx = TestTx(0xAA);
    for (i, handle) in handles.iter().enumerate() {
        handle.post_requests(vec![tx.clone()], i == 0).await;
    }

    // Every replica executes the batch at seq 1.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    'wait: loop {
        tokio::time::sleep(Duration::from_millis(50)).await;
        for log in &executed_logs {
            if log.lock().unwrap().is_empty() {
                if tokio::time::Instant::now() > deadline {
                    panic!("batch was not executed everywhere in time");
                }
                continue 'wait;
            }
        }
        break;
    }

    for log in &executed_logs {
        let executed = log.lock().unwrap();
        assert_eq!(executed[0].0, 1);
        assert_eq!(executed[0].1, vec![tx.clone()]);
    }

    let status = handles[0].status().await.expect("status");
    assert_eq!(status.view, 0);
    assert_eq!(status.id, ReplicaId(1));
}
