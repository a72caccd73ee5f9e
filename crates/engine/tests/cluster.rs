//! Four-replica cluster scenarios driven through the deterministic harness.

mod common;

use common::{Cluster, TestTx};
use rbft_core::TimerId;
use rbft_messages::{Checkpoint, ConsensusMessage, ExecuteState, HashBatch, PrePrepare, Prepare};
use rbft_types::{
    ConsensusParams, Digest, Hash, MsgId, ReplicaId, StatusType, Transaction,
};
use tracing_test::traced_test;

fn submit_everywhere(cluster: &mut Cluster, tx: TestTx) {
    // The API layer relays the transaction to the backups before the
    // primary orders it, so every pool can resolve the batch locally.
    for i in 1..cluster.replicas.len() {
        cluster.submit(i, vec![tx.clone()], false);
    }
    cluster.submit(0, vec![tx.clone()], true);
}

#[traced_test]
#[test]
fn cluster_starts_normal_at_view_zero() {
    let mut cluster = Cluster::new(4);
    cluster.start();
    for replica in &cluster.replicas {
        let status = replica.status();
        assert_eq!(status.status, StatusType::Normal);
        assert_eq!(status.view, 0);
        assert_eq!(status.h, 0);
    }
}

#[traced_test]
#[test]
fn happy_path_one_batch() {
    // S1: one local transaction at the primary is ordered and executed by
    // every replica at seq 1 in view 0.
    let mut cluster = Cluster::new(4);
    cluster.start();

    let t1 = TestTx(0xAA);
    submit_everywhere(&mut cluster, t1.clone());

    for (i, replica) in cluster.replicas.iter().enumerate() {
        assert_eq!(replica.last_exec(), 1, "replica {} last_exec", i + 1);
        let status = replica.status();
        assert_eq!(status.view, 0);
        assert_eq!(status.h, 0);
        assert_eq!(replica.cert_count(), 1);

        let block = &cluster.executed[i][0];
        assert_eq!(block.seq_no, 1);
        assert_eq!(block.txs, vec![t1.clone()]);
        assert_eq!(block.proposer_account, "0x01");
        // The transaction is local only where it was submitted locally.
        assert_eq!(block.local_flags, vec![i == 0]);
    }

    // All four executed the same block with the same resulting digest.
    let digest = cluster.chain_state[0].1;
    for state in &cluster.chain_state {
        assert_eq!(*state, (1, digest));
    }
}

#[traced_test]
#[test]
fn missing_transactions_are_fetched_from_primary() {
    // S2: a backup without the transaction fetches it from the primary
    // before sending its prepare.
    let mut cluster = Cluster::new(4);
    cluster.start();

    let t2 = TestTx(0xBB);
    cluster.submit(0, vec![t2.clone()], true);

    assert!(cluster.count_messages("FetchMissingRequest") >= 1);
    assert!(cluster.count_messages("FetchMissingResponse") >= 1);
    for (i, replica) in cluster.replicas.iter().enumerate() {
        assert_eq!(replica.last_exec(), 1, "replica {} last_exec", i + 1);
        assert_eq!(cluster.executed[i][0].txs, vec![t2.clone()]);
    }
}

#[traced_test]
#[test]
fn view_change_on_conflicting_pre_prepare() {
    // S3: the primary equivocates at (0, 1); the honest replicas rotate to
    // view 1 and order the batch that was prepared.
    let mut cluster = Cluster::new(4);
    cluster.start();

    let t_good = TestTx(0xA1);
    let t_evil = TestTx(0xA2);
    for i in 1..4 {
        cluster.submit(i, vec![t_good.clone(), t_evil.clone()], false);
    }
    // Silence the primary: it equivocates and then fails.
    cluster.stopped[0] = Some("byzantine".to_string());

    let ts = 12_345;
    let good_hashes = vec![t_good.tx_hash()];
    let evil_hashes = vec![t_evil.tx_hash()];
    let d_good = Digest::of_batch(&good_hashes, ts);
    let d_evil = Digest::of_batch(&evil_hashes, ts);

    let pp = |digest, hashes: &Vec<Hash>| {
        ConsensusMessage::PrePrepare(PrePrepare {
            view: 0,
            seq_no: 1,
            batch_digest: digest,
            hash_batch: HashBatch {
                request_hashes: hashes.clone(),
                deduplicate_request_hashes: vec![],
                timestamp: ts,
            },
            replica_id: ReplicaId(1),
        })
    };
    cluster.inject(1, ReplicaId(1), 1, pp(d_good, &good_hashes));
    cluster.inject(2, ReplicaId(1), 1, pp(d_good, &good_hashes));
    cluster.inject(3, ReplicaId(1), 1, pp(d_evil, &evil_hashes));

    // Nothing commits under the equivocating primary.
    for replica in cluster.replicas.iter().skip(1) {
        assert_eq!(replica.last_exec(), 0);
    }

    // Request timers expire; replica 4 joins once it sees f+1 view changes.
    assert!(cluster.fire_timer(1, TimerId::NewView));
    assert!(cluster.fire_timer(2, TimerId::NewView));

    for (i, replica) in cluster.replicas.iter().enumerate().skip(1) {
        let status = replica.status();
        assert_eq!(status.view, 1, "replica {} view", i + 1);
        assert_eq!(status.status, StatusType::Normal);
        assert_eq!(replica.last_exec(), 1);
        assert_eq!(cluster.executed[i][0].txs, vec![t_good.clone()]);
        assert!(replica.has_cert(&MsgId::new(1, 1, d_good)));
        assert!(!replica.has_cert(&MsgId::new(0, 1, d_good)));
        assert!(!replica.has_cert(&MsgId::new(0, 1, d_evil)));
    }
}

#[traced_test]
#[test]
fn checkpoint_advances_watermark() {
    // S4: ten executed blocks stabilize a checkpoint; the watermark moves
    // and certificates at or below it are pruned.
    let mut cluster = Cluster::new(4);
    cluster.start();

    for i in 1..=10u64 {
        submit_everywhere(&mut cluster, TestTx(i));
    }

    for (i, replica) in cluster.replicas.iter().enumerate() {
        assert_eq!(replica.last_exec(), 10, "replica {} last_exec", i + 1);
        let status = replica.status();
        assert_eq!(status.h, 10, "replica {} watermark", i + 1);
        assert_eq!(replica.cert_count(), 0);
        assert_eq!(replica.local_checkpoint_heights(), vec![10]);
    }

    // P5: a pre-prepare at or below the watermark is not accepted.
    let hashes = vec![TestTx(99).tx_hash()];
    cluster.inject(
        1,
        ReplicaId(1),
        1,
        ConsensusMessage::PrePrepare(PrePrepare {
            view: 0,
            seq_no: 5,
            batch_digest: Digest::of_batch(&hashes, 7),
            hash_batch: HashBatch {
                request_hashes: hashes,
                deduplicate_request_hashes: vec![],
                timestamp: 7,
            },
            replica_id: ReplicaId(1),
        }),
    );
    assert!(!cluster.replicas[1].has_cert_at(5));
}

#[traced_test]
#[test]
fn inconsistent_checkpoints_halt_the_replica() {
    // S5: three distinct checkpoint digests at one height exceed F+1; the
    // replica reports Inconsistent and stops.
    let mut cluster = Cluster::new(4);
    cluster.start();

    let body = |tag: u8| Checkpoint {
        epoch: 1,
        execute_state: ExecuteState {
            height: 10,
            digest: Hash::digest(&[tag]),
            batch_digest: Digest::EMPTY,
        },
        need_update_epoch: false,
        view_change: None,
    };
    for (author, tag) in [(1usize, 0xEA), (2, 0xEB), (3, 0xEC)] {
        let signed = cluster.sign_checkpoint(author, &body(tag));
        cluster.inject(
            0,
            ReplicaId(author as u64 + 1),
            1,
            ConsensusMessage::SignedCheckpoint(signed),
        );
    }

    assert!(cluster.stopped[0].is_some(), "replica 1 must stop");
    assert_eq!(cluster.replicas[0].status().status, StatusType::Inconsistent);
    // No further consensus messages are processed.
    let before = cluster.executed[0].len();
    submit_everywhere(&mut cluster, TestTx(1));
    assert_eq!(cluster.executed[0].len(), before);
}

#[traced_test]
#[test]
fn epoch_change_via_config_batch() {
    // S6: the configuration batch at seq 20 stabilizes, every replica
    // reconfigures into epoch 2 at view 0 with H = 20.
    let mut cluster = Cluster::new(4);
    cluster
        .epoch_state
        .write()
        .unwrap()
        .config_blocks
        .insert(20);
    cluster.start();

    for i in 1..=20u64 {
        submit_everywhere(&mut cluster, TestTx(i));
    }

    for (i, replica) in cluster.replicas.iter().enumerate() {
        let status = replica.status();
        assert_eq!(status.status, StatusType::Normal, "replica {}", i + 1);
        assert_eq!(status.epoch_info.epoch, 2, "replica {} epoch", i + 1);
        assert_eq!(status.view, 0, "replica {} view", i + 1);
        assert_eq!(status.h, 20, "replica {} watermark", i + 1);
        assert_eq!(replica.last_exec(), 20);
        assert!(cluster.filter_events[i].contains(&"FinishConfigChange"));
    }
}

#[traced_test]
#[test]
fn duplicate_message_delivery_is_idempotent() {
    // R4: re-delivering prepares and commits changes nothing observable.
    let mut cluster = Cluster::new(4);
    cluster.start();
    submit_everywhere(&mut cluster, TestTx(7));

    let executed_before: Vec<usize> = cluster.executed.iter().map(|e| e.len()).collect();
    let certs_before: Vec<usize> = cluster.replicas.iter().map(|r| r.cert_count()).collect();

    // Replay a prepare and a commit from replica 2 to replica 3.
    let digest = {
        let block = &cluster.executed[0][0];
        Digest::of_batch(
            &block.txs.iter().map(|t| t.tx_hash()).collect::<Vec<_>>(),
            block.timestamp,
        )
    };
    cluster.inject(
        2,
        ReplicaId(2),
        1,
        ConsensusMessage::Prepare(Prepare {
            view: 0,
            seq_no: 1,
            batch_digest: digest,
            replica_id: ReplicaId(2),
        }),
    );
    cluster.inject(
        2,
        ReplicaId(2),
        1,
        ConsensusMessage::Commit(rbft_messages::Commit {
            view: 0,
            seq_no: 1,
            batch_digest: digest,
            replica_id: ReplicaId(2),
        }),
    );

    let executed_after: Vec<usize> = cluster.executed.iter().map(|e| e.len()).collect();
    let certs_after: Vec<usize> = cluster.replicas.iter().map(|r| r.cert_count()).collect();
    assert_eq!(executed_before, executed_after);
    assert_eq!(certs_before, certs_after);
}

#[traced_test]
#[test]
fn restarted_replica_restores_state_and_catches_up() {
    // R3: a replica rebuilt from storage reproduces its persisted position,
    // then catches up the unexecuted tail through fetch-PQC.
    let mut cluster = Cluster::new(4);
    cluster.start();

    for i in 1..=12u64 {
        submit_everywhere(&mut cluster, TestTx(i));
    }
    for replica in &cluster.replicas {
        assert_eq!(replica.last_exec(), 12);
        assert_eq!(replica.status().h, 10);
    }

    cluster.restart_replica(1);
    {
        let restored = &cluster.replicas[1];
        let status = restored.status();
        assert_eq!(status.status, StatusType::Pending);
        assert_eq!(status.h, 10);
        assert_eq!(status.view, 0);
        assert_eq!(restored.last_exec(), 10);
        // Certs above the watermark and their batches survived.
        assert!(restored.has_cert_at(11));
        assert!(restored.has_cert_at(12));
    }

    cluster.start_replica(1);
    let restored = &cluster.replicas[1];
    assert_eq!(restored.status().status, StatusType::Normal);
    assert_eq!(restored.last_exec(), 12, "tail re-executed after restart");
    // The replayed tail produced the same ledger digests as before.
    assert_eq!(cluster.chain_state[1], cluster.chain_state[0]);
}

#[traced_test]
#[test]
fn wrf_rotates_view_on_stable_checkpoint() {
    // With WRF proposer election, every stable checkpoint advances the
    // view by one, rotating the proposer each window.
    let params = ConsensusParams {
        proposer_election_type: rbft_types::ProposerElectionType::Wrf,
        ..ConsensusParams::default()
    };
    let mut cluster = Cluster::with_params(4, params);
    cluster.start();

    for i in 1..=10u64 {
        submit_everywhere(&mut cluster, TestTx(i));
    }

    for replica in &cluster.replicas {
        let status = replica.status();
        assert_eq!(status.h, 10);
        assert_eq!(status.view, 1, "view rotated by the stable checkpoint");
    }
}
