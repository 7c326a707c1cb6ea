use crate::coord::{Coordinator, Paths};
use crate::elector::LeaderElector;
use crate::engine::{EngineSnapshot, LocalEngine, WriteBatch};
use crate::ops::StoreOp;
use crate::retry::{EnsemblePolicy, EnsembleSpec};
use crate::txn::{Transaction, TxnState};
use crate::wal::WriteAheadLog;
use crate::{
    ConnectionState, Env, EnvConfig, Error, LedgerId, LocalStore, LogIndex, MemberId,
    MemoryCluster, MemoryCoordinator, MemoryLedgerService, Role,
};
use std::sync::Arc;
use tokio::time::{sleep, Duration, Instant};

type TestEnv = Env<MemoryCoordinator, MemoryLedgerService, LocalStore>;

const TIMEOUT: Duration = Duration::from_secs(5);

fn test_config(member: MemberId, members: &[MemberId]) -> EnvConfig {
    let mut config = EnvConfig::new(member, members.to_vec());
    config.root_path = "/test".to_string();
    config.digest_key = "secret".to_string();
    config.retry.ensemble_backoff_ms = 10;
    config.retry.election_backoff_ms = 10;
    // Tests drive replay cycles by hand unless they say otherwise
    config.replay.enabled = false;
    config
}

struct TestCluster {
    coord: MemoryCluster,
    ledgers: MemoryLedgerService,
    members: Vec<MemberId>,
}

impl TestCluster {
    fn new(members: &[MemberId], available_nodes: usize) -> Self {
        Self {
            coord: MemoryCluster::new(),
            ledgers: MemoryLedgerService::new(available_nodes),
            members: members.to_vec(),
        }
    }

    async fn open_with(&self, config: EnvConfig) -> TestEnv {
        let member = config.member_id;
        Env::open(
            config,
            self.coord.client(member),
            self.ledgers.clone(),
            LocalStore::new(member),
        )
        .await
        .unwrap()
    }

    /// Open every member in order; the first one becomes leader.
    async fn start(&self) -> Vec<TestEnv> {
        let mut envs = Vec::new();
        for &member in &self.members {
            let env = self.open_with(test_config(member, &self.members)).await;
            if envs.is_empty() {
                assert!(env.wait_for_role(Role::Leader, TIMEOUT).await);
            }
            envs.push(env);
        }
        envs
    }
}

async fn replay_all(envs: &[TestEnv]) {
    for env in envs {
        env.replayer().run_once().await.unwrap();
    }
}

async fn listed(env: &TestEnv, member: MemberId) -> Vec<LedgerId> {
    env.log_index()
        .entries(member)
        .await
        .unwrap()
        .iter()
        .map(|r| r.ledger_id)
        .collect()
}

fn leaders(envs: &[TestEnv]) -> Vec<usize> {
    envs.iter()
        .enumerate()
        .filter(|(_, env)| env.is_leader())
        .map(|(i, _)| i)
        .collect()
}

async fn wait_until(mut cond: impl FnMut() -> bool) {
    let deadline = Instant::now() + TIMEOUT;
    while !cond() {
        assert!(Instant::now() < deadline, "condition not reached in time");
        sleep(Duration::from_millis(1)).await;
    }
}

#[tokio::test]
async fn test_put_get_delete() {
    let cluster = TestCluster::new(&[1, 2, 3], 3);
    let envs = cluster.start().await;
    let db = envs[0].open_keyspace("coldb").await.unwrap();

    db.put(b"k", b"v").await.unwrap();
    // Nothing is visible locally until replay applies the ledger
    assert_eq!(db.get(b"k").unwrap(), None);

    replay_all(&envs).await;
    for env in &envs {
        let db = env.open_keyspace("coldb").await.unwrap();
        assert_eq!(db.get(b"k").unwrap(), Some(b"v".to_vec()));
    }

    db.delete(b"k").await.unwrap();
    replay_all(&envs).await;
    for env in &envs {
        let db = env.open_keyspace("coldb").await.unwrap();
        assert_eq!(db.get(b"k").unwrap(), None);
    }
}

#[tokio::test]
async fn test_commit_lists_ledger_once_per_member() {
    let cluster = TestCluster::new(&[1, 2, 3], 3);
    let envs = cluster.start().await;
    let db = envs[0].open_keyspace("coldb").await.unwrap();

    let mut ids = Vec::new();
    for i in 0..3 {
        let mut txn = envs[0].write_txn().await.unwrap();
        db.put_in(&mut txn, format!("k{i}").as_bytes(), b"v")
            .await
            .unwrap();
        db.put_in(&mut txn, b"shared", format!("{i}").as_bytes())
            .await
            .unwrap();
        ids.push(txn.ledger_id());
        txn.commit().await.unwrap();
        assert_eq!(txn.state(), TxnState::Committed);
    }

    for member in [1, 2, 3] {
        assert_eq!(listed(&envs[0], member).await, ids);
        let records = envs[0].log_index().entries(member).await.unwrap();
        assert!(records.iter().all(|r| r.timestamp > 0));
    }
    for &id in &ids {
        let meta = cluster.ledgers.metadata(id).unwrap();
        assert!(meta.closed);
        assert_eq!(meta.confirmed, 2);
        assert_eq!(meta.ensemble_size, 3);
        assert_eq!(meta.ack_quorum, 2);
    }

    replay_all(&envs).await;
    for env in &envs {
        let db = env.open_keyspace("coldb").await.unwrap();
        assert_eq!(db.get(b"shared").unwrap(), Some(b"2".to_vec()));
    }
}

#[tokio::test]
async fn test_replay_is_idempotent() {
    let cluster = TestCluster::new(&[1, 2], 2);
    let envs = cluster.start().await;
    let db = envs[0].open_keyspace("coldb").await.unwrap();

    db.put(b"k1", b"a").await.unwrap();
    db.put(b"k2", b"b").await.unwrap();
    db.delete(b"k1").await.unwrap();
    db.put(b"k3", b"c").await.unwrap();

    let follower = &envs[1];
    let report = follower.replayer().run_once().await.unwrap();
    assert_eq!(report.applied.len(), 4);
    let first = follower.engine().read().tables().clone();

    // Rewind the cursor so every ledger is applied a second time
    let path = follower.paths().cursor(2);
    let coord = follower.coordinator();
    let node = coord.get(&path).await.unwrap().unwrap();
    coord.set(&path, Vec::new(), node.version).await.unwrap();
    assert_eq!(follower.log_index().cursor(2).await.unwrap(), None);

    let report = follower.replayer().run_once().await.unwrap();
    assert_eq!(report.applied.len(), 4);
    assert_eq!(follower.engine().read().tables(), &first);

    let db = follower.open_keyspace("coldb").await.unwrap();
    assert_eq!(db.get(b"k1").unwrap(), None);
    assert_eq!(db.get(b"k3").unwrap(), Some(b"c".to_vec()));
}

#[tokio::test]
async fn test_replay_follows_list_order_not_ids() {
    let cluster = TestCluster::new(&[1, 2], 2);
    cluster.ledgers.preset_ids([500, 3]);
    let envs = cluster.start().await;
    let db = envs[0].open_keyspace("coldb").await.unwrap();

    db.put(b"k", b"first").await.unwrap();
    db.put(b"k", b"second").await.unwrap();
    assert_eq!(listed(&envs[0], 2).await, vec![500, 3]);

    let report = envs[1].replayer().run_once().await.unwrap();
    assert_eq!(report.applied, vec![500, 3]);
    let db = envs[1].open_keyspace("coldb").await.unwrap();
    assert_eq!(db.get(b"k").unwrap(), Some(b"second".to_vec()));
    assert_eq!(envs[1].log_index().cursor(2).await.unwrap(), Some(3));
}

#[tokio::test]
async fn test_single_leader_under_churn() {
    let cluster = TestCluster::new(&[1, 2, 3], 3);
    let envs = cluster.start().await;

    for _ in 0..10 {
        let current = leaders(&envs);
        assert_eq!(current.len(), 1);
        let old = current[0];
        envs[old]
            .coordinator()
            .set_connection_state(ConnectionState::Suspended);

        let deadline = Instant::now() + TIMEOUT;
        loop {
            let current = leaders(&envs);
            assert!(current.len() <= 1, "several leaders: {current:?}");
            if current.len() == 1 && current[0] != old {
                break;
            }
            assert!(Instant::now() < deadline, "no successor elected");
            sleep(Duration::from_millis(1)).await;
        }

        envs[old]
            .coordinator()
            .set_connection_state(ConnectionState::Connected);
        assert_eq!(leaders(&envs).len(), 1);
    }
}

#[tokio::test]
async fn test_connectivity_loss_demotes_leader() {
    let cluster = TestCluster::new(&[1, 2], 2);
    let envs = cluster.start().await;
    let db = envs[0].open_keyspace("coldb").await.unwrap();

    let mut txn = envs[0].write_txn().await.unwrap();
    db.put_in(&mut txn, b"k", b"v").await.unwrap();
    let id = txn.ledger_id();

    envs[0]
        .coordinator()
        .set_connection_state(ConnectionState::Lost);
    assert!(envs[0].wait_for_role(Role::Follower, TIMEOUT).await);

    // In-flight transactions survive demotion but cannot commit
    assert!(matches!(txn.commit().await, Err(Error::NotLeader)));
    assert_eq!(txn.state(), TxnState::Open);
    txn.abort().await.unwrap();
    assert!(!cluster.ledgers.exists(id));
    assert!(listed(&envs[1], 2).await.is_empty());

    assert!(matches!(envs[0].write_txn().await, Err(Error::NotLeader)));
    assert!(envs[1].wait_for_role(Role::Leader, TIMEOUT).await);
    assert_eq!(cluster.coord.holder(&envs[1].paths().election()), Some(2));
}

#[tokio::test(start_paused = true)]
async fn test_ensemble_degrades_with_backoff() {
    let members = [1, 2, 3, 4];
    let cluster = TestCluster::new(&members, 2);
    let mut config = test_config(1, &members);
    config.retry.ensemble_backoff_ms = 1000;
    let env = cluster.open_with(config).await;
    assert!(env.wait_for_role(Role::Leader, TIMEOUT).await);

    let start = Instant::now();
    let txn = env.write_txn().await.unwrap();
    assert!(start.elapsed() >= Duration::from_secs(2));
    assert_eq!(cluster.ledgers.create_attempts(), vec![4, 3, 2]);
    assert_eq!(
        txn.ensemble(),
        EnsembleSpec {
            ensemble_size: 2,
            write_quorum: 2,
            ack_quorum: 2,
        }
    );
    let meta = cluster.ledgers.metadata(txn.ledger_id()).unwrap();
    assert_eq!(meta.ensemble_size, 2);
}

#[tokio::test(start_paused = true)]
async fn test_ensemble_attempts_cap() {
    let members = [1, 2, 3, 4];
    let cluster = TestCluster::new(&members, 1);
    let mut config = test_config(1, &members);
    config.retry.ensemble_attempts = Some(2);
    let env = cluster.open_with(config).await;
    assert!(env.wait_for_role(Role::Leader, TIMEOUT).await);

    let err = env.write_txn().await.err().unwrap();
    assert!(matches!(
        err,
        Error::InsufficientEnsemble {
            requested: 3,
            available: 1
        }
    ));
    assert_eq!(cluster.ledgers.create_attempts(), vec![4, 3]);

    // A two member cluster never narrows below its size
    let cluster = TestCluster::new(&[1, 2], 1);
    let mut config = test_config(1, &[1, 2]);
    config.retry.ensemble_attempts = Some(3);
    let env = cluster.open_with(config).await;
    assert!(env.wait_for_role(Role::Leader, TIMEOUT).await);
    assert!(env.write_txn().await.is_err());
    assert_eq!(cluster.ledgers.create_attempts(), vec![2, 2, 2]);
}

#[tokio::test]
async fn test_commit_failure_removes_ledger() {
    let cluster = TestCluster::new(&[1, 2, 3], 3);
    let envs = cluster.start().await;
    let db = envs[0].open_keyspace("coldb").await.unwrap();

    // One more conflict than the commit path retries
    cluster.coord.inject_conflicts(&envs[0].paths().log(1), 3);
    let err = db.put(b"k", b"v").await.unwrap_err();
    let ledger_id = match err {
        Error::CommitFailure { ledger_id, source } => {
            assert!(source.is_version_conflict());
            ledger_id
        }
        other => panic!("unexpected error: {other}"),
    };

    assert!(!cluster.ledgers.exists(ledger_id));
    assert_eq!(cluster.ledgers.deleted(), vec![ledger_id]);
    for member in [1, 2, 3] {
        assert!(listed(&envs[0], member).await.is_empty());
    }
}

#[tokio::test]
async fn test_partial_commit_failure_stalls_published_member() {
    let cluster = TestCluster::new(&[1, 2, 3], 3);
    let envs = cluster.start().await;
    let db = envs[0].open_keyspace("coldb").await.unwrap();

    // Member 1's list is written before member 2's conflicts run out the retries
    cluster.coord.inject_conflicts(&envs[0].paths().log(2), 3);
    let err = db.put(b"k", b"lost").await.unwrap_err();
    let orphan = match err {
        Error::CommitFailure { ledger_id, source } => {
            assert!(source.is_version_conflict());
            ledger_id
        }
        other => panic!("unexpected error: {other}"),
    };
    assert_eq!(listed(&envs[0], 1).await, vec![orphan]);
    assert!(listed(&envs[0], 2).await.is_empty());
    assert!(listed(&envs[0], 3).await.is_empty());
    assert!(!cluster.ledgers.exists(orphan));
    assert_eq!(cluster.ledgers.deleted(), vec![orphan]);

    db.put(b"k", b"kept").await.unwrap();
    let next = listed(&envs[0], 2).await;
    assert_eq!(next.len(), 1);
    assert_eq!(listed(&envs[0], 1).await, vec![orphan, next[0]]);

    // The orphaned id is never skipped, so member 1 stops in front of it
    for _ in 0..2 {
        let report = envs[0].replayer().run_once().await.unwrap();
        assert_eq!(report.stalled_at, Some(orphan));
        assert!(report.applied.is_empty());
        assert_eq!(report.skipped, 0);
    }
    assert_eq!(envs[0].log_index().cursor(1).await.unwrap(), None);
    assert_eq!(db.get(b"k").unwrap(), None);

    for env in &envs[1..] {
        let report = env.replayer().run_once().await.unwrap();
        assert_eq!(report.applied, next);
        let replica = env.open_keyspace("coldb").await.unwrap();
        assert_eq!(replica.get(b"k").unwrap(), Some(b"kept".to_vec()));
    }
}

#[tokio::test]
async fn test_commit_retries_version_conflicts() {
    let cluster = TestCluster::new(&[1, 2, 3], 3);
    let envs = cluster.start().await;
    let db = envs[0].open_keyspace("coldb").await.unwrap();

    cluster.coord.inject_conflicts(&envs[0].paths().log(2), 2);
    db.put(b"k", b"v").await.unwrap();
    for member in [1, 2, 3] {
        assert_eq!(listed(&envs[0], member).await.len(), 1);
    }
    assert!(cluster.ledgers.deleted().is_empty());
}

#[tokio::test]
async fn test_abort_and_drop_leave_no_trace() {
    let cluster = TestCluster::new(&[1, 2], 2);
    let envs = cluster.start().await;
    let db = envs[0].open_keyspace("coldb").await.unwrap();

    let mut txn = envs[0].write_txn().await.unwrap();
    let aborted = txn.ledger_id();
    db.put_in(&mut txn, b"k", b"v").await.unwrap();
    txn.abort().await.unwrap();
    assert_eq!(txn.state(), TxnState::Aborted);
    assert!(!cluster.ledgers.exists(aborted));
    assert!(matches!(
        db.put_in(&mut txn, b"k", b"v").await,
        Err(Error::TransactionClosed)
    ));
    assert!(matches!(txn.commit().await, Err(Error::TransactionClosed)));

    let mut txn = envs[0].write_txn().await.unwrap();
    let closed = txn.ledger_id();
    db.delete_in(&mut txn, b"k").await.unwrap();
    txn.close().await.unwrap();
    assert!(!cluster.ledgers.exists(closed));

    let txn = envs[0].write_txn().await.unwrap();
    let dropped = txn.ledger_id();
    drop(txn);
    wait_until(|| !cluster.ledgers.exists(dropped)).await;

    for member in [1, 2] {
        assert!(listed(&envs[0], member).await.is_empty());
    }
    let report = envs[1].replayer().run_once().await.unwrap();
    assert!(report.applied.is_empty());
    assert_eq!(db.get(b"k").unwrap(), None);
}

#[tokio::test]
async fn test_follower_cannot_write() {
    let cluster = TestCluster::new(&[1, 2], 2);
    let envs = cluster.start().await;
    assert_eq!(envs[1].role(), Role::Follower);

    assert!(matches!(envs[1].write_txn().await, Err(Error::NotLeader)));
    let db = envs[1].open_keyspace("coldb").await.unwrap();
    assert!(matches!(db.put(b"k", b"v").await, Err(Error::NotLeader)));
    assert!(matches!(db.delete(b"k").await, Err(Error::NotLeader)));
    assert!(cluster.ledgers.create_attempts().is_empty());
}

#[tokio::test]
async fn test_long_key_rejected_before_ledger_creation() {
    let cluster = TestCluster::new(&[1], 1);
    let envs = cluster.start().await;
    let db = envs[0].open_keyspace("coldb").await.unwrap();

    let key = vec![7u8; 256];
    assert!(matches!(
        db.put(&key, b"v").await,
        Err(Error::KeyTooLong(256))
    ));
    assert!(cluster.ledgers.create_attempts().is_empty());

    let key = vec![7u8; 255];
    db.put(&key, b"v").await.unwrap();
    envs[0].replayer().run_once().await.unwrap();
    assert_eq!(db.get(&key).unwrap(), Some(b"v".to_vec()));
}

#[tokio::test]
async fn test_replay_pauses_while_disconnected() {
    let cluster = TestCluster::new(&[1, 2], 2);
    let envs = cluster.start().await;
    let db = envs[0].open_keyspace("coldb").await.unwrap();
    db.put(b"k", b"v").await.unwrap();

    envs[1]
        .coordinator()
        .set_connection_state(ConnectionState::Suspended);
    let report = envs[1].replayer().run_once().await.unwrap();
    assert!(report.paused);
    assert!(report.applied.is_empty());

    envs[1]
        .coordinator()
        .set_connection_state(ConnectionState::Connected);
    let report = envs[1].replayer().run_once().await.unwrap();
    assert!(!report.paused);
    assert_eq!(report.applied.len(), 1);
}

#[tokio::test]
async fn test_replay_stalls_on_unreadable_ledger() {
    let cluster = TestCluster::new(&[1, 2], 2);
    let envs = cluster.start().await;
    let db = envs[0].open_keyspace("coldb").await.unwrap();
    db.put(b"a", b"1").await.unwrap();
    db.put(b"b", b"2").await.unwrap();
    let ids = listed(&envs[0], 2).await;

    cluster.ledgers.set_unreadable(ids[0], true);
    for _ in 0..2 {
        let report = envs[1].replayer().run_once().await.unwrap();
        assert_eq!(report.stalled_at, Some(ids[0]));
        assert!(report.applied.is_empty());
    }
    assert_eq!(envs[1].log_index().cursor(2).await.unwrap(), None);

    cluster.ledgers.set_unreadable(ids[0], false);
    let report = envs[1].replayer().run_once().await.unwrap();
    assert_eq!(report.stalled_at, None);
    assert_eq!(report.applied, ids);
}

#[tokio::test]
async fn test_dropped_keyspace_entries_are_ignored() {
    let cluster = TestCluster::new(&[1, 2], 2);
    let envs = cluster.start().await;
    let db = envs[0].open_keyspace("tmp").await.unwrap();
    let marker = envs[0].paths().keyspace(db.id());
    assert_eq!(cluster.coord.node(&marker).unwrap().data, b"tmp");

    db.put(b"k", b"v").await.unwrap();
    db.drop().await.unwrap();
    assert!(cluster.coord.node(&marker).is_none());
    assert!(!envs[0].engine().has_table("tmp"));

    let report = envs[1].replayer().run_once().await.unwrap();
    assert_eq!(report.applied.len(), 1);
    assert_eq!(report.skipped, 1);
    assert_eq!(report.records, 0);
    assert!(!envs[1].engine().has_table("tmp"));
}

#[tokio::test]
async fn test_undecodable_record_is_skipped() {
    let cluster = TestCluster::new(&[1, 2], 2);
    let envs = cluster.start().await;
    let db = envs[0].open_keyspace("coldb").await.unwrap();

    let mut txn = envs[0].write_txn().await.unwrap();
    txn.add(vec![1, 2, 3]).await.unwrap();
    db.put_in(&mut txn, b"k", b"v").await.unwrap();
    assert_eq!(txn.len(), 2);
    txn.commit().await.unwrap();

    let report = envs[1].replayer().run_once().await.unwrap();
    assert_eq!(report.applied.len(), 1);
    assert_eq!(report.skipped, 1);
    assert_eq!(report.records, 1);
    let db = envs[1].open_keyspace("coldb").await.unwrap();
    assert_eq!(db.get(b"k").unwrap(), Some(b"v".to_vec()));
}

#[tokio::test]
async fn test_replay_opens_tables_of_new_keyspaces() {
    let cluster = TestCluster::new(&[1, 2], 2);
    let envs = cluster.start().await;
    let db = envs[0].open_keyspace("hotdb").await.unwrap();
    db.put(b"k", b"v").await.unwrap();

    assert!(!envs[1].engine().has_table("hotdb"));
    envs[1].replayer().run_once().await.unwrap();
    assert!(envs[1].engine().has_table("hotdb"));
    assert_eq!(
        envs[1].engine().get("hotdb", b"k").unwrap(),
        Some(b"v".to_vec())
    );
}

#[tokio::test]
async fn test_garbage_collection() {
    let cluster = TestCluster::new(&[1, 2], 2);
    let envs = cluster.start().await;
    let db = envs[0].open_keyspace("coldb").await.unwrap();
    for i in 0..3 {
        db.put(b"k", format!("{i}").as_bytes()).await.unwrap();
    }
    let ids = listed(&envs[0], 1).await;

    // Nothing is collectible before every member has a cursor
    envs[0].replayer().run_once().await.unwrap();
    assert!(envs[0].replayer().collect_garbage().await.unwrap().is_empty());

    cluster.ledgers.set_unreadable(ids[2], true);
    let report = envs[1].replayer().run_once().await.unwrap();
    assert_eq!(report.applied, ids[..2].to_vec());

    let collected = envs[0].replayer().collect_garbage().await.unwrap();
    assert_eq!(collected, vec![ids[0]]);
    assert!(!cluster.ledgers.exists(ids[0]));
    assert!(cluster.ledgers.exists(ids[1]));
    assert!(cluster.ledgers.exists(ids[2]));

    cluster.ledgers.set_unreadable(ids[2], false);
    envs[1].replayer().run_once().await.unwrap();
    let collected = envs[0].replayer().collect_garbage().await.unwrap();
    assert_eq!(collected, vec![ids[1]]);

    // A fresh loop, as after a restart, resumes after the persisted mark
    assert!(envs[1].replayer().collect_garbage().await.unwrap().is_empty());
    assert_eq!(cluster.ledgers.delete_attempts(), ids[..2].to_vec());
    assert_eq!(envs[0].log_index().gc_mark().await.unwrap(), Some(ids[1]));

    // Lists are never rewritten
    for member in [1, 2] {
        assert_eq!(listed(&envs[0], member).await, ids);
    }
}

#[tokio::test]
async fn test_replay_cycle_collects_on_leader() {
    let cluster = TestCluster::new(&[1], 1);
    let mut config = test_config(1, &[1]);
    config.replay.gc_every = 1;
    let env = cluster.open_with(config).await;
    assert!(env.wait_for_role(Role::Leader, TIMEOUT).await);
    let db = env.open_keyspace("coldb").await.unwrap();
    db.put(b"a", b"1").await.unwrap();
    db.put(b"b", b"2").await.unwrap();
    let ids = listed(&env, 1).await;

    let mut replayer = env.replayer();
    let report = replayer.run_once().await.unwrap();
    assert_eq!(report.applied, ids);
    // The last applied ledger is the cursor and stays
    assert_eq!(report.collected, vec![ids[0]]);
    assert_eq!(replayer.cycles(), 1);

    let report = replayer.run_once().await.unwrap();
    assert!(report.collected.is_empty());
}

#[tokio::test]
async fn test_read_transaction_is_point_in_time() {
    let cluster = TestCluster::new(&[1], 1);
    let envs = cluster.start().await;
    let db = envs[0].open_keyspace("coldb").await.unwrap();

    let mut rtx = envs[0].read_txn();
    assert!(rtx.is_read_only());
    db.put(b"k", b"v").await.unwrap();
    envs[0].replayer().run_once().await.unwrap();

    assert_eq!(db.get_in(&rtx, b"k").unwrap(), None);
    assert_eq!(db.get(b"k").unwrap(), Some(b"v".to_vec()));

    rtx.close().await.unwrap();
    assert!(matches!(
        db.get_in(&rtx, b"k"),
        Err(Error::TransactionClosed)
    ));
}

#[tokio::test]
async fn test_background_replay() {
    let cluster = TestCluster::new(&[1, 2], 2);
    let mut envs = Vec::new();
    for member in [1, 2] {
        let mut config = test_config(member, &[1, 2]);
        config.replay.enabled = true;
        config.replay.interval_ms = 10;
        let env = cluster.open_with(config).await;
        if member == 1 {
            assert!(env.wait_for_role(Role::Leader, TIMEOUT).await);
        }
        envs.push(env);
    }

    let db = envs[0].open_keyspace("coldb").await.unwrap();
    db.put(b"k", b"v").await.unwrap();
    let replica = envs[1].open_keyspace("coldb").await.unwrap();
    wait_until(|| replica.get(b"k").unwrap().is_some()).await;
    wait_until(|| db.get(b"k").unwrap().is_some()).await;

    for env in envs {
        env.close().await.unwrap();
    }
}

#[tokio::test]
async fn test_env_status() {
    let cluster = TestCluster::new(&[1, 2], 2);
    let envs = cluster.start().await;
    let db = envs[0].open_keyspace("coldb").await.unwrap();
    db.put(b"a", b"1").await.unwrap();
    db.put(b"b", b"2").await.unwrap();

    let status = envs[1].status().await.unwrap();
    assert_eq!(status.member, 2);
    assert_eq!(status.role, Role::Follower);
    assert_eq!(status.cluster_size, 2);
    assert_eq!(status.cursor, None);
    assert_eq!(status.log_len, 2);
    assert_eq!(status.pending, 2);

    envs[1].replayer().run_once().await.unwrap();
    let status = envs[1].status().await.unwrap();
    assert_eq!(status.cursor, listed(&envs[1], 2).await.last().copied());
    assert_eq!(status.pending, 0);
}

#[tokio::test]
async fn test_close_flushes_local_store() {
    use tempfile::TempDir;

    let temp_dir = TempDir::new().unwrap();
    let cluster = TestCluster::new(&[1], 1);
    {
        let store = LocalStore::open(1, temp_dir.path()).unwrap();
        let env = Env::open(
            test_config(1, &[1]),
            cluster.coord.client(1),
            cluster.ledgers.clone(),
            store,
        )
        .await
        .unwrap();
        assert!(env.wait_for_role(Role::Leader, TIMEOUT).await);
        let db = env.open_keyspace("coldb").await.unwrap();
        db.put(b"oi", b"hello").await.unwrap();
        env.replayer().run_once().await.unwrap();
        env.close().await.unwrap();
    }
    assert!(temp_dir.path().join("member_1.snapshot").exists());

    let store = LocalStore::open(1, temp_dir.path()).unwrap();
    assert_eq!(store.status().batches_since_snapshot, 0);
    assert_eq!(store.get("coldb", b"oi").unwrap(), Some(b"hello".to_vec()));
}

#[tokio::test]
async fn test_local_store_wal_recovery() {
    use tempfile::TempDir;

    let temp_dir = TempDir::new().unwrap();
    {
        let store = LocalStore::open(1, temp_dir.path()).unwrap();
        store.open_table("t").unwrap();
        let mut batch = WriteBatch::new();
        batch.put("t", b"a".to_vec(), b"1".to_vec());
        batch.put("t", b"b".to_vec(), b"2".to_vec());
        store.commit(batch).unwrap();
        let mut batch = WriteBatch::new();
        batch.delete("t", b"a".to_vec());
        store.commit(batch).unwrap();

        // Re-applying what is already there writes nothing
        let mut batch = WriteBatch::new();
        batch.put("t", b"b".to_vec(), b"2".to_vec());
        store.commit(batch).unwrap();
        assert_eq!(store.status().batches_since_snapshot, 3);
    } // Drop store to close WAL

    let store = LocalStore::open(1, temp_dir.path()).unwrap();
    assert!(store.has_table("t"));
    assert_eq!(store.get("t", b"a").unwrap(), None);
    assert_eq!(store.get("t", b"b").unwrap(), Some(b"2".to_vec()));
    assert!(!temp_dir.path().join("member_1.snapshot").exists());
}

#[tokio::test]
async fn test_local_store_snapshot_compaction() {
    use tempfile::TempDir;

    let temp_dir = TempDir::new().unwrap();
    {
        let store = LocalStore::open(1, temp_dir.path())
            .unwrap()
            .with_snapshot_every(2);
        store.open_table("t").unwrap();
        let mut batch = WriteBatch::new();
        batch.put("t", b"a".to_vec(), b"1".to_vec());
        store.commit(batch).unwrap();
        assert_eq!(store.status().batches_since_snapshot, 0);
        assert!(temp_dir.path().join("member_1.snapshot").exists());

        let mut batch = WriteBatch::new();
        batch.put("t", b"b".to_vec(), b"2".to_vec());
        store.commit(batch).unwrap();
        assert_eq!(store.status().batches_since_snapshot, 1);
    }

    let store = LocalStore::open(1, temp_dir.path()).unwrap();
    assert_eq!(store.status().batches_since_snapshot, 1);
    assert_eq!(store.get("t", b"a").unwrap(), Some(b"1".to_vec()));
    assert_eq!(store.get("t", b"b").unwrap(), Some(b"2".to_vec()));
}

#[test]
fn test_wal_truncates_torn_tail() {
    use std::io::Write as _;
    use tempfile::TempDir;

    let temp_dir = TempDir::new().unwrap();
    let path = temp_dir.path().join("member_1.wal");
    {
        let mut wal = WriteAheadLog::new(&path, 1).unwrap();
        wal.write_batch(&[StoreOp::CreateTable("t".into())]).unwrap();
        wal.write_batch(&[StoreOp::Put {
            table: "t".into(),
            key: b"k".to_vec(),
            value: b"v".to_vec(),
        }])
        .unwrap();
    }

    // Half-written frame from a crash
    let mut file = std::fs::OpenOptions::new().append(true).open(&path).unwrap();
    file.write_all(&[42, 0, 0, 0, 1, 2]).unwrap();
    drop(file);

    {
        let mut wal = WriteAheadLog::new(&path, 1).unwrap();
        assert_eq!(wal.sequence(), 2);
        wal.write_batch(&[StoreOp::Delete {
            table: "t".into(),
            key: b"k".to_vec(),
        }])
        .unwrap();
    }

    let wal = WriteAheadLog::new(&path, 1).unwrap();
    assert_eq!(wal.sequence(), 3);
    assert_eq!(wal.read_all_batches().unwrap().len(), 3);
    drop(wal);
    assert!(WriteAheadLog::new(&path, 2).is_err());
}

#[test]
fn test_wal_ignores_frame_longer_than_file() {
    use std::io::Write as _;
    use tempfile::TempDir;

    let temp_dir = TempDir::new().unwrap();
    let path = temp_dir.path().join("member_1.wal");
    {
        let mut wal = WriteAheadLog::new(&path, 1).unwrap();
        wal.write_batch(&[StoreOp::CreateTable("t".into())]).unwrap();
    }
    let intact_len = std::fs::metadata(&path).unwrap().len();

    // Corrupted length field claiming ~4 GiB of payload
    let mut file = std::fs::OpenOptions::new().append(true).open(&path).unwrap();
    file.write_all(&[0xF0, 0xFF, 0xFF, 0xFF, 0, 0, 0, 0, 9, 9]).unwrap();
    drop(file);

    let mut wal = WriteAheadLog::new(&path, 1).unwrap();
    assert_eq!(wal.sequence(), 1);
    assert_eq!(std::fs::metadata(&path).unwrap().len(), intact_len);
    wal.write_batch(&[StoreOp::DropTable("t".into())]).unwrap();
    assert_eq!(wal.read_all_batches().unwrap().len(), 2);
}

#[test]
fn test_store_reopens_after_interrupted_wal_reset() {
    use tempfile::TempDir;

    let temp_dir = TempDir::new().unwrap();
    let wal_path = temp_dir.path().join("member_1.wal");
    {
        let store = LocalStore::open(1, temp_dir.path()).unwrap();
        store.open_table("t").unwrap();
        let mut batch = WriteBatch::new();
        batch.put("t", b"a".to_vec(), b"1".to_vec());
        store.commit(batch).unwrap();
        store.flush().unwrap();
    }

    // Crash after the WAL was emptied, before its new header was written
    std::fs::OpenOptions::new()
        .write(true)
        .open(&wal_path)
        .unwrap()
        .set_len(0)
        .unwrap();

    {
        let store = LocalStore::open(1, temp_dir.path()).unwrap();
        assert_eq!(store.get("t", b"a").unwrap(), Some(b"1".to_vec()));
        let mut batch = WriteBatch::new();
        batch.put("t", b"b".to_vec(), b"2".to_vec());
        store.commit(batch).unwrap();
    }

    let store = LocalStore::open(1, temp_dir.path()).unwrap();
    assert_eq!(store.get("t", b"a").unwrap(), Some(b"1".to_vec()));
    assert_eq!(store.get("t", b"b").unwrap(), Some(b"2".to_vec()));
    assert_eq!(store.status().batches_since_snapshot, 1);

    // A header torn mid-write is handled the same way
    drop(store);
    std::fs::write(&wal_path, [12, 0, 0]).unwrap();
    let store = LocalStore::open(1, temp_dir.path()).unwrap();
    assert_eq!(store.get("t", b"a").unwrap(), Some(b"1".to_vec()));
}

#[tokio::test]
async fn test_snapshot_is_isolated_from_later_commits() {
    let store = LocalStore::new(1);
    store.open_table("t").unwrap();
    let snapshot = store.snapshot();

    let mut batch = WriteBatch::new();
    batch.put("t", b"k".to_vec(), b"v".to_vec());
    store.commit(batch).unwrap();
    store.drop_table("t").unwrap();

    assert_eq!(snapshot.get("t", b"k").unwrap(), None);
    assert!(!store.has_table("t"));
    // Writes to a missing table are dropped
    let mut batch = WriteBatch::new();
    batch.put("t", b"k".to_vec(), b"v".to_vec());
    store.commit(batch).unwrap();
    assert!(!store.has_table("t"));
}

#[tokio::test]
async fn test_log_index_lists_and_cursor() {
    let cluster = MemoryCluster::new();
    let coord = Arc::new(cluster.client(1));
    let paths = Paths::new("/idx/");
    for path in paths.skeleton(&[1]) {
        coord.create_if_absent(&path).await.unwrap();
    }
    let index = LogIndex::new(coord.clone(), paths.clone());

    for id in [7, 3, 9] {
        index.append(1, id, 1_000 + id).await.unwrap();
    }
    assert_eq!(cluster.node(&paths.log(1)).unwrap().data.len(), 48);
    assert_eq!(index.list_from(1, None).await.unwrap(), vec![7, 3, 9]);
    assert_eq!(index.list_from(1, Some(3)).await.unwrap(), vec![9]);
    assert_eq!(index.list_from(1, Some(9)).await.unwrap(), Vec::<LedgerId>::new());
    // Unknown cursor replays everything
    assert_eq!(index.list_from(1, Some(42)).await.unwrap(), vec![7, 3, 9]);

    assert_eq!(index.cursor(1).await.unwrap(), None);
    index.advance_cursor(1, 9).await.unwrap();
    index.advance_cursor(1, 7).await.unwrap();
    assert_eq!(index.cursor(1).await.unwrap(), Some(9));
    assert_eq!(
        cluster.node(&paths.cursor(1)).unwrap().data,
        9i64.to_be_bytes().to_vec()
    );

    // A single append does not retry a lost race
    cluster.inject_conflicts(&paths.log(1), 1);
    assert!(index.append(1, 11, 0).await.unwrap_err().is_version_conflict());
    assert_eq!(index.list_from(1, None).await.unwrap(), vec![7, 3, 9]);
    index.append(1, 11, 0).await.unwrap();
    assert_eq!(index.list_from(1, Some(9)).await.unwrap(), vec![11]);
}

#[tokio::test]
async fn test_log_index_collectible() {
    let cluster = MemoryCluster::new();
    let coord = Arc::new(cluster.client(1));
    let paths = Paths::new("/idx");
    for path in paths.skeleton(&[1, 2]) {
        coord.create_if_absent(&path).await.unwrap();
    }
    let index = LogIndex::new(coord, paths);
    for member in [1, 2] {
        for id in [1, 2, 3] {
            index.append(member, id, 0).await.unwrap();
        }
    }

    index.advance_cursor(1, 3).await.unwrap();
    assert!(index.collectible(&[1, 2]).await.unwrap().is_empty());
    index.advance_cursor(2, 2).await.unwrap();
    assert_eq!(index.collectible(&[1, 2]).await.unwrap(), vec![1]);
    index.advance_cursor(2, 3).await.unwrap();
    assert_eq!(index.collectible(&[1, 2]).await.unwrap(), vec![1, 2]);
}

#[tokio::test]
async fn test_elector_hands_over_on_shutdown() {
    let cluster = MemoryCluster::new();
    let path = "/test/election".to_string();
    let backoff = Duration::from_millis(10);
    let mut first = LeaderElector::start(Arc::new(cluster.client(1)), path.clone(), 1, backoff);
    let mut first_role = first.subscribe();
    first_role.wait_for(|r| *r == Role::Leader).await.unwrap();

    let second = LeaderElector::start(Arc::new(cluster.client(2)), path.clone(), 2, backoff);
    sleep(Duration::from_millis(20)).await;
    assert!(!second.is_leader());
    assert_eq!(cluster.holder(&path), Some(1));

    first.shutdown().await;
    assert!(!first.is_leader());
    let mut second_role = second.subscribe();
    tokio::time::timeout(TIMEOUT, second_role.wait_for(|r| *r == Role::Leader))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(cluster.holder(&path), Some(2));
}

#[tokio::test]
async fn test_open_fails_on_bad_config() {
    let cluster = TestCluster::new(&[1, 2], 2);
    let config = test_config(3, &[1, 2]);
    let res = Env::open(
        config,
        cluster.coord.client(3),
        cluster.ledgers.clone(),
        LocalStore::new(3),
    )
    .await;
    assert!(matches!(res, Err(Error::Config(_))));
}

#[test]
fn test_config_from_toml() {
    let config = EnvConfig::from_toml_str(
        r#"
member_id = 2
members = [1, 2, 3]
root_path = "/cluster"
digest_key = "secret"

[retry]
ensemble_backoff_ms = 50
ensemble_attempts = 4

[replay]
gc_every = 0
"#,
    )
    .unwrap();
    assert_eq!(config.member_id, 2);
    assert_eq!(config.cluster_size(), 3);
    assert_eq!(config.digest(), b"secret");
    assert_eq!(config.retry.ensemble_backoff(), Duration::from_millis(50));
    assert_eq!(config.retry.ensemble_attempts, Some(4));
    assert_eq!(config.retry.cas_attempts, 3);
    assert_eq!(config.retry.election_backoff_ms, 1000);
    assert!(config.replay.enabled);
    assert_eq!(config.replay.interval(), Duration::from_millis(1000));
    assert_eq!(config.replay.gc_every, 0);

    let defaults = EnvConfig::from_toml_str("").unwrap();
    assert_eq!(defaults, EnvConfig::default());
    assert_eq!(defaults.root_path, "/ledgerkv");

    for bad in [
        "member_id = 9\nmembers = [1, 2]",
        "members = []",
        "root_path = \"relative\"",
        "[retry]\ncas_attempts = 0",
        "members = \"oops\"",
    ] {
        assert!(
            matches!(EnvConfig::from_toml_str(bad), Err(Error::Config(_))),
            "accepted {bad:?}"
        );
    }
}

#[test]
fn test_config_load() {
    use tempfile::TempDir;

    let temp_dir = TempDir::new().unwrap();
    let path = temp_dir.path().join("member.toml");
    std::fs::write(&path, "member_id = 1\nmembers = [1, 2]\n").unwrap();
    let config = EnvConfig::load(&path).unwrap();
    assert_eq!(config.members, vec![1, 2]);
    assert!(EnvConfig::load(temp_dir.path().join("missing.toml")).is_err());
}

#[test]
fn test_ensemble_policy() {
    let policy = EnsemblePolicy {
        initial: 5,
        backoff: Duration::from_millis(1),
        max_attempts: None,
    };
    assert_eq!(policy.schedule(6), vec![5, 4, 3, 2, 2, 2]);
    assert!(policy.may_retry(1_000));

    let policy = EnsemblePolicy {
        initial: 1,
        backoff: Duration::from_millis(1),
        max_attempts: Some(2),
    };
    assert_eq!(policy.schedule(3), vec![1, 1, 1]);
    assert!(policy.may_retry(1));
    assert!(!policy.may_retry(2));

    assert_eq!(EnsembleSpec::for_size(3).write_quorum, 2);
    assert_eq!(EnsembleSpec::for_size(2).ack_quorum, 2);
    assert_eq!(EnsembleSpec::for_size(1).ack_quorum, 1);
}

#[test]
fn test_paths_layout() {
    let paths = Paths::new("/ledgerkv/");
    let id = crate::KeyspaceId::from_name("coldb");
    assert_eq!(paths.root(), "/ledgerkv");
    assert_eq!(paths.keyspace(id), "/ledgerkv/dbmap/25CF3A7C");
    assert_eq!(paths.election(), "/ledgerkv/election");
    assert_eq!(paths.log(2), "/ledgerkv/log/2");
    assert_eq!(paths.cursor(2), "/ledgerkv/log/removed/2");
    assert_eq!(paths.skeleton(&[1, 2]).len(), 9);
    assert_eq!(paths.gc_mark(), "/ledgerkv/log/collected");
}
