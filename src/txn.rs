//! Read and write transactions.
//!
//! A write transaction is one ledger: records are appended to it as they are
//! added, and committing closes it and publishes its id to every member's log
//! list. Nothing touches a local engine until replay applies the ledger.

use std::future::Future;
use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::coord::Coordinator;
use crate::engine::{EngineSnapshot, LocalEngine};
use crate::env::Shared;
use crate::error::{Error, Result};
use crate::ledger::LedgerService;
use crate::retry::EnsembleSpec;
use crate::types::{LedgerId, MemberId};

pub trait Transaction: Send {
    fn is_read_only(&self) -> bool;

    fn commit(&mut self) -> impl Future<Output = Result<()>> + Send;

    /// Discard the transaction. Cleanup failures are logged, never returned.
    fn abort(&mut self) -> impl Future<Output = Result<()>> + Send;

    /// Release the transaction; an uncommitted one is aborted.
    fn close(&mut self) -> impl Future<Output = Result<()>> + Send;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxnState {
    Open,
    Committed,
    Aborted,
}

/// Point-in-time view of the local engine.
pub struct ReadTransaction<S> {
    snapshot: Option<S>,
}

impl<S: EngineSnapshot> ReadTransaction<S> {
    pub fn new(snapshot: S) -> Self {
        Self {
            snapshot: Some(snapshot),
        }
    }

    pub fn get(&self, table: &str, key: &[u8]) -> Result<Option<Vec<u8>>> {
        self.snapshot
            .as_ref()
            .ok_or(Error::TransactionClosed)?
            .get(table, key)
    }

    pub fn is_open(&self) -> bool {
        self.snapshot.is_some()
    }
}

impl<S: EngineSnapshot> Transaction for ReadTransaction<S> {
    fn is_read_only(&self) -> bool {
        true
    }

    async fn commit(&mut self) -> Result<()> {
        self.snapshot = None;
        Ok(())
    }

    async fn abort(&mut self) -> Result<()> {
        self.snapshot = None;
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        self.snapshot = None;
        Ok(())
    }
}

/// A leader-only transaction backed by one freshly created ledger.
pub struct WriteTransaction<C: Coordinator, L: LedgerService, E: LocalEngine> {
    shared: Arc<Shared<C, L, E>>,
    ledger_id: LedgerId,
    ensemble: EnsembleSpec,
    entries: u64,
    state: TxnState,
}

impl<C, L, E> WriteTransaction<C, L, E>
where
    C: Coordinator,
    L: LedgerService,
    E: LocalEngine,
{
    /// Create the backing ledger, narrowing the ensemble while the ledger
    /// service reports too few nodes.
    pub(crate) async fn begin(shared: Arc<Shared<C, L, E>>) -> Result<Self> {
        if !shared.is_leader() {
            return Err(Error::NotLeader);
        }

        let member = shared.member();
        let policy = shared
            .config
            .retry
            .ensemble_policy(shared.config.cluster_size());
        let mut ensemble = policy.first();
        let mut attempts = 0u32;

        loop {
            let res = shared
                .ledgers
                .create(
                    ensemble.ensemble_size,
                    ensemble.write_quorum,
                    ensemble.ack_quorum,
                    shared.config.digest(),
                )
                .await;
            match res {
                Ok(ledger_id) => {
                    debug!(member, ledger_id, ?ensemble, "Opened write transaction");
                    return Ok(Self {
                        shared,
                        ledger_id,
                        ensemble,
                        entries: 0,
                        state: TxnState::Open,
                    });
                }
                Err(Error::InsufficientEnsemble {
                    requested,
                    available,
                }) => {
                    attempts += 1;
                    if !policy.may_retry(attempts) {
                        warn!(member, attempts, "Giving up on ledger creation");
                        return Err(Error::InsufficientEnsemble {
                            requested,
                            available,
                        });
                    }
                    let next = policy.degrade(ensemble.ensemble_size);
                    warn!(
                        member,
                        requested,
                        available,
                        next,
                        "Not enough ledger nodes, retrying in {:?}",
                        policy.backoff
                    );
                    tokio::time::sleep(policy.backoff).await;
                    if !shared.is_leader() {
                        return Err(Error::NotLeader);
                    }
                    ensemble = EnsembleSpec::for_size(next);
                }
                Err(e) => return Err(e),
            }
        }
    }

    pub fn ledger_id(&self) -> LedgerId {
        self.ledger_id
    }

    pub fn ensemble(&self) -> EnsembleSpec {
        self.ensemble
    }

    pub fn state(&self) -> TxnState {
        self.state
    }

    /// Records added so far.
    pub fn len(&self) -> u64 {
        self.entries
    }

    pub fn is_empty(&self) -> bool {
        self.entries == 0
    }

    fn ensure_open(&self) -> Result<()> {
        match self.state {
            TxnState::Open => Ok(()),
            _ => Err(Error::TransactionClosed),
        }
    }

    /// Append one encoded operation record to the ledger.
    pub async fn add(&mut self, record: Vec<u8>) -> Result<u64> {
        self.ensure_open()?;
        let entry = self.shared.ledgers.append(self.ledger_id, record).await?;
        self.entries += 1;
        Ok(entry)
    }

    #[tracing::instrument(skip(self), fields(member = self.shared.member(), ledger_id = self.ledger_id))]
    async fn publish(&mut self) -> Result<()> {
        self.ensure_open()?;
        if !self.shared.is_leader() {
            return Err(Error::NotLeader);
        }

        let _publishing = self.shared.commit_lock.lock().await;
        if !self.shared.is_leader() {
            return Err(Error::NotLeader);
        }

        self.shared.ledgers.close(self.ledger_id).await?;

        let timestamp = chrono::Utc::now().timestamp_millis();
        for &member in &self.shared.config.members {
            if let Err(e) = self.append_to_log(member, timestamp).await {
                warn!(member, "Failed to publish ledger, removing it: {e}");
                self.state = TxnState::Aborted;
                discard_ledger(self.shared.ledgers.as_ref(), self.ledger_id).await;
                return Err(Error::CommitFailure {
                    ledger_id: self.ledger_id,
                    source: Box::new(e),
                });
            }
        }

        self.state = TxnState::Committed;
        info!(entries = self.entries, "Committed ledger");
        Ok(())
    }

    async fn append_to_log(&self, member: MemberId, timestamp: i64) -> Result<()> {
        let attempts = self.shared.config.retry.cas_attempts.max(1);
        let mut attempt = 1;
        loop {
            match self
                .shared
                .log_index
                .append(member, self.ledger_id, timestamp)
                .await
            {
                Err(e) if e.is_version_conflict() && attempt < attempts => {
                    debug!(member, attempt, "Log list changed underneath us, retrying");
                    attempt += 1;
                }
                res => return res,
            }
        }
    }

    async fn discard(&mut self) {
        if self.state != TxnState::Open {
            return;
        }
        self.state = TxnState::Aborted;
        discard_ledger(self.shared.ledgers.as_ref(), self.ledger_id).await;
        debug!(ledger_id = self.ledger_id, "Aborted write transaction");
    }
}

impl<C, L, E> Transaction for WriteTransaction<C, L, E>
where
    C: Coordinator,
    L: LedgerService,
    E: LocalEngine,
{
    fn is_read_only(&self) -> bool {
        false
    }

    async fn commit(&mut self) -> Result<()> {
        self.publish().await
    }

    async fn abort(&mut self) -> Result<()> {
        self.discard().await;
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        self.discard().await;
        Ok(())
    }
}

impl<C, L, E> Drop for WriteTransaction<C, L, E>
where
    C: Coordinator,
    L: LedgerService,
    E: LocalEngine,
{
    fn drop(&mut self) {
        if self.state != TxnState::Open {
            return;
        }
        self.state = TxnState::Aborted;
        let ledgers = self.shared.ledgers.clone();
        let ledger_id = self.ledger_id;
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move { discard_ledger(ledgers.as_ref(), ledger_id).await });
            }
            Err(_) => warn!(ledger_id, "Dropped open transaction outside a runtime, ledger leaked"),
        }
    }
}

/// Close and delete a ledger, logging instead of failing.
async fn discard_ledger<L: LedgerService>(ledgers: &L, ledger_id: LedgerId) {
    if let Err(e) = ledgers.close(ledger_id).await {
        debug!(ledger_id, "Failed to close ledger: {e}");
    }
    if let Err(e) = ledgers.delete(ledger_id).await {
        warn!(ledger_id, "Failed to delete ledger: {e}");
    }
}
