//! Applies published ledgers to the local engine.
//!
//! Every member, the leader included, walks its own log list from its cursor.
//! A ledger becomes one local write batch; the cursor moves only after that
//! batch committed, so a crash replays the ledger again. Replaying is safe
//! because puts and deletes are idempotent.

use std::collections::HashMap;
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info, trace, warn};

use crate::coord::Coordinator;
use crate::engine::{LocalEngine, WriteBatch};
use crate::env::Shared;
use crate::error::{Error, Result};
use crate::ledger::LedgerService;
use crate::record::OpRecord;
use crate::types::{KeyspaceId, LedgerId};

/// Outcome of one replay cycle.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CycleReport {
    /// Skipped because the coordination service is unreachable.
    pub paused: bool,
    /// Ledgers applied, in list order.
    pub applied: Vec<LedgerId>,
    /// Records written to the local engine.
    pub records: usize,
    /// Undecodable records and records of unknown keyspaces.
    pub skipped: usize,
    /// Ledger that could not be read; retried next cycle.
    pub stalled_at: Option<LedgerId>,
    /// Ledgers deleted by garbage collection.
    pub collected: Vec<LedgerId>,
}

pub struct ReplayLoop<C, L, E> {
    shared: Arc<Shared<C, L, E>>,
    cycles: u64,
}

impl<C, L, E> ReplayLoop<C, L, E>
where
    C: Coordinator,
    L: LedgerService,
    E: LocalEngine,
{
    pub(crate) fn new(shared: Arc<Shared<C, L, E>>) -> Self {
        Self { shared, cycles: 0 }
    }

    pub fn cycles(&self) -> u64 {
        self.cycles
    }

    /// Apply every ledger after this member's cursor, stopping at the first
    /// one that cannot be read.
    #[tracing::instrument(skip(self), fields(member = self.shared.member(), cycle = self.cycles + 1))]
    pub async fn run_once(&mut self) -> Result<CycleReport> {
        self.cycles += 1;
        let mut report = CycleReport::default();

        let connected = self.shared.coord.connection_state().borrow().is_connected();
        if !connected {
            debug!("Coordination service unreachable, replay paused");
            report.paused = true;
            return Ok(report);
        }

        let member = self.shared.member();
        let cursor = self.shared.log_index.cursor(member).await?;
        let pending = self.shared.log_index.list_from(member, cursor).await?;
        if !pending.is_empty() {
            debug!(?cursor, pending = pending.len(), "Replaying ledgers");
        }

        let mut names = HashMap::new();
        for ledger_id in pending {
            let batch = match self.read_ledger(ledger_id, &mut names, &mut report).await {
                Ok(batch) => batch,
                Err(e) => {
                    warn!(ledger_id, "Failed to read ledger, retrying next cycle: {e}");
                    report.stalled_at = Some(ledger_id);
                    break;
                }
            };
            report.records += batch.len();
            self.shared.engine.commit(batch)?;
            self.shared.log_index.advance_cursor(member, ledger_id).await?;
            report.applied.push(ledger_id);
        }

        let gc_every = self.shared.config.replay.gc_every;
        if gc_every > 0 && self.cycles % gc_every == 0 && self.shared.is_leader() {
            match self.collect_garbage().await {
                Ok(collected) => report.collected = collected,
                Err(e) => warn!("Garbage collection failed: {e}"),
            }
        }

        Ok(report)
    }

    /// Build the local batch for one ledger. Keyspace names resolved during
    /// this cycle are cached in `names`.
    async fn read_ledger(
        &self,
        ledger_id: LedgerId,
        names: &mut HashMap<KeyspaceId, Option<String>>,
        report: &mut CycleReport,
    ) -> Result<WriteBatch> {
        let meta = self
            .shared
            .ledgers
            .open(ledger_id, self.shared.config.digest())
            .await?;
        let entries = self.shared.ledgers.read(ledger_id, 0).await?;
        trace!(ledger_id, confirmed = meta.confirmed, entries = entries.len(), "Read ledger");

        let mut batch = WriteBatch::new();
        for (entry, bytes) in entries.into_iter().enumerate() {
            let op = match OpRecord::decode(&bytes) {
                Ok(op) => op,
                Err(e) => {
                    error!(ledger_id, entry, "Skipping undecodable record: {e}");
                    report.skipped += 1;
                    continue;
                }
            };
            let table = match names.get(&op.keyspace) {
                Some(name) => name.clone(),
                None => {
                    let name = self.resolve_keyspace(op.keyspace).await?;
                    names.insert(op.keyspace, name.clone());
                    name
                }
            };
            let Some(table) = table else {
                trace!(ledger_id, entry, keyspace = %op.keyspace, "Skipping record of unknown keyspace");
                report.skipped += 1;
                continue;
            };
            trace!(ledger_id, entry, ?op, "Applying record");
            match op.value {
                Some(value) => batch.put(&table, op.key, value),
                None => batch.delete(&table, op.key),
            }
        }
        Ok(batch)
    }

    /// Name of a live keyspace, opening its local table on first sight.
    async fn resolve_keyspace(&self, id: KeyspaceId) -> Result<Option<String>> {
        let Some(marker) = self.shared.coord.get(&self.shared.paths.keyspace(id)).await? else {
            return Ok(None);
        };
        let name = String::from_utf8(marker.data)
            .map_err(|_| Error::MalformedRecord("keyspace marker is not utf-8"))?;
        if !self.shared.engine.has_table(&name) {
            self.shared.engine.open_table(&name)?;
            debug!(keyspace = %id, %name, "Opened table for replicated keyspace");
        }
        Ok(Some(name))
    }

    /// Delete ledgers every member has applied, resuming after the persisted
    /// mark of the previous sweep. Returns the ids removed now.
    pub async fn collect_garbage(&self) -> Result<Vec<LedgerId>> {
        let log_index = &self.shared.log_index;
        let candidates = log_index.collectible(&self.shared.config.members).await?;
        let start = match log_index.gc_mark().await? {
            Some(mark) => candidates
                .iter()
                .position(|&id| id == mark)
                .map_or(0, |pos| pos + 1),
            None => 0,
        };

        let mut collected = Vec::new();
        let mut swept = None;
        for &ledger_id in &candidates[start..] {
            match self.shared.ledgers.delete(ledger_id).await {
                Ok(()) => collected.push(ledger_id),
                Err(Error::NoSuchLedger(_)) => {}
                Err(e) => {
                    warn!(ledger_id, "Failed to collect ledger, retrying next sweep: {e}");
                    break;
                }
            }
            swept = Some(ledger_id);
        }
        if let Some(ledger_id) = swept {
            log_index.set_gc_mark(ledger_id).await?;
        }
        if !collected.is_empty() {
            info!(member = self.shared.member(), ?collected, "Collected applied ledgers");
        }
        Ok(collected)
    }

    /// Run cycles on the configured interval until the handle stops it.
    pub fn spawn(self) -> ReplayHandle {
        let (shutdown, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(self.run(shutdown_rx));
        ReplayHandle {
            shutdown,
            task: Some(task),
        }
    }

    async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = interval(self.shared.config.replay.interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = shutdown.changed() => break,
            }
            match self.run_once().await {
                Ok(report) if !report.applied.is_empty() => {
                    debug!(applied = ?report.applied, records = report.records, "Replay cycle done");
                }
                Ok(_) => {}
                Err(e) => warn!(member = self.shared.member(), "Replay cycle failed: {e}"),
            }
        }
        debug!(member = self.shared.member(), "Replay loop stopped");
    }
}

pub struct ReplayHandle {
    shutdown: watch::Sender<bool>,
    task: Option<JoinHandle<()>>,
}

impl ReplayHandle {
    pub async fn stop(mut self) {
        let _ = self.shutdown.send(true);
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                warn!("Replay task failed: {e}");
            }
        }
    }
}

impl Drop for ReplayHandle {
    fn drop(&mut self) {
        let _ = self.shutdown.send(true);
    }
}
