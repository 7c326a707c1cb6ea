//! In-process coordination and ledger services.
//!
//! Deterministic stand-ins for the external services: one [`MemoryCluster`]
//! hands out a [`MemoryCoordinator`] per member, all sharing the same nodes
//! and election, and one [`MemoryLedgerService`] is cloned to every member.
//! Both expose knobs to inject the failures the replication layer must
//! survive.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::{watch, Notify};
use tracing::{debug, trace};

use crate::coord::Coordinator;
use crate::error::{Error, Result};
use crate::ledger::LedgerService;
use crate::types::{ConnectionState, LedgerId, LedgerMetadata, MemberId, Version, Versioned};

#[derive(Default)]
struct ClusterState {
    nodes: BTreeMap<String, Versioned>,
    /// Election path -> current holder
    elections: HashMap<String, MemberId>,
    /// Paths whose next conditional write is rejected, for conflict injection.
    conflicts: HashMap<String, usize>,
}

struct ClusterShared {
    state: Mutex<ClusterState>,
    released: Notify,
}

/// Shared node store and election of one simulated coordination ensemble.
#[derive(Clone)]
pub struct MemoryCluster {
    shared: Arc<ClusterShared>,
}

impl Default for MemoryCluster {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryCluster {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(ClusterShared {
                state: Mutex::new(ClusterState::default()),
                released: Notify::new(),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, ClusterState> {
        self.shared.state.lock().expect("Failed to lock cluster state")
    }

    /// A connected client session for `member`.
    pub fn client(&self, member: MemberId) -> MemoryCoordinator {
        let (conn, _) = watch::channel(ConnectionState::Connected);
        MemoryCoordinator {
            cluster: self.clone(),
            member,
            conn,
        }
    }

    /// Raw node data, for inspection.
    pub fn node(&self, path: &str) -> Option<Versioned> {
        self.lock().nodes.get(path).cloned()
    }

    /// Member currently holding the election at `path`.
    pub fn holder(&self, path: &str) -> Option<MemberId> {
        self.lock().elections.get(path).copied()
    }

    /// Reject the next `times` conditional writes to `path` as if another
    /// writer had raced ahead.
    pub fn inject_conflicts(&self, path: &str, times: usize) {
        self.lock().conflicts.insert(path.to_string(), times);
    }
}

/// One member's session with a [`MemoryCluster`].
pub struct MemoryCoordinator {
    cluster: MemoryCluster,
    member: MemberId,
    conn: watch::Sender<ConnectionState>,
}

impl MemoryCoordinator {
    pub fn member(&self) -> MemberId {
        self.member
    }

    pub fn cluster(&self) -> &MemoryCluster {
        &self.cluster
    }

    /// Simulate a connectivity change of this session.
    pub fn set_connection_state(&self, state: ConnectionState) {
        debug!(member = self.member, ?state, "Connection state changed");
        self.conn.send_replace(state);
    }

    fn ensure_connected(&self) -> Result<()> {
        if self.conn.borrow().is_connected() {
            Ok(())
        } else {
            Err(Error::ConnectivityLoss)
        }
    }

    fn create(&self, path: &str, data: Vec<u8>) -> Result<()> {
        self.ensure_connected()?;
        self.cluster
            .lock()
            .nodes
            .entry(path.to_string())
            .or_insert(Versioned { data, version: 0 });
        Ok(())
    }
}

impl Coordinator for MemoryCoordinator {
    async fn create_if_absent(&self, path: &str) -> Result<()> {
        self.create(path, Vec::new())
    }

    async fn create_with(&self, path: &str, data: Vec<u8>) -> Result<()> {
        self.create(path, data)
    }

    async fn get(&self, path: &str) -> Result<Option<Versioned>> {
        self.ensure_connected()?;
        Ok(self.cluster.lock().nodes.get(path).cloned())
    }

    async fn set(&self, path: &str, data: Vec<u8>, expected: Version) -> Result<Version> {
        self.ensure_connected()?;
        let mut state = self.cluster.lock();
        if let Some(remaining) = state.conflicts.get_mut(path) {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(Error::VersionConflict {
                    path: path.to_string(),
                    expected,
                });
            }
        }
        let node = state
            .nodes
            .get_mut(path)
            .ok_or_else(|| Error::NoSuchNode(path.to_string()))?;
        if node.version != expected {
            return Err(Error::VersionConflict {
                path: path.to_string(),
                expected,
            });
        }
        node.data = data;
        node.version += 1;
        trace!(path, version = node.version, "Node written");
        Ok(node.version)
    }

    async fn delete(&self, path: &str) -> Result<()> {
        self.ensure_connected()?;
        self.cluster
            .lock()
            .nodes
            .remove(path)
            .map(|_| ())
            .ok_or_else(|| Error::NoSuchNode(path.to_string()))
    }

    async fn campaign(&self, path: &str, member: MemberId) -> Result<()> {
        loop {
            let notified = self.cluster.shared.released.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            {
                self.ensure_connected()?;
                let mut state = self.cluster.lock();
                match state.elections.get(path) {
                    None => {
                        state.elections.insert(path.to_string(), member);
                        debug!(path, member, "Election granted");
                        return Ok(());
                    }
                    Some(&holder) if holder == member => return Ok(()),
                    Some(_) => {}
                }
            }
            notified.await;
        }
    }

    async fn resign(&self, path: &str, member: MemberId) -> Result<()> {
        {
            let mut state = self.cluster.lock();
            if state.elections.get(path) == Some(&member) {
                state.elections.remove(path);
                debug!(path, member, "Election released");
            }
        }
        self.cluster.shared.released.notify_waiters();
        Ok(())
    }

    fn connection_state(&self) -> watch::Receiver<ConnectionState> {
        self.conn.subscribe()
    }
}

#[derive(Debug, Clone)]
struct StoredLedger {
    ensemble_size: usize,
    write_quorum: usize,
    ack_quorum: usize,
    digest: Vec<u8>,
    entries: Vec<Vec<u8>>,
    closed: bool,
}

struct LedgerState {
    next_id: LedgerId,
    preset_ids: VecDeque<LedgerId>,
    ledgers: HashMap<LedgerId, StoredLedger>,
    available_nodes: usize,
    /// Ensemble width of every creation request, in order.
    create_attempts: Vec<usize>,
    /// Ledgers whose open/read fail, simulating an unreachable ensemble.
    unreadable: HashSet<LedgerId>,
    deleted: Vec<LedgerId>,
    delete_attempts: Vec<LedgerId>,
}

/// In-process ledger service shared by every member.
#[derive(Clone)]
pub struct MemoryLedgerService {
    state: Arc<Mutex<LedgerState>>,
}

impl MemoryLedgerService {
    /// A service backed by `available_nodes` storage nodes.
    pub fn new(available_nodes: usize) -> Self {
        Self {
            state: Arc::new(Mutex::new(LedgerState {
                next_id: 1,
                preset_ids: VecDeque::new(),
                ledgers: HashMap::new(),
                available_nodes,
                create_attempts: Vec::new(),
                unreadable: HashSet::new(),
                deleted: Vec::new(),
                delete_attempts: Vec::new(),
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, LedgerState> {
        self.state.lock().expect("Failed to lock ledger state")
    }

    pub fn set_available_nodes(&self, n: usize) {
        self.lock().available_nodes = n;
    }

    /// Hand out these ids, in order, before resuming the counter.
    pub fn preset_ids(&self, ids: impl IntoIterator<Item = LedgerId>) {
        self.lock().preset_ids.extend(ids);
    }

    pub fn set_unreadable(&self, id: LedgerId, unreadable: bool) {
        let mut state = self.lock();
        if unreadable {
            state.unreadable.insert(id);
        } else {
            state.unreadable.remove(&id);
        }
    }

    pub fn create_attempts(&self) -> Vec<usize> {
        self.lock().create_attempts.clone()
    }

    pub fn deleted(&self) -> Vec<LedgerId> {
        self.lock().deleted.clone()
    }

    /// Every id passed to `delete`, including ids already gone.
    pub fn delete_attempts(&self) -> Vec<LedgerId> {
        self.lock().delete_attempts.clone()
    }

    pub fn exists(&self, id: LedgerId) -> bool {
        self.lock().ledgers.contains_key(&id)
    }

    pub fn metadata(&self, id: LedgerId) -> Option<LedgerMetadata> {
        self.lock().ledgers.get(&id).map(|l| metadata(id, l))
    }

    pub fn ledger_ids(&self) -> Vec<LedgerId> {
        let mut ids: Vec<_> = self.lock().ledgers.keys().copied().collect();
        ids.sort_unstable();
        ids
    }
}

fn metadata(id: LedgerId, ledger: &StoredLedger) -> LedgerMetadata {
    LedgerMetadata {
        id,
        ensemble_size: ledger.ensemble_size,
        write_quorum: ledger.write_quorum,
        ack_quorum: ledger.ack_quorum,
        confirmed: ledger.entries.len() as u64,
        closed: ledger.closed,
    }
}

impl LedgerService for MemoryLedgerService {
    async fn create(
        &self,
        ensemble_size: usize,
        write_quorum: usize,
        ack_quorum: usize,
        digest: &[u8],
    ) -> Result<LedgerId> {
        let mut state = self.lock();
        state.create_attempts.push(ensemble_size);
        if ensemble_size == 0 || ack_quorum > write_quorum || write_quorum > ensemble_size {
            return Err(Error::InvalidQuorum {
                ensemble: ensemble_size,
                write_quorum,
                ack_quorum,
            });
        }
        if ensemble_size > state.available_nodes {
            return Err(Error::InsufficientEnsemble {
                requested: ensemble_size,
                available: state.available_nodes,
            });
        }
        let id = match state.preset_ids.pop_front() {
            Some(id) => id,
            None => {
                let id = state.next_id;
                state.next_id += 1;
                id
            }
        };
        state.ledgers.insert(
            id,
            StoredLedger {
                ensemble_size,
                write_quorum,
                ack_quorum,
                digest: digest.to_vec(),
                entries: Vec::new(),
                closed: false,
            },
        );
        debug!(id, ensemble_size, write_quorum, ack_quorum, "Ledger created");
        Ok(id)
    }

    async fn append(&self, id: LedgerId, record: Vec<u8>) -> Result<u64> {
        let mut state = self.lock();
        let ledger = state.ledgers.get_mut(&id).ok_or(Error::NoSuchLedger(id))?;
        if ledger.closed {
            return Err(Error::LedgerClosed(id));
        }
        ledger.entries.push(record);
        Ok(ledger.entries.len() as u64 - 1)
    }

    async fn open(&self, id: LedgerId, digest: &[u8]) -> Result<LedgerMetadata> {
        let state = self.lock();
        if state.unreadable.contains(&id) {
            return Err(Error::NoSuchLedger(id));
        }
        let ledger = state.ledgers.get(&id).ok_or(Error::NoSuchLedger(id))?;
        if ledger.digest != digest {
            return Err(Error::DigestMismatch(id));
        }
        Ok(metadata(id, ledger))
    }

    async fn read(&self, id: LedgerId, from: u64) -> Result<Vec<Vec<u8>>> {
        let state = self.lock();
        if state.unreadable.contains(&id) {
            return Err(Error::NoSuchLedger(id));
        }
        let ledger = state.ledgers.get(&id).ok_or(Error::NoSuchLedger(id))?;
        let from = (from as usize).min(ledger.entries.len());
        Ok(ledger.entries[from..].to_vec())
    }

    async fn close(&self, id: LedgerId) -> Result<()> {
        let mut state = self.lock();
        let ledger = state.ledgers.get_mut(&id).ok_or(Error::NoSuchLedger(id))?;
        ledger.closed = true;
        Ok(())
    }

    async fn delete(&self, id: LedgerId) -> Result<()> {
        let mut state = self.lock();
        state.delete_attempts.push(id);
        state.ledgers.remove(&id).ok_or(Error::NoSuchLedger(id))?;
        state.deleted.push(id);
        debug!(id, "Ledger deleted");
        Ok(())
    }
}
