//! Embedded local engine backing each member's replicated view.
//!
//! Tables live in memory behind a copy-on-write `Arc`, so a snapshot is one
//! pointer clone and stays frozen while later batches commit. With a data
//! directory every committed batch is first written to the WAL, and the full
//! table set is periodically persisted as a snapshot file (which resets the
//! WAL).

use crate::engine::{EngineSnapshot, LocalEngine, WriteBatch};
use crate::error::Error;
use crate::ops::{StoreOp, Tables};
use crate::types::MemberId;
use crate::wal::WriteAheadLog;
use anyhow::{anyhow, bail, Context, Result};
use fs_err::{self as fs, File, OpenOptions};
use serde::{Deserialize, Serialize};
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::{debug, info, trace};

/// WAL batches after which the store compacts into a snapshot file.
const DEFAULT_SNAPSHOT_EVERY: u64 = 1000;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreStatus {
    pub member: MemberId,
    pub n_tables: usize,
    pub n_keys: usize,
    pub dirty: bool,
    pub wal: bool,
    pub batches_since_snapshot: u64,
}

pub struct StoreState {
    pub member: MemberId,

    tables: Arc<Tables>,

    wal: Option<WriteAheadLog>,

    snapshot_path: Option<PathBuf>,

    snapshot_every: u64,

    batches_since_snapshot: u64,

    /// Tracks whether state has unpersisted changes
    dirty: bool,
}

#[derive(Debug, Serialize, Deserialize)]
struct SnapshotFile {
    magic: [u8; 4],
    version: u32,
    member: MemberId,
    tables: Tables,
}

impl SnapshotFile {
    const VERSION: u32 = 1;
    const MAGIC: [u8; 4] = *b"LKVS";

    fn from_state(state: &StoreState) -> Self {
        Self {
            magic: Self::MAGIC,
            version: Self::VERSION,
            member: state.member,
            tables: (*state.tables).clone(),
        }
    }

    fn validate(&self, expected_member: MemberId) -> Result<()> {
        if self.magic != Self::MAGIC {
            bail!("Invalid snapshot magic header");
        }
        if self.version != Self::VERSION {
            bail!(
                "Unsupported snapshot version: expected {}, found {}",
                Self::VERSION,
                self.version
            );
        }
        if self.member != expected_member {
            bail!(
                "Snapshot member mismatch: expected {}, found {}",
                expected_member,
                self.member
            );
        }
        Ok(())
    }
}

impl StoreState {
    fn snapshot_path(&self) -> Result<&Path> {
        self.snapshot_path
            .as_deref()
            .ok_or_else(|| anyhow!("Snapshot path not configured"))
    }

    fn load_snapshot_if_exists(&mut self) -> Result<bool> {
        let Some(path) = self.snapshot_path.clone() else {
            return Ok(false);
        };

        if !path.exists() {
            return Ok(false);
        }

        let mut reader = BufReader::new(File::open(&path)?);
        let mut buf = Vec::new();
        reader.read_to_end(&mut buf)?;
        let (snapshot, _): (SnapshotFile, _) =
            bincode::serde::decode_from_slice(&buf, bincode::config::standard())
                .context("Failed to deserialize snapshot")?;
        snapshot.validate(self.member)?;

        self.tables = Arc::new(snapshot.tables);
        self.dirty = false;
        Ok(true)
    }

    pub fn persist_to_disk(&mut self) -> Result<()> {
        let snapshot_path = self.snapshot_path()?.to_path_buf();
        if let Some(parent) = snapshot_path.parent() {
            fs::create_dir_all(parent)?;
        }

        let tmp_path = snapshot_path.with_extension("snapshot.tmp");
        let snapshot = SnapshotFile::from_state(self);
        let encoded = bincode::serde::encode_to_vec(&snapshot, bincode::config::standard())?;

        {
            let mut writer = BufWriter::new(
                OpenOptions::new()
                    .create(true)
                    .write(true)
                    .truncate(true)
                    .open(&tmp_path)?,
            );
            writer.write_all(&encoded)?;
            writer.flush()?;
            writer.get_ref().sync_all()?;
        }

        fs::rename(&tmp_path, &snapshot_path)?;

        if let Some(parent) = snapshot_path.parent() {
            if let Ok(dir_file) = File::open(parent) {
                let _ = dir_file.sync_all();
            }
        }

        if let Some(wal) = self.wal.as_mut() {
            wal.reset()?;
        }

        info!("Persisted snapshot to {:?}", snapshot_path);
        self.batches_since_snapshot = 0;
        self.dirty = false;
        Ok(())
    }

    /// Commit one local transaction: WAL first, then memory.
    /// This is the ONLY method that mutates tables.
    fn execute_ops(&mut self, ops: Vec<StoreOp>) -> Result<()> {
        self.execute_ops_impl(ops, true)
    }

    /// Execute ops during recovery (no WAL writing)
    fn replay_ops(&mut self, ops: Vec<StoreOp>) -> Result<()> {
        self.execute_ops_impl(ops, false)
    }

    fn execute_ops_impl(&mut self, ops: Vec<StoreOp>, write_to_wal: bool) -> Result<()> {
        // Each op alone leaving the tables untouched means the batch does too.
        if ops.iter().all(|op| self.tables.is_noop(op)) {
            trace!("Skipping noop batch: {ops:?}");
            return Ok(());
        }

        if write_to_wal {
            if let Some(wal) = self.wal.as_mut() {
                wal.write_batch(&ops)?;
                self.batches_since_snapshot += 1;
            }
        }

        let tables = Arc::make_mut(&mut self.tables);
        for op in ops {
            tables.execute(op);
        }
        self.dirty = true;

        if write_to_wal && self.wal.is_some() && self.batches_since_snapshot >= self.snapshot_every
        {
            debug!(
                batches = self.batches_since_snapshot,
                "Compacting WAL into snapshot"
            );
            self.persist_to_disk()?;
        }
        Ok(())
    }

    fn persist_if_dirty(&mut self) -> Result<bool> {
        if !self.dirty {
            return Ok(false);
        }
        self.persist_to_disk()?;
        Ok(true)
    }

    pub fn tables(&self) -> &Tables {
        &self.tables
    }

    pub fn status(&self) -> StoreStatus {
        StoreStatus {
            member: self.member,
            n_tables: self.tables.n_tables(),
            n_keys: self.tables.n_keys(),
            dirty: self.dirty,
            wal: self.wal.is_some(),
            batches_since_snapshot: self.batches_since_snapshot,
        }
    }
}

/// Local key-value engine with named tables.
#[derive(Clone)]
pub struct LocalStore {
    state: Arc<RwLock<StoreState>>,
}

impl LocalStore {
    /// In-memory store without persistence
    pub fn new(member: MemberId) -> Self {
        let state = StoreState {
            member,
            tables: Arc::new(Tables::new()),
            wal: None,
            snapshot_path: None,
            snapshot_every: DEFAULT_SNAPSHOT_EVERY,
            batches_since_snapshot: 0,
            dirty: false,
        };

        Self {
            state: Arc::new(RwLock::new(state)),
        }
    }

    /// Open a store persisted under `data_dir`, recovering snapshot and WAL
    pub fn open<P: Into<PathBuf>>(member: MemberId, data_dir: P) -> Result<Self> {
        let data_dir = data_dir.into();
        let wal_path = data_dir.join(format!("member_{member}.wal"));
        let snapshot_path = data_dir.join(format!("member_{member}.snapshot"));

        fs::create_dir_all(&data_dir)?;

        let wal = WriteAheadLog::new(&wal_path, member)?;
        let pending = wal.read_all_batches()?;

        let mut state = StoreState {
            member,
            tables: Arc::new(Tables::new()),
            wal: Some(wal),
            snapshot_path: Some(snapshot_path.clone()),
            snapshot_every: DEFAULT_SNAPSHOT_EVERY,
            batches_since_snapshot: 0,
            dirty: false,
        };

        if state.load_snapshot_if_exists()? {
            info!("Loaded snapshot from {}", snapshot_path.display());
        }

        if !pending.is_empty() {
            info!("Recovering {} batches from WAL", pending.len());
            state.batches_since_snapshot = pending.len() as u64;
            for batch in pending {
                state.replay_ops(batch)?;
            }
            info!("Store status after recovery: {:#?}", state.status());
        }

        info!(
            "Persistence enabled: WAL={:?}, snapshot={:?}",
            wal_path, snapshot_path
        );
        Ok(Self {
            state: Arc::new(RwLock::new(state)),
        })
    }

    /// Compact into a snapshot after this many WAL batches.
    pub fn with_snapshot_every(self, batches: u64) -> Self {
        self.write().snapshot_every = batches.max(1);
        self
    }

    pub fn write(&self) -> RwLockWriteGuard<'_, StoreState> {
        self.state.write().expect("Failed to lock store state")
    }

    pub fn read(&self) -> RwLockReadGuard<'_, StoreState> {
        self.state.read().expect("Failed to lock store state")
    }

    pub fn persist_if_dirty(&self) -> Result<bool> {
        let mut state = self.write();
        if state.snapshot_path.is_none() {
            return Ok(false);
        }
        state.persist_if_dirty()
    }

    pub fn status(&self) -> StoreStatus {
        self.read().status()
    }
}

/// Frozen view of the tables at the moment it was taken.
#[derive(Clone)]
pub struct StoreSnapshot {
    tables: Arc<Tables>,
}

impl EngineSnapshot for StoreSnapshot {
    fn get(&self, table: &str, key: &[u8]) -> crate::Result<Option<Vec<u8>>> {
        Ok(self.tables.get(table, key).cloned())
    }
}

impl LocalEngine for LocalStore {
    type Snapshot = StoreSnapshot;

    fn open_table(&self, name: &str) -> crate::Result<()> {
        self.write()
            .execute_ops(vec![StoreOp::CreateTable(name.to_string())])
            .map_err(Error::engine)
    }

    fn drop_table(&self, name: &str) -> crate::Result<()> {
        self.write()
            .execute_ops(vec![StoreOp::DropTable(name.to_string())])
            .map_err(Error::engine)
    }

    fn has_table(&self, name: &str) -> bool {
        self.read().tables.contains(name)
    }

    fn get(&self, table: &str, key: &[u8]) -> crate::Result<Option<Vec<u8>>> {
        Ok(self.read().tables.get(table, key).cloned())
    }

    fn snapshot(&self) -> StoreSnapshot {
        StoreSnapshot {
            tables: self.read().tables.clone(),
        }
    }

    fn commit(&self, batch: WriteBatch) -> crate::Result<()> {
        let ops = batch.into_ops().into_iter().map(StoreOp::from).collect();
        self.write().execute_ops(ops).map_err(Error::engine)
    }

    fn flush(&self) -> crate::Result<()> {
        self.persist_if_dirty().map(|_| ()).map_err(Error::engine)
    }
}
