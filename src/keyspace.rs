use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::coord::Coordinator;
use crate::engine::LocalEngine;
use crate::env::Shared;
use crate::error::{Error, Result};
use crate::ledger::LedgerService;
use crate::record;
use crate::txn::{ReadTransaction, Transaction, WriteTransaction};
use crate::types::KeyspaceId;

/// A named table replicated through the shared log.
///
/// Writes are leader-only and land in the local table once replay applies
/// them; reads always come from this member's local table.
pub struct Keyspace<C, L, E> {
    shared: Arc<Shared<C, L, E>>,
    id: KeyspaceId,
    name: String,
}

impl<C, L, E> Keyspace<C, L, E>
where
    C: Coordinator,
    L: LedgerService,
    E: LocalEngine,
{
    pub(crate) async fn open(shared: Arc<Shared<C, L, E>>, name: &str) -> Result<Self> {
        let id = KeyspaceId::from_name(name);
        let path = shared.paths.keyspace(id);
        shared
            .coord
            .create_with(&path, name.as_bytes().to_vec())
            .await?;
        if let Some(marker) = shared.coord.get(&path).await? {
            if marker.data != name.as_bytes() {
                warn!(
                    keyspace = %id,
                    existing = %String::from_utf8_lossy(&marker.data),
                    "Keyspace id already registered under another name"
                );
            }
        }
        shared.engine.open_table(name)?;
        info!(member = shared.member(), keyspace = %id, name, "Opened keyspace");
        Ok(Self {
            shared,
            id,
            name: name.to_string(),
        })
    }

    pub fn id(&self) -> KeyspaceId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Read `key` from the local table.
    pub fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        self.get_in(&ReadTransaction::new(self.shared.engine.snapshot()), key)
    }

    pub fn get_in(&self, txn: &ReadTransaction<E::Snapshot>, key: &[u8]) -> Result<Option<Vec<u8>>> {
        txn.get(&self.name, key)
    }

    pub async fn put_in(
        &self,
        txn: &mut WriteTransaction<C, L, E>,
        key: &[u8],
        value: &[u8],
    ) -> Result<()> {
        let record = record::encode(self.id, key, Some(value))?;
        txn.add(record).await?;
        Ok(())
    }

    pub async fn delete_in(&self, txn: &mut WriteTransaction<C, L, E>, key: &[u8]) -> Result<()> {
        let record = record::encode(self.id, key, None)?;
        txn.add(record).await?;
        Ok(())
    }

    /// Write `key` in a transaction of its own.
    pub async fn put(&self, key: &[u8], value: &[u8]) -> Result<()> {
        let record = record::encode(self.id, key, Some(value))?;
        self.write_one(record).await
    }

    /// Delete `key` in a transaction of its own.
    pub async fn delete(&self, key: &[u8]) -> Result<()> {
        let record = record::encode(self.id, key, None)?;
        self.write_one(record).await
    }

    async fn write_one(&self, record: Vec<u8>) -> Result<()> {
        let mut txn = WriteTransaction::begin(self.shared.clone()).await?;
        let res = match txn.add(record).await {
            Ok(_) => txn.commit().await,
            Err(e) => Err(e),
        };
        if res.is_err() {
            txn.abort().await?;
        }
        res
    }

    /// Remove the local table and the cluster-wide marker. Entries already
    /// in the log stay there and are skipped by replay.
    pub async fn drop(self) -> Result<()> {
        self.shared.engine.drop_table(&self.name)?;
        match self
            .shared
            .coord
            .delete(&self.shared.paths.keyspace(self.id))
            .await
        {
            Ok(()) | Err(Error::NoSuchNode(_)) => {}
            Err(e) => return Err(e),
        }
        info!(member = self.shared.member(), keyspace = %self.id, name = %self.name, "Dropped keyspace");
        Ok(())
    }

    pub fn close(self) {
        debug!(keyspace = %self.id, "Closed keyspace");
    }
}
