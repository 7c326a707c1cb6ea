//! Local engine boundary.

use crate::error::Result;

/// A point-in-time read view of the local engine.
pub trait EngineSnapshot: Send + Sync {
    fn get(&self, table: &str, key: &[u8]) -> Result<Option<Vec<u8>>>;
}

/// Embedded ordered key-value engine with named tables, snapshot reads and
/// atomic local write transactions.
pub trait LocalEngine: Send + Sync + 'static {
    type Snapshot: EngineSnapshot;

    /// Open `name`, creating it if needed.
    fn open_table(&self, name: &str) -> Result<()>;

    /// Drop `name` and everything in it. Dropping a missing table is a no-op.
    fn drop_table(&self, name: &str) -> Result<()>;

    fn has_table(&self, name: &str) -> bool;

    fn get(&self, table: &str, key: &[u8]) -> Result<Option<Vec<u8>>>;

    fn snapshot(&self) -> Self::Snapshot;

    /// Apply every operation of `batch` atomically.
    fn commit(&self, batch: WriteBatch) -> Result<()>;

    /// Make everything committed so far durable, e.g. on close.
    fn flush(&self) -> Result<()> {
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BatchOp {
    Put {
        table: String,
        key: Vec<u8>,
        value: Vec<u8>,
    },
    Delete {
        table: String,
        key: Vec<u8>,
    },
}

/// A local write transaction. Committed through [`LocalEngine::commit`];
/// dropping it uncommitted aborts it.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WriteBatch {
    ops: Vec<BatchOp>,
}

impl WriteBatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&mut self, table: &str, key: Vec<u8>, value: Vec<u8>) {
        self.ops.push(BatchOp::Put {
            table: table.to_string(),
            key,
            value,
        });
    }

    pub fn delete(&mut self, table: &str, key: Vec<u8>) {
        self.ops.push(BatchOp::Delete {
            table: table.to_string(),
            key,
        });
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub fn into_ops(self) -> Vec<BatchOp> {
        self.ops
    }
}
