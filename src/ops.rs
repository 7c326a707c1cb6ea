use crate::engine::BatchOp;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

pub type Table = BTreeMap<Vec<u8>, Vec<u8>>;

/// Atomic store operations - lowest level instructions that mutate Tables
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum StoreOp {
    /// Create an empty table unless it exists
    CreateTable(String),

    /// Remove a table with all its keys
    DropTable(String),

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

impl From<BatchOp> for StoreOp {
    fn from(op: BatchOp) -> Self {
        match op {
            BatchOp::Put { table, key, value } => StoreOp::Put { table, key, value },
            BatchOp::Delete { table, key } => StoreOp::Delete { table, key },
        }
    }
}

/// Core state: every named table of the local store
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Tables {
    tables: BTreeMap<String, Table>,
}

impl Tables {
    pub fn new() -> Self {
        Self::default()
    }

    /// Writes into a table that does not exist are noops: the table was
    /// dropped after the write was staged.
    pub fn is_noop(&self, op: &StoreOp) -> bool {
        match op {
            StoreOp::CreateTable(name) => self.tables.contains_key(name),
            StoreOp::DropTable(name) => !self.tables.contains_key(name),
            StoreOp::Put { table, key, value } => match self.tables.get(table) {
                Some(t) => t.get(key) == Some(value),
                None => true,
            },
            StoreOp::Delete { table, key } => match self.tables.get(table) {
                Some(t) => !t.contains_key(key),
                None => true,
            },
        }
    }

    /// Execute a store operation - the only way to mutate Tables
    pub fn execute(&mut self, op: StoreOp) {
        match op {
            StoreOp::CreateTable(name) => {
                self.tables.entry(name).or_default();
            }
            StoreOp::DropTable(name) => {
                self.tables.remove(&name);
            }
            StoreOp::Put { table, key, value } => {
                if let Some(t) = self.tables.get_mut(&table) {
                    t.insert(key, value);
                }
            }
            StoreOp::Delete { table, key } => {
                if let Some(t) = self.tables.get_mut(&table) {
                    t.remove(&key);
                }
            }
        }
    }

    pub fn get(&self, table: &str, key: &[u8]) -> Option<&Vec<u8>> {
        self.tables.get(table)?.get(key)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tables.contains_key(name)
    }

    pub fn n_tables(&self) -> usize {
        self.tables.len()
    }

    pub fn n_keys(&self) -> usize {
        self.tables.values().map(|t| t.len()).sum()
    }
}
