//! ledgerkv - An embeddable key-value store replicated through a shared ledger log
//!
//! Every cluster member keeps a full local copy of its keyspaces. One elected
//! leader turns each write transaction into a quorum-replicated ledger and
//! publishes the ledger id to every member's log list; each member then
//! replays its list, in order, into its own local engine.
//!
//! # Key Features
//!
//! - **Single writer**: Leadership is held through the coordination service and
//!   dropped the moment its connection degrades
//! - **Quorum-replicated log**: Each transaction is one ledger; ensembles narrow
//!   automatically when storage nodes are missing
//! - **Ordered replay**: A member applies ledgers in its own list order and
//!   resumes from a persisted cursor
//! - **Idempotent apply**: A ledger replayed twice yields the same state
//! - **Pluggable services**: Coordination, ledger storage and the local engine
//!   are traits; in-process implementations ship in [`memory`] and [`store`]
//!
//! # Quick Start
//!
//! ```rust
//! use std::time::Duration;
//! use ledgerkv::{Env, EnvConfig, LocalStore, MemoryCluster, MemoryLedgerService, Role};
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> ledgerkv::Result<()> {
//! let cluster = MemoryCluster::new();
//! let ledgers = MemoryLedgerService::new(3);
//! let mut config = EnvConfig::new(1, vec![1]);
//! config.replay.enabled = false;
//!
//! let env = Env::open(config, cluster.client(1), ledgers, LocalStore::new(1)).await?;
//! assert!(env.wait_for_role(Role::Leader, Duration::from_secs(5)).await);
//!
//! let db = env.open_keyspace("coldb").await?;
//! db.put(b"oi", b"hello").await?;
//! env.replayer().run_once().await?;
//! assert_eq!(db.get(b"oi")?, Some(b"hello".to_vec()));
//!
//! env.close().await?;
//! # Ok(())
//! # }
//! ```
//!
//! # Architecture
//!
//! The core types you'll work with:
//! - [`Env`] - One member's environment, owning every handle
//! - [`Keyspace`] - A named table replicated through the log
//! - [`WriteTransaction`] / [`ReadTransaction`] - Ledger-backed writes and
//!   snapshot reads
//! - [`LogIndex`] - Per-member log lists and replay cursors
//! - [`ReplayLoop`] - Applies published ledgers locally
//!
//! # Non-goals
//!
//! ledgerkv does NOT provide:
//! - Range scans or secondary indexes
//! - Read-your-writes on the leader before replay catches up
//! - Membership changes at runtime
//! - Repair of ledgers orphaned by a partially failed commit

pub mod config;
pub mod coord;
pub mod elector;
pub mod engine;
pub mod env;
pub mod error;
pub mod keyspace;
pub mod ledger;
pub mod log_index;
pub mod memory;
pub mod ops;
pub mod record;
pub mod replay;
pub mod retry;
pub mod store;
pub mod txn;
pub mod types;
pub mod wal;

pub use config::{EnvConfig, ReplayConfig};
pub use coord::{Coordinator, Paths};
pub use elector::LeaderElector;
pub use engine::{LocalEngine, WriteBatch};
pub use env::{Env, EnvStatus};
pub use error::{Error, Result};
pub use keyspace::Keyspace;
pub use ledger::LedgerService;
pub use log_index::LogIndex;
pub use memory::{MemoryCluster, MemoryCoordinator, MemoryLedgerService};
pub use replay::{CycleReport, ReplayLoop};
pub use retry::{EnsemblePolicy, EnsembleSpec, RetryConfig};
pub use store::LocalStore;
pub use txn::{ReadTransaction, Transaction, WriteTransaction};
pub use types::{ConnectionState, KeyspaceId, LedgerId, MemberId, Role};

#[cfg(test)]
mod tests;
