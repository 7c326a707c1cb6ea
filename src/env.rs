use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{watch, Mutex};
use tracing::{info, warn};

use crate::config::EnvConfig;
use crate::coord::{Coordinator, Paths};
use crate::elector::LeaderElector;
use crate::engine::LocalEngine;
use crate::error::Result;
use crate::keyspace::Keyspace;
use crate::ledger::LedgerService;
use crate::log_index::{ids_after, LogIndex};
use crate::replay::{ReplayHandle, ReplayLoop};
use crate::txn::{ReadTransaction, WriteTransaction};
use crate::types::{LedgerId, MemberId, Role};

/// Handles shared by every component of one member.
pub(crate) struct Shared<C, L, E> {
    pub(crate) config: EnvConfig,
    pub(crate) paths: Paths,
    pub(crate) coord: Arc<C>,
    pub(crate) ledgers: Arc<L>,
    pub(crate) engine: Arc<E>,
    pub(crate) log_index: LogIndex<C>,
    pub(crate) role: watch::Receiver<Role>,
    /// Serializes publication of this process's commits so every member list
    /// receives them in the same relative order.
    pub(crate) commit_lock: Mutex<()>,
}

impl<C, L, E> Shared<C, L, E> {
    pub(crate) fn member(&self) -> MemberId {
        self.config.member_id
    }

    pub(crate) fn is_leader(&self) -> bool {
        *self.role.borrow() == Role::Leader
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct EnvStatus {
    pub member: MemberId,
    pub role: Role,
    pub cluster_size: usize,
    pub cursor: Option<LedgerId>,
    pub log_len: usize,
    pub pending: usize,
}

/// One cluster member's replicated environment.
///
/// Owns the coordination, ledger and local engine handles, the leadership
/// task and (unless disabled) the replay loop. Several environments can live
/// in one process, which is how the tests run whole clusters.
pub struct Env<C, L, E> {
    shared: Arc<Shared<C, L, E>>,
    elector: LeaderElector,
    replay: Option<ReplayHandle>,
}

impl<C, L, E> Env<C, L, E>
where
    C: Coordinator,
    L: LedgerService,
    E: LocalEngine,
{
    /// Connect, make sure the cluster's coordination nodes exist, start
    /// campaigning for leadership and start replaying.
    pub async fn open(config: EnvConfig, coord: C, ledgers: L, engine: E) -> Result<Self> {
        config.validate()?;
        let coord = Arc::new(coord);
        coord.wait_connected().await?;

        let paths = Paths::new(config.root_path.as_str());
        for path in paths.skeleton(&config.members) {
            coord.create_if_absent(&path).await?;
        }

        let elector = LeaderElector::start(
            coord.clone(),
            paths.election(),
            config.member_id,
            config.retry.election_backoff(),
        );

        let shared = Arc::new(Shared {
            log_index: LogIndex::new(coord.clone(), paths.clone()),
            role: elector.subscribe(),
            commit_lock: Mutex::new(()),
            paths,
            coord,
            ledgers: Arc::new(ledgers),
            engine: Arc::new(engine),
            config,
        });

        let replay = shared
            .config
            .replay
            .enabled
            .then(|| ReplayLoop::new(shared.clone()).spawn());

        info!(
            member = shared.member(),
            cluster_size = shared.config.cluster_size(),
            "Environment opened"
        );
        Ok(Self {
            shared,
            elector,
            replay,
        })
    }

    pub fn member_id(&self) -> MemberId {
        self.shared.member()
    }

    pub fn config(&self) -> &EnvConfig {
        &self.shared.config
    }

    pub fn paths(&self) -> &Paths {
        &self.shared.paths
    }

    pub fn cluster_size(&self) -> usize {
        self.shared.config.cluster_size()
    }

    pub fn is_leader(&self) -> bool {
        self.elector.is_leader()
    }

    pub fn role(&self) -> Role {
        self.elector.role()
    }

    pub fn subscribe_role(&self) -> watch::Receiver<Role> {
        self.elector.subscribe()
    }

    /// Wait until this member's role equals `role`, up to `timeout`.
    pub async fn wait_for_role(&self, role: Role, timeout: Duration) -> bool {
        let mut rx = self.elector.subscribe();
        let reached = matches!(
            tokio::time::timeout(timeout, rx.wait_for(|r| *r == role)).await,
            Ok(Ok(_))
        );
        reached
    }

    pub fn coordinator(&self) -> &Arc<C> {
        &self.shared.coord
    }

    pub fn ledgers(&self) -> &Arc<L> {
        &self.shared.ledgers
    }

    pub fn engine(&self) -> &Arc<E> {
        &self.shared.engine
    }

    pub fn log_index(&self) -> &LogIndex<C> {
        &self.shared.log_index
    }

    /// Open (creating on first use) the keyspace called `name`.
    pub async fn open_keyspace(&self, name: &str) -> Result<Keyspace<C, L, E>> {
        Keyspace::open(self.shared.clone(), name).await
    }

    pub fn read_txn(&self) -> ReadTransaction<E::Snapshot> {
        ReadTransaction::new(self.shared.engine.snapshot())
    }

    /// Begin a write transaction. Fails with `NotLeader` on followers.
    pub async fn write_txn(&self) -> Result<WriteTransaction<C, L, E>> {
        WriteTransaction::begin(self.shared.clone()).await
    }

    /// A replay loop for driving cycles by hand.
    pub fn replayer(&self) -> ReplayLoop<C, L, E> {
        ReplayLoop::new(self.shared.clone())
    }

    pub async fn status(&self) -> Result<EnvStatus> {
        let member = self.member_id();
        let cursor = self.shared.log_index.cursor(member).await?;
        let records = self.shared.log_index.entries(member).await?;
        Ok(EnvStatus {
            member,
            role: self.role(),
            cluster_size: self.cluster_size(),
            cursor,
            log_len: records.len(),
            pending: ids_after(&records, cursor).len(),
        })
    }

    /// Stop replaying, give up leadership and flush the local engine.
    pub async fn close(mut self) -> Result<()> {
        if let Some(replay) = self.replay.take() {
            replay.stop().await;
        }
        self.elector.shutdown().await;
        if let Err(e) = self.shared.engine.flush() {
            warn!(member = self.member_id(), "Failed to flush local engine: {e}");
            return Err(e);
        }
        info!(member = self.member_id(), "Environment closed");
        Ok(())
    }
}
