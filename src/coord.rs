//! Coordination service boundary.

use std::future::Future;

use tokio::sync::watch;

use crate::error::Result;
use crate::types::{ConnectionState, KeyspaceId, MemberId, Version, Versioned};

/// Client of a coordination service with hierarchical versioned nodes and an
/// exclusive election primitive.
///
/// All writes are compare-and-swap against the version returned by
/// [`Coordinator::get`]. A lost race yields
/// [`Error::VersionConflict`](crate::Error::VersionConflict).
pub trait Coordinator: Send + Sync + 'static {
    /// Create `path` with empty data unless it already exists.
    fn create_if_absent(&self, path: &str) -> impl Future<Output = Result<()>> + Send;

    /// Create `path` holding `data` unless it already exists.
    fn create_with(&self, path: &str, data: Vec<u8>) -> impl Future<Output = Result<()>> + Send;

    /// Read a node; `None` when it does not exist.
    fn get(&self, path: &str) -> impl Future<Output = Result<Option<Versioned>>> + Send;

    /// Overwrite `path` if its version still equals `expected`; returns the
    /// new version.
    fn set(
        &self,
        path: &str,
        data: Vec<u8>,
        expected: Version,
    ) -> impl Future<Output = Result<Version>> + Send;

    fn delete(&self, path: &str) -> impl Future<Output = Result<()>> + Send;

    /// Resolves once `member` holds the election at `path`.
    fn campaign(&self, path: &str, member: MemberId) -> impl Future<Output = Result<()>> + Send;

    /// Give up the election at `path` if `member` holds it.
    fn resign(&self, path: &str, member: MemberId) -> impl Future<Output = Result<()>> + Send;

    /// Connection state notifications.
    fn connection_state(&self) -> watch::Receiver<ConnectionState>;

    /// Block until the client reports [`ConnectionState::Connected`].
    fn wait_connected(&self) -> impl Future<Output = Result<()>> + Send {
        let mut state = self.connection_state();
        async move {
            state
                .wait_for(|s| s.is_connected())
                .await
                .map_err(|_| crate::Error::ConnectivityLoss)?;
            Ok(())
        }
    }
}

/// Node layout of one cluster under its root path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Paths {
    root: String,
}

impl Paths {
    pub fn new(root: impl Into<String>) -> Self {
        let root = root.into();
        Self {
            root: root.trim_end_matches('/').to_string(),
        }
    }

    pub fn root(&self) -> &str {
        &self.root
    }

    pub fn keyspaces(&self) -> String {
        format!("{}/dbmap", self.root)
    }

    pub fn keyspace(&self, id: KeyspaceId) -> String {
        format!("{}/dbmap/{}", self.root, id.to_hex())
    }

    pub fn election(&self) -> String {
        format!("{}/election", self.root)
    }

    pub fn logs(&self) -> String {
        format!("{}/log", self.root)
    }

    pub fn log(&self, member: MemberId) -> String {
        format!("{}/log/{member}", self.root)
    }

    pub fn cursors(&self) -> String {
        format!("{}/log/removed", self.root)
    }

    pub fn cursor(&self, member: MemberId) -> String {
        format!("{}/log/removed/{member}", self.root)
    }

    /// Last ledger deleted by garbage collection.
    pub fn gc_mark(&self) -> String {
        format!("{}/log/collected", self.root)
    }

    /// Every node that must exist before members can publish and replay.
    pub fn skeleton(&self, members: &[MemberId]) -> Vec<String> {
        let mut paths = vec![
            self.root.clone(),
            self.keyspaces(),
            self.logs(),
            self.cursors(),
            self.gc_mark(),
        ];
        for &member in members {
            paths.push(self.log(member));
            paths.push(self.cursor(member));
        }
        paths
    }
}
