//! Leadership task.
//!
//! One spawned task campaigns for the election path, publishes the role on a
//! watch channel and holds leadership until shutdown or until the
//! coordination connection degrades. Demotion is published before the
//! election is resigned, so a successor can never be granted while this
//! member still reports itself leader.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::coord::Coordinator;
use crate::types::{ConnectionState, MemberId, Role};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum HoldEnd {
    Shutdown,
    Disconnected(ConnectionState),
}

pub struct LeaderElector {
    member: MemberId,
    role: watch::Receiver<Role>,
    shutdown: watch::Sender<bool>,
    task: Option<JoinHandle<()>>,
}

impl LeaderElector {
    /// Spawn the leadership task on the current runtime.
    pub fn start<C: Coordinator>(
        coord: Arc<C>,
        path: String,
        member: MemberId,
        backoff: Duration,
    ) -> Self {
        let (role_tx, role) = watch::channel(Role::Follower);
        let (shutdown, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(run(coord, path, member, backoff, role_tx, shutdown_rx));
        Self {
            member,
            role,
            shutdown,
            task: Some(task),
        }
    }

    pub fn member(&self) -> MemberId {
        self.member
    }

    pub fn is_leader(&self) -> bool {
        *self.role.borrow() == Role::Leader
    }

    pub fn role(&self) -> Role {
        *self.role.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<Role> {
        self.role.clone()
    }

    /// Interrupt the task, relinquishing leadership if held.
    pub async fn shutdown(&mut self) {
        let _ = self.shutdown.send(true);
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                warn!(member = self.member, "Leadership task failed: {e}");
            }
        }
    }
}

impl Drop for LeaderElector {
    fn drop(&mut self) {
        let _ = self.shutdown.send(true);
    }
}

async fn run<C: Coordinator>(
    coord: Arc<C>,
    path: String,
    member: MemberId,
    backoff: Duration,
    role: watch::Sender<Role>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        if *shutdown.borrow() {
            break;
        }

        tokio::select! {
            res = coord.wait_connected() => {
                if let Err(e) = res {
                    warn!(member, "Waiting for coordination connection failed: {e}");
                    break;
                }
            }
            _ = shutdown.changed() => break,
        }

        tokio::select! {
            res = coord.campaign(&path, member) => {
                if let Err(e) = res {
                    warn!(member, "Election attempt failed: {e}");
                    tokio::select! {
                        _ = tokio::time::sleep(backoff) => continue,
                        _ = shutdown.changed() => break,
                    }
                }
            }
            _ = shutdown.changed() => break,
        }

        info!(member, "Becoming leader");
        role.send_replace(Role::Leader);

        let end = hold(coord.as_ref(), &mut shutdown).await;

        role.send_replace(Role::Follower);
        match end {
            HoldEnd::Shutdown => info!(member, "Relinquishing leadership on shutdown"),
            HoldEnd::Disconnected(state) => {
                warn!(member, ?state, "Coordination connection degraded, leadership cancelled")
            }
        }

        if let Err(e) = coord.resign(&path, member).await {
            warn!(member, "Failed to resign election: {e}");
        }

        if end == HoldEnd::Shutdown {
            break;
        }
    }
    role.send_replace(Role::Follower);
}

/// Park while leader.
async fn hold<C: Coordinator>(coord: &C, shutdown: &mut watch::Receiver<bool>) -> HoldEnd {
    let mut conn = coord.connection_state();
    loop {
        let state = *conn.borrow_and_update();
        if !state.is_connected() {
            return HoldEnd::Disconnected(state);
        }
        if *shutdown.borrow() {
            return HoldEnd::Shutdown;
        }
        tokio::select! {
            res = conn.changed() => {
                if res.is_err() {
                    return HoldEnd::Disconnected(ConnectionState::Lost);
                }
            }
            _ = shutdown.changed() => return HoldEnd::Shutdown,
        }
    }
}
