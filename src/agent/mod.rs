//! The agent: registration, lease keep-alive, and the wiring between the
//! store, the reconciler, the wheel, and the executor.
//!
//! Liveness advertisement and job execution are deliberately decoupled: a
//! lost lease never disturbs installed schedules, and schedule churn never
//! touches the lease.

pub mod link;
pub mod reconciler;
pub mod watch;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::config::AgentConfig;
use crate::error::{AgentError, Result};
use crate::model::NodeId;
use crate::store::Store;
use crate::wheel::{Wheel, WheelHandle};
use crate::worker::Executor;
use reconciler::Reconciler;

/// Identity this agent advertises in the store.
#[derive(Debug, Clone)]
pub struct NodeMeta {
    pub id: NodeId,
    pub pid: String,
}

pub struct Agent {
    config: AgentConfig,
    store: Store,
    node: NodeMeta,
    executor: Executor,
    lease_id: i64,
    cancel: CancellationToken,
    stopped: AtomicBool,
}

impl Agent {
    pub async fn new(config: AgentConfig) -> Result<Self> {
        let store = Store::connect(&config.endpoints, &config.prefix).await?;
        let node = NodeMeta {
            id: config.node_id.clone(),
            pid: std::process::id().to_string(),
        };
        Ok(Self {
            config,
            store,
            node,
            executor: Executor::default(),
            lease_id: 0,
            cancel: CancellationToken::new(),
            stopped: AtomicBool::new(false),
        })
    }

    /// Claim this node id. Fails when another live process already holds it;
    /// a presence record left by a dead pid is overwritten.
    pub async fn register(&mut self) -> Result<()> {
        if let Some(pid) = self.store.presence_pid(&self.node.id).await? {
            if pid_alive(&pid) {
                return Err(AgentError::AlreadyRegistered {
                    node: self.node.id.clone(),
                    pid,
                });
            }
        }
        self.lease_id = acquire_presence(&self.store, &self.node, self.config.ttl).await?;
        tracing::info!(node_id = %self.node.id, lease = self.lease_id, "registered");
        Ok(())
    }

    /// Start every subsystem task. Returns once the agent is running; a
    /// startup failure tears the agent down before propagating.
    pub async fn run(&mut self) -> Result<()> {
        let cancel = self.cancel.clone();

        tokio::spawn(keep_alive(
            self.store.clone(),
            self.node.clone(),
            self.config.ttl,
            self.lease_id,
            cancel.clone(),
        ));

        let (wheel_handle, wheel_ctrl) = WheelHandle::channel();
        let (fire_tx, fire_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();

        let mut rec = Reconciler::new(
            self.node.id.clone(),
            wheel_handle,
            Arc::new(self.store.clone()),
        );
        if let Err(e) = self.load(&mut rec).await {
            self.stop().await;
            return Err(e);
        }

        // The wheel starts after the initial load; installs queued on the
        // control channel are picked up on the first iteration.
        tokio::spawn(Wheel::new(fire_tx).run(wheel_ctrl, cancel.clone()));
        tokio::spawn(rec.run(event_rx, fire_rx, self.executor.clone(), cancel.clone()));
        tokio::spawn(watch::watch_jobs(
            self.store.clone(),
            self.node.id.clone(),
            event_tx.clone(),
            cancel.clone(),
        ));
        tokio::spawn(watch::watch_groups(
            self.store.clone(),
            event_tx.clone(),
            cancel.clone(),
        ));
        tokio::spawn(watch::watch_once(self.store.clone(), event_tx, cancel));

        tracing::info!(node_id = %self.node.id, "agent running");
        Ok(())
    }

    async fn load(&self, rec: &mut Reconciler) -> Result<()> {
        let groups = self.store.get_groups().await?;
        let jobs = self.store.get_jobs().await?;
        rec.load(groups, jobs);
        Ok(())
    }

    /// Graceful shutdown: down marker, cancel every loop, drop presence.
    /// Idempotent; in-flight command runs are left to finish on their own.
    pub async fn stop(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        tracing::info!(node_id = %self.node.id, "agent stopping");

        if let Err(e) = self.store.mark_down(&self.node.id).await {
            tracing::warn!(error = %e, "down marker write failed");
        }
        self.cancel.cancel();
        if let Err(e) = self.store.delete_presence(&self.node.id).await {
            tracing::warn!(error = %e, "presence delete failed");
        }
    }
}

async fn acquire_presence(store: &Store, node: &NodeMeta, ttl: i64) -> Result<i64> {
    // The +2 slack lets the record survive one missed renewal.
    let lease = store.grant(ttl + 2).await?;
    store.put_presence(&node.id, &node.pid, lease).await?;
    Ok(lease)
}

/// Renew the presence lease every `ttl` seconds, reacquiring from scratch
/// whenever a renewal fails. Never fatal; exits only on shutdown.
async fn keep_alive(
    store: Store,
    node: NodeMeta,
    ttl: i64,
    mut lease: i64,
    cancel: CancellationToken,
) {
    let period = Duration::from_secs(ttl.max(1) as u64);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = tokio::time::sleep(period) => {}
        }

        if lease > 0 {
            match store.keep_alive_once(lease).await {
                Ok(()) => continue,
                Err(e) => {
                    tracing::warn!(node_id = %node.id, lease, error = %e, "keep-alive failed, reacquiring");
                    lease = 0;
                }
            }
        }

        match acquire_presence(&store, &node, ttl).await {
            Ok(id) => {
                lease = id;
                tracing::info!(node_id = %node.id, lease, "presence lease reacquired");
            }
            Err(e) => {
                tracing::warn!(node_id = %node.id, error = %e, ttl, "presence reacquire failed, retrying next tick");
            }
        }
    }
}

/// A presence record holds the registering pid; the record is stale when
/// that local process is gone.
fn pid_alive(pid: &str) -> bool {
    std::path::Path::new(&format!("/proc/{pid}")).exists()
}
