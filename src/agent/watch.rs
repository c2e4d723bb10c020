//! Watcher tasks bridging etcd change streams into reconciler messages.
//!
//! Each watcher decodes its stream and forwards typed messages into the
//! single reconciler channel; no watcher touches reconciler state itself.
//! A malformed record is logged and its event skipped. Loops end on
//! cancellation, on stream close, or when the reconciler goes away.

use etcd_client::{Event, EventType, WatchStream};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::agent::reconciler::ReconcileMsg;
use crate::model::NodeId;
use crate::store::{self, Store};

pub async fn watch_jobs(
    store: Store,
    node_id: NodeId,
    tx: mpsc::UnboundedSender<ReconcileMsg>,
    cancel: CancellationToken,
) {
    let Some((_watcher, stream)) = open(store.watch_jobs().await, "jobs") else {
        return;
    };
    drain(stream, cancel, |event| {
        let kv = event.kv()?;
        match event.event_type() {
            EventType::Put => {
                let mut job = match store::job_from_kv(kv) {
                    Ok(job) => job,
                    Err(e) => {
                        tracing::warn!(error = %e, "skipping malformed job event");
                        return None;
                    }
                };
                job.run_on(&node_id);
                Some(ReconcileMsg::JobPut {
                    job,
                    created: store::is_create(kv),
                })
            }
            EventType::Delete => Some(ReconcileMsg::JobDel {
                id: Store::id_from_key(&String::from_utf8_lossy(kv.key())),
            }),
        }
    }, tx)
    .await;
}

pub async fn watch_groups(
    store: Store,
    tx: mpsc::UnboundedSender<ReconcileMsg>,
    cancel: CancellationToken,
) {
    let Some((_watcher, stream)) = open(store.watch_groups().await, "groups") else {
        return;
    };
    drain(stream, cancel, |event| {
        let kv = event.kv()?;
        match event.event_type() {
            EventType::Put => {
                let group = match store::group_from_kv(kv) {
                    Ok(group) => group,
                    Err(e) => {
                        tracing::warn!(error = %e, "skipping malformed group event");
                        return None;
                    }
                };
                Some(ReconcileMsg::GroupPut {
                    group,
                    created: store::is_create(kv),
                })
            }
            EventType::Delete => Some(ReconcileMsg::GroupDel {
                id: Store::id_from_key(&String::from_utf8_lossy(kv.key())),
            }),
        }
    }, tx)
    .await;
}

/// Ad-hoc run triggers. The value, when present, names the one node meant to
/// run the job; the reconciler applies the membership check.
pub async fn watch_once(
    store: Store,
    tx: mpsc::UnboundedSender<ReconcileMsg>,
    cancel: CancellationToken,
) {
    let Some((_watcher, stream)) = open(store.watch_once().await, "once") else {
        return;
    };
    drain(stream, cancel, |event| {
        let kv = event.kv()?;
        if event.event_type() != EventType::Put {
            return None;
        }
        let target = match kv.value() {
            [] => None,
            value => Some(String::from_utf8_lossy(value).into_owned()),
        };
        Some(ReconcileMsg::RunOnce {
            id: Store::id_from_key(&String::from_utf8_lossy(kv.key())),
            target,
        })
    }, tx)
    .await;
}

fn open(
    result: crate::error::Result<(etcd_client::Watcher, WatchStream)>,
    stream: &'static str,
) -> Option<(etcd_client::Watcher, WatchStream)> {
    match result {
        Ok(pair) => Some(pair),
        Err(e) => {
            tracing::error!(stream, error = %e, "watch failed to start");
            None
        }
    }
}

/// Pump one watch stream until it ends, mapping events to messages.
async fn drain<F>(
    mut stream: WatchStream,
    cancel: CancellationToken,
    mut decode: F,
    tx: mpsc::UnboundedSender<ReconcileMsg>,
) where
    F: FnMut(&Event) -> Option<ReconcileMsg>,
{
    loop {
        let resp = tokio::select! {
            _ = cancel.cancelled() => return,
            resp = stream.message() => match resp {
                Ok(Some(resp)) => resp,
                Ok(None) => return,
                Err(e) => {
                    tracing::warn!(error = %e, "watch stream error");
                    return;
                }
            },
        };

        for event in resp.events() {
            if let Some(msg) = decode(event) {
                if tx.send(msg).is_err() {
                    return;
                }
            }
        }
    }
}
