//! etcd bindings: leases, presence keys, catalogue reads, prefix watches.
//!
//! Key layout under the configured prefix:
//!
//! - `<p>/node/<NodeId>`: presence record, value = PID, bound to a lease
//! - `<p>/node/<NodeId>/down`: down marker written on shutdown
//! - `<p>/job/<gname>/<JobId>`: job definition, JSON
//! - `<p>/group/<GroupId>`: group definition, JSON
//! - `<p>/once/<JobId>`: ad-hoc run trigger, value empty or a target node

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::Utc;
use etcd_client::{
    Client, GetOptions, KeyValue, PutOptions, WatchOptions, WatchStream, Watcher,
};

use crate::agent::reconciler::JobSource;
use crate::error::{AgentError, Result};
use crate::model::{Group, GroupId, Job};

#[derive(Clone)]
pub struct Store {
    client: Client,
    prefix: String,
}

impl Store {
    pub async fn connect(endpoints: &[String], prefix: &str) -> Result<Self> {
        let client = Client::connect(endpoints, None).await?;
        Ok(Self {
            client,
            prefix: prefix.trim_end_matches('/').to_string(),
        })
    }

    pub fn node_key(&self, node_id: &str) -> String {
        format!("{}/node/{}", self.prefix, node_id)
    }

    pub fn node_down_key(&self, node_id: &str) -> String {
        format!("{}/node/{}/down", self.prefix, node_id)
    }

    pub fn job_prefix(&self) -> String {
        format!("{}/job/", self.prefix)
    }

    pub fn job_key(&self, gname: &str, id: &str) -> String {
        format!("{}{}/{}", self.job_prefix(), gname, id)
    }

    pub fn group_prefix(&self) -> String {
        format!("{}/group/", self.prefix)
    }

    pub fn once_prefix(&self) -> String {
        format!("{}/once/", self.prefix)
    }

    /// Last path segment of a key: the job or group id.
    pub fn id_from_key(key: &str) -> String {
        key.rsplit('/').next().unwrap_or(key).to_string()
    }

    pub async fn grant(&self, ttl: i64) -> Result<i64> {
        let mut client = self.client.clone();
        Ok(client.lease_grant(ttl, None).await?.id())
    }

    /// A single keep-alive round trip. A response reporting a zero TTL means
    /// the lease is gone; surface that as an error so the caller reacquires.
    pub async fn keep_alive_once(&self, lease: i64) -> Result<()> {
        let mut client = self.client.clone();
        let (mut keeper, mut responses) = client.lease_keep_alive(lease).await?;
        keeper.keep_alive().await?;
        match responses.message().await? {
            Some(resp) if resp.ttl() > 0 => Ok(()),
            _ => Err(AgentError::LeaseExpired(lease)),
        }
    }

    pub async fn put_presence(&self, node_id: &str, pid: &str, lease: i64) -> Result<()> {
        let mut client = self.client.clone();
        client
            .put(
                self.node_key(node_id),
                pid,
                Some(PutOptions::new().with_lease(lease)),
            )
            .await?;
        Ok(())
    }

    /// PID recorded under the node's presence key, if any.
    pub async fn presence_pid(&self, node_id: &str) -> Result<Option<String>> {
        let mut client = self.client.clone();
        let resp = client.get(self.node_key(node_id), None).await?;
        Ok(resp
            .kvs()
            .first()
            .map(|kv| String::from_utf8_lossy(kv.value()).into_owned()))
    }

    pub async fn delete_presence(&self, node_id: &str) -> Result<()> {
        let mut client = self.client.clone();
        client.delete(self.node_key(node_id), None).await?;
        Ok(())
    }

    pub async fn mark_down(&self, node_id: &str) -> Result<()> {
        let mut client = self.client.clone();
        client
            .put(self.node_down_key(node_id), Utc::now().to_rfc3339(), None)
            .await?;
        Ok(())
    }

    /// The full group catalogue. Malformed records are logged and skipped.
    pub async fn get_groups(&self) -> Result<HashMap<GroupId, Group>> {
        let mut client = self.client.clone();
        let resp = client
            .get(self.group_prefix(), Some(GetOptions::new().with_prefix()))
            .await?;

        let mut groups = HashMap::new();
        for kv in resp.kvs() {
            match group_from_kv(kv) {
                Ok(group) => {
                    groups.insert(group.id.clone(), group);
                }
                Err(e) => {
                    tracing::warn!(error = %e, "skipping malformed group record");
                }
            }
        }
        Ok(groups)
    }

    /// Every job definition in the store. Malformed records are logged and
    /// skipped.
    pub async fn get_jobs(&self) -> Result<Vec<Job>> {
        let mut client = self.client.clone();
        let resp = client
            .get(self.job_prefix(), Some(GetOptions::new().with_prefix()))
            .await?;

        let mut jobs = Vec::new();
        for kv in resp.kvs() {
            match job_from_kv(kv) {
                Ok(job) => jobs.push(job),
                Err(e) => {
                    tracing::warn!(error = %e, "skipping malformed job record");
                }
            }
        }
        Ok(jobs)
    }

    pub async fn get_job(&self, gname: &str, id: &str) -> Result<Job> {
        let mut client = self.client.clone();
        let resp = client.get(self.job_key(gname, id), None).await?;
        let kv = resp.kvs().first().ok_or_else(|| AgentError::JobNotFound {
            group: gname.to_string(),
            id: id.to_string(),
        })?;
        job_from_kv(kv)
    }

    pub async fn watch_jobs(&self) -> Result<(Watcher, WatchStream)> {
        self.watch_prefix(self.job_prefix()).await
    }

    pub async fn watch_groups(&self) -> Result<(Watcher, WatchStream)> {
        self.watch_prefix(self.group_prefix()).await
    }

    pub async fn watch_once(&self) -> Result<(Watcher, WatchStream)> {
        self.watch_prefix(self.once_prefix()).await
    }

    async fn watch_prefix(&self, prefix: String) -> Result<(Watcher, WatchStream)> {
        let mut client = self.client.clone();
        Ok(client
            .watch(prefix, Some(WatchOptions::new().with_prefix()))
            .await?)
    }
}

#[async_trait]
impl JobSource for Store {
    async fn fetch_job(&self, gname: &str, id: &str) -> Result<Job> {
        self.get_job(gname, id).await
    }
}

/// Decode and compile a job from a watch or get kv pair.
pub fn job_from_kv(kv: &KeyValue) -> Result<Job> {
    let mut job: Job = decode(kv)?;
    job.compile()?;
    Ok(job)
}

pub fn group_from_kv(kv: &KeyValue) -> Result<Group> {
    decode(kv)
}

/// etcd marks a creation by equal create and mod revisions.
pub fn is_create(kv: &KeyValue) -> bool {
    kv.create_revision() == kv.mod_revision()
}

fn decode<T: serde::de::DeserializeOwned>(kv: &KeyValue) -> Result<T> {
    serde_json::from_slice(kv.value()).map_err(|source| AgentError::Malformed {
        key: String::from_utf8_lossy(kv.key()).into_owned(),
        source,
    })
}
