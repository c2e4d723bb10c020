use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::agent::link::Link;
use crate::error::Result;
use crate::model::{Cmd, CmdId, Group, GroupId, Job, JobId, NodeId};
use crate::wheel::WheelHandle;
use crate::worker::Executor;

/// Where the reconciler re-fetches jobs it only knows through the link index.
/// The etcd store implements this; tests substitute an in-memory map.
#[async_trait]
pub trait JobSource: Send + Sync {
    async fn fetch_job(&self, gname: &str, id: &str) -> Result<Job>;
}

/// Decoded change events, funnelled from all watchers into the single
/// reconciler task.
#[derive(Debug)]
pub enum ReconcileMsg {
    JobPut { job: Job, created: bool },
    JobDel { id: JobId },
    GroupPut { group: Group, created: bool },
    GroupDel { id: GroupId },
    RunOnce { id: JobId, target: Option<NodeId> },
}

/// Owner of all derived scheduling state on this node.
///
/// Single writer: every mutation happens on the task driving [`Reconciler::run`],
/// so operations never interleave mid-mutation and per-stream event order is
/// preserved.
pub struct Reconciler {
    node_id: NodeId,
    /// Jobs currently assigned to this node.
    jobs: HashMap<JobId, Job>,
    /// The full known group catalogue, not filtered to this node.
    groups: HashMap<GroupId, Group>,
    /// Commands installed on the wheel.
    cmds: HashMap<CmdId, Cmd>,
    link: Link,
    /// Tombstones for deleted jobs still referenced by `link`; stops a group
    /// flip-in from re-hydrating them. Dropped with the last link reference.
    del_ids: HashSet<JobId>,
    wheel: WheelHandle,
    source: Arc<dyn JobSource>,
}

impl Reconciler {
    pub fn new(node_id: NodeId, wheel: WheelHandle, source: Arc<dyn JobSource>) -> Self {
        Self {
            node_id,
            jobs: HashMap::new(),
            groups: HashMap::new(),
            cmds: HashMap::new(),
            link: Link::default(),
            del_ids: HashSet::new(),
            wheel,
            source,
        }
    }

    /// Seed state at startup: the full group catalogue, then every job.
    pub fn load(&mut self, groups: HashMap<GroupId, Group>, jobs: Vec<Job>) {
        self.groups = groups;
        for mut job in jobs {
            job.run_on(&self.node_id);
            self.add_job(job, false);
        }
        tracing::info!(
            jobs = self.jobs.len(),
            groups = self.groups.len(),
            cmds = self.cmds.len(),
            "catalogue loaded"
        );
    }

    /// Drive the reconciler until cancellation: change events on one channel,
    /// due command ids from the wheel on the other.
    pub async fn run(
        mut self,
        mut events: mpsc::UnboundedReceiver<ReconcileMsg>,
        mut fires: mpsc::UnboundedReceiver<CmdId>,
        executor: Executor,
        cancel: CancellationToken,
    ) {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                msg = events.recv() => {
                    let Some(msg) = msg else { break };
                    self.apply(msg, &executor).await;
                }
                id = fires.recv() => {
                    let Some(id) = id else { break };
                    // Resolve the payload at fire time so a run always sees
                    // the newest job definition.
                    match self.cmds.get(&id) {
                        Some(cmd) => executor.spawn(cmd.clone()),
                        None => tracing::debug!(cmd_id = %id, "fired command no longer installed"),
                    }
                }
            }
        }
        tracing::debug!("reconciler stopped");
    }

    async fn apply(&mut self, msg: ReconcileMsg, executor: &Executor) {
        match msg {
            ReconcileMsg::JobPut { job, created: true } => self.add_job(job, true),
            ReconcileMsg::JobPut { job, created: false } => self.mod_job(job),
            ReconcileMsg::JobDel { id } => self.del_job(&id),
            ReconcileMsg::GroupPut { group, created: true } => self.add_group(group),
            ReconcileMsg::GroupPut { group, created: false } => self.mod_group(group).await,
            ReconcileMsg::GroupDel { id } => self.del_group(&id),
            ReconcileMsg::RunOnce { id, target } => {
                if let Some(job) = self.one_shot(&id, target.as_deref()) {
                    executor.spawn_job(job.clone());
                }
            }
        }
    }

    /// Record back-references, clear any tombstone, and install the job's
    /// commands when it targets this node.
    pub fn add_job(&mut self, job: Job, notice: bool) {
        self.link.add_job(&job);
        self.del_ids.remove(&job.id);

        let cmds = job.cmds(&self.node_id, &self.groups);
        if job.is_run_on(&self.node_id, &self.groups) {
            self.jobs.insert(job.id.clone(), job);
        }
        for cmd in cmds.into_values() {
            self.add_cmd(cmd, notice);
        }
    }

    /// Tombstone the id; if the job ran here, tear down its state.
    pub fn del_job(&mut self, id: &str) {
        self.del_ids.insert(id.to_string());
        // Not in `jobs` means this node was never executing it; the link
        // entries stay behind and the tombstone guards against re-hydration.
        let Some(job) = self.jobs.remove(id) else {
            return;
        };
        self.link.del_job(&job);
        for cmd in job.cmds(&self.node_id, &self.groups).into_values() {
            self.del_cmd(&cmd);
        }
    }

    pub fn mod_job(&mut self, job: Job) {
        let Some(old) = self.jobs.get(&job.id) else {
            // Not previously executing here.
            self.add_job(job, true);
            return;
        };

        // Back-references are cleared before recomputation and reinstalled
        // after, so interleaved group events see the old or new shape whole.
        self.link.del_job(old);
        let mut prev = old.cmds(&self.node_id, &self.groups);
        let new = job.cmds(&self.node_id, &self.groups);
        let id = job.id.clone();
        self.jobs.insert(id.clone(), job);

        for (cid, cmd) in new {
            self.add_cmd(cmd, true);
            prev.remove(&cid);
        }
        for cmd in prev.values() {
            self.del_cmd(cmd);
        }

        if let Some(stored) = self.jobs.get(&id) {
            self.link.add_job(stored);
        }
    }

    pub fn add_group(&mut self, group: Group) {
        self.groups.insert(group.id.clone(), group);
    }

    /// Remove a group from the catalogue and the link index. A job stored
    /// under the same id, if any, loses the commands it still produces; see
    /// DESIGN.md for why the probe uses the group id.
    pub fn del_group(&mut self, id: &str) {
        self.groups.remove(id);
        self.link.del_group(id);

        let Some(job) = self.jobs.get(id) else {
            return;
        };
        let cmds = job.cmds(&self.node_id, &self.groups);
        for cmd in cmds.values() {
            self.del_cmd(cmd);
        }
    }

    pub async fn mod_group(&mut self, group: Group) {
        let Some(old) = self.groups.get(&group.id) else {
            self.add_group(group);
            return;
        };

        let was_member = old.included(&self.node_id);
        let is_member = group.included(&self.node_id);

        // Membership unchanged either way: no effect on this node's commands.
        if was_member == is_member {
            self.groups.insert(group.id.clone(), group);
            return;
        }

        if is_member {
            self.group_add_node(group).await;
        } else {
            let old = old.clone();
            self.group_rm_node(group, old);
        }
    }

    /// The group now includes this node. Install it first so membership
    /// computations see it, then bring every linked job's commands up.
    async fn group_add_node(&mut self, group: Group) {
        let gid = group.id.clone();
        self.groups.insert(gid.clone(), group);

        for (jid, gname) in self.link.jobs_for(&gid) {
            let job = match self.jobs.get(&jid) {
                Some(job) => job.clone(),
                None => {
                    if self.del_ids.contains(&jid) {
                        // Deleted while only the link remembered it.
                        self.drop_link(&gid, &jid);
                        continue;
                    }
                    match self.source.fetch_job(&gname, &jid).await {
                        Ok(mut job) => {
                            job.run_on(&self.node_id);
                            job
                        }
                        Err(e) => {
                            tracing::warn!(
                                group = %gname,
                                job_id = %jid,
                                error = %e,
                                "linked job fetch failed, dropping back-reference"
                            );
                            self.drop_link(&gid, &jid);
                            continue;
                        }
                    }
                }
            };

            if !self.jobs.contains_key(&jid) && job.is_run_on(&self.node_id, &self.groups) {
                self.jobs.insert(jid.clone(), job.clone());
            }
            for cmd in job.cmds(&self.node_id, &self.groups).into_values() {
                self.add_cmd(cmd, true);
            }
        }
    }

    /// The group no longer includes this node. Diff each linked job's
    /// commands between the old and new group definitions.
    fn group_rm_node(&mut self, group: Group, old: Group) {
        let gid = group.id.clone();
        let linked = self.link.jobs_for(&gid);
        if linked.is_empty() {
            self.groups.insert(gid, group);
            return;
        }

        for (jid, _) in linked {
            let Some(job) = self.jobs.get(&jid).cloned() else {
                self.drop_link(&gid, &jid);
                continue;
            };

            self.groups.insert(old.id.clone(), old.clone());
            let mut prev = job.cmds(&self.node_id, &self.groups);
            self.groups.insert(gid.clone(), group.clone());
            let new = job.cmds(&self.node_id, &self.groups);

            for (cid, cmd) in new {
                self.add_cmd(cmd, true);
                prev.remove(&cid);
            }
            for cmd in prev.values() {
                self.del_cmd(cmd);
            }

            // The job leaves this node's table when nothing targets it here
            // anymore; the link entry stays so a flip back in can re-fetch.
            if !job.is_run_on(&self.node_id, &self.groups) {
                self.jobs.remove(&jid);
            }
        }

        self.groups.insert(gid, group);
    }

    /// Install or refresh a command. An unchanged timer only overwrites the
    /// stored payload; the wheel is not touched.
    pub fn add_cmd(&mut self, cmd: Cmd, notice: bool) {
        let Some(schedule) = cmd.schedule().cloned() else {
            tracing::warn!(
                job_id = %cmd.job.id,
                rule_id = %cmd.rule.id,
                timer = %cmd.rule.timer,
                "rule was never compiled, not installing"
            );
            return;
        };

        let id = cmd.id();
        let (job_id, rule_id, timer) = (
            cmd.job.id.clone(),
            cmd.rule.id.clone(),
            cmd.rule.timer.clone(),
        );
        if let Some(existing) = self.cmds.get_mut(&id) {
            let timer_unchanged = existing.rule.timer == timer;
            *existing = cmd;
            if timer_unchanged {
                return;
            }
        } else {
            self.cmds.insert(id.clone(), cmd);
        }

        self.wheel.schedule(id, schedule, timer.clone());
        if notice {
            tracing::info!(
                job_id = %job_id,
                rule_id = %rule_id,
                timer = %timer,
                "command scheduled"
            );
        }
    }

    pub fn del_cmd(&mut self, cmd: &Cmd) {
        let id = cmd.id();
        self.cmds.remove(&id);
        self.wheel.remove(id);
        tracing::info!(
            job_id = %cmd.job.id,
            rule_id = %cmd.rule.id,
            timer = %cmd.rule.timer,
            "command descheduled"
        );
    }

    /// Resolve an ad-hoc run trigger to the job to execute, if it is for
    /// this node and the job currently targets it.
    pub fn one_shot(&self, id: &str, target: Option<&str>) -> Option<&Job> {
        if target.is_some_and(|t| t != self.node_id) {
            return None;
        }
        let job = self.jobs.get(id)?;
        job.is_run_on(&self.node_id, &self.groups).then_some(job)
    }

    fn drop_link(&mut self, gid: &str, jid: &str) {
        if self.link.del_group_job(gid, jid) {
            self.del_ids.remove(jid);
        }
    }

    pub fn jobs(&self) -> &HashMap<JobId, Job> {
        &self.jobs
    }

    pub fn groups(&self) -> &HashMap<GroupId, Group> {
        &self.groups
    }

    pub fn cmds(&self) -> &HashMap<CmdId, Cmd> {
        &self.cmds
    }

    pub fn link(&self) -> &Link {
        &self.link
    }

    pub fn tombstoned(&self, id: &str) -> bool {
        self.del_ids.contains(id)
    }
}
