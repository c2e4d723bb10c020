use std::collections::HashMap;

use cron::Schedule;
use serde::{Deserialize, Serialize};

use crate::error::{AgentError, Result};
use crate::model::{CmdId, Group, GroupId, NodeId};

/// One scheduling rule inside a job.
///
/// `timer` is the canonical cron string and doubles as the change-detection
/// token: two rules with equal timers never cause a wheel re-schedule.
/// `schedule` is the parsed form, populated by [`Job::compile`] after decode
/// and skipped on the wire.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobRule {
    pub id: String,
    pub timer: String,
    #[serde(rename = "gids", default)]
    pub group_ids: Vec<GroupId>,
    #[serde(rename = "nids", default)]
    pub node_ids: Vec<NodeId>,
    #[serde(rename = "exclude_nids", default)]
    pub exclude_node_ids: Vec<NodeId>,
    #[serde(skip)]
    pub schedule: Option<Schedule>,
}

impl JobRule {
    /// Whether this rule selects the given node under the given group
    /// catalogue. Exclusions win over everything; explicit node ids win over
    /// group membership.
    pub fn included(&self, node_id: &str, groups: &HashMap<GroupId, Group>) -> bool {
        if self.exclude_node_ids.iter().any(|n| n == node_id) {
            return false;
        }
        if self.node_ids.iter().any(|n| n == node_id) {
            return true;
        }
        self.group_ids
            .iter()
            .any(|gid| groups.get(gid).is_some_and(|g| g.included(node_id)))
    }
}

/// A scheduled unit of work, owned by one group.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: String,
    #[serde(default)]
    pub name: String,
    /// Name of the owning group; part of the job's store key.
    pub group: String,
    #[serde(rename = "cmd")]
    pub command: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
    #[serde(default)]
    pub rules: Vec<JobRule>,
    #[serde(default)]
    pub pause: bool,
    /// Node this copy reports runs under; set by the agent, never serialized.
    #[serde(skip)]
    pub run_on: Option<NodeId>,
}

impl Job {
    /// Parse every rule's timer into its `Schedule`. Called once after
    /// decode; a job with an invalid expression is rejected whole.
    pub fn compile(&mut self) -> Result<()> {
        for rule in &mut self.rules {
            let schedule = rule.timer.parse().map_err(|source| AgentError::InvalidTimer {
                job: self.id.clone(),
                timer: rule.timer.clone(),
                source,
            })?;
            rule.schedule = Some(schedule);
        }
        Ok(())
    }

    /// Record which node this copy executes on.
    pub fn run_on(&mut self, node_id: &str) {
        self.run_on = Some(node_id.to_string());
    }

    /// Whether any rule selects the given node. Deterministic in its inputs.
    pub fn is_run_on(&self, node_id: &str, groups: &HashMap<GroupId, Group>) -> bool {
        self.rules.iter().any(|r| r.included(node_id, groups))
    }

    /// The commands this job produces on the given node: one per matching
    /// rule. A paused job produces none.
    pub fn cmds(&self, node_id: &str, groups: &HashMap<GroupId, Group>) -> HashMap<CmdId, Cmd> {
        let mut cmds = HashMap::new();
        if self.pause {
            return cmds;
        }
        for rule in &self.rules {
            if rule.included(node_id, groups) {
                let cmd = Cmd {
                    job: self.clone(),
                    rule: rule.clone(),
                };
                cmds.insert(cmd.id(), cmd);
            }
        }
        cmds
    }
}

/// A concrete scheduled entry: one `(job, rule)` pair on one node's wheel.
#[derive(Debug, Clone)]
pub struct Cmd {
    pub job: Job,
    pub rule: JobRule,
}

impl Cmd {
    pub fn id(&self) -> CmdId {
        format!("{}/{}", self.job.id, self.rule.id)
    }

    pub fn timer(&self) -> &str {
        &self.rule.timer
    }

    pub fn schedule(&self) -> Option<&Schedule> {
        self.rule.schedule.as_ref()
    }
}
