use std::collections::HashMap;

use crate::model::{GroupId, Job, JobId};

/// One edge of the back-reference index: which group name the linked job is
/// stored under, needed to re-fetch it from the store by key.
#[derive(Debug, Clone)]
struct JobLink {
    gname: String,
}

/// Back-reference index from groups to the jobs whose rules target them.
///
/// When a group's membership changes, this is how the reconciler finds every
/// job whose assignment might have changed, including jobs that are not
/// currently running on this node.
#[derive(Debug, Default)]
pub struct Link {
    index: HashMap<GroupId, HashMap<JobId, JobLink>>,
}

impl Link {
    /// Record an edge for every group any of the job's rules target.
    pub fn add_job(&mut self, job: &Job) {
        for rule in &job.rules {
            for gid in &rule.group_ids {
                self.index.entry(gid.clone()).or_default().insert(
                    job.id.clone(),
                    JobLink {
                        gname: job.group.clone(),
                    },
                );
            }
        }
    }

    /// Remove the job's edges, following its current rules.
    pub fn del_job(&mut self, job: &Job) {
        for rule in &job.rules {
            for gid in &rule.group_ids {
                if let Some(jobs) = self.index.get_mut(gid) {
                    jobs.remove(&job.id);
                    if jobs.is_empty() {
                        self.index.remove(gid);
                    }
                }
            }
        }
    }

    pub fn del_group(&mut self, gid: &str) {
        self.index.remove(gid);
    }

    /// Remove a single (group, job) edge. Returns true when no group
    /// references the job anymore, so the caller can drop its tombstone.
    pub fn del_group_job(&mut self, gid: &str, jid: &str) -> bool {
        if let Some(jobs) = self.index.get_mut(gid) {
            jobs.remove(jid);
            if jobs.is_empty() {
                self.index.remove(gid);
            }
        }
        !self.references(jid)
    }

    pub fn references(&self, jid: &str) -> bool {
        self.index.values().any(|jobs| jobs.contains_key(jid))
    }

    pub fn contains(&self, gid: &str, jid: &str) -> bool {
        self.index.get(gid).is_some_and(|jobs| jobs.contains_key(jid))
    }

    /// Snapshot of `(job id, group name)` pairs linked to a group.
    pub fn jobs_for(&self, gid: &str) -> Vec<(JobId, String)> {
        self.index
            .get(gid)
            .map(|jobs| {
                jobs.iter()
                    .map(|(jid, l)| (jid.clone(), l.gname.clone()))
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }
}
