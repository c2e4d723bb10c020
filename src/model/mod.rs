//! Catalogue types shared by the reconciler, the store, and the executor.
//!
//! A [`Job`] belongs to one group and carries rules; each rule pairs a cron
//! expression with a targeting predicate over `(node, groups)`. A [`Cmd`] is
//! the derived unit actually installed on the wheel: one `(job, rule)` pair
//! on one node.

pub mod group;
pub mod job;

pub use group::Group;
pub use job::{Cmd, Job, JobRule};

/// Node identity: the agent's local IP address.
pub type NodeId = String;
pub type JobId = String;
pub type GroupId = String;
/// `"<JobId>/<RuleId>"`, the wheel key.
pub type CmdId = String;
