use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc::UnboundedReceiver;

use cronfleet::agent::reconciler::{JobSource, Reconciler};
use cronfleet::error::{AgentError, Result};
use cronfleet::model::{Group, Job, JobRule};
use cronfleet::wheel::{WheelHandle, WheelMsg};

const NODE: &str = "10.0.0.1";

/// In-memory stand-in for the store's job fetch.
#[derive(Default)]
struct MapSource {
    jobs: HashMap<(String, String), Job>,
}

impl MapSource {
    fn with_job(mut self, job: Job) -> Self {
        self.jobs
            .insert((job.group.clone(), job.id.clone()), job);
        self
    }
}

#[async_trait]
impl JobSource for MapSource {
    async fn fetch_job(&self, gname: &str, id: &str) -> Result<Job> {
        self.jobs
            .get(&(gname.to_string(), id.to_string()))
            .cloned()
            .ok_or_else(|| AgentError::JobNotFound {
                group: gname.to_string(),
                id: id.to_string(),
            })
    }
}

fn rule(id: &str, timer: &str, gids: &[&str]) -> JobRule {
    rule_full(id, timer, gids, &[], &[])
}

fn rule_full(id: &str, timer: &str, gids: &[&str], nids: &[&str], exclude: &[&str]) -> JobRule {
    JobRule {
        id: id.to_string(),
        timer: timer.to_string(),
        group_ids: gids.iter().map(|s| s.to_string()).collect(),
        node_ids: nids.iter().map(|s| s.to_string()).collect(),
        exclude_node_ids: exclude.iter().map(|s| s.to_string()).collect(),
        schedule: None,
    }
}

fn job(id: &str, gname: &str, rules: Vec<JobRule>) -> Job {
    let mut job = Job {
        id: id.to_string(),
        name: format!("job-{id}"),
        group: gname.to_string(),
        command: "true".to_string(),
        user: None,
        rules,
        pause: false,
        run_on: None,
    };
    job.compile().expect("valid timers");
    job
}

fn group(id: &str, nodes: &[&str]) -> Group {
    Group {
        id: id.to_string(),
        name: id.to_string(),
        node_ids: nodes.iter().map(|s| s.to_string()).collect(),
    }
}

fn harness() -> (Reconciler, UnboundedReceiver<WheelMsg>) {
    harness_with(MapSource::default())
}

fn harness_with(source: MapSource) -> (Reconciler, UnboundedReceiver<WheelMsg>) {
    let (handle, wheel_rx) = WheelHandle::channel();
    (
        Reconciler::new(NODE.to_string(), handle, Arc::new(source)),
        wheel_rx,
    )
}

fn drain(rx: &mut UnboundedReceiver<WheelMsg>) -> Vec<WheelMsg> {
    let mut msgs = Vec::new();
    while let Ok(msg) = rx.try_recv() {
        msgs.push(msg);
    }
    msgs
}

/// Check the structural invariants: every installed command derives from a
/// job in the table, and every job's targeted groups link back to it.
fn assert_consistent(rec: &Reconciler) {
    for cmd in rec.cmds().values() {
        let job = rec
            .jobs()
            .get(&cmd.job.id)
            .expect("installed command without its job");
        assert!(
            job.cmds(NODE, rec.groups()).contains_key(&cmd.id()),
            "command {} not derivable from its job",
            cmd.id()
        );
    }
    for job in rec.jobs().values() {
        for r in &job.rules {
            for gid in &r.group_ids {
                assert!(
                    rec.link().contains(gid, &job.id),
                    "missing back-reference {gid} -> {}",
                    job.id
                );
            }
        }
    }
}

#[test]
fn test_basic_install() {
    let (mut rec, mut wheel) = harness();
    rec.add_group(group("G", &[NODE]));
    rec.add_job(
        job("J", "sys", vec![rule("r1", "*/5 * * * * *", &["G"])]),
        true,
    );

    assert_eq!(rec.cmds().len(), 1);
    assert!(rec.jobs().contains_key("J"));

    let msgs = drain(&mut wheel);
    assert_eq!(msgs.len(), 1);
    assert!(matches!(
        &msgs[0],
        WheelMsg::Schedule { id, timer, .. } if id == "J/r1" && timer == "*/5 * * * * *"
    ));
    assert_consistent(&rec);
}

#[test]
fn test_add_job_not_targeting_records_link_only() {
    let (mut rec, mut wheel) = harness();
    rec.add_group(group("G", &[]));
    rec.add_job(job("J", "sys", vec![rule("r1", "0 * * * * *", &["G"])]), true);

    assert!(rec.jobs().is_empty());
    assert!(rec.cmds().is_empty());
    assert!(rec.link().contains("G", "J"));
    assert!(drain(&mut wheel).is_empty());
}

#[tokio::test]
async fn test_group_removes_node() {
    let (mut rec, mut wheel) = harness();
    rec.add_group(group("G", &[NODE]));
    rec.add_job(
        job("J", "sys", vec![rule("r1", "*/5 * * * * *", &["G"])]),
        false,
    );
    drain(&mut wheel);

    rec.mod_group(group("G", &[])).await;

    assert!(rec.cmds().is_empty());
    assert!(!rec.jobs().contains_key("J"));
    // The back-reference survives so a flip back in can re-fetch the job.
    assert!(rec.link().contains("G", "J"));

    let msgs = drain(&mut wheel);
    assert_eq!(msgs.len(), 1);
    assert!(matches!(&msgs[0], WheelMsg::Remove { id } if id == "J/r1"));
    assert_consistent(&rec);
}

#[tokio::test]
async fn test_group_add_node_fetches_missing_job() {
    let j = job("J", "sys", vec![rule("r1", "*/5 * * * * *", &["G"])]);
    let (mut rec, mut wheel) = harness_with(MapSource::default().with_job(j.clone()));

    rec.add_group(group("G", &[]));
    rec.add_job(j, false);
    assert!(rec.jobs().is_empty() && rec.cmds().is_empty());

    rec.mod_group(group("G", &[NODE])).await;

    assert_eq!(rec.cmds().len(), 1);
    assert!(rec.jobs().contains_key("J"));
    let msgs = drain(&mut wheel);
    assert_eq!(msgs.len(), 1);
    assert!(matches!(&msgs[0], WheelMsg::Schedule { id, .. } if id == "J/r1"));
    assert_consistent(&rec);
}

#[tokio::test]
async fn test_tombstone_blocks_rehydration() {
    let j = job("J", "sys", vec![rule("r1", "*/5 * * * * *", &["G"])]);
    let (mut rec, mut wheel) = harness_with(MapSource::default().with_job(j.clone()));

    rec.add_group(group("G", &[]));
    rec.add_job(j, false);
    rec.del_job("J");
    assert!(rec.tombstoned("J"));

    rec.mod_group(group("G", &[NODE])).await;

    // No fetch happened: nothing installed, the stale link is gone, and the
    // tombstone went with its last reference.
    assert!(rec.cmds().is_empty());
    assert!(!rec.link().contains("G", "J"));
    assert!(!rec.tombstoned("J"));
    assert!(drain(&mut wheel).is_empty());
}

#[tokio::test]
async fn test_fetch_failure_drops_link() {
    let (mut rec, mut wheel) = harness();
    rec.add_group(group("G", &[]));
    rec.add_job(job("J", "sys", vec![rule("r1", "0 * * * * *", &["G"])]), false);

    rec.mod_group(group("G", &[NODE])).await;

    assert!(rec.cmds().is_empty());
    assert!(!rec.link().contains("G", "J"));
    assert!(drain(&mut wheel).is_empty());
}

#[test]
fn test_timer_change_reschedules_exactly_one() {
    let (mut rec, mut wheel) = harness();
    rec.add_group(group("G", &[NODE]));
    rec.add_job(
        job(
            "J",
            "sys",
            vec![
                rule("r1", "0 * * * * *", &["G"]),
                rule("r2", "30 * * * * *", &["G"]),
            ],
        ),
        false,
    );
    drain(&mut wheel);

    rec.mod_job(job(
        "J",
        "sys",
        vec![
            rule("r1", "15 * * * * *", &["G"]),
            rule("r2", "30 * * * * *", &["G"]),
        ],
    ));

    let msgs = drain(&mut wheel);
    assert_eq!(msgs.len(), 1, "only the changed rule re-schedules");
    assert!(matches!(
        &msgs[0],
        WheelMsg::Schedule { id, timer, .. } if id == "J/r1" && timer == "15 * * * * *"
    ));
    assert_eq!(rec.cmds().len(), 2);
    assert_eq!(rec.cmds()["J/r1"].rule.timer, "15 * * * * *");
    assert_consistent(&rec);
}

#[test]
fn test_mod_job_unchanged_timer_updates_payload() {
    let (mut rec, mut wheel) = harness();
    rec.add_group(group("G", &[NODE]));
    rec.add_job(job("J", "sys", vec![rule("r1", "0 * * * * *", &["G"])]), false);
    drain(&mut wheel);

    let mut changed = job("J", "sys", vec![rule("r1", "0 * * * * *", &["G"])]);
    changed.command = "echo updated".to_string();
    rec.mod_job(changed);

    assert!(drain(&mut wheel).is_empty(), "unchanged timer must not touch the wheel");
    assert_eq!(rec.cmds()["J/r1"].job.command, "echo updated");
    assert_eq!(rec.jobs()["J"].command, "echo updated");
}

#[test]
fn test_mod_job_dropped_rule_descheduled() {
    let (mut rec, mut wheel) = harness();
    rec.add_group(group("G", &[NODE]));
    rec.add_job(
        job(
            "J",
            "sys",
            vec![
                rule("r1", "0 * * * * *", &["G"]),
                rule("r2", "30 * * * * *", &["G"]),
            ],
        ),
        false,
    );
    drain(&mut wheel);

    rec.mod_job(job("J", "sys", vec![rule("r1", "0 * * * * *", &["G"])]));

    let msgs = drain(&mut wheel);
    assert_eq!(msgs.len(), 1);
    assert!(matches!(&msgs[0], WheelMsg::Remove { id } if id == "J/r2"));
    assert_eq!(rec.cmds().len(), 1);
    assert_consistent(&rec);
}

#[test]
fn test_mod_job_unknown_delegates_to_add() {
    let (mut rec, mut wheel) = harness();
    rec.add_group(group("G", &[NODE]));

    rec.mod_job(job("J", "sys", vec![rule("r1", "0 * * * * *", &["G"])]));

    assert!(rec.jobs().contains_key("J"));
    assert_eq!(drain(&mut wheel).len(), 1);
    assert_consistent(&rec);
}

#[test]
fn test_add_then_del_job_round_trip() {
    let (mut rec, mut wheel) = harness();
    rec.add_group(group("G", &[NODE]));
    rec.add_job(job("J", "sys", vec![rule("r1", "0 * * * * *", &["G"])]), false);
    drain(&mut wheel);

    rec.del_job("J");

    assert!(rec.jobs().is_empty());
    assert!(rec.cmds().is_empty());
    assert!(!rec.link().contains("G", "J"));
    assert!(rec.tombstoned("J"), "tombstone outlives the job");

    let msgs = drain(&mut wheel);
    assert_eq!(msgs.len(), 1);
    assert!(matches!(&msgs[0], WheelMsg::Remove { id } if id == "J/r1"));
}

#[test]
fn test_readded_job_clears_tombstone() {
    let (mut rec, _wheel) = harness();
    rec.add_group(group("G", &[NODE]));
    rec.add_job(job("J", "sys", vec![rule("r1", "0 * * * * *", &["G"])]), false);
    rec.del_job("J");
    assert!(rec.tombstoned("J"));

    rec.add_job(job("J", "sys", vec![rule("r1", "0 * * * * *", &["G"])]), false);
    assert!(!rec.tombstoned("J"));
    assert!(rec.jobs().contains_key("J"));
}

#[test]
fn test_add_then_del_group_round_trip() {
    let (mut rec, _wheel) = harness();
    rec.add_group(group("G", &[NODE]));
    rec.del_group("G");

    assert!(rec.groups().is_empty());
    assert!(rec.link().is_empty());
}

#[test]
fn test_del_group_probes_job_under_same_id() {
    let (mut rec, mut wheel) = harness();
    rec.add_group(group("X", &[]));
    // The job's id collides with the group id; its rule matches this node
    // directly, so commands are installed regardless of group membership.
    rec.add_job(
        job(
            "X",
            "sys",
            vec![rule_full("r1", "0 * * * * *", &["X"], &[NODE], &[])],
        ),
        false,
    );
    assert_eq!(rec.cmds().len(), 1);
    drain(&mut wheel);

    rec.del_group("X");

    // Deleting the group also strips the same-named job's commands, even
    // though its targeting still matches; the job itself stays put.
    assert!(rec.cmds().is_empty());
    assert!(rec.jobs().contains_key("X"));
    let msgs = drain(&mut wheel);
    assert_eq!(msgs.len(), 1);
    assert!(matches!(&msgs[0], WheelMsg::Remove { id } if id == "X/r1"));
}

#[tokio::test]
async fn test_mod_group_same_membership_updates_catalogue() {
    let (mut rec, mut wheel) = harness();
    rec.add_group(group("G", &[NODE, "10.0.0.2"]));
    rec.add_job(job("J", "sys", vec![rule("r1", "0 * * * * *", &["G"])]), false);
    drain(&mut wheel);

    rec.mod_group(group("G", &[NODE])).await;

    assert!(drain(&mut wheel).is_empty());
    assert_eq!(rec.groups()["G"].node_ids, vec![NODE.to_string()]);
    assert_eq!(rec.cmds().len(), 1);
    assert_consistent(&rec);
}

#[tokio::test]
async fn test_mod_group_unknown_is_added() {
    let (mut rec, _wheel) = harness();
    rec.mod_group(group("G", &[NODE])).await;
    assert!(rec.groups().contains_key("G"));
}

#[test]
fn test_one_shot_membership_checks() {
    let (mut rec, _wheel) = harness();
    rec.add_group(group("G", &[NODE]));
    rec.add_job(job("J", "sys", vec![rule("r1", "0 * * * * *", &["G"])]), false);

    assert!(rec.one_shot("J", None).is_some());
    assert!(rec.one_shot("J", Some(NODE)).is_some());
    assert!(rec.one_shot("J", Some("10.9.9.9")).is_none());
    assert!(rec.one_shot("missing", None).is_none());
}

#[test]
fn test_load_seeds_tables() {
    let (mut rec, mut wheel) = harness();

    let mut groups = HashMap::new();
    groups.insert("G".to_string(), group("G", &[NODE]));
    let jobs = vec![job("J", "sys", vec![rule("r1", "0 * * * * *", &["G"])])];

    rec.load(groups, jobs);

    assert_eq!(rec.jobs().len(), 1);
    assert_eq!(rec.cmds().len(), 1);
    assert_eq!(rec.jobs()["J"].run_on.as_deref(), Some(NODE));
    assert_eq!(drain(&mut wheel).len(), 1);
    assert_consistent(&rec);
}

#[tokio::test]
async fn test_membership_flip_out_then_in_round_trip() {
    let j = job("J", "sys", vec![rule("r1", "0 * * * * *", &["G"])]);
    let (mut rec, mut wheel) = harness_with(MapSource::default().with_job(j.clone()));

    rec.add_group(group("G", &[NODE]));
    rec.add_job(j, false);
    drain(&mut wheel);

    rec.mod_group(group("G", &[])).await;
    assert!(rec.cmds().is_empty());

    rec.mod_group(group("G", &[NODE])).await;
    assert_eq!(rec.cmds().len(), 1);
    assert!(rec.jobs().contains_key("J"));
    assert!(rec.groups()["G"].included(NODE));
    assert_consistent(&rec);
}
