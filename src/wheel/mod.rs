//! The local cron wheel: a task owning every installed schedule and firing
//! due command ids back into the reconciler.
//!
//! The wheel never decides whether a command still exists or what payload it
//! runs with; the reconciler's command table is authoritative at fire time.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::time::Duration;

use chrono::{DateTime, Utc};
use cron::Schedule;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::model::CmdId;

/// How long to park when nothing is installed; any control message re-arms.
const IDLE_TICK: Duration = Duration::from_secs(3600);

#[derive(Debug)]
pub enum WheelMsg {
    /// Insert or replace the schedule under an id.
    Schedule {
        id: CmdId,
        schedule: Schedule,
        timer: String,
    },
    Remove {
        id: CmdId,
    },
}

/// Cheap cloneable sender side of the wheel.
#[derive(Debug, Clone)]
pub struct WheelHandle {
    tx: mpsc::UnboundedSender<WheelMsg>,
}

impl WheelHandle {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<WheelMsg>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    pub fn schedule(&self, id: CmdId, schedule: Schedule, timer: String) {
        let _ = self.tx.send(WheelMsg::Schedule {
            id,
            schedule,
            timer,
        });
    }

    pub fn remove(&self, id: CmdId) {
        let _ = self.tx.send(WheelMsg::Remove { id });
    }
}

struct Entry {
    schedule: Schedule,
    timer: String,
    /// Bumped on every (re-)install; heap slots carrying an older generation
    /// are stale and skipped.
    generation: u64,
}

pub struct Wheel {
    entries: HashMap<CmdId, Entry>,
    heap: BinaryHeap<Reverse<(DateTime<Utc>, u64, CmdId)>>,
    generation: u64,
    fires: mpsc::UnboundedSender<CmdId>,
}

impl Wheel {
    pub fn new(fires: mpsc::UnboundedSender<CmdId>) -> Self {
        Self {
            entries: HashMap::new(),
            heap: BinaryHeap::new(),
            generation: 0,
            fires,
        }
    }

    /// Drive the wheel until cancellation or until both channel sides close.
    pub async fn run(
        mut self,
        mut ctrl: mpsc::UnboundedReceiver<WheelMsg>,
        cancel: CancellationToken,
    ) {
        loop {
            let wait = match self.next_due() {
                Some(at) => (at - Utc::now()).to_std().unwrap_or_default(),
                None => IDLE_TICK,
            };

            // Biased: pending control messages always apply before a fire.
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                msg = ctrl.recv() => match msg {
                    Some(WheelMsg::Schedule { id, schedule, timer }) => {
                        self.install(id, schedule, timer);
                    }
                    Some(WheelMsg::Remove { id }) => {
                        self.entries.remove(&id);
                    }
                    None => break,
                },
                _ = tokio::time::sleep(wait) => self.fire_due(),
            }
        }
        tracing::debug!("wheel stopped");
    }

    fn install(&mut self, id: CmdId, schedule: Schedule, timer: String) {
        self.generation += 1;
        let Some(next) = schedule.after(&Utc::now()).next() else {
            // Expression with no future occurrence; nothing to keep.
            tracing::warn!(cmd_id = %id, timer = %timer, "no upcoming occurrence, dropped");
            self.entries.remove(&id);
            return;
        };

        tracing::debug!(cmd_id = %id, timer = %timer, next = %next, "installed");
        self.heap.push(Reverse((next, self.generation, id.clone())));
        self.entries.insert(
            id,
            Entry {
                schedule,
                timer,
                generation: self.generation,
            },
        );
    }

    /// Earliest live fire time; pops stale heap slots along the way.
    fn next_due(&mut self) -> Option<DateTime<Utc>> {
        loop {
            let (at, live) = match self.heap.peek() {
                Some(Reverse((at, generation, id))) => (
                    *at,
                    self.entries
                        .get(id)
                        .is_some_and(|e| e.generation == *generation),
                ),
                None => return None,
            };
            if live {
                return Some(at);
            }
            self.heap.pop();
        }
    }

    fn fire_due(&mut self) {
        let now = Utc::now();
        loop {
            let due = matches!(self.heap.peek(), Some(Reverse((at, _, _))) if *at <= now);
            if !due {
                return;
            }
            let Some(Reverse((_, generation, id))) = self.heap.pop() else {
                return;
            };
            let Some(entry) = self.entries.get(&id) else {
                continue;
            };
            if entry.generation != generation {
                continue;
            }

            if self.fires.send(id.clone()).is_err() {
                // Receiver gone; the agent is shutting down.
                return;
            }
            tracing::debug!(cmd_id = %id, timer = %entry.timer, "fired");
            if let Some(next) = entry.schedule.after(&now).next() {
                self.heap.push(Reverse((next, generation, id)));
            }
        }
    }
}
