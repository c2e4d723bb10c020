use serde::{Deserialize, Serialize};

use crate::model::{GroupId, NodeId};

/// A named set of nodes. Jobs target groups; membership changes are what the
/// reconciler recomputes assignments from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Group {
    pub id: GroupId,
    #[serde(default)]
    pub name: String,
    #[serde(rename = "nids", default)]
    pub node_ids: Vec<NodeId>,
}

impl Group {
    pub fn included(&self, node_id: &str) -> bool {
        self.node_ids.iter().any(|n| n == node_id)
    }
}
