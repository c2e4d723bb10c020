use crate::error::Result;
use crate::model::NodeId;

pub const DEFAULT_PREFIX: &str = "/cronfleet";
pub const DEFAULT_TTL: i64 = 10;

#[derive(Debug, Clone)]
pub struct AgentConfig {
    /// Identity advertised in the store; the local IP address by default.
    pub node_id: NodeId,
    /// etcd endpoints, host:port format.
    pub endpoints: Vec<String>,
    /// Key prefix all agent keys live under.
    pub prefix: String,
    /// Lease duration and keep-alive period, in seconds.
    pub ttl: i64,
}

impl AgentConfig {
    /// Build a config for the given store endpoints, detecting the node
    /// identity from the local address.
    pub fn new(endpoints: Vec<String>) -> Result<Self> {
        Ok(Self {
            node_id: detect_node_id()?,
            endpoints,
            prefix: DEFAULT_PREFIX.to_string(),
            ttl: DEFAULT_TTL,
        })
    }

    pub fn with_node_id(mut self, node_id: impl Into<NodeId>) -> Self {
        self.node_id = node_id.into();
        self
    }

    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = prefix.into();
        self
    }

    pub fn with_ttl(mut self, ttl: i64) -> Self {
        self.ttl = ttl;
        self
    }
}

/// Detect the identity this agent advertises: the primary local IP address.
pub fn detect_node_id() -> Result<NodeId> {
    Ok(local_ip_address::local_ip()?.to_string())
}
