use thiserror::Error;

#[derive(Error, Debug)]
pub enum AgentError {
    #[error("node {node} already registered by pid {pid}")]
    AlreadyRegistered { node: String, pid: String },

    #[error("lease {0} expired")]
    LeaseExpired(i64),

    #[error("job {id} not found in group {group}")]
    JobNotFound { group: String, id: String },

    #[error("invalid cron expression {timer:?} in job {job}: {source}")]
    InvalidTimer {
        job: String,
        timer: String,
        #[source]
        source: cron::error::Error,
    },

    #[error("malformed record at {key}: {source}")]
    Malformed {
        key: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("store error: {0}")]
    Store(#[from] etcd_client::Error),

    #[error("local address detection failed: {0}")]
    NodeAddress(#[from] local_ip_address::Error),
}

pub type Result<T> = std::result::Result<T, AgentError>;
