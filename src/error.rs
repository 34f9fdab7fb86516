use thiserror::Error;

#[derive(Error, Debug)]
pub enum CronError {
    #[error("Invalid job: {0}")]
    InvalidJob(String),

    #[error("Invalid cron expression {expr:?}: {source}")]
    InvalidCron {
        expr: String,
        #[source]
        source: cron::error::Error,
    },

    #[error("Lease {0} expired or was revoked")]
    LeaseExpired(i64),

    #[error("Watch error: {0}")]
    Watch(String),

    #[error("etcd error: {0}")]
    Etcd(#[from] etcd_client::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, CronError>;
