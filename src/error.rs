use thiserror::Error;

#[derive(Debug, Error)]
pub enum SchedulerError {
    /// No user or fact pool has been loaded yet.
    #[error("scheduler is not ready: no active user or fact pool")]
    NotReady,

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// The pool stayed too small even after one provisioning round.
    #[error("cannot build a session from the available facts")]
    CannotBuildSession,

    #[error("fact provisioning failed: {0}")]
    ProvisioningFailed(#[source] Box<dyn std::error::Error + Send + Sync + 'static>),

    #[error("fact {0} is not the current fact of this session")]
    FactNotTracked(String),
}

pub type Result<T> = std::result::Result<T, SchedulerError>;
