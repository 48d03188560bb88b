pub mod api;
pub mod clock;
pub mod config;
pub mod data;
pub mod db;
pub mod error;
pub mod mastery;
pub mod models;
pub mod queue;
pub mod session;
pub mod srs;

pub use config::SchedulerConfig;
pub use error::SchedulerError;
pub use models::{Fact, PackMeta, UserConfig};
pub use queue::{build_queue, FactQueue, QueueBuild};
pub use session::{
    NoopObserver, ProvisionRequest, Provisioner, SessionController, SessionObserver, SessionReport,
    SessionStart, SessionState,
};
