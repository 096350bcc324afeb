pub mod api;
pub mod config;
pub mod engine;
pub mod error;
pub mod metrics;
pub mod model;
pub mod pool;

pub use config::Config;
pub use engine::AlertEngine;
pub use error::AlertflowError;
pub use metrics::{Metrics, MetricsReporter};
pub use model::{
    AlertDefinition, AlertNotification, Condition, ConditionClause, ConditionResult, Direction,
    FeedStatus, PriceTick, TriggerRecord,
};
pub use pool::{PoolStats, TaskKind, WorkerPool};
