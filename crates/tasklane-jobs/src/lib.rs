//! Tasklane Jobs - Job Dispatch and Processing
//!
//! Moves units of work from a producer to a consumer through one of several
//! interchangeable backends:
//! - Database table polled by workers, with optimistic row reservation
//! - Redis lists, with a sorted set per queue for delayed jobs
//! - AMQP broker queues, with broker-side delays through `x-delay`
//! - Inline execution in the producing process
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                   Tasklane Jobs Architecture                     │
//! ├─────────────────────────────────────────────────────────────────┤
//! │                                                                  │
//! │  Producer ── Queue::dispatch ──┬── ExecutionContext::sync ──┐    │
//! │                                │                            │    │
//! │                                ▼                            ▼    │
//! │  ┌─────────────────────────────────────────────┐   ┌──────────┐  │
//! │  │ Driver::push (Envelope, base64 JSON)        │   │  Inline  │  │
//! │  │  ┌──────────┐ ┌──────────┐ ┌──────────┐     │   │ (async)  │  │
//! │  │  │ Database │ │  Redis   │ │   AMQP   │     │   └────┬─────┘  │
//! │  │  └────┬─────┘ └────┬─────┘ └────┬─────┘     │        │        │
//! │  └───────┼────────────┼────────────┼───────────┘        │        │
//! │          ▼            ▼            ▼                    │        │
//! │  ┌─────────────────────────────────────────────┐        │        │
//! │  │ Driver::consume (worker process)            │        │        │
//! │  └──────────────────────┬──────────────────────┘        │        │
//! │                         ▼                               ▼        │
//! │  ┌─────────────────────────────────────────────────────────┐    │
//! │  │ JobExecutor: resolve ─ call ─ settle                     │    │
//! │  │   JobStateManager (cancellation)   JobTracker (history)  │    │
//! │  └─────────────────────────────────────────────────────────┘    │
//! │                                                                  │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Example
//!
//! ```rust,ignore
//! use tasklane_jobs::prelude::*;
//! use serde::{Deserialize, Serialize};
//!
//! #[derive(Debug, Serialize, Deserialize)]
//! struct SendEmailJob {
//!     to: String,
//! }
//!
//! #[async_trait::async_trait]
//! impl Job for SendEmailJob {
//!     const NAME: &'static str = "send_email";
//!     const QUEUE: &'static str = "emails";
//!
//!     async fn handle(&self, ctx: &JobContext) -> JobResult<()> {
//!         ctx.check_cancelled()?;
//!         Ok(())
//!     }
//! }
//!
//! let registry = Arc::new(JobRegistry::new());
//! registry.register::<SendEmailJob>();
//!
//! let queue = Queue::from_config(&config, registry).await?;
//! queue.dispatch(&SendEmailJob { to: "user@example.com".into() }).await?;
//! ```

pub mod config;
pub mod context;
pub mod driver;
pub mod envelope;
pub mod error;
pub mod exchange;
pub mod executor;
pub mod job;
pub mod metrics;
mod provider;
pub mod queue;
pub mod registry;
pub mod state;
pub mod store;
pub mod tracker;

pub use config::{
    AmqpDriverConfig, AsyncDriverConfig, BindingConfig, DatabaseDriverConfig, DriversConfig, ExchangeConfig,
    QueueConfig, RedisDriverConfig, TrackingConfig,
};
pub use context::ExecutionContext;
pub use driver::{
    AmqpDelivery, AmqpDriver, AmqpTransport, AsyncDriver, ConsumeOptions, DatabaseDriver, DispatchOptions, Driver,
    LapinTransport, MemoryBroker, MemoryRedis, PooledRedis, Publication, RedisCommands, RedisDriver, RedisKeys, When,
};
pub use envelope::{Envelope, QueuedJob, Target};
pub use error::{JobError, JobResult};
pub use exchange::{topic_matches, QueueBinding, RoutingKey, TopicExchange};
pub use executor::{Execution, ExecutionReport, JobExecutor, Outcome};
pub use job::{Cancellable, Job, JobContext, JobFailure, JobId, JobStatus};
pub use metrics::{register_metrics, JobMetrics};
pub use queue::Queue;
pub use registry::{ErasedJob, JobRegistry, JobResolver};
pub use state::{ActiveJob, CancellationToken, JobStateManager};
pub use store::{MemoryRecordStore, RecordStore, SqlRecordStore};
pub use tracker::{JobStats, JobTracker};

/// Re-export commonly used traits
pub mod prelude {
    pub use crate::driver::{Driver, When};
    pub use crate::job::{Cancellable, Job, JobStatus};
    pub use crate::queue::Queue;
    pub use crate::registry::JobRegistry;
    pub use crate::{ExecutionContext, JobContext, JobError, JobId, JobResult};
}
