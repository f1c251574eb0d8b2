//! Job type registry.
//!
//! Every process that consumes jobs registers the same job types, so an
//! envelope's `job_type` maps back to a constructor.

use crate::envelope::{Envelope, Target};
use crate::error::{JobError, JobResult};
use crate::job::{Cancellable, Job, JobContext, JobFailure};
use async_trait::async_trait;
use parking_lot::RwLock;
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::info;

/// Object-safe view of a [`Job`].
#[async_trait]
pub trait ErasedJob: Send + Sync {
    /// Registered job type.
    fn job_type(&self) -> &'static str;

    /// Invokes a callback.
    async fn call(&self, callback: &str, ctx: &JobContext) -> JobResult<()>;

    /// Forwards to [`Job::failed`].
    fn failed(&self, failure: &JobFailure, error: &str);

    /// Forwards to [`Job::on_complete`].
    fn on_complete(&self, ctx: &JobContext);

    /// Forwards to [`Job::cancellable`].
    fn cancellable(&self) -> Option<&dyn Cancellable>;
}

struct Erased<J>(J);

#[async_trait]
impl<J: Job> ErasedJob for Erased<J> {
    fn job_type(&self) -> &'static str {
        J::NAME
    }

    async fn call(&self, callback: &str, ctx: &JobContext) -> JobResult<()> {
        self.0.call(callback, ctx).await
    }

    fn failed(&self, failure: &JobFailure, error: &str) {
        self.0.failed(failure, error);
    }

    fn on_complete(&self, ctx: &JobContext) {
        self.0.on_complete(ctx);
    }

    fn cancellable(&self) -> Option<&dyn Cancellable> {
        self.0.cancellable()
    }
}

/// Produces job instances for envelopes.
pub trait JobResolver: Send + Sync {
    /// Constructs a job from its type and constructor arguments.
    fn make(&self, job_type: &str, args: &Map<String, Value>) -> JobResult<Box<dyn ErasedJob>>;

    /// Restores a serialized job instance.
    fn restore(&self, job_type: &str, data: Value) -> JobResult<Box<dyn ErasedJob>>;

    /// Builds the job an envelope describes.
    fn resolve(&self, envelope: &Envelope) -> JobResult<Box<dyn ErasedJob>> {
        match &envelope.target {
            Target::Instance { data } => self.restore(&envelope.job_type, data.clone()),
            Target::Class => self.make(&envelope.job_type, &envelope.args),
        }
    }
}

type MakeFn = Arc<dyn Fn(&Map<String, Value>) -> JobResult<Box<dyn ErasedJob>> + Send + Sync>;
type RestoreFn = Arc<dyn Fn(Value) -> JobResult<Box<dyn ErasedJob>> + Send + Sync>;

#[derive(Clone)]
struct Constructors {
    make: MakeFn,
    restore: RestoreFn,
}

/// Registry mapping job type names to constructors.
#[derive(Default)]
pub struct JobRegistry {
    constructors: RwLock<HashMap<String, Constructors>>,
}

impl JobRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a job type built by deserialization.
    ///
    /// Class envelopes deserialize the job from their argument map.
    pub fn register<J: Job + DeserializeOwned>(&self) -> &Self {
        self.register_with::<J, _>(|args| {
            serde_json::from_value(Value::Object(args.clone())).map_err(JobError::from)
        })
    }

    /// Registers a job type with a factory for class envelopes.
    ///
    /// The factory can capture application services the job needs.
    pub fn register_with<J, F>(&self, factory: F) -> &Self
    where
        J: Job + DeserializeOwned,
        F: Fn(&Map<String, Value>) -> JobResult<J> + Send + Sync + 'static,
    {
        let constructors = Constructors {
            make: Arc::new(move |args: &Map<String, Value>| {
                factory(args).map(|job| Box::new(Erased(job)) as Box<dyn ErasedJob>)
            }),
            restore: Arc::new(|data| {
                let job: J = serde_json::from_value(data)?;
                Ok(Box::new(Erased(job)) as Box<dyn ErasedJob>)
            }),
        };

        self.constructors
            .write()
            .insert(J::NAME.to_string(), constructors);
        info!(job_type = J::NAME, "Registered job type");
        self
    }

    /// Returns true if the job type is registered.
    pub fn contains(&self, job_type: &str) -> bool {
        self.constructors.read().contains_key(job_type)
    }

    /// Registered job type names, sorted.
    pub fn job_types(&self) -> Vec<String> {
        let mut names: Vec<String> = self.constructors.read().keys().cloned().collect();
        names.sort();
        names
    }

    fn constructors(&self, job_type: &str) -> JobResult<Constructors> {
        self.constructors
            .read()
            .get(job_type)
            .cloned()
            .ok_or_else(|| JobError::UnknownJobType(job_type.to_string()))
    }
}

impl JobResolver for JobRegistry {
    fn make(&self, job_type: &str, args: &Map<String, Value>) -> JobResult<Box<dyn ErasedJob>> {
        (self.constructors(job_type)?.make)(args)
    }

    fn restore(&self, job_type: &str, data: Value) -> JobResult<Box<dyn ErasedJob>> {
        (self.constructors(job_type)?.restore)(data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::QueuedJob;
    use crate::job::JobId;
    use crate::state::CancellationToken;
    use chrono::Utc;
    use serde::{Deserialize, Serialize};
    use serde_json::json;
    use std::sync::atomic::{AtomicU32, Ordering};

    static LAST_TOTAL: AtomicU32 = AtomicU32::new(0);

    #[derive(Debug, Serialize, Deserialize)]
    struct Sum {
        a: u32,
        b: u32,
    }

    #[async_trait]
    impl Job for Sum {
        const NAME: &'static str = "sum";

        async fn handle(&self, _ctx: &JobContext) -> JobResult<()> {
            LAST_TOTAL.store(self.a + self.b, Ordering::SeqCst);
            Ok(())
        }
    }

    fn context() -> JobContext {
        JobContext {
            job_id: JobId::new(),
            job_type: "sum".into(),
            queue: "default".into(),
            driver: "async".into(),
            attempts: 0,
            args: Map::new(),
            token: CancellationToken::new(),
            tracker: None,
        }
    }

    #[tokio::test]
    async fn test_resolve_instance_envelope() {
        let registry = JobRegistry::new();
        registry.register::<Sum>();

        let envelope = QueuedJob::new(&Sum { a: 2, b: 3 })
            .unwrap()
            .into_envelope("default", Utc::now());
        let job = registry.resolve(&envelope).unwrap();

        assert_eq!(job.job_type(), "sum");
        job.call("handle", &context()).await.unwrap();
        assert_eq!(LAST_TOTAL.load(Ordering::SeqCst), 5);
    }

    #[test]
    fn test_resolve_class_envelope_with_factory() {
        let registry = JobRegistry::new();
        registry.register_with::<Sum, _>(|args| {
            let a = args.get("a").and_then(Value::as_u64).unwrap_or(0);
            Ok(Sum {
                a: u32::try_from(a).unwrap_or(0),
                b: 100,
            })
        });

        let mut args = Map::new();
        args.insert("a".into(), json!(1));
        let envelope = QueuedJob::class::<Sum>(args).into_envelope("default", Utc::now());

        assert!(registry.resolve(&envelope).is_ok());
    }

    #[test]
    fn test_unknown_job_type() {
        let registry = JobRegistry::new();
        let envelope = QueuedJob::named("missing", Map::new()).into_envelope("default", Utc::now());

        let err = registry.resolve(&envelope).err().unwrap();
        assert!(matches!(err, JobError::UnknownJobType(name) if name == "missing"));
    }

    #[test]
    fn test_restore_with_wrong_shape_fails() {
        let registry = JobRegistry::new();
        registry.register::<Sum>();
        assert!(registry.restore("sum", json!({"a": "x"})).is_err());
    }

    #[test]
    fn test_job_types_sorted() {
        let registry = JobRegistry::new();
        registry.register::<Sum>();
        assert!(registry.contains("sum"));
        assert_eq!(registry.job_types(), vec!["sum".to_string()]);
    }
}
