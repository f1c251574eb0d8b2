//! Job envelope and its wire codec.
//!
//! An envelope names a registered job type instead of carrying code. The
//! payload is JSON, base64-encoded so it fits text columns and list values.

use crate::error::{JobError, JobResult};
use crate::job::{Job, JobId, DEFAULT_CALLBACK};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// What the consumer builds the job from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Target {
    /// A serialized job value, restored by deserialization.
    Instance {
        /// Job fields.
        data: Value,
    },
    /// Only the job type; the resolver constructs it from `args`.
    Class,
}

/// The unit placed on a queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    /// Registered job type.
    pub job_type: String,

    /// How to build the job.
    pub target: Target,

    /// Callback to invoke.
    #[serde(default = "default_callback")]
    pub callback: String,

    /// Constructor arguments for class targets, callback arguments otherwise.
    #[serde(default)]
    pub args: Map<String, Value>,

    /// Assigned once at push time, kept across retries.
    pub job_id: JobId,

    /// Queue the envelope was pushed to.
    pub queue: String,

    /// When the envelope was created.
    pub created_at: DateTime<Utc>,

    /// Earliest time the job may run.
    pub available_at: DateTime<Utc>,
}

fn default_callback() -> String {
    DEFAULT_CALLBACK.to_string()
}

impl Envelope {
    /// Encodes the envelope as base64 text.
    pub fn encode(&self) -> JobResult<String> {
        let json = serde_json::to_vec(self)?;
        Ok(STANDARD.encode(json))
    }

    /// Decodes a payload produced by [`encode`](Self::encode).
    ///
    /// Any failure is reported as [`JobError::CorruptPayload`].
    pub fn decode(payload: impl AsRef<[u8]>) -> JobResult<Self> {
        let text = std::str::from_utf8(payload.as_ref())
            .map_err(|e| JobError::CorruptPayload(format!("payload is not text: {e}")))?;
        let json = STANDARD
            .decode(text.trim())
            .map_err(|e| JobError::CorruptPayload(format!("invalid base64: {e}")))?;
        serde_json::from_slice(&json)
            .map_err(|e| JobError::CorruptPayload(format!("invalid envelope: {e}")))
    }

    /// Human readable description stored in the `name` column.
    pub fn display_name(&self) -> String {
        match self.target {
            Target::Instance { .. } => self.job_type.clone(),
            Target::Class => format!("{} (class)", self.job_type),
        }
    }
}

/// A job ready to be pushed, before it receives an ID.
#[derive(Debug, Clone, PartialEq)]
pub struct QueuedJob {
    job_type: String,
    target: Target,
    callback: String,
    args: Map<String, Value>,
    queue: Option<String>,
}

impl QueuedJob {
    /// Queues a job instance.
    pub fn new<J: Job + Serialize>(job: &J) -> JobResult<Self> {
        Ok(Self {
            job_type: J::NAME.to_string(),
            target: Target::Instance {
                data: serde_json::to_value(job)?,
            },
            callback: default_callback(),
            args: Map::new(),
            queue: Some(J::QUEUE.to_string()),
        })
    }

    /// Queues a job by type; the consumer constructs it from `args`.
    pub fn class<J: Job>(args: Map<String, Value>) -> Self {
        Self {
            queue: Some(J::QUEUE.to_string()),
            ..Self::named(J::NAME, args)
        }
    }

    /// Queues a job by its registered name.
    pub fn named(job_type: impl Into<String>, args: Map<String, Value>) -> Self {
        Self {
            job_type: job_type.into(),
            target: Target::Class,
            callback: default_callback(),
            args,
            queue: None,
        }
    }

    /// Sets the callback to invoke.
    pub fn callback(mut self, callback: impl Into<String>) -> Self {
        self.callback = callback.into();
        self
    }

    /// Adds an argument.
    pub fn arg(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.args.insert(key.into(), value.into());
        self
    }

    /// Overrides the queue declared by the job type.
    pub fn on_queue(mut self, queue: impl Into<String>) -> Self {
        self.queue = Some(queue.into());
        self
    }

    /// Registered job type.
    pub fn job_type(&self) -> &str {
        &self.job_type
    }

    /// Queue declared by the job, if any.
    pub fn queue(&self) -> Option<&str> {
        self.queue.as_deref()
    }

    /// Assigns a fresh ID and produces the envelope.
    pub fn into_envelope(self, queue: &str, available_at: DateTime<Utc>) -> Envelope {
        Envelope {
            job_type: self.job_type,
            target: self.target,
            callback: self.callback,
            args: self.args,
            job_id: JobId::new(),
            queue: queue.to_string(),
            created_at: Utc::now(),
            available_at,
        }
    }
}
