//! AMQP driver: persistent messages on durable broker queues.
//!
//! Delays rely on the broker's delayed-message plugin reading `x-delay`.
//! Every delivery is acked once after the handler returns, whatever the
//! outcome. Broker policy (dead-letter exchange, TTL) is the only backstop
//! for failed jobs.
//!
//! The driver talks to the broker through [`AmqpTransport`]. [`LapinTransport`]
//! is the network implementation; [`MemoryBroker`] keeps queues in process.

use super::{ConsumeOptions, DispatchOptions, Driver};
use crate::config::AmqpDriverConfig;
use crate::envelope::QueuedJob;
use crate::error::{JobError, JobResult};
use crate::exchange::topic_matches;
use crate::executor::{Execution, JobExecutor};
use crate::job::JobId;
use crate::metrics::JobMetrics;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::BoxStream;
use futures::StreamExt;
use lapin::options::{
    BasicAckOptions, BasicConsumeOptions, BasicPublishOptions, BasicQosOptions, ConfirmSelectOptions,
    ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions,
};
use lapin::types::{AMQPValue, FieldTable};
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties, ExchangeKind};
use parking_lot::Mutex as SyncMutex;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, Notify};
use tracing::{debug, info, warn, Instrument};

const NAME: &str = "amqp";

/// Persistent delivery mode.
const PERSISTENT: u8 = 2;

/// One message on its way to the broker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Publication {
    /// Exchange; empty for the default exchange.
    pub exchange: String,

    /// Routing key. Equals `queue` on the default exchange.
    pub routing_key: String,

    /// Queue declared, and bound when `exchange` is named.
    pub queue: String,

    /// Encoded envelope.
    pub payload: Vec<u8>,

    /// Broker-side delay in milliseconds.
    pub delay_ms: Option<i64>,
}

/// A message handed to a consumer, acked by tag.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AmqpDelivery {
    pub tag: u64,
    pub data: Vec<u8>,
}

/// Deliveries for one subscription. Ends when the channel closes.
pub type DeliveryStream = BoxStream<'static, JobResult<AmqpDelivery>>;

/// The broker operations the driver issues.
#[async_trait]
pub trait AmqpTransport: Send + Sync {
    /// Declares the target and publishes with publisher confirms.
    async fn publish(&self, publication: &Publication) -> JobResult<()>;

    /// Starts consuming `queue` with at most `prefetch` unacked deliveries.
    async fn subscribe(&self, queue: &str, prefetch: u16) -> JobResult<DeliveryStream>;

    /// Acknowledges a delivery on the current channel.
    async fn ack(&self, tag: u64) -> JobResult<()>;

    /// Drops the connection; the next call reconnects.
    async fn reset(&self);
}

struct Session {
    // kept alive for the channel
    _connection: Connection,
    channel: Channel,
}

/// Transport over a lapin connection, opened lazily and reopened after
/// [`reset`](AmqpTransport::reset) or a closed channel.
pub struct LapinTransport {
    config: AmqpDriverConfig,
    session: Mutex<Option<Session>>,
}

impl LapinTransport {
    /// Creates a transport that connects on first use.
    pub fn new(config: AmqpDriverConfig) -> Self {
        Self {
            config,
            session: Mutex::new(None),
        }
    }

    /// Creates a transport and opens its connection.
    ///
    /// An unreachable broker is a configuration error here; later failures
    /// are transient.
    pub async fn connect(config: AmqpDriverConfig) -> JobResult<Self> {
        let transport = Self::new(config);
        transport
            .channel()
            .await
            .map_err(|e| JobError::Configuration(format!("Failed to connect to AMQP broker: {e}")))?;
        Ok(transport)
    }

    /// Returns an open channel, reconnecting if the previous one closed.
    async fn channel(&self) -> JobResult<Channel> {
        let mut session = self.session.lock().await;
        if let Some(existing) = session.as_ref() {
            if existing.channel.status().connected() {
                return Ok(existing.channel.clone());
            }
            debug!("AMQP channel closed, reconnecting");
        }

        info!(host = %self.config.host, port = self.config.port, vhost = %self.config.vhost, "Connecting to AMQP broker");
        let connection = Connection::connect(&self.config.uri(), ConnectionProperties::default()).await?;
        let channel = connection.create_channel().await?;
        channel.confirm_select(ConfirmSelectOptions::default()).await?;

        *session = Some(Session {
            _connection: connection,
            channel: channel.clone(),
        });
        Ok(channel)
    }

    async fn declare_queue(&self, channel: &Channel, queue: &str) -> JobResult<()> {
        channel
            .queue_declare(
                queue,
                QueueDeclareOptions {
                    durable: true,
                    ..QueueDeclareOptions::default()
                },
                FieldTable::default(),
            )
            .await?;
        Ok(())
    }

    async fn declare_binding(&self, channel: &Channel, publication: &Publication) -> JobResult<()> {
        channel
            .exchange_declare(
                &publication.exchange,
                exchange_kind(&self.config.exchange_type),
                ExchangeDeclareOptions {
                    durable: true,
                    ..ExchangeDeclareOptions::default()
                },
                FieldTable::default(),
            )
            .await?;
        channel
            .queue_bind(
                &publication.queue,
                &publication.exchange,
                &publication.routing_key,
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await?;
        Ok(())
    }
}

#[async_trait]
impl AmqpTransport for LapinTransport {
    async fn publish(&self, publication: &Publication) -> JobResult<()> {
        let channel = self.channel().await?;
        self.declare_queue(&channel, &publication.queue).await?;
        if !publication.exchange.is_empty() {
            self.declare_binding(&channel, publication).await?;
        }
        channel
            .basic_publish(
                &publication.exchange,
                &publication.routing_key,
                BasicPublishOptions::default(),
                &publication.payload,
                publish_properties(publication.delay_ms),
            )
            .await?
            .await?;
        Ok(())
    }

    async fn subscribe(&self, queue: &str, prefetch: u16) -> JobResult<DeliveryStream> {
        let channel = self.channel().await?;
        self.declare_queue(&channel, queue).await?;
        channel.basic_qos(prefetch, BasicQosOptions::default()).await?;

        let tag = format!("tasklane-{}", uuid::Uuid::new_v4());
        let consumer = channel
            .basic_consume(queue, &tag, BasicConsumeOptions::default(), FieldTable::default())
            .await?;
        info!(consumer_tag = %tag, prefetch, "AMQP consumer started");

        Ok(consumer
            .map(|delivery| -> JobResult<AmqpDelivery> {
                let delivery = delivery?;
                Ok(AmqpDelivery {
                    tag: delivery.delivery_tag,
                    data: delivery.data,
                })
            })
            .boxed())
    }

    async fn ack(&self, tag: u64) -> JobResult<()> {
        let channel = self.channel().await?;
        channel.basic_ack(tag, BasicAckOptions::default()).await?;
        Ok(())
    }

    async fn reset(&self) {
        self.session.lock().await.take();
    }
}

fn exchange_kind(kind: &str) -> ExchangeKind {
    match kind {
        "direct" => ExchangeKind::Direct,
        "fanout" => ExchangeKind::Fanout,
        "headers" => ExchangeKind::Headers,
        "topic" => ExchangeKind::Topic,
        other => ExchangeKind::Custom(other.to_string()),
    }
}

#[derive(Default)]
struct BrokerState {
    queues: HashMap<String, VecDeque<Vec<u8>>>,
    // (exchange, queue, pattern)
    bindings: Vec<(String, String, String)>,
    published: Vec<Publication>,
    unacked: HashMap<u64, (String, Vec<u8>)>,
    acked: usize,
    peak_unacked: usize,
    next_tag: u64,
    fail_publishes: usize,
    fail_deliveries: usize,
    resets: usize,
}

impl BrokerState {
    fn unacked_on(&self, queue: &str) -> usize {
        self.unacked.values().filter(|(q, _)| q == queue).count()
    }

    fn requeue_unacked(&mut self) {
        let mut pending: Vec<(u64, (String, Vec<u8>))> = self.unacked.drain().collect();
        pending.sort_by_key(|(tag, _)| std::cmp::Reverse(*tag));
        for (_, (queue, data)) in pending {
            self.queues.entry(queue).or_default().push_front(data);
        }
    }
}

/// In-process stand-in for an AMQP broker.
///
/// Honors prefetch, requeues unacked deliveries on reset and routes named
/// exchanges through topic bindings. Failures can be injected for the next
/// publishes or deliveries.
#[derive(Clone, Default)]
pub struct MemoryBroker {
    state: Arc<SyncMutex<BrokerState>>,
    changed: Arc<Notify>,
}

impl MemoryBroker {
    /// Creates an empty broker.
    pub fn new() -> Self {
        Self::default()
    }

    /// Every accepted publication, in order.
    pub fn published(&self) -> Vec<Publication> {
        self.state.lock().published.clone()
    }

    /// Messages waiting in `queue`.
    pub fn queue_len(&self, queue: &str) -> usize {
        self.state.lock().queues.get(queue).map_or(0, VecDeque::len)
    }

    /// Deliveries acknowledged so far.
    pub fn acked(&self) -> usize {
        self.state.lock().acked
    }

    /// Deliveries handed out and not yet acknowledged.
    pub fn unacked(&self) -> usize {
        self.state.lock().unacked.len()
    }

    /// Most deliveries ever outstanding at once.
    pub fn peak_unacked(&self) -> usize {
        self.state.lock().peak_unacked
    }

    /// Connection resets requested by clients.
    pub fn resets(&self) -> usize {
        self.state.lock().resets
    }

    /// Makes the next `n` publishes fail as if the connection dropped.
    pub fn fail_next_publishes(&self, n: usize) {
        self.state.lock().fail_publishes = n;
    }

    /// Makes the next `n` deliveries arrive as channel errors.
    pub fn fail_next_deliveries(&self, n: usize) {
        self.state.lock().fail_deliveries = n;
        self.changed.notify_waiters();
    }

    fn next_delivery(&self, queue: &str, prefetch: usize) -> Option<JobResult<AmqpDelivery>> {
        let mut state = self.state.lock();
        if state.fail_deliveries > 0 {
            state.fail_deliveries -= 1;
            return Some(Err(JobError::Unavailable("channel closed by broker".to_string())));
        }
        if state.unacked_on(queue) >= prefetch {
            return None;
        }
        let data = state.queues.get_mut(queue).and_then(VecDeque::pop_front)?;
        state.next_tag += 1;
        let tag = state.next_tag;
        state.unacked.insert(tag, (queue.to_string(), data.clone()));
        state.peak_unacked = state.peak_unacked.max(state.unacked.len());
        Some(Ok(AmqpDelivery { tag, data }))
    }

    async fn wait_delivery(&self, queue: &str, prefetch: usize) -> JobResult<AmqpDelivery> {
        loop {
            let notified = self.changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(delivery) = self.next_delivery(queue, prefetch) {
                return delivery;
            }
            notified.await;
        }
    }
}

#[async_trait]
impl AmqpTransport for MemoryBroker {
    async fn publish(&self, publication: &Publication) -> JobResult<()> {
        {
            let mut state = self.state.lock();
            if state.fail_publishes > 0 {
                state.fail_publishes -= 1;
                return Err(JobError::Unavailable("broker connection lost".to_string()));
            }

            state.queues.entry(publication.queue.clone()).or_default();
            let targets: Vec<String> = if publication.exchange.is_empty() {
                vec![publication.routing_key.clone()]
            } else {
                let binding = (
                    publication.exchange.clone(),
                    publication.queue.clone(),
                    publication.routing_key.clone(),
                );
                if !state.bindings.contains(&binding) {
                    state.bindings.push(binding);
                }
                let mut targets: Vec<String> = state
                    .bindings
                    .iter()
                    .filter(|(exchange, _, pattern)| {
                        *exchange == publication.exchange && topic_matches(pattern, &publication.routing_key)
                    })
                    .map(|(_, queue, _)| queue.clone())
                    .collect();
                targets.sort();
                targets.dedup();
                targets
            };
            for queue in targets {
                state
                    .queues
                    .entry(queue)
                    .or_default()
                    .push_back(publication.payload.clone());
            }
            state.published.push(publication.clone());
        }
        self.changed.notify_waiters();
        Ok(())
    }

    async fn subscribe(&self, queue: &str, prefetch: u16) -> JobResult<DeliveryStream> {
        let broker = self.clone();
        let queue = queue.to_string();
        let prefetch = usize::from(prefetch.max(1));
        Ok(futures::stream::unfold((), move |()| {
            let broker = broker.clone();
            let queue = queue.clone();
            async move { Some((broker.wait_delivery(&queue, prefetch).await, ())) }
        })
        .boxed())
    }

    async fn ack(&self, tag: u64) -> JobResult<()> {
        {
            let mut state = self.state.lock();
            if state.unacked.remove(&tag).is_none() {
                return Err(JobError::Unavailable(format!("unknown delivery tag {tag}")));
            }
            state.acked += 1;
        }
        self.changed.notify_waiters();
        Ok(())
    }

    async fn reset(&self) {
        {
            let mut state = self.state.lock();
            state.resets += 1;
            state.requeue_unacked();
        }
        self.changed.notify_waiters();
    }
}

/// Driver publishing envelopes to an AMQP broker.
pub struct AmqpDriver {
    config: AmqpDriverConfig,
    executor: JobExecutor,
    transport: Arc<dyn AmqpTransport>,
}

impl AmqpDriver {
    /// Creates a driver that connects on first use.
    pub fn new(config: AmqpDriverConfig, executor: JobExecutor) -> Self {
        let transport = Arc::new(LapinTransport::new(config.clone()));
        Self::with_transport(transport, config, executor)
    }

    /// Creates a driver and opens its connection.
    pub async fn connect(config: AmqpDriverConfig, executor: JobExecutor) -> JobResult<Self> {
        let transport = Arc::new(LapinTransport::connect(config.clone()).await?);
        Ok(Self::with_transport(transport, config, executor))
    }

    /// Creates a driver over any transport.
    pub fn with_transport(transport: Arc<dyn AmqpTransport>, config: AmqpDriverConfig, executor: JobExecutor) -> Self {
        Self {
            config,
            executor,
            transport,
        }
    }

    fn publication(&self, queue: String, payload: String, options: &DispatchOptions, delay_ms: Option<i64>) -> Publication {
        let exchange = options.exchange.clone().unwrap_or_else(|| self.config.exchange.clone());
        let routing_key = match &options.routing_key {
            Some(key) if !exchange.is_empty() => key.clone(),
            _ => queue.clone(),
        };
        Publication {
            exchange,
            routing_key,
            queue,
            payload: payload.into_bytes(),
            delay_ms,
        }
    }

    async fn consume_loop(&self, queue: &str) -> JobResult<()> {
        let pause = Duration::from_millis(self.config.reconnect_interval_ms);
        loop {
            match self.drain(queue).await {
                Ok(()) => warn!("AMQP consumer stream closed, resubscribing"),
                Err(e) if e.is_configuration() => return Err(e),
                Err(e) => warn!(error = %e, "AMQP consumer failed, resubscribing"),
            }
            self.transport.reset().await;
            tokio::time::sleep(pause).await;
        }
    }

    /// Handles deliveries until the subscription ends or errors.
    async fn drain(&self, queue: &str) -> JobResult<()> {
        let mut deliveries = self.transport.subscribe(queue, self.config.prefetch).await?;
        let exec = Execution {
            driver: NAME,
            attempts: 0,
        };
        while let Some(delivery) = deliveries.next().await {
            let delivery = delivery?;
            if let Some((envelope, report)) = self.executor.execute_payload(&delivery.data, exec).await {
                debug!(job_id = %envelope.job_id, status = %report.outcome.status(), "Delivery handled");
            }
            self.transport.ack(delivery.tag).await?;
        }
        Ok(())
    }
}

/// Message properties: persistent, with `x-delay` when delayed.
fn publish_properties(delay_ms: Option<i64>) -> BasicProperties {
    let properties = BasicProperties::default().with_delivery_mode(PERSISTENT);
    match delay_ms {
        Some(ms) => {
            let mut headers = FieldTable::default();
            headers.insert("x-delay".into(), AMQPValue::LongLongInt(ms));
            properties.with_headers(headers)
        }
        None => properties,
    }
}

/// Milliseconds until `available_at`, if it lies in the future.
fn delay_millis(available_at: DateTime<Utc>, now: DateTime<Utc>) -> Option<i64> {
    let ms = (available_at - now).num_milliseconds();
    (ms > 0).then_some(ms)
}

#[async_trait]
impl Driver for AmqpDriver {
    fn name(&self) -> &'static str {
        NAME
    }

    async fn push(&self, jobs: Vec<QueuedJob>, options: &DispatchOptions) -> JobResult<Vec<JobId>> {
        let now = Utc::now();
        let available_at = options.delay.unwrap_or_default().resolve(now);
        let delay_ms = delay_millis(available_at, now);

        let mut ids = Vec::with_capacity(jobs.len());
        for job in jobs {
            let queue = options.queue_for(&job, &self.config.queue).to_string();
            let envelope = job.into_envelope(&queue, available_at);
            let publication = self.publication(queue, envelope.encode()?, options, delay_ms);

            if let Err(e) = self.transport.publish(&publication).await {
                if !e.is_transient() {
                    return Err(e);
                }
                warn!(job_id = %envelope.job_id, error = %e, "Publish failed, reconnecting once");
                self.transport.reset().await;
                self.transport.publish(&publication).await?;
            }

            debug!(
                job_id = %envelope.job_id,
                queue = %publication.queue,
                exchange = %publication.exchange,
                routing_key = %publication.routing_key,
                delay_ms,
                "Published job"
            );
            JobMetrics::jobs_pushed(NAME, &publication.queue, 1);
            ids.push(envelope.job_id);
        }
        Ok(ids)
    }

    async fn consume(&self, options: &ConsumeOptions) -> JobResult<()> {
        let queue = options.queue.clone().unwrap_or_else(|| self.config.queue.clone());
        let span = tracing::info_span!("consume", driver = NAME, queue = %queue);
        self.consume_loop(&queue).instrument(span).await
    }

    async fn retry(&self, _options: &ConsumeOptions) -> JobResult<u64> {
        Err(JobError::Unsupported {
            driver: NAME,
            operation: "retry",
        })
    }
}
