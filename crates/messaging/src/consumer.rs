//! Long-running consumer loop over a [`MessageChannel`] topic.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::future::join_all;
use thiserror::Error;
use tokio::sync::{Semaphore, watch};
use tokio::task::JoinSet;
use tracing::Instrument;

use crate::{Delivery, Message, MessageChannel, Result};

/// How a handler classifies a failure.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HandlerError {
    /// Transient condition; the message should be redelivered with backoff.
    #[error("retryable: {0}")]
    Retryable(String),

    /// The message can never succeed; it goes straight to the dead-letter
    /// destination.
    #[error("permanent: {0}")]
    Permanent(String),
}

/// Handles one message type from one topic.
#[async_trait]
pub trait MessageHandler: Send + Sync + 'static {
    type Message: Message;

    async fn handle(&self, message: Self::Message) -> std::result::Result<(), HandlerError>;
}

/// Bounded exponential redelivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Delivery attempts before a retryable failure is dead-lettered.
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl RetryPolicy {
    /// Delay before redelivering after failed attempt number `attempt` (1-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16);
        self.base_delay
            .saturating_mul(1u32 << exponent)
            .min(self.max_delay)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
        }
    }
}

/// Consumer tuning.
#[derive(Debug, Clone)]
pub struct ConsumerConfig {
    /// Cap on concurrently handled deliveries (and therefore on leased,
    /// unsettled messages).
    pub max_in_flight: usize,
    /// Maximum deliveries leased per poll.
    pub batch_size: usize,
    /// Sleep between polls when the topic is empty or the cap is reached.
    pub poll_interval: Duration,
    /// Bound on one handler invocation; exceeding it counts as retryable.
    pub handler_timeout: Duration,
    /// How long shutdown waits for in-flight handlers before abandoning them.
    pub drain_timeout: Duration,
    pub retry: RetryPolicy,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            max_in_flight: 16,
            batch_size: 8,
            poll_interval: Duration::from_millis(200),
            handler_timeout: Duration::from_secs(10),
            drain_timeout: Duration::from_secs(10),
            retry: RetryPolicy::default(),
        }
    }
}

/// What happened to one delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Acked,
    Retried,
    DeadLettered,
    /// Settling failed; the lease will expire and the message is redelivered.
    Abandoned,
}

impl Outcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Outcome::Acked => "acked",
            Outcome::Retried => "retried",
            Outcome::DeadLettered => "dead_lettered",
            Outcome::Abandoned => "abandoned",
        }
    }
}

/// Drives a [`MessageHandler`] from its topic.
///
/// Each delivery runs in its own task, so one slow order never stalls the
/// others; a semaphore caps how many run at once, and the excess stays
/// buffered in the channel.
pub struct Consumer<C: ?Sized, H> {
    channel: Arc<C>,
    handler: Arc<H>,
    config: Arc<ConsumerConfig>,
    permits: Arc<Semaphore>,
}

impl<C, H> Consumer<C, H>
where
    C: MessageChannel + ?Sized + 'static,
    H: MessageHandler,
{
    /// Creates a new consumer.
    pub fn new(channel: Arc<C>, handler: Arc<H>, config: ConsumerConfig) -> Self {
        let permits = Arc::new(Semaphore::new(config.max_in_flight.max(1)));
        Self {
            channel,
            handler,
            config: Arc::new(config),
            permits,
        }
    }

    /// Topic this consumer reads from.
    pub fn topic(&self) -> &'static str {
        <H::Message as Message>::TOPIC
    }

    /// Leases one batch and handles it to completion.
    ///
    /// Used by tests and tooling that need deterministic stepping.
    pub async fn poll_once(&self) -> Result<Vec<Outcome>> {
        let deliveries = self
            .channel
            .receive(self.topic(), self.config.batch_size)
            .await?;

        let outcomes = join_all(deliveries.into_iter().map(|delivery| {
            Self::process(
                self.channel.clone(),
                self.handler.clone(),
                self.config.clone(),
                delivery,
            )
        }))
        .await;
        Ok(outcomes)
    }

    /// Runs until `shutdown` flips to `true` (or its sender is dropped), then
    /// drains in-flight deliveries.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let topic = self.topic();
        tracing::info!(
            topic,
            max_in_flight = self.config.max_in_flight,
            "consumer started"
        );
        let mut tasks = JoinSet::new();

        loop {
            if *shutdown.borrow() {
                break;
            }
            while tasks.try_join_next().is_some() {}

            let capacity = self
                .permits
                .available_permits()
                .min(self.config.batch_size);
            let leased = if capacity == 0 {
                Vec::new()
            } else {
                match self.channel.receive(topic, capacity).await {
                    Ok(deliveries) => deliveries,
                    Err(e) => {
                        tracing::warn!(topic, error = %e, "failed to lease messages");
                        Vec::new()
                    }
                }
            };

            if leased.is_empty() {
                tokio::select! {
                    changed = shutdown.changed() => {
                        if changed.is_err() {
                            break;
                        }
                    }
                    () = tokio::time::sleep(self.config.poll_interval) => {}
                }
                continue;
            }

            for delivery in leased {
                let Ok(permit) = self.permits.clone().acquire_owned().await else {
                    break;
                };
                let channel = self.channel.clone();
                let handler = self.handler.clone();
                let config = self.config.clone();
                tasks.spawn(async move {
                    Self::process(channel, handler, config, delivery).await;
                    drop(permit);
                });
            }
        }

        self.drain(tasks).await;
        tracing::info!(topic, "consumer stopped");
    }

    async fn drain(&self, mut tasks: JoinSet<()>) {
        if tasks.is_empty() {
            return;
        }
        tracing::info!(
            topic = self.topic(),
            in_flight = tasks.len(),
            "draining in-flight deliveries"
        );

        let drained = tokio::time::timeout(self.config.drain_timeout, async {
            while tasks.join_next().await.is_some() {}
        })
        .await;

        if drained.is_err() {
            // Aborted deliveries stay leased until their visibility timeout,
            // then come back.
            tracing::warn!(
                topic = self.topic(),
                abandoned = tasks.len(),
                "drain timed out, abandoning deliveries"
            );
            tasks.abort_all();
        }
    }

    async fn process(
        channel: Arc<C>,
        handler: Arc<H>,
        config: Arc<ConsumerConfig>,
        delivery: Delivery,
    ) -> Outcome {
        let topic = delivery.envelope.topic.clone();
        let correlation_id = delivery
            .envelope
            .correlation_id()
            .map(|id| id.to_string())
            .unwrap_or_default();
        let span = tracing::info_span!(
            "consume",
            topic = %topic,
            message_id = %delivery.envelope.message_id,
            attempt = delivery.attempt,
            correlation_id = %correlation_id,
        );

        async move {
            let started = std::time::Instant::now();
            let result = match delivery.envelope.decode::<H::Message>() {
                Err(e) => Err(HandlerError::Permanent(format!("unparseable payload: {e}"))),
                Ok(message) => {
                    match tokio::time::timeout(config.handler_timeout, handler.handle(message))
                        .await
                    {
                        Ok(result) => result,
                        Err(_) => Err(HandlerError::Retryable(format!(
                            "handler exceeded {:?}",
                            config.handler_timeout
                        ))),
                    }
                }
            };
            metrics::histogram!("message_handling_duration_seconds", "topic" => topic.clone())
                .record(started.elapsed().as_secs_f64());

            let settled = match result {
                Ok(()) => channel.ack(&delivery).await.map(|()| Outcome::Acked),
                Err(HandlerError::Retryable(reason))
                    if delivery.attempt < config.retry.max_attempts =>
                {
                    let delay = config.retry.delay_for(delivery.attempt);
                    tracing::warn!(%reason, ?delay, "handler failed, scheduling redelivery");
                    channel
                        .nack(&delivery, delay)
                        .await
                        .map(|()| Outcome::Retried)
                }
                Err(err) => {
                    let reason = match &err {
                        HandlerError::Retryable(r) => {
                            format!("retries exhausted after {} attempts: {r}", delivery.attempt)
                        }
                        HandlerError::Permanent(r) => r.clone(),
                    };
                    tracing::error!(%reason, "dead-lettering message");
                    metrics::counter!("messages_dead_lettered_total", "topic" => topic.clone())
                        .increment(1);
                    channel
                        .dead_letter(&delivery, &reason)
                        .await
                        .map(|()| Outcome::DeadLettered)
                }
            };

            let outcome = settled.unwrap_or_else(|e| {
                tracing::warn!(error = %e, "failed to settle delivery, leaving it to expire");
                Outcome::Abandoned
            });
            metrics::counter!(
                "messages_handled_total",
                "topic" => topic.clone(),
                "outcome" => outcome.as_str()
            )
            .increment(1);
            outcome
        }
        .instrument(span)
        .await
    }
}
