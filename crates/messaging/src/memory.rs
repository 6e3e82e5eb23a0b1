use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::Mutex;
use tokio::time::Instant;

use crate::{
    DeadLetter, Delivery, Envelope, MessageChannel, MessagingError, Receipt, Result,
};

#[derive(Debug)]
struct Slot {
    seq: i64,
    envelope: Envelope,
    attempt: u32,
    visible_at: Instant,
}

#[derive(Debug, Default)]
struct ChannelState {
    next_seq: i64,
    queues: HashMap<String, VecDeque<Slot>>,
    dead_letters: Vec<DeadLetter>,
}

impl ChannelState {
    fn leased_slot(&mut self, delivery: &Delivery) -> Result<(usize, &mut VecDeque<Slot>)> {
        let lost = || MessagingError::LeaseLost {
            message_id: delivery.envelope.message_id,
            attempt: delivery.attempt,
        };
        let queue = self
            .queues
            .get_mut(&delivery.envelope.topic)
            .ok_or_else(lost)?;
        let index = queue
            .iter()
            .position(|s| s.seq == delivery.receipt.seq && s.attempt == delivery.receipt.attempt)
            .ok_or_else(lost)?;
        Ok((index, queue))
    }
}

/// In-memory message channel for tests and single-process runs.
///
/// Provides the same leasing semantics as the PostgreSQL implementation:
/// per-topic publish order, visibility timeout, delayed redelivery and a
/// dead-letter list. Timing uses tokio's clock.
#[derive(Clone)]
pub struct InMemoryChannel {
    state: Arc<Mutex<ChannelState>>,
    visibility_timeout: Duration,
    unavailable: Arc<AtomicBool>,
}

impl Default for InMemoryChannel {
    fn default() -> Self {
        Self::new(Duration::from_secs(30))
    }
}

impl InMemoryChannel {
    /// Creates an empty channel with the given lease duration.
    pub fn new(visibility_timeout: Duration) -> Self {
        Self {
            state: Arc::new(Mutex::new(ChannelState::default())),
            visibility_timeout,
            unavailable: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Makes every subsequent call fail with `Unavailable` until reset.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Returns the number of messages on a topic, leased or not.
    pub async fn pending(&self, topic: &str) -> usize {
        self.state
            .lock()
            .await
            .queues
            .get(topic)
            .map_or(0, VecDeque::len)
    }

    /// Returns copies of all envelopes currently on a topic, in order.
    pub async fn peek(&self, topic: &str) -> Vec<Envelope> {
        self.state
            .lock()
            .await
            .queues
            .get(topic)
            .map(|q| q.iter().map(|s| s.envelope.clone()).collect())
            .unwrap_or_default()
    }

    fn check_available(&self) -> Result<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(MessagingError::Unavailable(
                "in-memory channel marked unavailable".to_string(),
            ));
        }
        Ok(())
    }
}

#[async_trait]
impl MessageChannel for InMemoryChannel {
    async fn publish(&self, envelope: Envelope) -> Result<()> {
        self.check_available()?;
        let mut state = self.state.lock().await;
        state.next_seq += 1;
        let seq = state.next_seq;
        state
            .queues
            .entry(envelope.topic.clone())
            .or_default()
            .push_back(Slot {
                seq,
                envelope,
                attempt: 0,
                visible_at: Instant::now(),
            });
        Ok(())
    }

    async fn receive(&self, topic: &str, max: usize) -> Result<Vec<Delivery>> {
        self.check_available()?;
        let now = Instant::now();
        let mut state = self.state.lock().await;
        let Some(queue) = state.queues.get_mut(topic) else {
            return Ok(Vec::new());
        };

        let leased = queue
            .iter_mut()
            .filter(|slot| slot.visible_at <= now)
            .take(max)
            .map(|slot| {
                slot.attempt += 1;
                slot.visible_at = now + self.visibility_timeout;
                Delivery {
                    envelope: slot.envelope.clone(),
                    attempt: slot.attempt,
                    receipt: Receipt {
                        seq: slot.seq,
                        attempt: slot.attempt,
                    },
                }
            })
            .collect();
        Ok(leased)
    }

    async fn ack(&self, delivery: &Delivery) -> Result<()> {
        self.check_available()?;
        let mut state = self.state.lock().await;
        let (index, queue) = state.leased_slot(delivery)?;
        queue.remove(index);
        Ok(())
    }

    async fn nack(&self, delivery: &Delivery, delay: Duration) -> Result<()> {
        self.check_available()?;
        let mut state = self.state.lock().await;
        let (index, queue) = state.leased_slot(delivery)?;
        queue[index].visible_at = Instant::now() + delay;
        Ok(())
    }

    async fn dead_letter(&self, delivery: &Delivery, reason: &str) -> Result<()> {
        self.check_available()?;
        let mut state = self.state.lock().await;
        let (index, queue) = state.leased_slot(delivery)?;
        let slot = queue.remove(index).ok_or(MessagingError::LeaseLost {
            message_id: delivery.envelope.message_id,
            attempt: delivery.attempt,
        })?;
        let correlation_id = slot.envelope.correlation_id();
        state.dead_letters.push(DeadLetter {
            message_id: slot.envelope.message_id,
            topic: slot.envelope.topic,
            correlation_id,
            payload: slot.envelope.payload,
            attempt: slot.attempt,
            reason: reason.to_string(),
            dead_lettered_at: Utc::now(),
        });
        Ok(())
    }

    async fn dead_letters(&self, topic: &str) -> Result<Vec<DeadLetter>> {
        self.check_available()?;
        let state = self.state.lock().await;
        Ok(state
            .dead_letters
            .iter()
            .filter(|d| d.topic == topic)
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use common::CorrelationId;

    use super::*;
    use crate::{Message, MessageChannelExt, OrderProcessedEvent};

    fn event(order_id: i64) -> OrderProcessedEvent {
        OrderProcessedEvent {
            correlation_id: CorrelationId::new(),
            order_id,
        }
    }

    const TOPIC: &str = OrderProcessedEvent::TOPIC;

    #[tokio::test]
    async fn receive_leases_in_publish_order() {
        let channel = InMemoryChannel::default();
        for i in 1..=3 {
            channel.publish_message(&event(i)).await.unwrap();
        }

        let deliveries = channel.receive(TOPIC, 10).await.unwrap();
        let ids: Vec<i64> = deliveries
            .iter()
            .map(|d| d.envelope.decode::<OrderProcessedEvent>().unwrap().order_id)
            .collect();
        assert_eq!(ids, vec![1, 2, 3]);
        assert!(deliveries.iter().all(|d| d.attempt == 1));
    }

    #[tokio::test]
    async fn leased_messages_are_invisible_to_other_consumers() {
        let channel = InMemoryChannel::default();
        channel.publish_message(&event(1)).await.unwrap();

        assert_eq!(channel.receive(TOPIC, 10).await.unwrap().len(), 1);
        assert!(channel.receive(TOPIC, 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn receive_respects_max() {
        let channel = InMemoryChannel::default();
        for i in 1..=5 {
            channel.publish_message(&event(i)).await.unwrap();
        }
        assert_eq!(channel.receive(TOPIC, 2).await.unwrap().len(), 2);
        assert_eq!(channel.receive(TOPIC, 10).await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn ack_removes_message() {
        let channel = InMemoryChannel::default();
        channel.publish_message(&event(1)).await.unwrap();

        let delivery = channel.receive(TOPIC, 1).await.unwrap().remove(0);
        channel.ack(&delivery).await.unwrap();

        assert_eq!(channel.pending(TOPIC).await, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn unacked_lease_expires_and_redelivers() {
        let channel = InMemoryChannel::new(Duration::from_secs(5));
        channel.publish_message(&event(1)).await.unwrap();

        let first = channel.receive(TOPIC, 1).await.unwrap().remove(0);
        tokio::time::advance(Duration::from_secs(6)).await;

        let second = channel.receive(TOPIC, 1).await.unwrap().remove(0);
        assert_eq!(second.attempt, 2);
        assert_eq!(first.envelope.message_id, second.envelope.message_id);

        // The stale receipt can no longer settle the message.
        let err = channel.ack(&first).await.unwrap_err();
        assert!(matches!(err, MessagingError::LeaseLost { .. }));
        channel.ack(&second).await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn nack_delays_redelivery() {
        let channel = InMemoryChannel::default();
        channel.publish_message(&event(1)).await.unwrap();

        let delivery = channel.receive(TOPIC, 1).await.unwrap().remove(0);
        channel
            .nack(&delivery, Duration::from_secs(2))
            .await
            .unwrap();

        assert!(channel.receive(TOPIC, 1).await.unwrap().is_empty());
        tokio::time::advance(Duration::from_secs(2)).await;
        assert_eq!(channel.receive(TOPIC, 1).await.unwrap()[0].attempt, 2);
    }

    #[tokio::test]
    async fn dead_letter_moves_message() {
        let channel = InMemoryChannel::default();
        let event = event(9);
        channel.publish_message(&event).await.unwrap();

        let delivery = channel.receive(TOPIC, 1).await.unwrap().remove(0);
        channel.dead_letter(&delivery, "poison").await.unwrap();

        assert_eq!(channel.pending(TOPIC).await, 0);
        let dead = channel.dead_letters(TOPIC).await.unwrap();
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].reason, "poison");
        assert_eq!(dead[0].correlation_id, Some(event.correlation_id));
    }

    #[tokio::test]
    async fn unavailable_channel_rejects_publish() {
        let channel = InMemoryChannel::default();
        channel.set_unavailable(true);

        let err = channel.publish_message(&event(1)).await.unwrap_err();
        assert!(err.is_transient());
        channel.set_unavailable(false);
        assert_eq!(channel.pending(TOPIC).await, 0);
    }

    #[tokio::test]
    async fn topics_are_isolated() {
        let channel = InMemoryChannel::default();
        channel.publish_message(&event(1)).await.unwrap();
        assert!(channel.receive("order.accepted", 10).await.unwrap().is_empty());
    }
}
