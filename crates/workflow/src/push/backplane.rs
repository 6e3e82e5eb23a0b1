use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use common::SessionId;
use futures_util::StreamExt;
use futures_util::stream::{self, BoxStream};
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, watch};

use super::{ConnectionHub, PushChannel, PushError, StatusNotification};

/// A notification addressed to a session, as carried between instances.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackplaneMessage {
    pub session_id: SessionId,
    pub notification: StatusNotification,
}

/// Fan-out transport shared by every server instance.
///
/// Each instance subscribes once and relays what it receives to its own
/// [`ConnectionHub`].
#[async_trait]
pub trait Backplane: Send + Sync {
    async fn publish(&self, message: &BackplaneMessage) -> Result<(), PushError>;

    /// Opens a subscription that yields every message published from now on,
    /// by any instance.
    async fn subscribe(&self) -> Result<BoxStream<'static, BackplaneMessage>, PushError>;
}

/// In-process backplane over a tokio broadcast channel.
///
/// Suitable for a single instance, or for tests that run several hubs in one
/// process.
#[derive(Clone)]
pub struct BroadcastBackplane {
    sender: broadcast::Sender<BackplaneMessage>,
}

impl BroadcastBackplane {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }
}

impl Default for BroadcastBackplane {
    fn default() -> Self {
        Self::new(1024)
    }
}

#[async_trait]
impl Backplane for BroadcastBackplane {
    async fn publish(&self, message: &BackplaneMessage) -> Result<(), PushError> {
        // No subscribers means no instance hosts connections; nothing to do.
        let _ = self.sender.send(message.clone());
        Ok(())
    }

    async fn subscribe(&self) -> Result<BoxStream<'static, BackplaneMessage>, PushError> {
        let receiver = self.sender.subscribe();
        let stream = stream::unfold(receiver, |mut receiver| async move {
            loop {
                match receiver.recv().await {
                    Ok(message) => return Some((message, receiver)),
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!(skipped, "backplane subscriber lagged, notifications lost");
                    }
                    Err(broadcast::error::RecvError::Closed) => return None,
                }
            }
        });
        Ok(stream.boxed())
    }
}

/// Push channel that routes every notification through a backplane.
pub struct BackplanePushChannel {
    backplane: Arc<dyn Backplane>,
}

impl BackplanePushChannel {
    pub fn new(backplane: Arc<dyn Backplane>) -> Self {
        Self { backplane }
    }
}

#[async_trait]
impl PushChannel for BackplanePushChannel {
    async fn push_to_session(
        &self,
        session: &SessionId,
        notification: &StatusNotification,
    ) -> Result<(), PushError> {
        self.backplane
            .publish(&BackplaneMessage {
                session_id: session.clone(),
                notification: *notification,
            })
            .await
    }
}

const RESUBSCRIBE_BASE: Duration = Duration::from_millis(100);
const RESUBSCRIBE_MAX: Duration = Duration::from_secs(5);

/// Delivers backplane traffic to this instance's connections until `shutdown`
/// flips to `true`.
///
/// A failed subscribe or an ended subscription is retried with exponential
/// backoff, so a backplane outage only pauses pushes for this instance.
/// Messages published while no subscription is open are not replayed.
pub async fn run_relay(
    backplane: Arc<dyn Backplane>,
    hub: ConnectionHub,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut backoff = RESUBSCRIBE_BASE;

    while !*shutdown.borrow() {
        let subscribed = tokio::select! {
            _ = stopped(&mut shutdown) => break,
            subscribed = backplane.subscribe() => subscribed,
        };

        match subscribed {
            Ok(mut messages) => {
                tracing::info!("push relay subscribed");
                loop {
                    tokio::select! {
                        _ = stopped(&mut shutdown) => break,
                        next = messages.next() => {
                            let Some(message) = next else {
                                tracing::warn!("backplane subscription ended, resubscribing");
                                break;
                            };
                            backoff = RESUBSCRIBE_BASE;
                            let report = hub
                                .deliver_local(&message.session_id, &message.notification)
                                .await;
                            tracing::debug!(
                                session = %message.session_id,
                                correlation_id = %message.notification.correlation_id,
                                delivered = report.delivered,
                                "relayed notification"
                            );
                        }
                    }
                }
            }
            Err(e) => {
                tracing::error!(error = %e, retry_in = ?backoff, "backplane subscribe failed");
            }
        }

        tokio::select! {
            _ = stopped(&mut shutdown) => break,
            _ = tokio::time::sleep(backoff) => {}
        }
        backoff = (backoff * 2).min(RESUBSCRIBE_MAX);
    }

    tracing::info!("push relay stopped");
}

/// Resolves once shutdown is requested or the sender is gone.
async fn stopped(shutdown: &mut watch::Receiver<bool>) {
    // An error means the sender was dropped, which also ends the relay.
    let _ = shutdown.wait_for(|stop| *stop).await;
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use common::CorrelationId;
    use tokio::sync::mpsc;

    use super::*;

    #[tokio::test]
    async fn notification_reaches_connections_on_every_instance() {
        let backplane: Arc<dyn Backplane> = Arc::new(BroadcastBackplane::default());
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let session = SessionId::new("s-1");

        // Two instances, each with one connection for the same session.
        let hub_a = ConnectionHub::new();
        let hub_b = ConnectionHub::new();
        let (tx_a, mut rx_a) = mpsc::channel(4);
        let (tx_b, mut rx_b) = mpsc::channel(4);
        hub_a.register(session.clone(), tx_a).await;
        hub_b.register(session.clone(), tx_b).await;

        let relay_a = tokio::spawn(run_relay(backplane.clone(), hub_a, shutdown_rx.clone()));
        let relay_b = tokio::spawn(run_relay(backplane.clone(), hub_b, shutdown_rx));
        // Let both relays subscribe.
        tokio::time::sleep(Duration::from_millis(20)).await;

        let sent = StatusNotification::completed(CorrelationId::new(), 7);
        BackplanePushChannel::new(backplane)
            .push_to_session(&session, &sent)
            .await
            .unwrap();

        let got_a = tokio::time::timeout(Duration::from_secs(1), rx_a.recv()).await.unwrap();
        let got_b = tokio::time::timeout(Duration::from_secs(1), rx_b.recv()).await.unwrap();
        assert_eq!(got_a, Some(sent));
        assert_eq!(got_b, Some(sent));

        shutdown_tx.send(true).unwrap();
        relay_a.await.unwrap();
        relay_b.await.unwrap();
    }

    /// Fails its first subscribe, hands out an already-finished stream on the
    /// second, then behaves like the broadcast backplane it wraps.
    struct FlakyBackplane {
        inner: BroadcastBackplane,
        subscribes: AtomicUsize,
    }

    #[async_trait]
    impl Backplane for FlakyBackplane {
        async fn publish(&self, message: &BackplaneMessage) -> Result<(), PushError> {
            self.inner.publish(message).await
        }

        async fn subscribe(&self) -> Result<BoxStream<'static, BackplaneMessage>, PushError> {
            match self.subscribes.fetch_add(1, Ordering::SeqCst) {
                0 => Err(PushError::Backplane("listener refused".to_string())),
                1 => Ok(stream::empty().boxed()),
                _ => self.inner.subscribe().await,
            }
        }
    }

    #[tokio::test]
    async fn relay_resubscribes_after_failed_or_ended_subscription() {
        let flaky = Arc::new(FlakyBackplane {
            inner: BroadcastBackplane::default(),
            subscribes: AtomicUsize::new(0),
        });
        let backplane: Arc<dyn Backplane> = flaky.clone();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let session = SessionId::new("s-1");

        let hub = ConnectionHub::new();
        let (tx, mut rx) = mpsc::channel(4);
        hub.register(session.clone(), tx).await;
        let relay = tokio::spawn(run_relay(backplane.clone(), hub, shutdown_rx));

        tokio::time::timeout(Duration::from_secs(5), async {
            while flaky.subscribes.load(Ordering::SeqCst) < 3 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
        // Let the third subscription register with the broadcast channel.
        tokio::time::sleep(Duration::from_millis(20)).await;

        let sent = StatusNotification::completed(CorrelationId::new(), 11);
        BackplanePushChannel::new(backplane)
            .push_to_session(&session, &sent)
            .await
            .unwrap();

        let got = tokio::time::timeout(Duration::from_secs(1), rx.recv()).await.unwrap();
        assert_eq!(got, Some(sent));

        shutdown_tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(1), relay)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn relay_stops_while_waiting_to_resubscribe() {
        let backplane: Arc<dyn Backplane> = Arc::new(FlakyBackplane {
            inner: BroadcastBackplane::default(),
            subscribes: AtomicUsize::new(0),
        });
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let relay = tokio::spawn(run_relay(backplane, ConnectionHub::new(), shutdown_rx));

        tokio::time::sleep(Duration::from_millis(20)).await;
        shutdown_tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(1), relay)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn publish_without_subscribers_succeeds() {
        let backplane = BroadcastBackplane::default();
        let message = BackplaneMessage {
            session_id: SessionId::new("s"),
            notification: StatusNotification::completed(CorrelationId::new(), 1),
        };
        assert!(backplane.publish(&message).await.is_ok());
    }

    #[test]
    fn backplane_message_wire_shape() {
        let id = CorrelationId::new();
        let message = BackplaneMessage {
            session_id: SessionId::new("s-1"),
            notification: StatusNotification::completed(id, 3),
        };
        let json = serde_json::to_value(&message).unwrap();
        assert_eq!(json["sessionId"], "s-1");
        assert_eq!(json["notification"]["orderId"], 3);
    }
}
