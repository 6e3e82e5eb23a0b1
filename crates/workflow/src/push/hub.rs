use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use common::{ConnectionId, SessionId};
use tokio::sync::{RwLock, mpsc};

use super::{PushChannel, PushError, StatusNotification};

/// Result of delivering one notification to this instance's connections.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LocalDelivery {
    pub delivered: usize,
    /// Connections whose outbound buffer was full.
    pub dropped: usize,
    /// Connections found closed and unregistered on the way.
    pub pruned: usize,
}

#[derive(Debug, Default)]
struct HubState {
    sessions: HashMap<SessionId, HashMap<ConnectionId, mpsc::Sender<StatusNotification>>>,
    owners: HashMap<ConnectionId, SessionId>,
}

impl HubState {
    fn remove(&mut self, connection: ConnectionId) -> bool {
        let Some(session) = self.owners.remove(&connection) else {
            return false;
        };
        if let Some(connections) = self.sessions.get_mut(&session) {
            connections.remove(&connection);
            if connections.is_empty() {
                self.sessions.remove(&session);
            }
        }
        true
    }

    fn record_gauge(&self) {
        metrics::gauge!("push_connections").set(self.owners.len() as f64);
    }
}

/// Live connections hosted by this instance, grouped by session.
///
/// Each connection is represented by the sending half of its outbound queue.
/// Delivery uses `try_send`, so a slow or dead connection only loses its own
/// notification.
#[derive(Clone, Default)]
pub struct ConnectionHub {
    state: Arc<RwLock<HubState>>,
}

impl ConnectionHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a connection for `session` and returns its handle id.
    pub async fn register(
        &self,
        session: SessionId,
        sender: mpsc::Sender<StatusNotification>,
    ) -> ConnectionId {
        let connection = ConnectionId::new();
        let mut state = self.state.write().await;
        state
            .sessions
            .entry(session.clone())
            .or_default()
            .insert(connection, sender);
        state.owners.insert(connection, session.clone());
        state.record_gauge();
        tracing::debug!(%session, %connection, "connection registered");
        connection
    }

    /// Removes a connection. Returns false if it was not registered.
    pub async fn unregister(&self, connection: ConnectionId) -> bool {
        let mut state = self.state.write().await;
        let removed = state.remove(connection);
        state.record_gauge();
        if removed {
            tracing::debug!(%connection, "connection unregistered");
        }
        removed
    }

    /// Number of live connections for a session on this instance.
    pub async fn connection_count(&self, session: &SessionId) -> usize {
        self.state
            .read()
            .await
            .sessions
            .get(session)
            .map_or(0, HashMap::len)
    }

    /// Total live connections on this instance.
    pub async fn total_connections(&self) -> usize {
        self.state.read().await.owners.len()
    }

    /// Delivers to every local connection of `session`.
    pub async fn deliver_local(
        &self,
        session: &SessionId,
        notification: &StatusNotification,
    ) -> LocalDelivery {
        let mut report = LocalDelivery::default();
        let mut closed = Vec::new();

        {
            let state = self.state.read().await;
            let Some(connections) = state.sessions.get(session) else {
                return report;
            };
            for (connection, sender) in connections {
                match sender.try_send(*notification) {
                    Ok(()) => report.delivered += 1,
                    Err(mpsc::error::TrySendError::Full(_)) => {
                        tracing::warn!(%connection, "connection buffer full, dropping notification");
                        report.dropped += 1;
                    }
                    Err(mpsc::error::TrySendError::Closed(_)) => closed.push(*connection),
                }
            }
        }

        if !closed.is_empty() {
            let mut state = self.state.write().await;
            for connection in closed {
                if state.remove(connection) {
                    report.pruned += 1;
                }
            }
            state.record_gauge();
        }

        metrics::counter!("notifications_pushed_total").increment(report.delivered as u64);
        report
    }
}

#[async_trait]
impl PushChannel for ConnectionHub {
    async fn push_to_session(
        &self,
        session: &SessionId,
        notification: &StatusNotification,
    ) -> Result<(), PushError> {
        let report = self.deliver_local(session, notification).await;
        tracing::debug!(
            %session,
            delivered = report.delivered,
            dropped = report.dropped,
            pruned = report.pruned,
            "pushed to local connections"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use common::CorrelationId;

    use super::*;

    fn notification() -> StatusNotification {
        StatusNotification::completed(CorrelationId::new(), 42)
    }

    #[tokio::test]
    async fn delivers_to_every_connection_of_the_session() {
        let hub = ConnectionHub::new();
        let session = SessionId::new("s-1");
        let (tx_a, mut rx_a) = mpsc::channel(4);
        let (tx_b, mut rx_b) = mpsc::channel(4);
        hub.register(session.clone(), tx_a).await;
        hub.register(session.clone(), tx_b).await;

        let sent = notification();
        let report = hub.deliver_local(&session, &sent).await;

        assert_eq!(report.delivered, 2);
        assert_eq!(rx_a.recv().await.unwrap(), sent);
        assert_eq!(rx_b.recv().await.unwrap(), sent);
    }

    #[tokio::test]
    async fn other_sessions_are_not_notified() {
        let hub = ConnectionHub::new();
        let (tx, mut rx) = mpsc::channel(4);
        hub.register(SessionId::new("other"), tx).await;

        let report = hub
            .deliver_local(&SessionId::new("s-1"), &notification())
            .await;

        assert_eq!(report, LocalDelivery::default());
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn failing_connection_does_not_block_the_rest() {
        let hub = ConnectionHub::new();
        let session = SessionId::new("s-1");

        let (closed_tx, closed_rx) = mpsc::channel(1);
        drop(closed_rx);
        let (full_tx, _full_rx) = mpsc::channel(1);
        full_tx.try_send(notification()).unwrap();
        let (ok_tx, mut ok_rx) = mpsc::channel(1);

        hub.register(session.clone(), closed_tx).await;
        hub.register(session.clone(), full_tx).await;
        hub.register(session.clone(), ok_tx).await;

        let sent = notification();
        let report = hub.deliver_local(&session, &sent).await;

        assert_eq!(
            report,
            LocalDelivery {
                delivered: 1,
                dropped: 1,
                pruned: 1
            }
        );
        assert_eq!(ok_rx.recv().await.unwrap(), sent);
        assert_eq!(hub.connection_count(&session).await, 2);
    }

    #[tokio::test]
    async fn unregister_removes_connection() {
        let hub = ConnectionHub::new();
        let session = SessionId::new("s-1");
        let (tx, _rx) = mpsc::channel(1);
        let connection = hub.register(session.clone(), tx).await;

        assert!(hub.unregister(connection).await);
        assert!(!hub.unregister(connection).await);
        assert_eq!(hub.connection_count(&session).await, 0);
        assert_eq!(hub.total_connections().await, 0);
    }
}
