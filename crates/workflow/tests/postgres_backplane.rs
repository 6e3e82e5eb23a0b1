//! PostgreSQL integration tests for the NOTIFY/LISTEN push backplane.
//!
//! Run with:
//!
//! ```bash
//! cargo test -p workflow --test postgres_backplane -- --test-threads=1
//! ```

use std::sync::Arc;
use std::time::Duration;

use common::{CorrelationId, SessionId};
use serial_test::serial;
use sqlx::PgPool;
use testcontainers::{ContainerAsync, runners::AsyncRunner};
use testcontainers_modules::postgres::Postgres;
use tokio::sync::{OnceCell, mpsc, watch};
use tokio::task::JoinHandle;
use workflow::{
    Backplane, BackplanePushChannel, ConnectionHub, PostgresBackplane, PushChannel,
    StatusNotification, run_relay,
};

struct ContainerInfo {
    #[allow(dead_code)] // Container must stay alive for tests
    container: ContainerAsync<Postgres>,
    connection_string: String,
}

static CONTAINER: OnceCell<Arc<ContainerInfo>> = OnceCell::const_new();

async fn get_container_info() -> Arc<ContainerInfo> {
    CONTAINER
        .get_or_init(|| async {
            let container = Postgres::default().start().await.unwrap();
            let host = container.get_host().await.unwrap();
            let port = container.get_host_port_ipv4(5432).await.unwrap();
            let connection_string =
                format!("postgres://postgres:postgres@{}:{}/postgres", host, port);

            Arc::new(ContainerInfo {
                container,
                connection_string,
            })
        })
        .await
        .clone()
}

async fn get_test_pool() -> PgPool {
    let info = get_container_info().await;
    sqlx::postgres::PgPoolOptions::new()
        .max_connections(5)
        .connect(&info.connection_string)
        .await
        .unwrap()
}

/// One server instance: its own pool, backplane, hub and relay.
struct Instance {
    backplane: Arc<dyn Backplane>,
    hub: ConnectionHub,
    relay: JoinHandle<()>,
}

async fn start_instance(shutdown: watch::Receiver<bool>) -> Instance {
    let backplane: Arc<dyn Backplane> = Arc::new(PostgresBackplane::new(get_test_pool().await));
    let hub = ConnectionHub::new();
    let relay = tokio::spawn(run_relay(backplane.clone(), hub.clone(), shutdown));
    Instance {
        backplane,
        hub,
        relay,
    }
}

async fn connect(hub: &ConnectionHub, session: &SessionId) -> mpsc::Receiver<StatusNotification> {
    let (tx, rx) = mpsc::channel(8);
    hub.register(session.clone(), tx).await;
    rx
}

async fn next(rx: &mut mpsc::Receiver<StatusNotification>) -> StatusNotification {
    tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .unwrap()
        .unwrap()
}

// LISTEN is issued inside the relay task.
async fn let_relays_listen() {
    tokio::time::sleep(Duration::from_millis(300)).await;
}

#[tokio::test]
#[serial]
async fn notification_reaches_connections_on_every_instance() {
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let a = start_instance(shutdown_rx.clone()).await;
    let b = start_instance(shutdown_rx).await;

    let session = SessionId::new("session-pg");
    let mut on_a = connect(&a.hub, &session).await;
    let mut on_b = connect(&b.hub, &session).await;
    let mut other = connect(&b.hub, &SessionId::new("someone-else")).await;
    let_relays_listen().await;

    let sent = StatusNotification::completed(CorrelationId::new(), 21);
    BackplanePushChannel::new(a.backplane.clone())
        .push_to_session(&session, &sent)
        .await
        .unwrap();

    assert_eq!(next(&mut on_a).await, sent);
    assert_eq!(next(&mut on_b).await, sent);
    assert!(other.try_recv().is_err());

    shutdown_tx.send(true).unwrap();
    a.relay.await.unwrap();
    b.relay.await.unwrap();
}

#[tokio::test]
#[serial]
async fn malformed_payload_is_skipped() {
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let instance = start_instance(shutdown_rx).await;
    let session = SessionId::new("session-pg");
    let mut rx = connect(&instance.hub, &session).await;
    let_relays_listen().await;

    let pool = get_test_pool().await;
    sqlx::query("SELECT pg_notify('order_status', 'not json')")
        .execute(&pool)
        .await
        .unwrap();

    let sent = StatusNotification::completed(CorrelationId::new(), 5);
    BackplanePushChannel::new(instance.backplane.clone())
        .push_to_session(&session, &sent)
        .await
        .unwrap();

    assert_eq!(next(&mut rx).await, sent);
    assert!(rx.try_recv().is_err());

    shutdown_tx.send(true).unwrap();
    instance.relay.await.unwrap();
}

#[tokio::test]
#[serial]
async fn publish_without_listeners_succeeds() {
    let backplane = PostgresBackplane::new(get_test_pool().await);
    let sent = StatusNotification::completed(CorrelationId::new(), 1);

    BackplanePushChannel::new(Arc::new(backplane))
        .push_to_session(&SessionId::new("nobody"), &sent)
        .await
        .unwrap();
}
