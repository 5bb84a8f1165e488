//! Session state machine tests over the in-process broker stub.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::timeout;

use ctrader_client::messages::{
    PositionSnapshot, ReconcileReq, ReconcileSnapshot, Request, Response, SymbolSpec, TradeData,
};
use ctrader_client::testing::MockBroker;
use ctrader_client::transport::Transport;
use ctrader_client::{ClientError, Connector, SessionConfig, SessionHandle, SessionPhase};

const WAIT: Duration = Duration::from_secs(5);

fn symbols() -> Vec<SymbolSpec> {
    vec![SymbolSpec {
        id: 1,
        name: "EURUSD".to_string(),
        lot_size: Some(10_000_000),
        min_volume: Some(100_000),
        step_volume: Some(100_000),
        max_volume: Some(10_000_000_000),
        digits: Some(5),
        pip_position: Some(4),
        tick_value: Some(1.0),
    }]
}

fn config(name: &str) -> SessionConfig {
    let mut config = SessionConfig::new(name, "client-id", "client-secret", 7001, "token");
    config.reconnect_min = Duration::from_millis(50);
    config.reconnect_max = Duration::from_millis(200);
    config
}

async fn wait_ready(handle: &SessionHandle) {
    timeout(WAIT, async {
        while !handle.is_ready().await {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("session did not become ready");
}

#[tokio::test]
async fn test_session_reaches_ready_and_serves_requests() {
    let broker = MockBroker::new(symbols());
    let handle = SessionHandle::spawn(config("alpha"), Arc::new(broker.clone()));

    wait_ready(&handle).await;
    assert_eq!(handle.phase().await, SessionPhase::Ready);
    assert_eq!(handle.symbol_id("eurusd").await, Some(1));

    let response = handle
        .send(Request::Reconcile(ReconcileReq { account_id: 7001 }))
        .await
        .unwrap();
    assert!(matches!(response, Response::Reconcile(_)));
}

#[tokio::test]
async fn test_send_before_connect_fails_not_ready() {
    struct NeverConnects;

    #[async_trait]
    impl Connector for NeverConnects {
        async fn connect(&self) -> Result<Transport, ClientError> {
            Err(ClientError::Transport("connection refused".to_string()))
        }
    }

    let handle = SessionHandle::spawn(config("alpha"), Arc::new(NeverConnects));
    // Give the task time to enter its backoff wait.
    tokio::time::sleep(Duration::from_millis(20)).await;

    let err = handle
        .send(Request::Reconcile(ReconcileReq { account_id: 7001 }))
        .await
        .unwrap_err();
    assert_eq!(err, ClientError::NotReady);
}

#[tokio::test]
async fn test_account_scoped_request_without_account_auth() {
    let broker = MockBroker::new(symbols());
    // No account credentials: the session stops at app-authed.
    let mut config = config("alpha");
    config.account_id = 0;
    let handle = SessionHandle::spawn(config, Arc::new(broker.clone()));

    timeout(WAIT, async {
        while handle.phase().await != SessionPhase::AppAuthed {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("session did not reach app-authed");

    let err = handle
        .send(Request::Reconcile(ReconcileReq { account_id: 7001 }))
        .await
        .unwrap_err();
    assert_eq!(err, ClientError::AccountNotReady);
}

#[tokio::test]
async fn test_disconnect_fails_inflight_futures() {
    let broker = MockBroker::new(symbols());
    let handle = SessionHandle::spawn(config("alpha"), Arc::new(broker.clone()));
    wait_ready(&handle).await;

    broker.set_mute(true);
    let pending = tokio::spawn({
        let handle = handle.clone();
        async move {
            handle
                .send(Request::Reconcile(ReconcileReq { account_id: 7001 }))
                .await
        }
    });

    // Let the request reach the broker, then cut the transport.
    tokio::time::sleep(Duration::from_millis(50)).await;
    broker.drop_connections();

    let err = timeout(WAIT, pending).await.unwrap().unwrap().unwrap_err();
    assert_eq!(err, ClientError::Disconnected);
}

#[tokio::test]
async fn test_reconnect_reloads_catalog_and_reconciles() {
    let broker = MockBroker::new(symbols());
    let handle = SessionHandle::spawn(config("alpha"), Arc::new(broker.clone()));
    wait_ready(&handle).await;
    assert_eq!(broker.connect_count(), 1);

    // Seed a position so the reconnect reconcile carries state.
    broker.set_reconcile(ReconcileSnapshot {
        positions: vec![PositionSnapshot {
            position_id: 555,
            trade_data: TradeData {
                symbol_id: 1,
                label: Some("SRC_1001".to_string()),
                volume: Some(1_000_000),
                side: None,
            },
            volume: Some(1_000_000),
        }],
        orders: Vec::new(),
    });

    broker.drop_connections();

    timeout(WAIT, async {
        while broker.connect_count() < 2 || !handle.is_ready().await {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("session did not reconnect");

    assert_eq!(handle.symbol_id("EURUSD").await, Some(1));
}

#[tokio::test]
async fn test_idle_watchdog_forces_reconnect() {
    let broker = MockBroker::new(symbols());
    let mut config = config("alpha");
    // Quiet heartbeats, tight idle threshold: the watchdog must fire first.
    config.heartbeat_interval = Duration::from_secs(60);
    config.max_idle = Duration::from_millis(200);
    let handle = SessionHandle::spawn(config, Arc::new(broker.clone()));
    wait_ready(&handle).await;

    // The broker goes silent; nothing inbound refreshes the idle clock.
    timeout(WAIT, async {
        while broker.connect_count() < 2 {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("idle watchdog did not force a reconnect");
}

#[tokio::test]
async fn test_close_cancels_session() {
    let broker = MockBroker::new(symbols());
    let handle = SessionHandle::spawn(config("alpha"), Arc::new(broker.clone()));
    wait_ready(&handle).await;

    handle.close().await;
    tokio::time::sleep(Duration::from_millis(50)).await;

    let err = handle
        .send(Request::Reconcile(ReconcileReq { account_id: 7001 }))
        .await
        .unwrap_err();
    assert_eq!(err, ClientError::Cancelled);
    assert_eq!(handle.phase().await, SessionPhase::Disconnected);
}
