//! Per-account session manager.
//!
//! One spawned task per account owns the transport and drives the phase
//! machine: connect, application auth, account auth, symbol load, trader
//! snapshot, reconcile, ready. Requests are correlated to responses by
//! message id; push events fan out on a broadcast stream in arrival order.
//! On any transport or auth failure the task falls back to `Disconnected`
//! and reconnects with bounded exponential backoff.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{broadcast, mpsc, oneshot, RwLock};
use tokio::time::MissedTickBehavior;

use crate::catalog::SymbolCatalog;
use crate::error::ClientError;
use crate::messages::{
    AccountAuthReq, ApplicationAuthReq, ErrorRes, ExecutionEvent, Frame, Payload, PushEvent,
    ReconcileReq, ReconcileSnapshot, Request, Response, SpotEvent, SymbolSpec, SymbolsListReq,
    TraderReq, TraderSnapshot,
};
use crate::transport::{Connector, Transport};

const EVENT_CHANNEL_CAPACITY: usize = 256;
const COMMAND_CHANNEL_CAPACITY: usize = 64;
const IDLE_CHECK_MAX_INTERVAL: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub enum SessionPhase {
    #[default]
    Disconnected,
    Connecting,
    AppAuthed,
    AccountAuthed,
    Ready,
}

#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub account_name: String,
    pub client_id: String,
    pub client_secret: String,
    pub account_id: i64,
    pub access_token: String,
    pub heartbeat_interval: Duration,
    pub max_idle: Duration,
    pub reconnect_min: Duration,
    pub reconnect_max: Duration,
}

impl SessionConfig {
    pub fn new(
        account_name: impl Into<String>,
        client_id: impl Into<String>,
        client_secret: impl Into<String>,
        account_id: i64,
        access_token: impl Into<String>,
    ) -> Self {
        Self {
            account_name: account_name.into(),
            client_id: client_id.into(),
            client_secret: client_secret.into(),
            account_id,
            access_token: access_token.into(),
            heartbeat_interval: Duration::from_secs(30),
            max_idle: Duration::from_secs(120),
            reconnect_min: Duration::from_secs(1),
            reconnect_max: Duration::from_secs(60),
        }
    }
}

/// Events delivered to subscribers, in transport arrival order.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    PhaseChanged(SessionPhase),
    Execution(ExecutionEvent),
    /// Re-emitted reconcile snapshot; authoritative at its moment.
    Reconciled(ReconcileSnapshot),
    Spot(SpotEvent),
}

#[derive(Default)]
struct Shared {
    phase: RwLock<SessionPhase>,
    catalog: RwLock<SymbolCatalog>,
    trader: RwLock<Option<TraderSnapshot>>,
    spots: RwLock<HashMap<i64, f64>>,
}

enum Command {
    Send {
        request: Request,
        reply: oneshot::Sender<Result<Response, ClientError>>,
    },
    Close,
}

/// Cloneable handle to a running session task.
#[derive(Clone)]
pub struct SessionHandle {
    account_name: String,
    cmd_tx: mpsc::Sender<Command>,
    events: broadcast::Sender<SessionEvent>,
    shared: Arc<Shared>,
}

impl SessionHandle {
    /// Spawn the session task; it connects immediately and keeps reconnecting
    /// until `close()` is called.
    pub fn spawn(config: SessionConfig, connector: Arc<dyn Connector>) -> Self {
        Self::spawn_with_events(config, connector).0
    }

    /// Like [`spawn`](Self::spawn), but also returns a receiver subscribed
    /// before the task starts, so not even the first reconcile snapshot can
    /// be missed.
    pub fn spawn_with_events(
        config: SessionConfig,
        connector: Arc<dyn Connector>,
    ) -> (Self, broadcast::Receiver<SessionEvent>) {
        let (cmd_tx, cmd_rx) = mpsc::channel(COMMAND_CHANNEL_CAPACITY);
        let (events, receiver) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let shared = Arc::new(Shared::default());

        let handle = SessionHandle {
            account_name: config.account_name.clone(),
            cmd_tx,
            events: events.clone(),
            shared: shared.clone(),
        };

        let session = Session {
            config,
            connector,
            cmd_rx,
            events,
            shared,
            pending: HashMap::new(),
            bootstrap: HashMap::new(),
            phase: SessionPhase::Disconnected,
            last_msg: Instant::now(),
            reached_ready: false,
        };
        tokio::spawn(session.run());
        (handle, receiver)
    }

    pub fn account_name(&self) -> &str {
        &self.account_name
    }

    /// Issue a request and await its response.
    ///
    /// Fails `NotReady` before application auth, `AccountNotReady` before
    /// account auth for account-scoped requests, `Disconnected` when the
    /// transport drops mid-flight and `Cancelled` on shutdown.
    pub async fn send(&self, request: Request) -> Result<Response, ClientError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::Send {
                request,
                reply: reply_tx,
            })
            .await
            .map_err(|_| ClientError::Cancelled)?;
        reply_rx.await.map_err(|_| ClientError::Cancelled)?
    }

    /// Subscribe to the push-event stream.
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    pub async fn phase(&self) -> SessionPhase {
        *self.shared.phase.read().await
    }

    pub async fn is_ready(&self) -> bool {
        self.phase().await == SessionPhase::Ready
    }

    pub async fn symbol_id(&self, name: &str) -> Option<i64> {
        self.shared.catalog.read().await.symbol_id(name)
    }

    pub async fn spec(&self, symbol_id: i64) -> Option<SymbolSpec> {
        self.shared.catalog.read().await.spec(symbol_id).cloned()
    }

    pub async fn round_price(&self, symbol_id: i64, price: f64) -> f64 {
        self.shared.catalog.read().await.round_price(symbol_id, price)
    }

    pub async fn snap_volume(&self, symbol_id: i64, units: i64) -> i64 {
        self.shared.catalog.read().await.snap_volume(symbol_id, units)
    }

    pub async fn lots_to_units(
        &self,
        symbol_id: i64,
        lots: f64,
        assume_forex: bool,
    ) -> Result<i64, ClientError> {
        self.shared
            .catalog
            .read()
            .await
            .lots_to_units(symbol_id, lots, assume_forex)
    }

    pub async fn tick_size(&self, symbol_id: i64) -> Option<f64> {
        self.shared.catalog.read().await.tick_size(symbol_id)
    }

    pub async fn trader(&self) -> Option<TraderSnapshot> {
        self.shared.trader.read().await.clone()
    }

    /// Last seen spot price for a symbol, if any arrived this connection.
    pub async fn last_price(&self, symbol_id: i64) -> Option<f64> {
        self.shared.spots.read().await.get(&symbol_id).copied()
    }

    /// Tear down the session; outstanding futures fail with `Cancelled`.
    pub async fn close(&self) {
        let _ = self.cmd_tx.send(Command::Close).await;
    }
}

enum ConnectionEnd {
    Lost,
    Shutdown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BootstrapOp {
    AppAuth,
    AccountAuth,
    Symbols,
    Trader,
    Reconcile,
}

struct Session {
    config: SessionConfig,
    connector: Arc<dyn Connector>,
    cmd_rx: mpsc::Receiver<Command>,
    events: broadcast::Sender<SessionEvent>,
    shared: Arc<Shared>,
    pending: HashMap<String, oneshot::Sender<Result<Response, ClientError>>>,
    bootstrap: HashMap<String, BootstrapOp>,
    phase: SessionPhase,
    last_msg: Instant,
    reached_ready: bool,
}

impl Session {
    async fn run(mut self) {
        let mut backoff = self.config.reconnect_min;
        loop {
            self.reached_ready = false;
            match self.connector.connect().await {
                Ok(transport) => {
                    tracing::info!(
                        account = %self.config.account_name,
                        "Connected to broker endpoint"
                    );
                    let end = self.drive(transport).await;
                    self.reset_connection_state().await;
                    match end {
                        ConnectionEnd::Shutdown => {
                            self.fail_pending(ClientError::Cancelled);
                            self.set_phase(SessionPhase::Disconnected).await;
                            tracing::info!(account = %self.config.account_name, "Session closed");
                            return;
                        }
                        ConnectionEnd::Lost => {
                            self.fail_pending(ClientError::Disconnected);
                            self.set_phase(SessionPhase::Disconnected).await;
                        }
                    }
                    if self.reached_ready {
                        backoff = self.config.reconnect_min;
                    }
                }
                Err(e) => {
                    tracing::warn!(
                        account = %self.config.account_name,
                        "Connect failed: {}",
                        e
                    );
                }
            }

            tracing::info!(
                account = %self.config.account_name,
                "Reconnecting in {:?}",
                backoff
            );
            if self.wait_backoff(backoff).await {
                self.set_phase(SessionPhase::Disconnected).await;
                return;
            }
            backoff = (backoff * 2).min(self.config.reconnect_max);
        }
    }

    /// Sleep out the backoff while still answering commands; returns true on
    /// shutdown.
    async fn wait_backoff(&mut self, backoff: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + backoff;
        loop {
            tokio::select! {
                _ = tokio::time::sleep_until(deadline) => return false,
                cmd = self.cmd_rx.recv() => match cmd {
                    None | Some(Command::Close) => return true,
                    Some(Command::Send { reply, .. }) => {
                        let _ = reply.send(Err(ClientError::NotReady));
                    }
                },
            }
        }
    }

    async fn drive(&mut self, transport: Transport) -> ConnectionEnd {
        let Transport { tx, mut rx } = transport;
        self.last_msg = Instant::now();
        self.set_phase(SessionPhase::Connecting).await;

        // Application auth opens every connection.
        let app_auth = Request::ApplicationAuth(ApplicationAuthReq {
            client_id: self.config.client_id.clone(),
            client_secret: self.config.client_secret.clone(),
        });
        if self
            .send_bootstrap(&tx, BootstrapOp::AppAuth, app_auth)
            .await
            .is_err()
        {
            return ConnectionEnd::Lost;
        }

        let mut heartbeat = tokio::time::interval(self.config.heartbeat_interval);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let idle_every = (self.config.max_idle / 4)
            .clamp(Duration::from_millis(50), IDLE_CHECK_MAX_INTERVAL);
        let mut idle_check = tokio::time::interval(idle_every);
        idle_check.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                cmd = self.cmd_rx.recv() => match cmd {
                    None | Some(Command::Close) => return ConnectionEnd::Shutdown,
                    Some(Command::Send { request, reply }) => {
                        if let Err(end) = self.dispatch(&tx, request, reply).await {
                            return end;
                        }
                    }
                },
                frame = rx.recv() => match frame {
                    None => {
                        tracing::warn!(
                            account = %self.config.account_name,
                            "Transport closed by peer"
                        );
                        return ConnectionEnd::Lost;
                    }
                    Some(frame) => {
                        self.last_msg = Instant::now();
                        if let Err(end) = self.handle_frame(&tx, frame).await {
                            return end;
                        }
                    }
                },
                _ = heartbeat.tick() => {
                    if self.phase == SessionPhase::Ready {
                        tracing::debug!(account = %self.config.account_name, "Heartbeat OK");
                    }
                    if tx.send(Frame::heartbeat()).await.is_err() {
                        return ConnectionEnd::Lost;
                    }
                },
                _ = idle_check.tick() => {
                    let idle = self.last_msg.elapsed();
                    if idle > self.config.max_idle {
                        tracing::warn!(
                            account = %self.config.account_name,
                            "Connection idle for {}s, forcing reconnect",
                            idle.as_secs()
                        );
                        return ConnectionEnd::Lost;
                    }
                },
            }
        }
    }

    async fn dispatch(
        &mut self,
        tx: &mpsc::Sender<Frame>,
        request: Request,
        reply: oneshot::Sender<Result<Response, ClientError>>,
    ) -> Result<(), ConnectionEnd> {
        if self.phase < SessionPhase::AppAuthed {
            let _ = reply.send(Err(ClientError::NotReady));
            return Ok(());
        }
        if request.requires_account_auth() && self.phase < SessionPhase::AccountAuthed {
            let _ = reply.send(Err(ClientError::AccountNotReady));
            return Ok(());
        }

        let msg_id = uuid::Uuid::new_v4().to_string();
        if tx
            .send(Frame::request(msg_id.clone(), request))
            .await
            .is_err()
        {
            let _ = reply.send(Err(ClientError::Disconnected));
            return Err(ConnectionEnd::Lost);
        }
        self.pending.insert(msg_id, reply);
        Ok(())
    }

    async fn handle_frame(
        &mut self,
        tx: &mpsc::Sender<Frame>,
        frame: Frame,
    ) -> Result<(), ConnectionEnd> {
        match frame.payload {
            Payload::Heartbeat => {}
            Payload::Response(response) => {
                let Some(msg_id) = frame.msg_id else {
                    tracing::debug!("Response frame without msg_id ignored");
                    return Ok(());
                };
                if let Some(op) = self.bootstrap.remove(&msg_id) {
                    return self.advance_bootstrap(tx, op, response).await;
                }
                if let Some(reply) = self.pending.remove(&msg_id) {
                    let _ = reply.send(Ok(response));
                } else {
                    tracing::debug!("Unmatched response for msg_id {}", msg_id);
                }
            }
            Payload::Error(err) => match frame.msg_id {
                Some(msg_id) => {
                    if let Some(op) = self.bootstrap.remove(&msg_id) {
                        return self.bootstrap_failed(tx, op, err).await;
                    }
                    if let Some(reply) = self.pending.remove(&msg_id) {
                        let _ = reply.send(Err(ClientError::Broker {
                            code: err.code,
                            description: err.description,
                        }));
                    }
                }
                None => tracing::warn!(
                    account = %self.config.account_name,
                    "Broker error: {} ({})",
                    err.description,
                    err.code
                ),
            },
            Payload::Event(event) => self.handle_event(event).await,
            Payload::Request(_) => {
                tracing::warn!("Unexpected request frame from broker, ignoring")
            }
        }
        Ok(())
    }

    async fn advance_bootstrap(
        &mut self,
        tx: &mpsc::Sender<Frame>,
        op: BootstrapOp,
        response: Response,
    ) -> Result<(), ConnectionEnd> {
        let account_id = self.config.account_id;
        match (op, response) {
            (BootstrapOp::AppAuth, Response::ApplicationAuth) => {
                tracing::info!(account = %self.config.account_name, "Application authenticated");
                self.set_phase(SessionPhase::AppAuthed).await;
                if account_id > 0 {
                    let req = Request::AccountAuth(AccountAuthReq {
                        account_id,
                        access_token: self.config.access_token.clone(),
                    });
                    self.send_bootstrap(tx, BootstrapOp::AccountAuth, req)
                        .await
                        .map_err(|_| ConnectionEnd::Lost)?;
                } else {
                    tracing::warn!(
                        account = %self.config.account_name,
                        "No valid account credentials set, staying app-authed only"
                    );
                }
            }
            (BootstrapOp::AccountAuth, Response::AccountAuth { .. }) => {
                tracing::info!(
                    account = %self.config.account_name,
                    "Account {} authorized",
                    account_id
                );
                self.set_phase(SessionPhase::AccountAuthed).await;
                let req = Request::SymbolsList(SymbolsListReq { account_id });
                self.send_bootstrap(tx, BootstrapOp::Symbols, req)
                    .await
                    .map_err(|_| ConnectionEnd::Lost)?;
            }
            (BootstrapOp::Symbols, Response::Symbols { symbols }) => {
                let catalog = SymbolCatalog::from_symbols(symbols);
                tracing::info!(
                    account = %self.config.account_name,
                    "Loaded {} symbols",
                    catalog.len()
                );
                *self.shared.catalog.write().await = catalog;
                let req = Request::Trader(TraderReq { account_id });
                self.send_bootstrap(tx, BootstrapOp::Trader, req)
                    .await
                    .map_err(|_| ConnectionEnd::Lost)?;
            }
            (BootstrapOp::Trader, Response::Trader(snapshot)) => {
                *self.shared.trader.write().await = Some(snapshot);
                let req = Request::Reconcile(ReconcileReq { account_id });
                self.send_bootstrap(tx, BootstrapOp::Reconcile, req)
                    .await
                    .map_err(|_| ConnectionEnd::Lost)?;
            }
            (BootstrapOp::Reconcile, Response::Reconcile(snapshot)) => {
                tracing::info!(
                    account = %self.config.account_name,
                    "Session ready ({} positions, {} orders reconciled)",
                    snapshot.positions.len(),
                    snapshot.orders.len()
                );
                self.set_phase(SessionPhase::Ready).await;
                self.reached_ready = true;
                let _ = self.events.send(SessionEvent::Reconciled(snapshot));
            }
            (op, other) => {
                tracing::error!(
                    account = %self.config.account_name,
                    "Unexpected bootstrap response for {:?}: {:?}",
                    op,
                    other
                );
                return Err(ConnectionEnd::Lost);
            }
        }
        Ok(())
    }

    async fn bootstrap_failed(
        &mut self,
        tx: &mpsc::Sender<Frame>,
        op: BootstrapOp,
        err: ErrorRes,
    ) -> Result<(), ConnectionEnd> {
        match op {
            // A missing trader snapshot only degrades risk sizing; keep going.
            BootstrapOp::Trader => {
                tracing::warn!(
                    account = %self.config.account_name,
                    "Trader snapshot unavailable: {} ({})",
                    err.description,
                    err.code
                );
                let req = Request::Reconcile(ReconcileReq {
                    account_id: self.config.account_id,
                });
                self.send_bootstrap(tx, BootstrapOp::Reconcile, req)
                    .await
                    .map_err(|_| ConnectionEnd::Lost)?;
                Ok(())
            }
            _ => {
                tracing::error!(
                    account = %self.config.account_name,
                    "Bootstrap step {:?} failed: {} ({})",
                    op,
                    err.description,
                    err.code
                );
                Err(ConnectionEnd::Lost)
            }
        }
    }

    async fn handle_event(&mut self, event: PushEvent) {
        match event {
            PushEvent::Execution(exec) => {
                let _ = self.events.send(SessionEvent::Execution(exec));
            }
            PushEvent::Spot(spot) => {
                let price = match (spot.bid, spot.ask) {
                    (Some(bid), Some(ask)) => Some((bid + ask) / 2.0),
                    (bid, ask) => bid.or(ask),
                };
                if let Some(price) = price {
                    self.shared.spots.write().await.insert(spot.symbol_id, price);
                }
                let _ = self.events.send(SessionEvent::Spot(spot));
            }
            PushEvent::TraderUpdated(snapshot) => {
                *self.shared.trader.write().await = Some(snapshot);
            }
        }
    }

    async fn send_bootstrap(
        &mut self,
        tx: &mpsc::Sender<Frame>,
        op: BootstrapOp,
        request: Request,
    ) -> Result<(), ()> {
        let msg_id = uuid::Uuid::new_v4().to_string();
        if tx
            .send(Frame::request(msg_id.clone(), request))
            .await
            .is_err()
        {
            return Err(());
        }
        self.bootstrap.insert(msg_id, op);
        Ok(())
    }

    async fn set_phase(&mut self, phase: SessionPhase) {
        if self.phase == phase {
            return;
        }
        self.phase = phase;
        *self.shared.phase.write().await = phase;
        let _ = self.events.send(SessionEvent::PhaseChanged(phase));
    }

    fn fail_pending(&mut self, err: ClientError) {
        self.bootstrap.clear();
        for (_, reply) in self.pending.drain() {
            let _ = reply.send(Err(err.clone()));
        }
    }

    /// A disconnect invalidates everything loaded for the connection.
    async fn reset_connection_state(&mut self) {
        *self.shared.catalog.write().await = SymbolCatalog::new();
        self.shared.spots.write().await.clear();
        self.bootstrap.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_phase_ordering_is_monotonic() {
        assert!(SessionPhase::Disconnected < SessionPhase::Connecting);
        assert!(SessionPhase::Connecting < SessionPhase::AppAuthed);
        assert!(SessionPhase::AppAuthed < SessionPhase::AccountAuthed);
        assert!(SessionPhase::AccountAuthed < SessionPhase::Ready);
    }

    #[test]
    fn test_session_config_defaults() {
        let config = SessionConfig::new("acct", "id", "secret", 42, "token");
        assert_eq!(config.heartbeat_interval, Duration::from_secs(30));
        assert_eq!(config.max_idle, Duration::from_secs(120));
        assert_eq!(config.reconnect_min, Duration::from_secs(1));
        assert_eq!(config.reconnect_max, Duration::from_secs(60));
    }
}
