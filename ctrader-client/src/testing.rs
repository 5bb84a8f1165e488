//! In-process broker stub for tests.
//!
//! Accepts session connections, answers the bootstrap sequence from
//! configurable fixtures, records trade requests and lets tests inject push
//! events or drop the transport to exercise reconnect paths.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::ClientError;
use crate::messages::{
    ErrorRes, ExecutionEvent, ExecutionType, Frame, Payload, PushEvent, ReconcileSnapshot,
    Request, Response, SymbolSpec, TraderSnapshot,
};
use crate::transport::{Connector, Transport};

const CONN_CHANNEL_CAPACITY: usize = 64;

struct ConnectionHandle {
    to_session: mpsc::Sender<Frame>,
    _kill: mpsc::Sender<()>,
}

struct BrokerInner {
    symbols: Mutex<Vec<SymbolSpec>>,
    reconcile: Mutex<ReconcileSnapshot>,
    trader: Mutex<TraderSnapshot>,
    trade_requests: Mutex<Vec<Request>>,
    fail_next_trade: Mutex<Option<ErrorRes>>,
    reject_account_auth: AtomicBool,
    muted: AtomicBool,
    connections: Mutex<Vec<ConnectionHandle>>,
    connects: AtomicUsize,
}

#[derive(Clone)]
pub struct MockBroker {
    inner: Arc<BrokerInner>,
}

impl MockBroker {
    pub fn new(symbols: Vec<SymbolSpec>) -> Self {
        Self {
            inner: Arc::new(BrokerInner {
                symbols: Mutex::new(symbols),
                reconcile: Mutex::new(ReconcileSnapshot {
                    positions: Vec::new(),
                    orders: Vec::new(),
                }),
                trader: Mutex::new(TraderSnapshot {
                    balance_cents: 1_000_000,
                    equity_cents: 1_000_000,
                }),
                trade_requests: Mutex::new(Vec::new()),
                fail_next_trade: Mutex::new(None),
                reject_account_auth: AtomicBool::new(false),
                muted: AtomicBool::new(false),
                connections: Mutex::new(Vec::new()),
                connects: AtomicUsize::new(0),
            }),
        }
    }

    pub fn set_trader(&self, trader: TraderSnapshot) {
        *self.inner.trader.lock().unwrap() = trader;
    }

    pub fn set_reconcile(&self, snapshot: ReconcileSnapshot) {
        *self.inner.reconcile.lock().unwrap() = snapshot;
    }

    pub fn reject_account_auth(&self, reject: bool) {
        self.inner
            .reject_account_auth
            .store(reject, Ordering::Relaxed);
    }

    /// While muted the broker records requests but never answers them,
    /// leaving the caller's future in flight.
    pub fn set_mute(&self, muted: bool) {
        self.inner.muted.store(muted, Ordering::Relaxed);
    }

    /// Fail the next trade request (order/amend/close/cancel) with a broker
    /// business error.
    pub fn fail_next_trade(&self, code: &str, description: &str) {
        *self.inner.fail_next_trade.lock().unwrap() = Some(ErrorRes {
            code: code.to_string(),
            description: description.to_string(),
        });
    }

    /// Trade requests (order/amend/close/cancel) observed so far.
    pub fn trade_requests(&self) -> Vec<Request> {
        self.inner.trade_requests.lock().unwrap().clone()
    }

    /// Poll until at least `count` trade requests were observed.
    pub async fn wait_for_trade_requests(&self, count: usize) {
        loop {
            if self.inner.trade_requests.lock().unwrap().len() >= count {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    pub fn connect_count(&self) -> usize {
        self.inner.connects.load(Ordering::Relaxed)
    }

    /// Deliver a push event on every live connection.
    pub async fn push(&self, event: PushEvent) {
        let senders: Vec<mpsc::Sender<Frame>> = {
            let conns = self.inner.connections.lock().unwrap();
            conns.iter().map(|c| c.to_session.clone()).collect()
        };
        for sender in senders {
            let _ = sender.send(Frame::event(event.clone())).await;
        }
    }

    /// Drop all live connections; sessions observe a transport loss.
    pub fn drop_connections(&self) {
        self.inner.connections.lock().unwrap().clear();
    }
}

#[async_trait]
impl Connector for MockBroker {
    async fn connect(&self) -> Result<Transport, ClientError> {
        let (out_tx, out_rx) = mpsc::channel::<Frame>(CONN_CHANNEL_CAPACITY);
        let (in_tx, in_rx) = mpsc::channel::<Frame>(CONN_CHANNEL_CAPACITY);
        let (kill_tx, kill_rx) = mpsc::channel::<()>(1);

        self.inner.connects.fetch_add(1, Ordering::Relaxed);
        self.inner.connections.lock().unwrap().push(ConnectionHandle {
            to_session: in_tx.clone(),
            _kill: kill_tx,
        });

        tokio::spawn(serve(self.inner.clone(), out_rx, in_tx, kill_rx));

        Ok(Transport {
            tx: out_tx,
            rx: in_rx,
        })
    }
}

async fn serve(
    inner: Arc<BrokerInner>,
    mut from_session: mpsc::Receiver<Frame>,
    to_session: mpsc::Sender<Frame>,
    mut kill: mpsc::Receiver<()>,
) {
    loop {
        tokio::select! {
            // Fires when the broker drops the connection handle.
            _ = kill.recv() => return,
            frame = from_session.recv() => {
                let Some(Frame { msg_id, payload }) = frame else { return };
                let Payload::Request(request) = payload else { continue };

                if is_trade_request(&request) {
                    inner.trade_requests.lock().unwrap().push(request.clone());
                }

                if inner.muted.load(Ordering::Relaxed) {
                    continue;
                }

                let reply = match respond(&inner, &request) {
                    Ok(response) => Frame {
                        msg_id,
                        payload: Payload::Response(response),
                    },
                    Err(err) => Frame {
                        msg_id,
                        payload: Payload::Error(err),
                    },
                };
                if to_session.send(reply).await.is_err() {
                    return;
                }
            }
        }
    }
}

fn is_trade_request(request: &Request) -> bool {
    matches!(
        request,
        Request::NewOrder(_)
            | Request::AmendPositionSltp(_)
            | Request::ClosePosition(_)
            | Request::CancelOrder(_)
    )
}

fn respond(inner: &BrokerInner, request: &Request) -> Result<Response, ErrorRes> {
    match request {
        Request::ApplicationAuth(_) => Ok(Response::ApplicationAuth),
        Request::AccountAuth(req) => {
            if inner.reject_account_auth.load(Ordering::Relaxed) {
                Err(ErrorRes {
                    code: "CH_ACCESS_TOKEN_INVALID".to_string(),
                    description: "invalid access token".to_string(),
                })
            } else {
                Ok(Response::AccountAuth {
                    account_id: req.account_id,
                })
            }
        }
        Request::SymbolsList(_) | Request::SymbolById(_) => Ok(Response::Symbols {
            symbols: inner.symbols.lock().unwrap().clone(),
        }),
        Request::Trader(_) => Ok(Response::Trader(inner.trader.lock().unwrap().clone())),
        Request::Reconcile(_) => Ok(Response::Reconcile(inner.reconcile.lock().unwrap().clone())),
        Request::NewOrder(_)
        | Request::AmendPositionSltp(_)
        | Request::ClosePosition(_)
        | Request::CancelOrder(_) => {
            if let Some(err) = inner.fail_next_trade.lock().unwrap().take() {
                return Err(err);
            }
            Ok(Response::Execution(ExecutionEvent {
                execution_type: ExecutionType::Accepted,
                order: None,
                position: None,
            }))
        }
    }
}
