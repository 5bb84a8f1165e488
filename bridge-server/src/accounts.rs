//! Per-account runtime and registry.
//!
//! Each enabled account owns one broker session plus its correlation store
//! and trade counters. A spawned event pump consumes the session's push
//! stream: execution events and reconcile snapshots update the correlation
//! store, and every newly learned ticket triggers a deferred SL/TP flush.

use std::sync::{Arc, Mutex};

use tokio::sync::broadcast::error::RecvError;

use ctrader_client::messages::{AmendPositionSltpReq, Request};
use ctrader_client::{Connector, SessionConfig, SessionEvent, SessionHandle};

use crate::config::{AccountConfig, Config};
use crate::correlation::CorrelationStore;
use crate::deferred::DeferredStore;
use crate::policy::TradeCounters;
use crate::symbols::SymbolMapper;

pub struct AccountRuntime {
    pub config: AccountConfig,
    pub session: SessionHandle,
    pub correlation: CorrelationStore,
    pub mapper: SymbolMapper,
    pub counters: Mutex<TradeCounters>,
    pub(crate) deferred: Arc<DeferredStore>,
}

impl AccountRuntime {
    /// Spawn the session and the event pump for one account.
    pub fn start(
        config: AccountConfig,
        connector: Arc<dyn Connector>,
        deferred: Arc<DeferredStore>,
    ) -> Arc<Self> {
        let session_config = SessionConfig::new(
            config.name.clone(),
            config.client_id.clone(),
            config.client_secret.clone(),
            config.account_id,
            config.access_token.clone(),
        );
        // Subscribe before the session task starts so the initial reconcile
        // snapshot cannot slip past the pump.
        let (session, events) = SessionHandle::spawn_with_events(session_config, connector);
        let mapper = SymbolMapper::new(
            &config.symbol_prefix,
            &config.symbol_suffix,
            &config.custom_symbols,
        );

        let runtime = Arc::new(Self {
            config,
            session,
            correlation: CorrelationStore::new(),
            mapper,
            counters: Mutex::new(TradeCounters::new()),
            deferred,
        });

        tokio::spawn(runtime.clone().run_event_pump(events));
        runtime
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    async fn run_event_pump(
        self: Arc<Self>,
        mut events: tokio::sync::broadcast::Receiver<SessionEvent>,
    ) {
        loop {
            match events.recv().await {
                Ok(SessionEvent::Execution(exec)) => {
                    let learned = self.correlation.apply_execution(&exec).await;
                    for ticket in learned {
                        self.flush_deferred_sltp(ticket).await;
                    }
                }
                Ok(SessionEvent::Reconciled(snapshot)) => {
                    let tickets = self.correlation.apply_reconcile(&snapshot).await;
                    for ticket in tickets {
                        self.flush_deferred_sltp(ticket).await;
                    }
                }
                Ok(_) => {}
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!(
                        account = %self.config.name,
                        "Event stream lagged, {} events skipped",
                        skipped
                    );
                }
                Err(RecvError::Closed) => return,
            }
        }
    }

    /// Attach staged SL/TP once the position id for a ticket is known.
    /// The claim removes the entry first, so the attempt is at-most-once.
    pub(crate) async fn flush_deferred_sltp(&self, ticket: i64) {
        let Some(position_id) = self.correlation.position_id(ticket).await else {
            return;
        };
        let Some(payload) = self.deferred.claim_sltp(&self.config.name, ticket) else {
            return;
        };

        let sl = (self.config.copy_sl && payload.sl > 0.0).then_some(payload.sl);
        let tp = (self.config.copy_tp && payload.tp > 0.0).then_some(payload.tp);
        if sl.is_none() && tp.is_none() {
            return;
        }

        let symbol_id = self
            .session
            .symbol_id(&self.mapper.normalize(&payload.symbol))
            .await;
        let sl = self.round_opt(symbol_id, sl).await;
        let tp = self.round_opt(symbol_id, tp).await;

        tracing::info!(
            account = %self.config.name,
            "Applying deferred SL/TP for ticket {} -> position {}, SL={:?}, TP={:?}",
            ticket,
            position_id,
            sl,
            tp
        );

        let request = Request::AmendPositionSltp(AmendPositionSltpReq {
            account_id: self.config.account_id,
            position_id,
            stop_loss: sl,
            take_profit: tp,
        });
        match self.session.send(request).await {
            Ok(_) => tracing::info!(
                account = %self.config.name,
                "Deferred SL/TP applied for ticket {}",
                ticket
            ),
            Err(e) => tracing::error!(
                account = %self.config.name,
                "Failed to apply deferred SL/TP for ticket {}: {}",
                ticket,
                e
            ),
        }
    }

    pub(crate) async fn round_opt(&self, symbol_id: Option<i64>, price: Option<f64>) -> Option<f64> {
        match (symbol_id, price) {
            (Some(id), Some(p)) => Some(self.session.round_price(id, p).await),
            (_, p) => p,
        }
    }

    pub fn daily_trades(&self) -> u32 {
        self.counters.lock().unwrap().trades_today()
    }
}

#[derive(Default)]
pub struct AccountRegistry {
    accounts: Vec<Arc<AccountRuntime>>,
}

impl AccountRegistry {
    /// Start a runtime for every enabled account in the configuration.
    pub fn start(
        config: &Config,
        deferred: Arc<DeferredStore>,
        connect: impl Fn(&AccountConfig) -> Arc<dyn Connector>,
    ) -> Self {
        let mut accounts = Vec::new();
        for account in &config.accounts {
            if !account.enabled {
                tracing::info!("Skipping disabled account: {}", account.name);
                continue;
            }
            tracing::info!(
                "Initializing account: {} (account id {}, {:?})",
                account.name,
                account.account_id,
                account.environment
            );
            accounts.push(AccountRuntime::start(
                account.clone(),
                connect(account),
                deferred.clone(),
            ));
        }
        Self { accounts }
    }

    /// Assemble a registry from already-started runtimes (tests).
    pub fn from_runtimes(accounts: Vec<Arc<AccountRuntime>>) -> Self {
        Self { accounts }
    }

    pub fn accounts(&self) -> &[Arc<AccountRuntime>] {
        &self.accounts
    }

    pub fn get(&self, name: &str) -> Option<&Arc<AccountRuntime>> {
        self.accounts.iter().find(|a| a.name() == name)
    }

    pub fn len(&self) -> usize {
        self.accounts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.accounts.is_empty()
    }

    pub async fn close_all(&self) {
        for account in &self.accounts {
            account.session.close().await;
        }
    }
}
