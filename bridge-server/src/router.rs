//! Event routing.
//!
//! Classifies a normalized ingress event, runs the process-wide staging
//! (master open lots, desired SL/TP), then fans the event out to every
//! account. Accounts are independent; a failure on one is logged and never
//! stops the others.

use std::sync::Arc;

use crate::accounts::AccountRegistry;
use crate::deferred::{DeferredStore, PendingSltp};
use crate::events::{EventKind, TradeEvent};

pub struct EventRouter {
    registry: Arc<AccountRegistry>,
    deferred: Arc<DeferredStore>,
}

impl EventRouter {
    pub fn new(registry: Arc<AccountRegistry>, deferred: Arc<DeferredStore>) -> Self {
        Self { registry, deferred }
    }

    pub async fn route(&self, event: &TradeEvent) {
        tracing::info!(
            "Processing event: {} for ticket {} (magic: {})",
            event.kind,
            event.ticket,
            event.magic
        );

        if matches!(event.kind, EventKind::Open | EventKind::PendingOpen) {
            if let Some(lots) = event.volume {
                self.deferred.record_open_lots(event.ticket, lots);
            }
            if event.sl > 0.0 || event.tp > 0.0 {
                for account in self.registry.accounts() {
                    self.deferred.stage_sltp(
                        account.name(),
                        event.ticket,
                        PendingSltp {
                            symbol: event.symbol.clone(),
                            sl: event.sl,
                            tp: event.tp,
                        },
                    );
                }
            }
        }

        for account in self.registry.accounts() {
            let result = match event.kind {
                EventKind::Open => account.handle_open(event).await,
                EventKind::PendingOpen => account.handle_pending_open(event).await,
                EventKind::Modify => account.handle_modify(event).await,
                EventKind::Close => account.handle_close(event).await,
                EventKind::PendingCancel => account.handle_pending_cancel(event).await,
            };
            match result {
                Ok(()) => {}
                Err(e) if e.is_expected() => tracing::warn!(
                    "[{}] Skipping {} for ticket {}: {}",
                    account.name(),
                    event.kind,
                    event.ticket,
                    e
                ),
                Err(e) => tracing::error!(
                    "[{}] Failed to replicate {} for ticket {}: {}",
                    account.name(),
                    event.kind,
                    event.ticket,
                    e
                ),
            }
        }

        match event.kind {
            EventKind::Close => {
                // Any CLOSE clears staged SL/TP; a full close also drops the
                // master lots baseline.
                self.deferred.discard_sltp(event.ticket);
                let full_close =
                    match (event.volume, self.deferred.master_open_lots(event.ticket)) {
                        (None, _) => true,
                        (Some(lots), Some(master)) => lots + 1e-9 >= master,
                        (Some(_), None) => true,
                    };
                if full_close {
                    self.deferred.remove_ticket(event.ticket);
                }
            }
            EventKind::PendingCancel => {
                self.deferred.remove_ticket(event.ticket);
            }
            _ => {}
        }
    }
}
