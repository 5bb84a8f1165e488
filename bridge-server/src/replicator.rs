//! Per-account event replication.
//!
//! Every handler runs independently per account; an error here is reported
//! to the router and never affects other accounts. Opens go out without
//! SL/TP (attached later through the deferred store once the broker assigns
//! a position id), closes honour proportional partial closes, cancels
//! address the correlated pending order.

use thiserror::Error;

use ctrader_client::messages::{
    CancelOrderReq, ClosePositionReq, NewOrderReq, OrderType, Request, TimeInForce,
};
use ctrader_client::ClientError;

use crate::accounts::AccountRuntime;
use crate::config::RiskMode;
use crate::correlation::ticket_label;
use crate::deferred::PendingSltp;
use crate::events::{PendingKind, TradeEvent};
use crate::policy::{self, PolicyRejection};
use crate::sizing::{size_open_lots, SizingError, SizingInputs};

#[derive(Debug, Error)]
pub enum ReplicationError {
    #[error("session not ready")]
    SessionNotReady,
    #[error("unknown instrument {0}")]
    UnknownInstrument(String),
    #[error(transparent)]
    Policy(#[from] PolicyRejection),
    #[error(transparent)]
    Sizing(#[from] SizingError),
    #[error(transparent)]
    Client(#[from] ClientError),
    #[error("no correlated position for ticket {0}")]
    NoPosition(i64),
    #[error("no correlated pending order for ticket {0}")]
    NoOrder(i64),
    #[error("event missing required field: {0}")]
    MissingField(&'static str),
    #[error("cannot determine close volume for ticket {0}")]
    NoCloseVolume(i64),
}

impl ReplicationError {
    /// Expected skips (filters, unknown symbols, missing correlations) are
    /// logged as warnings; everything else is an error.
    pub fn is_expected(&self) -> bool {
        matches!(
            self,
            ReplicationError::SessionNotReady
                | ReplicationError::UnknownInstrument(_)
                | ReplicationError::Policy(_)
                | ReplicationError::Sizing(_)
                | ReplicationError::NoPosition(_)
                | ReplicationError::NoOrder(_)
        )
    }
}

impl AccountRuntime {
    /// Replicate an OPEN as a bare market order labelled `SRC_<ticket>`.
    pub async fn handle_open(&self, event: &TradeEvent) -> Result<(), ReplicationError> {
        if !self.session.is_ready().await {
            return Err(ReplicationError::SessionNotReady);
        }
        let side = event.side.ok_or(ReplicationError::MissingField("side"))?;
        let source_lots = event
            .volume
            .ok_or(ReplicationError::MissingField("volume"))?;

        let name = self.mapper.normalize(&event.symbol);
        let symbol_id = self
            .session
            .symbol_id(&name)
            .await
            .ok_or_else(|| ReplicationError::UnknownInstrument(event.symbol.clone()))?;

        self.check_open_policy(&name, event.magic, source_lots)
            .await?;

        let lots = self
            .size_lots(event, symbol_id, source_lots, event.entry_price)
            .await?;
        let volume = self
            .session
            .lots_to_units(symbol_id, lots, self.config.assume_forex_contract)
            .await?;

        tracing::info!(
            account = %self.config.name,
            "Opening {:?} {} (symbol id {}): {} units, label {}",
            side,
            name,
            symbol_id,
            volume,
            ticket_label(event.ticket)
        );

        let request = Request::NewOrder(NewOrderReq {
            account_id: self.config.account_id,
            symbol_id,
            order_type: OrderType::Market,
            side,
            volume,
            limit_price: None,
            stop_price: None,
            // SL/TP attach later, once the position id is learned.
            stop_loss: None,
            take_profit: None,
            time_in_force: None,
            expiration_ms: None,
            label: Some(ticket_label(event.ticket)),
        });
        self.session.send(request).await?;
        self.counters.lock().unwrap().record_trade();
        Ok(())
    }

    /// Replicate a PENDING_OPEN as a limit/stop/stop-limit order.
    pub async fn handle_pending_open(&self, event: &TradeEvent) -> Result<(), ReplicationError> {
        if !self.session.is_ready().await {
            return Err(ReplicationError::SessionNotReady);
        }
        let side = event.side.ok_or(ReplicationError::MissingField("side"))?;
        let source_lots = event
            .volume
            .ok_or(ReplicationError::MissingField("volume"))?;
        let pending_kind = event
            .pending_kind
            .ok_or(ReplicationError::MissingField("pending_type"))?;

        let name = self.mapper.normalize(&event.symbol);
        let symbol_id = self
            .session
            .symbol_id(&name)
            .await
            .ok_or_else(|| ReplicationError::UnknownInstrument(event.symbol.clone()))?;

        self.check_open_policy(&name, event.magic, source_lots)
            .await?;

        let limit = event.limit_price.or(event.entry_price);
        let stop = event.stop_price.or(event.entry_price);
        let (order_type, limit_price, stop_price) = match pending_kind {
            PendingKind::Limit => (
                OrderType::Limit,
                Some(limit.ok_or(ReplicationError::MissingField("limit_price"))?),
                None,
            ),
            PendingKind::Stop => (
                OrderType::Stop,
                None,
                Some(stop.ok_or(ReplicationError::MissingField("stop_price"))?),
            ),
            PendingKind::StopLimit => (
                OrderType::StopLimit,
                Some(limit.ok_or(ReplicationError::MissingField("limit_price"))?),
                Some(stop.ok_or(ReplicationError::MissingField("stop_price"))?),
            ),
        };
        let limit_price = self.round_opt(Some(symbol_id), limit_price).await;
        let stop_price = self.round_opt(Some(symbol_id), stop_price).await;

        let entry_estimate = limit_price.or(stop_price);
        let lots = self
            .size_lots(event, symbol_id, source_lots, entry_estimate)
            .await?;
        let volume = self
            .session
            .lots_to_units(symbol_id, lots, self.config.assume_forex_contract)
            .await?;

        let (time_in_force, expiration_ms) = match event.expiration_ms {
            Some(ms) => (Some(TimeInForce::GoodTillDate), Some(ms)),
            None => (None, None),
        };

        tracing::info!(
            account = %self.config.name,
            "Placing {:?} {:?} {} (symbol id {}): {} units, limit={:?}, stop={:?}, label {}",
            order_type,
            side,
            name,
            symbol_id,
            volume,
            limit_price,
            stop_price,
            ticket_label(event.ticket)
        );

        let request = Request::NewOrder(NewOrderReq {
            account_id: self.config.account_id,
            symbol_id,
            order_type,
            side,
            volume,
            limit_price,
            stop_price,
            stop_loss: None,
            take_profit: None,
            time_in_force,
            expiration_ms,
            label: Some(ticket_label(event.ticket)),
        });
        self.session.send(request).await?;
        self.counters.lock().unwrap().record_trade();
        Ok(())
    }

    /// Amend SL/TP when the position is correlated, stage otherwise.
    pub async fn handle_modify(&self, event: &TradeEvent) -> Result<(), ReplicationError> {
        let position_id = self.correlation.position_id(event.ticket).await;
        let position_id = match position_id {
            Some(id) if self.session.is_ready().await => id,
            _ => {
                tracing::warn!(
                    account = %self.config.name,
                    "Position not found for ticket {}, storing pending SL/TP",
                    event.ticket
                );
                self.deferred.stage_sltp(
                    &self.config.name,
                    event.ticket,
                    PendingSltp {
                        symbol: event.symbol.clone(),
                        sl: event.sl,
                        tp: event.tp,
                    },
                );
                return Ok(());
            }
        };

        let symbol_id = self
            .session
            .symbol_id(&self.mapper.normalize(&event.symbol))
            .await;
        let sl = (self.config.copy_sl && event.sl > 0.0).then_some(event.sl);
        let tp = (self.config.copy_tp && event.tp > 0.0).then_some(event.tp);
        let sl = self.round_opt(symbol_id, sl).await;
        let tp = self.round_opt(symbol_id, tp).await;

        tracing::info!(
            account = %self.config.name,
            "Modifying position {} for ticket {}: SL={:?}, TP={:?}",
            position_id,
            event.ticket,
            sl,
            tp
        );

        let request = Request::AmendPositionSltp(ctrader_client::messages::AmendPositionSltpReq {
            account_id: self.config.account_id,
            position_id,
            stop_loss: sl,
            take_profit: tp,
        });
        self.session.send(request).await?;
        Ok(())
    }

    /// Close the correlated position, proportionally when possible.
    pub async fn handle_close(&self, event: &TradeEvent) -> Result<(), ReplicationError> {
        if !self.session.is_ready().await {
            return Err(ReplicationError::SessionNotReady);
        }
        let position_id = self
            .correlation
            .position_id(event.ticket)
            .await
            .ok_or(ReplicationError::NoPosition(event.ticket))?;
        let follower_volume = self.correlation.position_volume(position_id).await;

        let mut close_units = self.close_volume(event, follower_volume)?;
        let symbol_id = self
            .session
            .symbol_id(&self.mapper.normalize(&event.symbol))
            .await;
        if let Some(id) = symbol_id {
            close_units = self.session.snap_volume(id, close_units).await;
        }
        // Never close more than the follower currently holds.
        if let Some(fv) = follower_volume {
            close_units = close_units.min(fv);
        }
        if close_units <= 0 {
            return Err(ReplicationError::NoCloseVolume(event.ticket));
        }

        tracing::info!(
            account = %self.config.name,
            "Closing position {} for ticket {}: {} units",
            position_id,
            event.ticket,
            close_units
        );

        let request = Request::ClosePosition(ClosePositionReq {
            account_id: self.config.account_id,
            position_id,
            volume: close_units,
        });
        self.session.send(request).await?;

        let full_close = follower_volume.map(|fv| close_units >= fv).unwrap_or(true);
        if full_close {
            self.correlation.remove_ticket(event.ticket).await;
        } else if let Some(fv) = follower_volume {
            self.correlation
                .set_position_volume(position_id, fv - close_units)
                .await;
        }
        Ok(())
    }

    /// Cancel the correlated pending order for a ticket.
    pub async fn handle_pending_cancel(&self, event: &TradeEvent) -> Result<(), ReplicationError> {
        if !self.session.is_ready().await {
            return Err(ReplicationError::SessionNotReady);
        }
        let order_id = self
            .correlation
            .order_id(event.ticket)
            .await
            .ok_or(ReplicationError::NoOrder(event.ticket))?;

        tracing::info!(
            account = %self.config.name,
            "Cancelling order {} for ticket {}",
            order_id,
            event.ticket
        );

        let request = Request::CancelOrder(CancelOrderReq {
            account_id: self.config.account_id,
            order_id,
        });
        self.session.send(request).await?;
        self.correlation.remove_order(event.ticket).await;
        Ok(())
    }

    async fn check_open_policy(
        &self,
        symbol: &str,
        magic: i64,
        source_lots: f64,
    ) -> Result<(), PolicyRejection> {
        let open_positions = self.correlation.open_position_count().await;
        let mut counters = self.counters.lock().unwrap();
        policy::check_open(
            &self.config,
            &mut counters,
            open_positions,
            symbol,
            magic,
            source_lots,
        )
    }

    async fn size_lots(
        &self,
        event: &TradeEvent,
        symbol_id: i64,
        source_lots: f64,
        event_entry: Option<f64>,
    ) -> Result<f64, SizingError> {
        let entry_price = match event_entry {
            Some(price) => Some(price),
            // Fall back to the spot cache when the event carried no price.
            None => self.session.last_price(symbol_id).await,
        };
        let spec = self.session.spec(symbol_id).await;
        let inputs = SizingInputs {
            stop_loss: event.stop_loss(),
            entry_price,
            tick_size: self.session.tick_size(symbol_id).await,
            tick_value: spec.and_then(|s| s.tick_value),
            trader: self.session.trader().await,
        };
        size_open_lots(&self.config, source_lots, &inputs)
    }

    fn close_volume(
        &self,
        event: &TradeEvent,
        follower_volume: Option<i64>,
    ) -> Result<i64, ReplicationError> {
        // Proportional close: requires the source close lots, the follower's
        // known volume and a risk mode that decouples volumes from the master.
        if let (Some(close_lots), Some(fv)) = (event.volume, follower_volume) {
            if self.config.risk_mode != RiskMode::SourceVolume {
                if let Some(master_lots) = self.deferred.master_open_lots(event.ticket) {
                    if master_lots > 0.0 {
                        let pct = (close_lots / master_lots).clamp(0.0, 1.0);
                        return Ok((pct * fv as f64).round() as i64);
                    }
                }
            }
        }

        // Native contract size shipped with the event: lots * contract size,
        // scaled by the broker's factor of 100.
        if let (Some(close_lots), Some(contract)) = (event.volume, event.mt5_contract_size) {
            return Ok((close_lots * contract * 100.0).round() as i64);
        }

        // Full close of whatever the follower holds.
        follower_volume.ok_or(ReplicationError::NoCloseVolume(event.ticket))
    }
}
