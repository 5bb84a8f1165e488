//! Per-account ticket ↔ broker entity correlation.
//!
//! The only cross-system link is the label `SRC_<ticket>` carried by every
//! order and position the bridge creates. Execution events and reconcile
//! snapshots feed three maps: ticket → position id, ticket → pending order
//! id, position id → current volume. A reconcile snapshot is authoritative
//! at its moment and fully replaces the maps; later execution events
//! override it.

use std::collections::HashMap;

use tokio::sync::RwLock;

use ctrader_client::messages::{ExecutionEvent, OrderSnapshot, PositionSnapshot, ReconcileSnapshot};

pub const LABEL_PREFIX: &str = "SRC_";

pub fn ticket_label(ticket: i64) -> String {
    format!("{}{}", LABEL_PREFIX, ticket)
}

/// Extract the source ticket from a broker-side label, if it is ours.
pub fn parse_ticket_label(label: &str) -> Option<i64> {
    label.strip_prefix(LABEL_PREFIX)?.parse().ok()
}

#[derive(Debug, Default)]
struct CorrelationMaps {
    position_by_ticket: HashMap<i64, i64>,
    order_by_ticket: HashMap<i64, i64>,
    volume_by_position: HashMap<i64, i64>,
}

impl CorrelationMaps {
    fn record_position(&mut self, ticket: i64, position_id: i64, volume: Option<i64>) -> bool {
        let mut learned = false;
        match self.position_by_ticket.get(&ticket) {
            // A position id, once learned, is never reassigned.
            Some(existing) if *existing != position_id => {
                tracing::warn!(
                    "Ticket {} already correlated to position {}, ignoring {}",
                    ticket,
                    existing,
                    position_id
                );
            }
            Some(_) => {}
            None => {
                self.position_by_ticket.insert(ticket, position_id);
                learned = true;
            }
        }
        if let Some(volume) = volume {
            if volume > 0 {
                self.volume_by_position.insert(position_id, volume);
            }
        }
        learned
    }

    fn apply_position(&mut self, position: &PositionSnapshot) -> Option<i64> {
        if position.position_id == 0 {
            return None;
        }
        let ticket = position
            .trade_data
            .label
            .as_deref()
            .and_then(parse_ticket_label)?;
        let volume = position.volume.or(position.trade_data.volume);
        self.record_position(ticket, position.position_id, volume)
            .then_some(ticket)
    }

    fn apply_order(&mut self, order: &OrderSnapshot) -> Option<i64> {
        if order.order_id == 0 {
            return None;
        }
        let ticket = order
            .trade_data
            .label
            .as_deref()
            .and_then(parse_ticket_label)?;
        self.order_by_ticket.insert(ticket, order.order_id);
        // A filled order may already name the position it produced.
        if let Some(position_id) = order.position_id {
            if position_id != 0
                && self.record_position(ticket, position_id, order.trade_data.volume)
            {
                return Some(ticket);
            }
        }
        None
    }
}

#[derive(Debug, Default)]
pub struct CorrelationStore {
    maps: RwLock<CorrelationMaps>,
}

impl CorrelationStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn position_id(&self, ticket: i64) -> Option<i64> {
        self.maps.read().await.position_by_ticket.get(&ticket).copied()
    }

    pub async fn order_id(&self, ticket: i64) -> Option<i64> {
        self.maps.read().await.order_by_ticket.get(&ticket).copied()
    }

    pub async fn position_volume(&self, position_id: i64) -> Option<i64> {
        self.maps
            .read()
            .await
            .volume_by_position
            .get(&position_id)
            .copied()
    }

    /// Live correlated position count, used for the concurrent-position cap.
    pub async fn open_position_count(&self) -> usize {
        self.maps.read().await.position_by_ticket.len()
    }

    /// Fold an execution event in; returns tickets that just gained a
    /// position mapping (triggers for deferred SL/TP flushes).
    pub async fn apply_execution(&self, event: &ExecutionEvent) -> Vec<i64> {
        let mut maps = self.maps.write().await;
        let mut learned = Vec::new();
        if let Some(position) = &event.position {
            if let Some(ticket) = maps.apply_position(position) {
                tracing::info!(
                    "Correlated ticket {} -> position {}",
                    ticket,
                    position.position_id
                );
                learned.push(ticket);
            }
        }
        if let Some(order) = &event.order {
            if let Some(ticket) = maps.apply_order(order) {
                if !learned.contains(&ticket) {
                    learned.push(ticket);
                }
            }
        }
        learned
    }

    /// Replace the maps with a reconcile snapshot; returns every ticket with
    /// a known position so pending SL/TP can be swept.
    pub async fn apply_reconcile(&self, snapshot: &ReconcileSnapshot) -> Vec<i64> {
        let mut fresh = CorrelationMaps::default();
        for position in &snapshot.positions {
            fresh.apply_position(position);
        }
        for order in &snapshot.orders {
            fresh.apply_order(order);
        }
        let tickets: Vec<i64> = fresh.position_by_ticket.keys().copied().collect();
        tracing::info!(
            "Reconcile complete: {} positions, {} pending orders correlated",
            fresh.position_by_ticket.len(),
            fresh.order_by_ticket.len()
        );
        *self.maps.write().await = fresh;
        tickets
    }

    /// Record the new volume after a partial close.
    pub async fn set_position_volume(&self, position_id: i64, volume: i64) {
        let mut maps = self.maps.write().await;
        if volume > 0 {
            maps.volume_by_position.insert(position_id, volume);
        } else {
            maps.volume_by_position.remove(&position_id);
        }
    }

    /// Forget a ticket after a confirmed full close.
    pub async fn remove_ticket(&self, ticket: i64) {
        let mut maps = self.maps.write().await;
        if let Some(position_id) = maps.position_by_ticket.remove(&ticket) {
            maps.volume_by_position.remove(&position_id);
        }
        maps.order_by_ticket.remove(&ticket);
    }

    /// Forget a ticket's pending order after a confirmed cancel.
    pub async fn remove_order(&self, ticket: i64) {
        self.maps.write().await.order_by_ticket.remove(&ticket);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ctrader_client::messages::{ExecutionType, TradeData};

    fn position(position_id: i64, ticket: i64, volume: i64) -> PositionSnapshot {
        PositionSnapshot {
            position_id,
            trade_data: TradeData {
                symbol_id: 1,
                label: Some(ticket_label(ticket)),
                volume: Some(volume),
                side: None,
            },
            volume: Some(volume),
        }
    }

    fn execution(position: PositionSnapshot) -> ExecutionEvent {
        ExecutionEvent {
            execution_type: ExecutionType::Filled,
            order: None,
            position: Some(position),
        }
    }

    #[test]
    fn test_label_roundtrip() {
        assert_eq!(ticket_label(1001), "SRC_1001");
        assert_eq!(parse_ticket_label("SRC_1001"), Some(1001));
        assert_eq!(parse_ticket_label("MT5_1001"), None);
        assert_eq!(parse_ticket_label("SRC_abc"), None);
    }

    #[tokio::test]
    async fn test_execution_event_learns_mapping() {
        let store = CorrelationStore::new();
        let learned = store
            .apply_execution(&execution(position(555, 1001, 1_000_000)))
            .await;
        assert_eq!(learned, vec![1001]);
        assert_eq!(store.position_id(1001).await, Some(555));
        assert_eq!(store.position_volume(555).await, Some(1_000_000));
    }

    #[tokio::test]
    async fn test_position_id_never_reassigned() {
        let store = CorrelationStore::new();
        store
            .apply_execution(&execution(position(555, 1001, 1_000_000)))
            .await;
        let learned = store
            .apply_execution(&execution(position(777, 1001, 2_000_000)))
            .await;
        assert!(learned.is_empty());
        assert_eq!(store.position_id(1001).await, Some(555));
    }

    #[tokio::test]
    async fn test_repeat_event_updates_volume_without_relearning() {
        let store = CorrelationStore::new();
        store
            .apply_execution(&execution(position(555, 1001, 1_000_000)))
            .await;
        let learned = store
            .apply_execution(&execution(position(555, 1001, 500_000)))
            .await;
        assert!(learned.is_empty());
        assert_eq!(store.position_volume(555).await, Some(500_000));
    }

    #[tokio::test]
    async fn test_foreign_labels_ignored() {
        let store = CorrelationStore::new();
        let mut pos = position(555, 1001, 1_000_000);
        pos.trade_data.label = Some("manual trade".to_string());
        let learned = store.apply_execution(&execution(pos)).await;
        assert!(learned.is_empty());
        assert_eq!(store.position_id(1001).await, None);
    }

    #[tokio::test]
    async fn test_order_event_learns_order_id() {
        let store = CorrelationStore::new();
        let event = ExecutionEvent {
            execution_type: ExecutionType::Accepted,
            order: Some(OrderSnapshot {
                order_id: 7001,
                trade_data: TradeData {
                    symbol_id: 27,
                    label: Some(ticket_label(1100)),
                    volume: Some(1000),
                    side: None,
                },
                order_type: None,
                position_id: None,
            }),
            position: None,
        };
        store.apply_execution(&event).await;
        assert_eq!(store.order_id(1100).await, Some(7001));
        assert_eq!(store.position_id(1100).await, None);
    }

    #[tokio::test]
    async fn test_reconcile_replaces_and_is_idempotent() {
        let store = CorrelationStore::new();
        store
            .apply_execution(&execution(position(111, 9, 100_000)))
            .await;

        let snapshot = ReconcileSnapshot {
            positions: vec![position(555, 1001, 1_000_000), position(556, 1002, 2_000_000)],
            orders: Vec::new(),
        };
        let mut tickets = store.apply_reconcile(&snapshot).await;
        tickets.sort_unstable();
        assert_eq!(tickets, vec![1001, 1002]);
        // The stale pre-reconcile mapping is gone.
        assert_eq!(store.position_id(9).await, None);

        // Applying the same snapshot again yields the same state.
        store.apply_reconcile(&snapshot).await;
        assert_eq!(store.position_id(1001).await, Some(555));
        assert_eq!(store.position_id(1002).await, Some(556));
        assert_eq!(store.open_position_count().await, 2);
    }

    #[tokio::test]
    async fn test_remove_ticket_clears_all_maps() {
        let store = CorrelationStore::new();
        store
            .apply_execution(&execution(position(555, 1001, 1_000_000)))
            .await;
        store.remove_ticket(1001).await;
        assert_eq!(store.position_id(1001).await, None);
        assert_eq!(store.position_volume(555).await, None);
        assert_eq!(store.open_position_count().await, 0);
    }
}
