//! Process-wide deferred actions.
//!
//! A freshly opened position has no broker id yet, and market creations may
//! reject absolute SL/TP outright, so opens go out bare and the desired
//! SL/TP waits here keyed by (account, ticket). Claiming an entry removes it
//! before the amend is issued, which makes the apply at-most-once per
//! (account, ticket, payload) even when the amend fails.
//!
//! The store also keeps the master's original open lots per ticket so a later
//! partial close can be translated into a proportion.

use std::collections::HashMap;
use std::sync::Mutex;

#[derive(Debug, Clone, PartialEq)]
pub struct PendingSltp {
    pub symbol: String,
    pub sl: f64,
    pub tp: f64,
}

impl PendingSltp {
    pub fn is_empty(&self) -> bool {
        self.sl <= 0.0 && self.tp <= 0.0
    }
}

#[derive(Debug, Default)]
pub struct DeferredStore {
    pending_sltp: Mutex<HashMap<(String, i64), PendingSltp>>,
    master_open_lots: Mutex<HashMap<i64, f64>>,
}

impl DeferredStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stage the desired SL/TP for an account/ticket. Re-staging the same
    /// payload is a no-op so a duplicate MODIFY cannot re-arm an applied
    /// entry.
    pub fn stage_sltp(&self, account: &str, ticket: i64, payload: PendingSltp) {
        let mut pending = self.pending_sltp.lock().unwrap();
        let key = (account.to_string(), ticket);
        match pending.get(&key) {
            Some(existing) if *existing == payload => {}
            _ => {
                pending.insert(key, payload);
            }
        }
    }

    /// Take the staged SL/TP for an account/ticket, removing it.
    pub fn claim_sltp(&self, account: &str, ticket: i64) -> Option<PendingSltp> {
        self.pending_sltp
            .lock()
            .unwrap()
            .remove(&(account.to_string(), ticket))
    }

    pub fn has_pending_sltp(&self, account: &str, ticket: i64) -> bool {
        self.pending_sltp
            .lock()
            .unwrap()
            .contains_key(&(account.to_string(), ticket))
    }

    /// Drop every account's staged SL/TP for a ticket (CLOSE arrived).
    pub fn discard_sltp(&self, ticket: i64) {
        self.pending_sltp
            .lock()
            .unwrap()
            .retain(|(_, t), _| *t != ticket);
    }

    pub fn record_open_lots(&self, ticket: i64, lots: f64) {
        if lots > 0.0 {
            self.master_open_lots.lock().unwrap().insert(ticket, lots);
        }
    }

    pub fn master_open_lots(&self, ticket: i64) -> Option<f64> {
        self.master_open_lots.lock().unwrap().get(&ticket).copied()
    }

    /// Full close: forget both the staged SL/TP and the master lots.
    pub fn remove_ticket(&self, ticket: i64) {
        self.discard_sltp(ticket);
        self.master_open_lots.lock().unwrap().remove(&ticket);
    }
}
