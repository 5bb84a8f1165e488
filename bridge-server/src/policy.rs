//! Per-account filter policy for OPEN/PENDING_OPEN events.
//!
//! Checks run in a fixed order: daily trade cap, concurrent position cap,
//! magic-number allowlist, blocked symbols, allowed symbols, minimum lot.
//! Rejections are reported once and never retried.

use chrono::{NaiveDate, Utc};
use thiserror::Error;

use crate::config::AccountConfig;

#[derive(Debug, Error, PartialEq)]
pub enum PolicyRejection {
    #[error("daily trade cap of {0} reached")]
    DailyCapReached(u32),
    #[error("concurrent position cap of {0} reached")]
    ConcurrentCapReached(u32),
    #[error("magic number {0} not in allowed list")]
    MagicNotAllowed(i64),
    #[error("symbol {0} is blocked")]
    SymbolBlocked(String),
    #[error("symbol {0} not in allowed list")]
    SymbolNotAllowed(String),
    #[error("lot size {lots} below minimum {min}")]
    BelowMinLot { lots: f64, min: f64 },
}

/// Daily trade counter; the day rolls over at UTC midnight.
#[derive(Debug, Clone)]
pub struct TradeCounters {
    day: NaiveDate,
    trades_today: u32,
}

impl TradeCounters {
    pub fn new() -> Self {
        Self {
            day: Utc::now().date_naive(),
            trades_today: 0,
        }
    }

    fn roll_day(&mut self) {
        let today = Utc::now().date_naive();
        if self.day != today {
            self.day = today;
            self.trades_today = 0;
        }
    }

    pub fn trades_today(&mut self) -> u32 {
        self.roll_day();
        self.trades_today
    }

    /// Record one executed trade for the cap.
    pub fn record_trade(&mut self) {
        self.roll_day();
        self.trades_today += 1;
    }
}

impl Default for TradeCounters {
    fn default() -> Self {
        Self::new()
    }
}

/// Evaluate the open filters; `open_positions` is the account's live
/// correlated position count.
pub fn check_open(
    config: &AccountConfig,
    counters: &mut TradeCounters,
    open_positions: usize,
    symbol: &str,
    magic: i64,
    lots: f64,
) -> Result<(), PolicyRejection> {
    if config.max_daily_trades > 0 && counters.trades_today() >= config.max_daily_trades {
        return Err(PolicyRejection::DailyCapReached(config.max_daily_trades));
    }

    if config.max_concurrent_positions > 0
        && open_positions >= config.max_concurrent_positions as usize
    {
        return Err(PolicyRejection::ConcurrentCapReached(
            config.max_concurrent_positions,
        ));
    }

    if let Some(allowed) = &config.magic_numbers {
        if !allowed.is_empty() && !allowed.contains(&magic) {
            return Err(PolicyRejection::MagicNotAllowed(magic));
        }
    }

    let symbol_upper = symbol.to_uppercase();
    if config
        .blocked_symbols
        .iter()
        .any(|s| s.eq_ignore_ascii_case(&symbol_upper))
    {
        return Err(PolicyRejection::SymbolBlocked(symbol_upper));
    }

    if let Some(allowed) = &config.allowed_symbols {
        if !allowed.is_empty()
            && !allowed.iter().any(|s| s.eq_ignore_ascii_case(&symbol_upper))
        {
            return Err(PolicyRejection::SymbolNotAllowed(symbol_upper));
        }
    }

    if lots < config.min_lot_size {
        return Err(PolicyRejection::BelowMinLot {
            lots,
            min: config.min_lot_size,
        });
    }

    Ok(())
}
