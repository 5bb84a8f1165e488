//! Risk-based lot sizing for replicated opens.
//!
//! `SOURCE_VOLUME` scales the source lots; `FIXED_LOT` ignores them;
//! `FIXED_USD` and `PERCENT_EQUITY` derive lots from a money risk budget and
//! the instrument's per-lot risk at the stop distance. Instrument min/step
//! clamping happens later at volume quantization.

use thiserror::Error;

use ctrader_client::messages::TraderSnapshot;

use crate::config::{AccountConfig, RiskMode, RiskReference};

#[derive(Debug, Error, PartialEq)]
pub enum SizingError {
    #[error("stop loss required by risk mode is missing")]
    MissingStopLoss,
    #[error("no entry price available for risk sizing")]
    MissingEntryPrice,
    #[error("instrument reports no tick size/value for risk sizing")]
    MissingInstrumentRisk,
    #[error("no trader snapshot available for equity reference")]
    MissingTraderSnapshot,
    #[error("risk computation produced a non-positive figure")]
    NonPositiveRisk,
    #[error("risk mode not configured: {0}")]
    NotConfigured(&'static str),
}

/// Instrument and account state needed by the risk-based modes.
#[derive(Debug, Clone, Default)]
pub struct SizingInputs {
    /// Stop loss, already filtered (None when the source sent 0).
    pub stop_loss: Option<f64>,
    /// Entry estimate: event price, or last spot when the event had none.
    pub entry_price: Option<f64>,
    pub tick_size: Option<f64>,
    pub tick_value: Option<f64>,
    pub trader: Option<TraderSnapshot>,
}

/// Compute the lots to open on this account for `source_lots`.
pub fn size_open_lots(
    config: &AccountConfig,
    source_lots: f64,
    inputs: &SizingInputs,
) -> Result<f64, SizingError> {
    match config.risk_mode {
        RiskMode::SourceVolume => Ok(source_scaled(config, source_lots)),
        RiskMode::FixedLot => {
            if config.fixed_lot > 0.0 {
                Ok(config.fixed_lot)
            } else {
                Err(SizingError::NotConfigured("fixed_lot"))
            }
        }
        RiskMode::FixedUsd => {
            if config.fixed_usd_risk <= 0.0 {
                return Err(SizingError::NotConfigured("fixed_usd_risk"));
            }
            risk_sized(config, source_lots, inputs, config.fixed_usd_risk)
        }
        RiskMode::PercentEquity => {
            if config.risk_percent <= 0.0 {
                return Err(SizingError::NotConfigured("risk_percent"));
            }
            let trader = inputs
                .trader
                .as_ref()
                .ok_or(SizingError::MissingTraderSnapshot)?;
            let reference_cents = match config.risk_reference {
                RiskReference::Equity => trader.equity_cents,
                RiskReference::Balance => trader.balance_cents,
            };
            let usd_risk = reference_cents as f64 / 100.0 * config.risk_percent / 100.0;
            risk_sized(config, source_lots, inputs, usd_risk)
        }
    }
}

fn source_scaled(config: &AccountConfig, source_lots: f64) -> f64 {
    (source_lots * config.lot_multiplier).clamp(config.min_lot_size, config.max_lot_size)
}

fn risk_sized(
    config: &AccountConfig,
    source_lots: f64,
    inputs: &SizingInputs,
    usd_risk: f64,
) -> Result<f64, SizingError> {
    let Some(stop_loss) = inputs.stop_loss else {
        if config.reject_if_no_sl {
            return Err(SizingError::MissingStopLoss);
        }
        if config.source_volume_fallback {
            return Ok(source_scaled(config, source_lots));
        }
        return Err(SizingError::MissingStopLoss);
    };

    let entry = inputs.entry_price.ok_or(SizingError::MissingEntryPrice)?;
    let tick_size = inputs.tick_size.ok_or(SizingError::MissingInstrumentRisk)?;
    let tick_value = inputs.tick_value.ok_or(SizingError::MissingInstrumentRisk)?;

    let distance = (entry - stop_loss).abs();
    if distance <= 0.0 || tick_size <= 0.0 || tick_value <= 0.0 || usd_risk <= 0.0 {
        return Err(SizingError::NonPositiveRisk);
    }

    let per_lot_risk = distance / tick_size * tick_value;
    if per_lot_risk <= 0.0 {
        return Err(SizingError::NonPositiveRisk);
    }

    Ok(usd_risk / per_lot_risk)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn account(mode: RiskMode) -> AccountConfig {
        let mut config = AccountConfig::named("alpha");
        config.risk_mode = mode;
        config
    }

    fn risk_inputs() -> SizingInputs {
        SizingInputs {
            stop_loss: Some(1.0700),
            entry_price: Some(1.0800),
            // One pip worth $10/lot: 100 pips distance -> $1000 risk per lot.
            tick_size: Some(1e-4),
            tick_value: Some(10.0),
            trader: Some(TraderSnapshot {
                balance_cents: 2_000_000,
                equity_cents: 1_000_000,
            }),
        }
    }

    // =========================================================================
    // SOURCE_VOLUME
    // =========================================================================

    #[test]
    fn test_source_volume_applies_multiplier_and_clamps() {
        let mut config = account(RiskMode::SourceVolume);
        config.lot_multiplier = 2.0;
        config.max_lot_size = 0.15;
        let lots = size_open_lots(&config, 0.10, &SizingInputs::default()).unwrap();
        assert_eq!(lots, 0.15);
    }

    #[test]
    fn test_source_volume_clamps_to_min() {
        let mut config = account(RiskMode::SourceVolume);
        config.min_lot_size = 0.05;
        let lots = size_open_lots(&config, 0.01, &SizingInputs::default()).unwrap();
        assert_eq!(lots, 0.05);
    }

    // =========================================================================
    // FIXED_LOT
    // =========================================================================

    #[test]
    fn test_fixed_lot_ignores_source_volume() {
        let mut config = account(RiskMode::FixedLot);
        config.fixed_lot = 0.25;
        assert_eq!(size_open_lots(&config, 5.0, &SizingInputs::default()).unwrap(), 0.25);
        assert_eq!(size_open_lots(&config, 0.01, &SizingInputs::default()).unwrap(), 0.25);
    }

    #[test]
    fn test_fixed_lot_requires_configuration() {
        let config = account(RiskMode::FixedLot);
        assert_eq!(
            size_open_lots(&config, 0.10, &SizingInputs::default()),
            Err(SizingError::NotConfigured("fixed_lot"))
        );
    }

    // =========================================================================
    // FIXED_USD
    // =========================================================================

    #[test]
    fn test_fixed_usd_sizes_from_stop_distance() {
        let mut config = account(RiskMode::FixedUsd);
        config.fixed_usd_risk = 100.0;
        // Per-lot risk = 0.01 / 1e-4 * 10 = $1000 -> 0.1 lots for $100.
        let lots = size_open_lots(&config, 0.50, &risk_inputs()).unwrap();
        assert!((lots - 0.1).abs() < 1e-9);
    }

    #[test]
    fn test_fixed_usd_rejects_missing_sl() {
        let mut config = account(RiskMode::FixedUsd);
        config.fixed_usd_risk = 100.0;
        config.reject_if_no_sl = true;
        let mut inputs = risk_inputs();
        inputs.stop_loss = None;
        assert_eq!(
            size_open_lots(&config, 0.10, &inputs),
            Err(SizingError::MissingStopLoss)
        );
    }

    #[test]
    fn test_fixed_usd_falls_back_to_source_volume() {
        let mut config = account(RiskMode::FixedUsd);
        config.fixed_usd_risk = 100.0;
        config.reject_if_no_sl = false;
        config.source_volume_fallback = true;
        config.lot_multiplier = 3.0;
        let mut inputs = risk_inputs();
        inputs.stop_loss = None;
        let lots = size_open_lots(&config, 0.10, &inputs).unwrap();
        assert!((lots - 0.30).abs() < 1e-9);
    }

    #[test]
    fn test_fixed_usd_without_fallback_rejects() {
        let mut config = account(RiskMode::FixedUsd);
        config.fixed_usd_risk = 100.0;
        config.source_volume_fallback = false;
        let mut inputs = risk_inputs();
        inputs.stop_loss = None;
        assert_eq!(
            size_open_lots(&config, 0.10, &inputs),
            Err(SizingError::MissingStopLoss)
        );
    }

    #[test]
    fn test_fixed_usd_requires_entry_price() {
        let mut config = account(RiskMode::FixedUsd);
        config.fixed_usd_risk = 100.0;
        let mut inputs = risk_inputs();
        inputs.entry_price = None;
        assert_eq!(
            size_open_lots(&config, 0.10, &inputs),
            Err(SizingError::MissingEntryPrice)
        );
    }

    #[test]
    fn test_fixed_usd_requires_instrument_risk() {
        let mut config = account(RiskMode::FixedUsd);
        config.fixed_usd_risk = 100.0;
        let mut inputs = risk_inputs();
        inputs.tick_value = None;
        assert_eq!(
            size_open_lots(&config, 0.10, &inputs),
            Err(SizingError::MissingInstrumentRisk)
        );
    }

    // =========================================================================
    // PERCENT_EQUITY
    // =========================================================================

    #[test]
    fn test_percent_equity_uses_equity_reference() {
        let mut config = account(RiskMode::PercentEquity);
        config.risk_percent = 1.0;
        // Equity $10,000; 1% = $100 -> 0.1 lots at $1000/lot risk.
        let lots = size_open_lots(&config, 0.50, &risk_inputs()).unwrap();
        assert!((lots - 0.1).abs() < 1e-9);
    }

    #[test]
    fn test_percent_equity_balance_reference() {
        let mut config = account(RiskMode::PercentEquity);
        config.risk_percent = 1.0;
        config.risk_reference = RiskReference::Balance;
        // Balance $20,000; 1% = $200 -> 0.2 lots.
        let lots = size_open_lots(&config, 0.50, &risk_inputs()).unwrap();
        assert!((lots - 0.2).abs() < 1e-9);
    }

    #[test]
    fn test_percent_equity_requires_trader_snapshot() {
        let mut config = account(RiskMode::PercentEquity);
        config.risk_percent = 1.0;
        let mut inputs = risk_inputs();
        inputs.trader = None;
        assert_eq!(
            size_open_lots(&config, 0.10, &inputs),
            Err(SizingError::MissingTraderSnapshot)
        );
    }

    #[test]
    fn test_zero_stop_distance_rejected() {
        let mut config = account(RiskMode::FixedUsd);
        config.fixed_usd_risk = 100.0;
        let mut inputs = risk_inputs();
        inputs.stop_loss = inputs.entry_price;
        assert_eq!(
            size_open_lots(&config, 0.10, &inputs),
            Err(SizingError::NonPositiveRisk)
        );
    }
}
