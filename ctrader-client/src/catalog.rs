//! Per-account symbol catalog.
//!
//! Maps upper-cased instrument names to broker symbol ids and keeps the
//! per-instrument specification used for price rounding and volume
//! quantization. A catalog is rebuilt from scratch on every symbols-list
//! response; it never fabricates ids for unknown names.

use std::collections::HashMap;

use crate::error::ClientError;
use crate::messages::SymbolSpec;

/// Fallback forex convention: 100,000 units per lot, in hundredths of units.
pub const FOREX_LOT_SIZE_CENTS: i64 = 10_000_000;

#[derive(Debug, Clone, Default)]
pub struct SymbolCatalog {
    by_name: HashMap<String, i64>,
    specs: HashMap<i64, SymbolSpec>,
}

impl SymbolCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a catalog from a symbols-list response, replacing everything.
    pub fn from_symbols(symbols: Vec<SymbolSpec>) -> Self {
        let mut catalog = Self::new();
        for spec in symbols {
            if spec.id == 0 || spec.name.is_empty() {
                continue;
            }
            catalog.by_name.insert(spec.name.to_uppercase(), spec.id);
            catalog.specs.insert(spec.id, spec);
        }
        catalog
    }

    pub fn len(&self) -> usize {
        self.by_name.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_name.is_empty()
    }

    /// Look up a broker symbol id by name (upper-cased).
    pub fn symbol_id(&self, name: &str) -> Option<i64> {
        self.by_name.get(&name.to_uppercase()).copied()
    }

    pub fn spec(&self, symbol_id: i64) -> Option<&SymbolSpec> {
        self.specs.get(&symbol_id)
    }

    /// Round a price to the instrument's digits, half-up away from zero.
    /// Pass-through when digits are unknown.
    pub fn round_price(&self, symbol_id: i64, price: f64) -> f64 {
        match self.spec(symbol_id).and_then(|s| s.digits) {
            Some(digits) => round_to_digits(price, digits),
            None => price,
        }
    }

    /// Clamp a volume to the instrument's `[min, max]` and snap it onto the
    /// step grid anchored at `min`. Pass-through when min/step are unknown.
    pub fn snap_volume(&self, symbol_id: i64, units: i64) -> i64 {
        let Some(spec) = self.spec(symbol_id) else {
            return units;
        };
        let (Some(min), Some(step)) = (spec.min_volume, spec.step_volume) else {
            return units;
        };
        if min <= 0 || step <= 0 {
            return units;
        }

        let mut v = units.max(min);
        if let Some(max) = spec.max_volume {
            if max >= min {
                v = v.min(max);
            }
        }

        let steps = ((v - min) as f64 / step as f64).round() as i64;
        v = min + steps * step;
        v.max(min)
    }

    /// Convert source lots to the instrument's native volume unit:
    /// `round(lots * lot_size)`, then snapped to the volume grid.
    ///
    /// When the instrument does not report a lot size, the forex convention
    /// (100,000 units/lot) is used only if `assume_forex` was opted into;
    /// otherwise the conversion refuses so the caller can abort replication.
    pub fn lots_to_units(
        &self,
        symbol_id: i64,
        lots: f64,
        assume_forex: bool,
    ) -> Result<i64, ClientError> {
        let lot_size = match self.spec(symbol_id).and_then(|s| s.lot_size) {
            Some(ls) if ls > 0 => ls,
            _ if assume_forex => FOREX_LOT_SIZE_CENTS,
            _ => {
                return Err(ClientError::VolumeConversion(format!(
                    "symbol {} has no lot size and forex fallback is disabled",
                    symbol_id
                )))
            }
        };

        let raw = (lots * lot_size as f64).round() as i64;
        if raw <= 0 {
            return Err(ClientError::VolumeConversion(format!(
                "{} lots of symbol {} quantizes to zero volume",
                lots, symbol_id
            )));
        }
        Ok(self.snap_volume(symbol_id, raw))
    }

    /// Smallest price increment for risk estimation: `10^-pip_position`,
    /// falling back to `10^-digits`.
    pub fn tick_size(&self, symbol_id: i64) -> Option<f64> {
        let spec = self.spec(symbol_id)?;
        if let Some(pip) = spec.pip_position {
            return Some(10f64.powi(-pip));
        }
        spec.digits.map(|d| 10f64.powi(-(d as i32)))
    }
}

/// Round half-up, away from zero, to the given number of decimal digits.
pub fn round_to_digits(price: f64, digits: u32) -> f64 {
    let factor = 10f64.powi(digits as i32);
    (price * factor).round() / factor
}
