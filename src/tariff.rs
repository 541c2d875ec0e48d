//! Tariff selection with a single scheduled tariff change.
//!
//! A meter carries its current price and base fee plus an optional "new" pair
//! that takes over on the change date. Each value is resolved independently
//! through the helper → static → default chain.

use crate::value_resolver::{ConfiguredValue, HelperLookup};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Format of the tariff change date
pub const CHANGE_DATE_FORMAT: &str = "%Y-%m-%d";

/// The new tariff has no implicit continuation of the old defaults
const NEW_TARIFF_DEFAULT: f64 = 0.0;

/// Fallbacks used when neither helper nor static value is available
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TariffDefaults {
    pub price_per_unit: f64,
    pub base_fee_per_month: f64,
    pub monthly_advance_payment: f64,
}

impl Default for TariffDefaults {
    fn default() -> Self {
        Self {
            price_per_unit: 0.0,
            base_fee_per_month: 0.0,
            monthly_advance_payment: 0.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TariffConfig {
    #[serde(default)]
    pub price_per_unit: ConfiguredValue,
    #[serde(default)]
    pub base_fee_per_month: ConfiguredValue,
    /// `YYYY-MM-DD`; anything unparseable means no change is scheduled
    #[serde(default)]
    pub change_date: Option<String>,
    #[serde(default)]
    pub new_price_per_unit: ConfiguredValue,
    #[serde(default)]
    pub new_base_fee_per_month: ConfiguredValue,
    #[serde(default)]
    pub monthly_advance_payment: ConfiguredValue,
    #[serde(default = "default_settlement_month")]
    pub settlement_month: u32,
    #[serde(default)]
    pub defaults: TariffDefaults,
}

fn default_settlement_month() -> u32 {
    12
}

impl Default for TariffConfig {
    fn default() -> Self {
        Self {
            price_per_unit: ConfiguredValue::default(),
            base_fee_per_month: ConfiguredValue::default(),
            change_date: None,
            new_price_per_unit: ConfiguredValue::default(),
            new_base_fee_per_month: ConfiguredValue::default(),
            monthly_advance_payment: ConfiguredValue::default(),
            settlement_month: default_settlement_month(),
            defaults: TariffDefaults::default(),
        }
    }
}

/// Which half of the configuration produced an [`EffectiveTariff`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TariffPhase {
    Current,
    New,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EffectiveTariff {
    pub price_per_unit: f64,
    pub base_fee_per_month: f64,
    pub phase: TariffPhase,
}

impl TariffConfig {
    /// Parsed change date, `None` when unset or malformed
    pub fn change_date(&self) -> Option<NaiveDate> {
        let raw = self.change_date.as_deref()?.trim();
        if raw.is_empty() {
            return None;
        }
        match NaiveDate::parse_from_str(raw, CHANGE_DATE_FORMAT) {
            Ok(date) => Some(date),
            Err(e) => {
                debug!("Ignoring malformed tariff change date '{raw}': {e}");
                None
            }
        }
    }

    /// Monthly advance payment after helper/static/default resolution
    pub fn monthly_advance(&self, lookup: &dyn HelperLookup) -> f64 {
        self.monthly_advance_payment
            .resolve(lookup, self.defaults.monthly_advance_payment)
    }
}

/// Returns the tariff in force on `as_of`. The change applies from the change
/// date itself onwards.
pub fn effective_tariff(
    config: &TariffConfig,
    lookup: &dyn HelperLookup,
    as_of: NaiveDate,
) -> EffectiveTariff {
    match config.change_date() {
        Some(change_date) if as_of >= change_date => EffectiveTariff {
            price_per_unit: config
                .new_price_per_unit
                .resolve(lookup, NEW_TARIFF_DEFAULT),
            base_fee_per_month: config
                .new_base_fee_per_month
                .resolve(lookup, NEW_TARIFF_DEFAULT),
            phase: TariffPhase::New,
        },
        _ => EffectiveTariff {
            price_per_unit: config
                .price_per_unit
                .resolve(lookup, config.defaults.price_per_unit),
            base_fee_per_month: config
                .base_fee_per_month
                .resolve(lookup, config.defaults.base_fee_per_month),
            phase: TariffPhase::Current,
        },
    }
}
