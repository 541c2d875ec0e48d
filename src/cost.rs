//! Cost derivation from period consumption and the effective tariff.
//!
//! All monetary results are rounded to two decimals. Missing inputs produce
//! `None` rather than errors so callers can render a placeholder.

use crate::config::MeterId;
use crate::tariff::{effective_tariff, EffectiveTariff, TariffConfig};
use crate::value_resolver::HelperLookup;
use chrono::NaiveDate;

/// Base fees are monthly; a day is billed as a thirtieth of a month
const DAYS_PER_BILLING_MONTH: f64 = 30.0;
const MONTHS_PER_YEAR: f64 = 12.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Period {
    Day,
    Month,
    Year,
}

impl Period {
    pub const ALL: [Period; 3] = [Period::Day, Period::Month, Period::Year];

    /// Accepts English and the German names used by the accumulator entities.
    /// Anything else is unsupported.
    pub fn parse(name: &str) -> Option<Self> {
        match name.trim().to_ascii_lowercase().as_str() {
            "day" | "daily" | "tag" => Some(Period::Day),
            "month" | "monthly" | "monat" => Some(Period::Month),
            "year" | "yearly" | "jahr" => Some(Period::Year),
            _ => None,
        }
    }

    /// Suffix of the accumulator entity for this period
    pub fn accumulator_suffix(self) -> &'static str {
        match self {
            Period::Day => "tag",
            Period::Month => "monat",
            Period::Year => "jahr",
        }
    }

    fn base_fee_share(self, base_fee_per_month: f64) -> f64 {
        match self {
            Period::Day => base_fee_per_month / DAYS_PER_BILLING_MONTH,
            Period::Month => base_fee_per_month,
            Period::Year => base_fee_per_month * MONTHS_PER_YEAR,
        }
    }
}

/// Rounds to two decimals, exact ties go to the even neighbour
pub fn round2(value: f64) -> f64 {
    (value * 100.0).round_ties_even() / 100.0
}

/// Cost of `consumption` units over `period`
pub fn period_cost(period: Period, consumption: f64, tariff: &EffectiveTariff) -> f64 {
    round2(consumption * tariff.price_per_unit + period.base_fee_share(tariff.base_fee_per_month))
}

/// Same as [`period_cost`] for a period given by name and a consumption that
/// may not be available yet
pub fn period_cost_named(
    period: &str,
    consumption: Option<f64>,
    tariff: &EffectiveTariff,
) -> Option<f64> {
    let period = Period::parse(period)?;
    Some(period_cost(period, consumption?, tariff))
}

/// Yearly sum of advance payments
pub fn advance_total(monthly_advance_payment: f64) -> f64 {
    round2(monthly_advance_payment * MONTHS_PER_YEAR)
}

/// Year cost minus advance payments; needs the already published year cost
pub fn advance_difference(year_cost: Option<f64>, monthly_advance_payment: f64) -> Option<f64> {
    let year_cost = year_cost?;
    Some(round2(year_cost - monthly_advance_payment * MONTHS_PER_YEAR))
}

/// Produces "consumption for period P" for a meter
pub trait ConsumptionSource {
    fn consumption(&self, meter: &MeterId, period: Period) -> Option<f64>;
}

/// Reads period consumption from the accumulator entities
/// (`sensor.emlog_<type>_<index>_verbrauch_<period>_kwh`) through a helper lookup
pub struct HelperConsumption<'a> {
    lookup: &'a dyn HelperLookup,
}

impl<'a> HelperConsumption<'a> {
    pub fn new(lookup: &'a dyn HelperLookup) -> Self {
        Self { lookup }
    }

    pub fn entity_id(meter: &MeterId, period: Period) -> String {
        format!(
            "sensor.emlog_{}_{}_verbrauch_{}_kwh",
            meter.meter_type.slug(),
            meter.meter_index,
            period.accumulator_suffix()
        )
    }
}

impl ConsumptionSource for HelperConsumption<'_> {
    fn consumption(&self, meter: &MeterId, period: Period) -> Option<f64> {
        self.lookup
            .helper_state(&Self::entity_id(meter, period))
            .as_number()
    }
}

/// All monetary figures for one meter at one point in time
#[derive(Debug, Clone, PartialEq)]
pub struct CostReport {
    pub tariff: EffectiveTariff,
    pub day: Option<f64>,
    pub month: Option<f64>,
    pub year: Option<f64>,
    pub advance_total: f64,
    pub advance_difference: Option<f64>,
    pub settlement_month: u32,
}

impl CostReport {
    pub fn compute(
        meter: &MeterId,
        config: &TariffConfig,
        lookup: &dyn HelperLookup,
        consumption: &dyn ConsumptionSource,
        as_of: NaiveDate,
    ) -> Self {
        let tariff = effective_tariff(config, lookup, as_of);
        let cost_for = |period| {
            consumption
                .consumption(meter, period)
                .map(|used| period_cost(period, used, &tariff))
        };

        // The difference depends on the published year figure
        let year = cost_for(Period::Year);
        let monthly_advance = config.monthly_advance(lookup);

        Self {
            tariff,
            day: cost_for(Period::Day),
            month: cost_for(Period::Month),
            year,
            advance_total: advance_total(monthly_advance),
            advance_difference: advance_difference(year, monthly_advance),
            settlement_month: config.settlement_month,
        }
    }

    pub fn cost(&self, period: Period) -> Option<f64> {
        match period {
            Period::Day => self.day,
            Period::Month => self.month,
            Period::Year => self.year,
        }
    }
}
