//! Per-meter sensor values derived from the latest snapshot.

use crate::config::{MeterConfig, MeterId, MeterType};
use crate::snapshot::{ApiStatus, MeterSnapshot};
use crate::tariff::effective_tariff;
use crate::unit_converter::gas_energy_equivalent;
use crate::value_resolver::HelperLookup;
use chrono::{DateTime, FixedOffset, NaiveDate};
use std::fmt;

pub const STATUS_INITIALIZING: &str = "Initializing...";
pub const NO_ERRORS: &str = "No errors";
const UNKNOWN_PRODUCT: &str = "Unknown";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SensorKind {
    Product,
    Version,
    MeterReadingKwh,
    MeterReadingM3,
    ActivePower,
    ConsumptionToday,
    AmountToday,
    Price,
    CalorificValue,
    CompressibilityFactor,
    ApiStatus,
    LastError,
    LastUpdate,
}

const ELECTRICITY_SENSORS: [SensorKind; 10] = [
    SensorKind::Product,
    SensorKind::Version,
    SensorKind::MeterReadingKwh,
    SensorKind::ActivePower,
    SensorKind::ConsumptionToday,
    SensorKind::AmountToday,
    SensorKind::Price,
    SensorKind::ApiStatus,
    SensorKind::LastError,
    SensorKind::LastUpdate,
];

const GAS_SENSORS: [SensorKind; 13] = [
    SensorKind::Product,
    SensorKind::Version,
    SensorKind::MeterReadingM3,
    SensorKind::MeterReadingKwh,
    SensorKind::ActivePower,
    SensorKind::ConsumptionToday,
    SensorKind::AmountToday,
    SensorKind::Price,
    SensorKind::CalorificValue,
    SensorKind::CompressibilityFactor,
    SensorKind::ApiStatus,
    SensorKind::LastError,
    SensorKind::LastUpdate,
];

impl SensorKind {
    /// Sensors exposed for a meter type, in display order
    pub fn for_meter(meter_type: MeterType) -> &'static [SensorKind] {
        match meter_type {
            MeterType::Electricity => &ELECTRICITY_SENSORS,
            MeterType::Gas => &GAS_SENSORS,
        }
    }

    pub fn key(self) -> &'static str {
        match self {
            SensorKind::Product => "product",
            SensorKind::Version => "version",
            SensorKind::MeterReadingKwh => "zaehlerstand_kwh",
            SensorKind::MeterReadingM3 => "zaehlerstand_m3",
            SensorKind::ActivePower => "wirkleistung_w",
            SensorKind::ConsumptionToday => "verbrauch_tag_kwh",
            SensorKind::AmountToday => "betrag_tag_eur",
            SensorKind::Price => "preis_eur_kwh",
            SensorKind::CalorificValue => "gas_brennwert",
            SensorKind::CompressibilityFactor => "gas_zustandszahl",
            SensorKind::ApiStatus => "api_status",
            SensorKind::LastError => "last_error",
            SensorKind::LastUpdate => "last_update",
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            SensorKind::Product => "Product",
            SensorKind::Version => "Software version",
            SensorKind::MeterReadingKwh => "Meter reading (kWh)",
            SensorKind::MeterReadingM3 => "Meter reading (m³)",
            SensorKind::ActivePower => "Active power (W)",
            SensorKind::ConsumptionToday => "Consumption today (kWh)",
            SensorKind::AmountToday => "Amount today",
            SensorKind::Price => "Price (kWh)",
            SensorKind::CalorificValue => "Calorific value",
            SensorKind::CompressibilityFactor => "Compressibility factor",
            SensorKind::ApiStatus => "API status",
            SensorKind::LastError => "Last error",
            SensorKind::LastUpdate => "Last update",
        }
    }

    pub fn entity_id(self, meter: &MeterId) -> String {
        format!("sensor.emlog_{}_{}", meter, self.key())
    }

    /// Monetary units follow the device currency
    pub fn unit(self, currency: &str) -> Option<String> {
        match self {
            SensorKind::MeterReadingKwh | SensorKind::ConsumptionToday => Some("kWh".to_string()),
            SensorKind::MeterReadingM3 => Some("m³".to_string()),
            SensorKind::ActivePower => Some("W".to_string()),
            SensorKind::AmountToday => Some(currency.to_string()),
            SensorKind::Price => Some(format!("{currency}/kWh")),
            _ => None,
        }
    }

    /// Diagnostic sensors have a value even before the first snapshot
    pub fn is_diagnostic(self) -> bool {
        matches!(
            self,
            SensorKind::ApiStatus | SensorKind::LastError | SensorKind::LastUpdate
        )
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum SensorValue {
    Text(String),
    Number(f64),
    Timestamp(DateTime<FixedOffset>),
}

impl SensorValue {
    pub fn as_number(&self) -> Option<f64> {
        match self {
            SensorValue::Number(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            SensorValue::Text(s) => Some(s),
            _ => None,
        }
    }

    /// Renders numbers with `precision` decimals, timestamps as RFC 3339
    pub fn format(&self, precision: u8) -> String {
        match self {
            SensorValue::Text(s) => s.clone(),
            SensorValue::Number(n) => format!("{:.*}", precision as usize, n),
            SensorValue::Timestamp(t) => t.to_rfc3339(),
        }
    }
}

/// Everything besides the snapshot that sensor values depend on
pub struct SensorContext<'a> {
    pub config: &'a MeterConfig,
    pub lookup: &'a dyn HelperLookup,
    pub as_of: NaiveDate,
}

impl SensorContext<'_> {
    fn calorific_value(&self) -> f64 {
        self.config.gas.calorific_value(self.lookup)
    }

    fn compressibility_factor(&self) -> f64 {
        self.config.gas.compressibility_factor(self.lookup)
    }
}

pub fn sensor_value(
    kind: SensorKind,
    snapshot: Option<&MeterSnapshot>,
    ctx: &SensorContext<'_>,
) -> Option<SensorValue> {
    match kind {
        SensorKind::ApiStatus => {
            let text = match snapshot.map(MeterSnapshot::status) {
                None | Some(ApiStatus::Initializing) => STATUS_INITIALIZING,
                Some(ApiStatus::Connected) => "Connected",
                Some(ApiStatus::Failed) => "Failed",
            };
            return Some(SensorValue::Text(text.to_string()));
        }
        SensorKind::LastError => {
            let text = match snapshot {
                None => STATUS_INITIALIZING,
                Some(s) => s.last_error().unwrap_or(NO_ERRORS),
            };
            return Some(SensorValue::Text(text.to_string()));
        }
        SensorKind::LastUpdate => {
            return snapshot?
                .last_successful_update()
                .map(SensorValue::Timestamp);
        }
        _ => {}
    }

    let snapshot = snapshot.filter(|s| s.has_data())?;
    // Missing device fields read as zero
    let number = |value: Option<f64>| SensorValue::Number(value.unwrap_or(0.0));

    let value = match kind {
        SensorKind::Product => {
            SensorValue::Text(snapshot.product().unwrap_or(UNKNOWN_PRODUCT).to_string())
        }
        SensorKind::Version => number(snapshot.version()),
        SensorKind::MeterReadingKwh => {
            let reading = snapshot.meter_reading().unwrap_or(0.0);
            match ctx.config.meter_type {
                MeterType::Electricity => SensorValue::Number(reading),
                MeterType::Gas => SensorValue::Number(gas_energy_equivalent(
                    reading,
                    ctx.calorific_value(),
                    ctx.compressibility_factor(),
                )),
            }
        }
        SensorKind::MeterReadingM3 => number(snapshot.meter_reading()),
        SensorKind::ActivePower => number(snapshot.active_power()),
        SensorKind::ConsumptionToday => number(snapshot.energy_today()),
        SensorKind::AmountToday => number(snapshot.amount_today()),
        SensorKind::Price => SensorValue::Number(
            effective_tariff(&ctx.config.tariff, ctx.lookup, ctx.as_of).price_per_unit,
        ),
        SensorKind::CalorificValue => SensorValue::Number(ctx.calorific_value()),
        SensorKind::CompressibilityFactor => SensorValue::Number(ctx.compressibility_factor()),
        SensorKind::ApiStatus | SensorKind::LastError | SensorKind::LastUpdate => return None,
    };
    Some(value)
}

/// One rendered sensor
#[derive(Debug, Clone, PartialEq)]
pub struct SensorReading {
    pub kind: SensorKind,
    pub entity_id: String,
    pub value: Option<SensorValue>,
    pub unit: Option<String>,
}

impl SensorReading {
    pub fn display(&self, precision: u8) -> String {
        let value = self
            .value
            .as_ref()
            .map(|v| v.format(precision))
            .unwrap_or_else(|| "unavailable".to_string());
        match &self.unit {
            Some(unit) if self.value.is_some() => format!("{value} {unit}"),
            _ => value,
        }
    }
}

impl fmt::Display for SensorReading {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind.name(), self.display(2))
    }
}

/// Evaluates every sensor of the configured meter
pub fn read_all(snapshot: Option<&MeterSnapshot>, ctx: &SensorContext<'_>) -> Vec<SensorReading> {
    let meter = ctx.config.meter_id();
    let currency = snapshot
        .map(MeterSnapshot::currency)
        .unwrap_or(crate::snapshot::DEFAULT_CURRENCY);
    SensorKind::for_meter(ctx.config.meter_type)
        .iter()
        .map(|kind| SensorReading {
            kind: *kind,
            entity_id: kind.entity_id(&meter),
            value: sensor_value(*kind, snapshot, ctx),
            unit: kind.unit(currency),
        })
        .collect()
}
