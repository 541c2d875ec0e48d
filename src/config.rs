//! Meter configuration loaded from environment variables.
//!
//! Values are read through a lookup closure so the same parsing is used for
//! the process environment and for tests.

use crate::error::ConfigError;
use crate::tariff::{TariffConfig, TariffDefaults};
use crate::unit_converter::{DEFAULT_CALORIFIC_VALUE, DEFAULT_COMPRESSIBILITY_FACTOR};
use crate::value_resolver::{ConfiguredValue, HelperLookup};
use chrono::{Local, NaiveDate, Utc};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use std::env;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

pub const DEFAULT_SCAN_INTERVAL_SECS: u64 = 30;
pub const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 10;
pub const DEFAULT_SETTLEMENT_MONTH: u32 = 12;
pub const DEFAULT_DISPLAY_PRECISION: u8 = 2;
pub const METER_INDICES: std::ops::RangeInclusive<u8> = 1..=4;

const DEFAULT_PRICE_KWH: f64 = 0.0;
const DEFAULT_BASE_PRICE_STROM: f64 = 0.0;
const DEFAULT_BASE_PRICE_GAS: f64 = 0.0;
const DEFAULT_MONTHLY_ADVANCE: f64 = 0.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MeterType {
    #[serde(rename = "strom", alias = "electricity")]
    Electricity,
    #[serde(rename = "gas")]
    Gas,
}

impl MeterType {
    /// Identifier used in entity ids
    pub fn slug(self) -> &'static str {
        match self {
            MeterType::Electricity => "strom",
            MeterType::Gas => "gas",
        }
    }

    pub fn display_name(self) -> &'static str {
        match self {
            MeterType::Electricity => "Strom",
            MeterType::Gas => "Gas",
        }
    }

    pub fn default_base_fee(self) -> f64 {
        match self {
            MeterType::Electricity => DEFAULT_BASE_PRICE_STROM,
            MeterType::Gas => DEFAULT_BASE_PRICE_GAS,
        }
    }
}

impl FromStr for MeterType {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "strom" | "electricity" => Ok(MeterType::Electricity),
            "gas" => Ok(MeterType::Gas),
            other => Err(ConfigError::invalid(
                "EMLOG_METER_TYPE",
                format!("unknown meter type '{other}'"),
            )),
        }
    }
}

impl fmt::Display for MeterType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.slug())
    }
}

/// Identity of one meter on one device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MeterId {
    pub meter_type: MeterType,
    pub meter_index: u8,
}

impl fmt::Display for MeterId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}_{}", self.meter_type.slug(), self.meter_index)
    }
}

/// Gas conversion factors, each optionally shadowed by a helper
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GasConfig {
    #[serde(default)]
    pub calorific_value: ConfiguredValue,
    #[serde(default)]
    pub compressibility_factor: ConfiguredValue,
}

impl GasConfig {
    pub fn calorific_value(&self, lookup: &dyn HelperLookup) -> f64 {
        self.calorific_value.resolve(lookup, DEFAULT_CALORIFIC_VALUE)
    }

    pub fn compressibility_factor(&self, lookup: &dyn HelperLookup) -> f64 {
        self.compressibility_factor
            .resolve(lookup, DEFAULT_COMPRESSIBILITY_FACTOR)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct MeterConfig {
    pub host: String,
    pub meter_type: MeterType,
    pub meter_index: u8,
    pub scan_interval: Duration,
    pub request_timeout: Duration,
    /// IANA zone for snapshot timestamps; UTC when unset
    pub time_zone: Option<Tz>,
    pub display_precision: u8,
    pub tariff: TariffConfig,
    pub gas: GasConfig,
}

impl MeterConfig {
    pub fn new(host: &str, meter_type: MeterType, meter_index: u8) -> Self {
        Self {
            host: host.to_string(),
            meter_type,
            meter_index,
            scan_interval: Duration::from_secs(DEFAULT_SCAN_INTERVAL_SECS),
            request_timeout: Duration::from_secs(DEFAULT_REQUEST_TIMEOUT_SECS),
            time_zone: None,
            display_precision: DEFAULT_DISPLAY_PRECISION,
            tariff: TariffConfig {
                defaults: tariff_defaults(meter_type),
                ..TariffConfig::default()
            },
            gas: GasConfig::default(),
        }
    }

    pub fn meter_id(&self) -> MeterId {
        MeterId {
            meter_type: self.meter_type,
            meter_index: self.meter_index,
        }
    }

    /// Calendar date used for tariff selection: the configured zone,
    /// otherwise the local date of the process
    pub fn today(&self) -> NaiveDate {
        match self.time_zone {
            Some(tz) => Utc::now().with_timezone(&tz).date_naive(),
            None => Local::now().date_naive(),
        }
    }

    /// Loads configuration from the process environment
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Loads configuration from any key → value source
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let vars = Vars(lookup);

        let host = vars
            .string("EMLOG_HOST")
            .ok_or_else(|| ConfigError::missing("EMLOG_HOST"))?;
        let meter_type = match vars.string("EMLOG_METER_TYPE") {
            Some(raw) => raw.parse()?,
            None => MeterType::Electricity,
        };
        let meter_index = vars.parsed::<u8>("EMLOG_METER_INDEX")?.unwrap_or(1);

        let mut config = Self::new(&host, meter_type, meter_index);

        if let Some(secs) = vars.parsed::<u64>("EMLOG_SCAN_INTERVAL")? {
            config.scan_interval = Duration::from_secs(secs);
        }
        if let Some(secs) = vars.parsed::<u64>("EMLOG_REQUEST_TIMEOUT")? {
            config.request_timeout = Duration::from_secs(secs);
        }
        if let Some(raw) = vars.string("EMLOG_TIME_ZONE") {
            let tz = raw
                .parse::<Tz>()
                .map_err(|e| ConfigError::invalid("EMLOG_TIME_ZONE", e.to_string()))?;
            config.time_zone = Some(tz);
        }
        if let Some(precision) = vars.parsed::<u8>("EMLOG_DISPLAY_PRECISION")? {
            config.display_precision = precision;
        }

        let tariff = &mut config.tariff;
        tariff.price_per_unit = vars.configured("EMLOG_PRICE_KWH")?;
        tariff.base_fee_per_month = vars.configured("EMLOG_BASE_PRICE")?;
        tariff.change_date = vars.string("EMLOG_PRICE_CHANGE_DATE");
        tariff.new_price_per_unit = vars.configured("EMLOG_PRICE_KWH_NEW")?;
        tariff.new_base_fee_per_month = vars.configured("EMLOG_BASE_PRICE_NEW")?;
        tariff.monthly_advance_payment = vars.configured("EMLOG_MONTHLY_ADVANCE")?;
        if let Some(month) = vars.parsed::<u32>("EMLOG_SETTLEMENT_MONTH")? {
            tariff.settlement_month = month;
        }

        config.gas = GasConfig {
            calorific_value: vars.configured("EMLOG_GAS_BRENNWERT")?,
            compressibility_factor: vars.configured("EMLOG_GAS_ZUSTANDSZAHL")?,
        };

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.host.trim().is_empty() {
            return Err(ConfigError::invalid("EMLOG_HOST", "host cannot be empty"));
        }
        if !METER_INDICES.contains(&self.meter_index) {
            return Err(ConfigError::invalid(
                "EMLOG_METER_INDEX",
                format!(
                    "must be between {} and {}",
                    METER_INDICES.start(),
                    METER_INDICES.end()
                ),
            ));
        }
        if self.scan_interval.is_zero() {
            return Err(ConfigError::invalid(
                "EMLOG_SCAN_INTERVAL",
                "must be greater than 0",
            ));
        }
        if self.request_timeout.is_zero() {
            return Err(ConfigError::invalid(
                "EMLOG_REQUEST_TIMEOUT",
                "must be greater than 0",
            ));
        }
        if !(1..=12).contains(&self.tariff.settlement_month) {
            return Err(ConfigError::invalid(
                "EMLOG_SETTLEMENT_MONTH",
                "must be between 1 and 12",
            ));
        }
        Ok(())
    }
}

fn tariff_defaults(meter_type: MeterType) -> TariffDefaults {
    TariffDefaults {
        price_per_unit: DEFAULT_PRICE_KWH,
        base_fee_per_month: meter_type.default_base_fee(),
        monthly_advance_payment: DEFAULT_MONTHLY_ADVANCE,
    }
}

/// Typed access on top of a raw key lookup. Empty strings count as unset.
struct Vars<F>(F);

impl<F> Vars<F>
where
    F: Fn(&str) -> Option<String>,
{
    fn string(&self, key: &str) -> Option<String> {
        (self.0)(key)
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    }

    fn parsed<T>(&self, key: &str) -> Result<Option<T>, ConfigError>
    where
        T: FromStr,
        T::Err: fmt::Display,
    {
        self.string(key)
            .map(|raw| {
                raw.parse::<T>()
                    .map_err(|e| ConfigError::invalid(key, format!("'{raw}': {e}")))
            })
            .transpose()
    }

    /// `KEY` holds the static value, `KEY_HELPER` the helper entity id
    fn configured(&self, key: &str) -> Result<ConfiguredValue, ConfigError> {
        Ok(ConfiguredValue {
            value: self.parsed::<f64>(key)?,
            helper: self.string(&format!("{key}_HELPER")),
        })
    }
}
