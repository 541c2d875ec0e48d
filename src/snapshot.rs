//! Immutable result of one poll cycle.

use chrono::{DateTime, FixedOffset};
use serde::Serialize;
use serde_json::{Map, Value};

/// Longest error message kept on a snapshot
pub const MAX_ERROR_LENGTH: usize = 200;
pub const DEFAULT_CURRENCY: &str = "EUR";

/// Raw export payload, passed through untouched
pub type RawFields = Map<String, Value>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ApiStatus {
    Initializing,
    Connected,
    Failed,
}

impl ApiStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            ApiStatus::Initializing => "initializing",
            ApiStatus::Connected => "connected",
            ApiStatus::Failed => "failed",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MeterSnapshot {
    raw_fields: RawFields,
    status: ApiStatus,
    last_error: Option<String>,
    last_successful_update: Option<DateTime<FixedOffset>>,
    currency: String,
}

impl MeterSnapshot {
    /// Snapshot for a successful fetch
    pub fn connected(raw_fields: RawFields, now: DateTime<FixedOffset>) -> Self {
        let currency = extract_currency(&raw_fields);
        Self {
            raw_fields,
            status: ApiStatus::Connected,
            last_error: None,
            last_successful_update: Some(now),
            currency,
        }
    }

    /// Snapshot for a failed fetch. Data, timestamp and currency of `previous`
    /// are carried forward.
    pub fn failed(previous: Option<&MeterSnapshot>, error: &str) -> Self {
        let last_error = Some(truncate_error(error));
        match previous {
            Some(previous) => Self {
                raw_fields: previous.raw_fields.clone(),
                status: ApiStatus::Failed,
                last_error,
                last_successful_update: previous.last_successful_update,
                currency: previous.currency.clone(),
            },
            None => Self {
                raw_fields: RawFields::new(),
                status: ApiStatus::Failed,
                last_error,
                last_successful_update: None,
                currency: DEFAULT_CURRENCY.to_string(),
            },
        }
    }

    pub fn raw_fields(&self) -> &RawFields {
        &self.raw_fields
    }

    pub fn status(&self) -> ApiStatus {
        self.status
    }

    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    pub fn last_successful_update(&self) -> Option<DateTime<FixedOffset>> {
        self.last_successful_update
    }

    pub fn currency(&self) -> &str {
        &self.currency
    }

    pub fn has_data(&self) -> bool {
        !self.raw_fields.is_empty()
    }

    /// Walks nested objects, e.g. `["Kwh_Bezug", "Kwh180"]`
    pub fn field(&self, path: &[&str]) -> Option<&Value> {
        let (first, rest) = path.split_first()?;
        rest.iter()
            .try_fold(self.raw_fields.get(*first)?, |value, key| value.get(key))
    }

    /// Numeric field; numeric strings are accepted too
    pub fn number(&self, path: &[&str]) -> Option<f64> {
        match self.field(path)? {
            Value::Number(n) => n.as_f64(),
            Value::String(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    pub fn product(&self) -> Option<&str> {
        self.field(&["product"]).and_then(Value::as_str)
    }

    pub fn version(&self) -> Option<f64> {
        self.number(&["version"])
    }

    /// Cumulative reading: kWh for electricity, m³ for gas
    pub fn meter_reading(&self) -> Option<f64> {
        self.number(&["Zaehlerstand_Bezug", "Stand180"])
    }

    /// Instantaneous power in W
    pub fn active_power(&self) -> Option<f64> {
        self.number(&["Wirkleistung_Bezug", "Leistung170"])
    }

    /// Energy consumed today in kWh
    pub fn energy_today(&self) -> Option<f64> {
        self.number(&["Kwh_Bezug", "Kwh180"])
    }

    /// Amount billed today by the device, in [`Self::currency`]
    pub fn amount_today(&self) -> Option<f64> {
        self.number(&["Betrag_Bezug", "Betrag180"])
    }
}

/// Currency from the import amount, then the export amount, then EUR
pub fn extract_currency(raw_fields: &RawFields) -> String {
    ["Betrag_Bezug", "Betrag_Lieferung"]
        .iter()
        .filter_map(|section| raw_fields.get(*section)?.get("Waehrung")?.as_str())
        .map(str::trim)
        .find(|currency| !currency.is_empty())
        .unwrap_or(DEFAULT_CURRENCY)
        .to_string()
}

/// Cuts messages longer than [`MAX_ERROR_LENGTH`] characters, ending them with "..."
pub fn truncate_error(error: &str) -> String {
    if error.chars().count() <= MAX_ERROR_LENGTH {
        return error.to_string();
    }
    let mut truncated: String = error.chars().take(MAX_ERROR_LENGTH - 3).collect();
    truncated.push_str("...");
    truncated
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    fn raw(value: Value) -> RawFields {
        value.as_object().cloned().unwrap()
    }

    fn now() -> DateTime<FixedOffset> {
        FixedOffset::east_opt(3600)
            .unwrap()
            .with_ymd_and_hms(2025, 3, 1, 12, 0, 0)
            .unwrap()
    }

    fn sample() -> RawFields {
        raw(json!({
            "product": "Emlog - Electronic Meter Log",
            "version": 1.16,
            "Zaehlerstand_Bezug": {"Stand180": 1234.5},
            "Wirkleistung_Bezug": {"Leistung170": "245"},
            "Kwh_Bezug": {"Kwh180": 7.25},
            "Betrag_Bezug": {"Betrag180": 2.18, "Waehrung": "CHF"},
            "Extra": {"passthrough": true}
        }))
    }

    #[test]
    fn test_connected_snapshot() {
        let snapshot = MeterSnapshot::connected(sample(), now());
        assert_eq!(snapshot.status(), ApiStatus::Connected);
        assert_eq!(snapshot.last_error(), None);
        assert_eq!(snapshot.last_successful_update(), Some(now()));
        assert_eq!(snapshot.currency(), "CHF");
        assert_eq!(snapshot.product(), Some("Emlog - Electronic Meter Log"));
        assert_eq!(snapshot.version(), Some(1.16));
        assert_eq!(snapshot.meter_reading(), Some(1234.5));
        assert_eq!(snapshot.active_power(), Some(245.0));
        assert_eq!(snapshot.energy_today(), Some(7.25));
        assert_eq!(snapshot.amount_today(), Some(2.18));
        assert_eq!(snapshot.field(&["Extra", "passthrough"]), Some(&json!(true)));
        assert_eq!(snapshot.field(&["Extra", "missing"]), None);
        assert_eq!(snapshot.field(&[]), None);
    }

    #[test]
    fn test_failed_copies_previous_data() {
        let previous = MeterSnapshot::connected(sample(), now());
        let failed = MeterSnapshot::failed(Some(&previous), "HTTP 500 from emlog (index 1)");
        assert_eq!(failed.status(), ApiStatus::Failed);
        assert_eq!(failed.raw_fields(), previous.raw_fields());
        assert_eq!(failed.last_successful_update(), Some(now()));
        assert_eq!(failed.currency(), "CHF");
        assert_eq!(failed.last_error(), Some("HTTP 500 from emlog (index 1)"));
    }

    #[test]
    fn test_failed_without_history_is_empty() {
        let failed = MeterSnapshot::failed(None, "Timeout");
        assert_eq!(failed.status(), ApiStatus::Failed);
        assert!(!failed.has_data());
        assert_eq!(failed.last_successful_update(), None);
        assert_eq!(failed.currency(), DEFAULT_CURRENCY);
    }

    #[test]
    fn test_currency_fallbacks() {
        assert_eq!(extract_currency(&raw(json!({}))), "EUR");
        assert_eq!(
            extract_currency(&raw(json!({"Betrag_Lieferung": {"Waehrung": "USD"}}))),
            "USD"
        );
        assert_eq!(
            extract_currency(&raw(json!({
                "Betrag_Bezug": {"Waehrung": ""},
                "Betrag_Lieferung": {"Waehrung": "GBP"}
            }))),
            "GBP"
        );
        assert_eq!(
            extract_currency(&raw(json!({"Betrag_Bezug": {"Waehrung": 7}}))),
            "EUR"
        );
    }

    #[test]
    fn test_truncate_error() {
        let short = "x".repeat(MAX_ERROR_LENGTH);
        assert_eq!(truncate_error(&short), short);

        let long = "ä".repeat(250);
        let truncated = truncate_error(&long);
        assert_eq!(truncated.chars().count(), MAX_ERROR_LENGTH);
        assert!(truncated.ends_with("..."));

        let failed = MeterSnapshot::failed(None, &long);
        assert_eq!(failed.last_error().map(|e| e.chars().count()), Some(200));
    }

    #[test]
    fn test_status_strings() {
        assert_eq!(ApiStatus::Initializing.as_str(), "initializing");
        assert_eq!(ApiStatus::Connected.as_str(), "connected");
        assert_eq!(ApiStatus::Failed.as_str(), "failed");
    }

    #[test]
    fn test_timestamp_is_utc_comparable() {
        let snapshot = MeterSnapshot::connected(sample(), now());
        let utc = snapshot.last_successful_update().unwrap().naive_utc();
        assert_eq!(utc, chrono::NaiveDate::from_ymd_opt(2025, 3, 1)
            .unwrap()
            .and_hms_opt(11, 0, 0)
            .unwrap());
    }
}
