use crate::error::{FetchError, ValidationError};
use crate::snapshot::RawFields;
use reqwest::StatusCode;
use serde_json::Value;
use std::time::Duration;
use tokio::time;

pub const EMLOG_EXPORT_PATH: &str = "/pages/getinformation.php";

/// Top-level fields every Emlog export carries
const EXPECTED_FIELDS: [&str; 4] = [
    "product",
    "version",
    "Zaehlerstand_Bezug",
    "Wirkleistung_Bezug",
];

/// HTTP client for the JSON export of a single meter on an Emlog device
#[derive(Debug, Clone)]
pub struct EmlogClient {
    host: String,
    meter_index: u8,
    timeout: Duration,
    client: reqwest::Client,
}

impl EmlogClient {
    pub fn new(host: &str, meter_index: u8, timeout: Duration) -> Self {
        Self::with_client(reqwest::Client::new(), host, meter_index, timeout)
    }

    /// Reuses an existing connection pool, e.g. one shared by several meters
    pub fn with_client(
        client: reqwest::Client,
        host: &str,
        meter_index: u8,
        timeout: Duration,
    ) -> Self {
        Self {
            host: host.to_string(),
            meter_index,
            timeout,
            client,
        }
    }

    pub fn export_url(&self) -> String {
        format!(
            "http://{}{}?export&meterindex={}",
            self.host, EMLOG_EXPORT_PATH, self.meter_index
        )
    }

    /// One GET of the export endpoint, bounded by the request timeout
    pub async fn fetch_export(&self) -> Result<RawFields, FetchError> {
        match time::timeout(self.timeout, self.request_export()).await {
            Ok(result) => result,
            Err(_) => Err(FetchError::Timeout {
                host: self.host.clone(),
                meter_index: self.meter_index,
            }),
        }
    }

    /// Fetches once and checks that the answer looks like an Emlog export
    pub async fn validate(&self) -> Result<RawFields, ValidationError> {
        let fields = self.fetch_export().await?;
        let missing: Vec<String> = EXPECTED_FIELDS
            .iter()
            .filter(|field| !fields.contains_key(**field))
            .map(|field| field.to_string())
            .collect();
        if missing.is_empty() {
            Ok(fields)
        } else {
            Err(ValidationError::MissingFields(missing))
        }
    }

    async fn request_export(&self) -> Result<RawFields, FetchError> {
        let response = self
            .client
            .get(self.export_url())
            .send()
            .await
            .map_err(|e| self.transport_error(e))?;

        let status = response.status();
        if status != StatusCode::OK {
            return Err(FetchError::Status {
                status: status.as_u16(),
                host: self.host.clone(),
                meter_index: self.meter_index,
            });
        }

        let body = response.bytes().await.map_err(|e| self.transport_error(e))?;
        // The device does not always send a JSON content type, so decode by hand
        match serde_json::from_slice::<Value>(&body) {
            Ok(Value::Object(fields)) => Ok(fields),
            Ok(Value::Null) => Ok(RawFields::new()),
            Ok(other) => Err(self.decode_error(format!(
                "expected a JSON object, got {}",
                json_kind(&other)
            ))),
            Err(e) => Err(self.decode_error(e.to_string())),
        }
    }

    fn transport_error(&self, err: reqwest::Error) -> FetchError {
        FetchError::Transport {
            host: self.host.clone(),
            meter_index: self.meter_index,
            message: err.to_string(),
        }
    }

    fn decode_error(&self, message: String) -> FetchError {
        FetchError::Decode {
            host: self.host.clone(),
            meter_index: self.meter_index,
            message,
        }
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}
