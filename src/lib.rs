//! Emlog Meter Library
//!
//! Polls the JSON export of an Emlog energy meter logger, keeps the latest
//! reading as an immutable snapshot and derives tariff based costs from it.
//! Tariff values can be overridden at runtime by Home Assistant helper entities.

pub mod config;
pub mod coordinator;
pub mod cost;
pub mod emlog_client;
pub mod error;
pub mod helper_states;
pub mod home_assistant;
pub mod sensors;
pub mod snapshot;
pub mod tariff;
pub mod unit_converter;
pub mod value_resolver;

// Re-export commonly used types for easier access
pub use config::{MeterConfig, MeterId, MeterType};
pub use coordinator::{CoordinatorHandle, MeterCoordinator, SnapshotListener};
pub use cost::{CostReport, HelperConsumption, Period};
pub use emlog_client::EmlogClient;
pub use error::{ConfigError, FetchError, ValidationError};
pub use helper_states::{HelperStateReader, HelperStates};
pub use home_assistant::HomeAssistantAPI;
pub use snapshot::{ApiStatus, MeterSnapshot};
pub use tariff::{effective_tariff, EffectiveTariff, TariffConfig};
pub use value_resolver::{HelperLookup, HelperState};
