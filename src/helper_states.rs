use crate::config::MeterConfig;
use crate::cost::{HelperConsumption, Period};
use crate::home_assistant::HomeAssistantAPI;
use crate::value_resolver::{HelperLookup, HelperState};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval, sleep, MissedTickBehavior};
use tracing::{debug, info, warn};

pub const DEFAULT_REFRESH_INTERVAL: Duration = Duration::from_secs(30);
const MAX_RETRIES: u32 = 3;

/// Last known helper states, shared between the reader task and the cost engine
#[derive(Debug, Clone, Default)]
pub struct HelperStates {
    states: Arc<RwLock<HashMap<String, HelperState>>>,
}

impl HelperStates {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, entity_id: &str, state: HelperState) {
        let mut states = self.states.write().unwrap_or_else(|e| e.into_inner());
        states.insert(entity_id.to_string(), state);
    }

    pub fn len(&self) -> usize {
        self.states.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl HelperLookup for HelperStates {
    fn helper_state(&self, entity_id: &str) -> HelperState {
        self.states
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(entity_id)
            .cloned()
            .unwrap_or(HelperState::NotFound)
    }
}

/// Every entity a meter may consult: configured helpers plus the period
/// consumption accumulators
pub fn watched_entities(config: &MeterConfig) -> Vec<String> {
    let tariff = &config.tariff;
    let configured = [
        &tariff.price_per_unit,
        &tariff.base_fee_per_month,
        &tariff.new_price_per_unit,
        &tariff.new_base_fee_per_month,
        &tariff.monthly_advance_payment,
        &config.gas.calorific_value,
        &config.gas.compressibility_factor,
    ];

    let meter = config.meter_id();
    let candidates = configured
        .iter()
        .filter_map(|value| value.helper.as_deref())
        .map(str::trim)
        .filter(|id| !id.is_empty())
        .map(str::to_string)
        .chain(
            Period::ALL
                .iter()
                .map(|period| HelperConsumption::entity_id(&meter, *period)),
        );

    let mut entities: Vec<String> = Vec::new();
    for entity_id in candidates {
        if !entities.contains(&entity_id) {
            entities.push(entity_id);
        }
    }
    entities
}

/// Background task keeping a [`HelperStates`] store in sync with Home Assistant
pub struct HelperStateReader {
    ha_client: HomeAssistantAPI,
    entities: Vec<String>,
    store: HelperStates,
    refresh_interval: Duration,
}

impl HelperStateReader {
    pub fn new(ha_client: HomeAssistantAPI, entities: Vec<String>, store: HelperStates) -> Self {
        Self {
            ha_client,
            entities,
            store,
            refresh_interval: DEFAULT_REFRESH_INTERVAL,
        }
    }

    pub fn with_refresh_interval(mut self, refresh_interval: Duration) -> Self {
        self.refresh_interval = refresh_interval;
        self
    }

    /// Runs the refresh loop until `shutdown` flips to true
    pub fn spawn(self, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move {
            info!(
                "Starting helper state reader for {} entities",
                self.entities.len()
            );
            let mut ticker = interval(self.refresh_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    _ = stop_requested(&mut shutdown) => break,
                }
                // A refresh in progress is abandoned on shutdown
                tokio::select! {
                    refreshed = self.refresh_once() => {
                        debug!("Refreshed {} of {} helper entities", refreshed, self.entities.len());
                    }
                    _ = stop_requested(&mut shutdown) => break,
                }
            }
            info!("Helper state reader stopped");
        })
    }

    /// Reads every watched entity once. Entities that cannot be read keep
    /// their last known state. Returns the number of entities refreshed.
    pub async fn refresh_once(&self) -> usize {
        let mut refreshed = 0;
        for entity_id in &self.entities {
            match self.read_with_retry(entity_id).await {
                Ok(state) => {
                    debug!("Helper {} = {:?}", entity_id, state);
                    self.store.set(entity_id, state);
                    refreshed += 1;
                }
                Err(e) => warn!("Helper state read error: {}", e),
            }
        }
        refreshed
    }

    async fn read_with_retry(&self, entity_id: &str) -> Result<HelperState, String> {
        let mut last_error = String::new();
        for attempt in 1..=MAX_RETRIES {
            match self.ha_client.read_helper_state(entity_id).await {
                Ok(state) => return Ok(state),
                Err(e) => {
                    last_error = e.to_string();
                    if attempt < MAX_RETRIES {
                        debug!(
                            "Helper read attempt {} for {} failed: {}. Retrying...",
                            attempt, entity_id, e
                        );
                        sleep(Duration::from_millis(200 * attempt as u64)).await;
                    }
                }
            }
        }
        Err(format!(
            "All {} attempts for {} failed. Last error: {}",
            MAX_RETRIES, entity_id, last_error
        ))
    }
}

/// Resolves once `shutdown` is true or its sender is gone
async fn stop_requested(shutdown: &mut watch::Receiver<bool>) {
    while !*shutdown.borrow_and_update() {
        if shutdown.changed().await.is_err() {
            return;
        }
    }
}
