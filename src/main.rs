use emlog_meter::cost::round2;
use emlog_meter::helper_states::watched_entities;
use emlog_meter::sensors::{read_all, SensorContext};
use emlog_meter::{
    CostReport, EmlogClient, HelperConsumption, HelperStateReader, HelperStates,
    HomeAssistantAPI, MeterConfig, MeterCoordinator, MeterSnapshot, SnapshotListener,
};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

/// Writes the sensor set and cost figures of every snapshot to the log
struct LogListener {
    config: MeterConfig,
    helpers: HelperStates,
}

impl SnapshotListener for LogListener {
    fn on_snapshot(&self, snapshot: &Arc<MeterSnapshot>) {
        let meter = self.config.meter_id();
        let ctx = SensorContext {
            config: &self.config,
            lookup: &self.helpers,
            as_of: self.config.today(),
        };
        for reading in read_all(Some(snapshot), &ctx) {
            let rendered = reading.display(self.config.display_precision);
            if reading.kind.is_diagnostic() {
                debug!("{} = {}", reading.entity_id, rendered);
            } else {
                info!("{} = {}", reading.entity_id, rendered);
            }
        }

        let consumption = HelperConsumption::new(&self.helpers);
        let report = CostReport::compute(
            &meter,
            &self.config.tariff,
            &self.helpers,
            &consumption,
            ctx.as_of,
        );
        let money = |value: Option<f64>| match value {
            Some(v) => format!("{:.2} {}", round2(v), snapshot.currency()),
            None => "unavailable".to_string(),
        };
        info!(
            "{} costs: day {}, month {}, year {}, advance {}, difference {} (settlement month {})",
            meter,
            money(report.day),
            money(report.month),
            money(report.year),
            money(Some(report.advance_total)),
            money(report.advance_difference),
            report.settlement_month
        );
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("Starting emlog meter bridge");
    let config = MeterConfig::from_env()?;
    info!(
        "Polling {} meter {} at {} every {:?}",
        config.meter_type.display_name(),
        config.meter_index,
        config.host,
        config.scan_interval
    );

    let http = reqwest::Client::new();
    let probe = EmlogClient::with_client(
        http.clone(),
        &config.host,
        config.meter_index,
        config.request_timeout,
    );
    match probe.validate().await {
        Ok(fields) => info!(
            "Found {} at {}",
            fields
                .get("product")
                .and_then(|p| p.as_str())
                .unwrap_or("emlog"),
            probe.export_url()
        ),
        // Not fatal, the coordinator keeps retrying
        Err(e) => warn!("Emlog device check failed: {}", e),
    }

    let helpers = HelperStates::new();
    let (helper_shutdown_tx, helper_shutdown_rx) = watch::channel(false);
    let helper_task = match HomeAssistantAPI::from_env() {
        Some(api) => {
            let reader = HelperStateReader::new(api, watched_entities(&config), helpers.clone());
            Some(reader.spawn(helper_shutdown_rx))
        }
        None => {
            info!("HA_URL not set, using static tariff values only");
            None
        }
    };

    let coordinator = MeterCoordinator::with_client(&config, http);
    coordinator.add_listener(Arc::new(LogListener {
        config: config.clone(),
        helpers: helpers.clone(),
    }));
    let handle = coordinator.spawn();

    tokio::signal::ctrl_c().await?;
    info!("Shutting down");

    handle.shutdown().await;
    let _ = helper_shutdown_tx.send(true);
    if let Some(task) = helper_task {
        task.await?;
    }
    Ok(())
}
