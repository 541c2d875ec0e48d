//! Periodic poller for one meter.
//!
//! Each coordinator owns one fetch loop. A cycle fetches the export, commits a
//! new [`MeterSnapshot`] and hands it to every registered listener before the
//! next delay starts, so fetches for one meter never overlap.

use crate::config::{MeterConfig, MeterId};
use crate::emlog_client::EmlogClient;
use crate::error::FetchError;
use crate::snapshot::{ApiStatus, MeterSnapshot, RawFields};
use chrono::{DateTime, FixedOffset, Utc};
use chrono_tz::Tz;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, info, warn};

/// Receives every committed snapshot, in registration order
pub trait SnapshotListener: Send + Sync {
    fn on_snapshot(&self, snapshot: &Arc<MeterSnapshot>);
}

/// Commit logic of the poll loop, without any I/O
#[derive(Debug, Default)]
pub struct PollState {
    latest: Option<Arc<MeterSnapshot>>,
    consecutive_failures: u32,
}

impl PollState {
    pub fn latest(&self) -> Option<&Arc<MeterSnapshot>> {
        self.latest.as_ref()
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    pub fn commit_success(
        &mut self,
        raw_fields: RawFields,
        now: DateTime<FixedOffset>,
    ) -> Arc<MeterSnapshot> {
        self.consecutive_failures = 0;
        self.commit(MeterSnapshot::connected(raw_fields, now))
    }

    pub fn commit_failure(&mut self, error: &FetchError) -> Arc<MeterSnapshot> {
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        let snapshot = MeterSnapshot::failed(self.latest.as_deref(), &error.to_string());
        self.commit(snapshot)
    }

    fn commit(&mut self, snapshot: MeterSnapshot) -> Arc<MeterSnapshot> {
        let snapshot = Arc::new(snapshot);
        self.latest = Some(snapshot.clone());
        snapshot
    }
}

/// Listener list and latest-snapshot channel, shared with the handle
struct Shared {
    listeners: Mutex<Vec<Arc<dyn SnapshotListener>>>,
    latest: watch::Sender<Option<Arc<MeterSnapshot>>>,
}

impl Shared {
    fn new() -> Arc<Self> {
        let (latest, _) = watch::channel(None);
        Arc::new(Self {
            listeners: Mutex::new(Vec::new()),
            latest,
        })
    }

    fn add_listener(&self, listener: Arc<dyn SnapshotListener>) {
        self.listeners
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(listener);
    }

    fn publish(&self, snapshot: &Arc<MeterSnapshot>) {
        self.latest.send_replace(Some(snapshot.clone()));
        // Listeners added while this runs only see later snapshots
        let listeners = self
            .listeners
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        for listener in &listeners {
            listener.on_snapshot(snapshot);
        }
    }
}

pub struct MeterCoordinator {
    meter: MeterId,
    client: EmlogClient,
    scan_interval: Duration,
    time_zone: Option<Tz>,
    state: PollState,
    shared: Arc<Shared>,
}

impl MeterCoordinator {
    pub fn new(config: &MeterConfig) -> Self {
        Self::with_client(config, reqwest::Client::new())
    }

    /// Uses `client` as connection pool, so several meters can share one
    pub fn with_client(config: &MeterConfig, client: reqwest::Client) -> Self {
        Self {
            meter: config.meter_id(),
            client: EmlogClient::with_client(
                client,
                &config.host,
                config.meter_index,
                config.request_timeout,
            ),
            scan_interval: config.scan_interval,
            time_zone: config.time_zone,
            state: PollState::default(),
            shared: Shared::new(),
        }
    }

    pub fn meter(&self) -> MeterId {
        self.meter
    }

    pub fn add_listener(&self, listener: Arc<dyn SnapshotListener>) {
        self.shared.add_listener(listener);
    }

    /// Receiver that always holds the most recent snapshot
    pub fn subscribe(&self) -> watch::Receiver<Option<Arc<MeterSnapshot>>> {
        self.shared.latest.subscribe()
    }

    pub fn latest(&self) -> Option<Arc<MeterSnapshot>> {
        self.state.latest().cloned()
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.state.consecutive_failures()
    }

    /// Runs one fetch-and-commit cycle and notifies listeners
    pub async fn poll_once(&mut self) -> Arc<MeterSnapshot> {
        let result = self.client.fetch_export().await;
        self.commit(result)
    }

    fn commit(&mut self, result: Result<RawFields, FetchError>) -> Arc<MeterSnapshot> {
        let previous_status = self.state.latest().map(|s| s.status());
        let snapshot = match result {
            Ok(raw_fields) => {
                let failures = self.state.consecutive_failures();
                if failures > 0 {
                    info!(
                        "Connection to emlog {} restored after {} failed attempts",
                        self.meter, failures
                    );
                }
                let now = self.now();
                self.state.commit_success(raw_fields, now)
            }
            Err(e) => {
                let snapshot = self.state.commit_failure(&e);
                if previous_status == Some(ApiStatus::Failed) {
                    debug!(
                        "Emlog {} still failing ({} in a row): {}",
                        self.meter,
                        self.state.consecutive_failures(),
                        e
                    );
                } else {
                    warn!("Error fetching emlog {}: {}", self.meter, e);
                }
                snapshot
            }
        };
        debug!(
            "Emlog {} snapshot committed: {}",
            self.meter,
            snapshot.status().as_str()
        );
        self.shared.publish(&snapshot);
        snapshot
    }

    fn now(&self) -> DateTime<FixedOffset> {
        let now = Utc::now();
        match self.time_zone {
            Some(tz) => now.with_timezone(&tz).fixed_offset(),
            None => now.fixed_offset(),
        }
    }

    /// Starts the poll loop on its own task
    pub fn spawn(mut self) -> CoordinatorHandle {
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let shared = self.shared.clone();
        let meter = self.meter;

        let task = tokio::spawn(async move {
            info!(
                "Starting emlog poller for {} every {:?}",
                self.meter, self.scan_interval
            );
            loop {
                if *shutdown_rx.borrow() {
                    break;
                }
                // An in-flight fetch is abandoned on shutdown and never committed
                let result = tokio::select! {
                    biased;
                    _ = shutdown_rx.changed() => break,
                    result = self.client.fetch_export() => result,
                };
                self.commit(result);

                tokio::select! {
                    biased;
                    _ = shutdown_rx.changed() => break,
                    _ = sleep(self.scan_interval) => {}
                }
            }
            info!("Emlog poller for {} stopped", self.meter);
        });

        CoordinatorHandle {
            meter,
            shared,
            shutdown_tx,
            task,
        }
    }
}

/// Control handle for a running coordinator
pub struct CoordinatorHandle {
    meter: MeterId,
    shared: Arc<Shared>,
    shutdown_tx: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl CoordinatorHandle {
    pub fn meter(&self) -> MeterId {
        self.meter
    }

    pub fn add_listener(&self, listener: Arc<dyn SnapshotListener>) {
        self.shared.add_listener(listener);
    }

    pub fn subscribe(&self) -> watch::Receiver<Option<Arc<MeterSnapshot>>> {
        self.shared.latest.subscribe()
    }

    pub fn latest(&self) -> Option<Arc<MeterSnapshot>> {
        self.shared.latest.borrow().clone()
    }

    /// Stops the poll loop. Once this returns no further snapshot is
    /// produced or delivered.
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(true);
        if let Err(e) = self.task.await {
            warn!("Emlog poller for {} ended abnormally: {}", self.meter, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MeterType;
    use crate::emlog_client::EMLOG_EXPORT_PATH;
    use mockito::Matcher;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::time::Instant;

    const EXPORT_BODY: &str = r#"{
        "product": "Emlog - Electronic Meter Log",
        "version": 1.16,
        "Zaehlerstand_Bezug": {"Stand180": 4711.5},
        "Wirkleistung_Bezug": {"Leistung170": 320},
        "Kwh_Bezug": {"Kwh180": 3.2},
        "Betrag_Bezug": {"Betrag180": 0.96, "Waehrung": "EUR"}
    }"#;

    fn config_for(server: &mockito::ServerGuard) -> MeterConfig {
        let mut config = MeterConfig::new(&server.host_with_port(), MeterType::Electricity, 1);
        config.scan_interval = Duration::from_millis(20);
        config.request_timeout = Duration::from_secs(2);
        config
    }

    fn status_error(status: u16) -> FetchError {
        FetchError::Status {
            status,
            host: "emlog".to_string(),
            meter_index: 1,
        }
    }

    struct Recorder {
        name: &'static str,
        log: Arc<Mutex<Vec<(&'static str, ApiStatus)>>>,
    }

    impl SnapshotListener for Recorder {
        fn on_snapshot(&self, snapshot: &Arc<MeterSnapshot>) {
            self.log.lock().unwrap().push((self.name, snapshot.status()));
        }
    }

    #[derive(Default)]
    struct Counter(AtomicUsize);

    impl SnapshotListener for Counter {
        fn on_snapshot(&self, _snapshot: &Arc<MeterSnapshot>) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn test_failure_without_history() {
        let mut state = PollState::default();
        let snapshot = state.commit_failure(&status_error(503));
        assert_eq!(snapshot.status(), ApiStatus::Failed);
        assert!(!snapshot.has_data());
        assert_eq!(snapshot.last_successful_update(), None);
        assert_eq!(snapshot.currency(), "EUR");
        assert_eq!(state.consecutive_failures(), 1);
    }

    #[test]
    fn test_success_resets_failures() {
        let mut state = PollState::default();
        state.commit_failure(&status_error(500));
        state.commit_failure(&status_error(500));
        assert_eq!(state.consecutive_failures(), 2);

        let raw: RawFields = serde_json::from_str(EXPORT_BODY).unwrap();
        let snapshot = state.commit_success(raw, Utc::now().fixed_offset());
        assert_eq!(snapshot.status(), ApiStatus::Connected);
        assert_eq!(snapshot.last_error(), None);
        assert_eq!(state.consecutive_failures(), 0);
        assert!(Arc::ptr_eq(state.latest().unwrap(), &snapshot));
    }

    #[tokio::test]
    async fn test_failure_after_successes_keeps_last_data() {
        let mut server = mockito::Server::new_async().await;
        let ok = server
            .mock("GET", EMLOG_EXPORT_PATH)
            .match_query(Matcher::Any)
            .with_status(200)
            .with_body(EXPORT_BODY)
            .expect(5)
            .create_async()
            .await;

        let mut coordinator = MeterCoordinator::new(&config_for(&server));
        let mut fifth = None;
        for _ in 0..5 {
            fifth = Some(coordinator.poll_once().await);
        }
        ok.assert_async().await;
        ok.remove_async().await;
        let fifth = fifth.unwrap();
        assert_eq!(fifth.status(), ApiStatus::Connected);

        server
            .mock("GET", EMLOG_EXPORT_PATH)
            .match_query(Matcher::Any)
            .with_status(500)
            .create_async()
            .await;

        let failed = coordinator.poll_once().await;
        assert_eq!(failed.status(), ApiStatus::Failed);
        assert_eq!(failed.raw_fields(), fifth.raw_fields());
        assert_eq!(failed.last_successful_update(), fifth.last_successful_update());
        assert!(failed.last_error().unwrap().contains("500"));
        assert_eq!(coordinator.consecutive_failures(), 1);
    }

    #[tokio::test]
    async fn test_listeners_notified_in_order() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", EMLOG_EXPORT_PATH)
            .match_query(Matcher::Any)
            .with_status(200)
            .with_body(EXPORT_BODY)
            .create_async()
            .await;

        let log = Arc::new(Mutex::new(Vec::new()));
        let mut coordinator = MeterCoordinator::new(&config_for(&server));
        for name in ["first", "second", "third"] {
            coordinator.add_listener(Arc::new(Recorder {
                name,
                log: log.clone(),
            }));
        }
        let mut latest = coordinator.subscribe();

        coordinator.poll_once().await;

        assert_eq!(
            *log.lock().unwrap(),
            vec![
                ("first", ApiStatus::Connected),
                ("second", ApiStatus::Connected),
                ("third", ApiStatus::Connected),
            ]
        );
        assert!(latest.has_changed().unwrap());
        let published = latest.borrow_and_update().clone().unwrap();
        assert!(Arc::ptr_eq(&published, &coordinator.latest().unwrap()));
    }

    /// Registers another listener the first time it is called
    struct Registrar {
        shared: Arc<Shared>,
        late: Arc<Counter>,
        registered: AtomicUsize,
    }

    impl SnapshotListener for Registrar {
        fn on_snapshot(&self, _snapshot: &Arc<MeterSnapshot>) {
            if self.registered.fetch_add(1, Ordering::SeqCst) == 0 {
                self.shared.add_listener(self.late.clone());
            }
        }
    }

    #[tokio::test]
    async fn test_listener_added_during_notification_sees_next_snapshot() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", EMLOG_EXPORT_PATH)
            .match_query(Matcher::Any)
            .with_status(200)
            .with_body(EXPORT_BODY)
            .create_async()
            .await;

        let mut coordinator = MeterCoordinator::new(&config_for(&server));
        let late = Arc::new(Counter::default());
        coordinator.add_listener(Arc::new(Registrar {
            shared: coordinator.shared.clone(),
            late: late.clone(),
            registered: AtomicUsize::new(0),
        }));

        coordinator.poll_once().await;
        assert_eq!(late.0.load(Ordering::SeqCst), 0);
        coordinator.poll_once().await;
        assert_eq!(late.0.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_timestamp_uses_configured_time_zone() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", EMLOG_EXPORT_PATH)
            .match_query(Matcher::Any)
            .with_status(200)
            .with_body(EXPORT_BODY)
            .create_async()
            .await;

        let mut config = config_for(&server);
        config.time_zone = Some(chrono_tz::Asia::Kolkata);
        let mut coordinator = MeterCoordinator::new(&config);
        let snapshot = coordinator.poll_once().await;
        let offset = snapshot.last_successful_update().unwrap().offset().local_minus_utc();
        assert_eq!(offset, 5 * 3600 + 30 * 60);
    }

    /// Records when each snapshot arrives
    struct Timestamps(Mutex<Vec<Instant>>);

    impl SnapshotListener for Timestamps {
        fn on_snapshot(&self, _snapshot: &Arc<MeterSnapshot>) {
            self.0.lock().unwrap().push(Instant::now());
        }
    }

    #[tokio::test]
    async fn test_delay_starts_after_commit() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", EMLOG_EXPORT_PATH)
            .match_query(Matcher::Any)
            .with_status(200)
            .with_body(EXPORT_BODY)
            .create_async()
            .await;

        let mut config = config_for(&server);
        config.scan_interval = Duration::from_millis(50);
        let coordinator = MeterCoordinator::new(&config);
        let stamps = Arc::new(Timestamps(Mutex::new(Vec::new())));
        coordinator.add_listener(stamps.clone());

        let handle = coordinator.spawn();
        sleep(Duration::from_millis(300)).await;
        handle.shutdown().await;

        let stamps = stamps.0.lock().unwrap();
        assert!(stamps.len() >= 2, "only {} snapshots", stamps.len());
        for pair in stamps.windows(2) {
            assert!(pair[1] - pair[0] >= Duration::from_millis(50));
        }
    }

    #[tokio::test]
    async fn test_no_delivery_after_shutdown() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", EMLOG_EXPORT_PATH)
            .match_query(Matcher::Any)
            .with_status(200)
            .with_body(EXPORT_BODY)
            .create_async()
            .await;

        let coordinator = MeterCoordinator::new(&config_for(&server));
        let counter = Arc::new(Counter::default());
        let handle = coordinator.spawn();
        handle.add_listener(counter.clone());

        let mut latest = handle.subscribe();
        latest.changed().await.unwrap();
        assert!(handle.latest().is_some());

        handle.shutdown().await;
        let delivered = counter.0.load(Ordering::SeqCst);
        sleep(Duration::from_millis(100)).await;
        assert_eq!(counter.0.load(Ordering::SeqCst), delivered);
    }
}
