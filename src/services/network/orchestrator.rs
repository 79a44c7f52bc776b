//! The network mode state machine.
//!
//! One [`Orchestrator`] owns the wireless interface. It is driven by the
//! supervisor loop which serializes every call, so none of the methods here
//! ever run concurrently.

use super::{
    access_point::AccessPointDriver,
    client::ClientDriver,
    probe::NetworkProbe,
    retry::{RetryPolicy, RetryState},
    types::{
        ApIdentity, AttemptOutcome, ConnectionAttempt, LinkSnapshot, NetworkMode, NetworkStatus,
        SavedNetwork,
    },
};
use crate::{
    error::{NetworkError, NetworkResult},
    services::credentials::{CredentialStore, StoredCredentials},
};
use log::{debug, error, info, warn};
use std::{
    net::Ipv4Addr,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};
use tokio::sync::watch;

#[derive(Clone, Debug)]
pub struct OrchestratorSettings {
    pub retry: RetryPolicy,
    /// Period of the reachability monitor while connected as a client.
    pub monitor_interval: Duration,
    /// Period after which AP mode gives client mode another chance.
    /// `None` keeps the access point up until an explicit request.
    pub ap_retry_interval: Option<Duration>,
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            monitor_interval: Duration::from_secs(30),
            ap_retry_interval: Some(Duration::from_secs(900)),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FallbackReason {
    NoSavedNetworks,
    Exhausted,
    Forced,
    /// An ad hoc connection failed while the access point was up.
    ConnectFailed,
}

/// Result of one orchestration call.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PassOutcome {
    AlreadyConnected,
    Connected { ssid: String },
    Failed { attempt_count: u32, next_delay: Duration },
    AccessPoint { reason: FallbackReason },
    /// Neither mode could be established, the next pass is scheduled.
    Disconnected { reason: String },
    Degraded { reason: String },
    Cancelled,
}

pub struct Orchestrator<P, C, A> {
    probe: P,
    client: C,
    access_point: A,
    store: Arc<CredentialStore>,
    settings: OrchestratorSettings,
    mode: NetworkMode,
    retry: RetryState,
    ssid: Option<String>,
    ip: Option<Ipv4Addr>,
    internet_reachable: bool,
    detail: Option<String>,
    retry_now: bool,
    ap_pinned: bool,
    generated_identity: Option<ApIdentity>,
    attempts: Vec<ConnectionAttempt>,
    cancel: Arc<AtomicBool>,
    status: watch::Sender<NetworkStatus>,
}

impl<P, C, A> Orchestrator<P, C, A>
where
    P: NetworkProbe,
    C: ClientDriver,
    A: AccessPointDriver,
{
    pub fn new(
        probe: P,
        client: C,
        access_point: A,
        store: Arc<CredentialStore>,
        settings: OrchestratorSettings,
    ) -> Self {
        let retry = RetryState::new(&settings.retry);
        let (status, _) = watch::channel(NetworkStatus::default());

        Self {
            probe,
            client,
            access_point,
            store,
            settings,
            mode: NetworkMode::Unknown,
            retry,
            ssid: None,
            ip: None,
            internet_reachable: false,
            detail: None,
            retry_now: false,
            ap_pinned: false,
            generated_identity: None,
            attempts: vec![],
            cancel: Arc::new(AtomicBool::new(false)),
            status,
        }
    }

    pub fn mode(&self) -> NetworkMode {
        self.mode
    }

    pub fn retry_state(&self) -> &RetryState {
        &self.retry
    }

    /// Attempts of the most recent pass or ad hoc connection.
    pub fn last_attempts(&self) -> &[ConnectionAttempt] {
        &self.attempts
    }

    pub fn status(&self) -> NetworkStatus {
        self.status.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<NetworkStatus> {
        self.status.subscribe()
    }

    /// Flag checked between candidate networks. Setting it aborts the
    /// running pass at the next candidate.
    pub fn cancel_flag(&self) -> Arc<AtomicBool> {
        self.cancel.clone()
    }

    /// Delay until the supervisor should act on its own, `None` to wait for
    /// an explicit request.
    pub fn next_wakeup(&self) -> Option<Duration> {
        match self.mode {
            NetworkMode::ClientConnected => Some(self.settings.monitor_interval),
            NetworkMode::Unknown | NetworkMode::Disconnected | NetworkMode::ClientConnecting
                if self.retry_now =>
            {
                Some(Duration::ZERO)
            }
            NetworkMode::Unknown | NetworkMode::Disconnected | NetworkMode::ClientConnecting => {
                Some(self.retry.next_delay)
            }
            NetworkMode::ApActive if self.ap_pinned => None,
            NetworkMode::ApActive => self.settings.ap_retry_interval,
            NetworkMode::Degraded => None,
        }
    }

    /// Resolve `Unknown` from one probe of the current link state.
    pub async fn initialize(&mut self) -> NetworkMode {
        let Ok(snapshot) = self.observe().await else {
            return self.mode;
        };

        let reachable = snapshot.client_ssid.is_some()
            && !snapshot.access_point_active
            && self.confirm_reachable().await.is_ok();

        if reachable {
            self.ssid = snapshot.client_ssid;
            self.ip = snapshot.ip;
            self.internet_reachable = true;
            self.transition(NetworkMode::ClientConnected, None);
        } else if snapshot.client_ssid.is_none() && snapshot.access_point_active {
            self.ssid = self
                .load_credentials()
                .0
                .ap_identity()
                .map(|identity| identity.ssid);
            self.ip = snapshot.ip;
            self.transition(NetworkMode::ApActive, None);
        } else {
            let detail = (snapshot.client_ssid.is_some() && snapshot.access_point_active)
                .then(|| "client link and access point both active".to_string());
            self.retry_now = true;
            self.transition(NetworkMode::Disconnected, detail);
        }

        self.mode
    }

    /// Make sure the device is usable: connected as a client with internet
    /// access, or broadcasting its access point.
    pub async fn ensure_connectivity(&mut self) -> PassOutcome {
        self.retry_now = false;
        self.ap_pinned = false;

        if self.mode == NetworkMode::Degraded {
            info!("connectivity requested while degraded, re-evaluating");
            self.transition(NetworkMode::Unknown, None);
        }

        let mut snapshot = match self.observe().await {
            Ok(snapshot) => snapshot,
            Err(outcome) => return outcome,
        };

        if snapshot.client_ssid.is_some() && snapshot.access_point_active {
            snapshot = match self.separate_modes().await {
                Ok(snapshot) => snapshot,
                Err(outcome) => return outcome,
            };
        }

        if let Some(ssid) = snapshot.client_ssid {
            if !snapshot.access_point_active {
                match self.confirm_reachable().await {
                    Ok(()) => return self.confirm_connected(ssid, snapshot.ip),
                    Err(e) => debug!("associated with {ssid} but not usable: {e}"),
                }
            }
        }

        let (credentials, store_error) = self.load_credentials();

        if credentials.networks.is_empty() {
            if self.mode == NetworkMode::ApActive && snapshot.access_point_active {
                debug!("no saved networks, access point stays up");
                if self.detail != store_error {
                    self.detail = store_error;
                    self.publish();
                }
                return PassOutcome::AccessPoint {
                    reason: FallbackReason::NoSavedNetworks,
                };
            }

            info!("no saved networks, switching to access point mode");
            return self
                .activate_access_point(&credentials, FallbackReason::NoSavedNetworks, store_error)
                .await;
        }

        self.run_pass(&credentials).await
    }

    /// Switch to AP mode and keep it until the next explicit request.
    pub async fn force_ap_mode(&mut self) -> PassOutcome {
        self.cancel.store(false, Ordering::SeqCst);
        self.ap_pinned = true;

        if self.mode == NetworkMode::ApActive {
            info!("access point already active");
            self.publish();
            return PassOutcome::AccessPoint {
                reason: FallbackReason::Forced,
            };
        }

        info!("access point mode requested");

        let (credentials, store_error) = self.load_credentials();
        self.retry.reset(&self.settings.retry);

        self.activate_access_point(&credentials, FallbackReason::Forced, store_error)
            .await
    }

    /// One attempt against a network that is not necessarily saved.
    pub async fn connect_to(&mut self, network: SavedNetwork) -> PassOutcome {
        let restore_ap = self.mode == NetworkMode::ApActive;
        let pinned = self.ap_pinned;
        self.ap_pinned = false;
        self.retry_now = false;

        let (credentials, _) = self.load_credentials();

        self.ssid = None;
        self.ip = None;
        self.transition(NetworkMode::ClientConnecting, None);

        let result = self.access_point.stop().await;
        if let Err(outcome) = self.absorb("stop access point", result) {
            return outcome;
        }

        self.attempts.clear();

        match self.attempt(&network, credentials.connection_timeout).await {
            Ok(ip) => self.connected(&network, ip),
            Err(e) if e.is_fatal() => self.degrade(e),
            Err(e) => {
                warn!("failed to connect to {}: {e}", network.ssid);

                if restore_ap {
                    self.ap_pinned = pinned;
                    return self
                        .activate_access_point(
                            &credentials,
                            FallbackReason::ConnectFailed,
                            Some(e.to_string()),
                        )
                        .await;
                }

                self.transition(NetworkMode::Disconnected, Some(e.to_string()));
                PassOutcome::Disconnected {
                    reason: e.to_string(),
                }
            }
        }
    }

    /// Reachability monitor while connected. Any loss moves to
    /// `Disconnected` with an immediate follow-up pass.
    pub async fn check_connectivity(&mut self) -> NetworkMode {
        if self.mode != NetworkMode::ClientConnected {
            return self.mode;
        }

        let Ok(snapshot) = self.observe().await else {
            return self.mode;
        };

        let mut lost = match (&snapshot.client_ssid, &self.ssid) {
            (None, _) => Some("client link lost".to_string()),
            (Some(now), Some(was)) if now != was => {
                Some(format!("associated with {now} instead of {was}"))
            }
            _ if snapshot.access_point_active => {
                Some("access point active while connected".to_string())
            }
            _ => None,
        };

        if lost.is_none() {
            lost = self
                .probe
                .check_internet()
                .await
                .err()
                .map(|e| e.to_string());
        }

        match lost {
            Some(reason) => {
                warn!("connectivity lost: {reason}");
                self.retry_now = true;
                self.ssid = None;
                self.ip = None;
                self.transition(NetworkMode::Disconnected, Some(reason));
            }
            None if self.ip != snapshot.ip => {
                self.ip = snapshot.ip;
                self.publish();
            }
            None => debug!("connectivity confirmed"),
        }

        self.mode
    }

    async fn run_pass(&mut self, credentials: &StoredCredentials) -> PassOutcome {
        self.ssid = None;
        self.ip = None;
        self.transition(NetworkMode::ClientConnecting, None);

        let result = self.access_point.stop().await;
        if let Err(outcome) = self.absorb("stop access point", result) {
            return outcome;
        }

        self.attempts.clear();
        let mut last_failure = None;

        for network in &credentials.networks {
            if self.cancel.load(Ordering::SeqCst) {
                info!("connection pass cancelled");
                return PassOutcome::Cancelled;
            }

            match self.attempt(network, credentials.connection_timeout).await {
                Ok(ip) => return self.connected(network, ip),
                Err(e) if e.is_fatal() => return self.degrade(e),
                Err(e) => {
                    warn!("failed to connect to {}: {e}", network.ssid);
                    last_failure = Some(e.to_string());
                }
            }
        }

        if self.retry.record_failed_pass(&self.settings.retry) {
            info!(
                "retries exhausted after {} passes, switching to access point mode",
                self.retry.attempt_count
            );
            self.retry.reset(&self.settings.retry);
            return self
                .activate_access_point(credentials, FallbackReason::Exhausted, last_failure)
                .await;
        }

        info!(
            "connection pass {} failed, next pass in {}s",
            self.retry.attempt_count,
            self.retry.next_delay.as_secs()
        );

        self.transition(NetworkMode::ClientConnecting, last_failure);

        PassOutcome::Failed {
            attempt_count: self.retry.attempt_count,
            next_delay: self.retry.next_delay,
        }
    }

    async fn attempt(
        &mut self,
        network: &SavedNetwork,
        timeout: Duration,
    ) -> NetworkResult<Option<Ipv4Addr>> {
        info!("connect to {}", network.ssid);

        let mut attempt = ConnectionAttempt::start(network.clone());
        let result = self.join_and_confirm(network, timeout).await;

        attempt.outcome = match &result {
            Ok(_) => AttemptOutcome::Success,
            Err(e) => AttemptOutcome::Failed(e.to_string()),
        };
        debug!("attempt finished: {attempt:?}");
        self.attempts.push(attempt);

        result
    }

    // joined is not connected: DNS and internet must work as well
    async fn join_and_confirm(
        &self,
        network: &SavedNetwork,
        timeout: Duration,
    ) -> NetworkResult<Option<Ipv4Addr>> {
        self.client.join(network, timeout).await?;
        self.client.configure_dns().await?;
        self.confirm_reachable().await?;

        Ok(self.probe.snapshot().await?.ip)
    }

    async fn confirm_reachable(&self) -> NetworkResult<()> {
        self.probe.check_dns().await?;
        self.probe.check_internet().await
    }

    fn connected(&mut self, network: &SavedNetwork, ip: Option<Ipv4Addr>) -> PassOutcome {
        self.retry.reset(&self.settings.retry);
        self.ssid = Some(network.ssid.clone());
        self.ip = ip;
        self.internet_reachable = true;
        self.transition(NetworkMode::ClientConnected, None);

        PassOutcome::Connected {
            ssid: network.ssid.clone(),
        }
    }

    fn confirm_connected(&mut self, ssid: String, ip: Option<Ipv4Addr>) -> PassOutcome {
        let unchanged = self.mode == NetworkMode::ClientConnected
            && self.ssid.as_deref() == Some(ssid.as_str())
            && self.ip == ip
            && self.retry == RetryState::new(&self.settings.retry);

        if unchanged {
            debug!("already connected to {ssid}");
            return PassOutcome::AlreadyConnected;
        }

        self.retry.reset(&self.settings.retry);
        self.ssid = Some(ssid);
        self.ip = ip;
        self.internet_reachable = true;
        self.transition(NetworkMode::ClientConnected, None);

        PassOutcome::AlreadyConnected
    }

    async fn activate_access_point(
        &mut self,
        credentials: &StoredCredentials,
        reason: FallbackReason,
        detail: Option<String>,
    ) -> PassOutcome {
        self.ssid = None;
        self.ip = None;

        if let Err(outcome) = self.release_client().await {
            return outcome;
        }

        let identity = match credentials.ap_identity() {
            Some(identity) => identity,
            None => self
                .generated_identity
                .get_or_insert_with(ApIdentity::generated)
                .clone(),
        };

        let result = self.access_point.start(&identity).await;

        match result {
            Ok(()) => {
                let ip = match self.observe().await {
                    Ok(snapshot) => snapshot.ip,
                    Err(outcome) => return outcome,
                };
                self.ssid = Some(identity.ssid);
                self.ip = ip;
                self.transition(NetworkMode::ApActive, detail);

                PassOutcome::AccessPoint { reason }
            }
            Err(e) if e.is_fatal() => self.degrade(e),
            Err(e) => {
                warn!("failed to start access point: {e}");
                self.transition(NetworkMode::Disconnected, Some(e.to_string()));

                PassOutcome::Disconnected {
                    reason: e.to_string(),
                }
            }
        }
    }

    /// Tear the client link down and confirm it is gone, retrying once.
    async fn release_client(&mut self) -> Result<(), PassOutcome> {
        for _ in 0..2 {
            let result = self.client.teardown().await;
            self.absorb("disconnect client", result)?;

            if self.observe().await?.client_ssid.is_none() {
                return Ok(());
            }

            warn!("client link still up after teardown");
        }

        Err(self.degrade(NetworkError::ProbeInconsistent(
            "client link still up after teardown".into(),
        )))
    }

    async fn separate_modes(&mut self) -> Result<LinkSnapshot, PassOutcome> {
        warn!("client link and access point both active, stopping access point");

        let result = self.access_point.stop().await;
        self.absorb("stop access point", result)?;

        let snapshot = self.observe().await?;

        if snapshot.client_ssid.is_some() && snapshot.access_point_active {
            return Err(self.degrade(NetworkError::ProbeInconsistent(
                "client link and access point still both active".into(),
            )));
        }

        Ok(snapshot)
    }

    async fn observe(&mut self) -> Result<LinkSnapshot, PassOutcome> {
        match self.probe.snapshot().await {
            Ok(snapshot) => Ok(snapshot),
            Err(e) if e.is_fatal() => Err(self.degrade(e)),
            Err(e) => {
                warn!("failed to probe link state: {e}");
                Ok(LinkSnapshot::default())
            }
        }
    }

    fn absorb(&mut self, action: &str, result: NetworkResult<()>) -> Result<(), PassOutcome> {
        match result {
            Ok(()) => Ok(()),
            Err(e) if e.is_fatal() => Err(self.degrade(e)),
            Err(e) => {
                warn!("failed to {action}: {e}");
                Ok(())
            }
        }
    }

    // a read error is indistinguishable from an empty store for the pass
    fn load_credentials(&self) -> (StoredCredentials, Option<String>) {
        match self.store.load() {
            Ok(credentials) => (credentials, None),
            Err(e) => {
                let error = NetworkError::CredentialStore(format!("{e:#}"));
                warn!("{error}, continuing without saved networks");
                (StoredCredentials::default(), Some(error.to_string()))
            }
        }
    }

    fn degrade(&mut self, error: NetworkError) -> PassOutcome {
        error!("network supervision degraded: {error}");

        let reason = error.to_string();
        self.ssid = None;
        self.ip = None;
        self.transition(NetworkMode::Degraded, Some(reason.clone()));

        PassOutcome::Degraded { reason }
    }

    fn transition(&mut self, mode: NetworkMode, detail: Option<String>) {
        if self.mode != mode {
            info!("network mode: {} -> {mode}", self.mode);
        }

        self.mode = mode;
        self.detail = detail;

        if mode != NetworkMode::ClientConnected {
            self.internet_reachable = false;
        }

        self.publish();
    }

    fn publish(&self) {
        let next_retry_secs = match self.mode {
            NetworkMode::ClientConnected | NetworkMode::Degraded => None,
            _ => self.next_wakeup().map(|delay| delay.as_secs()),
        };

        self.status.send_replace(NetworkStatus {
            mode: self.mode,
            ssid: self.ssid.clone(),
            ip: self.ip,
            internet_reachable: self.internet_reachable,
            attempt_count: self.retry.attempt_count,
            next_retry_secs,
            detail: self.detail.clone(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::network::{
        access_point::MockAccessPointDriver, client::MockClientDriver, probe::MockNetworkProbe,
    };
    use mockall::Sequence;
    use std::{fs, sync::Mutex};
    use tempfile::TempDir;

    /// Simulated radio shared by the mocked probe and drivers.
    #[derive(Debug)]
    struct Radio {
        client: Option<String>,
        access_point: bool,
        dns: bool,
        internet: bool,
        joins: Vec<String>,
        driver_calls: u32,
    }

    impl Default for Radio {
        fn default() -> Self {
            Self {
                client: None,
                access_point: false,
                dns: true,
                internet: true,
                joins: vec![],
                driver_calls: 0,
            }
        }
    }

    type SharedRadio = Arc<Mutex<Radio>>;

    fn probe(radio: &SharedRadio) -> MockNetworkProbe {
        let mut probe = MockNetworkProbe::new();

        let shared = radio.clone();
        probe.expect_snapshot().returning(move || {
            let radio = shared.lock().unwrap();
            let snapshot = LinkSnapshot {
                client_ssid: radio.client.clone(),
                access_point_active: radio.access_point,
                ip: if radio.client.is_some() {
                    Some(Ipv4Addr::new(192, 168, 1, 50))
                } else if radio.access_point {
                    Some(Ipv4Addr::new(192, 168, 4, 1))
                } else {
                    None
                },
            };
            Box::pin(async move { Ok(snapshot) })
        });

        let shared = radio.clone();
        probe.expect_check_dns().returning(move || {
            let resolves = shared.lock().unwrap().dns;
            Box::pin(async move {
                if resolves {
                    Ok(())
                } else {
                    Err(NetworkError::command_failed("resolve example.com", "no answer"))
                }
            })
        });

        let shared = radio.clone();
        probe.expect_check_internet().returning(move || {
            let reachable = {
                let radio = shared.lock().unwrap();
                radio.internet && radio.client.is_some()
            };
            Box::pin(async move {
                if reachable {
                    Ok(())
                } else {
                    Err(NetworkError::command_failed("tcp connect", "no host reachable"))
                }
            })
        });

        probe
    }

    fn client(radio: &SharedRadio, joinable: &'static [&'static str]) -> MockClientDriver {
        let mut client = MockClientDriver::new();

        let shared = radio.clone();
        client
            .expect_join()
            .returning(move |network: &SavedNetwork, _timeout| {
                let mut radio = shared.lock().unwrap();
                radio.driver_calls += 1;
                radio.access_point = false;
                radio.joins.push(network.ssid.clone());
                let joined = joinable.contains(&network.ssid.as_str());
                if joined {
                    radio.client = Some(network.ssid.clone());
                }
                Box::pin(async move {
                    if joined {
                        Ok(())
                    } else {
                        Err(NetworkError::command_failed(
                            "nmcli connection up",
                            "exit status 4: activation failed",
                        ))
                    }
                })
            });

        let shared = radio.clone();
        client.expect_configure_dns().returning(move || {
            shared.lock().unwrap().driver_calls += 1;
            Box::pin(async { Ok(()) })
        });

        let shared = radio.clone();
        client.expect_teardown().returning(move || {
            let mut radio = shared.lock().unwrap();
            radio.driver_calls += 1;
            radio.client = None;
            Box::pin(async { Ok(()) })
        });

        client
    }

    fn access_point(radio: &SharedRadio) -> MockAccessPointDriver {
        let mut access_point = MockAccessPointDriver::new();

        let shared = radio.clone();
        access_point
            .expect_start()
            .returning(move |_identity: &ApIdentity| {
                let mut radio = shared.lock().unwrap();
                radio.driver_calls += 1;
                radio.access_point = true;
                Box::pin(async { Ok(()) })
            });

        let shared = radio.clone();
        access_point.expect_stop().returning(move || {
            let mut radio = shared.lock().unwrap();
            radio.driver_calls += 1;
            radio.access_point = false;
            Box::pin(async { Ok(()) })
        });

        access_point
    }

    fn store_with(dir: &TempDir, networks: &[(&str, &str)]) -> Arc<CredentialStore> {
        let store = CredentialStore::new(dir.path().join("wifi.ini"));
        for (ssid, secret) in networks {
            store
                .add_network(SavedNetwork::new(*ssid, *secret))
                .expect("should save network");
        }
        Arc::new(store)
    }

    type TestOrchestrator = Orchestrator<MockNetworkProbe, MockClientDriver, MockAccessPointDriver>;

    fn orchestrator(
        radio: &SharedRadio,
        store: Arc<CredentialStore>,
        joinable: &'static [&'static str],
    ) -> TestOrchestrator {
        Orchestrator::new(
            probe(radio),
            client(radio, joinable),
            access_point(radio),
            store,
            OrchestratorSettings::default(),
        )
    }

    fn assert_exclusive(radio: &SharedRadio, orchestrator: &TestOrchestrator) {
        let radio = radio.lock().unwrap();
        assert!(!(radio.client.is_some() && radio.access_point));
        match orchestrator.mode() {
            NetworkMode::ClientConnected => assert!(!radio.access_point),
            NetworkMode::ApActive => assert!(radio.client.is_none()),
            _ => {}
        }
    }

    #[tokio::test]
    async fn initialize_resolves_unknown() {
        let dir = TempDir::new().expect("failed to create temp directory");
        let radio = SharedRadio::default();
        radio.lock().unwrap().client = Some("Home".into());
        let mut orchestrator = orchestrator(&radio, store_with(&dir, &[]), &[]);

        assert_eq!(orchestrator.mode(), NetworkMode::Unknown);
        assert_eq!(orchestrator.initialize().await, NetworkMode::ClientConnected);

        let status = orchestrator.status();
        assert_eq!(status.ssid.as_deref(), Some("Home"));
        assert!(status.internet_reachable);
        assert_eq!(radio.lock().unwrap().driver_calls, 0);
    }

    #[tokio::test]
    async fn existing_link_without_dns_is_not_adopted() {
        let dir = TempDir::new().expect("failed to create temp directory");
        let radio = SharedRadio::default();
        {
            let mut radio = radio.lock().unwrap();
            radio.client = Some("Home".into());
            radio.dns = false;
        }
        let mut orchestrator = orchestrator(&radio, store_with(&dir, &[("Home", "pw")]), &["Home"]);

        assert_eq!(orchestrator.initialize().await, NetworkMode::Disconnected);
        assert!(!orchestrator.status().internet_reachable);

        let outcome = orchestrator.ensure_connectivity().await;

        assert_eq!(
            outcome,
            PassOutcome::Failed {
                attempt_count: 1,
                next_delay: Duration::from_secs(5)
            }
        );
        assert_ne!(orchestrator.mode(), NetworkMode::ClientConnected);
        assert_eq!(radio.lock().unwrap().joins, vec!["Home"]);
    }

    #[tokio::test]
    async fn initialize_without_link_schedules_immediate_pass() {
        let dir = TempDir::new().expect("failed to create temp directory");
        let radio = SharedRadio::default();
        let mut orchestrator = orchestrator(&radio, store_with(&dir, &[]), &[]);

        assert_eq!(orchestrator.initialize().await, NetworkMode::Disconnected);
        assert_eq!(orchestrator.next_wakeup(), Some(Duration::ZERO));
    }

    #[tokio::test]
    async fn empty_store_goes_straight_to_access_point() {
        let dir = TempDir::new().expect("failed to create temp directory");
        let radio = SharedRadio::default();
        let mut orchestrator = orchestrator(&radio, store_with(&dir, &[]), &[]);

        let outcome = orchestrator.ensure_connectivity().await;

        assert_eq!(
            outcome,
            PassOutcome::AccessPoint {
                reason: FallbackReason::NoSavedNetworks
            }
        );
        assert_eq!(orchestrator.mode(), NetworkMode::ApActive);
        assert_eq!(orchestrator.retry_state().attempt_count, 0);
        assert!(radio.lock().unwrap().joins.is_empty());
        assert_exclusive(&radio, &orchestrator);

        let status = orchestrator.status();
        assert!(status.ssid.unwrap_or_default().starts_with("wifi-setup-"));
        assert_eq!(status.ip, Some(Ipv4Addr::new(192, 168, 4, 1)));
        assert_eq!(status.next_retry_secs, Some(900));

        let calls = radio.lock().unwrap().driver_calls;
        orchestrator.ensure_connectivity().await;
        assert_eq!(radio.lock().unwrap().driver_calls, calls);
    }

    #[tokio::test]
    async fn configured_identity_is_broadcast() {
        let dir = TempDir::new().expect("failed to create temp directory");
        let store = store_with(&dir, &[]);
        store
            .save(&StoredCredentials {
                ap_ssid: Some("radio-setup".into()),
                ap_secret: Some("letmein123".into()),
                ..Default::default()
            })
            .expect("should save");
        let radio = SharedRadio::default();
        let mut orchestrator = Orchestrator::new(
            probe(&radio),
            client(&radio, &[]),
            {
                let mut access_point = MockAccessPointDriver::new();
                access_point
                    .expect_start()
                    .withf(|identity: &ApIdentity| {
                        identity.ssid == "radio-setup"
                            && identity.secret.as_deref() == Some("letmein123")
                    })
                    .times(1)
                    .returning(|_| Box::pin(async { Ok(()) }));
                access_point
            },
            store,
            OrchestratorSettings::default(),
        );

        orchestrator.ensure_connectivity().await;

        assert_eq!(orchestrator.status().ssid.as_deref(), Some("radio-setup"));
    }

    #[tokio::test]
    async fn failing_network_backs_off_then_falls_back_to_access_point() {
        let dir = TempDir::new().expect("failed to create temp directory");
        let radio = SharedRadio::default();
        let mut orchestrator = orchestrator(&radio, store_with(&dir, &[("Home", "pw")]), &[]);
        let mut delays = vec![];

        for pass in 1..=9 {
            match orchestrator.ensure_connectivity().await {
                PassOutcome::Failed {
                    attempt_count,
                    next_delay,
                } => {
                    assert_eq!(attempt_count, pass);
                    delays.push(next_delay.as_secs());
                }
                other => panic!("unexpected outcome of pass {pass}: {other:?}"),
            }
            assert_eq!(orchestrator.mode(), NetworkMode::ClientConnecting);
            assert_exclusive(&radio, &orchestrator);
        }

        assert_eq!(delays, vec![5, 5, 5, 5, 60, 60, 60, 60, 60]);

        let outcome = orchestrator.ensure_connectivity().await;

        assert_eq!(
            outcome,
            PassOutcome::AccessPoint {
                reason: FallbackReason::Exhausted
            }
        );
        assert_eq!(orchestrator.mode(), NetworkMode::ApActive);
        assert_eq!(orchestrator.retry_state().attempt_count, 0);
        assert_eq!(radio.lock().unwrap().joins.len(), 10);
        assert_exclusive(&radio, &orchestrator);
    }

    #[tokio::test]
    async fn all_saved_networks_are_tried_before_counting_a_failure() {
        let dir = TempDir::new().expect("failed to create temp directory");
        let radio = SharedRadio::default();
        let store = store_with(&dir, &[("Home", "a"), ("Office", "b"), ("Cafe", "")]);
        let mut orchestrator = orchestrator(&radio, store, &[]);

        let outcome = orchestrator.ensure_connectivity().await;

        assert_eq!(
            outcome,
            PassOutcome::Failed {
                attempt_count: 1,
                next_delay: Duration::from_secs(5)
            }
        );
        assert_eq!(radio.lock().unwrap().joins, vec!["Home", "Office", "Cafe"]);
        assert_eq!(orchestrator.last_attempts().len(), 3);
        assert!(
            orchestrator
                .status()
                .detail
                .unwrap_or_default()
                .contains("activation failed")
        );
    }

    #[tokio::test]
    async fn second_network_connects_within_one_pass() {
        let dir = TempDir::new().expect("failed to create temp directory");
        let radio = SharedRadio::default();
        let store = store_with(&dir, &[("Home", "a"), ("Office", "b")]);
        let mut orchestrator = orchestrator(&radio, store, &["Office"]);

        // one failed pass first so the reset is visible
        radio.lock().unwrap().internet = false;
        orchestrator.ensure_connectivity().await;
        assert_eq!(orchestrator.retry_state().attempt_count, 1);
        radio.lock().unwrap().internet = true;
        radio.lock().unwrap().client = None;

        let outcome = orchestrator.ensure_connectivity().await;

        assert_eq!(
            outcome,
            PassOutcome::Connected {
                ssid: "Office".into()
            }
        );
        assert_eq!(orchestrator.mode(), NetworkMode::ClientConnected);
        assert_eq!(orchestrator.retry_state().attempt_count, 0);

        let outcomes: Vec<_> = orchestrator
            .last_attempts()
            .iter()
            .map(|attempt| (attempt.target.ssid.as_str(), attempt.outcome.clone()))
            .collect();
        assert!(matches!(
            outcomes.as_slice(),
            [
                ("Home", AttemptOutcome::Failed(_)),
                ("Office", AttemptOutcome::Success)
            ]
        ));

        let status = orchestrator.status();
        assert_eq!(status.ssid.as_deref(), Some("Office"));
        assert!(status.internet_reachable);
        assert_exclusive(&radio, &orchestrator);
    }

    #[tokio::test]
    async fn repeated_ensure_while_connected_is_a_no_op() {
        let dir = TempDir::new().expect("failed to create temp directory");
        let radio = SharedRadio::default();
        let mut orchestrator = orchestrator(&radio, store_with(&dir, &[("Home", "pw")]), &["Home"]);

        orchestrator.ensure_connectivity().await;
        assert_eq!(orchestrator.mode(), NetworkMode::ClientConnected);

        let calls = radio.lock().unwrap().driver_calls;
        let status = orchestrator.status();

        for _ in 0..3 {
            assert_eq!(
                orchestrator.ensure_connectivity().await,
                PassOutcome::AlreadyConnected
            );
        }

        assert_eq!(radio.lock().unwrap().driver_calls, calls);
        assert_eq!(orchestrator.status(), status);
    }

    #[tokio::test]
    async fn lost_internet_disconnects_and_next_pass_starts_fresh() {
        let dir = TempDir::new().expect("failed to create temp directory");
        let radio = SharedRadio::default();
        let mut orchestrator = orchestrator(&radio, store_with(&dir, &[("Home", "pw")]), &["Home"]);

        orchestrator.ensure_connectivity().await;
        assert_eq!(orchestrator.status().ssid.as_deref(), Some("Home"));
        assert_eq!(
            orchestrator.next_wakeup(),
            Some(OrchestratorSettings::default().monitor_interval)
        );

        radio.lock().unwrap().internet = false;

        assert_eq!(
            orchestrator.check_connectivity().await,
            NetworkMode::Disconnected
        );
        assert_eq!(orchestrator.next_wakeup(), Some(Duration::ZERO));
        assert!(!orchestrator.status().internet_reachable);

        let joins = radio.lock().unwrap().joins.len();
        let outcome = orchestrator.ensure_connectivity().await;

        assert_eq!(radio.lock().unwrap().joins.len(), joins + 1);
        assert_eq!(
            outcome,
            PassOutcome::Failed {
                attempt_count: 1,
                next_delay: Duration::from_secs(5)
            }
        );
    }

    #[tokio::test]
    async fn monitor_keeps_healthy_connection() {
        let dir = TempDir::new().expect("failed to create temp directory");
        let radio = SharedRadio::default();
        let mut orchestrator = orchestrator(&radio, store_with(&dir, &[("Home", "pw")]), &["Home"]);

        orchestrator.ensure_connectivity().await;

        assert_eq!(
            orchestrator.check_connectivity().await,
            NetworkMode::ClientConnected
        );
    }

    #[tokio::test]
    async fn both_modes_active_is_remediated() {
        let dir = TempDir::new().expect("failed to create temp directory");
        let radio = SharedRadio::default();
        {
            let mut radio = radio.lock().unwrap();
            radio.client = Some("Home".into());
            radio.access_point = true;
        }
        let mut orchestrator = orchestrator(&radio, store_with(&dir, &[("Home", "pw")]), &["Home"]);

        let outcome = orchestrator.ensure_connectivity().await;

        assert_eq!(outcome, PassOutcome::AlreadyConnected);
        assert_eq!(orchestrator.mode(), NetworkMode::ClientConnected);
        assert!(!radio.lock().unwrap().access_point);
        assert_exclusive(&radio, &orchestrator);
    }

    #[tokio::test]
    async fn persistent_inconsistency_degrades() {
        let dir = TempDir::new().expect("failed to create temp directory");
        let radio = SharedRadio::default();
        let mut probe = MockNetworkProbe::new();
        probe.expect_snapshot().returning(|| {
            Box::pin(async {
                Ok(LinkSnapshot {
                    client_ssid: Some("Home".into()),
                    access_point_active: true,
                    ip: None,
                })
            })
        });
        let mut orchestrator = Orchestrator::new(
            probe,
            client(&radio, &[]),
            access_point(&radio),
            store_with(&dir, &[]),
            OrchestratorSettings::default(),
        );

        let outcome = orchestrator.ensure_connectivity().await;

        assert!(matches!(outcome, PassOutcome::Degraded { .. }));
        assert_eq!(orchestrator.mode(), NetworkMode::Degraded);
        assert!(
            orchestrator
                .status()
                .detail
                .unwrap_or_default()
                .contains("inconsistent")
        );
    }

    #[tokio::test]
    async fn lingering_client_link_degrades_without_starting_access_point() {
        let dir = TempDir::new().expect("failed to create temp directory");
        let mut probe = MockNetworkProbe::new();
        probe.expect_snapshot().returning(|| {
            Box::pin(async {
                Ok(LinkSnapshot {
                    client_ssid: Some("Home".into()),
                    access_point_active: false,
                    ip: None,
                })
            })
        });
        probe
            .expect_check_dns()
            .returning(|| Box::pin(async { Ok(()) }));
        probe.expect_check_internet().returning(|| {
            Box::pin(async { Err(NetworkError::command_failed("tcp connect", "unreachable")) })
        });
        let mut client = MockClientDriver::new();
        client
            .expect_teardown()
            .times(2)
            .returning(|| Box::pin(async { Ok(()) }));
        let mut access_point = MockAccessPointDriver::new();
        access_point.expect_start().never();

        let mut orchestrator = Orchestrator::new(
            probe,
            client,
            access_point,
            store_with(&dir, &[]),
            OrchestratorSettings::default(),
        );

        let outcome = orchestrator.ensure_connectivity().await;

        assert!(matches!(outcome, PassOutcome::Degraded { .. }));
        assert_eq!(orchestrator.mode(), NetworkMode::Degraded);
        assert!(
            orchestrator
                .status()
                .detail
                .unwrap_or_default()
                .contains("client link still up after teardown")
        );
    }

    #[tokio::test]
    async fn access_point_stops_before_client_joins() {
        let dir = TempDir::new().expect("failed to create temp directory");
        let mut seq = Sequence::new();

        let mut probe = MockNetworkProbe::new();
        probe
            .expect_snapshot()
            .returning(|| Box::pin(async { Ok(LinkSnapshot::default()) }));
        probe
            .expect_check_dns()
            .returning(|| Box::pin(async { Ok(()) }));
        probe
            .expect_check_internet()
            .returning(|| Box::pin(async { Ok(()) }));

        let mut access_point = MockAccessPointDriver::new();
        let mut client = MockClientDriver::new();
        access_point
            .expect_stop()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|| Box::pin(async { Ok(()) }));
        client
            .expect_join()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _| Box::pin(async { Ok(()) }));
        client
            .expect_configure_dns()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|| Box::pin(async { Ok(()) }));

        let mut orchestrator = Orchestrator::new(
            probe,
            client,
            access_point,
            store_with(&dir, &[("Home", "pw")]),
            OrchestratorSettings::default(),
        );

        assert_eq!(
            orchestrator.ensure_connectivity().await,
            PassOutcome::Connected {
                ssid: "Home".into()
            }
        );
    }

    #[tokio::test]
    async fn client_is_released_before_access_point_starts() {
        let dir = TempDir::new().expect("failed to create temp directory");
        let mut seq = Sequence::new();

        let mut probe = MockNetworkProbe::new();
        let mut client = MockClientDriver::new();
        let mut access_point = MockAccessPointDriver::new();

        probe
            .expect_snapshot()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|| Box::pin(async { Ok(LinkSnapshot::default()) }));
        client
            .expect_teardown()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|| Box::pin(async { Ok(()) }));
        probe
            .expect_snapshot()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|| Box::pin(async { Ok(LinkSnapshot::default()) }));
        access_point
            .expect_start()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_: &ApIdentity| Box::pin(async { Ok(()) }));
        probe
            .expect_snapshot()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|| {
                Box::pin(async {
                    Ok(LinkSnapshot {
                        client_ssid: None,
                        access_point_active: true,
                        ip: Some(Ipv4Addr::new(192, 168, 4, 1)),
                    })
                })
            });

        let mut orchestrator = Orchestrator::new(
            probe,
            client,
            access_point,
            store_with(&dir, &[]),
            OrchestratorSettings::default(),
        );

        assert_eq!(
            orchestrator.ensure_connectivity().await,
            PassOutcome::AccessPoint {
                reason: FallbackReason::NoSavedNetworks
            }
        );
        assert_eq!(orchestrator.mode(), NetworkMode::ApActive);
    }

    #[tokio::test]
    async fn missing_tool_degrades_until_operator_retries() {
        let dir = TempDir::new().expect("failed to create temp directory");
        let radio = SharedRadio::default();
        let mut client = MockClientDriver::new();
        client
            .expect_join()
            .returning(|_, _| Box::pin(async { Err(NetworkError::tool_missing("nmcli")) }));
        let mut orchestrator = Orchestrator::new(
            probe(&radio),
            client,
            access_point(&radio),
            store_with(&dir, &[("Home", "pw"), ("Office", "pw")]),
            OrchestratorSettings::default(),
        );

        let outcome = orchestrator.ensure_connectivity().await;

        assert_eq!(
            outcome,
            PassOutcome::Degraded {
                reason: "required tool is missing: nmcli".into()
            }
        );
        assert_eq!(orchestrator.last_attempts().len(), 1);
        assert_eq!(orchestrator.retry_state().attempt_count, 0);
        assert_eq!(orchestrator.next_wakeup(), None);
        assert_eq!(orchestrator.status().next_retry_secs, None);

        // an explicit request re-evaluates from Unknown and degrades again
        let outcome = orchestrator.ensure_connectivity().await;
        assert!(matches!(outcome, PassOutcome::Degraded { .. }));
    }

    #[tokio::test]
    async fn cancelled_pass_stops_before_next_candidate() {
        let dir = TempDir::new().expect("failed to create temp directory");
        let radio = SharedRadio::default();
        let mut orchestrator = orchestrator(&radio, store_with(&dir, &[("Home", "pw")]), &["Home"]);

        orchestrator.cancel_flag().store(true, Ordering::SeqCst);

        assert_eq!(
            orchestrator.ensure_connectivity().await,
            PassOutcome::Cancelled
        );
        assert!(radio.lock().unwrap().joins.is_empty());
        assert_eq!(orchestrator.retry_state().attempt_count, 0);
    }

    #[tokio::test]
    async fn forced_access_point_is_pinned() {
        let dir = TempDir::new().expect("failed to create temp directory");
        let radio = SharedRadio::default();
        let mut orchestrator = orchestrator(&radio, store_with(&dir, &[("Home", "pw")]), &["Home"]);

        orchestrator.ensure_connectivity().await;
        orchestrator.cancel_flag().store(true, Ordering::SeqCst);

        assert_eq!(
            orchestrator.force_ap_mode().await,
            PassOutcome::AccessPoint {
                reason: FallbackReason::Forced
            }
        );
        assert_eq!(orchestrator.mode(), NetworkMode::ApActive);
        assert_eq!(orchestrator.next_wakeup(), None);
        assert!(!orchestrator.cancel_flag().load(Ordering::SeqCst));
        assert_exclusive(&radio, &orchestrator);

        assert_eq!(
            orchestrator.ensure_connectivity().await,
            PassOutcome::Connected {
                ssid: "Home".into()
            }
        );
        assert_exclusive(&radio, &orchestrator);
    }

    #[tokio::test]
    async fn failed_ad_hoc_connection_restores_access_point() {
        let dir = TempDir::new().expect("failed to create temp directory");
        let radio = SharedRadio::default();
        let store = store_with(&dir, &[]);
        let mut orchestrator = orchestrator(&radio, store.clone(), &[]);

        orchestrator.ensure_connectivity().await;
        assert_eq!(orchestrator.mode(), NetworkMode::ApActive);

        let outcome = orchestrator
            .connect_to(SavedNetwork::new("Guest", "guestpw"))
            .await;

        assert_eq!(
            outcome,
            PassOutcome::AccessPoint {
                reason: FallbackReason::ConnectFailed
            }
        );
        assert_eq!(orchestrator.mode(), NetworkMode::ApActive);
        assert_eq!(radio.lock().unwrap().joins, vec!["Guest"]);
        assert!(store.saved_networks().unwrap().is_empty());
        assert_exclusive(&radio, &orchestrator);
    }

    #[tokio::test]
    async fn ad_hoc_connection_is_not_saved() {
        let dir = TempDir::new().expect("failed to create temp directory");
        let radio = SharedRadio::default();
        let store = store_with(&dir, &[("Home", "pw")]);
        let mut orchestrator = orchestrator(&radio, store.clone(), &["Guest"]);

        let outcome = orchestrator
            .connect_to(SavedNetwork::new("Guest", "guestpw"))
            .await;

        assert_eq!(
            outcome,
            PassOutcome::Connected {
                ssid: "Guest".into()
            }
        );
        assert_eq!(
            store.saved_networks().unwrap(),
            vec![SavedNetwork::new("Home", "pw")]
        );
    }

    #[tokio::test]
    async fn failed_ad_hoc_connection_without_access_point_disconnects() {
        let dir = TempDir::new().expect("failed to create temp directory");
        let radio = SharedRadio::default();
        let mut orchestrator = orchestrator(&radio, store_with(&dir, &[]), &[]);

        let outcome = orchestrator
            .connect_to(SavedNetwork::new("Guest", "guestpw"))
            .await;

        assert!(matches!(outcome, PassOutcome::Disconnected { .. }));
        assert_eq!(orchestrator.mode(), NetworkMode::Disconnected);
        assert_eq!(orchestrator.next_wakeup(), Some(Duration::from_secs(5)));
    }

    #[tokio::test]
    async fn unreadable_store_falls_back_to_access_point() {
        let dir = TempDir::new().expect("failed to create temp directory");
        let store = store_with(&dir, &[]);
        fs::write(store.path(), "[wifi]\nversion=99\n").unwrap();
        let radio = SharedRadio::default();
        let mut orchestrator = orchestrator(&radio, store, &[]);

        let outcome = orchestrator.ensure_connectivity().await;

        assert_eq!(
            outcome,
            PassOutcome::AccessPoint {
                reason: FallbackReason::NoSavedNetworks
            }
        );
        assert!(
            orchestrator
                .status()
                .detail
                .unwrap_or_default()
                .starts_with("credential store error")
        );
    }

    #[tokio::test]
    async fn failing_access_point_leaves_retry_scheduled() {
        let dir = TempDir::new().expect("failed to create temp directory");
        let radio = SharedRadio::default();
        let mut access_point = MockAccessPointDriver::new();
        access_point.expect_start().returning(|_| {
            Box::pin(async {
                Err(NetworkError::command_failed(
                    "systemctl is-active hostapd",
                    "access point did not come up",
                ))
            })
        });
        let mut orchestrator = Orchestrator::new(
            probe(&radio),
            client(&radio, &[]),
            access_point,
            store_with(&dir, &[]),
            OrchestratorSettings::default(),
        );

        let outcome = orchestrator.ensure_connectivity().await;

        assert!(matches!(outcome, PassOutcome::Disconnected { .. }));
        assert_eq!(orchestrator.mode(), NetworkMode::Disconnected);
        assert_eq!(orchestrator.next_wakeup(), Some(Duration::from_secs(5)));
    }
}
