// Process-scoped engine: owns the orchestrator, discovery services and
// pairing, with explicit init and shutdown.
use super::auth::AdbKeyPair;
use super::discovery::{DiscoveryBackend, DiscoveryService};
use super::error::{AdbError, AdbResult};
use super::orchestrator::ConnectionOrchestrator;
use super::pairing::{
    PairingAuthFactory, PairingClient, PairingOutcome, QrPairing, QrPairingMatcher, TcpProbe,
};
use super::session::{SessionConnector, SessionSettings};
use super::store::DeviceStore;
use super::stream::lock;
use super::tls;
use super::types::ServiceType;
use crate::config::AdbConfig;
use std::sync::{Arc, Mutex};
use tokio::sync::watch;
use tokio::task::JoinHandle;

struct Pairing {
    client: Arc<PairingClient>,
    qr: Arc<QrPairingMatcher>,
    watcher: JoinHandle<()>,
}

pub struct AdbEngine {
    config: AdbConfig,
    key: Arc<dyn AdbKeyPair>,
    store: Arc<dyn DeviceStore>,
    tls: Arc<rustls::ClientConfig>,
    orchestrator: ConnectionOrchestrator,
    discovery: [Arc<DiscoveryService>; 3],
    pairing: Mutex<Option<Pairing>>,
}

impl AdbEngine {
    pub fn init(
        config: AdbConfig,
        key: Arc<dyn AdbKeyPair>,
        store: Arc<dyn DeviceStore>,
        backend: Arc<dyn DiscoveryBackend>,
    ) -> AdbResult<Self> {
        let tls = tls::client_config(key.as_ref())?;
        let settings = SessionSettings {
            tls: Some(tls.clone()),
            enable_delayed_ack: config.enable_delayed_ack,
            usb_open_attempts: config.usb_open_attempts,
        };
        let connector = Arc::new(SessionConnector::new(key.clone(), settings));
        let orchestrator = ConnectionOrchestrator::new(
            connector,
            store.clone(),
            config.connect_timeout,
            config.max_concurrent_connects,
        );
        let discovery = ServiceType::ALL
            .map(|ty| Arc::new(DiscoveryService::new(ty, backend.clone(), config.resolve_mode)));

        log::info!("ADB engine initialised (key {})", key.key_name());
        Ok(Self {
            config,
            key,
            store,
            tls,
            orchestrator,
            discovery,
            pairing: Mutex::new(None),
        })
    }

    /// Enable pairing with the given SPAKE2 implementation. QR pairing
    /// follows the `tls-pairing` discovery service from here on.
    pub fn enable_pairing(&self, factory: Arc<dyn PairingAuthFactory>) {
        let client = Arc::new(PairingClient::new(
            self.key.clone(),
            self.tls.clone(),
            factory,
            self.store.clone(),
            self.config.pairing_timeout,
        ));
        let qr = Arc::new(QrPairingMatcher::new(
            client.clone(),
            Arc::new(TcpProbe::default()),
        ));
        let watcher = qr.watch(self.discovery(ServiceType::TlsPairing).subscribe());
        if let Some(previous) = lock(&self.pairing).replace(Pairing {
            client,
            qr,
            watcher,
        }) {
            previous.watcher.abort();
        }
    }

    pub fn config(&self) -> &AdbConfig {
        &self.config
    }

    pub fn orchestrator(&self) -> &ConnectionOrchestrator {
        &self.orchestrator
    }

    pub fn discovery(&self, service_type: ServiceType) -> &DiscoveryService {
        let index = match service_type {
            ServiceType::Adb => 0,
            ServiceType::TlsPairing => 1,
            ServiceType::TlsConnect => 2,
        };
        &self.discovery[index]
    }

    pub async fn start_discovery(&self) -> AdbResult<()> {
        for service in &self.discovery {
            service.start().await?;
        }
        Ok(())
    }

    pub async fn stop_discovery(&self) {
        for service in &self.discovery {
            service.stop().await;
        }
    }

    fn pairing_parts(&self) -> AdbResult<(Arc<PairingClient>, Arc<QrPairingMatcher>)> {
        lock(&self.pairing)
            .as_ref()
            .map(|p| (p.client.clone(), p.qr.clone()))
            .ok_or_else(|| AdbError::Pairing {
                description: "pairing is not enabled".to_string(),
            })
    }

    /// Pair using a code typed in by the user.
    pub async fn pair(&self, host: &str, port: u16, code: &str) -> AdbResult<PairingOutcome> {
        let (client, _) = self.pairing_parts()?;
        client.pair(host, port, code).await
    }

    /// Generate a QR code to scan from the device's wireless debugging
    /// screen. The outcome arrives on `qr_pairing_result`.
    pub fn begin_qr_pairing(&self) -> AdbResult<QrPairing> {
        let (_, qr) = self.pairing_parts()?;
        Ok(qr.begin())
    }

    pub fn qr_pairing_result(&self) -> AdbResult<watch::Receiver<Option<PairingOutcome>>> {
        let (_, qr) = self.pairing_parts()?;
        Ok(qr.subscribe())
    }

    /// Cancel all device jobs, close all sessions and stop discovery.
    pub async fn shutdown(&self) {
        if let Some(pairing) = lock(&self.pairing).take() {
            pairing.qr.cancel();
            pairing.watcher.abort();
        }
        self.orchestrator.shutdown().await;
        self.stop_discovery().await;
        log::info!("ADB engine shut down");
    }
}
