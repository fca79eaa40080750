// One device session: owns a single transport, serializes connect/open/close
use super::auth::AdbKeyPair;
use super::connection::{AdbConnection, HandshakeOptions};
use super::error::{AdbError, AdbResult};
use super::shell;
use super::stream::{AdbStream, lock};
use super::sync::{self, ProgressFn, SyncFeatures, SyncSession};
use super::transport::{self, Endpoint};
use super::types::{DeviceIdentity, FileEntry, StatResult, TransportKind};
use async_trait::async_trait;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;

/// Well-known service prefixes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LocalService {
    Shell,
    Exec,
    Sync,
    Abb,
}

impl LocalService {
    pub fn prefix(&self) -> &'static str {
        match self {
            LocalService::Shell => "shell:",
            LocalService::Exec => "exec:",
            LocalService::Sync => "sync:",
            LocalService::Abb => "abb:",
        }
    }

    /// `shell:` + `["getprop", "ro.serialno"]` -> `shell:getprop ro.serialno`
    pub fn destination(&self, args: &[&str]) -> String {
        format!("{}{}", self.prefix(), args.join(" "))
    }
}

#[derive(Clone)]
pub struct SessionSettings {
    pub tls: Option<Arc<rustls::ClientConfig>>,
    pub enable_delayed_ack: bool,
    pub usb_open_attempts: u32,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            tls: None,
            enable_delayed_ack: false,
            usb_open_attempts: 3,
        }
    }
}

#[derive(Default)]
struct SessionInner {
    connection: Option<Arc<AdbConnection>>,
    pairing_required: bool,
}

/// The lock over `inner` is never held across an await; `connecting`
/// serializes handshakes and `closes` counts `close()` calls so a
/// handshake in flight can notice it was abandoned.
pub struct Session {
    key: Arc<dyn AdbKeyPair>,
    settings: SessionSettings,
    inner: Mutex<SessionInner>,
    connecting: tokio::sync::Mutex<()>,
    closes: watch::Sender<u64>,
}

impl Session {
    pub fn new(key: Arc<dyn AdbKeyPair>, settings: SessionSettings) -> Self {
        Self {
            key,
            settings,
            inner: Mutex::new(SessionInner::default()),
            connecting: tokio::sync::Mutex::new(()),
            closes: watch::Sender::new(0),
        }
    }

    fn connection(&self) -> Option<Arc<AdbConnection>> {
        lock(&self.inner).connection.clone()
    }

    /// Connect over `endpoint`. Returns `Ok(false)` without doing anything if
    /// the session is already connected. With `fail_fast_on_auth` an unknown
    /// key surfaces as `AuthenticationRequired`; without it the handshake
    /// waits up to `timeout` for the user to accept the key.
    pub async fn connect(
        &self,
        endpoint: &Endpoint,
        timeout: Duration,
        fail_fast_on_auth: bool,
    ) -> AdbResult<bool> {
        let _connecting = self.connecting.lock().await;
        let mut closes = self.closes.subscribe();
        let stale = {
            let mut inner = lock(&self.inner);
            if inner.connection.as_ref().is_some_and(|c| c.is_alive()) {
                return Ok(false);
            }
            inner.connection.take()
        };
        if let Some(connection) = stale {
            connection.close().await;
        }

        let attempt = async {
            let io = transport::open(endpoint, self.settings.usb_open_attempts).await?;
            let kind = match endpoint {
                Endpoint::Usb(_) => TransportKind::Usb,
                Endpoint::Tls(_) | Endpoint::Tcp(_) => TransportKind::Tcp,
            };
            let options = HandshakeOptions {
                key: self.key.as_ref(),
                tls: self.settings.tls.clone(),
                host: endpoint.host(),
                fail_fast_on_auth,
                enable_delayed_ack: self.settings.enable_delayed_ack,
            };
            AdbConnection::handshake(io, kind, options).await
        };

        let outcome = tokio::select! {
            outcome = tokio::time::timeout(timeout, attempt) => outcome,
            _ = closes.changed() => {
                log::debug!("Session closed while connecting to {endpoint}");
                return Err(AdbError::ConnectionClosed);
            }
        };

        match outcome {
            Ok(Ok(connection)) => {
                let connection = Arc::new(connection);
                {
                    let mut inner = lock(&self.inner);
                    if !closes.has_changed().unwrap_or(true) {
                        inner.pairing_required = false;
                        inner.connection = Some(connection);
                        return Ok(true);
                    }
                }
                connection.close().await;
                Err(AdbError::ConnectionClosed)
            }
            Ok(Err(AdbError::PairingRequired)) => {
                lock(&self.inner).pairing_required = true;
                Err(AdbError::PairingRequired)
            }
            Ok(Err(e)) => Err(e),
            Err(_) => Err(AdbError::timeout(timeout, format!("connecting to {endpoint}"))),
        }
    }

    pub async fn is_connected(&self) -> bool {
        self.connection().is_some_and(|c| c.is_alive())
    }

    /// The CNXN exchange has completed on a live transport.
    pub async fn is_established(&self) -> bool {
        self.is_connected().await
    }

    /// The transport actually in use, or `None` when disconnected.
    pub async fn transport_kind(&self) -> Option<TransportKind> {
        self.connection().map(|c| c.transport_kind())
    }

    pub async fn features(&self) -> AdbResult<SyncFeatures> {
        let connection = self.connection().ok_or(AdbError::NotConnected)?;
        Ok(SyncFeatures::from_banner(connection.banner()))
    }

    pub async fn has_feature(&self, feature: &str) -> bool {
        self.connection()
            .is_some_and(|c| c.banner().has_feature(feature))
    }

    pub async fn open_stream(&self, destination: &str) -> AdbResult<AdbStream> {
        let connection = {
            let inner = lock(&self.inner);
            match inner.connection.as_ref() {
                Some(connection) if connection.is_alive() => connection.clone(),
                _ if inner.pairing_required => return Err(AdbError::PairingRequired),
                _ => return Err(AdbError::NotConnected),
            }
        };
        connection.open_stream(destination).await
    }

    pub async fn open_service(&self, service: LocalService, args: &[&str]) -> AdbResult<AdbStream> {
        self.open_stream(&service.destination(args)).await
    }

    /// Idempotent; releases the transport. Opens and handshakes in flight
    /// fail with `ConnectionClosed`.
    pub async fn close(&self) {
        self.closes.send_modify(|closes| *closes += 1);
        let connection = lock(&self.inner).connection.take();
        if let Some(connection) = connection {
            connection.close().await;
            log::debug!("Session closed");
        }
    }

    async fn open_sync(&self) -> AdbResult<SyncSession<AdbStream>> {
        let features = self.features().await?;
        let stream = self.open_service(LocalService::Sync, &[]).await?;
        Ok(SyncSession::new(stream, features))
    }

    pub async fn shell(&self, command: &str) -> AdbResult<String> {
        shell::run_command(self, command).await
    }

    pub async fn stat(&self, remote: &str) -> AdbResult<StatResult> {
        let mut sync = self.open_sync().await?;
        let result = sync.stat(remote).await;
        sync.finish().await;
        result
    }

    pub async fn lstat(&self, remote: &str) -> AdbResult<StatResult> {
        let mut sync = self.open_sync().await?;
        let result = sync.lstat(remote).await;
        sync.finish().await;
        result
    }

    pub async fn list_files(&self, remote: &str) -> AdbResult<Vec<FileEntry>> {
        let mut sync = self.open_sync().await?;
        let result = sync.list(remote).await;
        sync.finish().await;
        result
    }

    /// Upload a local file. `mode` is an octal string, `"0644"` by default.
    pub async fn push_file(
        &self,
        local: &Path,
        remote: &str,
        mode: Option<&str>,
        progress: Option<ProgressFn<'_>>,
    ) -> AdbResult<()> {
        let mut file = tokio::fs::File::open(local).await?;
        let size = file.metadata().await?.len();
        let mode = mode.unwrap_or(sync::DEFAULT_FILE_MODE);

        let mut sync = self.open_sync().await?;
        let result = sync
            .send_file(remote, mode, &mut file, size, sync::unix_now(), progress)
            .await;
        sync.finish().await;
        result
    }

    /// Download a remote file into `local`, or discard the bytes when
    /// `local` is `None`. Returns the number of bytes received.
    pub async fn pull_file(
        &self,
        remote: &str,
        local: Option<&Path>,
        progress: Option<ProgressFn<'_>>,
    ) -> AdbResult<u64> {
        let total = match self.stat(remote).await {
            Ok(stat) if stat.exists() => stat.size,
            Ok(_) => None,
            Err(e) => {
                log::warn!("Failed to stat {remote} for progress reporting: {e}");
                None
            }
        };

        let mut sync = self.open_sync().await?;
        let mut file = match local {
            Some(path) => match tokio::fs::File::create(path).await {
                Ok(file) => Some(file),
                Err(e) => {
                    sync.finish().await;
                    return Err(e.into());
                }
            },
            None => None,
        };

        let result = sync.recv_file(remote, file.as_mut(), total, progress).await;
        sync.finish().await;
        drop(file);
        if let (Err(e), Some(path)) = (&result, local) {
            log::debug!("Pull of {remote} failed ({e}), removing {}", path.display());
            if let Err(e) = tokio::fs::remove_file(path).await {
                log::warn!("Failed to remove partial file {}: {e}", path.display());
            }
        }
        result
    }
}

/// What the orchestrator needs from a live session.
#[async_trait]
pub trait SessionHandle: Send + Sync {
    async fn transport_kind(&self) -> Option<TransportKind>;
    async fn is_connected(&self) -> bool;
    async fn is_established(&self) -> bool;
    async fn identify(&self) -> AdbResult<DeviceIdentity>;
    async fn close(&self);

    /// The concrete session, for shell and file operations.
    fn session(&self) -> Option<&Session> {
        None
    }
}

#[async_trait]
impl SessionHandle for Session {
    async fn transport_kind(&self) -> Option<TransportKind> {
        Session::transport_kind(self).await
    }

    async fn is_connected(&self) -> bool {
        Session::is_connected(self).await
    }

    async fn is_established(&self) -> bool {
        Session::is_established(self).await
    }

    async fn identify(&self) -> AdbResult<DeviceIdentity> {
        shell::identify(self).await
    }

    async fn close(&self) {
        Session::close(self).await
    }

    fn session(&self) -> Option<&Session> {
        Some(self)
    }
}

/// Creates sessions for the orchestrator.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(
        &self,
        endpoint: &Endpoint,
        timeout: Duration,
        fail_fast_on_auth: bool,
    ) -> AdbResult<Arc<dyn SessionHandle>>;
}

pub struct SessionConnector {
    key: Arc<dyn AdbKeyPair>,
    settings: SessionSettings,
}

impl SessionConnector {
    pub fn new(key: Arc<dyn AdbKeyPair>, settings: SessionSettings) -> Self {
        Self { key, settings }
    }
}

#[async_trait]
impl Connector for SessionConnector {
    async fn connect(
        &self,
        endpoint: &Endpoint,
        timeout: Duration,
        fail_fast_on_auth: bool,
    ) -> AdbResult<Arc<dyn SessionHandle>> {
        let session = Session::new(self.key.clone(), self.settings.clone());
        session.connect(endpoint, timeout, fail_fast_on_auth).await?;
        Ok(Arc::new(session))
    }
}
