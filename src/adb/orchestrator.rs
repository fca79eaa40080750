// Per-device connection lifecycle: transport priority, authorization retry,
// reconnection rules and the published state map.
use super::session::{Connector, SessionHandle};
use super::store::DeviceStore;
use super::stream::lock;
use super::transport::Endpoint;
use super::types::{ConnectionState, DeviceTarget, FailureReason, TransportKind};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{Semaphore, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

pub type StateMap = Arc<HashMap<String, ConnectionState>>;

struct Job {
    id: u64,
    token: CancellationToken,
    handle: JoinHandle<()>,
}

struct Inner {
    connector: Arc<dyn Connector>,
    store: Arc<dyn DeviceStore>,
    connect_timeout: Duration,
    permits: Semaphore,
    states: watch::Sender<StateMap>,
    jobs: Mutex<HashMap<String, Job>>,
    sessions: Mutex<HashMap<String, Arc<dyn SessionHandle>>>,
    next_job: AtomicU64,
}

/// Endpoints in the order they are tried: USB, TLS, TCP.
pub fn endpoints(target: &DeviceTarget) -> Vec<Endpoint> {
    let mut endpoints = Vec::with_capacity(3);
    if let Some(usb) = &target.usb {
        endpoints.push(Endpoint::Usb(usb.clone()));
    }
    if let Some(tls) = &target.tls {
        endpoints.push(Endpoint::Tls(tls.clone()));
    }
    if let Some(tcp) = &target.tcp {
        endpoints.push(Endpoint::Tcp(tcp.clone()));
    }
    endpoints
}

/// Whether a higher-priority transport (or a changed address for the one in
/// use) justifies dropping a healthy session.
pub fn transport_priority_changed(
    old: &DeviceTarget,
    new: &DeviceTarget,
    current: Option<TransportKind>,
) -> bool {
    let on_usb = current == Some(TransportKind::Usb);
    let on_tls = current == Some(TransportKind::Tls);
    let on_tcp = current == Some(TransportKind::Tcp);

    (new.usb.is_some() && !on_usb)
        || (new.usb.is_none() && new.tls.is_some() && !on_usb && !on_tls)
        || (old.tls != new.tls && on_tls)
        || (old.tcp != new.tcp && on_tcp)
}

impl Inner {
    fn state(&self, uuid: &str) -> ConnectionState {
        self.states.borrow().get(uuid).copied().unwrap_or_default()
    }

    fn publish(&self, uuid: &str, state: ConnectionState) {
        self.states.send_modify(|map| {
            Arc::make_mut(map).insert(uuid.to_string(), state);
        });
    }

    /// Publish on behalf of a job, unless the job has been superseded. The
    /// session lock orders this against `disconnect_device`.
    fn publish_for_job(&self, token: &CancellationToken, uuid: &str, state: ConnectionState) {
        let _sessions = lock(&self.sessions);
        if !token.is_cancelled() {
            self.publish(uuid, state);
        }
    }

    fn finish_job(&self, uuid: &str, id: u64) {
        let mut jobs = lock(&self.jobs);
        if jobs.get(uuid).is_some_and(|job| job.id == id) {
            jobs.remove(uuid);
        }
    }

    /// One transport: fail fast first, then wait for the user to approve
    /// the key if the device asked for authorization.
    async fn attempt(
        &self,
        token: &CancellationToken,
        uuid: &str,
        endpoint: &Endpoint,
    ) -> Result<Arc<dyn SessionHandle>, FailureReason> {
        log::debug!("Attempting {endpoint} for device {uuid}");
        match self
            .connector
            .connect(endpoint, self.connect_timeout, true)
            .await
        {
            Ok(session) => Ok(session),
            Err(e) if e.is_auth_required() => {
                log::debug!("{endpoint} for device {uuid}: authorization required, waiting for approval");
                self.publish_for_job(token, uuid, ConnectionState::ConnectingAwaitingAuthorization);
                self.connector
                    .connect(endpoint, self.connect_timeout, false)
                    .await
                    .map_err(|e| {
                        log::debug!("{endpoint} for device {uuid}: second attempt failed: {e}");
                        FailureReason::Unauthorized
                    })
            }
            Err(e) => {
                let reason = e.failure_reason();
                log::debug!("{endpoint} for device {uuid} failed ({reason:?}): {e}");
                Err(reason)
            }
        }
    }

    async fn run_connect(&self, target: &DeviceTarget, token: &CancellationToken) {
        let uuid = target.uuid.as_str();
        let Ok(_permit) = self.permits.acquire().await else {
            log::debug!("Orchestrator shut down, not connecting {uuid}");
            return;
        };

        let mut last_failure = FailureReason::Unknown;
        for endpoint in endpoints(target) {
            let session = match self.attempt(token, uuid, &endpoint).await {
                Ok(session) => session,
                Err(reason) => {
                    last_failure = reason;
                    continue;
                }
            };
            if !session.is_established().await {
                log::debug!("{endpoint} for device {uuid} connected but not established");
                session.close().await;
                last_failure = FailureReason::Unknown;
                continue;
            }
            let kind = session
                .transport_kind()
                .await
                .unwrap_or_else(|| endpoint.requested_kind());
            let state = ConnectionState::connected(kind);

            let stored = {
                let mut sessions = lock(&self.sessions);
                if token.is_cancelled() {
                    false
                } else {
                    sessions.insert(uuid.to_string(), session.clone());
                    self.publish(uuid, state);
                    true
                }
            };
            if !stored {
                session.close().await;
                return;
            }
            log::info!("Device {uuid} connected via {state:?}");

            if !target.identified {
                self.spawn_identify(uuid, session);
            }
            return;
        }

        log::warn!("All connection methods failed for device {uuid}, last failure: {last_failure:?}");
        self.publish_for_job(token, uuid, ConnectionState::failed(last_failure));
    }

    fn spawn_identify(&self, uuid: &str, session: Arc<dyn SessionHandle>) {
        let store = self.store.clone();
        let uuid = uuid.to_string();
        tokio::spawn(async move {
            match session.identify().await {
                Ok(identity) => {
                    log::info!("Identified device {uuid}: {} {}", identity.brand, identity.model);
                    store.apply_identification(&uuid, &identity).await;
                }
                Err(e) => log::warn!("Failed to identify device {uuid}: {e}"),
            }
        });
    }
}

/// Owns every device's connection job and session, and publishes the
/// resulting state map.
#[derive(Clone)]
pub struct ConnectionOrchestrator {
    inner: Arc<Inner>,
}

impl ConnectionOrchestrator {
    pub fn new(
        connector: Arc<dyn Connector>,
        store: Arc<dyn DeviceStore>,
        connect_timeout: Duration,
        max_concurrent_connects: usize,
    ) -> Self {
        let (states, _) = watch::channel(StateMap::default());
        Self {
            inner: Arc::new(Inner {
                connector,
                store,
                connect_timeout,
                permits: Semaphore::new(max_concurrent_connects.max(1)),
                states,
                jobs: Mutex::new(HashMap::new()),
                sessions: Mutex::new(HashMap::new()),
                next_job: AtomicU64::new(1),
            }),
        }
    }

    pub fn state(&self, uuid: &str) -> ConnectionState {
        self.inner.state(uuid)
    }

    pub fn states(&self) -> StateMap {
        self.inner.states.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<StateMap> {
        self.inner.states.subscribe()
    }

    pub fn session(&self, uuid: &str) -> Option<Arc<dyn SessionHandle>> {
        lock(&self.inner.sessions).get(uuid).cloned()
    }

    /// Start connecting `target` in the background, superseding any earlier
    /// attempt. Does nothing while an attempt is already `Connecting`.
    pub fn connect_device(&self, target: DeviceTarget) {
        let uuid = target.uuid.clone();
        if self.inner.state(&uuid) == ConnectionState::Connecting {
            log::debug!("Device {uuid} is already connecting");
            return;
        }

        let mut jobs = lock(&self.inner.jobs);
        if let Some(previous) = jobs.remove(&uuid) {
            previous.token.cancel();
        }
        self.inner.publish(&uuid, ConnectionState::Connecting);

        let id = self.inner.next_job.fetch_add(1, Ordering::Relaxed);
        let token = CancellationToken::new();
        let inner = self.inner.clone();
        let job_token = token.clone();
        let handle = tokio::spawn(async move {
            tokio::select! {
                _ = job_token.cancelled() => {
                    log::debug!("Connection job for {} cancelled", target.uuid);
                }
                _ = inner.run_connect(&target, &job_token) => {}
            }
            inner.finish_job(&target.uuid, id);
        });
        jobs.insert(uuid, Job { id, token, handle });
    }

    /// Reconnect only when the current session is missing or unhealthy, or a
    /// better transport became available; otherwise leave it alone.
    pub async fn reconnect_device(&self, old: &DeviceTarget, new: DeviceTarget) {
        let uuid = new.uuid.clone();
        let session = self.session(&uuid);
        let should_reconnect = match session {
            None => true,
            Some(_) if !self.inner.state(&uuid).is_connected() => true,
            Some(session) => {
                !session.is_connected().await
                    || !session.is_established().await
                    || transport_priority_changed(old, &new, session.transport_kind().await)
            }
        };

        if should_reconnect {
            log::debug!("Device connection needs update for {uuid}, reconnecting");
            self.disconnect_device(&uuid);
            self.connect_device(new);
        } else {
            log::debug!("Device connection unchanged for {uuid}, keeping existing session");
        }
    }

    /// Cancel any attempt, close the session in the background and publish
    /// `Disconnected`. Safe to call repeatedly.
    pub fn disconnect_device(&self, uuid: &str) {
        if let Some(job) = lock(&self.inner.jobs).remove(uuid) {
            job.token.cancel();
        }
        let session = {
            let mut sessions = lock(&self.inner.sessions);
            let session = sessions.remove(uuid);
            self.inner.publish(uuid, ConnectionState::Disconnected);
            session
        };
        if let Some(session) = session {
            let uuid = uuid.to_string();
            tokio::spawn(async move {
                session.close().await;
                log::debug!("Closed session for device {uuid}");
            });
        }
        log::debug!("Disconnected device {uuid}");
    }

    /// Cancel every job, close every session and refuse further connects.
    pub async fn shutdown(&self) {
        self.inner.permits.close();
        let jobs: Vec<(String, Job)> = lock(&self.inner.jobs).drain().collect();
        for (_, job) in &jobs {
            job.token.cancel();
        }
        for (uuid, job) in jobs {
            if let Err(e) = job.handle.await {
                log::warn!("Connection job for {uuid} ended abnormally: {e}");
            }
            if !lock(&self.inner.sessions).contains_key(&uuid) {
                self.inner.publish(&uuid, ConnectionState::Disconnected);
            }
        }

        let sessions: Vec<(String, Arc<dyn SessionHandle>)> =
            lock(&self.inner.sessions).drain().collect();
        for (uuid, session) in sessions {
            session.close().await;
            self.inner.publish(&uuid, ConnectionState::Disconnected);
        }
        log::info!("Connection orchestrator shut down");
    }
}
