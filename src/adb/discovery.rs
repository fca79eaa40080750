// Multicast service discovery for wireless debugging.
//
// One DiscoveryService per service type. Backend events are applied by a
// single pump task, so the record list has exactly one writer; observers get
// full snapshots through a watch channel.
use super::error::{AdbError, AdbResult};
use super::stream::lock;
use super::types::{DiscoveryRecord, ServiceType};
use async_trait::async_trait;
use mdns_sd::{ServiceDaemon, ServiceEvent};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DiscoveryState {
    #[default]
    Stopped,
    Starting,
    Started,
    Stopping,
}

#[derive(Debug, Clone, PartialEq)]
pub enum BackendEvent {
    BrowseStarted,
    BrowseFailed(String),
    BrowseStopped,
    Found(String),
    Resolved(DiscoveryRecord),
    Lost(String),
}

pub type EventSender = mpsc::UnboundedSender<BackendEvent>;
pub type Snapshot = Arc<Vec<DiscoveryRecord>>;

/// Platform discovery primitives.
#[async_trait]
pub trait DiscoveryBackend: Send + Sync {
    async fn start_browse(&self, service_type: ServiceType, events: EventSender) -> AdbResult<()>;
    async fn stop_browse(&self, service_type: ServiceType) -> AdbResult<()>;
    /// Ask for continuous `Resolved`/`Lost` updates for one instance.
    async fn subscribe(&self, service_type: ServiceType, name: &str, events: EventSender) -> AdbResult<()>;
    async fn unsubscribe(&self, service_type: ServiceType, name: &str);
    /// Resolve an instance once.
    async fn resolve(&self, service_type: ServiceType, name: &str) -> AdbResult<DiscoveryRecord>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ResolveMode {
    #[default]
    Subscribe,
    OneShot,
}

impl ResolveMode {
    pub fn resolver(self) -> Arc<dyn InstanceResolver> {
        match self {
            ResolveMode::Subscribe => Arc::new(SubscribeResolver::default()),
            ResolveMode::OneShot => Arc::new(OneShotResolver),
        }
    }
}

/// How a found instance gets turned into resolved records.
#[async_trait]
pub trait InstanceResolver: Send + Sync {
    async fn on_found(&self, backend: &Arc<dyn DiscoveryBackend>, service_type: ServiceType, name: &str, events: &EventSender);
    async fn on_lost(&self, backend: &Arc<dyn DiscoveryBackend>, service_type: ServiceType, name: &str);
    async fn reset(&self, backend: &Arc<dyn DiscoveryBackend>, service_type: ServiceType);
}

fn spawn_resolve(backend: &Arc<dyn DiscoveryBackend>, service_type: ServiceType, name: &str, events: &EventSender) {
    let backend = backend.clone();
    let events = events.clone();
    let name = name.to_string();
    tokio::spawn(async move {
        match backend.resolve(service_type, &name).await {
            Ok(record) => {
                let _ = events.send(BackendEvent::Resolved(record));
            }
            Err(e) => log::debug!("{service_type}: resolve of '{name}' failed: {e}"),
        }
    });
}

pub struct OneShotResolver;

#[async_trait]
impl InstanceResolver for OneShotResolver {
    async fn on_found(&self, backend: &Arc<dyn DiscoveryBackend>, service_type: ServiceType, name: &str, events: &EventSender) {
        spawn_resolve(backend, service_type, name, events);
    }

    async fn on_lost(&self, _backend: &Arc<dyn DiscoveryBackend>, _service_type: ServiceType, _name: &str) {}

    async fn reset(&self, _backend: &Arc<dyn DiscoveryBackend>, _service_type: ServiceType) {}
}

/// Subscribes for live updates, falling back to a one-shot resolve when the
/// backend refuses the subscription.
#[derive(Default)]
pub struct SubscribeResolver {
    subscribed: Mutex<HashSet<String>>,
}

#[async_trait]
impl InstanceResolver for SubscribeResolver {
    async fn on_found(&self, backend: &Arc<dyn DiscoveryBackend>, service_type: ServiceType, name: &str, events: &EventSender) {
        match backend.subscribe(service_type, name, events.clone()).await {
            Ok(()) => {
                lock(&self.subscribed).insert(name.to_string());
            }
            Err(e) => {
                log::debug!("{service_type}: subscription for '{name}' failed ({e}), resolving once");
                spawn_resolve(backend, service_type, name, events);
            }
        }
    }

    async fn on_lost(&self, backend: &Arc<dyn DiscoveryBackend>, service_type: ServiceType, name: &str) {
        if lock(&self.subscribed).remove(name) {
            backend.unsubscribe(service_type, name).await;
        }
    }

    async fn reset(&self, backend: &Arc<dyn DiscoveryBackend>, service_type: ServiceType) {
        let names: Vec<String> = lock(&self.subscribed).drain().collect();
        for name in names {
            backend.unsubscribe(service_type, &name).await;
        }
    }
}

struct Inner {
    state: DiscoveryState,
    records: Vec<DiscoveryRecord>,
}

struct Shared {
    service_type: ServiceType,
    backend: Arc<dyn DiscoveryBackend>,
    resolver: Arc<dyn InstanceResolver>,
    inner: Mutex<Inner>,
    state_tx: watch::Sender<DiscoveryState>,
    records_tx: watch::Sender<Snapshot>,
}

impl Shared {
    fn set_state(&self, inner: &mut Inner, state: DiscoveryState) {
        inner.state = state;
        self.state_tx.send_replace(state);
    }

    fn publish(&self, inner: &Inner) {
        self.records_tx.send_replace(Arc::new(inner.records.clone()));
    }

    fn apply(&self, event: &BackendEvent) {
        let mut inner = lock(&self.inner);
        match event {
            BackendEvent::BrowseStarted => {
                if inner.state == DiscoveryState::Starting {
                    log::debug!("{}: discovery started", self.service_type);
                    self.set_state(&mut inner, DiscoveryState::Started);
                }
            }
            BackendEvent::BrowseFailed(reason) => {
                log::warn!("{}: discovery failed: {reason}", self.service_type);
                self.set_state(&mut inner, DiscoveryState::Stopped);
            }
            BackendEvent::BrowseStopped => {
                self.set_state(&mut inner, DiscoveryState::Stopped);
            }
            BackendEvent::Resolved(record) => {
                if matches!(inner.state, DiscoveryState::Stopped | DiscoveryState::Stopping) {
                    log::debug!("{}: '{}' resolved after stop, ignored", self.service_type, record.name);
                    return;
                }
                match inner.records.iter_mut().find(|r| r.name == record.name) {
                    Some(existing) => *existing = record.clone(),
                    None => inner.records.push(record.clone()),
                }
                self.publish(&inner);
            }
            BackendEvent::Lost(name) => {
                let before = inner.records.len();
                inner.records.retain(|r| &r.name != name);
                if inner.records.len() != before {
                    self.publish(&inner);
                }
            }
            BackendEvent::Found(_) => {}
        }
    }
}

async fn pump(shared: Arc<Shared>, mut events: mpsc::UnboundedReceiver<BackendEvent>, sender: EventSender) {
    while let Some(event) = events.recv().await {
        shared.apply(&event);
        match event {
            BackendEvent::Found(name) => {
                shared
                    .resolver
                    .on_found(&shared.backend, shared.service_type, &name, &sender)
                    .await;
            }
            BackendEvent::Lost(name) => {
                shared
                    .resolver
                    .on_lost(&shared.backend, shared.service_type, &name)
                    .await;
            }
            _ => {}
        }
    }
}

pub struct DiscoveryService {
    shared: Arc<Shared>,
    pump: Mutex<Option<JoinHandle<()>>>,
}

impl DiscoveryService {
    pub fn new(service_type: ServiceType, backend: Arc<dyn DiscoveryBackend>, mode: ResolveMode) -> Self {
        let (state_tx, _) = watch::channel(DiscoveryState::Stopped);
        let (records_tx, _) = watch::channel(Snapshot::default());
        Self {
            shared: Arc::new(Shared {
                service_type,
                backend,
                resolver: mode.resolver(),
                inner: Mutex::new(Inner {
                    state: DiscoveryState::Stopped,
                    records: Vec::new(),
                }),
                state_tx,
                records_tx,
            }),
            pump: Mutex::new(None),
        }
    }

    pub fn service_type(&self) -> ServiceType {
        self.shared.service_type
    }

    pub fn state(&self) -> DiscoveryState {
        lock(&self.shared.inner).state
    }

    pub fn watch_state(&self) -> watch::Receiver<DiscoveryState> {
        self.shared.state_tx.subscribe()
    }

    /// Full record list on every change.
    pub fn subscribe(&self) -> watch::Receiver<Snapshot> {
        self.shared.records_tx.subscribe()
    }

    pub fn snapshot(&self) -> Snapshot {
        self.shared.records_tx.borrow().clone()
    }

    /// Begin browsing. Does nothing unless currently stopped.
    pub async fn start(&self) -> AdbResult<()> {
        let service_type = self.shared.service_type;
        {
            let mut inner = lock(&self.shared.inner);
            if inner.state != DiscoveryState::Stopped {
                log::debug!("{service_type}: discovery already {:?}", inner.state);
                return Ok(());
            }
            inner.records.clear();
            self.shared.set_state(&mut inner, DiscoveryState::Starting);
        }

        let (tx, rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(pump(self.shared.clone(), rx, tx.clone()));
        if let Some(old) = lock(&self.pump).replace(task) {
            old.abort();
        }

        if let Err(e) = self.shared.backend.start_browse(service_type, tx).await {
            log::warn!("{service_type}: failed to start discovery: {e}");
            if let Some(task) = lock(&self.pump).take() {
                task.abort();
            }
            let mut inner = lock(&self.shared.inner);
            self.shared.set_state(&mut inner, DiscoveryState::Stopped);
            return Err(e);
        }
        Ok(())
    }

    /// Stop browsing from any state; always ends stopped with an empty
    /// snapshot published.
    pub async fn stop(&self) {
        let service_type = self.shared.service_type;
        let previous = {
            let mut inner = lock(&self.shared.inner);
            let previous = inner.state;
            self.shared.set_state(&mut inner, DiscoveryState::Stopping);
            previous
        };

        if matches!(previous, DiscoveryState::Started | DiscoveryState::Starting)
            && let Err(e) = self.shared.backend.stop_browse(service_type).await
        {
            log::warn!("{service_type}: failed to stop discovery: {e}");
        }
        if let Some(task) = lock(&self.pump).take() {
            task.abort();
        }
        self.shared
            .resolver
            .reset(&self.shared.backend, service_type)
            .await;

        let mut inner = lock(&self.shared.inner);
        inner.records.clear();
        self.shared.publish(&inner);
        self.shared.set_state(&mut inner, DiscoveryState::Stopped);
        log::debug!("{service_type}: discovery stopped");
    }
}

const RESOLVE_TIMEOUT: Duration = Duration::from_secs(5);
const RESOLVE_POLL: Duration = Duration::from_millis(100);

fn fqdn(service_type: ServiceType) -> String {
    format!("{}.local.", service_type.service_name())
}

fn instance_name(fullname: &str, service_type: ServiceType) -> String {
    let suffix = format!(".{}", fqdn(service_type));
    fullname
        .strip_suffix(&suffix)
        .unwrap_or(fullname)
        .to_string()
}

/// `mdns-sd` backed discovery. The daemon resolves every instance it finds,
/// so a subscription only decides which resolutions are forwarded.
pub struct MdnsBackend {
    daemon: ServiceDaemon,
    browsers: Mutex<HashMap<ServiceType, JoinHandle<()>>>,
    resolved: Arc<Mutex<HashMap<(ServiceType, String), DiscoveryRecord>>>,
    subscriptions: Arc<Mutex<HashMap<(ServiceType, String), EventSender>>>,
}

impl MdnsBackend {
    pub fn new() -> AdbResult<Self> {
        let daemon = ServiceDaemon::new().map_err(|e| AdbError::Discovery {
            description: format!("failed to start mDNS daemon: {e}"),
        })?;
        Ok(Self {
            daemon,
            browsers: Mutex::new(HashMap::new()),
            resolved: Arc::new(Mutex::new(HashMap::new())),
            subscriptions: Arc::new(Mutex::new(HashMap::new())),
        })
    }

    pub fn shutdown(&self) {
        for (_, task) in lock(&self.browsers).drain() {
            task.abort();
        }
        if let Err(e) = self.daemon.shutdown() {
            log::debug!("mDNS daemon shutdown: {e}");
        }
    }
}

#[async_trait]
impl DiscoveryBackend for MdnsBackend {
    async fn start_browse(&self, service_type: ServiceType, events: EventSender) -> AdbResult<()> {
        let receiver = self.daemon.browse(&fqdn(service_type)).map_err(|e| AdbError::Discovery {
            description: format!("browse {service_type}: {e}"),
        })?;
        let resolved = self.resolved.clone();
        let subscriptions = self.subscriptions.clone();

        let task = tokio::spawn(async move {
            let mut started = false;
            loop {
                let event = match receiver.recv_async().await {
                    Ok(event) => event,
                    Err(e) => {
                        log::debug!("mDNS: {service_type} browse channel closed: {e}");
                        break;
                    }
                };
                let forwarded = match event {
                    ServiceEvent::SearchStarted(_) if !started => {
                        started = true;
                        Some(BackendEvent::BrowseStarted)
                    }
                    ServiceEvent::ServiceFound(_, fullname) => {
                        Some(BackendEvent::Found(instance_name(&fullname, service_type)))
                    }
                    ServiceEvent::ServiceResolved(info) => {
                        let name = instance_name(info.get_fullname(), service_type);
                        let record = DiscoveryRecord {
                            name: name.clone(),
                            addresses: info
                                .get_addresses()
                                .iter()
                                .filter(|a| !a.is_loopback())
                                .map(|a| a.to_ip_addr())
                                .collect(),
                            port: info.get_port(),
                            service_type,
                        };
                        lock(&resolved).insert((service_type, name.clone()), record.clone());
                        if let Some(tx) = lock(&subscriptions).get(&(service_type, name)) {
                            let _ = tx.send(BackendEvent::Resolved(record));
                        }
                        None
                    }
                    ServiceEvent::ServiceRemoved(_, fullname) => {
                        let name = instance_name(&fullname, service_type);
                        lock(&resolved).remove(&(service_type, name.clone()));
                        Some(BackendEvent::Lost(name))
                    }
                    ServiceEvent::SearchStopped(_) => {
                        let _ = events.send(BackendEvent::BrowseStopped);
                        break;
                    }
                    _ => None,
                };
                if let Some(event) = forwarded
                    && events.send(event).is_err()
                {
                    break;
                }
            }
        });

        if let Some(old) = lock(&self.browsers).insert(service_type, task) {
            old.abort();
        }
        Ok(())
    }

    async fn stop_browse(&self, service_type: ServiceType) -> AdbResult<()> {
        if let Some(task) = lock(&self.browsers).remove(&service_type) {
            task.abort();
        }
        lock(&self.resolved).retain(|(ty, _), _| *ty != service_type);
        self.daemon
            .stop_browse(&fqdn(service_type))
            .map_err(|e| AdbError::Discovery {
                description: format!("stop browse {service_type}: {e}"),
            })
    }

    async fn subscribe(&self, service_type: ServiceType, name: &str, events: EventSender) -> AdbResult<()> {
        let key = (service_type, name.to_string());
        if let Some(record) = lock(&self.resolved).get(&key) {
            let _ = events.send(BackendEvent::Resolved(record.clone()));
        }
        lock(&self.subscriptions).insert(key, events);
        Ok(())
    }

    async fn unsubscribe(&self, service_type: ServiceType, name: &str) {
        lock(&self.subscriptions).remove(&(service_type, name.to_string()));
    }

    async fn resolve(&self, service_type: ServiceType, name: &str) -> AdbResult<DiscoveryRecord> {
        let key = (service_type, name.to_string());
        let wait = async {
            loop {
                if let Some(record) = lock(&self.resolved).get(&key) {
                    return record.clone();
                }
                tokio::time::sleep(RESOLVE_POLL).await;
            }
        };
        tokio::time::timeout(RESOLVE_TIMEOUT, wait)
            .await
            .map_err(|_| AdbError::timeout(RESOLVE_TIMEOUT, format!("resolving {name}")))
    }
}
