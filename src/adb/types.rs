// Core ADB domain types shared by the session, sync, discovery and orchestration layers
use super::usb::UsbAccessory;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::IpAddr;
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct HostPort {
    pub host: String,
    pub port: u16,
}

impl HostPort {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl fmt::Display for HostPort {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') && !self.host.starts_with('[') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

/// A device as known to the device store: its identity plus every
/// transport address it may be reachable on.
#[derive(Clone, Default, Serialize)]
pub struct DeviceTarget {
    pub uuid: String,
    #[serde(skip)]
    pub usb: Option<Arc<dyn UsbAccessory>>,
    pub tcp: Option<HostPort>,
    pub tls: Option<HostPort>,
    pub tls_peer_identity: Option<String>,
    pub identified: bool,
}

impl DeviceTarget {
    pub fn new(uuid: impl Into<String>) -> Self {
        Self {
            uuid: uuid.into(),
            ..Default::default()
        }
    }

    pub fn with_usb(mut self, usb: Arc<dyn UsbAccessory>) -> Self {
        self.usb = Some(usb);
        self
    }

    pub fn with_tcp(mut self, host: impl Into<String>, port: u16) -> Self {
        self.tcp = Some(HostPort::new(host, port));
        self
    }

    pub fn with_tls(mut self, host: impl Into<String>, port: u16) -> Self {
        self.tls = Some(HostPort::new(host, port));
        self
    }

    /// A target with no address at all cannot be connected.
    pub fn is_connectable(&self) -> bool {
        self.usb.is_some() || self.tcp.is_some() || self.tls.is_some()
    }

    pub fn usb_id(&self) -> Option<String> {
        self.usb.as_ref().map(|usb| usb.id())
    }
}

impl fmt::Debug for DeviceTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceTarget")
            .field("uuid", &self.uuid)
            .field("usb", &self.usb_id())
            .field("tcp", &self.tcp)
            .field("tls", &self.tls)
            .field("tls_peer_identity", &self.tls_peer_identity)
            .field("identified", &self.identified)
            .finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TransportKind {
    Usb,
    Tls,
    Tcp,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FailureReason {
    Timeout,
    Unauthorized,
    PairingRequired,
    HostUnreachable,
    Unknown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    ConnectingAwaitingAuthorization,
    ConnectedUsb,
    ConnectedTls,
    ConnectedTcp,
    FailedTimeout,
    FailedUnauthorized,
    FailedPairingRequired,
    FailedHostUnreachable,
    FailedUnknown,
}

impl ConnectionState {
    pub fn connected(kind: TransportKind) -> Self {
        match kind {
            TransportKind::Usb => ConnectionState::ConnectedUsb,
            TransportKind::Tls => ConnectionState::ConnectedTls,
            TransportKind::Tcp => ConnectionState::ConnectedTcp,
        }
    }

    pub fn failed(reason: FailureReason) -> Self {
        match reason {
            FailureReason::Timeout => ConnectionState::FailedTimeout,
            FailureReason::Unauthorized => ConnectionState::FailedUnauthorized,
            FailureReason::PairingRequired => ConnectionState::FailedPairingRequired,
            FailureReason::HostUnreachable => ConnectionState::FailedHostUnreachable,
            FailureReason::Unknown => ConnectionState::FailedUnknown,
        }
    }

    pub fn is_connected(&self) -> bool {
        matches!(
            self,
            ConnectionState::ConnectedUsb
                | ConnectionState::ConnectedTls
                | ConnectionState::ConnectedTcp
        )
    }

    pub fn transport(&self) -> Option<TransportKind> {
        match self {
            ConnectionState::ConnectedUsb => Some(TransportKind::Usb),
            ConnectionState::ConnectedTls => Some(TransportKind::Tls),
            ConnectionState::ConnectedTcp => Some(TransportKind::Tcp),
            _ => None,
        }
    }
}

/// Brand, model and serial read from a freshly connected device.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct DeviceIdentity {
    pub brand: String,
    pub model: String,
    pub serial: String,
}

pub const S_IFMT: u32 = 0xF000;
pub const S_IFDIR: u32 = 0x4000;
pub const S_IFREG: u32 = 0x8000;
pub const S_IFLNK: u32 = 0xA000;

/// Error code the v1 stat response is rewritten to when the peer reports an
/// all-zero record.
pub const STAT_NOT_FOUND: u32 = 2;

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct StatResult {
    pub error: u32,
    pub dev: Option<u64>,
    pub ino: Option<u64>,
    pub mode: Option<u32>,
    pub nlink: Option<u32>,
    pub uid: Option<u32>,
    pub gid: Option<u32>,
    pub size: Option<u64>,
    pub atime: Option<i64>,
    pub mtime: Option<i64>,
    pub ctime: Option<i64>,
}

impl StatResult {
    pub fn not_found() -> Self {
        Self {
            error: STAT_NOT_FOUND,
            ..Default::default()
        }
    }

    pub fn exists(&self) -> bool {
        self.error == 0
    }

    pub fn is_directory(&self) -> bool {
        self.mode.is_some_and(|m| m & S_IFMT == S_IFDIR)
    }

    pub fn is_file(&self) -> bool {
        self.mode.is_some_and(|m| m & S_IFMT == S_IFREG)
    }

    pub fn is_symlink(&self) -> bool {
        self.mode.is_some_and(|m| m & S_IFMT == S_IFLNK)
    }
}

/// One `DENT` record from a directory listing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileEntry {
    pub name: String,
    pub mode: u32,
    pub size: u64,
    pub mtime: i64,
    /// Per-entry error reported by a v2 listing; the other fields are then
    /// not trustworthy.
    pub error: u32,
}

impl FileEntry {
    pub fn is_reliable(&self) -> bool {
        self.error == 0
    }

    pub fn is_directory(&self) -> bool {
        self.mode & S_IFMT == S_IFDIR
    }

    pub fn is_file(&self) -> bool {
        self.mode & S_IFMT == S_IFREG
    }

    pub fn is_symlink(&self) -> bool {
        self.mode & S_IFMT == S_IFLNK
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TransferProgress {
    pub bytes_transferred: u64,
    /// -1 when the size is unknown.
    pub total_bytes: i64,
    pub speed_mbps: f64,
    /// -1 when the size is unknown.
    pub percent: i32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ServiceType {
    Adb,
    TlsPairing,
    TlsConnect,
}

impl ServiceType {
    pub const ALL: [ServiceType; 3] = [
        ServiceType::Adb,
        ServiceType::TlsPairing,
        ServiceType::TlsConnect,
    ];

    /// DNS-SD type as advertised by adbd.
    pub fn service_name(&self) -> &'static str {
        match self {
            ServiceType::Adb => "_adb._tcp",
            ServiceType::TlsPairing => "_adb-tls-pairing._tcp",
            ServiceType::TlsConnect => "_adb-tls-connect._tcp",
        }
    }

    pub fn tag(&self) -> &'static str {
        match self {
            ServiceType::Adb => "adb",
            ServiceType::TlsPairing => "tls-pairing",
            ServiceType::TlsConnect => "tls-connect",
        }
    }
}

impl fmt::Display for ServiceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.tag())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DiscoveryRecord {
    pub name: String,
    pub addresses: Vec<IpAddr>,
    pub port: u16,
    pub service_type: ServiceType,
}
