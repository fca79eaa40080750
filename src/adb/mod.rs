// ADB client engine: wire protocol, sessions and streams, the sync service,
// wireless discovery and pairing, and per-device connection orchestration.

pub mod auth;
pub mod connection;
pub mod discovery;
pub mod engine;
pub mod error;
pub mod orchestrator;
pub mod pairing;
pub mod protocol;
pub mod session;
pub mod shell;
pub mod store;
pub mod stream;
pub mod sync;
pub mod tls;
pub mod transport;
pub mod types;
pub mod usb;


// Re-export the main types and functions for easy access
pub use auth::AdbKeyPair;
pub use discovery::{DiscoveryBackend, DiscoveryService, DiscoveryState, MdnsBackend, ResolveMode};
pub use engine::AdbEngine;
pub use error::{AdbError, AdbResult};
pub use orchestrator::ConnectionOrchestrator;
pub use pairing::{PairingAuth, PairingAuthFactory, PairingClient, PairingOutcome, QrPairing};
pub use session::{LocalService, Session};
pub use store::{DeviceStore, InMemoryDeviceStore};
pub use stream::AdbStream;
pub use types::{
    ConnectionState, DeviceIdentity, DeviceTarget, DiscoveryRecord, FailureReason, FileEntry,
    HostPort, ServiceType, StatResult, TransferProgress, TransportKind,
};
pub use usb::UsbAccessory;
