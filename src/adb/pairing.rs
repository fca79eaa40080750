// Wireless-debugging pairing: a TLS session to the pairing port carrying a
// SPAKE2 exchange keyed by the pairing code, then encrypted PeerInfo.
use super::auth::{self, AdbKeyPair};
use super::discovery::Snapshot;
use super::error::{AdbError, AdbResult};
use super::store::DeviceStore;
use super::stream::lock;
use super::tls;
use super::transport;
use super::types::{DiscoveryRecord, HostPort};
use async_trait::async_trait;
use qrcode::render::unicode::Dense1x2;
use qrcode::{EcLevel, QrCode};
use rand::Rng;
use std::net::{IpAddr, SocketAddr};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::watch;
use tokio::task::JoinHandle;

pub const PAIRING_HEADER_SIZE: usize = 6;
pub const PAIRING_HEADER_VERSION: u8 = 1;
pub const SPAKE2_MSG: u8 = 0;
pub const PEER_INFO: u8 = 1;
pub const MAX_PEER_INFO_SIZE: usize = 1 << 13;
pub const MAX_PAIRING_PAYLOAD: u32 = 2 * MAX_PEER_INFO_SIZE as u32;
pub const ADB_RSA_PUB_KEY: u8 = 0;

const QR_INSTANCE_PREFIX: &str = "ADBLink-";
const QR_CHARSET: &[u8] =
    b"abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789!@#$%^&*()-+*/<>{}";
const PROBE_TIMEOUT: Duration = Duration::from_secs(1);

fn pairing_error(description: impl Into<String>) -> AdbError {
    AdbError::Pairing {
        description: description.into(),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PairingHeader {
    pub version: u8,
    pub kind: u8,
    pub payload_size: u32,
}

impl PairingHeader {
    pub fn new(kind: u8, payload_size: u32) -> Self {
        Self {
            version: PAIRING_HEADER_VERSION,
            kind,
            payload_size,
        }
    }

    pub fn encode(&self) -> [u8; PAIRING_HEADER_SIZE] {
        let mut out = [0u8; PAIRING_HEADER_SIZE];
        out[0] = self.version;
        out[1] = self.kind;
        out[2..].copy_from_slice(&self.payload_size.to_be_bytes());
        out
    }

    pub fn decode(bytes: &[u8; PAIRING_HEADER_SIZE]) -> AdbResult<Self> {
        let header = Self {
            version: bytes[0],
            kind: bytes[1],
            payload_size: u32::from_be_bytes([bytes[2], bytes[3], bytes[4], bytes[5]]),
        };
        if header.version != PAIRING_HEADER_VERSION {
            return Err(AdbError::protocol(format!(
                "pairing header version {} (expected {PAIRING_HEADER_VERSION})",
                header.version
            )));
        }
        if header.kind != SPAKE2_MSG && header.kind != PEER_INFO {
            return Err(AdbError::protocol(format!(
                "unknown pairing packet type {}",
                header.kind
            )));
        }
        if header.payload_size == 0 || header.payload_size > MAX_PAIRING_PAYLOAD {
            return Err(AdbError::protocol(format!(
                "pairing payload size {} outside 1..={MAX_PAIRING_PAYLOAD}",
                header.payload_size
            )));
        }
        Ok(header)
    }
}

/// Fixed-size identity record exchanged once the cipher is up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerInfo {
    pub kind: u8,
    pub data: Vec<u8>,
}

impl PeerInfo {
    pub fn new(kind: u8, data: &[u8]) -> Self {
        let len = data.len().min(MAX_PEER_INFO_SIZE - 1);
        Self {
            kind,
            data: data[..len].to_vec(),
        }
    }

    /// Zero-padded to `MAX_PEER_INFO_SIZE`.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = vec![0u8; MAX_PEER_INFO_SIZE];
        out[0] = self.kind;
        out[1..1 + self.data.len()].copy_from_slice(&self.data);
        out
    }

    pub fn decode(bytes: &[u8]) -> AdbResult<Self> {
        if bytes.len() != MAX_PEER_INFO_SIZE {
            return Err(pairing_error(format!(
                "peer info is {} bytes, expected {MAX_PEER_INFO_SIZE}",
                bytes.len()
            )));
        }
        Ok(Self {
            kind: bytes[0],
            data: bytes[1..].to_vec(),
        })
    }

    /// Data up to the first NUL, as text.
    pub fn identity(&self) -> String {
        let end = self
            .data
            .iter()
            .position(|&b| b == 0)
            .unwrap_or(self.data.len());
        String::from_utf8_lossy(&self.data[..end]).into_owned()
    }
}

/// One side of the password-authenticated key exchange plus the AEAD it
/// establishes. The primitives are supplied by the embedding application.
pub trait PairingAuth: Send {
    /// Our SPAKE2 message.
    fn message(&self) -> Vec<u8>;
    fn init_cipher(&mut self, their_message: &[u8]) -> AdbResult<()>;
    fn encrypt(&mut self, plaintext: &[u8]) -> AdbResult<Vec<u8>>;
    fn decrypt(&mut self, ciphertext: &[u8]) -> AdbResult<Vec<u8>>;
}

pub trait PairingAuthFactory: Send + Sync {
    fn create(&self, password: &[u8]) -> AdbResult<Box<dyn PairingAuth>>;
}

async fn write_packet<S>(stream: &mut S, kind: u8, payload: &[u8]) -> AdbResult<()>
where
    S: AsyncWrite + Unpin,
{
    let size = u32::try_from(payload.len())
        .ok()
        .filter(|&n| n > 0 && n <= MAX_PAIRING_PAYLOAD)
        .ok_or_else(|| pairing_error(format!("payload of {} bytes cannot be sent", payload.len())))?;
    stream
        .write_all(&PairingHeader::new(kind, size).encode())
        .await?;
    stream.write_all(payload).await?;
    stream.flush().await?;
    Ok(())
}

async fn read_packet<S>(stream: &mut S, expected: u8) -> AdbResult<Vec<u8>>
where
    S: AsyncRead + Unpin,
{
    let mut raw = [0u8; PAIRING_HEADER_SIZE];
    stream.read_exact(&mut raw).await?;
    let header = PairingHeader::decode(&raw)?;
    if header.kind != expected {
        return Err(pairing_error(format!(
            "unexpected packet type {} (expected {expected})",
            header.kind
        )));
    }
    let mut payload = vec![0u8; header.payload_size as usize];
    stream.read_exact(&mut payload).await?;
    Ok(payload)
}

/// Run the pairing exchange over an established (TLS) stream. `password` is
/// the pairing code followed by the exported keying material. Returns the
/// peer's identity string.
pub async fn pair_over<S>(
    stream: &mut S,
    password: &[u8],
    key: &dyn AdbKeyPair,
    factory: &dyn PairingAuthFactory,
) -> AdbResult<String>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut auth = factory.create(password)?;

    write_packet(stream, SPAKE2_MSG, &auth.message()).await?;
    let their_message = read_packet(stream, SPAKE2_MSG).await?;
    auth.init_cipher(&their_message)?;

    let ours = PeerInfo::new(ADB_RSA_PUB_KEY, &auth::public_key_message(key));
    let encrypted = auth.encrypt(&ours.encode())?;
    write_packet(stream, PEER_INFO, &encrypted).await?;

    let their_info = read_packet(stream, PEER_INFO).await?;
    let decrypted = auth.decrypt(&their_info)?;
    let peer = PeerInfo::decode(&decrypted)?;
    Ok(peer.identity())
}

/// `adb-<serial>-<suffix>`; anything else yields `None`.
pub fn parse_serial(identity: &str) -> Option<String> {
    let rest = identity.strip_prefix("adb-")?;
    let (serial, suffix) = rest.split_once('-')?;
    if serial.is_empty() || suffix.is_empty() || suffix.contains('-') {
        return None;
    }
    Some(serial.to_string())
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PairingOutcome {
    pub peer_identity: String,
    pub serial: String,
}

pub struct PairingClient {
    key: Arc<dyn AdbKeyPair>,
    tls: Arc<rustls::ClientConfig>,
    factory: Arc<dyn PairingAuthFactory>,
    store: Arc<dyn DeviceStore>,
    timeout: Duration,
}

impl PairingClient {
    pub fn new(
        key: Arc<dyn AdbKeyPair>,
        tls: Arc<rustls::ClientConfig>,
        factory: Arc<dyn PairingAuthFactory>,
        store: Arc<dyn DeviceStore>,
        timeout: Duration,
    ) -> Self {
        Self {
            key,
            tls,
            factory,
            store,
            timeout,
        }
    }

    /// Pair with the device listening on `host:port` using the code shown on
    /// its screen. The device store is updated on success.
    pub async fn pair(&self, host: &str, port: u16, code: &str) -> AdbResult<PairingOutcome> {
        let address = HostPort::new(host, port);
        let outcome = tokio::time::timeout(self.timeout, self.exchange(&address, code))
            .await
            .map_err(|_| AdbError::timeout(self.timeout, format!("pairing with {address}")))?
            .inspect_err(|e| log::warn!("Failed to pair with {address}: {e}"))?;

        self.store
            .record_pairing(&outcome.serial, &outcome.peer_identity, host)
            .await;
        log::info!(
            "Paired with {address} (serial {}, peer {})",
            outcome.serial,
            outcome.peer_identity
        );
        Ok(outcome)
    }

    async fn exchange(&self, address: &HostPort, code: &str) -> AdbResult<PairingOutcome> {
        let tcp = transport::connect_tcp(address).await?;
        let mut stream = match tls::connect(self.tls.clone(), &address.host, tcp).await {
            Ok(stream) => stream,
            Err(AdbError::PairingRequired) => {
                return Err(pairing_error("device rejected the TLS handshake"));
            }
            Err(e) => return Err(e),
        };
        log::debug!("Pairing TLS handshake with {address} complete");

        let mut password = code.as_bytes().to_vec();
        password.extend_from_slice(&tls::export_pairing_key(&stream)?);

        let peer_identity =
            pair_over(&mut stream, &password, self.key.as_ref(), self.factory.as_ref()).await;
        password.fill(0);
        let peer_identity = peer_identity?;
        if let Err(e) = stream.shutdown().await {
            log::debug!("Pairing stream shutdown: {e}");
        }

        let serial = parse_serial(&peer_identity).ok_or_else(|| {
            pairing_error(format!("no serial in peer identity '{peer_identity}'"))
        })?;
        Ok(PairingOutcome {
            peer_identity,
            serial,
        })
    }
}

/// Ephemeral instance name and code rendered into a scannable payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QrPairing {
    pub instance_name: String,
    pub code: String,
}

fn random_string(len: usize) -> String {
    let mut rng = rand::thread_rng();
    (0..len)
        .map(|_| QR_CHARSET[rng.gen_range(0..QR_CHARSET.len())] as char)
        .collect()
}

impl QrPairing {
    pub fn generate() -> Self {
        Self {
            instance_name: format!("{QR_INSTANCE_PREFIX}{}", random_string(8)),
            code: random_string(12),
        }
    }

    pub fn payload(&self) -> String {
        format!("WIFI:T:ADB;S:{};P:{};;", self.instance_name, self.code)
    }

    pub fn qr_code(&self) -> AdbResult<QrCode> {
        QrCode::with_error_correction_level(self.payload(), EcLevel::L).map_err(|e| {
            AdbError::Pairing {
                description: format!("QR encoding failed: {e}"),
            }
        })
    }

    /// The QR code as unicode half blocks, light modules on a dark
    /// terminal background.
    pub fn render(&self) -> AdbResult<String> {
        let code = self.qr_code()?;
        Ok(code
            .render::<Dense1x2>()
            .dark_color(Dense1x2::Light)
            .light_color(Dense1x2::Dark)
            .build())
    }
}

#[async_trait]
pub trait ReachabilityProbe: Send + Sync {
    async fn is_reachable(&self, address: IpAddr, port: u16) -> bool;
}

/// Reachable means a TCP connect to the advertised port succeeds in time.
pub struct TcpProbe {
    pub timeout: Duration,
}

impl Default for TcpProbe {
    fn default() -> Self {
        Self {
            timeout: PROBE_TIMEOUT,
        }
    }
}

#[async_trait]
impl ReachabilityProbe for TcpProbe {
    async fn is_reachable(&self, address: IpAddr, port: u16) -> bool {
        let target = SocketAddr::new(address, port);
        matches!(
            tokio::time::timeout(self.timeout, tokio::net::TcpStream::connect(target)).await,
            Ok(Ok(_))
        )
    }
}

/// Something that can perform a pairing; lets the QR matcher run against a
/// fake in tests.
#[async_trait]
pub trait Pairer: Send + Sync {
    async fn pair(&self, host: &str, port: u16, code: &str) -> AdbResult<PairingOutcome>;
}

#[async_trait]
impl Pairer for PairingClient {
    async fn pair(&self, host: &str, port: u16, code: &str) -> AdbResult<PairingOutcome> {
        PairingClient::pair(self, host, port, code).await
    }
}

/// Watches `tls-pairing` snapshots for the instance advertised by the
/// current QR code and pairs with it.
pub struct QrPairingMatcher {
    pairer: Arc<dyn Pairer>,
    probe: Arc<dyn ReachabilityProbe>,
    pending: Mutex<Option<QrPairing>>,
    result: watch::Sender<Option<PairingOutcome>>,
}

impl QrPairingMatcher {
    pub fn new(pairer: Arc<dyn Pairer>, probe: Arc<dyn ReachabilityProbe>) -> Self {
        let (result, _) = watch::channel(None);
        Self {
            pairer,
            probe,
            pending: Mutex::new(None),
            result,
        }
    }

    /// Start a new QR pairing, replacing any pending one.
    pub fn begin(&self) -> QrPairing {
        let qr = QrPairing::generate();
        *lock(&self.pending) = Some(qr.clone());
        self.result.send_replace(None);
        log::debug!("QR pairing pending for {}", qr.instance_name);
        qr
    }

    pub fn cancel(&self) {
        lock(&self.pending).take();
    }

    pub fn pending(&self) -> Option<QrPairing> {
        lock(&self.pending).clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<Option<PairingOutcome>> {
        self.result.subscribe()
    }

    /// Feed every snapshot from `records` through the matcher until the
    /// sender goes away.
    pub fn watch(self: &Arc<Self>, mut records: watch::Receiver<Snapshot>) -> JoinHandle<()> {
        let matcher = self.clone();
        tokio::spawn(async move {
            loop {
                let snapshot = records.borrow_and_update().clone();
                matcher.on_snapshot(&snapshot).await;
                if records.changed().await.is_err() {
                    break;
                }
            }
        })
    }

    /// Returns `true` when this snapshot completed the pending pairing.
    pub async fn on_snapshot(&self, records: &[DiscoveryRecord]) -> bool {
        let Some(qr) = self.pending() else {
            return false;
        };
        let Some(record) = records.iter().find(|r| r.name == qr.instance_name) else {
            return false;
        };

        for address in &record.addresses {
            if !self.probe.is_reachable(*address, record.port).await {
                log::debug!("QR pairing: {address} not reachable, skipping");
                continue;
            }
            log::debug!("Trying to pair with {address}:{} via QR code", record.port);
            match self
                .pairer
                .pair(&address.to_string(), record.port, &qr.code)
                .await
            {
                Ok(outcome) => {
                    {
                        let mut pending = lock(&self.pending);
                        if pending.as_ref() == Some(&qr) {
                            pending.take();
                        }
                    }
                    self.result.send_replace(Some(outcome));
                    return true;
                }
                Err(e) => log::warn!("QR pairing with {address} failed: {e}"),
            }
        }
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_is_big_endian() {
        let header = PairingHeader::new(PEER_INFO, 0x1234);
        assert_eq!(header.encode(), [1, 1, 0, 0, 0x12, 0x34]);
        assert_eq!(PairingHeader::decode(&header.encode()).unwrap(), header);
    }

    #[test]
    fn header_rejects_bad_size_and_version() {
        assert!(PairingHeader::decode(&[1, 0, 0, 0, 0, 0]).is_err());
        assert!(PairingHeader::decode(&[1, 0, 0, 0, 0x40, 0x01]).is_err());
        assert!(PairingHeader::decode(&[2, 0, 0, 0, 0, 1]).is_err());
        assert!(PairingHeader::decode(&[1, 0, 0, 0, 0x40, 0x00]).is_ok());
    }

    #[test]
    fn serial_from_peer_identity() {
        assert_eq!(parse_serial("adb-R5CT1234-xyZ9ab").as_deref(), Some("R5CT1234"));
        assert_eq!(parse_serial("adb-R5CT1234"), None);
        assert_eq!(parse_serial("adb-R5-CT-1234"), None);
        assert_eq!(parse_serial("tls-R5CT-abc"), None);
        assert_eq!(parse_serial("adb--abc"), None);
    }

    #[test]
    fn peer_info_identity_stops_at_nul() {
        let info = PeerInfo::new(ADB_RSA_PUB_KEY, b"adb-SER-abc\0garbage");
        let decoded = PeerInfo::decode(&info.encode()).unwrap();
        assert_eq!(decoded.identity(), "adb-SER-abc");
        assert!(PeerInfo::decode(&[0u8; 100]).is_err());
    }

    #[test]
    fn qr_payload_format() {
        let qr = QrPairing::generate();
        assert!(qr.instance_name.starts_with("ADBLink-"));
        assert_eq!(qr.instance_name.len(), "ADBLink-".len() + 8);
        assert_eq!(qr.code.len(), 12);
        assert!(qr.code.bytes().all(|b| QR_CHARSET.contains(&b)));
        assert_eq!(
            qr.payload(),
            format!("WIFI:T:ADB;S:{};P:{};;", qr.instance_name, qr.code)
        );
    }

    #[test]
    fn qr_code_matrix_for_known_payload() {
        let qr = QrPairing {
            instance_name: "ADBLink-Ab3dEf9h".into(),
            code: "Xy9kLm3nPq7r".into(),
        };
        assert_eq!(qr.payload().len(), 46);
        let code = qr.qr_code().unwrap();
        // 46 bytes at level L need version 3: 29x29 modules
        assert_eq!(code.version(), qrcode::Version::Normal(3));
        assert_eq!(code.width(), 29);
        assert_eq!(code.error_correction_level(), EcLevel::L);

        // quiet zone of 4 on each side, two module rows per text line
        let rendered = qr.render().unwrap();
        let lines: Vec<&str> = rendered.lines().collect();
        assert_eq!(lines.len(), (29 + 8 + 1) / 2);
        assert!(lines.iter().all(|line| line.chars().count() == 29 + 8));
    }
}
