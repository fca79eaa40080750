// ADB connection: CNXN/AUTH/STLS handshake, then a reader task that
// demultiplexes OKAY/WRTE/CLSE onto open streams.
use super::auth::{self, AdbKeyPair};
use super::error::{AdbError, AdbResult};
use super::protocol::{
    self, A_AUTH, A_CLSE, A_CNXN, A_OKAY, A_STLS, A_VERSION, A_VERSION_MIN, AUTH_RSAPUBLICKEY,
    AUTH_SIGNATURE, AUTH_TOKEN, AdbMessage, DeviceBanner, FEATURE_DELAYED_ACK,
    INITIAL_DELAYED_ACK_BYTES, MAX_PAYLOAD,
};
use super::stream::{AdbStream, StreamSlot, lock};
use super::tls;
use super::transport::BoxedIo;
use super::types::TransportKind;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{ReadHalf, WriteHalf};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

/// How long the device may take to answer an OPEN.
const OPEN_TIMEOUT: Duration = Duration::from_secs(10);

pub struct HandshakeOptions<'a> {
    pub key: &'a dyn AdbKeyPair,
    /// Client config used if the device asks for STLS.
    pub tls: Option<Arc<rustls::ClientConfig>>,
    pub host: Option<&'a str>,
    pub fail_fast_on_auth: bool,
    pub enable_delayed_ack: bool,
}

/// State shared between the reader task, stream pumps and the owner.
pub(crate) struct ConnectionShared {
    writer: tokio::sync::Mutex<WriteHalf<BoxedIo>>,
    streams: Mutex<HashMap<u32, Arc<StreamSlot>>>,
    alive: AtomicBool,
    next_local_id: AtomicU32,
    protocol_version: u32,
    max_data: u32,
    delayed_ack: bool,
}

impl ConnectionShared {
    pub fn max_data(&self) -> usize {
        self.max_data as usize
    }

    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Acquire)
    }

    pub async fn send(&self, message: &AdbMessage) -> AdbResult<()> {
        if !self.is_alive() {
            return Err(AdbError::ConnectionClosed);
        }
        let mut writer = self.writer.lock().await;
        protocol::write_message(&mut *writer, message, self.protocol_version).await
    }

    pub fn forget_stream(&self, local_id: u32) {
        lock(&self.streams).remove(&local_id);
    }

    fn stream(&self, local_id: u32) -> Option<Arc<StreamSlot>> {
        lock(&self.streams).get(&local_id).cloned()
    }

    /// Mark the connection dead and close every stream.
    fn teardown(&self) {
        self.alive.store(false, Ordering::Release);
        let slots: Vec<_> = lock(&self.streams).drain().map(|(_, s)| s).collect();
        for slot in slots {
            slot.on_close();
        }
    }
}

pub struct AdbConnection {
    shared: Arc<ConnectionShared>,
    banner: DeviceBanner,
    kind: TransportKind,
    reader: JoinHandle<()>,
}

impl AdbConnection {
    /// Run the connect handshake over an opened transport. `kind` is the
    /// transport the bytes travel on; a TCP link upgraded by STLS reports
    /// itself as TLS.
    pub async fn handshake(
        mut io: BoxedIo,
        mut kind: TransportKind,
        options: HandshakeOptions<'_>,
    ) -> AdbResult<Self> {
        let mut version = A_VERSION_MIN;
        protocol::write_message(
            &mut io,
            &AdbMessage::connect(options.enable_delayed_ack),
            version,
        )
        .await?;

        let mut signature_sent = false;
        let mut public_key_sent = false;
        let mut on_tls = false;

        let banner = loop {
            let message = protocol::read_message(&mut io, MAX_PAYLOAD).await?;
            match message.command {
                A_STLS => {
                    let config = options.tls.clone().ok_or_else(|| {
                        AdbError::protocol("device requested TLS but no TLS identity is configured")
                    })?;
                    protocol::write_message(&mut io, &AdbMessage::stls(), version).await?;
                    let host = options.host.unwrap_or("adb");
                    let stream = tls::connect(config, host, io).await?;
                    io = Box::new(stream);
                    on_tls = true;
                    if kind == TransportKind::Tcp {
                        kind = TransportKind::Tls;
                    }
                    log::debug!("Transport upgraded to TLS");
                }
                A_AUTH if on_tls => {
                    log::debug!("Ignoring AUTH on TLS transport");
                }
                A_AUTH if message.arg0 == AUTH_TOKEN => {
                    if !signature_sent {
                        let signature = options.key.sign_token(&message.payload)?;
                        protocol::write_message(
                            &mut io,
                            &AdbMessage::auth(AUTH_SIGNATURE, signature),
                            version,
                        )
                        .await?;
                        signature_sent = true;
                    } else if options.fail_fast_on_auth {
                        return Err(AdbError::AuthenticationRequired);
                    } else if !public_key_sent {
                        log::info!("Device does not know this key, waiting for the user to accept it");
                        let payload = auth::public_key_message(options.key);
                        protocol::write_message(
                            &mut io,
                            &AdbMessage::auth(AUTH_RSAPUBLICKEY, payload),
                            version,
                        )
                        .await?;
                        public_key_sent = true;
                    }
                }
                A_CNXN => {
                    break DeviceBanner::parse(message.arg0, message.arg1, &message.payload);
                }
                _ => {
                    log::debug!("Ignoring {} during handshake", message.command_name());
                }
            }
        };

        version = banner.protocol_version.min(A_VERSION);
        let max_data = banner.max_data.clamp(1, MAX_PAYLOAD);
        let delayed_ack = options.enable_delayed_ack && banner.has_feature(FEATURE_DELAYED_ACK);
        log::info!(
            "ADB connection established over {:?} (version {:#x}, max data {}, {} features)",
            kind,
            version,
            max_data,
            banner.features.len()
        );

        let (read_half, write_half) = tokio::io::split(io);
        let shared = Arc::new(ConnectionShared {
            writer: tokio::sync::Mutex::new(write_half),
            streams: Mutex::new(HashMap::new()),
            alive: AtomicBool::new(true),
            next_local_id: AtomicU32::new(1),
            protocol_version: version,
            max_data,
            delayed_ack,
        });
        let reader = tokio::spawn(read_loop(shared.clone(), read_half));

        Ok(Self {
            shared,
            banner,
            kind,
            reader,
        })
    }

    pub fn transport_kind(&self) -> TransportKind {
        self.kind
    }

    pub fn banner(&self) -> &DeviceBanner {
        &self.banner
    }

    pub fn is_alive(&self) -> bool {
        self.shared.is_alive()
    }

    /// Open a service stream such as `shell:ls` or `sync:`.
    pub async fn open_stream(&self, destination: &str) -> AdbResult<AdbStream> {
        if !self.is_alive() {
            return Err(AdbError::NotConnected);
        }
        let local_id = self.shared.next_local_id.fetch_add(1, Ordering::AcqRel);
        let (open_tx, open_rx) = oneshot::channel();
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let slot = Arc::new(StreamSlot::new(
            local_id,
            self.shared.delayed_ack,
            open_tx,
            inbound_tx,
        ));
        lock(&self.shared.streams).insert(local_id, slot.clone());

        let window = if self.shared.delayed_ack {
            INITIAL_DELAYED_ACK_BYTES
        } else {
            0
        };
        if let Err(e) = self
            .shared
            .send(&AdbMessage::open(local_id, window, destination))
            .await
        {
            self.shared.forget_stream(local_id);
            return Err(e);
        }

        let opened = match tokio::time::timeout(OPEN_TIMEOUT, open_rx).await {
            Ok(opened) => opened,
            Err(_) => {
                self.shared.forget_stream(local_id);
                log::warn!("No answer to OPEN {destination} within {OPEN_TIMEOUT:?}");
                return Err(AdbError::timeout(OPEN_TIMEOUT, format!("opening {destination}")));
            }
        };
        match opened {
            Ok(true) => {
                log::debug!("Opened stream {local_id} -> {destination}");
                Ok(AdbStream::spawn(
                    self.shared.clone(),
                    slot,
                    inbound_rx,
                    destination,
                ))
            }
            Ok(false) if !self.is_alive() => Err(AdbError::ConnectionClosed),
            Ok(false) => Err(AdbError::StreamRejected {
                destination: destination.to_string(),
            }),
            Err(_) => Err(AdbError::ConnectionClosed),
        }
    }

    pub async fn close(&self) {
        self.shared.teardown();
        self.reader.abort();
        let mut writer = self.shared.writer.lock().await;
        if let Err(e) = tokio::io::AsyncWriteExt::shutdown(&mut *writer).await {
            log::debug!("Transport shutdown: {e}");
        }
    }
}

impl Drop for AdbConnection {
    fn drop(&mut self) {
        self.shared.teardown();
        self.reader.abort();
    }
}

async fn read_loop(shared: Arc<ConnectionShared>, mut reader: ReadHalf<BoxedIo>) {
    loop {
        let message = match protocol::read_message(&mut reader, MAX_PAYLOAD).await {
            Ok(message) => message,
            Err(AdbError::ConnectionClosed) => {
                log::info!("ADB transport closed by device");
                break;
            }
            Err(e) => {
                log::warn!("ADB reader stopped: {e}");
                break;
            }
        };
        if let Err(e) = dispatch(&shared, message).await {
            log::warn!("ADB reader stopped: {e}");
            break;
        }
    }
    shared.teardown();
}

async fn dispatch(shared: &ConnectionShared, message: AdbMessage) -> AdbResult<()> {
    // Device-to-host messages carry (device id, our id).
    let remote_id = message.arg0;
    let local_id = message.arg1;
    match message.command {
        A_OKAY => match shared.stream(local_id) {
            Some(slot) => slot.on_ready(remote_id, &message.payload),
            None => log::debug!("OKAY for unknown stream {local_id}"),
        },
        protocol::A_WRTE => {
            let Some(slot) = shared.stream(local_id) else {
                log::debug!("WRTE for unknown stream {local_id}, closing it");
                return shared.send(&AdbMessage::close(0, remote_id)).await;
            };
            if let Some(len) = slot.on_write(message.payload) {
                let acked = shared.delayed_ack.then_some(len as u32);
                shared
                    .send(&AdbMessage::ready(local_id, remote_id, acked))
                    .await?;
            }
        }
        A_CLSE => {
            if let Some(slot) = lock(&shared.streams).remove(&local_id) {
                slot.on_close();
            }
        }
        other => {
            log::debug!("Ignoring {} on established connection", protocol::command_name(other));
        }
    }
    Ok(())
}
