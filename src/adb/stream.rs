// Multiplexed ADB streams exposed to callers as plain async byte pipes
use super::connection::ConnectionShared;
use super::protocol::AdbMessage;
use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, DuplexStream, ReadBuf};
use tokio::sync::{Notify, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::{CancellationToken, DropGuard};

const PIPE_BUFFER: usize = 256 * 1024;
/// How long `close()` waits for queued writes to reach the device.
const CLOSE_GRACE: Duration = Duration::from_secs(2);

pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Connection-side bookkeeping for one stream. The reader task updates it;
/// the stream's pump task consumes it.
pub(crate) struct StreamSlot {
    pub local_id: u32,
    remote_id: AtomicU32,
    delayed_ack: bool,
    open_result: Mutex<Option<oneshot::Sender<bool>>>,
    inbound: Mutex<Option<mpsc::UnboundedSender<Vec<u8>>>>,
    write_ready: AtomicBool,
    window: AtomicI64,
    credit: Notify,
    closed: AtomicBool,
}

impl StreamSlot {
    pub fn new(
        local_id: u32,
        delayed_ack: bool,
        open_result: oneshot::Sender<bool>,
        inbound: mpsc::UnboundedSender<Vec<u8>>,
    ) -> Self {
        Self {
            local_id,
            remote_id: AtomicU32::new(0),
            delayed_ack,
            open_result: Mutex::new(Some(open_result)),
            inbound: Mutex::new(Some(inbound)),
            write_ready: AtomicBool::new(false),
            window: AtomicI64::new(0),
            credit: Notify::new(),
            closed: AtomicBool::new(false),
        }
    }

    pub fn remote_id(&self) -> u32 {
        self.remote_id.load(Ordering::Acquire)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// OKAY from the device. The first one completes the open.
    pub fn on_ready(&self, remote_id: u32, payload: &[u8]) {
        if let Some(tx) = lock(&self.open_result).take() {
            self.remote_id.store(remote_id, Ordering::Release);
            let _ = tx.send(true);
        }
        if self.delayed_ack {
            if let Ok(bytes) = <[u8; 4]>::try_from(payload) {
                self.window
                    .fetch_add(u32::from_le_bytes(bytes) as i64, Ordering::AcqRel);
            }
        } else {
            self.write_ready.store(true, Ordering::Release);
        }
        self.credit.notify_one();
    }

    /// Queue a WRTE payload. Returns the byte count to acknowledge, or
    /// `None` when the stream is already gone.
    pub fn on_write(&self, payload: Vec<u8>) -> Option<usize> {
        let len = payload.len();
        let inbound = lock(&self.inbound);
        let tx = inbound.as_ref()?;
        tx.send(payload).ok().map(|_| len)
    }

    /// CLSE from the device, or the connection going away.
    pub fn on_close(&self) {
        self.closed.store(true, Ordering::Release);
        if let Some(tx) = lock(&self.open_result).take() {
            let _ = tx.send(false);
        }
        lock(&self.inbound).take();
        self.credit.notify_one();
    }

    /// Bytes the pump may send right now, or `None` while it must wait.
    fn send_budget(&self, max_data: usize) -> Option<usize> {
        if self.delayed_ack {
            let window = self.window.load(Ordering::Acquire);
            (window > 0).then(|| max_data.min(window as usize))
        } else {
            self.write_ready
                .load(Ordering::Acquire)
                .then_some(max_data)
        }
    }

    fn consume(&self, sent: usize) {
        if self.delayed_ack {
            self.window.fetch_sub(sent as i64, Ordering::AcqRel);
        } else {
            self.write_ready.store(false, Ordering::Release);
        }
    }
}

/// An open service stream (`shell:`, `sync:`, ...). Reads return what the
/// device wrote; writes are chunked and flow-controlled; `shutdown()` or
/// dropping the stream sends CLSE.
pub struct AdbStream {
    destination: String,
    local_id: u32,
    io: DuplexStream,
    pump: Option<JoinHandle<()>>,
    _dropped: DropGuard,
}

impl AdbStream {
    pub(crate) fn spawn(
        connection: Arc<ConnectionShared>,
        slot: Arc<StreamSlot>,
        inbound: mpsc::UnboundedReceiver<Vec<u8>>,
        destination: &str,
    ) -> Self {
        let (io, pump_end) = tokio::io::duplex(PIPE_BUFFER);
        let local_id = slot.local_id;
        let dropped = CancellationToken::new();
        let pump = tokio::spawn(pump(connection, slot, inbound, pump_end, dropped.clone()));
        Self {
            destination: destination.to_string(),
            local_id,
            io,
            pump: Some(pump),
            _dropped: dropped.drop_guard(),
        }
    }

    pub fn destination(&self) -> &str {
        &self.destination
    }

    pub fn local_id(&self) -> u32 {
        self.local_id
    }

    /// Flush pending writes and close the stream. A device that stops
    /// acknowledging gets CLSE after a short grace period.
    pub async fn close(mut self) -> io::Result<()> {
        let result = self.io.shutdown().await;
        if let Some(pump) = self.pump.take() {
            if tokio::time::timeout(CLOSE_GRACE, pump).await.is_err() {
                log::debug!("stream {} not drained within {CLOSE_GRACE:?}", self.local_id);
            }
        }
        result
    }
}

impl std::fmt::Debug for AdbStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdbStream")
            .field("destination", &self.destination)
            .field("local_id", &self.local_id)
            .finish()
    }
}

impl AsyncRead for AdbStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().io).poll_read(cx, buf)
    }
}

impl AsyncWrite for AdbStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.get_mut().io).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().io).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().io).poll_shutdown(cx)
    }
}

/// Moves bytes between the caller's end of the pipe and the ADB
/// connection until either side closes. `dropped` fires once the caller's
/// `AdbStream` is gone; while a write waits for its OKAY that is the only
/// way to notice the caller left.
async fn pump(
    connection: Arc<ConnectionShared>,
    slot: Arc<StreamSlot>,
    mut inbound: mpsc::UnboundedReceiver<Vec<u8>>,
    pipe: DuplexStream,
    dropped: CancellationToken,
) {
    let (mut from_caller, mut to_caller) = tokio::io::split(pipe);
    let max_data = connection.max_data();
    let mut buf = vec![0u8; max_data];

    loop {
        let budget = slot.send_budget(max_data);
        tokio::select! {
            payload = inbound.recv() => match payload {
                Some(data) => {
                    if to_caller.write_all(&data).await.is_err() {
                        log::debug!("stream {} reader dropped", slot.local_id);
                        close_local(&connection, &slot).await;
                        break;
                    }
                }
                None => {
                    let _ = to_caller.shutdown().await;
                    break;
                }
            },
            read = from_caller.read(&mut buf[..budget.unwrap_or(0)]), if budget.is_some() => match read {
                Ok(0) | Err(_) => {
                    close_local(&connection, &slot).await;
                    break;
                }
                Ok(n) => {
                    slot.consume(n);
                    let msg = AdbMessage::write(slot.local_id, slot.remote_id(), buf[..n].to_vec());
                    if let Err(e) = connection.send(&msg).await {
                        log::debug!("stream {} write failed: {e}", slot.local_id);
                        break;
                    }
                }
            },
            _ = slot.credit.notified(), if budget.is_none() => {}
            _ = dropped.cancelled(), if budget.is_none() => {
                log::debug!("stream {} dropped while waiting for OKAY", slot.local_id);
                close_local(&connection, &slot).await;
                break;
            }
        }
    }
}

async fn close_local(connection: &ConnectionShared, slot: &StreamSlot) {
    if slot.is_closed() {
        return;
    }
    slot.on_close();
    connection.forget_stream(slot.local_id);
    let msg = AdbMessage::close(slot.local_id, slot.remote_id());
    if let Err(e) = connection.send(&msg).await {
        log::debug!("CLSE for stream {} not sent: {e}", slot.local_id);
    }
}
