// Sync service client (stat / list / push / pull) over an open `sync:` stream.
//
// Frames are an 8-byte little-endian header (4-byte ASCII id + u32 argument)
// optionally followed by a payload. Any malformed frame fails only the
// current operation; the owning connection is untouched.
use super::error::{AdbError, AdbResult};
use super::protocol::{DeviceBanner, FEATURE_LS_V2, FEATURE_STAT_V2};
use super::types::{FileEntry, StatResult, TransferProgress};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

pub const SYNC_DATA_MAX: usize = 64 * 1024;
/// Upper bound for FAIL messages and directory entry names.
pub const SYNC_MAX_TEXT: usize = 1024;
pub const DEFAULT_FILE_MODE: &str = "0644";

pub const ID_STAT_V1: [u8; 4] = *b"STAT";
pub const ID_STAT_V2: [u8; 4] = *b"STA2";
pub const ID_LSTAT_V2: [u8; 4] = *b"LST2";
pub const ID_LIST_V1: [u8; 4] = *b"LIST";
pub const ID_LIST_V2: [u8; 4] = *b"LIS2";
pub const ID_DENT_V1: [u8; 4] = *b"DENT";
pub const ID_DENT_V2: [u8; 4] = *b"DNT2";
pub const ID_SEND: [u8; 4] = *b"SEND";
pub const ID_RECV: [u8; 4] = *b"RECV";
pub const ID_DATA: [u8; 4] = *b"DATA";
pub const ID_DONE: [u8; 4] = *b"DONE";
pub const ID_OKAY: [u8; 4] = *b"OKAY";
pub const ID_FAIL: [u8; 4] = *b"FAIL";
pub const ID_QUIT: [u8; 4] = *b"QUIT";

const PROGRESS_INTERVAL: Duration = Duration::from_millis(100);

/// Which response shapes the peer understands. Captured once from the
/// connection banner and never re-read during an operation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyncFeatures {
    pub stat_v2: bool,
    pub ls_v2: bool,
}

impl SyncFeatures {
    pub fn from_banner(banner: &DeviceBanner) -> Self {
        Self {
            stat_v2: banner.has_feature(FEATURE_STAT_V2),
            ls_v2: banner.has_feature(FEATURE_LS_V2),
        }
    }
}

pub type ProgressFn<'a> = &'a mut (dyn FnMut(TransferProgress) + Send);

fn tag(id: &[u8; 4]) -> String {
    String::from_utf8_lossy(id).into_owned()
}

/// Parse an octal permission string such as `"0644"`.
pub fn parse_mode(mode: &str) -> AdbResult<u32> {
    u32::from_str_radix(mode.trim_start_matches("0o"), 8).map_err(|_| AdbError::Unknown {
        description: format!("invalid file mode '{mode}'"),
    })
}

/// Throughput bookkeeping shared by push and pull.
pub struct ProgressTracker {
    total: Option<u64>,
    transferred: u64,
    last_time: Instant,
    last_bytes: u64,
    report_on_complete: bool,
    reported_final: bool,
}

impl ProgressTracker {
    pub fn new(total: Option<u64>) -> Self {
        Self {
            total,
            transferred: 0,
            last_time: Instant::now(),
            last_bytes: 0,
            report_on_complete: true,
            reported_final: false,
        }
    }

    /// Leave the completion report to `finish`.
    pub fn deferring_completion(mut self) -> Self {
        self.report_on_complete = false;
        self
    }

    pub fn transferred(&self) -> u64 {
        self.transferred
    }

    fn is_complete(&self) -> bool {
        self.total == Some(self.transferred)
    }

    /// Record `n` more bytes; returns a report when the cadence has elapsed
    /// or the transfer just completed.
    pub fn advance(&mut self, n: u64) -> Option<TransferProgress> {
        self.transferred += n;
        let due = self.last_time.elapsed() >= PROGRESS_INTERVAL
            || (self.report_on_complete && self.is_complete());
        due.then(|| self.report())
    }

    /// Closing report, unless the last periodic report already covered the
    /// final byte count.
    pub fn finish(&mut self, always: bool) -> Option<TransferProgress> {
        if self.reported_final && !always {
            return None;
        }
        Some(self.report())
    }

    fn report(&mut self) -> TransferProgress {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_time).as_nanos();
        let delta = self.transferred - self.last_bytes;
        let speed_mbps = if elapsed > 0 {
            (delta as f64 * 1_000_000_000.0) / elapsed as f64 / (1024.0 * 1024.0)
        } else {
            0.0
        };
        let (total_bytes, percent) = match self.total {
            Some(0) => (0, 100),
            Some(total) => (total as i64, (self.transferred * 100 / total).min(100) as i32),
            None => (-1, -1),
        };
        self.last_time = now;
        self.last_bytes = self.transferred;
        self.reported_final = self.is_complete();
        TransferProgress {
            bytes_transferred: self.transferred,
            total_bytes,
            speed_mbps,
            percent,
        }
    }
}

/// A sync conversation on one stream. Dropping it closes the stream.
pub struct SyncSession<S> {
    stream: S,
    features: SyncFeatures,
}

impl<S> SyncSession<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    pub fn new(stream: S, features: SyncFeatures) -> Self {
        Self { stream, features }
    }

    pub fn features(&self) -> SyncFeatures {
        self.features
    }

    async fn send_header(&mut self, id: &[u8; 4], arg: u32) -> AdbResult<()> {
        let mut frame = [0u8; 8];
        frame[..4].copy_from_slice(id);
        frame[4..].copy_from_slice(&arg.to_le_bytes());
        self.stream.write_all(&frame).await?;
        Ok(())
    }

    async fn send_request(&mut self, id: &[u8; 4], path: &str) -> AdbResult<()> {
        let bytes = path.as_bytes();
        let mut frame = Vec::with_capacity(8 + bytes.len());
        frame.extend_from_slice(id);
        frame.extend_from_slice(&(bytes.len() as u32).to_le_bytes());
        frame.extend_from_slice(bytes);
        self.stream.write_all(&frame).await?;
        self.stream.flush().await?;
        Ok(())
    }

    async fn read_header(&mut self) -> AdbResult<([u8; 4], u32)> {
        let mut frame = [0u8; 8];
        self.stream.read_exact(&mut frame).await?;
        let mut id = [0u8; 4];
        id.copy_from_slice(&frame[..4]);
        let arg = u32::from_le_bytes([frame[4], frame[5], frame[6], frame[7]]);
        Ok((id, arg))
    }

    /// Like `read_header`, but a clean end of stream yields `None`.
    async fn read_header_or_eof(&mut self, op: &str) -> AdbResult<Option<([u8; 4], u32)>> {
        match self.read_header().await {
            Ok(header) => Ok(Some(header)),
            Err(AdbError::Io { source }) if source.kind() == std::io::ErrorKind::UnexpectedEof => {
                log::warn!("{op}: sync stream ended while reading header");
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    async fn read_text(&mut self, len: u32, what: &str) -> AdbResult<String> {
        if len as usize > SYNC_MAX_TEXT {
            return Err(AdbError::protocol(format!(
                "{what} length {len} exceeds {SYNC_MAX_TEXT}"
            )));
        }
        let mut bytes = vec![0u8; len as usize];
        self.stream.read_exact(&mut bytes).await?;
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }

    async fn read_fail(&mut self, len: u32) -> AdbError {
        match self.read_text(len, "FAIL message").await {
            Ok(message) => AdbError::Fail { message },
            Err(e) => e,
        }
    }

    async fn quit(&mut self) -> AdbResult<()> {
        self.send_header(&ID_QUIT, 0).await?;
        self.stream.flush().await?;
        Ok(())
    }

    async fn quit_logged(&mut self, op: &str) {
        if let Err(e) = self.quit().await {
            log::warn!("{op}: sending QUIT failed (stream may be closed): {e}");
        }
    }

    /// `stat(2)` of a remote path, following symlinks.
    pub async fn stat(&mut self, path: &str) -> AdbResult<StatResult> {
        let id = if self.features.stat_v2 {
            ID_STAT_V2
        } else {
            ID_STAT_V1
        };
        self.stat_with(id, path).await
    }

    /// `lstat(2)` of a remote path. v1 peers have no separate lstat request.
    pub async fn lstat(&mut self, path: &str) -> AdbResult<StatResult> {
        let id = if self.features.stat_v2 {
            ID_LSTAT_V2
        } else {
            ID_STAT_V1
        };
        self.stat_with(id, path).await
    }

    async fn stat_with(&mut self, id: [u8; 4], path: &str) -> AdbResult<StatResult> {
        self.send_request(&id, path).await?;

        if id == ID_STAT_V1 {
            let mut reply = [0u8; 16];
            self.stream.read_exact(&mut reply).await?;
            let word = |i: usize| u32::from_le_bytes([reply[i], reply[i + 1], reply[i + 2], reply[i + 3]]);
            if reply[..4] != ID_STAT_V1 {
                return Err(AdbError::protocol(format!(
                    "unexpected stat response '{}'",
                    String::from_utf8_lossy(&reply[..4])
                )));
            }
            let (mode, size, time) = (word(4), word(8), word(12));
            if mode == 0 && size == 0 && time == 0 {
                return Ok(StatResult::not_found());
            }
            return Ok(StatResult {
                error: 0,
                mode: Some(mode),
                size: Some(size as u64),
                mtime: Some(time as i64),
                ctime: Some(time as i64),
                ..Default::default()
            });
        }

        let (reply_id, error) = self.read_header().await?;
        if reply_id != id {
            return Err(AdbError::protocol(format!(
                "unexpected stat response '{}' to {}",
                tag(&reply_id),
                tag(&id)
            )));
        }
        let dev = self.stream.read_u64_le().await?;
        let ino = self.stream.read_u64_le().await?;
        let mode = self.stream.read_u32_le().await?;
        let nlink = self.stream.read_u32_le().await?;
        let uid = self.stream.read_u32_le().await?;
        let gid = self.stream.read_u32_le().await?;
        let size = self.stream.read_u64_le().await?;
        let atime = self.stream.read_i64_le().await?;
        let mtime = self.stream.read_i64_le().await?;
        let ctime = self.stream.read_i64_le().await?;
        if error != 0 {
            return Ok(StatResult {
                error,
                ..Default::default()
            });
        }
        Ok(StatResult {
            error: 0,
            dev: Some(dev),
            ino: Some(ino),
            mode: Some(mode),
            nlink: Some(nlink),
            uid: Some(uid),
            gid: Some(gid),
            size: Some(size),
            atime: Some(atime),
            mtime: Some(mtime),
            ctime: Some(ctime),
        })
    }

    async fn read_name(&mut self) -> AdbResult<String> {
        let len = self.stream.read_u32_le().await?;
        if len == 0 || len as usize > SYNC_MAX_TEXT {
            return Err(AdbError::protocol(format!(
                "directory entry name length {len} outside 1..={SYNC_MAX_TEXT}"
            )));
        }
        let mut bytes = vec![0u8; len as usize];
        self.stream.read_exact(&mut bytes).await?;
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }

    /// Directory listing in the order the device sent it.
    pub async fn list(&mut self, path: &str) -> AdbResult<Vec<FileEntry>> {
        let request = if self.features.ls_v2 {
            ID_LIST_V2
        } else {
            ID_LIST_V1
        };
        self.send_request(&request, path).await?;
        let result = self.read_entries().await;
        self.quit_logged("list").await;
        result
    }

    async fn read_entries(&mut self) -> AdbResult<Vec<FileEntry>> {
        let mut entries = Vec::new();
        while let Some((id, arg)) = self.read_header_or_eof("list").await? {
            match id {
                ID_DENT_V1 => {
                    let mode = arg;
                    let size = self.stream.read_u32_le().await? as u64;
                    let mtime = self.stream.read_u32_le().await? as i64;
                    let name = self.read_name().await?;
                    entries.push(FileEntry {
                        name,
                        mode,
                        size,
                        mtime,
                        error: 0,
                    });
                }
                ID_DENT_V2 => {
                    let error = arg;
                    let mut skipped = [0u8; 16];
                    self.stream.read_exact(&mut skipped).await?; // dev, ino
                    let mode = self.stream.read_u32_le().await?;
                    let mut skipped = [0u8; 12];
                    self.stream.read_exact(&mut skipped).await?; // nlink, uid, gid
                    let size = self.stream.read_u64_le().await?;
                    let _atime = self.stream.read_i64_le().await?;
                    let mtime = self.stream.read_i64_le().await?;
                    let _ctime = self.stream.read_i64_le().await?;
                    let name = self.read_name().await?;
                    if error != 0 {
                        log::warn!("list: entry '{name}' reported error {error}");
                    }
                    entries.push(FileEntry {
                        name,
                        mode,
                        size,
                        mtime,
                        error,
                    });
                }
                ID_DONE => break,
                ID_FAIL => return Err(self.read_fail(arg).await),
                other => {
                    return Err(AdbError::protocol(format!(
                        "unexpected list response '{}'",
                        tag(&other)
                    )));
                }
            }
        }
        Ok(entries)
    }

    /// Upload `size` bytes from `reader` to `remote`. `mode` is the octal
    /// permission string appended to the SEND request.
    pub async fn send_file<R>(
        &mut self,
        remote: &str,
        mode: &str,
        reader: &mut R,
        size: u64,
        mtime: u32,
        progress: Option<ProgressFn<'_>>,
    ) -> AdbResult<()>
    where
        R: AsyncRead + Unpin + ?Sized,
    {
        parse_mode(mode)?;
        let result = self
            .send_file_inner(remote, mode, reader, size, mtime, progress)
            .await;
        self.quit_logged("push").await;
        result
    }

    async fn send_file_inner<R>(
        &mut self,
        remote: &str,
        mode: &str,
        reader: &mut R,
        size: u64,
        mtime: u32,
        mut progress: Option<ProgressFn<'_>>,
    ) -> AdbResult<()>
    where
        R: AsyncRead + Unpin + ?Sized,
    {
        self.send_request(&ID_SEND, &format!("{remote},{mode}")).await?;

        let mut tracker = ProgressTracker::new(Some(size));
        let mut chunk = vec![0u8; SYNC_DATA_MAX];
        loop {
            let n = read_chunk(reader, &mut chunk).await?;
            if n == 0 {
                break;
            }
            self.send_header(&ID_DATA, n as u32).await?;
            self.stream.write_all(&chunk[..n]).await?;
            self.stream.flush().await?;
            if let Some(report) = tracker.advance(n as u64)
                && let Some(cb) = progress.as_deref_mut()
            {
                cb(report);
            }
        }
        if tracker.transferred() != size {
            log::warn!(
                "push: local file changed size during transfer ({} of {} bytes sent)",
                tracker.transferred(),
                size
            );
        }
        if let Some(report) = tracker.finish(false)
            && let Some(cb) = progress.as_deref_mut()
        {
            cb(report);
        }

        self.send_header(&ID_DONE, mtime).await?;
        self.stream.flush().await?;

        let (id, arg) = self.read_header().await?;
        match id {
            ID_OKAY => Ok(()),
            ID_FAIL => Err(self.read_fail(arg).await),
            other => Err(AdbError::protocol(format!(
                "unexpected push response '{}'",
                tag(&other)
            ))),
        }
    }

    /// Download `remote`, writing into `sink` when given. Returns the number
    /// of bytes received.
    pub async fn recv_file<W>(
        &mut self,
        remote: &str,
        sink: Option<&mut W>,
        total: Option<u64>,
        progress: Option<ProgressFn<'_>>,
    ) -> AdbResult<u64>
    where
        W: AsyncWrite + Unpin + ?Sized,
    {
        let result = self.recv_file_inner(remote, sink, total, progress).await;
        self.quit_logged("pull").await;
        result
    }

    async fn recv_file_inner<W>(
        &mut self,
        remote: &str,
        mut sink: Option<&mut W>,
        total: Option<u64>,
        mut progress: Option<ProgressFn<'_>>,
    ) -> AdbResult<u64>
    where
        W: AsyncWrite + Unpin + ?Sized,
    {
        self.send_request(&ID_RECV, remote).await?;

        let mut tracker = ProgressTracker::new(total).deferring_completion();
        let mut buf = vec![0u8; SYNC_DATA_MAX];
        while let Some((id, arg)) = self.read_header_or_eof("pull").await? {
            match id {
                ID_DATA => {
                    let len = arg as usize;
                    if len > SYNC_DATA_MAX {
                        return Err(AdbError::protocol(format!(
                            "DATA block of {len} bytes exceeds {SYNC_DATA_MAX}"
                        )));
                    }
                    self.stream.read_exact(&mut buf[..len]).await?;
                    if let Some(out) = sink.as_mut() {
                        out.write_all(&buf[..len]).await?;
                    }
                    if let Some(report) = tracker.advance(len as u64)
                        && let Some(cb) = progress.as_deref_mut()
                    {
                        cb(report);
                    }
                }
                ID_DONE => break,
                ID_FAIL => return Err(self.read_fail(arg).await),
                [0, 0, 0, 0] => {
                    log::warn!("pull: all-zero header, treating as end of file");
                    break;
                }
                other => {
                    return Err(AdbError::protocol(format!(
                        "unexpected pull response '{}'",
                        tag(&other)
                    )));
                }
            }
        }

        if let Some(out) = sink.as_mut() {
            out.flush().await?;
        }
        if let Some(report) = tracker.finish(true)
            && let Some(cb) = progress.as_deref_mut()
        {
            cb(report);
        }
        Ok(tracker.transferred())
    }

    /// Close the underlying stream. Failures here are secondary and only
    /// logged.
    pub async fn finish(mut self) {
        if let Err(e) = self.stream.shutdown().await {
            log::warn!("Error closing sync stream: {e}");
        }
    }
}

/// Fill `buf` as far as the reader allows so every DATA frame except the
/// last is exactly `SYNC_DATA_MAX` bytes.
async fn read_chunk<R>(reader: &mut R, buf: &mut [u8]) -> AdbResult<usize>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let mut filled = 0;
    while filled < buf.len() {
        let n = reader.read(&mut buf[filled..]).await?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}

pub fn unix_now() -> u32 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as u32)
        .unwrap_or(0)
}
