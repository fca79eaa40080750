// ADB transport message framing and CNXN banner parsing
use super::error::{AdbError, AdbResult};
use std::collections::HashSet;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

pub const A_CNXN: u32 = 0x4e58_4e43;
pub const A_AUTH: u32 = 0x4854_5541;
pub const A_OPEN: u32 = 0x4e45_504f;
pub const A_OKAY: u32 = 0x5941_4b4f;
pub const A_CLSE: u32 = 0x4553_4c43;
pub const A_WRTE: u32 = 0x4554_5257;
pub const A_STLS: u32 = 0x534c_5453;

pub const A_VERSION_MIN: u32 = 0x0100_0000;
pub const A_VERSION_SKIP_CHECKSUM: u32 = 0x0100_0001;
pub const A_VERSION: u32 = A_VERSION_SKIP_CHECKSUM;
pub const A_STLS_VERSION: u32 = 0x0100_0000;

pub const MAX_PAYLOAD: u32 = 1024 * 1024;
pub const HEADER_SIZE: usize = 24;

pub const AUTH_TOKEN: u32 = 1;
pub const AUTH_SIGNATURE: u32 = 2;
pub const AUTH_RSAPUBLICKEY: u32 = 3;

/// Window advertised in OPEN when delayed acknowledgement is negotiated.
pub const INITIAL_DELAYED_ACK_BYTES: u32 = 32 * 1024 * 1024;

pub const FEATURE_STAT_V2: &str = "stat_v2";
pub const FEATURE_LS_V2: &str = "ls_v2";
pub const FEATURE_DELAYED_ACK: &str = "delayed_ack";

const HOST_FEATURES: &[&str] = &[
    "shell_v2",
    "cmd",
    FEATURE_STAT_V2,
    FEATURE_LS_V2,
    "fixed_push_mkdir",
    "apex",
    "abb",
    "fixed_push_symlink_timestamp",
    "abb_exec",
    "remount_shell",
    "track_app",
    "sendrecv_v2",
    "openscreen_mdns",
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdbMessage {
    pub command: u32,
    pub arg0: u32,
    pub arg1: u32,
    pub payload: Vec<u8>,
}

impl AdbMessage {
    pub fn new(command: u32, arg0: u32, arg1: u32, payload: Vec<u8>) -> Self {
        Self {
            command,
            arg0,
            arg1,
            payload,
        }
    }

    pub fn connect(delayed_ack: bool) -> Self {
        let mut features = HOST_FEATURES.join(",");
        if delayed_ack {
            features.push(',');
            features.push_str(FEATURE_DELAYED_ACK);
        }
        let banner = format!("host::features={features}");
        Self::new(A_CNXN, A_VERSION, MAX_PAYLOAD, banner.into_bytes())
    }

    pub fn stls() -> Self {
        Self::new(A_STLS, A_STLS_VERSION, 0, Vec::new())
    }

    pub fn auth(kind: u32, data: Vec<u8>) -> Self {
        Self::new(A_AUTH, kind, 0, data)
    }

    pub fn open(local_id: u32, window: u32, destination: &str) -> Self {
        let mut payload = destination.as_bytes().to_vec();
        payload.push(0);
        Self::new(A_OPEN, local_id, window, payload)
    }

    /// OKAY carrying the acknowledged byte count when delayed ack is on.
    pub fn ready(local_id: u32, remote_id: u32, acked: Option<u32>) -> Self {
        let payload = acked.map(|n| n.to_le_bytes().to_vec()).unwrap_or_default();
        Self::new(A_OKAY, local_id, remote_id, payload)
    }

    pub fn write(local_id: u32, remote_id: u32, data: Vec<u8>) -> Self {
        Self::new(A_WRTE, local_id, remote_id, data)
    }

    pub fn close(local_id: u32, remote_id: u32) -> Self {
        Self::new(A_CLSE, local_id, remote_id, Vec::new())
    }

    /// Serialize header and payload. The checksum is only computed for peers
    /// older than `A_VERSION_SKIP_CHECKSUM`.
    pub fn encode(&self, protocol_version: u32) -> Vec<u8> {
        let checksum = if protocol_version < A_VERSION_SKIP_CHECKSUM {
            checksum(&self.payload)
        } else {
            0
        };
        let mut out = Vec::with_capacity(HEADER_SIZE + self.payload.len());
        for word in [
            self.command,
            self.arg0,
            self.arg1,
            self.payload.len() as u32,
            checksum,
            self.command ^ 0xffff_ffff,
        ] {
            out.extend_from_slice(&word.to_le_bytes());
        }
        out.extend_from_slice(&self.payload);
        out
    }

    pub fn command_name(&self) -> String {
        command_name(self.command)
    }
}

pub fn checksum(data: &[u8]) -> u32 {
    data.iter().fold(0u32, |acc, b| acc.wrapping_add(*b as u32))
}

pub fn command_name(command: u32) -> String {
    let bytes = command.to_le_bytes();
    if bytes.iter().all(|b| b.is_ascii_uppercase()) {
        String::from_utf8_lossy(&bytes).into_owned()
    } else {
        format!("{command:#010x}")
    }
}

pub async fn write_message<W>(writer: &mut W, message: &AdbMessage, version: u32) -> AdbResult<()>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    writer.write_all(&message.encode(version)).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one message. `max_data` bounds the payload the peer may send.
pub async fn read_message<R>(reader: &mut R, max_data: u32) -> AdbResult<AdbMessage>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let mut header = [0u8; HEADER_SIZE];
    match reader.read_exact(&mut header).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
            return Err(AdbError::ConnectionClosed);
        }
        Err(e) => return Err(e.into()),
    }
    let word = |i: usize| u32::from_le_bytes([header[i], header[i + 1], header[i + 2], header[i + 3]]);
    let command = word(0);
    let data_length = word(12);
    let magic = word(20);

    if magic != command ^ 0xffff_ffff {
        return Err(AdbError::protocol(format!(
            "bad magic {magic:#010x} for command {}",
            command_name(command)
        )));
    }
    if data_length > max_data {
        return Err(AdbError::protocol(format!(
            "payload of {data_length} bytes exceeds limit {max_data}"
        )));
    }

    let mut payload = vec![0u8; data_length as usize];
    reader.read_exact(&mut payload).await?;
    Ok(AdbMessage {
        command,
        arg0: word(4),
        arg1: word(8),
        payload,
    })
}

/// What the device told us about itself in its CNXN.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct DeviceBanner {
    pub protocol_version: u32,
    pub max_data: u32,
    pub kind: String,
    pub properties: Vec<(String, String)>,
    pub features: HashSet<String>,
}

impl DeviceBanner {
    /// Parse `device::ro.product.name=x;ro.product.model=y;features=a,b`.
    pub fn parse(protocol_version: u32, max_data: u32, payload: &[u8]) -> Self {
        let text = String::from_utf8_lossy(payload);
        let text = text.trim_end_matches('\0');
        let mut pieces = text.splitn(3, ':');
        let kind = pieces.next().unwrap_or_default().to_string();
        let props = pieces.nth(1).unwrap_or_default();

        let mut properties = Vec::new();
        let mut features = HashSet::new();
        for prop in props.split(';').filter(|p| !p.is_empty()) {
            let Some((key, value)) = prop.split_once('=') else {
                continue;
            };
            if key == "features" {
                features.extend(
                    value
                        .split(',')
                        .filter(|f| !f.is_empty())
                        .map(str::to_string),
                );
            }
            properties.push((key.to_string(), value.to_string()));
        }

        Self {
            protocol_version,
            max_data,
            kind,
            properties,
            features,
        }
    }

    pub fn has_feature(&self, feature: &str) -> bool {
        self.features.contains(feature)
    }

    pub fn property(&self, key: &str) -> Option<&str> {
        self.properties
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_header_layout() {
        let msg = AdbMessage::open(7, 0, "shell:ls");
        let bytes = msg.encode(A_VERSION_MIN);
        assert_eq!(&bytes[0..4], b"OPEN");
        assert_eq!(u32::from_le_bytes(bytes[4..8].try_into().unwrap()), 7);
        assert_eq!(u32::from_le_bytes(bytes[12..16].try_into().unwrap()), 9);
        assert_eq!(
            u32::from_le_bytes(bytes[16..20].try_into().unwrap()),
            checksum(b"shell:ls\0")
        );
        assert_eq!(
            u32::from_le_bytes(bytes[20..24].try_into().unwrap()),
            A_OPEN ^ 0xffff_ffff
        );
        assert_eq!(&bytes[24..], b"shell:ls\0");
    }

    #[test]
    fn test_checksum_skipped_for_new_peers() {
        let bytes = AdbMessage::write(1, 2, b"abc".to_vec()).encode(A_VERSION_SKIP_CHECKSUM);
        assert_eq!(&bytes[16..20], &[0, 0, 0, 0]);
    }

    #[tokio::test]
    async fn test_read_message_rejects_bad_magic() {
        let mut bytes = AdbMessage::close(1, 2).encode(A_VERSION);
        bytes[20] ^= 0xff;
        let err = read_message(&mut bytes.as_slice(), MAX_PAYLOAD).await.unwrap_err();
        assert!(err.is_protocol_violation(), "got {err:?}");
    }

    #[tokio::test]
    async fn test_read_message_rejects_oversized_payload() {
        let bytes = AdbMessage::write(1, 2, vec![0u8; 32]).encode(A_VERSION);
        let err = read_message(&mut bytes.as_slice(), 16).await.unwrap_err();
        assert!(err.is_protocol_violation(), "got {err:?}");
    }

    #[tokio::test]
    async fn test_read_message_round_trip() {
        let msg = AdbMessage::write(3, 9, b"hello".to_vec());
        let bytes = msg.encode(A_VERSION);
        let decoded = read_message(&mut bytes.as_slice(), MAX_PAYLOAD).await.unwrap();
        assert_eq!(decoded, msg);
        assert_eq!(decoded.command_name(), "WRTE");
    }

    #[test]
    fn test_banner_features() {
        let banner = DeviceBanner::parse(
            A_VERSION,
            MAX_PAYLOAD,
            b"device::ro.product.name=oriole;ro.product.model=Pixel 6;features=shell_v2,stat_v2,ls_v2\0",
        );
        assert_eq!(banner.kind, "device");
        assert!(banner.has_feature("stat_v2"));
        assert!(banner.has_feature("ls_v2"));
        assert!(!banner.has_feature("delayed_ack"));
        assert_eq!(banner.property("ro.product.model"), Some("Pixel 6"));
    }

    #[test]
    fn test_banner_without_properties() {
        let banner = DeviceBanner::parse(A_VERSION_MIN, 4096, b"device::");
        assert!(banner.features.is_empty());
        assert!(banner.properties.is_empty());
    }
}
