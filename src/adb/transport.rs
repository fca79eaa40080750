// Transport selection: every endpoint ends up as one boxed byte stream
use super::error::{AdbError, AdbResult};
use super::types::{HostPort, TransportKind};
use super::usb::{self, UsbAccessory};
use std::fmt;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;

pub trait AdbIo: AsyncRead + AsyncWrite + Unpin + Send {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send> AdbIo for T {}

pub type BoxedIo = Box<dyn AdbIo>;

/// One concrete way of reaching a device.
#[derive(Clone)]
pub enum Endpoint {
    Usb(Arc<dyn UsbAccessory>),
    Tls(HostPort),
    Tcp(HostPort),
}

impl Endpoint {
    /// The transport this endpoint was requested as. A TLS endpoint whose
    /// device never asks for STLS still ends up as plain TCP.
    pub fn requested_kind(&self) -> TransportKind {
        match self {
            Endpoint::Usb(_) => TransportKind::Usb,
            Endpoint::Tls(_) => TransportKind::Tls,
            Endpoint::Tcp(_) => TransportKind::Tcp,
        }
    }

    pub fn host(&self) -> Option<&str> {
        match self {
            Endpoint::Usb(_) => None,
            Endpoint::Tls(hp) | Endpoint::Tcp(hp) => Some(&hp.host),
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Endpoint::Usb(usb) => write!(f, "usb:{}", usb.id()),
            Endpoint::Tls(hp) => write!(f, "tls:{hp}"),
            Endpoint::Tcp(hp) => write!(f, "tcp:{hp}"),
        }
    }
}

impl fmt::Debug for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

pub async fn connect_tcp(address: &HostPort) -> AdbResult<TcpStream> {
    let host = address.host.trim_matches(|c| c == '[' || c == ']');
    let stream = TcpStream::connect((host, address.port))
        .await
        .map_err(|e| AdbError::from_connect_error(address.to_string(), e))?;
    stream.set_nodelay(true)?;
    Ok(stream)
}

/// Open the raw byte stream for an endpoint. TLS is negotiated later, in
/// band, when the device sends STLS.
pub async fn open(endpoint: &Endpoint, usb_open_attempts: u32) -> AdbResult<BoxedIo> {
    match endpoint {
        Endpoint::Usb(accessory) => usb::open_with_retry(accessory.as_ref(), usb_open_attempts).await,
        Endpoint::Tls(address) | Endpoint::Tcp(address) => {
            let stream = connect_tcp(address).await?;
            log::debug!("TCP connected to {address}");
            Ok(Box::new(stream))
        }
    }
}
