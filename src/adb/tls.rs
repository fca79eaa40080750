// TLS client setup shared by the ADB STLS upgrade and the pairing handshake
use super::auth::AdbKeyPair;
use super::error::{AdbError, AdbResult};
use rustls::DigitallySignedStruct;
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer, ServerName, UnixTime};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_rustls::TlsConnector;
use tokio_rustls::client::TlsStream;

/// Label adbd uses for the pairing key exporter.
pub const EXPORTED_KEY_LABEL: &[u8] = b"adb-label\0";
pub const EXPORT_KEY_SIZE: usize = 64;

/// Devices present self-signed certificates; trust is established by the
/// pairing exchange, not by a CA.
#[derive(Debug)]
struct AcceptAnyServerCert;

impl ServerCertVerifier for AcceptAnyServerCert {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        vec![
            rustls::SignatureScheme::RSA_PKCS1_SHA256,
            rustls::SignatureScheme::RSA_PKCS1_SHA384,
            rustls::SignatureScheme::RSA_PKCS1_SHA512,
            rustls::SignatureScheme::ECDSA_NISTP256_SHA256,
            rustls::SignatureScheme::ECDSA_NISTP384_SHA384,
            rustls::SignatureScheme::RSA_PSS_SHA256,
            rustls::SignatureScheme::RSA_PSS_SHA384,
            rustls::SignatureScheme::RSA_PSS_SHA512,
            rustls::SignatureScheme::ED25519,
        ]
    }
}

/// Self-signed certificate over the host key, presented as the TLS client
/// identity. adbd matches it against the keys it has paired with.
fn client_certificate(key: &dyn AdbKeyPair) -> AdbResult<(CertificateDer<'static>, PrivateKeyDer<'static>)> {
    let pkcs8 = key.private_key_pkcs8();
    let key_pair = rcgen::KeyPair::try_from(pkcs8.as_slice())?;

    let mut params = rcgen::CertificateParams::new(Vec::<String>::new())?;
    params
        .distinguished_name
        .push(rcgen::DnType::CommonName, key.key_name());
    let cert = params.self_signed(&key_pair)?;

    Ok((
        cert.der().clone(),
        PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(pkcs8)),
    ))
}

/// Build the rustls client configuration for a host identity. TLS 1.3 only,
/// ring provider.
pub fn client_config(key: &dyn AdbKeyPair) -> AdbResult<Arc<rustls::ClientConfig>> {
    let (cert, private_key) = client_certificate(key)?;
    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let config = rustls::ClientConfig::builder_with_provider(provider)
        .with_protocol_versions(&[&rustls::version::TLS13])?
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(AcceptAnyServerCert))
        .with_client_auth_cert(vec![cert], private_key)?;
    Ok(Arc::new(config))
}

fn server_name(host: &str) -> ServerName<'static> {
    let host = host.trim_matches(|c| c == '[' || c == ']').to_string();
    ServerName::try_from(host)
        .unwrap_or_else(|_| ServerName::from(std::net::IpAddr::V4(std::net::Ipv4Addr::LOCALHOST)))
}

/// Run the client handshake over an existing byte stream. A TLS alert from
/// the device means it does not know our certificate yet.
pub async fn connect<IO>(
    config: Arc<rustls::ClientConfig>,
    host: &str,
    io: IO,
) -> AdbResult<TlsStream<IO>>
where
    IO: AsyncRead + AsyncWrite + Unpin,
{
    let connector = TlsConnector::from(config);
    connector
        .connect(server_name(host), io)
        .await
        .map_err(classify_handshake_error)
}

fn classify_handshake_error(err: std::io::Error) -> AdbError {
    let tls_error = err
        .get_ref()
        .and_then(|inner| inner.downcast_ref::<rustls::Error>())
        .cloned();
    match tls_error {
        Some(rustls::Error::AlertReceived(alert)) => {
            log::debug!("TLS handshake rejected by device: {alert:?}");
            AdbError::PairingRequired
        }
        Some(other) => AdbError::Tls { source: other },
        None => AdbError::Io { source: err },
    }
}

/// Keying material both sides mix into the pairing password.
pub fn export_pairing_key<IO>(stream: &TlsStream<IO>) -> AdbResult<[u8; EXPORT_KEY_SIZE]> {
    let (_, connection) = stream.get_ref();
    let material =
        connection.export_keying_material([0u8; EXPORT_KEY_SIZE], EXPORTED_KEY_LABEL, None)?;
    Ok(material)
}
