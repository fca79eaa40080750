// Host identity used for ADB authentication, TLS client certificates and pairing
use super::error::{AdbError, AdbResult};
use std::path::{Path, PathBuf};

/// The RSA identity of this host. The signature scheme itself lives
/// outside the crate; implementations wrap whatever key store the platform
/// provides.
pub trait AdbKeyPair: Send + Sync {
    /// Sign the 20-byte AUTH token sent by the device.
    fn sign_token(&self, token: &[u8]) -> AdbResult<Vec<u8>>;

    /// Android-encoded public key followed by ` <name>`, as sent in
    /// `AUTH RSAPUBLICKEY` and in pairing PeerInfo.
    fn public_key_payload(&self) -> Vec<u8>;

    fn key_name(&self) -> &str;

    /// PKCS#8 DER private key, used to issue the TLS client certificate.
    fn private_key_pkcs8(&self) -> Vec<u8>;
}

/// `~/.android/adbkey`, the location the platform tools use.
pub fn default_key_path() -> AdbResult<PathBuf> {
    homedir::my_home()
        .ok()
        .flatten()
        .map(|home| home.join(".android").join("adbkey"))
        .ok_or(AdbError::HomeDirectoryNotFound)
}

pub fn ensure_key_exists(path: &Path) -> AdbResult<()> {
    if path.exists() {
        Ok(())
    } else {
        Err(AdbError::KeyNotFound {
            path: path.to_path_buf(),
        })
    }
}

/// Append the NUL the device expects after a public key blob.
pub(crate) fn public_key_message(key: &dyn AdbKeyPair) -> Vec<u8> {
    let mut payload = key.public_key_payload();
    if payload.last() != Some(&0) {
        payload.push(0);
    }
    payload
}
