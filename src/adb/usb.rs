// USB accessory transport: the platform adapter hands us an opened bulk pipe
use super::error::{AdbError, AdbResult};
use super::transport::BoxedIo;
use async_trait::async_trait;
use std::time::Duration;

/// A USB accessory exposing the ADB interface. Claiming the interface and
/// pumping bulk transfers is done by the platform adapter; the engine only
/// sees a bidirectional byte stream carrying ADB messages.
#[async_trait]
pub trait UsbAccessory: Send + Sync {
    /// Stable identifier, e.g. the bus path or USB serial.
    fn id(&self) -> String;

    async fn open(&self) -> AdbResult<BoxedIo>;
}

const OPEN_TIMEOUT: Duration = Duration::from_secs(10);
const RETRY_DELAY: Duration = Duration::from_millis(500);

fn is_busy(err: &AdbError) -> bool {
    match err {
        AdbError::Io { source } => {
            source.kind() == std::io::ErrorKind::ResourceBusy
                || source.to_string().contains("Resource busy")
        }
        _ => false,
    }
}

/// Open the accessory, retrying while another process still holds the
/// interface.
pub async fn open_with_retry(accessory: &dyn UsbAccessory, max_attempts: u32) -> AdbResult<BoxedIo> {
    let max_attempts = max_attempts.max(1);
    for attempt in 1..=max_attempts {
        match tokio::time::timeout(OPEN_TIMEOUT, accessory.open()).await {
            Ok(Ok(io)) => {
                if attempt > 1 {
                    log::debug!("USB {} opened on attempt {}", accessory.id(), attempt);
                }
                return Ok(io);
            }
            Ok(Err(e)) if attempt < max_attempts && is_busy(&e) => {
                log::warn!(
                    "USB {} busy (attempt {}/{}): {}",
                    accessory.id(),
                    attempt,
                    max_attempts,
                    e
                );
                tokio::time::sleep(RETRY_DELAY).await;
            }
            Ok(Err(e)) => return Err(e),
            Err(_) => {
                return Err(AdbError::timeout(
                    OPEN_TIMEOUT,
                    format!("opening USB accessory {}", accessory.id()),
                ));
            }
        }
    }
    Err(AdbError::Unknown {
        description: format!("USB accessory {} could not be opened", accessory.id()),
    })
}
