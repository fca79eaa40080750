// Remote command execution over `shell:` streams
use super::error::AdbResult;
use super::session::{LocalService, Session};
use super::types::DeviceIdentity;
use tokio::io::AsyncReadExt;

/// Run `command` on the device and return its trimmed output. The device
/// closes the stream when the command exits.
pub async fn run_command(session: &Session, command: &str) -> AdbResult<String> {
    let mut stream = session.open_service(LocalService::Shell, &[command]).await?;
    let mut output = Vec::new();
    stream.read_to_end(&mut output).await?;
    if let Err(e) = stream.close().await {
        log::debug!("shell stream close after '{command}': {e}");
    }
    Ok(String::from_utf8_lossy(&output).trim().to_string())
}

pub async fn getprop(session: &Session, property: &str) -> AdbResult<String> {
    run_command(session, &format!("getprop {property}")).await
}

/// Brand, model and serial of the connected device.
pub async fn identify(session: &Session) -> AdbResult<DeviceIdentity> {
    let brand = getprop(session, "ro.product.brand").await?;
    let model = getprop(session, "ro.product.model").await?;
    let serial = getprop(session, "ro.serialno").await?;
    log::debug!("Identified device: {brand} {model} ({serial})");
    Ok(DeviceIdentity {
        brand,
        model,
        serial,
    })
}
