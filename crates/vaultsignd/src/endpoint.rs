//! Transport over a USB FunctionFS bulk endpoint pair.
//!
//! The gadget function exposes two character devices: the OUT endpoint is
//! read (host-to-gadget), the IN endpoint is written (gadget-to-host).
//! Endpoint errors are classified through [`TransportError::classify`], so
//! the usual rebind/reopen errnos stay retryable and the broker keeps the
//! link alive across host reconnects.

use async_trait::async_trait;
use std::path::Path;
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::Mutex;
use vaultsign_broker::{Transport, TransportError};

/// Byte pipe over two endpoint character devices.
pub struct EndpointTransport {
    reader: Mutex<File>,
    writer: Mutex<File>,
}

impl EndpointTransport {
    /// Open the OUT (read) and IN (write) endpoint devices.
    pub async fn open(ep_out: &Path, ep_in: &Path) -> std::io::Result<Self> {
        let reader = OpenOptions::new().read(true).open(ep_out).await?;
        let writer = OpenOptions::new().write(true).open(ep_in).await?;
        Ok(Self {
            reader: Mutex::new(reader),
            writer: Mutex::new(writer),
        })
    }
}

#[async_trait]
impl Transport for EndpointTransport {
    async fn read(&self, buf: &mut [u8]) -> Result<usize, TransportError> {
        let mut reader = self.reader.lock().await;
        reader.read(buf).await.map_err(TransportError::classify)
    }

    async fn write(&self, buf: &[u8]) -> Result<usize, TransportError> {
        let mut writer = self.writer.lock().await;
        writer.write(buf).await.map_err(TransportError::classify)
    }
}
