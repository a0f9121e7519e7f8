// ABOUTME: Raw protocol: identity translation, bytes in and bytes out
// ABOUTME: Only contributes a 2-second default response timeout on top of the adapter

use crate::adapter::{Adapter, ReadOptions};
use crate::error::Result;
use crate::timeout::Timeout;
use bytes::Bytes;
use std::time::Duration;

const RAW_DEFAULT_TIMEOUT: Duration = Duration::from_secs(2);

/// Bytes-passthrough protocol.
pub struct Raw {
    adapter: Adapter,
}

impl Raw {
    pub async fn new(adapter: Adapter) -> Result<Raw> {
        adapter
            .set_default_timeout(Timeout::new(RAW_DEFAULT_TIMEOUT))
            .await?;
        Ok(Raw { adapter })
    }

    pub fn new_blocking(adapter: Adapter) -> Result<Raw> {
        adapter.blocking_set_default_timeout(Timeout::new(RAW_DEFAULT_TIMEOUT))?;
        Ok(Raw { adapter })
    }

    pub fn adapter(&self) -> &Adapter {
        &self.adapter
    }

    pub fn into_inner(self) -> Adapter {
        self.adapter
    }

    pub async fn open(&self) -> Result<()> {
        self.adapter.open().await
    }

    pub fn blocking_open(&self) -> Result<()> {
        self.adapter.blocking_open()
    }

    pub async fn close(&self) -> Result<()> {
        self.adapter.close().await
    }

    pub fn blocking_close(&self) -> Result<()> {
        self.adapter.blocking_close()
    }

    pub async fn write(&self, data: impl AsRef<[u8]>) -> Result<()> {
        self.adapter.write(data).await
    }

    pub fn blocking_write(&self, data: impl AsRef<[u8]>) -> Result<()> {
        self.adapter.blocking_write(data)
    }

    pub async fn read(&self) -> Result<Bytes> {
        self.adapter.read().await
    }

    pub fn blocking_read(&self) -> Result<Bytes> {
        self.adapter.blocking_read()
    }

    pub async fn read_with(&self, options: ReadOptions) -> Result<Bytes> {
        self.adapter.read_with(options).await
    }

    pub fn blocking_read_with(&self, options: ReadOptions) -> Result<Bytes> {
        self.adapter.blocking_read_with(options)
    }

    pub async fn query(&self, data: impl AsRef<[u8]>) -> Result<Bytes> {
        self.adapter.query(data).await
    }

    pub fn blocking_query(&self, data: impl AsRef<[u8]>) -> Result<Bytes> {
        self.adapter.blocking_query(data)
    }
}
