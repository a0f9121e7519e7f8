// ABOUTME: Delimited protocol: terminator-framed text over any adapter
// ABOUTME: Installs a Termination stop condition and translates frames to decoded strings

use super::Encoding;
use crate::adapter::{Adapter, AdapterEvent, ReadOptions};
use crate::error::Result;
use crate::stop::StopCondition;
use crate::timeout::Timeout;
use bytes::{Bytes, BytesMut};
use std::time::Duration;

const DELIMITED_DEFAULT_TIMEOUT: Duration = Duration::from_secs(2);

/// Event delivered to a [`Delimited`] event callback.
#[derive(Debug, Clone)]
pub enum DelimitedEvent {
    /// A complete line arrived (terminator already stripped). Undecodable
    /// bytes are replaced rather than dropped.
    Message(String),
    Disconnected,
}

/// Configures a [`Delimited`] protocol layer.
pub struct DelimitedBuilder {
    adapter: Adapter,
    send_terminator: Bytes,
    receive_terminator: Bytes,
    encoding: Encoding,
    default_timeout: Timeout,
}

impl DelimitedBuilder {
    pub fn new(adapter: Adapter) -> DelimitedBuilder {
        DelimitedBuilder {
            adapter,
            send_terminator: Bytes::from_static(b"\n"),
            receive_terminator: Bytes::from_static(b"\n"),
            encoding: Encoding::default(),
            default_timeout: Timeout::new(DELIMITED_DEFAULT_TIMEOUT),
        }
    }

    /// Sets both terminators at once.
    pub fn terminator(mut self, terminator: impl Into<Bytes>) -> DelimitedBuilder {
        let terminator = terminator.into();
        self.send_terminator = terminator.clone();
        self.receive_terminator = terminator;
        self
    }

    /// Terminator appended to outgoing commands; may differ from the
    /// receive terminator.
    pub fn send_terminator(mut self, terminator: impl Into<Bytes>) -> DelimitedBuilder {
        self.send_terminator = terminator.into();
        self
    }

    /// Terminator that closes incoming frames.
    pub fn receive_terminator(mut self, terminator: impl Into<Bytes>) -> DelimitedBuilder {
        self.receive_terminator = terminator.into();
        self
    }

    pub fn encoding(mut self, encoding: Encoding) -> DelimitedBuilder {
        self.encoding = encoding;
        self
    }

    /// Default timeout installed when the caller never configured one.
    /// SCPI raises this to its own default.
    pub(crate) fn default_timeout(mut self, timeout: Timeout) -> DelimitedBuilder {
        self.default_timeout = timeout;
        self
    }

    pub async fn build(self) -> Result<Delimited> {
        self.adapter
            .set_default_stop_conditions(vec![StopCondition::termination(
                self.receive_terminator.clone(),
            )])
            .await?;
        self.adapter.set_default_timeout(self.default_timeout).await?;
        Ok(self.assemble())
    }

    pub fn build_blocking(self) -> Result<Delimited> {
        self.adapter
            .blocking_set_default_stop_conditions(vec![StopCondition::termination(
                self.receive_terminator.clone(),
            )])?;
        self.adapter
            .blocking_set_default_timeout(self.default_timeout)?;
        Ok(self.assemble())
    }

    fn assemble(self) -> Delimited {
        Delimited {
            adapter: self.adapter,
            send_terminator: self.send_terminator,
            receive_terminator: self.receive_terminator,
            encoding: self.encoding,
        }
    }
}

/// Terminator-framed text protocol (line-oriented devices).
///
/// Installs a [`StopCondition::Termination`] matching the receive terminator
/// on the adapter, so frames close exactly at message boundaries regardless
/// of how the transport fragments them. Reads strip the terminator and
/// decode with the configured encoding.
pub struct Delimited {
    adapter: Adapter,
    send_terminator: Bytes,
    receive_terminator: Bytes,
    encoding: Encoding,
}

impl Delimited {
    /// `\n`-terminated UTF-8 text over `adapter`.
    pub async fn new(adapter: Adapter) -> Result<Delimited> {
        DelimitedBuilder::new(adapter).build().await
    }

    pub fn new_blocking(adapter: Adapter) -> Result<Delimited> {
        DelimitedBuilder::new(adapter).build_blocking()
    }

    pub fn builder(adapter: Adapter) -> DelimitedBuilder {
        DelimitedBuilder::new(adapter)
    }

    pub fn adapter(&self) -> &Adapter {
        &self.adapter
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

    fn encode_command(&self, command: &str) -> Result<Bytes> {
        let body = self.encoding.encode(command)?;
        let mut framed = BytesMut::with_capacity(body.len() + self.send_terminator.len());
        framed.extend_from_slice(&body);
        framed.extend_from_slice(&self.send_terminator);
        Ok(framed.freeze())
    }

    fn decode_payload(&self, payload: &[u8]) -> Result<String> {
        let body = strip_terminator(payload, &self.receive_terminator);
        self.encoding.decode(body)
    }

    /// Sends `command` with the send terminator appended.
    pub async fn write(&self, command: &str) -> Result<()> {
        self.adapter.write(self.encode_command(command)?).await
    }

    pub fn blocking_write(&self, command: &str) -> Result<()> {
        self.adapter.blocking_write(self.encode_command(command)?)
    }

    /// Reads one message, strips the terminator and decodes it.
    pub async fn read(&self) -> Result<String> {
        self.read_with(ReadOptions::new()).await
    }

    pub fn blocking_read(&self) -> Result<String> {
        self.blocking_read_with(ReadOptions::new())
    }

    pub async fn read_with(&self, options: ReadOptions) -> Result<String> {
        let payload = self.adapter.read_with(options).await?;
        self.decode_payload(&payload)
    }

    pub fn blocking_read_with(&self, options: ReadOptions) -> Result<String> {
        let payload = self.adapter.blocking_read_with(options)?;
        self.decode_payload(&payload)
    }

    /// Flush, write, read atomically at the adapter façade.
    pub async fn query(&self, command: &str) -> Result<String> {
        let payload = self
            .adapter
            .query_with(self.encode_command(command)?, ReadOptions::new())
            .await?;
        self.decode_payload(&payload)
    }

    pub fn blocking_query(&self, command: &str) -> Result<String> {
        let payload = self
            .adapter
            .blocking_query_with(self.encode_command(command)?, ReadOptions::new())?;
        self.decode_payload(&payload)
    }

    /// Forwards adapter events as decoded messages. Runs on the worker
    /// thread; the callback must not block.
    pub async fn set_event_callback(
        &self,
        callback: impl Fn(DelimitedEvent) + Send + Sync + 'static,
    ) -> Result<()> {
        let terminator = self.receive_terminator.clone();
        self.adapter
            .set_event_callback(move |event| {
                let translated = match event {
                    AdapterEvent::Frame(frame) => {
                        let payload = frame.payload();
                        let body = strip_terminator(&payload, &terminator);
                        DelimitedEvent::Message(String::from_utf8_lossy(body).into_owned())
                    }
                    AdapterEvent::Disconnected => DelimitedEvent::Disconnected,
                };
                callback(translated);
            })
            .await
    }
}

fn strip_terminator<'a>(payload: &'a [u8], terminator: &[u8]) -> &'a [u8] {
    payload
        .strip_suffix(terminator)
        .unwrap_or(payload)
}
