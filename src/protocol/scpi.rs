// ABOUTME: SCPI protocol: newline-delimited command language spoken by most test instruments
// ABOUTME: A Delimited specialization with port 5025, a 5-second timeout and command validation

use super::delimited::{Delimited, DelimitedBuilder, DelimitedEvent};
use crate::adapter::Adapter;
use crate::error::{Error, Result};
use crate::timeout::Timeout;
use std::time::Duration;

/// Well-known SCPI-over-TCP port, injected when the descriptor has none.
pub const SCPI_DEFAULT_PORT: u16 = 5025;

const SCPI_DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

/// SCPI instrument protocol.
///
/// Newline-terminated [`Delimited`] text with instrument-friendly defaults.
/// Refuses to layer over an adapter whose stop conditions were configured by
/// the caller: SCPI framing relies on exclusive control of the terminator.
///
/// ```no_run
/// use instrio::{Adapter, Descriptor};
/// use instrio::protocol::Scpi;
///
/// #[tokio::main]
/// async fn main() -> instrio::Result<()> {
///     let instrument = Scpi::new(Adapter::new(Descriptor::tcp_host("192.168.1.26"))).await?;
///     let identity = instrument.query("*IDN?").await?;
///     println!("connected to {identity}");
///     Ok(())
/// }
/// ```
pub struct Scpi {
    line: Delimited,
}

impl Scpi {
    pub async fn new(adapter: Adapter) -> Result<Scpi> {
        Self::check_adapter(&adapter)?;
        adapter.set_default_port(SCPI_DEFAULT_PORT).await?;
        let line = DelimitedBuilder::new(adapter)
            .terminator(&b"\n"[..])
            .default_timeout(Timeout::new(SCPI_DEFAULT_TIMEOUT))
            .build()
            .await?;
        Ok(Scpi { line })
    }

    pub fn new_blocking(adapter: Adapter) -> Result<Scpi> {
        Self::check_adapter(&adapter)?;
        adapter.blocking_set_default_port(SCPI_DEFAULT_PORT)?;
        let line = DelimitedBuilder::new(adapter)
            .terminator(&b"\n"[..])
            .default_timeout(Timeout::new(SCPI_DEFAULT_TIMEOUT))
            .build_blocking()?;
        Ok(Scpi { line })
    }

    fn check_adapter(adapter: &Adapter) -> Result<()> {
        if adapter.has_custom_stop_conditions() {
            return Err(Error::Configuration(
                "SCPI cannot layer over an adapter with caller-configured stop conditions"
                    .into(),
            ));
        }
        Ok(())
    }

    /// Stray terminators inside a command would silently split it into two.
    fn check_command(command: &str) -> Result<()> {
        if command.contains(['\n', '\r']) {
            return Err(Error::Configuration(format!(
                "SCPI command {command:?} contains a line terminator"
            )));
        }
        Ok(())
    }

    pub fn adapter(&self) -> &Adapter {
        self.line.adapter()
    }

    pub async fn open(&self) -> Result<()> {
        self.line.open().await
    }

    pub fn blocking_open(&self) -> Result<()> {
        self.line.blocking_open()
    }

    pub async fn close(&self) -> Result<()> {
        self.line.close().await
    }

    pub fn blocking_close(&self) -> Result<()> {
        self.line.blocking_close()
    }

    /// Sends a command that expects no reply (`*RST`, `*CLS`, settings).
    pub async fn write(&self, command: &str) -> Result<()> {
        Self::check_command(command)?;
        self.line.write(command).await
    }

    pub fn blocking_write(&self, command: &str) -> Result<()> {
        Self::check_command(command)?;
        self.line.blocking_write(command)
    }

    /// Reads one response line.
    pub async fn read(&self) -> Result<String> {
        self.line.read().await
    }

    pub fn blocking_read(&self) -> Result<String> {
        self.line.blocking_read()
    }

    /// Sends a query (`*IDN?`, `MEAS:VOLT:DC?`) and returns the response.
    pub async fn query(&self, command: &str) -> Result<String> {
        Self::check_command(command)?;
        self.line.query(command).await
    }

    pub fn blocking_query(&self, command: &str) -> Result<String> {
        Self::check_command(command)?;
        self.line.blocking_query(command)
    }

    pub async fn set_event_callback(
        &self,
        callback: impl Fn(DelimitedEvent) + Send + Sync + 'static,
    ) -> Result<()> {
        self.line.set_event_callback(callback).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn embedded_terminators_are_rejected() {
        assert!(Scpi::check_command("*IDN?").is_ok());
        assert!(Scpi::check_command("MEAS\nVOLT?").is_err());
        assert!(Scpi::check_command("MEAS\rVOLT?").is_err());
    }
}
