//! Uniform instrument communication over TCP, UDP and serial lines.
//!
//! `instrio` gives one programmatic interface to laboratory and industrial
//! devices whose replies arrive asynchronously in fragments and whose
//! message boundaries are defined by rules (a terminator, a byte count, a
//! quiet gap) rather than by the transport. Each [`Adapter`] owns a worker
//! thread running a select loop over its endpoint; callers talk to the
//! worker through typed commands, synchronously or asynchronously. Protocol
//! layers ([`protocol::Raw`], [`protocol::Delimited`], [`protocol::Scpi`],
//! [`protocol::Modbus`]) translate between adapter frames and their own
//! payload types.
//!
//! ```no_run
//! use instrio::{Adapter, Descriptor};
//! use instrio::protocol::Scpi;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let multimeter = Scpi::new(Adapter::new(Descriptor::tcp_host("192.168.1.26"))).await?;
//!     multimeter.open().await?;
//!     let volts: f64 = multimeter.query("MEAS:VOLT:DC?").await?.parse()?;
//!     println!("{volts} V");
//!     Ok(())
//! }
//! ```

pub mod adapter;
pub mod descriptor;
pub mod error;
pub mod fragment;
pub mod protocol;
pub mod stop;
pub mod timeout;

mod transport;
mod worker;

#[cfg(test)]
mod tests;

pub use adapter::{Adapter, AdapterBuilder, AdapterEvent, ReadOptions, ReadScope};
pub use descriptor::{Descriptor, FlowControl};
pub use error::{Error, Result};
pub use fragment::{Fragment, Frame, StopKind};
pub use stop::StopCondition;
pub use timeout::{Timeout, TimeoutAction};
