// ABOUTME: Protocol layers above the adapter: thin translators between frames and payload types
// ABOUTME: Raw passes bytes through, Delimited/SCPI speak terminated text, Modbus speaks binary PDUs

pub mod delimited;
pub mod modbus;
pub mod raw;
pub mod scpi;

pub use delimited::{Delimited, DelimitedBuilder, DelimitedEvent};
pub use modbus::{Modbus, ModbusError};
pub use raw::Raw;
pub use scpi::Scpi;

use crate::error::Error;
use bytes::Bytes;

/// Text encoding used by the line-oriented protocols.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Encoding {
    #[default]
    Utf8,
    Ascii,
}

impl Encoding {
    pub(crate) fn encode(&self, text: &str) -> Result<Bytes, Error> {
        match self {
            Encoding::Utf8 => Ok(Bytes::copy_from_slice(text.as_bytes())),
            Encoding::Ascii => {
                if !text.is_ascii() {
                    return Err(Error::Configuration(format!(
                        "command {text:?} is not ASCII"
                    )));
                }
                Ok(Bytes::copy_from_slice(text.as_bytes()))
            }
        }
    }

    pub(crate) fn decode(&self, data: &[u8]) -> Result<String, Error> {
        match self {
            Encoding::Utf8 => std::str::from_utf8(data).map(str::to_owned).map_err(|e| {
                Error::Configuration(format!("response is not valid UTF-8: {e}"))
            }),
            Encoding::Ascii => {
                if !data.is_ascii() {
                    return Err(Error::Configuration("response is not ASCII".into()));
                }
                // ASCII is a UTF-8 subset.
                Ok(String::from_utf8_lossy(data).into_owned())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ascii_encoding_rejects_non_ascii() {
        assert!(Encoding::Ascii.encode("MEAS:VOLT?").is_ok());
        assert!(Encoding::Ascii.encode("média").is_err());
        assert!(Encoding::Ascii.decode(&[0x80]).is_err());
    }

    #[test]
    fn utf8_roundtrip() {
        let bytes = Encoding::Utf8.encode("température").unwrap();
        assert_eq!(Encoding::Utf8.decode(&bytes).unwrap(), "température");
    }
}
