// Multi-register value packing.
//
// Modbus transfers 16-bit registers big-endian on the wire, but devices
// disagree on how wider values map onto consecutive registers: both the byte
// order inside a register and the word order across registers vary in the
// field. The layout type makes both explicit.

use super::ModbusError;
use crate::Error;

/// Byte order inside one 16-bit register.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ByteOrder {
    /// Most significant byte first (Modbus wire default).
    #[default]
    Big,
    Little,
}

/// Register order for values spanning multiple registers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WordOrder {
    /// Most significant register first (Modbus convention).
    #[default]
    Big,
    Little,
}

/// How a device lays out multi-register values.
///
/// ```
/// use instrio::protocol::modbus::{ByteOrder, RegisterLayout, WordOrder};
///
/// let standard = RegisterLayout::default();
/// assert_eq!(standard.encode_u32(0x0102_0304), vec![0x0102, 0x0304]);
///
/// let word_swapped = RegisterLayout::default().word_order(WordOrder::Little);
/// assert_eq!(word_swapped.encode_u32(0x0102_0304), vec![0x0304, 0x0102]);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RegisterLayout {
    byte_order: ByteOrder,
    word_order: WordOrder,
}

fn wrong_count(what: &str, expected: usize, got: usize) -> ModbusError {
    ModbusError::Adapter(Error::Configuration(format!(
        "{what} spans {expected} registers, got {got}"
    )))
}

impl RegisterLayout {
    pub fn new(byte_order: ByteOrder, word_order: WordOrder) -> RegisterLayout {
        RegisterLayout {
            byte_order,
            word_order,
        }
    }

    pub fn byte_order(mut self, order: ByteOrder) -> RegisterLayout {
        self.byte_order = order;
        self
    }

    pub fn word_order(mut self, order: WordOrder) -> RegisterLayout {
        self.word_order = order;
        self
    }

    /// Packs big-endian value bytes into registers under this layout.
    /// `bytes` must have even length.
    fn pack(&self, bytes: &[u8]) -> Vec<u16> {
        let mut words: Vec<u16> = bytes
            .chunks_exact(2)
            .map(|pair| {
                let word = u16::from_be_bytes([pair[0], pair[1]]);
                match self.byte_order {
                    ByteOrder::Big => word,
                    ByteOrder::Little => word.swap_bytes(),
                }
            })
            .collect();
        if self.word_order == WordOrder::Little {
            words.reverse();
        }
        words
    }

    /// Recovers big-endian value bytes from registers under this layout.
    fn unpack(&self, registers: &[u16]) -> Vec<u8> {
        let mut words: Vec<u16> = registers.to_vec();
        if self.word_order == WordOrder::Little {
            words.reverse();
        }
        words
            .into_iter()
            .flat_map(|word| {
                let word = match self.byte_order {
                    ByteOrder::Big => word,
                    ByteOrder::Little => word.swap_bytes(),
                };
                word.to_be_bytes()
            })
            .collect()
    }

    // ---- integers --------------------------------------------------------

    pub fn encode_u16(&self, value: u16) -> Vec<u16> {
        self.pack(&value.to_be_bytes())
    }

    pub fn decode_u16(&self, registers: &[u16]) -> Result<u16, ModbusError> {
        if registers.len() != 1 {
            return Err(wrong_count("u16", 1, registers.len()));
        }
        let bytes = self.unpack(registers);
        Ok(u16::from_be_bytes([bytes[0], bytes[1]]))
    }

    pub fn encode_u32(&self, value: u32) -> Vec<u16> {
        self.pack(&value.to_be_bytes())
    }

    pub fn decode_u32(&self, registers: &[u16]) -> Result<u32, ModbusError> {
        if registers.len() != 2 {
            return Err(wrong_count("u32", 2, registers.len()));
        }
        let bytes = self.unpack(registers);
        Ok(u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    pub fn encode_u64(&self, value: u64) -> Vec<u16> {
        self.pack(&value.to_be_bytes())
    }

    pub fn decode_u64(&self, registers: &[u16]) -> Result<u64, ModbusError> {
        if registers.len() != 4 {
            return Err(wrong_count("u64", 4, registers.len()));
        }
        let bytes = self.unpack(registers);
        let mut raw = [0u8; 8];
        raw.copy_from_slice(&bytes);
        Ok(u64::from_be_bytes(raw))
    }

    pub fn encode_i16(&self, value: i16) -> Vec<u16> {
        self.encode_u16(value as u16)
    }

    pub fn decode_i16(&self, registers: &[u16]) -> Result<i16, ModbusError> {
        Ok(self.decode_u16(registers)? as i16)
    }

    pub fn encode_i32(&self, value: i32) -> Vec<u16> {
        self.encode_u32(value as u32)
    }

    pub fn decode_i32(&self, registers: &[u16]) -> Result<i32, ModbusError> {
        Ok(self.decode_u32(registers)? as i32)
    }

    pub fn encode_i64(&self, value: i64) -> Vec<u16> {
        self.encode_u64(value as u64)
    }

    pub fn decode_i64(&self, registers: &[u16]) -> Result<i64, ModbusError> {
        Ok(self.decode_u64(registers)? as i64)
    }

    // ---- floats ----------------------------------------------------------

    pub fn encode_f32(&self, value: f32) -> Vec<u16> {
        self.encode_u32(value.to_bits())
    }

    pub fn decode_f32(&self, registers: &[u16]) -> Result<f32, ModbusError> {
        Ok(f32::from_bits(self.decode_u32(registers)?))
    }

    pub fn encode_f64(&self, value: f64) -> Vec<u16> {
        self.encode_u64(value.to_bits())
    }

    pub fn decode_f64(&self, registers: &[u16]) -> Result<f64, ModbusError> {
        Ok(f64::from_bits(self.decode_u64(registers)?))
    }

    // ---- strings and raw bytes -------------------------------------------

    /// Encodes an ASCII string into exactly `registers` registers, filling
    /// the tail with `pad`. Word order does not apply: character order
    /// follows register order.
    pub fn encode_string(
        &self,
        text: &str,
        registers: usize,
        pad: u8,
    ) -> Result<Vec<u16>, ModbusError> {
        if text.len() > 2 * registers {
            return Err(ModbusError::Adapter(Error::Configuration(format!(
                "string of {} bytes does not fit in {registers} registers",
                text.len()
            ))));
        }
        let mut bytes = text.as_bytes().to_vec();
        bytes.resize(2 * registers, pad);
        Ok(RegisterLayout::new(self.byte_order, WordOrder::Big).pack(&bytes))
    }

    /// Decodes registers into a string, trimming trailing `pad` and NUL
    /// bytes. Invalid UTF-8 is replaced, not rejected.
    pub fn decode_string(&self, registers: &[u16], pad: u8) -> String {
        let bytes = RegisterLayout::new(self.byte_order, WordOrder::Big).unpack(registers);
        let end = bytes
            .iter()
            .rposition(|&b| b != pad && b != 0)
            .map_or(0, |i| i + 1);
        String::from_utf8_lossy(&bytes[..end]).into_owned()
    }

    /// Encodes raw bytes, padding to a whole register with `pad`. Word order
    /// does not apply.
    pub fn encode_bytes(&self, data: &[u8], pad: u8) -> Vec<u16> {
        let mut bytes = data.to_vec();
        if bytes.len() % 2 != 0 {
            bytes.push(pad);
        }
        RegisterLayout::new(self.byte_order, WordOrder::Big).pack(&bytes)
    }

    pub fn decode_bytes(&self, registers: &[u16]) -> Vec<u8> {
        RegisterLayout::new(self.byte_order, WordOrder::Big).unpack(registers)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn u32_all_four_layouts() {
        let value = 0x0102_0304u32;
        let cases = [
            (ByteOrder::Big, WordOrder::Big, vec![0x0102, 0x0304]),
            (ByteOrder::Big, WordOrder::Little, vec![0x0304, 0x0102]),
            (ByteOrder::Little, WordOrder::Big, vec![0x0201, 0x0403]),
            (ByteOrder::Little, WordOrder::Little, vec![0x0403, 0x0201]),
        ];
        for (byte_order, word_order, expected) in cases {
            let layout = RegisterLayout::new(byte_order, word_order);
            let registers = layout.encode_u32(value);
            assert_eq!(registers, expected, "{byte_order:?}/{word_order:?}");
            assert_eq!(layout.decode_u32(&registers).unwrap(), value);
        }
    }

    #[test]
    fn negative_integers_roundtrip() {
        let layout = RegisterLayout::default();
        assert_eq!(layout.decode_i16(&layout.encode_i16(-2)).unwrap(), -2);
        assert_eq!(
            layout.decode_i32(&layout.encode_i32(-70_000)).unwrap(),
            -70_000
        );
        assert_eq!(
            layout
                .decode_i64(&layout.encode_i64(-5_000_000_000))
                .unwrap(),
            -5_000_000_000
        );
    }

    #[test]
    fn floats_roundtrip_in_swapped_layouts() {
        let layout = RegisterLayout::default().word_order(WordOrder::Little);
        let registers = layout.encode_f32(12.5);
        assert_eq!(layout.decode_f32(&registers).unwrap(), 12.5);

        let layout = RegisterLayout::default().byte_order(ByteOrder::Little);
        let registers = layout.encode_f64(-0.125);
        assert_eq!(layout.decode_f64(&registers).unwrap(), -0.125);
    }

    #[test]
    fn register_count_is_checked() {
        let layout = RegisterLayout::default();
        assert!(layout.decode_u32(&[1]).is_err());
        assert!(layout.decode_u64(&[1, 2, 3]).is_err());
    }

    #[test]
    fn strings_pad_and_trim() {
        let layout = RegisterLayout::default();
        let registers = layout.encode_string("PSU-1", 4, b' ').unwrap();
        assert_eq!(registers.len(), 4);
        assert_eq!(layout.decode_string(&registers, b' '), "PSU-1");

        assert!(layout.encode_string("TOO LONG FOR TWO", 2, b' ').is_err());
    }

    #[test]
    fn odd_byte_payloads_pad_to_a_register() {
        let layout = RegisterLayout::default();
        let registers = layout.encode_bytes(&[0xAA, 0xBB, 0xCC], 0x00);
        assert_eq!(registers, vec![0xAABB, 0xCC00]);
        assert_eq!(layout.decode_bytes(&registers), vec![0xAA, 0xBB, 0xCC, 0x00]);
    }
}
