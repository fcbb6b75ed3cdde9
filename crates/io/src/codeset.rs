//! Code-set converters for narrow and wide characters.
//!
//! The transmission code sets are negotiated through the `TAG_CODE_SETS`
//! service context. Conversion tables beyond ISO-8859-1, UTF-8, and UTF-16
//! are an external collaborator; these converters cover the sets the
//! runtime itself negotiates.

use crate::stream::{StreamIn, StreamOut, MINOR_BAD_STRING};
use orb_core::error::{CoreResult, SystemException};

/// ISO-8859-1 (Latin-1) code-set id.
pub const ISO_8859_1: u32 = 0x0001_0001;
/// UTF-8 code-set id.
pub const UTF_8: u32 = 0x0501_0001;
/// UTF-16 code-set id.
pub const UTF_16: u32 = 0x0001_0109;

/// Narrow-character converter selected per peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CharConverter {
    codeset: u32,
}

impl CharConverter {
    pub fn new(codeset: u32) -> CoreResult<Self> {
        match codeset {
            ISO_8859_1 | UTF_8 => Ok(Self { codeset }),
            _ => Err(SystemException::no_implement()),
        }
    }

    pub fn utf8() -> Self {
        Self { codeset: UTF_8 }
    }

    pub fn codeset(&self) -> u32 {
        self.codeset
    }

    /// Writes a narrow string in the negotiated set.
    pub fn write_string(&self, out: &mut StreamOut, value: &str) -> CoreResult<()> {
        match self.codeset {
            UTF_8 => {
                out.write_string(value);
                Ok(())
            }
            ISO_8859_1 => {
                let mut encoded = Vec::with_capacity(value.len() + 1);
                for ch in value.chars() {
                    let code = ch as u32;
                    if code > 0xFF {
                        return Err(SystemException::marshal(MINOR_BAD_STRING));
                    }
                    encoded.push(code as u8);
                }
                out.write_size(encoded.len() + 1);
                out.write_octets(&encoded);
                out.write_u8(0);
                Ok(())
            }
            _ => Err(SystemException::no_implement()),
        }
    }

    /// Reads a narrow string in the negotiated set.
    pub fn read_string(&self, input: &mut StreamIn) -> CoreResult<String> {
        match self.codeset {
            UTF_8 => input.read_string(),
            ISO_8859_1 => {
                let len = input.read_size()?;
                if len == 0 {
                    return Err(SystemException::marshal(MINOR_BAD_STRING));
                }
                let bytes = input.read_octets(len)?;
                if bytes[len - 1] != 0 {
                    return Err(SystemException::marshal(MINOR_BAD_STRING));
                }
                Ok(bytes[..len - 1].iter().map(|&b| b as char).collect())
            }
            _ => Err(SystemException::no_implement()),
        }
    }
}

/// Wide-character converter bound to the stream's GIOP minor version.
///
/// GIOP 1.0 has no wchar transmission form; 1.1 writes a unit count and
/// fixed-width UTF-16 units; 1.2 writes a byte length followed by UTF-16
/// bytes (a leading BOM is tolerated on read).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WCharConverter {
    codeset: u32,
    giop_minor: u8,
}

impl WCharConverter {
    pub fn new(codeset: u32, giop_minor: u8) -> CoreResult<Self> {
        if codeset != UTF_16 {
            return Err(SystemException::no_implement());
        }
        Ok(Self {
            codeset,
            giop_minor,
        })
    }

    pub fn utf16(giop_minor: u8) -> Self {
        Self {
            codeset: UTF_16,
            giop_minor,
        }
    }

    pub fn codeset(&self) -> u32 {
        self.codeset
    }

    /// Writes a wide string per the stream's GIOP minor.
    pub fn write_wstring(&self, out: &mut StreamOut, value: &str) -> CoreResult<()> {
        let units: Vec<u16> = value.encode_utf16().collect();
        match self.giop_minor {
            0 => Err(SystemException::no_implement()),
            1 => {
                out.write_size(units.len());
                for unit in units {
                    out.write_u16(unit);
                }
                Ok(())
            }
            _ => {
                out.write_size(units.len() * 2);
                for unit in units {
                    // Byte length already written; units follow unaligned
                    // in the stream order.
                    let bytes = if out.little_endian() {
                        unit.to_le_bytes()
                    } else {
                        unit.to_be_bytes()
                    };
                    out.write_octets(&bytes);
                }
                Ok(())
            }
        }
    }

    /// Reads a wide string per the stream's GIOP minor.
    pub fn read_wstring(&self, input: &mut StreamIn) -> CoreResult<String> {
        let units = match self.giop_minor {
            0 => return Err(SystemException::no_implement()),
            1 => {
                let count = input.read_size()?;
                let mut units = Vec::with_capacity(count);
                for _ in 0..count {
                    units.push(input.read_u16()?);
                }
                units
            }
            _ => {
                let byte_len = input.read_size()?;
                if byte_len % 2 != 0 {
                    return Err(SystemException::marshal(MINOR_BAD_STRING));
                }
                let bytes = input.read_octets(byte_len)?;
                let mut units = Vec::with_capacity(byte_len / 2);
                for pair in bytes.chunks_exact(2) {
                    let unit = if input.little_endian() {
                        u16::from_le_bytes([pair[0], pair[1]])
                    } else {
                        u16::from_be_bytes([pair[0], pair[1]])
                    };
                    units.push(unit);
                }
                // Tolerate a leading BOM.
                if units.first() == Some(&0xFEFF) {
                    units.remove(0);
                }
                units
            }
        };
        String::from_utf16(&units).map_err(|_| SystemException::marshal(MINOR_BAD_STRING))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn utf8_narrow_round_trip() {
        let conv = CharConverter::utf8();
        let mut out = StreamOut::with_order(true);
        conv.write_string(&mut out, "naming/context").unwrap();
        let mut input = StreamIn::new(out.finish(), true);
        assert_eq!(conv.read_string(&mut input).unwrap(), "naming/context");
    }

    #[test]
    fn latin1_rejects_wide_chars() {
        let conv = CharConverter::new(ISO_8859_1).unwrap();
        let mut out = StreamOut::with_order(true);
        assert!(conv.write_string(&mut out, "snowman ☃").is_err());
    }

    #[test]
    fn giop_1_2_wstring_round_trip_both_orders() {
        for little in [true, false] {
            let conv = WCharConverter::utf16(2);
            let mut out = StreamOut::with_order(little);
            conv.write_wstring(&mut out, "wide ☃ text").unwrap();
            let mut input = StreamIn::new(out.finish(), little);
            assert_eq!(conv.read_wstring(&mut input).unwrap(), "wide ☃ text");
        }
    }

    #[test]
    fn giop_1_1_wstring_round_trip() {
        let conv = WCharConverter::utf16(1);
        let mut out = StreamOut::with_order(true);
        conv.write_wstring(&mut out, "fixed width").unwrap();
        let mut input = StreamIn::new(out.finish(), true);
        assert_eq!(conv.read_wstring(&mut input).unwrap(), "fixed width");
    }

    #[test]
    fn giop_1_0_has_no_wchar() {
        let conv = WCharConverter::utf16(0);
        let mut out = StreamOut::with_order(true);
        assert!(conv.write_wstring(&mut out, "x").is_err());
    }

    #[test]
    fn unknown_codeset_is_rejected() {
        assert!(CharConverter::new(0x1234).is_err());
        assert!(WCharConverter::new(0x1234, 2).is_err());
    }
}
