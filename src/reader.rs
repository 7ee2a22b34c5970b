//! Byte-level primitive decoding for chunk streams.
//!
//! Every multi-byte read is parameterised by the chunk's
//! [`Architecture`]: bytes are assembled in the chunk's declared byte
//! order, widths are taken from the header, and anything wider than the
//! host can represent is rejected rather than silently narrowed.

use std::io::Read;

use byteorder::{BigEndian, LittleEndian, ReadBytesExt};

use crate::bytecode::Architecture;
use crate::error::{Error, Result};
use crate::value::{LuaInt, LuaNum, LuaStr};

/// Escape byte in a string length prefix: the real length follows as a
/// size-typed integer.
const LONG_STRING_MARKER: u8 = 0xFF;

/// Primitive reader over a chunk byte stream.
pub struct ChunkReader<R> {
    inner: R,
}

impl<R: Read> ChunkReader<R> {
    pub fn new(inner: R) -> Self {
        ChunkReader { inner }
    }

    pub fn read_byte(&mut self) -> Result<u8> {
        self.inner.read_u8().map_err(map_eof)
    }

    /// Fill `buf` exactly from the stream.
    pub fn read_block(&mut self, buf: &mut [u8]) -> Result<()> {
        self.inner.read_exact(buf).map_err(map_eof)
    }

    /// Assemble an unsigned integer of `width` bytes in the chunk's byte
    /// order. Widths beyond the host word are unsupported.
    fn read_unsigned(&mut self, width: u8, little: bool, what: &'static str) -> Result<u64> {
        if width == 0 || width > 8 {
            return Err(Error::BytecodeUnsupportedWidth { what, width });
        }
        let v = if little {
            self.inner.read_uint::<LittleEndian>(width as usize)
        } else {
            self.inner.read_uint::<BigEndian>(width as usize)
        };
        v.map_err(map_eof)
    }

    /// A producing-platform `int` (instruction counts, line numbers).
    /// Narrower-than-host encodings zero-extend.
    pub fn read_int(&mut self, arch: &Architecture) -> Result<LuaInt> {
        self.read_unsigned(arch.sizeof_int, arch.little_endian, "int")
            .map(|v| v as LuaInt)
    }

    /// A producing-platform `size_t`.
    pub fn read_size(&mut self, arch: &Architecture) -> Result<usize> {
        self.read_unsigned(arch.sizeof_size, arch.little_endian, "size_t")
            .map(|v| v as usize)
    }

    /// One instruction word. The word must fit the 32-bit instruction
    /// encoding whatever width the chunk stores it at.
    pub fn read_instruction(&mut self, arch: &Architecture) -> Result<u32> {
        let raw = self.read_unsigned(arch.sizeof_instruction, arch.little_endian, "instruction")?;
        u32::try_from(raw).map_err(|_| Error::BytecodeCorrupt("instruction exceeds 32 bits"))
    }

    /// A language integer. Narrower encodings zero-extend.
    pub fn read_lua_integer(&mut self, arch: &Architecture) -> Result<LuaInt> {
        self.read_unsigned(arch.sizeof_integer, arch.little_endian, "integer")
            .map(|v| v as LuaInt)
    }

    /// A language number. Only the IEEE-754 double encoding is accepted;
    /// narrower float formats are rejected, not widened.
    pub fn read_lua_number(&mut self, arch: &Architecture) -> Result<LuaNum> {
        if arch.sizeof_number != 8 {
            return Err(Error::BytecodeUnsupportedWidth {
                what: "number",
                width: arch.sizeof_number,
            });
        }
        let bits = self.read_unsigned(8, arch.little_endian, "number")?;
        Ok(LuaNum::from_bits(bits))
    }

    /// A length-prefixed byte string.
    ///
    /// The prefix is one byte, or a size-typed integer when that byte is
    /// `0xFF`. A zero prefix is the empty string; otherwise the stored
    /// length is the payload length plus one.
    pub fn read_string(&mut self, arch: &Architecture) -> Result<LuaStr> {
        let first = self.read_byte()?;
        let stored = if first == LONG_STRING_MARKER {
            self.read_size(arch)?
        } else {
            first as usize
        };
        if stored == 0 {
            return Ok(LuaStr::from_bytes(&[]));
        }
        let mut payload = vec![0u8; stored - 1];
        self.read_block(&mut payload)?;
        Ok(LuaStr::from_bytes(&payload))
    }

    /// True once the stream is exhausted; consumes nothing on failure.
    pub fn at_end(&mut self) -> bool {
        let mut probe = [0u8; 1];
        match self.inner.read(&mut probe) {
            Ok(0) => true,
            _ => false,
        }
    }
}

fn map_eof(e: std::io::Error) -> Error {
    if e.kind() == std::io::ErrorKind::UnexpectedEof {
        Error::BytecodeTruncated
    } else {
        Error::Io(e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn arch(little: bool) -> Architecture {
        Architecture {
            little_endian: little,
            ..Architecture::host()
        }
    }

    #[test]
    fn reads_little_and_big_endian_ints() {
        let bytes = [0x78, 0x56, 0x00, 0x00];
        let mut r = ChunkReader::new(&bytes[..]);
        let mut a = arch(true);
        a.sizeof_int = 4;
        assert_eq!(r.read_int(&a).unwrap(), 0x5678);

        let bytes = [0x00, 0x00, 0x56, 0x78];
        let mut r = ChunkReader::new(&bytes[..]);
        a.little_endian = false;
        assert_eq!(r.read_int(&a).unwrap(), 0x5678);
    }

    #[test]
    fn short_read_is_truncation() {
        let bytes = [0x01, 0x02];
        let mut r = ChunkReader::new(&bytes[..]);
        let mut a = arch(true);
        a.sizeof_int = 4;
        assert!(matches!(r.read_int(&a), Err(Error::BytecodeTruncated)));
    }

    #[test]
    fn oversized_width_is_rejected() {
        let bytes = [0u8; 16];
        let mut r = ChunkReader::new(&bytes[..]);
        let mut a = arch(true);
        a.sizeof_int = 16;
        assert!(matches!(
            r.read_int(&a),
            Err(Error::BytecodeUnsupportedWidth { what: "int", .. })
        ));
    }

    #[test]
    fn narrow_floats_are_rejected() {
        let bytes = [0u8; 8];
        let mut r = ChunkReader::new(&bytes[..]);
        let mut a = arch(true);
        a.sizeof_number = 4;
        assert!(matches!(
            r.read_lua_number(&a),
            Err(Error::BytecodeUnsupportedWidth { what: "number", .. })
        ));
    }

    #[test]
    fn string_length_conventions() {
        let a = arch(true);

        // Zero prefix: empty string.
        let mut r = ChunkReader::new(&[0x00][..]);
        assert!(r.read_string(&a).unwrap().is_empty());

        // Stored length is payload length plus one.
        let mut bytes = vec![0x03u8];
        bytes.extend_from_slice(b"hi");
        let mut r = ChunkReader::new(&bytes[..]);
        assert_eq!(r.read_string(&a).unwrap().as_bytes(), b"hi");
    }

    #[test]
    fn long_string_prefix() {
        let a = arch(true);
        let mut bytes = vec![LONG_STRING_MARKER];
        bytes.extend_from_slice(&3u64.to_le_bytes()[..a.sizeof_size as usize]);
        bytes.extend_from_slice(b"ab");
        let mut r = ChunkReader::new(&bytes[..]);
        assert_eq!(r.read_string(&a).unwrap().as_bytes(), b"ab");
    }

    #[test]
    fn number_round_trip() {
        let a = arch(true);
        let bytes = 370.5f64.to_bits().to_le_bytes();
        let mut r = ChunkReader::new(&bytes[..]);
        assert_eq!(r.read_lua_number(&a).unwrap(), 370.5);
    }
}
