//! Chunk loading: header validation and recursive prototype decoding.
//!
//! The loader consumes a complete chunk stream and rehydrates the
//! prototype tree. All structural faults are surfaced as `Bytecode*`
//! errors and the partially-built tree is dropped with the error.

use std::io::Read;
use std::rc::Rc;

use crate::bytecode::{Architecture, Chunk, Constant, Header, Prototype, UpvalDesc};
use crate::error::{Error, Result};
use crate::reader::ChunkReader;
use crate::value::{LuaInt, LuaNum};

/// `\x1bLua`: the chunk signature.
pub const SIGNATURE: [u8; 4] = [0x1B, b'L', b'u', b'a'];

/// Version byte this loader accepts.
pub const VERSION: u8 = 0x53;

/// The official chunk format tag.
pub const FORMAT: u8 = 0;

/// Conversion-error detector written after the format byte.
pub const HEADER_DATA: [u8; 6] = [0x19, 0x93, b'\r', b'\n', 0x1A, b'\n'];

/// Integer sentinel used to detect byte order and integer format.
pub const SENTINEL_INT: LuaInt = 0x5678;

/// Number sentinel used to detect float format.
pub const SENTINEL_NUM: LuaNum = 370.5;

// Constant-pool tags, dispatched on the full byte: the low nibble is the
// runtime tag, the high nibble the compiler's representation subtype.
const TAG_NIL: u8 = 0x00;
const TAG_BOOLEAN: u8 = 0x01;
const TAG_NUMBER_FLOAT: u8 = 0x03;
const TAG_NUMBER_INT: u8 = 0x13;
const TAG_STRING_SHORT: u8 = 0x04;
const TAG_STRING_LONG: u8 = 0x14;

/// Load a chunk from a byte slice.
pub fn load_chunk(bytes: &[u8]) -> Result<Chunk> {
    load_chunk_from(bytes)
}

/// Load a chunk from any byte stream. The stream must contain exactly
/// one chunk; trailing bytes are a structural fault.
pub fn load_chunk_from<R: Read>(stream: R) -> Result<Chunk> {
    let mut reader = ChunkReader::new(stream);
    let header = read_header(&mut reader)?;
    let num_upvalues = reader.read_byte()?;
    let root = read_prototype(&mut reader, &header.arch)?;
    if !reader.at_end() {
        return Err(Error::BytecodeCorrupt("trailing bytes after root prototype"));
    }
    if num_upvalues as usize != root.upvalues.len() {
        return Err(Error::BytecodeCorrupt("root upvalue count mismatch"));
    }
    Ok(Chunk {
        header,
        num_upvalues,
        root: Rc::new(root),
    })
}

fn read_header<R: Read>(reader: &mut ChunkReader<R>) -> Result<Header> {
    let mut signature = [0u8; 4];
    reader.read_block(&mut signature)?;
    if signature != SIGNATURE {
        return Err(Error::BytecodeBadSignature);
    }

    let version = reader.read_byte()?;
    if version != VERSION {
        return Err(Error::BytecodeBadVersion(version));
    }
    let format = reader.read_byte()?;
    if format != FORMAT {
        return Err(Error::BytecodeBadFormat(format));
    }

    let mut data = [0u8; 6];
    reader.read_block(&mut data)?;
    if data != HEADER_DATA {
        return Err(Error::BytecodeCorrupt("header conversion check mismatch"));
    }

    let sizeof_int = reader.read_byte()?;
    let sizeof_size = reader.read_byte()?;
    let sizeof_instruction = reader.read_byte()?;
    let sizeof_integer = reader.read_byte()?;
    let sizeof_number = reader.read_byte()?;

    check_width("int", sizeof_int)?;
    check_width("size_t", sizeof_size)?;
    check_width("instruction", sizeof_instruction)?;
    check_width("integer", sizeof_integer)?;
    if sizeof_number != 8 {
        return Err(Error::BytecodeUnsupportedWidth {
            what: "number",
            width: sizeof_number,
        });
    }

    // The sentinels that follow pin down the byte order. The integer is
    // authoritative; the number then cross-checks the float format.
    let mut int_bytes = vec![0u8; sizeof_integer as usize];
    reader.read_block(&mut int_bytes)?;
    let mut num_bytes = [0u8; 8];
    reader.read_block(&mut num_bytes)?;

    let little_endian = if assemble(&int_bytes, true) == SENTINEL_INT as u64 {
        true
    } else if assemble(&int_bytes, false) == SENTINEL_INT as u64 {
        false
    } else if LuaNum::from_bits(assemble(&num_bytes, true)) == SENTINEL_NUM {
        true
    } else if LuaNum::from_bits(assemble(&num_bytes, false)) == SENTINEL_NUM {
        false
    } else {
        return Err(Error::BytecodeBadEndianness);
    };

    if assemble(&int_bytes, little_endian) != SENTINEL_INT as u64 {
        return Err(Error::BytecodeCorrupt("integer format mismatch"));
    }
    if LuaNum::from_bits(assemble(&num_bytes, little_endian)) != SENTINEL_NUM {
        return Err(Error::BytecodeCorrupt("number format mismatch"));
    }

    Ok(Header {
        version,
        format,
        arch: Architecture {
            little_endian,
            sizeof_int,
            sizeof_size,
            sizeof_instruction,
            sizeof_integer,
            sizeof_number,
        },
    })
}

fn check_width(what: &'static str, width: u8) -> Result<()> {
    if width == 0 || width > 8 {
        return Err(Error::BytecodeUnsupportedWidth { what, width });
    }
    Ok(())
}

/// Zero-extend `bytes` into a u64 under the given byte order.
fn assemble(bytes: &[u8], little: bool) -> u64 {
    let mut acc: u64 = 0;
    if little {
        for &b in bytes.iter().rev() {
            acc = (acc << 8) | b as u64;
        }
    } else {
        for &b in bytes {
            acc = (acc << 8) | b as u64;
        }
    }
    acc
}

fn read_count<R: Read>(reader: &mut ChunkReader<R>, arch: &Architecture) -> Result<usize> {
    let n = reader.read_int(arch)?;
    usize::try_from(n).map_err(|_| Error::BytecodeCorrupt("negative count"))
}

fn read_prototype<R: Read>(reader: &mut ChunkReader<R>, arch: &Architecture) -> Result<Prototype> {
    let source = reader.read_string(arch)?;
    let line_defined = reader.read_int(arch)?;
    let last_line_defined = reader.read_int(arch)?;
    let num_params = reader.read_byte()?;
    let is_vararg = reader.read_byte()? != 0;
    let max_stack_size = reader.read_byte()?;

    let num_code = read_count(reader, arch)?;
    let mut code = Vec::new();
    for _ in 0..num_code {
        code.push(reader.read_instruction(arch)?);
    }

    let num_constants = read_count(reader, arch)?;
    let mut constants = Vec::new();
    for _ in 0..num_constants {
        constants.push(read_constant(reader, arch)?);
    }

    let num_upvalues = read_count(reader, arch)?;
    let mut upvalues = Vec::new();
    for _ in 0..num_upvalues {
        let in_stack = reader.read_byte()? != 0;
        let index = reader.read_byte()?;
        upvalues.push(UpvalDesc { in_stack, index });
    }

    let num_protos = read_count(reader, arch)?;
    let mut protos = Vec::new();
    for _ in 0..num_protos {
        protos.push(Rc::new(read_prototype(reader, arch)?));
    }

    skip_debug_info(reader, arch)?;

    Ok(Prototype {
        source,
        line_defined,
        last_line_defined,
        num_params,
        is_vararg,
        max_stack_size,
        code,
        constants,
        upvalues,
        protos,
    })
}

fn read_constant<R: Read>(reader: &mut ChunkReader<R>, arch: &Architecture) -> Result<Constant> {
    let tag = reader.read_byte()?;
    match tag {
        TAG_NIL => Ok(Constant::Nil),
        TAG_BOOLEAN => Ok(Constant::Boolean(reader.read_byte()? != 0)),
        TAG_NUMBER_FLOAT => Ok(Constant::Number(reader.read_lua_number(arch)?)),
        TAG_NUMBER_INT => Ok(Constant::Integer(reader.read_lua_integer(arch)?)),
        TAG_STRING_SHORT | TAG_STRING_LONG => Ok(Constant::Str(reader.read_string(arch)?)),
        _ => Err(Error::BytecodeCorrupt("unknown constant tag")),
    }
}

/// Debug information is parsed only to keep the stream position; the
/// content is discarded.
fn skip_debug_info<R: Read>(reader: &mut ChunkReader<R>, arch: &Architecture) -> Result<()> {
    let num_lines = read_count(reader, arch)?;
    for _ in 0..num_lines {
        reader.read_int(arch)?;
    }

    let num_locals = read_count(reader, arch)?;
    for _ in 0..num_locals {
        reader.read_string(arch)?;
        reader.read_int(arch)?;
        reader.read_int(arch)?;
    }

    let num_upval_names = read_count(reader, arch)?;
    for _ in 0..num_upval_names {
        reader.read_string(arch)?;
    }
    Ok(())
}
