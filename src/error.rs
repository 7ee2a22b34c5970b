//! Error types for the bytecode loader and the virtual machine.

use thiserror::Error;

/// Result type for loader and VM operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced to the host.
///
/// Loader faults (`Bytecode*`) abort the load and drop the partially-built
/// prototype tree. Dispatch faults unwind the call stack to the nearest
/// host entry point; the VM stays usable afterwards.
#[derive(Error, Debug)]
pub enum Error {
    /// Chunk does not start with the `\x1bLua` signature.
    #[error("bad bytecode signature")]
    BytecodeBadSignature,

    /// Chunk was produced for an unsupported language version.
    #[error("unsupported bytecode version 0x{0:02x}")]
    BytecodeBadVersion(u8),

    /// Chunk format tag is not the official format (0).
    #[error("unsupported bytecode format {0}")]
    BytecodeBadFormat(u8),

    /// Structurally invalid chunk contents.
    #[error("corrupt bytecode: {0}")]
    BytecodeCorrupt(&'static str),

    /// Neither byte order reproduces the header sentinels.
    #[error("bytecode endianness mismatch")]
    BytecodeBadEndianness,

    /// Stream ended before the chunk was complete.
    #[error("truncated bytecode")]
    BytecodeTruncated,

    /// A numeric encoding in the chunk is wider than the host can decode.
    #[error("unsupported {what} width {width} in bytecode")]
    BytecodeUnsupportedWidth { what: &'static str, width: u8 },

    /// Non-sentinel I/O failure while reading a chunk.
    #[error("i/o error reading bytecode")]
    Io(#[from] std::io::Error),

    /// Attempt to call a value that is not a function.
    #[error("attempt to call a {0} value")]
    CallNonCallable(&'static str),

    /// Arithmetic operand cannot be coerced to a number.
    #[error("attempt to perform arithmetic on a {0} value")]
    ArithOnNonNumber(&'static str),

    /// Integer division or modulo by zero.
    #[error("attempt to perform integer division by zero")]
    ArithDivideByZero,

    /// Bitwise operand has no exact integer representation.
    #[error("number has no integer representation")]
    ArithNoIntegerRepresentation,

    /// Relational comparison between incompatible types.
    #[error("attempt to compare {0} with {1}")]
    OrderOnIncomparable(&'static str, &'static str),

    /// Concatenation operand is neither a string nor a number.
    #[error("attempt to concatenate a {0} value")]
    ConcatOnNonStringable(&'static str),

    /// Table read or write on a non-table receiver.
    #[error("attempt to index a {0} value")]
    IndexNonTable(&'static str),

    /// Length operand is neither a string nor a table.
    #[error("attempt to get length of a {0} value")]
    LengthOnUnsupported(&'static str),

    /// Numeric `for` control value is not a number.
    #[error("'for' control value must be a number")]
    ForLoopOnNonNumber,

    /// Numeric `for` step of zero would never terminate.
    #[error("'for' step is zero")]
    ForLoopStepZero,

    /// Call depth or register stack exceeded the configured bound.
    #[error("stack overflow")]
    StackOverflow,

    /// Bytecode referenced an upvalue slot the closure does not have.
    #[error("upvalue index {0} out of bounds")]
    UpvalueBounds(usize),

    /// Bytecode referenced a constant the prototype does not have.
    #[error("constant index {0} out of bounds")]
    ConstantBounds(usize),
}

impl Error {
    /// True for faults detected while decoding a chunk.
    pub fn is_load_error(&self) -> bool {
        matches!(
            self,
            Error::BytecodeBadSignature
                | Error::BytecodeBadVersion(_)
                | Error::BytecodeBadFormat(_)
                | Error::BytecodeCorrupt(_)
                | Error::BytecodeBadEndianness
                | Error::BytecodeTruncated
                | Error::BytecodeUnsupportedWidth { .. }
                | Error::Io(_)
        )
    }
}
