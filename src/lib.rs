//! ferrule: an embeddable interpreter for precompiled Lua 5.3 chunks.
//!
//! Designed for resource-constrained hosts: no compiler, no collector
//! beyond reference counting, one VM instance per embedding. A host loads
//! a chunk produced by the reference compiler, registers native
//! callbacks, and invokes scripted functions:
//!
//! ```no_run
//! use ferrule::{load_chunk, Value, Vm, MULTIRET};
//!
//! # fn main() -> ferrule::Result<()> {
//! let bytes = std::fs::read("script.luac")?;
//! let chunk = load_chunk(&bytes)?;
//!
//! let mut vm = Vm::new();
//! vm.define_native_function("answer", |vm| {
//!     vm.push(Value::Integer(42))?;
//!     Ok(1)
//! });
//! vm.load(&chunk)?;
//! vm.call(0, MULTIRET)?;
//! # Ok(())
//! # }
//! ```

pub mod bytecode;
pub mod error;
pub mod frame;
pub mod instruction;
pub mod loader;
pub mod object;
pub mod pool;
pub mod reader;
pub mod table;
pub mod value;
pub mod vm;

pub use bytecode::{Architecture, Chunk, Constant, Header, Prototype, UpvalDesc};
pub use error::{Error, Result};
pub use frame::MULTIRET;
pub use instruction::{Instruction, OpCode};
pub use loader::{load_chunk, load_chunk_from};
pub use object::{HeapObject, ObjectRef};
pub use table::Table;
pub use value::{LuaInt, LuaNum, LuaStr, Tag, Value};
pub use vm::{Vm, VmConfig};
