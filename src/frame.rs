//! Call frames: the record of one active invocation.

use std::rc::Rc;

use crate::bytecode::Prototype;
use crate::object::ObjectRef;
use crate::value::Value;

/// Result-count request meaning "accept all results".
pub const MULTIRET: i32 = -1;

/// One entry of the call stack.
///
/// Script frames carry their prototype, register ceiling and materialized
/// varargs. Native frames use `base` to record where the argument region
/// ends (`func_idx + 1 + nargs`) so argument access stays constant-time
/// while the host pushes results; `pc`, `top` and `varargs` are unused.
pub struct CallFrame {
    /// Stack index of the function value being executed.
    pub func_idx: usize,
    /// First register of this frame.
    pub base: usize,
    /// Index of the next instruction to dispatch.
    pub pc: usize,
    /// Results the caller asked for; [`MULTIRET`] accepts all.
    pub numresults: i32,
    /// Register ceiling: `base + max_stack_size` for script frames.
    pub top: usize,
    /// Prototype driving dispatch; `None` marks a native frame.
    pub proto: Option<Rc<Prototype>>,
    /// The closure object occupying `func_idx`, kept for upvalue access.
    pub closure: Option<ObjectRef>,
    /// Arguments beyond the fixed parameter count of a vararg prototype.
    pub varargs: Vec<Value>,
    /// Set on the frame a host call entered through; returning from it
    /// hands control back to the host.
    pub is_fresh: bool,
    /// Set when the frame was reused by a tail call.
    pub is_tail: bool,
}

impl CallFrame {
    /// Whether this frame executes bytecode.
    pub fn is_script(&self) -> bool {
        self.proto.is_some()
    }
}
