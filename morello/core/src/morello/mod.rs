//! Morello instruction semantics: register file, decoded instruction
//! records, opcode dispatch and the per-class handlers.

pub mod dispatch;
pub mod eval;
pub mod fault;
pub mod opcodes;
pub mod state;

mod control;
mod loadstore;
mod manip;

pub use dispatch::{lookup, OpcodeEntry, Slots, OPCODES};
pub use eval::{MorelloExecutor, StepOutcome};
pub use fault::{Fault, FaultKind};
pub use opcodes::{Extend, Indexing, Instr, Mods, Op};
pub use state::{CapReg, CapState, Nzcv, Slot};
