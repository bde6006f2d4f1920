use crate::check::CapFault;
use crate::memory::BusError;
use crate::morello::state::CapReg;
use serde::Serialize;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error, Serialize)]
#[serde(tag = "source", content = "detail", rename_all = "snake_case")]
pub enum FaultKind {
    #[error(transparent)]
    Capability(#[from] CapFault),
    #[error(transparent)]
    Bus(#[from] BusError),
    #[error("capability instructions are disabled")]
    CapabilitiesDisabled,
    #[error("undefined instruction")]
    Undefined,
    #[error("stack pointer is not 16-byte aligned")]
    SpAlignment,
}

/// A synchronous fault raised by one instruction. Nothing the instruction
/// would have written is visible when this is returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error, Serialize)]
#[error("{mnemonic}: {kind} (pc {pc:#x})")]
pub struct Fault {
    pub kind: FaultKind,
    pub mnemonic: &'static str,
    /// Register holding the faulting capability, when there is one.
    pub reg: Option<CapReg>,
    /// Faulting data address, when there is one.
    pub addr: Option<u64>,
    pub pc: u64,
}

impl Fault {
    pub fn capability(&self) -> Option<CapFault> {
        match self.kind {
            FaultKind::Capability(fault) => Some(fault),
            _ => None,
        }
    }
}
