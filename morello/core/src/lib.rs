//! Morello capability execution core.
//!
//! Bit-exact capability values with their compressed bounds codec, the
//! access validation every memory operation goes through, and the execution
//! semantics of the capability instruction set against a tagged memory bus.
//! Decoding is out of scope: instructions arrive as [`Instr`] records.

use serde::Serialize;
use std::path::Path;
use std::time::SystemTime;
use thiserror::Error;

pub mod capability;
pub mod check;
pub mod codec;
pub mod config;
pub mod memory;
pub mod morello;
pub mod observer;
pub mod snapshot;

pub use capability::{bounds_address, CapPerms, Capability, ObjectType, CAP_SIZE};
pub use check::{check_access, perms_for_store, AccessRequest, BoundsDirection, CapFault};
pub use codec::{Bounds, CompressedCap};
pub use config::{Cctlr, CoreConfig};
pub use memory::{Access, Barrier, BusError, CapBus, MemoryImage, SharedBus};
pub use morello::{
    CapReg, CapState, Fault, FaultKind, Instr, Mods, MorelloExecutor, Op, StepOutcome,
};
pub use observer::{BoundsStats, CapObserver, Derivation, LogObserver, NullObserver};
pub use snapshot::{load_snapshot, save_snapshot, Snapshot, SNAPSHOT_MAGIC, SNAPSHOT_VERSION};

pub type Result<T> = std::result::Result<T, CoreError>;

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialize error: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("config error: {0}")]
    Config(String),
    #[error("snapshot error: {0}")]
    InvalidSnapshot(String),
    #[error(transparent)]
    Fault(#[from] Fault),
    #[error("{0}")]
    Other(String),
}

pub fn now_timestamp() -> String {
    match SystemTime::now().duration_since(SystemTime::UNIX_EPOCH) {
        Ok(duration) => format!("{}Z", duration.as_secs()),
        Err(_) => "0Z".to_string(),
    }
}

/// Why [`CapRuntime::run`] returned.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum StopReason {
    /// PC left the program.
    Halted,
    StepLimit,
    Fault { fault: Fault },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RunReport {
    pub steps: u64,
    pub pc: u64,
    pub stop: StopReason,
}

/// A single execution context bound to its own memory image.
pub struct CapRuntime<O: CapObserver = NullObserver> {
    pub memory: MemoryImage,
    pub state: CapState,
    executor: MorelloExecutor<O>,
    instruction_count: u64,
}

impl Default for CapRuntime {
    fn default() -> Self {
        Self::new(CoreConfig::default())
    }
}

impl CapRuntime {
    pub fn new(config: CoreConfig) -> Self {
        Self {
            memory: MemoryImage::new(),
            state: CapState::new(),
            executor: MorelloExecutor::new(config),
            instruction_count: 0,
        }
    }
}

impl<O: CapObserver> CapRuntime<O> {
    pub fn with_observer<P: CapObserver>(self, observer: P) -> CapRuntime<P> {
        CapRuntime {
            memory: self.memory,
            state: self.state,
            executor: self.executor.with_observer(observer),
            instruction_count: self.instruction_count,
        }
    }

    pub fn config(&self) -> &CoreConfig {
        self.executor.config()
    }

    pub fn observer(&self) -> &O {
        self.executor.observer()
    }

    pub fn instruction_count(&self) -> u64 {
        self.instruction_count
    }

    pub fn step(&mut self, instr: &Instr) -> Result<StepOutcome> {
        let outcome = self
            .executor
            .execute(instr, &mut self.state, &mut self.memory)?;
        self.instruction_count = self.instruction_count.wrapping_add(1);
        Ok(outcome)
    }

    /// Runs `program`, laid out as consecutive 4-byte instructions from
    /// `entry`, until PC leaves it, an instruction faults, or `max_steps`.
    pub fn run(&mut self, program: &[Instr], entry: u64, max_steps: u64) -> RunReport {
        let mut steps = 0;
        let stop = loop {
            if steps >= max_steps {
                break StopReason::StepLimit;
            }
            let pc = self.state.pc();
            let offset = pc.wrapping_sub(entry);
            let slot = (offset / 4) as usize;
            if offset % 4 != 0 || slot >= program.len() {
                break StopReason::Halted;
            }
            match self
                .executor
                .execute(&program[slot], &mut self.state, &mut self.memory)
            {
                Ok(_) => {
                    steps += 1;
                    self.instruction_count = self.instruction_count.wrapping_add(1);
                }
                Err(fault) => {
                    log::info!("stopped after {steps} steps: {fault}");
                    break StopReason::Fault { fault };
                }
            }
        };
        RunReport {
            steps,
            pc: self.state.pc(),
            stop,
        }
    }

    pub fn snapshot(&self) -> Snapshot {
        Snapshot::capture(
            self.executor.config(),
            &self.state,
            &self.memory,
            self.instruction_count,
        )
    }

    pub fn restore(&mut self, snapshot: &Snapshot) {
        *self.executor.config_mut() = snapshot.config.clone();
        self.state = snapshot.state.clone();
        self.memory = snapshot.restore_memory();
        self.instruction_count = snapshot.instruction_count;
    }

    pub fn save_snapshot(&self, path: &Path) -> Result<()> {
        save_snapshot(path, &self.snapshot())
    }

    pub fn load_snapshot(&mut self, path: &Path) -> Result<()> {
        let snapshot = load_snapshot(path)?;
        self.restore(&snapshot);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_stops_when_pc_leaves_program() {
        let mut rt = CapRuntime::default();
        rt.state.set_pc(0x1000);
        let program = [
            Instr::new(Op::AddImm).rd(1).rn(1).imm(0x10),
            Instr::new(Op::GcValue).rd(2).rn(1),
        ];
        let report = rt.run(&program, 0x1000, 100);
        assert_eq!(report.stop, StopReason::Halted);
        assert_eq!(report.steps, 2);
        assert_eq!(rt.state.x(CapReg::C(2)), 0x10);
        assert_eq!(rt.instruction_count(), 2);
    }

    #[test]
    fn run_reports_faults_without_advancing() {
        let mut rt = CapRuntime::default();
        rt.state.set_pc(0x1000);
        let program = [Instr::new(Op::LdrCap).rd(1).rn(2)];
        let report = rt.run(&program, 0x1000, 10);
        assert!(matches!(report.stop, StopReason::Fault { .. }));
        assert_eq!(report.steps, 0);
        assert_eq!(report.pc, 0x1000);
    }
}
