use crate::capability::{CapPerms, Capability, CursorUpdate};
use crate::check::{check_access, AccessRequest, CapFault};
use crate::config::CoreConfig;
use crate::memory::{BusError, CapBus};
use crate::morello::dispatch::{self, OpcodeEntry};
use crate::morello::fault::{Fault, FaultKind};
use crate::morello::opcodes::Instr;
use crate::morello::state::{CapReg, CapState, Nzcv};
use crate::observer::{CapObserver, Derivation, NullObserver};
use serde::Serialize;

/// What a retired instruction did besides its register writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct StepOutcome {
    /// PC of the next instruction.
    pub pc: u64,
    pub branched: bool,
    /// A bounds-setting instruction had to round the requested region.
    pub bounds_inexact: bool,
}

/// Per-instruction execution context.
///
/// Handlers read the register file as it was when the instruction started
/// (plus their own staged writes) and stage every register, flag and PCC
/// update here. Staged effects reach the register file only when the handler
/// returns `Ok`, so a fault leaves no partial register state behind.
pub struct Exec<'a> {
    state: &'a CapState,
    pub(crate) bus: &'a mut dyn CapBus,
    pub(crate) config: &'a CoreConfig,
    observer: &'a mut dyn CapObserver,
    entry: &'static OpcodeEntry,
    pub(crate) instr: &'a Instr,
    writes: Vec<(CapReg, Capability)>,
    nzcv: Option<Nzcv>,
    branch: Option<Capability>,
    c64: Option<bool>,
    bounds_inexact: bool,
}

struct Effects {
    writes: Vec<(CapReg, Capability)>,
    nzcv: Option<Nzcv>,
    branch: Option<Capability>,
    c64: Option<bool>,
    bounds_inexact: bool,
}

impl<'a> Exec<'a> {
    fn new(
        state: &'a CapState,
        bus: &'a mut dyn CapBus,
        config: &'a CoreConfig,
        observer: &'a mut dyn CapObserver,
        entry: &'static OpcodeEntry,
        instr: &'a Instr,
    ) -> Self {
        Exec {
            state,
            bus,
            config,
            observer,
            entry,
            instr,
            writes: Vec::with_capacity(2),
            nzcv: None,
            branch: None,
            c64: None,
            bounds_inexact: false,
        }
    }

    pub(crate) fn mnemonic(&self) -> &'static str {
        self.entry.mnemonic
    }

    pub(crate) fn d(&self) -> CapReg {
        self.entry.slots.d.resolve(self.instr.rd)
    }

    pub(crate) fn n(&self) -> CapReg {
        self.entry.slots.n.resolve(self.instr.rn)
    }

    pub(crate) fn m(&self) -> CapReg {
        self.entry.slots.m.resolve(self.instr.rm)
    }

    pub(crate) fn t2(&self) -> CapReg {
        self.entry.slots.t2.resolve(self.instr.rt2)
    }

    pub(crate) fn cap(&self, reg: CapReg) -> Capability {
        if reg == CapReg::Czr {
            return Capability::null();
        }
        self.writes
            .iter()
            .rev()
            .find(|(r, _)| *r == reg)
            .map(|(_, cap)| *cap)
            .unwrap_or_else(|| self.state.get(reg))
    }

    pub(crate) fn x(&self, reg: CapReg) -> u64 {
        self.cap(reg).cursor()
    }

    pub(crate) fn write(&mut self, reg: CapReg, cap: Capability) {
        if reg != CapReg::Czr {
            self.writes.push((reg, cap));
        }
    }

    pub(crate) fn write_x(&mut self, reg: CapReg, value: u64) {
        self.write(reg, Capability::from_int(value));
    }

    pub(crate) fn set_nzcv(&mut self, nzcv: Nzcv) {
        self.nzcv = Some(nzcv);
    }

    pub(crate) fn nzcv(&self) -> Nzcv {
        self.nzcv.unwrap_or(self.state.nzcv)
    }

    pub(crate) fn c64(&self) -> bool {
        self.state.c64
    }

    pub(crate) fn set_c64(&mut self, c64: bool) {
        self.c64 = Some(c64);
    }

    pub(crate) fn pc(&self) -> u64 {
        self.state.pcc.cursor()
    }

    pub(crate) fn pcc(&self) -> Capability {
        self.state.pcc
    }

    pub(crate) fn ddc(&self) -> Capability {
        self.cap(CapReg::Ddc)
    }

    pub(crate) fn jump(&mut self, target: Capability) {
        self.branch = Some(target);
    }

    pub(crate) fn note_inexact(&mut self) {
        self.bounds_inexact = true;
    }

    pub(crate) fn fault(&self, kind: impl Into<FaultKind>, reg: Option<CapReg>, addr: Option<u64>) -> Fault {
        Fault {
            kind: kind.into(),
            mnemonic: self.entry.mnemonic,
            reg,
            addr,
            pc: self.pc(),
        }
    }

    pub(crate) fn bus_fault(&self, err: BusError, addr: u64) -> Fault {
        self.fault(err, None, Some(addr))
    }

    pub(crate) fn undefined(&self) -> Fault {
        self.fault(FaultKind::Undefined, None, None)
    }

    /// Validates an access through `cap` (read from `reg`).
    pub(crate) fn check(&mut self, cap: &Capability, reg: CapReg, req: AccessRequest) -> Result<(), Fault> {
        let result = check_access(cap, &req);
        self.observer.on_check(self.entry.mnemonic, result);
        result.map_err(|err| {
            log::warn!("{}: {err} via {reg} at {:#x}", self.entry.mnemonic, req.addr);
            self.fault(err, Some(reg), Some(req.addr))
        })
    }

    /// Moves the cursor of `cap`, reporting the derivation to the observer.
    /// `dest` names the register that will receive the result.
    pub(crate) fn derive_cursor(
        &mut self,
        kind: Derivation,
        dest: CapReg,
        cap: &mut Capability,
        cursor: u64,
    ) -> Result<(), Fault> {
        let before = *cap;
        let update = cap.set_cursor(cursor);
        self.observer.on_derive(kind, &before.rebased(cursor));
        if update == CursorUpdate::ClearedUnrepresentable {
            log::debug!("{}: {dest} became unrepresentable at {cursor:#x}", self.entry.mnemonic);
            self.observer.on_unrepresentable(kind, dest, cap);
            if self.config.fault_on_unrepresentable {
                return Err(self.fault(CapFault::Unrepresentable, Some(dest), Some(cursor)));
            }
        }
        Ok(())
    }

    /// True when PCC carries the System permission.
    pub(crate) fn system_context(&self) -> bool {
        self.state.pcc.has_perms(CapPerms::SYSTEM)
    }

    fn into_effects(self) -> Effects {
        Effects {
            writes: self.writes,
            nzcv: self.nzcv,
            branch: self.branch,
            c64: self.c64,
            bounds_inexact: self.bounds_inexact,
        }
    }
}

/// Capability instruction executor for one execution context.
pub struct MorelloExecutor<O: CapObserver = NullObserver> {
    config: CoreConfig,
    observer: O,
}

impl Default for MorelloExecutor {
    fn default() -> Self {
        Self::new(CoreConfig::default())
    }
}

impl MorelloExecutor {
    pub fn new(config: CoreConfig) -> Self {
        MorelloExecutor {
            config,
            observer: NullObserver,
        }
    }
}

impl<O: CapObserver> MorelloExecutor<O> {
    pub fn with_observer<P: CapObserver>(self, observer: P) -> MorelloExecutor<P> {
        MorelloExecutor {
            config: self.config,
            observer,
        }
    }

    pub fn config(&self) -> &CoreConfig {
        &self.config
    }

    pub fn config_mut(&mut self) -> &mut CoreConfig {
        &mut self.config
    }

    pub fn observer(&self) -> &O {
        &self.observer
    }

    pub fn observer_mut(&mut self) -> &mut O {
        &mut self.observer
    }

    /// Executes one instruction. On `Err` the register file is unchanged.
    pub fn execute(
        &mut self,
        instr: &Instr,
        state: &mut CapState,
        bus: &mut dyn CapBus,
    ) -> Result<StepOutcome, Fault> {
        let pc = state.pc();
        let Some(entry) = dispatch::lookup(instr.op) else {
            log::warn!("{pc:#x}: no handler for {:?}", instr.op);
            return Err(Fault {
                kind: FaultKind::Undefined,
                mnemonic: "UNDEFINED",
                reg: None,
                addr: None,
                pc,
            });
        };
        if !self.config.capabilities_enabled {
            return Err(Fault {
                kind: FaultKind::CapabilitiesDisabled,
                mnemonic: entry.mnemonic,
                reg: None,
                addr: None,
                pc,
            });
        }

        let fetch = AccessRequest::new(CapPerms::EXECUTE, state.pcc.address(), 4).aligned(4);
        let fetched = check_access(&state.pcc, &fetch);
        self.observer.on_check("fetch", fetched);
        if let Err(err) = fetched {
            log::warn!("instruction fetch at {pc:#x} failed: {err}");
            return Err(Fault {
                kind: err.into(),
                mnemonic: entry.mnemonic,
                reg: Some(CapReg::Pcc),
                addr: Some(pc),
                pc,
            });
        }

        log::trace!("{pc:#x}: {} {:?}", entry.mnemonic, instr);
        let effects = {
            let mut ex = Exec::new(state, bus, &self.config, &mut self.observer, entry, instr);
            (entry.handler)(&mut ex)?;
            ex.into_effects()
        };
        Ok(commit(state, effects))
    }
}

fn commit(state: &mut CapState, effects: Effects) -> StepOutcome {
    for (reg, cap) in effects.writes {
        state.set(reg, cap);
    }
    if let Some(nzcv) = effects.nzcv {
        state.nzcv = nzcv;
    }
    if let Some(c64) = effects.c64 {
        state.c64 = c64;
    }
    let branched = effects.branch.is_some();
    match effects.branch {
        Some(target) => state.pcc = target,
        None => {
            let next = state.pcc.cursor().wrapping_add(4);
            state.pcc.set_cursor(next);
        }
    }
    StepOutcome {
        pc: state.pcc.cursor(),
        branched,
        bounds_inexact: effects.bounds_inexact,
    }
}
