use crate::capability::Capability;
use serde::{Deserialize, Serialize};
use std::fmt;

pub const GENERAL_REGS: usize = 31;
/// Register receiving the data capability of sealed-pair and load-pair branches.
pub const INVOKE_DATA_REG: u8 = 29;
pub const LINK_REG: u8 = 30;

/// A resolved capability register name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CapReg {
    C(u8),
    Csp,
    Czr,
    Ddc,
    Pcc,
}

impl fmt::Display for CapReg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CapReg::C(n) => write!(f, "c{n}"),
            CapReg::Csp => write!(f, "csp"),
            CapReg::Czr => write!(f, "czr"),
            CapReg::Ddc => write!(f, "ddc"),
            CapReg::Pcc => write!(f, "pcc"),
        }
    }
}

impl Serialize for CapReg {
    fn serialize<S: serde::Serializer>(&self, ser: S) -> Result<S::Ok, S::Error> {
        ser.collect_str(self)
    }
}

/// Meaning of register index 31 in one operand slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Slot {
    /// 31 is the zero register: reads as null/0, writes are dropped.
    Zero,
    /// 31 is the stack pointer capability.
    Sp,
}

impl Slot {
    pub fn resolve(self, index: u8) -> CapReg {
        match (index & 31, self) {
            (31, Slot::Zero) => CapReg::Czr,
            (31, Slot::Sp) => CapReg::Csp,
            (n, _) => CapReg::C(n),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Nzcv {
    #[serde(default)]
    pub n: bool,
    #[serde(default)]
    pub z: bool,
    #[serde(default)]
    pub c: bool,
    #[serde(default)]
    pub v: bool,
}

impl Nzcv {
    /// Flags of `a - b` as computed by SUBS.
    pub fn from_sub(a: u64, b: u64) -> Self {
        let (result, borrow) = a.overflowing_sub(b);
        let overflow = ((a ^ b) & (a ^ result)) >> 63 == 1;
        Nzcv {
            n: result >> 63 == 1,
            z: result == 0,
            c: !borrow,
            v: overflow,
        }
    }

    pub fn condition_holds(&self, cond: u8) -> bool {
        let base = match (cond >> 1) & 7 {
            0 => self.z,
            1 => self.c,
            2 => self.n,
            3 => self.v,
            4 => self.c && !self.z,
            5 => self.n == self.v,
            6 => self.n == self.v && !self.z,
            _ => true,
        };
        if cond & 1 == 1 && cond != 0xF {
            !base
        } else {
            base
        }
    }
}

/// Architectural capability register file of one execution context.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CapState {
    #[serde(default = "null_regs")]
    regs: Vec<Capability>,
    #[serde(default)]
    pub csp: Capability,
    #[serde(default = "Capability::root")]
    pub ddc: Capability,
    #[serde(default = "Capability::root")]
    pub pcc: Capability,
    #[serde(default)]
    pub nzcv: Nzcv,
    /// PSTATE.C64: capability (true) or integer (false) base addressing.
    #[serde(default = "default_c64")]
    pub c64: bool,
}

fn null_regs() -> Vec<Capability> {
    vec![Capability::null(); GENERAL_REGS]
}

fn default_c64() -> bool {
    true
}

impl Default for CapState {
    fn default() -> Self {
        Self::new()
    }
}

impl CapState {
    pub fn new() -> Self {
        CapState {
            regs: null_regs(),
            csp: Capability::null(),
            ddc: Capability::root(),
            pcc: Capability::root(),
            nzcv: Nzcv::default(),
            c64: true,
        }
    }

    pub fn get(&self, reg: CapReg) -> Capability {
        match reg {
            CapReg::C(n) => self
                .regs
                .get(usize::from(n))
                .copied()
                .unwrap_or_else(Capability::null),
            CapReg::Csp => self.csp,
            CapReg::Czr => Capability::null(),
            CapReg::Ddc => self.ddc,
            CapReg::Pcc => self.pcc,
        }
    }

    pub fn set(&mut self, reg: CapReg, cap: Capability) {
        match reg {
            CapReg::C(n) => {
                let n = usize::from(n);
                if self.regs.len() < GENERAL_REGS {
                    self.regs.resize(GENERAL_REGS, Capability::null());
                }
                if let Some(slot) = self.regs.get_mut(n) {
                    *slot = cap;
                }
            }
            CapReg::Csp => self.csp = cap,
            CapReg::Czr => {}
            CapReg::Ddc => self.ddc = cap,
            CapReg::Pcc => self.pcc = cap,
        }
    }

    /// Integer view of a register (the cursor; zero for CZR).
    pub fn x(&self, reg: CapReg) -> u64 {
        self.get(reg).cursor()
    }

    /// Integer write: the register becomes an untagged integer value.
    pub fn set_x(&mut self, reg: CapReg, value: u64) {
        self.set(reg, Capability::from_int(value));
    }

    /// General register `n`, with 31 meaning CSP.
    pub fn c(&self, n: u8) -> Capability {
        self.get(Slot::Sp.resolve(n))
    }

    pub fn set_c(&mut self, n: u8, cap: Capability) {
        self.set(Slot::Sp.resolve(n), cap);
    }

    pub fn pc(&self) -> u64 {
        self.pcc.cursor()
    }

    pub fn set_pc(&mut self, pc: u64) {
        self.pcc = self.pcc.with_cursor(pc);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn index_31_follows_slot_convention() {
        assert_eq!(Slot::Zero.resolve(31), CapReg::Czr);
        assert_eq!(Slot::Sp.resolve(31), CapReg::Csp);
        assert_eq!(Slot::Zero.resolve(7), CapReg::C(7));
    }

    #[test]
    fn zero_register_reads_null_and_drops_writes() {
        let mut state = CapState::new();
        state.set(CapReg::Czr, Capability::root());
        assert_eq!(state.get(CapReg::Czr), Capability::null());
        assert_eq!(state.x(CapReg::Czr), 0);
    }

    #[test]
    fn integer_writes_clear_tags() {
        let mut state = CapState::new();
        state.set_c(3, Capability::root());
        state.set_x(CapReg::C(3), 0x42);
        assert!(!state.c(3).tag());
        assert_eq!(state.c(3).cursor(), 0x42);
    }

    #[test]
    fn sub_flags_match_a64_compare() {
        let eq = Nzcv::from_sub(5, 5);
        assert!(eq.z && eq.c && !eq.n && !eq.v);
        let lt = Nzcv::from_sub(1, 2);
        assert!(lt.n && !lt.c);
        assert!(lt.condition_holds(0b0011));
        assert!(!lt.condition_holds(0b0010));
        let ovf = Nzcv::from_sub(i64::MIN as u64, 1);
        assert!(ovf.v);
    }

    #[test]
    fn state_round_trips_through_json() {
        let mut state = CapState::new();
        state.set_c(1, Capability::root().with_cursor(0x1234));
        state.nzcv.z = true;
        let json = serde_json::to_string(&state).unwrap();
        let back: CapState = serde_json::from_str(&json).unwrap();
        assert_eq!(back, state);
    }
}
