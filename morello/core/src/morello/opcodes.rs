//! Decoded instruction records handed over by the external decoder.
//!
//! Register fields carry raw 5-bit indices; what index 31 means is decided
//! per operand slot by the dispatch table, never by the handlers.

use bitflags::bitflags;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Op {
    // derivation and manipulation
    AddImm,
    AddExt,
    AlignDown,
    AlignUp,
    BicFlgsImm,
    OrrFlgsImm,
    EorFlgsImm,
    BicFlgs,
    OrrFlgs,
    EorFlgs,
    ScFlgs,
    Cthi,
    ScBnds,
    ScBndsE,
    ScBndsImm,
    ScValue,
    ScOff,
    Rrlen,
    Rrmask,
    ScTag,
    ClrTag,
    Mov,
    Seal,
    SealImm,
    Cseal,
    Unseal,
    Build,
    CpyType,
    CpyValue,
    ClrPerm,
    ClrPermImm,
    Csel,
    // comparisons and field reads
    Subs,
    ChkSs,
    ChkSsu,
    ChkEq,
    ChkSld,
    ChkTgd,
    GcBase,
    GcLen,
    GcValue,
    GcOff,
    GcTag,
    GcSeal,
    GcPerm,
    GcType,
    GcLim,
    GcFlgs,
    Cfhi,
    Adr,
    Adrp,
    Adrdp,
    // conversions
    CvtToPtr,
    CvtDdcToPtr,
    CvtPccToPtr,
    CvtToCap,
    CvtDdcToCap,
    CvtPccToCap,
    // memory
    LdrCap,
    StrCap,
    LdrCapLiteral,
    LdpCap,
    StpCap,
    LdxrCap,
    StxrCap,
    LdarCap,
    StlrCap,
    LdaprCap,
    CasCap,
    SwpCap,
    AldrCap,
    AstrCap,
    Aldr,
    Astr,
    LdarInt,
    StlrInt,
    Ldct,
    Stct,
    // control transfer
    Br,
    Blr,
    Ret,
    Bx,
    BrLoad,
    Brs,
    Ldpbr,
}

bitflags! {
    /// Instruction modifiers that select a variant of an operation.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
    pub struct Mods: u32 {
        const LINK = 1 << 0;
        const ACQUIRE = 1 << 1;
        const RELEASE = 1 << 2;
        const PAIR = 1 << 3;
        /// Sign-extend a sub-width load to 64 bits.
        const SIGNED = 1 << 4;
        /// Sign-extend a sub-width load to 32 bits.
        const SIGNED_W = 1 << 5;
        const ZERO_IS_NULL = 1 << 6;
        const UNPRIV = 1 << 7;
        const NON_TEMPORAL = 1 << 8;
        /// Use the alternate base (integer base in C64, capability base in A64).
        const ALTERNATE = 1 << 9;
        const SEALED = 1 << 10;
        const RESTRICTED = 1 << 11;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Indexing {
    #[default]
    Offset,
    Pre,
    Post,
}

/// Register-offset extend option.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Extend {
    Uxtb,
    Uxth,
    Uxtw,
    Uxtx,
    Sxtb,
    Sxth,
    Sxtw,
    Sxtx,
}

impl Extend {
    pub fn from_option(option: u8) -> Self {
        match option & 7 {
            0 => Extend::Uxtb,
            1 => Extend::Uxth,
            2 => Extend::Uxtw,
            3 => Extend::Uxtx,
            4 => Extend::Sxtb,
            5 => Extend::Sxth,
            6 => Extend::Sxtw,
            _ => Extend::Sxtx,
        }
    }

    pub fn apply(self, value: u64, shift: u8) -> u64 {
        let extended = match self {
            Extend::Uxtb => value & 0xff,
            Extend::Uxth => value & 0xffff,
            Extend::Uxtw => value & 0xffff_ffff,
            Extend::Uxtx => value,
            Extend::Sxtb => value as u8 as i8 as i64 as u64,
            Extend::Sxth => value as u16 as i16 as i64 as u64,
            Extend::Sxtw => value as u32 as i32 as i64 as u64,
            Extend::Sxtx => value,
        };
        extended << (shift & 63)
    }
}

/// One decoded instruction.
///
/// Register roles by class:
/// - data processing: `rd` destination, `rn`/`rm` sources;
/// - memory: `rd` is Ct, `rt2` the second data register (Ct2 of pairs, Cs of
///   CAS/SWP), `rn` the base and `rm` the index register or the store-exclusive
///   status register;
/// - branches: `rn` is the target, `rm` the data capability of BRS, `rd` the
///   data destination of LDPBR.
///
/// Immediates are already scaled and sign-extended byte offsets. `size` is
/// the log2 access width of integer memory forms.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Instr {
    pub op: Op,
    #[serde(default)]
    pub rd: u8,
    #[serde(default)]
    pub rn: u8,
    #[serde(default)]
    pub rm: u8,
    #[serde(default)]
    pub rt2: u8,
    #[serde(default)]
    pub imm: i64,
    #[serde(default)]
    pub extend: Option<Extend>,
    #[serde(default)]
    pub shift: u8,
    #[serde(default)]
    pub cond: u8,
    #[serde(default = "default_size")]
    pub size: u8,
    #[serde(default)]
    pub index: Indexing,
    #[serde(default)]
    pub mods: Mods,
}

fn default_size() -> u8 {
    3
}

impl Instr {
    pub fn new(op: Op) -> Self {
        Instr {
            op,
            rd: 0,
            rn: 0,
            rm: 0,
            rt2: 0,
            imm: 0,
            extend: None,
            shift: 0,
            cond: 0,
            size: 3,
            index: Indexing::Offset,
            mods: Mods::empty(),
        }
    }

    pub fn rd(mut self, rd: u8) -> Self {
        self.rd = rd;
        self
    }

    pub fn rn(mut self, rn: u8) -> Self {
        self.rn = rn;
        self
    }

    pub fn rm(mut self, rm: u8) -> Self {
        self.rm = rm;
        self
    }

    pub fn rt2(mut self, rt2: u8) -> Self {
        self.rt2 = rt2;
        self
    }

    pub fn imm(mut self, imm: i64) -> Self {
        self.imm = imm;
        self
    }

    pub fn extend(mut self, extend: Extend, shift: u8) -> Self {
        self.extend = Some(extend);
        self.shift = shift;
        self
    }

    pub fn cond(mut self, cond: u8) -> Self {
        self.cond = cond;
        self
    }

    pub fn size(mut self, size: u8) -> Self {
        self.size = size;
        self
    }

    pub fn index(mut self, index: Indexing) -> Self {
        self.index = index;
        self
    }

    pub fn mods(mut self, mods: Mods) -> Self {
        self.mods |= mods;
        self
    }

    pub fn has(&self, mods: Mods) -> bool {
        self.mods.contains(mods)
    }
}
