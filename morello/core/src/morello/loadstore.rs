//! Capability-checked loads and stores.
//!
//! Every memory instruction is described by a [`MemAccess`] and executed by
//! [`perform`]: address generation, one validation over the whole span,
//! the transfer itself, then base register write back.

use crate::capability::{bounds_address, CapPerms, Capability, CAP_SIZE};
use crate::check::{perms_for_store, AccessRequest};
use crate::memory::{Access, Barrier, TAG_GROUP};
use crate::morello::eval::Exec;
use crate::morello::fault::{Fault, FaultKind};
use crate::morello::opcodes::{Extend, Indexing, Mods, Op};
use crate::morello::state::CapReg;
use crate::observer::Derivation;

type Step = Result<(), Fault>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Width {
    Cap,
    /// log2 of the byte width.
    Int(u8),
}

impl Width {
    fn bytes(self) -> u64 {
        match self {
            Width::Cap => CAP_SIZE,
            Width::Int(log2) => 1 << log2,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Atomic {
    None,
    Swap,
    CompareSwap,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SignExtend {
    None,
    To32,
    To64,
}

#[derive(Debug, Clone, Copy)]
struct MemAccess {
    is_load: bool,
    width: Width,
    data: CapReg,
    data2: Option<CapReg>,
    base: CapReg,
    index: Option<(CapReg, Extend, u8)>,
    imm: i64,
    indexing: Indexing,
    alternate: bool,
    pcc_literal: bool,
    exclusive: bool,
    status: Option<CapReg>,
    acquire: bool,
    release: bool,
    atomic: Atomic,
    sign: SignExtend,
    access: Access,
}

impl MemAccess {
    fn new(ex: &Exec<'_>, is_load: bool, width: Width) -> Self {
        let instr = ex.instr;
        MemAccess {
            is_load,
            width,
            data: ex.d(),
            data2: None,
            base: ex.n(),
            index: None,
            imm: instr.imm,
            indexing: instr.index,
            alternate: instr.has(Mods::ALTERNATE),
            pcc_literal: false,
            exclusive: false,
            status: None,
            acquire: instr.has(Mods::ACQUIRE),
            release: instr.has(Mods::RELEASE),
            atomic: Atomic::None,
            sign: SignExtend::None,
            access: if instr.has(Mods::UNPRIV) {
                Access::Unprivileged
            } else {
                Access::Normal
            },
        }
    }

    fn with_register_offset(mut self, ex: &Exec<'_>) -> Self {
        if let Some(extend) = ex.instr.extend {
            self.index = Some((ex.m(), extend, ex.instr.shift));
        }
        self
    }

    fn span(&self) -> u64 {
        let count = if self.data2.is_some() && self.atomic == Atomic::None {
            2
        } else {
            1
        };
        self.width.bytes() * count
    }
}

/// Tag and permission filtering applied to every loaded capability.
fn squash_loaded(auth: &Capability, mut loaded: Capability) -> Capability {
    if !auth.has_perms(CapPerms::LOAD_CAP) {
        loaded.clear_tag();
    } else if loaded.tag() && !loaded.is_sealed() && !auth.has_perms(CapPerms::MUTABLE_LOAD) {
        let perms = loaded.perms().difference(CapPerms::MUTATING);
        loaded.set_perms_unchecked(perms);
    }
    loaded
}

fn extend_loaded(value: u64, log2: u8, sign: SignExtend) -> u64 {
    let bits = 8u32 << log2;
    if bits >= 64 || sign == SignExtend::None {
        return value;
    }
    let shift = 64 - bits;
    let signed = (((value << shift) as i64) >> shift) as u64;
    match sign {
        SignExtend::To32 => signed & 0xffff_ffff,
        _ => signed,
    }
}

fn perform(ex: &mut Exec<'_>, m: MemAccess) -> Step {
    let capability_base = !m.pcc_literal && ex.c64() != m.alternate;

    if m.base == CapReg::Csp
        && !m.pcc_literal
        && ex.config.sp_alignment_check
        && ex.x(CapReg::Csp) % 16 != 0
    {
        return Err(ex.fault(FaultKind::SpAlignment, Some(CapReg::Csp), None));
    }

    let (mut addr, writeback) = if m.pcc_literal {
        (ex.pc().wrapping_add(m.imm as u64) & !(CAP_SIZE - 1), 0)
    } else {
        let base = ex.x(m.base);
        let addr = match m.indexing {
            Indexing::Post => base,
            _ => base.wrapping_add(m.imm as u64),
        };
        (addr, addr)
    };
    if let Some((reg, extend, shift)) = m.index {
        addr = addr.wrapping_add(extend.apply(ex.x(reg), shift));
    }

    let (auth, auth_reg) = if m.pcc_literal {
        (ex.pcc(), CapReg::Pcc)
    } else if capability_base {
        (ex.cap(m.base), m.base)
    } else {
        let ddc = ex.ddc();
        if ex.config.ddc_base_offset() {
            addr = addr.wrapping_add(ddc.base());
        }
        (ddc, CapReg::Ddc)
    };
    let addr = bounds_address(addr);

    let span = m.span();
    let natural = m.exclusive || m.acquire || m.release || m.atomic != Atomic::None;
    let align = match m.width {
        Width::Cap => CAP_SIZE,
        Width::Int(_) if natural || ex.config.strict_alignment => span,
        Width::Int(_) => 1,
    };
    let perms = if m.is_load && m.atomic == Atomic::None {
        CapPerms::LOAD
    } else {
        let mut perms = match m.width {
            Width::Cap => {
                let stored = if m.atomic == Atomic::Swap {
                    m.data2.map(|r| ex.cap(r)).unwrap_or_else(Capability::null)
                } else {
                    ex.cap(m.data)
                };
                let mut perms = perms_for_store(&stored);
                if m.atomic == Atomic::None {
                    if let Some(second) = m.data2 {
                        perms |= perms_for_store(&ex.cap(second));
                    }
                }
                perms
            }
            Width::Int(_) => CapPerms::STORE,
        };
        if m.atomic != Atomic::None {
            perms |= CapPerms::LOAD;
        }
        perms
    };
    ex.check(&auth, auth_reg, AccessRequest::new(perms, addr, span).aligned(align))?;

    // Resolved before the bus is touched; staged after the transfer so a
    // store of the base register sees its old value.
    let updated_base = if m.indexing != Indexing::Offset && !m.pcc_literal {
        let wb = match m.indexing {
            Indexing::Post => writeback.wrapping_add(m.imm as u64),
            _ => writeback,
        };
        if capability_base {
            let mut base = ex.cap(m.base);
            ex.derive_cursor(Derivation::Writeback, m.base, &mut base, wb)?;
            Some(base)
        } else {
            Some(Capability::from_int(wb))
        }
    } else {
        None
    };

    if m.release {
        ex.bus.barrier(Barrier::Release);
    }
    match m.width {
        Width::Cap => transfer_caps(ex, &m, &auth, addr, span)?,
        Width::Int(log2) => transfer_ints(ex, &m, addr, span, log2)?,
    }
    if m.acquire {
        ex.bus.barrier(Barrier::Acquire);
    }

    if let Some(base) = updated_base {
        ex.write(m.base, base);
    }
    Ok(())
}

fn transfer_caps(
    ex: &mut Exec<'_>,
    m: &MemAccess,
    auth: &Capability,
    addr: u64,
    span: u64,
) -> Step {
    match m.atomic {
        Atomic::Swap => {
            let value = m.data2.map(|r| ex.cap(r)).unwrap_or_else(Capability::null);
            let old = ex
                .bus
                .swap_cap(addr, value.compress())
                .map_err(|e| ex.bus_fault(e, addr))?;
            ex.write(m.data, squash_loaded(auth, old.decompress()));
            return Ok(());
        }
        Atomic::CompareSwap => {
            let compare = m.data2.unwrap_or(CapReg::Czr);
            let expected = ex.cap(compare);
            let value = ex.cap(m.data);
            let old = ex
                .bus
                .compare_swap_cap(addr, expected.compress(), value.compress())
                .map_err(|e| ex.bus_fault(e, addr))?;
            ex.write(compare, squash_loaded(auth, old.decompress()));
            return Ok(());
        }
        Atomic::None => {}
    }

    if m.is_load {
        let first = ex
            .bus
            .read_cap(addr, m.access)
            .map_err(|e| ex.bus_fault(e, addr))?;
        let second = match m.data2 {
            Some(_) => {
                let addr2 = addr.wrapping_add(CAP_SIZE);
                Some(
                    ex.bus
                        .read_cap(addr2, m.access)
                        .map_err(|e| ex.bus_fault(e, addr2))?,
                )
            }
            None => None,
        };
        if m.exclusive {
            ex.bus.reserve(addr, span);
        }
        ex.write(m.data, squash_loaded(auth, first.decompress()));
        if let (Some(reg), Some(bits)) = (m.data2, second) {
            ex.write(reg, squash_loaded(auth, bits.decompress()));
        }
        return Ok(());
    }

    let first = ex.cap(m.data).compress();
    let second = m.data2.map(|r| ex.cap(r).compress());
    if m.exclusive {
        let won = ex.bus.take_reservation(addr, span);
        if let Some(status) = m.status {
            ex.write_x(status, u64::from(!won));
        }
        if !won {
            return Ok(());
        }
    }
    ex.bus
        .probe_write(addr, span, m.access)
        .map_err(|e| ex.bus_fault(e, addr))?;
    ex.bus
        .write_cap(addr, first, m.access)
        .map_err(|e| ex.bus_fault(e, addr))?;
    if let Some(bits) = second {
        let addr2 = addr.wrapping_add(CAP_SIZE);
        ex.bus
            .write_cap(addr2, bits, m.access)
            .map_err(|e| ex.bus_fault(e, addr2))?;
    }
    Ok(())
}

fn transfer_ints(ex: &mut Exec<'_>, m: &MemAccess, addr: u64, span: u64, log2: u8) -> Step {
    let size = 1usize << log2;
    let step = 1u64 << log2;
    if m.is_load {
        let first = ex
            .bus
            .read(addr, size, m.access)
            .map_err(|e| ex.bus_fault(e, addr))?;
        match m.data2 {
            Some(reg) => {
                let addr2 = addr.wrapping_add(step);
                let second = ex
                    .bus
                    .read(addr2, size, m.access)
                    .map_err(|e| ex.bus_fault(e, addr2))?;
                ex.write_x(m.data, first);
                ex.write_x(reg, second);
            }
            None => ex.write_x(m.data, extend_loaded(first, log2, m.sign)),
        }
        if m.exclusive {
            ex.bus.reserve(addr, span);
        }
        return Ok(());
    }

    if m.exclusive {
        let won = ex.bus.take_reservation(addr, span);
        if let Some(status) = m.status {
            ex.write_x(status, u64::from(!won));
        }
        if !won {
            return Ok(());
        }
    }
    ex.bus
        .probe_write(addr, span, m.access)
        .map_err(|e| ex.bus_fault(e, addr))?;
    let value = ex.x(m.data);
    ex.bus
        .write(addr, size, value, m.access)
        .map_err(|e| ex.bus_fault(e, addr))?;
    if let Some(reg) = m.data2 {
        let addr2 = addr.wrapping_add(step);
        let value = ex.x(reg);
        ex.bus
            .write(addr2, size, value, m.access)
            .map_err(|e| ex.bus_fault(e, addr2))?;
    }
    Ok(())
}

/// LDR/STR (capability): immediate, pre/post-index, unprivileged and register offset.
pub(crate) fn ldr_str_cap(ex: &mut Exec<'_>) -> Step {
    let is_load = ex.instr.op == Op::LdrCap;
    let m = MemAccess::new(ex, is_load, Width::Cap).with_register_offset(ex);
    perform(ex, m)
}

/// LDR (literal): PCC-relative, 16-byte aligned.
pub(crate) fn ldr_literal(ex: &mut Exec<'_>) -> Step {
    let mut m = MemAccess::new(ex, true, Width::Cap);
    m.pcc_literal = true;
    m.indexing = Indexing::Offset;
    perform(ex, m)
}

pub(crate) fn ldp_stp_cap(ex: &mut Exec<'_>) -> Step {
    let is_load = ex.instr.op == Op::LdpCap;
    let mut m = MemAccess::new(ex, is_load, Width::Cap);
    m.data2 = Some(ex.t2());
    perform(ex, m)
}

/// LDXR/LDAXR/STXR/STLXR, single and pair.
pub(crate) fn exclusive_cap(ex: &mut Exec<'_>) -> Step {
    let is_load = ex.instr.op == Op::LdxrCap;
    let mut m = MemAccess::new(ex, is_load, Width::Cap);
    m.exclusive = true;
    m.indexing = Indexing::Offset;
    if ex.instr.has(Mods::PAIR) {
        m.data2 = Some(ex.t2());
    }
    if !is_load {
        m.status = Some(ex.m());
    }
    perform(ex, m)
}

/// LDAR/STLR/LDAPR on capabilities.
pub(crate) fn ordered_cap(ex: &mut Exec<'_>) -> Step {
    let is_load = ex.instr.op != Op::StlrCap;
    let mut m = MemAccess::new(ex, is_load, Width::Cap);
    m.indexing = Indexing::Offset;
    if is_load {
        m.acquire = true;
    } else {
        m.release = true;
    }
    perform(ex, m)
}

/// CAS and SWP (with acquire/release variants).
pub(crate) fn atomic_cap(ex: &mut Exec<'_>) -> Step {
    let mut m = MemAccess::new(ex, true, Width::Cap);
    m.indexing = Indexing::Offset;
    m.data2 = Some(ex.t2());
    m.atomic = if ex.instr.op == Op::CasCap {
        Atomic::CompareSwap
    } else {
        Atomic::Swap
    };
    perform(ex, m)
}

/// ALDR/ASTR of capabilities through the alternate base.
pub(crate) fn alternate_cap(ex: &mut Exec<'_>) -> Step {
    let is_load = ex.instr.op == Op::AldrCap;
    let mut m = MemAccess::new(ex, is_load, Width::Cap).with_register_offset(ex);
    m.alternate = true;
    perform(ex, m)
}

/// ALDR/ASTR/ALDUR/ALDURS of integers through the alternate base.
pub(crate) fn alternate_int(ex: &mut Exec<'_>) -> Step {
    let log2 = ex.instr.size.min(3);
    let is_load = ex.instr.op == Op::Aldr;
    let mut m = MemAccess::new(ex, is_load, Width::Int(log2)).with_register_offset(ex);
    m.alternate = true;
    m.sign = if ex.instr.has(Mods::SIGNED_W) {
        SignExtend::To32
    } else if ex.instr.has(Mods::SIGNED) {
        SignExtend::To64
    } else {
        SignExtend::None
    };
    perform(ex, m)
}

/// LDAR/STLR of bytes and words through the alternate base.
pub(crate) fn ordered_int(ex: &mut Exec<'_>) -> Step {
    let log2 = ex.instr.size.min(3);
    let is_load = ex.instr.op == Op::LdarInt;
    let mut m = MemAccess::new(ex, is_load, Width::Int(log2));
    m.alternate = true;
    m.indexing = Indexing::Offset;
    if is_load {
        m.acquire = true;
    } else {
        m.release = true;
    }
    perform(ex, m)
}

fn tag_group_authority(ex: &Exec<'_>) -> (u64, Capability, CapReg) {
    let base = ex.n();
    let mut addr = ex.x(base);
    if ex.c64() {
        (bounds_address(addr), ex.cap(base), base)
    } else {
        let ddc = ex.ddc();
        if ex.config.ddc_base_offset() {
            addr = addr.wrapping_add(ddc.base());
        }
        (bounds_address(addr), ddc, CapReg::Ddc)
    }
}

const TAG_SPAN: u64 = CAP_SIZE * TAG_GROUP as u64;

/// LDCT: tags of four granules; zero unless the authority may load capabilities.
pub(crate) fn load_tags(ex: &mut Exec<'_>) -> Step {
    let (addr, auth, reg) = tag_group_authority(ex);
    let req = AccessRequest::new(CapPerms::LOAD, addr, TAG_SPAN).aligned(TAG_SPAN);
    ex.check(&auth, reg, req)?;
    let tags = if auth.has_perms(CapPerms::LOAD_CAP) {
        ex.bus
            .get_tags(addr, TAG_GROUP)
            .map_err(|e| ex.bus_fault(e, addr))?
    } else {
        0
    };
    ex.write_x(ex.d(), u64::from(tags));
    Ok(())
}

/// STCT: sets the tags of four granules from the low bits of Xt.
pub(crate) fn store_tags(ex: &mut Exec<'_>) -> Step {
    let (addr, auth, reg) = tag_group_authority(ex);
    let may_set = !ex.config.tag_setting_disabled && ex.system_context();
    let tags = if may_set {
        (ex.x(ex.d()) & 0xf) as u8
    } else {
        0
    };
    let mut perms = CapPerms::STORE;
    if tags != 0 {
        perms |= CapPerms::STORE_CAP;
    }
    ex.check(&auth, reg, AccessRequest::new(perms, addr, TAG_SPAN).aligned(TAG_SPAN))?;
    ex.bus
        .set_tags(addr, TAG_GROUP, tags)
        .map_err(|e| ex.bus_fault(e, addr))?;
    Ok(())
}

/// Raw paired capability load used by the branch unit: validates
/// `[addr, addr + 16 * count)` through `auth` and returns the squashed values
/// without touching any register.
pub(crate) fn load_caps_for_branch(
    ex: &mut Exec<'_>,
    auth: &Capability,
    auth_reg: CapReg,
    addr: u64,
    count: u64,
) -> Result<Vec<Capability>, Fault> {
    let addr = bounds_address(addr);
    let req = AccessRequest::new(CapPerms::LOAD, addr, CAP_SIZE * count).aligned(CAP_SIZE);
    ex.check(auth, auth_reg, req)?;
    let mut caps = Vec::with_capacity(count as usize);
    for i in 0..count {
        let at = addr.wrapping_add(i * CAP_SIZE);
        let bits = ex
            .bus
            .read_cap(at, Access::Normal)
            .map_err(|e| ex.bus_fault(e, at))?;
        caps.push(squash_loaded(auth, bits.decompress()));
    }
    Ok(caps)
}
