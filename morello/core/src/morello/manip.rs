//! Capability derivation, sealing and field-access instructions.
//!
//! None of these fault on a policy violation: the result simply loses its
//! tag (or a flag reports the failure).

use crate::capability::{CapPerms, Capability, ObjectType, FLAGS_MASK};
use crate::codec::{self, CompressedCap};
use crate::config::Cctlr;
use crate::morello::eval::Exec;
use crate::morello::fault::Fault;
use crate::morello::opcodes::{Extend, Op};
use crate::morello::state::{CapReg, Nzcv};
use crate::observer::Derivation;

type Step = Result<(), Fault>;

pub(crate) fn add_imm(ex: &mut Exec<'_>) -> Step {
    let (dest, mut cap) = (ex.d(), ex.cap(ex.n()));
    let cursor = cap.cursor().wrapping_add(ex.instr.imm as u64);
    ex.derive_cursor(Derivation::Add, dest, &mut cap, cursor)?;
    ex.write(dest, cap);
    Ok(())
}

pub(crate) fn add_ext(ex: &mut Exec<'_>) -> Step {
    let (dest, mut cap) = (ex.d(), ex.cap(ex.n()));
    let extend = ex.instr.extend.unwrap_or(Extend::Uxtx);
    let offset = extend.apply(ex.x(ex.m()), ex.instr.shift);
    let cursor = cap.cursor().wrapping_add(offset);
    ex.derive_cursor(Derivation::Add, dest, &mut cap, cursor)?;
    ex.write(dest, cap);
    Ok(())
}

pub(crate) fn align(ex: &mut Exec<'_>) -> Step {
    let (dest, mut cap) = (ex.d(), ex.cap(ex.n()));
    let bits = (ex.instr.imm as u32).min(63);
    let mask = (1u64 << bits) - 1;
    let cursor = match ex.instr.op {
        Op::AlignUp => cap.cursor().wrapping_add(mask) & !mask,
        _ => cap.cursor() & !mask,
    };
    ex.derive_cursor(Derivation::SetAddress, dest, &mut cap, cursor)?;
    ex.write(dest, cap);
    Ok(())
}

/// BICFLGS/ORRFLGS/EORFLGS (immediate and register) and SCFLGS.
pub(crate) fn flags(ex: &mut Exec<'_>) -> Step {
    let (dest, mut cap) = (ex.d(), ex.cap(ex.n()));
    let operand = match ex.instr.op {
        Op::BicFlgsImm | Op::OrrFlgsImm | Op::EorFlgsImm => ex.instr.imm as u8,
        _ => (ex.x(ex.m()) >> 56) as u8,
    };
    let current = cap.flags();
    let flags = match ex.instr.op {
        Op::BicFlgs | Op::BicFlgsImm => current & !operand,
        Op::OrrFlgs | Op::OrrFlgsImm => current | operand,
        Op::EorFlgs | Op::EorFlgsImm => current ^ operand,
        _ => operand,
    };
    if cap.set_flags(flags).cleared_tag() {
        log::debug!("{}: flags change on sealed {}", ex.mnemonic(), ex.n());
    }
    ex.write(dest, cap);
    Ok(())
}

/// CTHI: replaces the metadata word; the result is never tagged.
pub(crate) fn copy_to_high(ex: &mut Exec<'_>) -> Step {
    let source = ex.cap(ex.n());
    let pesbt = ex.x(ex.m());
    let cap = CompressedCap::new(pesbt, source.cursor(), false).decompress();
    ex.write(ex.d(), cap);
    Ok(())
}

pub(crate) fn set_bounds(ex: &mut Exec<'_>) -> Step {
    let (dest, mut cap) = (ex.d(), ex.cap(ex.n()));
    let (length, exact) = match ex.instr.op {
        Op::ScBnds => (ex.x(ex.m()), false),
        Op::ScBndsE => (ex.x(ex.m()), true),
        _ => (ex.instr.imm as u64, true),
    };
    let update = cap.set_bounds(length, exact);
    if !update.exact {
        ex.note_inexact();
    }
    if update.cleared_tag {
        log::debug!(
            "{}: bounds {length:#x} at {:#x} cleared tag (exact={})",
            ex.mnemonic(),
            cap.cursor(),
            update.exact
        );
    }
    ex.write(dest, cap);
    Ok(())
}

/// SCVALUE and SCOFF.
pub(crate) fn set_value(ex: &mut Exec<'_>) -> Step {
    let (dest, mut cap) = (ex.d(), ex.cap(ex.n()));
    let value = ex.x(ex.m());
    let (kind, cursor) = if ex.instr.op == Op::ScOff {
        (Derivation::SetOffset, value.wrapping_add(cap.base()))
    } else {
        (Derivation::SetAddress, value)
    };
    ex.derive_cursor(kind, dest, &mut cap, cursor)?;
    ex.write(dest, cap);
    Ok(())
}

/// RRLEN and RRMASK.
pub(crate) fn representable(ex: &mut Exec<'_>) -> Step {
    let length = ex.x(ex.n());
    let value = if ex.instr.op == Op::Rrlen {
        codec::representable_length(length)
    } else {
        codec::representable_mask(length)
    };
    ex.write_x(ex.d(), value);
    Ok(())
}

/// SCTAG: only system code at EL1 or above may forge tags.
pub(crate) fn set_tag(ex: &mut Exec<'_>) -> Step {
    if ex.config.el == 0 {
        return Err(ex.undefined());
    }
    let cap = ex.cap(ex.n());
    let allowed = !ex.config.tag_setting_disabled && ex.system_context();
    let tag = allowed && ex.x(ex.m()) & 1 == 1;
    ex.write(ex.d(), cap.with_tag(tag));
    Ok(())
}

/// CLRTAG and MOV.
pub(crate) fn copy(ex: &mut Exec<'_>) -> Step {
    let mut cap = ex.cap(ex.n());
    if ex.instr.op == Op::ClrTag {
        cap.clear_tag();
    }
    ex.write(ex.d(), cap);
    Ok(())
}

fn seal_authority_ok(auth: &Capability) -> bool {
    auth.tag()
        && !auth.is_sealed()
        && auth.has_perms(CapPerms::SEAL)
        && auth.in_bounds(auth.address(), 1)
        && auth.cursor() > u64::from(ObjectType::MAX_RESERVED)
        && auth.cursor() <= u64::from(ObjectType::MAX)
}

fn try_seal(cap: &Capability, auth: &Capability) -> Option<Capability> {
    if cap.tag() && !cap.is_sealed() && seal_authority_ok(auth) {
        Some(cap.sealed_as(ObjectType::new(auth.cursor())))
    } else {
        None
    }
}

pub(crate) fn seal(ex: &mut Exec<'_>) -> Step {
    let cap = ex.cap(ex.n());
    let auth = ex.cap(ex.m());
    let result = try_seal(&cap, &auth).unwrap_or_else(|| {
        log::debug!("{}: sealing {} with {} failed", ex.mnemonic(), ex.n(), ex.m());
        cap.untagged()
    });
    ex.write(ex.d(), result);
    Ok(())
}

/// CSEAL: seals when the authority allows it, otherwise passes Cn through. V reports success.
pub(crate) fn conditional_seal(ex: &mut Exec<'_>) -> Step {
    let cap = ex.cap(ex.n());
    let auth = ex.cap(ex.m());
    let sealed = try_seal(&cap, &auth);
    let success = sealed.is_some();
    ex.write(ex.d(), sealed.unwrap_or(cap));
    ex.set_nzcv(Nzcv {
        v: success,
        ..Nzcv::default()
    });
    Ok(())
}

/// SEAL with an immediate reserved type (RB, LPB, LB).
pub(crate) fn seal_immediate(ex: &mut Exec<'_>) -> Step {
    let otype = match ex.instr.imm {
        1 => ObjectType::SENTRY,
        2 => ObjectType::LOAD_PAIR_BRANCH,
        3 => ObjectType::LOAD_BRANCH,
        _ => return Err(ex.undefined()),
    };
    let cap = ex.cap(ex.n());
    let result = if cap.is_sealed() {
        cap.sealed_as(otype).untagged()
    } else {
        cap.sealed_as(otype)
    };
    ex.write(ex.d(), result);
    Ok(())
}

pub(crate) fn unseal(ex: &mut Exec<'_>) -> Step {
    let cap = ex.cap(ex.n());
    let auth = ex.cap(ex.m());
    let authorised = cap.tag()
        && cap.is_sealed()
        && auth.tag()
        && !auth.is_sealed()
        && auth.has_perms(CapPerms::UNSEAL)
        && auth.in_bounds(auth.address(), 1)
        && auth.cursor() == u64::from(cap.otype().value());
    let mut result = cap.unsealed();
    if !auth.has_perms(CapPerms::GLOBAL) {
        let perms = result.perms().difference(CapPerms::GLOBAL);
        result.set_perms_unchecked(perms);
    }
    if !authorised {
        result.clear_tag();
    }
    ex.write(ex.d(), result);
    Ok(())
}

/// BUILD: re-derives an untagged template from an authorising capability.
pub(crate) fn build(ex: &mut Exec<'_>) -> Step {
    let template = ex.cap(ex.n());
    let auth = ex.cap(ex.m());
    let result = template.unsealed();
    let template_ok = !template.tag() || !template.is_sealed();
    let authorised = auth.tag()
        && !auth.is_sealed()
        && result.is_subset_of(&auth)
        && u128::from(result.base()) <= result.top();
    ex.write(ex.d(), result.with_tag(template_ok && authorised));
    Ok(())
}

/// CPYTYPE: cursor becomes Cm's object type, or all ones when Cm is unsealed.
pub(crate) fn copy_type(ex: &mut Exec<'_>) -> Step {
    let (dest, mut cap) = (ex.d(), ex.cap(ex.n()));
    let source = ex.cap(ex.m());
    let value = if source.is_sealed() {
        u64::from(source.otype().value())
    } else {
        u64::MAX
    };
    ex.derive_cursor(Derivation::SetAddress, dest, &mut cap, value)?;
    ex.write(dest, cap);
    Ok(())
}

pub(crate) fn copy_value(ex: &mut Exec<'_>) -> Step {
    let (dest, mut cap) = (ex.d(), ex.cap(ex.n()));
    let value = ex.x(ex.m());
    ex.derive_cursor(Derivation::SetAddress, dest, &mut cap, value)?;
    ex.write(dest, cap);
    Ok(())
}

/// CLRPERM (register mask, or the X/W/R immediate form).
pub(crate) fn clear_perms(ex: &mut Exec<'_>) -> Step {
    let mut cap = ex.cap(ex.n());
    let mask = if ex.instr.op == Op::ClrPermImm {
        let imm = ex.instr.imm;
        let mut mask = CapPerms::empty();
        mask.set(CapPerms::EXECUTE, imm & 1 != 0);
        mask.set(CapPerms::STORE, imm & 2 != 0);
        mask.set(CapPerms::LOAD, imm & 4 != 0);
        mask
    } else {
        CapPerms::from_field(ex.x(ex.m()))
    };
    cap.clear_perms(mask);
    ex.write(ex.d(), cap);
    Ok(())
}

pub(crate) fn select(ex: &mut Exec<'_>) -> Step {
    let take_n = ex.nzcv().condition_holds(ex.instr.cond);
    let cap = if take_n { ex.cap(ex.n()) } else { ex.cap(ex.m()) };
    ex.write(ex.d(), cap);
    Ok(())
}

/// SUBS: compares cursors, or tags when the tags differ.
pub(crate) fn subs(ex: &mut Exec<'_>) -> Step {
    let a = ex.cap(ex.n());
    let b = ex.cap(ex.m());
    let (nzcv, result) = if a.tag() == b.tag() {
        let nzcv = Nzcv::from_sub(a.cursor(), b.cursor());
        (nzcv, a.cursor().wrapping_sub(b.cursor()))
    } else {
        let (ta, tb) = (u64::from(a.tag()) << 62, u64::from(b.tag()) << 62);
        let nzcv = Nzcv::from_sub(ta, tb);
        (nzcv, (ta.wrapping_sub(tb) as i64 >> 62) as u64)
    };
    ex.set_nzcv(nzcv);
    ex.write_x(ex.d(), result);
    Ok(())
}

/// CHKSS, CHKEQ, CHKSLD, CHKTGD.
pub(crate) fn check_flags(ex: &mut Exec<'_>) -> Step {
    let a = ex.cap(ex.n());
    let mut nzcv = Nzcv::default();
    match ex.instr.op {
        Op::ChkSs => nzcv.n = a.is_subset_and_tag_eq(&ex.cap(ex.m())),
        Op::ChkEq => nzcv.z = a.bits_eq(&ex.cap(ex.m())),
        Op::ChkSld => nzcv.v = a.is_sealed(),
        _ => nzcv.c = a.tag(),
    }
    ex.set_nzcv(nzcv);
    Ok(())
}

/// CHKSSU: CHKSS that also unseals Cn when Cm is a valid unsealed superset.
pub(crate) fn check_subset_unseal(ex: &mut Exec<'_>) -> Step {
    let cap = ex.cap(ex.n());
    let auth = ex.cap(ex.m());
    let subset = cap.is_subset_and_tag_eq(&auth);
    ex.set_nzcv(Nzcv {
        n: subset,
        ..Nzcv::default()
    });
    let result = if subset && auth.tag() && !auth.is_sealed() {
        cap.unsealed()
    } else {
        cap
    };
    ex.write(ex.d(), result);
    Ok(())
}

/// GC* field reads, GCLIM, GCFLGS and CFHI.
pub(crate) fn get_field(ex: &mut Exec<'_>) -> Step {
    let cap = ex.cap(ex.n());
    let value = match ex.instr.op {
        Op::GcBase => cap.base(),
        Op::GcLen => cap.length_clamped(),
        Op::GcValue => cap.cursor(),
        Op::GcOff => cap.offset(),
        Op::GcTag => u64::from(cap.tag()),
        Op::GcSeal => u64::from(cap.is_sealed()),
        Op::GcPerm => u64::from(cap.perms().bits()),
        Op::GcType => u64::from(cap.otype().value()),
        Op::GcLim => cap.top_clamped(),
        Op::GcFlgs => cap.cursor() & FLAGS_MASK,
        _ => cap.pesbt(),
    };
    ex.write_x(ex.d(), value);
    Ok(())
}

/// ADR, ADRP (from PCC) and ADRDP (from DDC, or C28 with CCTLR.ADRDPB).
pub(crate) fn address_of(ex: &mut Exec<'_>) -> Step {
    let dest = ex.d();
    if dest == CapReg::Czr {
        return Ok(());
    }
    let (mut cap, cursor) = match ex.instr.op {
        Op::Adr => (ex.pcc(), ex.pc().wrapping_add(ex.instr.imm as u64)),
        Op::Adrp => (ex.pcc(), (ex.pc() & !0xfff).wrapping_add(ex.instr.imm as u64)),
        _ => {
            let source = if ex.config.cctlr.contains(Cctlr::ADRDPB) {
                ex.cap(CapReg::C(28))
            } else {
                ex.ddc()
            };
            let cursor = source.base().wrapping_add(ex.instr.imm as u64);
            (source, cursor)
        }
    };
    ex.derive_cursor(Derivation::Add, dest, &mut cap, cursor)?;
    ex.write(dest, cap);
    Ok(())
}
