//! Capability branches and pointer/capability conversions.

use crate::capability::{CapPerms, Capability, ObjectType, CAP_SIZE};
use crate::morello::eval::Exec;
use crate::morello::fault::Fault;
use crate::morello::loadstore::load_caps_for_branch;
use crate::morello::opcodes::{Mods, Op};
use crate::morello::state::{CapReg, Nzcv, INVOKE_DATA_REG, LINK_REG};
use crate::observer::Derivation;

type Step = Result<(), Fault>;

/// Installs `target` as the next PCC, optionally writing a link capability.
///
/// Sentries are unsealed on the way in, any other sealed target arrives
/// untagged. Bit 0 of the target address selects C64 and is cleared.
fn jump_and_link(ex: &mut Exec<'_>, mut target: Capability, link: bool) -> Step {
    let sealed_form = ex.instr.has(Mods::SEALED) || ex.instr.has(Mods::RESTRICTED);
    let restricted = ex.instr.has(Mods::RESTRICTED);
    let was_sentry = target.is_sentry();

    if was_sentry {
        target = target.unsealed();
    } else if target.is_sealed() {
        target.clear_tag();
    }
    if sealed_form && ex.config.sentry_links() && !was_sentry {
        target.clear_tag();
    }
    if ex.pcc().has_perms(CapPerms::EXECUTIVE)
        && !target.has_perms(CapPerms::EXECUTIVE)
        && !restricted
    {
        target.clear_tag();
    }

    let cursor = target.cursor();
    ex.set_c64(cursor & 1 == 1);
    if cursor & 1 == 1 {
        target.set_cursor(cursor & !1);
    }

    if link {
        let mut link_cap = ex.pcc();
        let next = ex.pc().wrapping_add(4) | u64::from(ex.c64());
        link_cap.set_cursor(next);
        if ex.config.sentry_links() {
            link_cap = link_cap.sealed_as(ObjectType::SENTRY);
        }
        ex.write(CapReg::C(LINK_REG), link_cap);
    }
    log::trace!("{}: branch to {:#x}", ex.mnemonic(), target.cursor());
    ex.jump(target);
    Ok(())
}

fn links(ex: &Exec<'_>) -> bool {
    ex.instr.op == Op::Blr || ex.instr.has(Mods::LINK)
}

/// BR/BLR/RET and their sealed (BRS-style single register) and restricted forms.
pub(crate) fn branch(ex: &mut Exec<'_>) -> Step {
    if ex.instr.has(Mods::RESTRICTED) && !ex.pcc().has_perms(CapPerms::EXECUTIVE) {
        return Err(ex.undefined());
    }
    let target = ex.cap(ex.n());
    let link = links(ex);
    jump_and_link(ex, target, link)
}

/// BX #4: flips between A64 and C64 without leaving the instruction stream.
pub(crate) fn exchange(ex: &mut Exec<'_>) -> Step {
    let c64 = ex.c64();
    ex.set_c64(!c64);
    Ok(())
}

/// BR/BLR [Cn, #imm]: load the target capability through Cn and branch.
pub(crate) fn load_and_branch(ex: &mut Exec<'_>) -> Step {
    let n = ex.n();
    let mut base = ex.cap(n);
    if base.tag()
        && ex.instr.rn == INVOKE_DATA_REG
        && base.otype() == ObjectType::LOAD_BRANCH
    {
        base = base.unsealed();
    }
    if !(ex.config.keep_branch_and_link_bug && ex.instr.rn & 31 == 31) {
        ex.write(n, base);
    }
    let addr = base.cursor().wrapping_add(ex.instr.imm as u64);
    let target = load_caps_for_branch(ex, &base, n, addr, 1)?;
    let link = links(ex);
    jump_and_link(ex, target[0], link)
}

/// BRS/BLRS Cn, Cm: unseal a matching code/data pair and branch, data to C29.
pub(crate) fn branch_sealed_pair(ex: &mut Exec<'_>) -> Step {
    let mut target = ex.cap(ex.n());
    let mut data = ex.cap(ex.m());
    let pair = CapPerms::BRANCH_SEALED_PAIR;

    let matched = target.tag()
        && data.tag()
        && target.is_sealed_with_type()
        && data.is_sealed_with_type()
        && target.otype() == data.otype()
        && target.has_perms(pair)
        && data.has_perms(pair)
        && target.has_perms(CapPerms::EXECUTE)
        && !data.has_perms(CapPerms::EXECUTE);
    if matched {
        target = target.unsealed();
        data = data.unsealed();
    } else {
        log::debug!("{}: pair does not match, target untagged", ex.mnemonic());
        target.clear_tag();
    }

    ex.write(CapReg::C(INVOKE_DATA_REG), data);
    let link = links(ex);
    jump_and_link(ex, target, link)
}

/// LDPBR/LDPBLR Ct, [Cn]: data from `[Cn]` into Ct, branch to `[Cn + 16]`.
pub(crate) fn load_pair_and_branch(ex: &mut Exec<'_>) -> Step {
    let n = ex.n();
    let mut base = ex.cap(n);
    if base.tag()
        && ex.instr.rd == INVOKE_DATA_REG
        && base.otype() == ObjectType::LOAD_PAIR_BRANCH
    {
        base = base.unsealed();
    }
    let loaded = load_caps_for_branch(ex, &base, n, base.cursor(), 2)?;
    ex.write(ex.d(), loaded[0]);
    let link = links(ex);
    jump_and_link(ex, loaded[1], link)
}

/// Capability to pointer: the cursor, less the base of the authority when
/// base offsetting is enabled. Untagged sources convert to zero.
pub(crate) fn to_pointer(ex: &mut Exec<'_>) -> Step {
    let source = ex.cap(ex.n());
    let (authority, base_off) = match ex.instr.op {
        Op::CvtPccToPtr => (ex.pcc(), ex.config.pcc_base_offset()),
        Op::CvtDdcToPtr => (ex.ddc(), ex.config.ddc_base_offset()),
        _ => (ex.cap(ex.m()), ex.config.ddc_base_offset()),
    };
    let offset = if base_off { authority.base() } else { 0 };
    let result = if source.tag() {
        source.cursor().wrapping_sub(offset)
    } else {
        0
    };
    ex.set_nzcv(Nzcv {
        z: result == 0 && source.tag(),
        c: source.tag(),
        ..Nzcv::default()
    });
    ex.write_x(ex.d(), result);
    Ok(())
}

/// Pointer to capability: derive from Cn, DDC or PCC with the integer as
/// address (or offset when base offsetting is enabled).
pub(crate) fn from_pointer(ex: &mut Exec<'_>) -> Step {
    let d = ex.d();
    if d == CapReg::Czr {
        return Ok(());
    }
    let (mut cap, value, base_off) = match ex.instr.op {
        Op::CvtPccToCap => (ex.pcc(), ex.x(ex.n()), ex.config.pcc_base_offset()),
        Op::CvtDdcToCap => (ex.ddc(), ex.x(ex.n()), ex.config.ddc_base_offset()),
        _ => (ex.cap(ex.n()), ex.x(ex.m()), ex.config.ddc_base_offset()),
    };
    if ex.instr.has(Mods::ZERO_IS_NULL) && value == 0 {
        ex.write(d, Capability::null());
        return Ok(());
    }
    let cursor = if base_off {
        value.wrapping_add(cap.base())
    } else {
        value
    };
    ex.derive_cursor(Derivation::FromPointer, d, &mut cap, cursor)?;
    ex.write(d, cap);
    Ok(())
}
