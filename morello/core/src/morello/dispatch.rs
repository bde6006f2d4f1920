//! Static opcode table: mnemonic, register-31 convention per operand slot and
//! handler for every supported operation.

use crate::morello::control;
use crate::morello::eval::Exec;
use crate::morello::fault::Fault;
use crate::morello::loadstore;
use crate::morello::manip;
use crate::morello::opcodes::Op;
use crate::morello::state::Slot::{self, Sp as S, Zero as Z};
use once_cell::sync::Lazy;
use std::collections::HashMap;

pub type Handler = fn(&mut Exec<'_>) -> Result<(), Fault>;

/// How index 31 resolves in each register field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Slots {
    pub d: Slot,
    pub n: Slot,
    pub m: Slot,
    pub t2: Slot,
}

const fn slots(d: Slot, n: Slot, m: Slot) -> Slots {
    Slots { d, n, m, t2: Slot::Zero }
}

const DN: Slots = slots(S, S, Z);
const ZERO: Slots = slots(Z, Z, Z);
const ALL_SP: Slots = slots(S, S, S);
const FIELD: Slots = slots(Z, S, Z);
const MEMORY: Slots = slots(Z, S, Z);
const BRANCH: Slots = slots(Z, Z, Z);

#[derive(Clone, Copy)]
pub struct OpcodeEntry {
    pub op: Op,
    pub mnemonic: &'static str,
    pub slots: Slots,
    pub handler: Handler,
}

const fn entry(op: Op, mnemonic: &'static str, slots: Slots, handler: Handler) -> OpcodeEntry {
    OpcodeEntry {
        op,
        mnemonic,
        slots,
        handler,
    }
}

pub static OPCODES: &[OpcodeEntry] = &[
    entry(Op::AddImm, "ADD", DN, manip::add_imm),
    entry(Op::AddExt, "ADD", DN, manip::add_ext),
    entry(Op::AlignDown, "ALIGND", DN, manip::align),
    entry(Op::AlignUp, "ALIGNU", DN, manip::align),
    entry(Op::BicFlgsImm, "BICFLGS", DN, manip::flags),
    entry(Op::OrrFlgsImm, "ORRFLGS", DN, manip::flags),
    entry(Op::EorFlgsImm, "EORFLGS", DN, manip::flags),
    entry(Op::BicFlgs, "BICFLGS", DN, manip::flags),
    entry(Op::OrrFlgs, "ORRFLGS", DN, manip::flags),
    entry(Op::EorFlgs, "EORFLGS", DN, manip::flags),
    entry(Op::ScFlgs, "SCFLGS", DN, manip::flags),
    entry(Op::Cthi, "CTHI", slots(S, Z, Z), manip::copy_to_high),
    entry(Op::ScBnds, "SCBNDS", DN, manip::set_bounds),
    entry(Op::ScBndsE, "SCBNDSE", DN, manip::set_bounds),
    entry(Op::ScBndsImm, "SCBNDS", DN, manip::set_bounds),
    entry(Op::ScValue, "SCVALUE", DN, manip::set_value),
    entry(Op::ScOff, "SCOFF", DN, manip::set_value),
    entry(Op::Rrlen, "RRLEN", ZERO, manip::representable),
    entry(Op::Rrmask, "RRMASK", ZERO, manip::representable),
    entry(Op::ScTag, "SCTAG", DN, manip::set_tag),
    entry(Op::ClrTag, "CLRTAG", DN, manip::copy),
    entry(Op::Mov, "MOV", DN, manip::copy),
    entry(Op::Seal, "SEAL", ZERO, manip::seal),
    entry(Op::SealImm, "SEAL", DN, manip::seal_immediate),
    entry(Op::Cseal, "CSEAL", ALL_SP, manip::conditional_seal),
    entry(Op::Unseal, "UNSEAL", ZERO, manip::unseal),
    entry(Op::Build, "BUILD", ALL_SP, manip::build),
    entry(Op::CpyType, "CPYTYPE", ZERO, manip::copy_type),
    entry(Op::CpyValue, "CPYVALUE", ZERO, manip::copy_value),
    entry(Op::ClrPerm, "CLRPERM", DN, manip::clear_perms),
    entry(Op::ClrPermImm, "CLRPERM", DN, manip::clear_perms),
    entry(Op::Csel, "CSEL", ZERO, manip::select),
    entry(Op::Subs, "SUBS", ZERO, manip::subs),
    entry(Op::ChkSs, "CHKSS", slots(Z, S, S), manip::check_flags),
    entry(Op::ChkSsu, "CHKSSU", slots(Z, S, S), manip::check_subset_unseal),
    entry(Op::ChkEq, "CHKEQ", FIELD, manip::check_flags),
    entry(Op::ChkSld, "CHKSLD", FIELD, manip::check_flags),
    entry(Op::ChkTgd, "CHKTGD", FIELD, manip::check_flags),
    entry(Op::GcBase, "GCBASE", FIELD, manip::get_field),
    entry(Op::GcLen, "GCLEN", FIELD, manip::get_field),
    entry(Op::GcValue, "GCVALUE", FIELD, manip::get_field),
    entry(Op::GcOff, "GCOFF", FIELD, manip::get_field),
    entry(Op::GcTag, "GCTAG", FIELD, manip::get_field),
    entry(Op::GcSeal, "GCSEAL", FIELD, manip::get_field),
    entry(Op::GcPerm, "GCPERM", FIELD, manip::get_field),
    entry(Op::GcType, "GCTYPE", FIELD, manip::get_field),
    entry(Op::GcLim, "GCLIM", FIELD, manip::get_field),
    entry(Op::GcFlgs, "GCFLGS", FIELD, manip::get_field),
    entry(Op::Cfhi, "CFHI", FIELD, manip::get_field),
    entry(Op::Adr, "ADR", ZERO, manip::address_of),
    entry(Op::Adrp, "ADRP", ZERO, manip::address_of),
    entry(Op::Adrdp, "ADRDP", ZERO, manip::address_of),
    entry(Op::CvtToPtr, "CVT", FIELD, control::to_pointer),
    entry(Op::CvtDdcToPtr, "CVTD", FIELD, control::to_pointer),
    entry(Op::CvtPccToPtr, "CVTP", FIELD, control::to_pointer),
    entry(Op::CvtToCap, "CVT", FIELD, control::from_pointer),
    entry(Op::CvtDdcToCap, "CVTD", ZERO, control::from_pointer),
    entry(Op::CvtPccToCap, "CVTP", ZERO, control::from_pointer),
    entry(Op::LdrCap, "LDR", MEMORY, loadstore::ldr_str_cap),
    entry(Op::StrCap, "STR", MEMORY, loadstore::ldr_str_cap),
    entry(Op::LdrCapLiteral, "LDR", MEMORY, loadstore::ldr_literal),
    entry(Op::LdpCap, "LDP", MEMORY, loadstore::ldp_stp_cap),
    entry(Op::StpCap, "STP", MEMORY, loadstore::ldp_stp_cap),
    entry(Op::LdxrCap, "LDXR", MEMORY, loadstore::exclusive_cap),
    entry(Op::StxrCap, "STXR", MEMORY, loadstore::exclusive_cap),
    entry(Op::LdarCap, "LDAR", MEMORY, loadstore::ordered_cap),
    entry(Op::StlrCap, "STLR", MEMORY, loadstore::ordered_cap),
    entry(Op::LdaprCap, "LDAPR", MEMORY, loadstore::ordered_cap),
    entry(Op::CasCap, "CAS", MEMORY, loadstore::atomic_cap),
    entry(Op::SwpCap, "SWP", MEMORY, loadstore::atomic_cap),
    entry(Op::AldrCap, "LDR", MEMORY, loadstore::alternate_cap),
    entry(Op::AstrCap, "STR", MEMORY, loadstore::alternate_cap),
    entry(Op::Aldr, "LDR", MEMORY, loadstore::alternate_int),
    entry(Op::Astr, "STR", MEMORY, loadstore::alternate_int),
    entry(Op::LdarInt, "LDAR", MEMORY, loadstore::ordered_int),
    entry(Op::StlrInt, "STLR", MEMORY, loadstore::ordered_int),
    entry(Op::Ldct, "LDCT", MEMORY, loadstore::load_tags),
    entry(Op::Stct, "STCT", MEMORY, loadstore::store_tags),
    entry(Op::Br, "BR", BRANCH, control::branch),
    entry(Op::Blr, "BLR", BRANCH, control::branch),
    entry(Op::Ret, "RET", BRANCH, control::branch),
    entry(Op::Bx, "BX", BRANCH, control::exchange),
    entry(Op::BrLoad, "BR", slots(Z, S, Z), control::load_and_branch),
    entry(Op::Brs, "BRS", BRANCH, control::branch_sealed_pair),
    entry(Op::Ldpbr, "LDPBR", MEMORY, control::load_pair_and_branch),
];

static DISPATCH: Lazy<HashMap<Op, &'static OpcodeEntry>> = Lazy::new(|| {
    let mut map = HashMap::with_capacity(OPCODES.len());
    for entry in OPCODES {
        map.insert(entry.op, entry);
    }
    map
});

pub fn lookup(op: Op) -> Option<&'static OpcodeEntry> {
    DISPATCH.get(&op).copied()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::morello::state::CapReg;

    #[test]
    fn every_entry_is_reachable_and_unique() {
        assert_eq!(DISPATCH.len(), OPCODES.len());
        for entry in OPCODES {
            assert_eq!(lookup(entry.op).map(|e| e.op), Some(entry.op));
        }
    }

    #[test]
    fn register_31_follows_slot_conventions() {
        let build = lookup(Op::Build).unwrap();
        assert_eq!(build.slots.m.resolve(31), CapReg::Csp);
        let seal = lookup(Op::Seal).unwrap();
        assert_eq!(seal.slots.n.resolve(31), CapReg::Czr);
        let ldr = lookup(Op::LdrCap).unwrap();
        assert_eq!(ldr.slots.n.resolve(31), CapReg::Csp);
        assert_eq!(ldr.slots.d.resolve(31), CapReg::Czr);
    }
}
