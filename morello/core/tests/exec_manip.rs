use morello_core::{
    CapFault, CapPerms, CapReg, CapState, Capability, CoreConfig, Fault, FaultKind, Instr,
    MemoryImage, MorelloExecutor, ObjectType, Op, StepOutcome,
};

fn bounded(base: u64, len: u64) -> Capability {
    let mut cap = Capability::root().with_cursor(base);
    assert!(cap.set_bounds(len, true).exact);
    cap
}

fn exec(state: &mut CapState, instr: Instr) -> Result<StepOutcome, Fault> {
    let mut mem = MemoryImage::new();
    MorelloExecutor::default().execute(&instr, state, &mut mem)
}

fn c(n: u8) -> CapReg {
    CapReg::C(n)
}

#[test]
fn build_rederives_template_within_authority() {
    let mut state = CapState::new();
    state.set(c(1), bounded(0x1100, 0x100).untagged());
    state.set(c(2), bounded(0x1000, 0x1000));

    exec(&mut state, Instr::new(Op::Build).rd(0).rn(1).rm(2)).unwrap();
    let built = state.get(c(0));
    assert!(built.tag());
    assert_eq!(built.base(), 0x1100);
    assert_eq!(built.length(), 0x100);

    state.set(c(2), bounded(0x1000, 0x100));
    exec(&mut state, Instr::new(Op::Build).rd(0).rn(1).rm(2)).unwrap();
    assert!(!state.get(c(0)).tag());
}

#[test]
fn build_refuses_extra_permissions_and_sealed_authority() {
    let mut state = CapState::new();
    state.set(c(1), bounded(0x1100, 0x100).untagged());
    let mut auth = bounded(0x1000, 0x1000);
    auth.clear_perms(CapPerms::STORE);
    state.set(c(2), auth);
    exec(&mut state, Instr::new(Op::Build).rd(0).rn(1).rm(2)).unwrap();
    assert!(!state.get(c(0)).tag());

    state.set(c(2), bounded(0x1000, 0x1000).sealed_as(ObjectType::new(0x40)));
    exec(&mut state, Instr::new(Op::Build).rd(0).rn(1).rm(2)).unwrap();
    assert!(!state.get(c(0)).tag());
}

#[test]
fn exact_bounds_fail_where_rounding_succeeds() {
    let request = 0x10_0001;
    let mut state = CapState::new();
    state.set(c(1), Capability::root().with_cursor(0x2001));
    state.set_x(c(2), request);

    let outcome = exec(&mut state, Instr::new(Op::ScBndsE).rd(3).rn(1).rm(2)).unwrap();
    assert!(outcome.bounds_inexact);
    assert!(!state.get(c(3)).tag());

    let outcome = exec(&mut state, Instr::new(Op::ScBnds).rd(3).rn(1).rm(2)).unwrap();
    assert!(outcome.bounds_inexact);
    let rounded = state.get(c(3));
    assert!(rounded.tag());
    assert!(rounded.base() <= 0x2001);
    assert!(rounded.top() >= 0x2001 + u128::from(request));
    assert_eq!(rounded.cursor(), 0x2001);
}

#[test]
fn bounds_cannot_grow() {
    let mut state = CapState::new();
    state.set(c(1), bounded(0x1000, 0x100));
    exec(&mut state, Instr::new(Op::ScBndsImm).rd(1).rn(1).imm(0x200)).unwrap();
    assert!(!state.get(c(1)).tag());
}

#[test]
fn seal_then_unseal_with_matching_authority() {
    let mut state = CapState::new();
    state.set(c(0), bounded(0x1000, 0x100));
    state.set(c(3), Capability::root().with_cursor(0x42));

    exec(&mut state, Instr::new(Op::Seal).rd(1).rn(0).rm(3)).unwrap();
    let sealed = state.get(c(1));
    assert!(sealed.tag());
    assert_eq!(sealed.otype(), ObjectType::new(0x42));

    exec(&mut state, Instr::new(Op::Unseal).rd(2).rn(1).rm(3)).unwrap();
    let unsealed = state.get(c(2));
    assert!(unsealed.tag());
    assert!(!unsealed.is_sealed());
    assert_eq!(unsealed.base(), 0x1000);

    state.set(c(4), Capability::root().with_cursor(0x43));
    exec(&mut state, Instr::new(Op::Unseal).rd(2).rn(1).rm(4)).unwrap();
    assert!(!state.get(c(2)).tag());
}

#[test]
fn sealing_needs_seal_permission() {
    let mut state = CapState::new();
    state.set(c(0), bounded(0x1000, 0x100));
    let mut auth = Capability::root().with_cursor(0x42);
    auth.clear_perms(CapPerms::SEAL);
    state.set(c(3), auth);

    exec(&mut state, Instr::new(Op::Seal).rd(1).rn(0).rm(3)).unwrap();
    assert!(!state.get(c(1)).tag());

    exec(&mut state, Instr::new(Op::Cseal).rd(1).rn(0).rm(3)).unwrap();
    let passed = state.get(c(1));
    assert!(passed.tag());
    assert!(!passed.is_sealed());
    assert!(!state.nzcv.v);

    state.set(c(3), Capability::root().with_cursor(0x42));
    exec(&mut state, Instr::new(Op::Cseal).rd(1).rn(0).rm(3)).unwrap();
    assert!(state.get(c(1)).is_sealed());
    assert!(state.nzcv.v);
}

#[test]
fn immediate_seal_makes_sentries() {
    let mut state = CapState::new();
    state.set(c(0), Capability::root().with_cursor(0x4000));
    exec(&mut state, Instr::new(Op::SealImm).rd(1).rn(0).imm(1)).unwrap();
    assert!(state.get(c(1)).is_sentry());
    assert!(state.get(c(1)).tag());

    let err = exec(&mut state, Instr::new(Op::SealImm).rd(1).rn(0).imm(4)).unwrap_err();
    assert_eq!(err.kind, FaultKind::Undefined);
}

#[test]
fn clearing_permissions_of_sealed_capability_clears_tag() {
    let mut state = CapState::new();
    state.set(c(0), Capability::root().sealed_as(ObjectType::new(0x50)));
    exec(&mut state, Instr::new(Op::ClrPermImm).rd(1).rn(0).imm(0b010)).unwrap();
    let cleared = state.get(c(1));
    assert!(!cleared.tag());
    assert!(!cleared.has_perms(CapPerms::STORE));

    state.set(c(0), Capability::root());
    exec(&mut state, Instr::new(Op::ClrPermImm).rd(1).rn(0).imm(0b101)).unwrap();
    let cleared = state.get(c(1));
    assert!(cleared.tag());
    assert!(!cleared.has_perms(CapPerms::EXECUTE));
    assert!(!cleared.has_perms(CapPerms::LOAD));
    assert!(cleared.has_perms(CapPerms::STORE));
}

#[test]
fn subs_orders_by_tag_before_value() {
    let mut state = CapState::new();
    state.set(c(1), Capability::root().with_cursor(5));
    state.set_x(c(2), 100);
    exec(&mut state, Instr::new(Op::Subs).rd(3).rn(1).rm(2)).unwrap();
    // Tagged compares greater than untagged regardless of cursor.
    assert!(state.nzcv.c);
    assert!(!state.nzcv.z);

    state.set(c(2), Capability::root().with_cursor(5));
    exec(&mut state, Instr::new(Op::Subs).rd(3).rn(1).rm(2)).unwrap();
    assert!(state.nzcv.z);
    assert_eq!(state.x(c(3)), 0);
}

#[test]
fn check_instructions_set_single_flags() {
    let mut state = CapState::new();
    let outer = bounded(0x1000, 0x1000);
    let inner = bounded(0x1100, 0x100);
    state.set(c(1), inner);
    state.set(c(2), outer);

    exec(&mut state, Instr::new(Op::ChkSs).rn(1).rm(2)).unwrap();
    assert!(state.nzcv.n);
    exec(&mut state, Instr::new(Op::ChkSs).rn(2).rm(1)).unwrap();
    assert!(!state.nzcv.n);

    exec(&mut state, Instr::new(Op::ChkTgd).rn(1)).unwrap();
    assert!(state.nzcv.c);
    exec(&mut state, Instr::new(Op::ChkSld).rn(1)).unwrap();
    assert!(!state.nzcv.v);

    state.set(c(3), inner);
    exec(&mut state, Instr::new(Op::ChkEq).rn(1).rm(3)).unwrap();
    assert!(state.nzcv.z);
    state.set(c(3), inner.untagged());
    exec(&mut state, Instr::new(Op::ChkEq).rn(1).rm(3)).unwrap();
    assert!(!state.nzcv.z);
}

#[test]
fn subset_check_can_unseal() {
    let mut state = CapState::new();
    state.set(c(1), bounded(0x1100, 0x100).sealed_as(ObjectType::new(0x60)));
    state.set(c(2), bounded(0x1000, 0x1000));
    exec(&mut state, Instr::new(Op::ChkSsu).rd(3).rn(1).rm(2)).unwrap();
    assert!(state.nzcv.n);
    assert!(!state.get(c(3)).is_sealed());
    assert!(state.get(c(3)).tag());
}

#[test]
fn far_cursor_moves_become_unrepresentable() {
    let mut state = CapState::new();
    state.set(c(1), bounded(0x1000, 0x10));
    state.set_x(c(2), 0x1_0000_0000);
    exec(&mut state, Instr::new(Op::ScValue).rd(3).rn(1).rm(2)).unwrap();
    assert!(!state.get(c(3)).tag());
    assert_eq!(state.x(c(3)), 0x1_0000_0000);

    let config = CoreConfig {
        fault_on_unrepresentable: true,
        ..CoreConfig::default()
    };
    let before = state.clone();
    let mut mem = MemoryImage::new();
    let err = MorelloExecutor::new(config)
        .execute(&Instr::new(Op::ScValue).rd(3).rn(1).rm(2), &mut state, &mut mem)
        .unwrap_err();
    assert_eq!(err.capability(), Some(CapFault::Unrepresentable));
    assert_eq!(state, before);
}

#[test]
fn field_reads() {
    let mut state = CapState::new();
    let cap = bounded(0x1000, 0x300).with_cursor(0x1010);
    state.set(c(1), cap);
    exec(&mut state, Instr::new(Op::GcBase).rd(2).rn(1)).unwrap();
    assert_eq!(state.x(c(2)), 0x1000);
    exec(&mut state, Instr::new(Op::GcLen).rd(2).rn(1)).unwrap();
    assert_eq!(state.x(c(2)), 0x300);
    exec(&mut state, Instr::new(Op::GcOff).rd(2).rn(1)).unwrap();
    assert_eq!(state.x(c(2)), 0x10);
    exec(&mut state, Instr::new(Op::GcLim).rd(2).rn(1)).unwrap();
    assert_eq!(state.x(c(2)), 0x1300);
    exec(&mut state, Instr::new(Op::GcTag).rd(2).rn(1)).unwrap();
    assert_eq!(state.x(c(2)), 1);
    exec(&mut state, Instr::new(Op::GcType).rd(2).rn(1)).unwrap();
    assert_eq!(state.x(c(2)), 0);

    // GCLEN of the root saturates.
    state.set(c(1), Capability::root());
    exec(&mut state, Instr::new(Op::GcLen).rd(2).rn(1)).unwrap();
    assert_eq!(state.x(c(2)), u64::MAX);
}

#[test]
fn metadata_round_trips_through_cfhi_and_cthi() {
    let mut state = CapState::new();
    let cap = bounded(0x1000, 0x300);
    state.set(c(1), cap);
    exec(&mut state, Instr::new(Op::Cfhi).rd(2).rn(1)).unwrap();
    exec(&mut state, Instr::new(Op::Cthi).rd(3).rn(1).rm(2)).unwrap();
    let copy = state.get(c(3));
    assert!(!copy.tag());
    assert_eq!(copy.base(), 0x1000);
    assert_eq!(copy.perms(), cap.perms());
}

#[test]
fn register_31_is_csp_for_add() {
    let mut state = CapState::new();
    state.csp = bounded(0x8000, 0x1000).with_cursor(0x9000);
    exec(&mut state, Instr::new(Op::AddImm).rd(31).rn(31).imm(-0x40)).unwrap();
    assert_eq!(state.csp.cursor(), 0x8fc0);
    assert!(state.csp.tag());
}

#[test]
fn tag_forging_is_privileged() {
    let mut state = CapState::new();
    state.set(c(1), bounded(0x1000, 0x100).untagged());
    state.set_x(c(2), 1);
    let err = exec(&mut state, Instr::new(Op::ScTag).rd(3).rn(1).rm(2)).unwrap_err();
    assert_eq!(err.kind, FaultKind::Undefined);

    let config = CoreConfig {
        el: 1,
        ..CoreConfig::default()
    };
    let mut mem = MemoryImage::new();
    MorelloExecutor::new(config)
        .execute(&Instr::new(Op::ScTag).rd(3).rn(1).rm(2), &mut state, &mut mem)
        .unwrap();
    assert!(state.get(c(3)).tag());
}

#[test]
fn disabled_capabilities_fault_everything() {
    let mut state = CapState::new();
    let config = CoreConfig {
        capabilities_enabled: false,
        ..CoreConfig::default()
    };
    let mut mem = MemoryImage::new();
    let err = MorelloExecutor::new(config)
        .execute(&Instr::new(Op::Mov).rd(1).rn(2), &mut state, &mut mem)
        .unwrap_err();
    assert_eq!(err.kind, FaultKind::CapabilitiesDisabled);
}

#[test]
fn build_accepts_tagged_unsealed_template() {
    let mut state = CapState::new();
    state.set(c(1), bounded(0x1100, 0x100));
    state.set(c(2), bounded(0x1000, 0x1000));
    exec(&mut state, Instr::new(Op::Build).rd(0).rn(1).rm(2)).unwrap();
    assert!(state.get(c(0)).tag());
    assert_eq!(state.get(c(0)).base(), 0x1100);

    state.set(c(2), bounded(0x1000, 0x80));
    exec(&mut state, Instr::new(Op::Build).rd(0).rn(1).rm(2)).unwrap();
    assert!(!state.get(c(0)).tag());
}

#[test]
fn reserved_object_types_cannot_be_sealed_with() {
    for otype in 0..=3u64 {
        let mut state = CapState::new();
        state.set(c(0), bounded(0x1000, 0x100));
        state.set(c(3), Capability::root().with_cursor(otype));

        exec(&mut state, Instr::new(Op::Seal).rd(1).rn(0).rm(3)).unwrap();
        assert!(!state.get(c(1)).tag());

        exec(&mut state, Instr::new(Op::Cseal).rd(1).rn(0).rm(3)).unwrap();
        assert!(!state.get(c(1)).is_sealed());
        assert!(state.get(c(1)).tag());
        assert!(!state.nzcv.v);
    }
}
