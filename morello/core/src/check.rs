//! Capability access validation.
//!
//! Every memory access and instruction fetch goes through [`check_access`]
//! before any architectural state changes. Rules are evaluated in a fixed
//! order and the first failure wins.

use crate::capability::{CapPerms, Capability};
use serde::Serialize;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum BoundsDirection {
    Before,
    After,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CapFault {
    #[error("capability tag is clear")]
    Untagged,
    #[error("capability is sealed")]
    Sealed,
    #[error("capability lacks permissions {missing:?}")]
    PermissionDenied {
        #[serde(serialize_with = "perms_bits")]
        missing: CapPerms,
    },
    #[error("access {distance:#x} bytes {direction:?} capability bounds")]
    OutOfBounds {
        direction: BoundsDirection,
        distance: u128,
    },
    #[error("address {addr:#x} is not {align}-byte aligned")]
    Unaligned { addr: u64, align: u64 },
    #[error("capability cursor is not representable")]
    Unrepresentable,
    #[error("object type mismatch")]
    TypeMismatch,
}

fn perms_bits<S: serde::Serializer>(perms: &CapPerms, ser: S) -> Result<S::Ok, S::Error> {
    ser.serialize_u32(perms.bits())
}

/// One requested access: permissions, byte range and required alignment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AccessRequest {
    pub perms: CapPerms,
    pub addr: u64,
    pub size: u64,
    pub align: u64,
}

impl AccessRequest {
    pub fn new(perms: CapPerms, addr: u64, size: u64) -> Self {
        AccessRequest {
            perms,
            addr,
            size,
            align: 1,
        }
    }

    pub fn aligned(mut self, align: u64) -> Self {
        self.align = align.max(1);
        self
    }
}

pub fn check_access(cap: &Capability, req: &AccessRequest) -> Result<(), CapFault> {
    if !cap.tag() {
        return Err(CapFault::Untagged);
    }
    if cap.is_sealed() {
        return Err(CapFault::Sealed);
    }
    let missing = req.perms.difference(cap.perms());
    if !missing.is_empty() {
        return Err(CapFault::PermissionDenied { missing });
    }
    check_bounds(cap, req.addr, req.size)?;
    if req.align > 1 && req.addr & (req.align - 1) != 0 {
        return Err(CapFault::Unaligned {
            addr: req.addr,
            align: req.align,
        });
    }
    Ok(())
}

fn check_bounds(cap: &Capability, addr: u64, size: u64) -> Result<(), CapFault> {
    if addr < cap.base() {
        return Err(CapFault::OutOfBounds {
            direction: BoundsDirection::Before,
            distance: u128::from(cap.base() - addr),
        });
    }
    let end = u128::from(addr) + u128::from(size);
    if end > cap.top() {
        return Err(CapFault::OutOfBounds {
            direction: BoundsDirection::After,
            distance: end - cap.top(),
        });
    }
    Ok(())
}

/// Permissions needed to store `value` through some capability.
pub fn perms_for_store(value: &Capability) -> CapPerms {
    let mut perms = CapPerms::STORE;
    if value.tag() {
        perms |= CapPerms::STORE_CAP;
        if !value.has_perms(CapPerms::GLOBAL) {
            perms |= CapPerms::STORE_LOCAL_CAP;
        }
    }
    perms
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capability::ObjectType;

    fn data_cap(base: u64, len: u64) -> Capability {
        let mut cap = Capability::root().with_cursor(base);
        cap.set_bounds(len, true);
        cap
    }

    #[test]
    fn rule_order_reports_tag_before_seal() {
        let cap = data_cap(0x100, 0x10)
            .sealed_as(ObjectType::SENTRY)
            .untagged();
        let req = AccessRequest::new(CapPerms::LOAD, 0x100, 8);
        assert_eq!(check_access(&cap, &req), Err(CapFault::Untagged));
    }

    #[test]
    fn sealed_capability_authorises_nothing() {
        let cap = data_cap(0x100, 0x10).sealed_as(ObjectType::new(9));
        let req = AccessRequest::new(CapPerms::empty(), 0x100, 1);
        assert_eq!(check_access(&cap, &req), Err(CapFault::Sealed));
    }

    #[test]
    fn missing_permission_bits_are_reported() {
        let mut cap = data_cap(0x100, 0x10);
        cap.clear_perms(CapPerms::STORE | CapPerms::STORE_CAP);
        let req = AccessRequest::new(CapPerms::STORE | CapPerms::LOAD, 0x100, 8);
        assert_eq!(
            check_access(&cap, &req),
            Err(CapFault::PermissionDenied {
                missing: CapPerms::STORE
            })
        );
    }

    #[test]
    fn bounds_edges() {
        let cap = data_cap(0x1000, 0x40);
        let at = |addr: u64| check_access(&cap, &AccessRequest::new(CapPerms::LOAD, addr, 1));
        assert_eq!(
            at(0xfff),
            Err(CapFault::OutOfBounds {
                direction: BoundsDirection::Before,
                distance: 1
            })
        );
        assert_eq!(at(0x1000), Ok(()));
        assert_eq!(at(0x103f), Ok(()));
        assert_eq!(
            at(0x1040),
            Err(CapFault::OutOfBounds {
                direction: BoundsDirection::After,
                distance: 1
            })
        );
    }

    #[test]
    fn in_bounds_but_misaligned() {
        let cap = data_cap(0x1000, 0x40);
        let req = AccessRequest::new(CapPerms::LOAD, 0x1008, 16).aligned(16);
        assert_eq!(
            check_access(&cap, &req),
            Err(CapFault::Unaligned {
                addr: 0x1008,
                align: 16
            })
        );
    }

    #[test]
    fn storing_local_capabilities_needs_store_local() {
        let mut local = Capability::root();
        local.clear_perms(CapPerms::GLOBAL);
        assert!(perms_for_store(&local).contains(CapPerms::STORE_LOCAL_CAP));
        assert_eq!(perms_for_store(&Capability::null()), CapPerms::STORE);
    }
}
