//! Decoded capability values.
//!
//! A [`Capability`] is the single source of truth for a register or memory
//! granule. Bounds are only ever produced by the codec, which keeps the
//! encoded bounds field and the decoded `base`/`top` in lock step; the
//! compressed form is recomputed by [`Capability::compress`] when needed.

use crate::codec::{self, Bounds, CompressedCap};
use bitflags::bitflags;
use serde::{Deserialize, Serialize};
use std::fmt;

pub const CAP_SIZE: u64 = 16;
pub const CAP_SIZE_LOG2: u32 = 4;
pub const PERMS_WIDTH: u32 = 18;
pub const OTYPE_WIDTH: u32 = 15;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
    pub struct CapPerms: u32 {
        const GLOBAL = 1 << 0;
        const EXECUTIVE = 1 << 1;
        const USER0 = 1 << 2;
        const USER1 = 1 << 3;
        const USER2 = 1 << 4;
        const USER3 = 1 << 5;
        const MUTABLE_LOAD = 1 << 6;
        const COMPARTMENT_ID = 1 << 7;
        const BRANCH_SEALED_PAIR = 1 << 8;
        const SYSTEM = 1 << 9;
        const UNSEAL = 1 << 10;
        const SEAL = 1 << 11;
        const STORE_LOCAL_CAP = 1 << 12;
        const STORE_CAP = 1 << 13;
        const LOAD_CAP = 1 << 14;
        const EXECUTE = 1 << 15;
        const STORE = 1 << 16;
        const LOAD = 1 << 17;
    }
}

impl CapPerms {
    /// Permissions stripped from capabilities loaded without MUTABLE_LOAD.
    pub const MUTATING: CapPerms = CapPerms::STORE
        .union(CapPerms::STORE_CAP)
        .union(CapPerms::STORE_LOCAL_CAP)
        .union(CapPerms::MUTABLE_LOAD);

    pub fn from_field(bits: u64) -> Self {
        CapPerms::from_bits_truncate((bits & ((1 << PERMS_WIDTH) - 1)) as u32)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct ObjectType(u32);

impl ObjectType {
    pub const UNSEALED: ObjectType = ObjectType(0);
    pub const SENTRY: ObjectType = ObjectType(1);
    pub const LOAD_PAIR_BRANCH: ObjectType = ObjectType(2);
    pub const LOAD_BRANCH: ObjectType = ObjectType(3);
    pub const MAX_RESERVED: u32 = 3;
    pub const MAX: u32 = (1 << OTYPE_WIDTH) - 1;

    /// Builds an object type from a field or register value, keeping the low 15 bits.
    pub const fn new(value: u64) -> Self {
        ObjectType((value & Self::MAX as u64) as u32)
    }

    pub const fn value(self) -> u32 {
        self.0
    }

    pub const fn is_unsealed(self) -> bool {
        self.0 == 0
    }

    pub const fn is_reserved(self) -> bool {
        self.0 != 0 && self.0 <= Self::MAX_RESERVED
    }
}

impl fmt::Display for ObjectType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            ObjectType::UNSEALED => write!(f, "unsealed"),
            ObjectType::SENTRY => write!(f, "sentry"),
            ObjectType::LOAD_PAIR_BRANCH => write!(f, "lpb"),
            ObjectType::LOAD_BRANCH => write!(f, "lb"),
            ObjectType(other) => write!(f, "{other:#x}"),
        }
    }
}

/// Address used for bounds and representability: the flag byte is ignored
/// and bit 55 is sign-extended over it.
pub const fn bounds_address(cursor: u64) -> u64 {
    (((cursor << 8) as i64) >> 8) as u64
}

pub const FLAGS_SHIFT: u32 = 56;
pub const FLAGS_MASK: u64 = 0xFF << FLAGS_SHIFT;

/// How a cursor update affected the tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CursorUpdate {
    Kept,
    WasUntagged,
    ClearedSealed,
    ClearedUnrepresentable,
}

impl CursorUpdate {
    pub fn cleared_tag(self) -> bool {
        matches!(
            self,
            CursorUpdate::ClearedSealed | CursorUpdate::ClearedUnrepresentable
        )
    }
}

/// Result of a bounds-setting derivation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BoundsUpdate {
    pub exact: bool,
    pub cleared_tag: bool,
}

#[derive(Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "CompressedCap", into = "CompressedCap")]
pub struct Capability {
    cursor: u64,
    base: u64,
    top: u128,
    bounds: Bounds,
    perms: CapPerms,
    otype: ObjectType,
    tag: bool,
}

impl Default for Capability {
    fn default() -> Self {
        Self::null()
    }
}

impl fmt::Debug for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Cap{{v:{} cursor:{:#x} base:{:#x} top:{:#x} perms:{:#x} otype:{}}}",
            self.tag as u8,
            self.cursor,
            self.base,
            self.top,
            self.perms.bits(),
            self.otype
        )
    }
}

impl Capability {
    /// The all-zero granule: untagged, no permissions, full address space.
    pub const fn null() -> Self {
        Capability {
            cursor: 0,
            base: 0,
            top: 1 << 64,
            bounds: Bounds::MAX,
            perms: CapPerms::empty(),
            otype: ObjectType::UNSEALED,
            tag: false,
        }
    }

    /// Reset-time root capability with every permission over the full space.
    pub const fn root() -> Self {
        Capability {
            cursor: 0,
            base: 0,
            top: 1 << 64,
            bounds: Bounds::MAX,
            perms: CapPerms::all(),
            otype: ObjectType::UNSEALED,
            tag: true,
        }
    }

    /// Integer value held in a capability register.
    pub const fn from_int(value: u64) -> Self {
        let mut cap = Self::null();
        cap.cursor = value;
        cap
    }

    pub(crate) fn from_parts(
        cursor: u64,
        bounds: Bounds,
        perms: CapPerms,
        otype: ObjectType,
        tag: bool,
    ) -> Self {
        let (base, top) = bounds.decode(bounds_address(cursor));
        Capability {
            cursor,
            base,
            top,
            bounds,
            perms,
            otype,
            tag: tag && u128::from(base) <= top,
        }
    }

    pub fn cursor(&self) -> u64 {
        self.cursor
    }

    /// Cursor with the flag byte ignored.
    pub fn address(&self) -> u64 {
        bounds_address(self.cursor)
    }

    pub fn base(&self) -> u64 {
        self.base
    }

    pub fn top(&self) -> u128 {
        self.top
    }

    pub fn length(&self) -> u128 {
        self.top.saturating_sub(u128::from(self.base))
    }

    /// Length saturated to 64 bits (GCLEN).
    pub fn length_clamped(&self) -> u64 {
        u64::try_from(self.length()).unwrap_or(u64::MAX)
    }

    /// Top saturated to 64 bits (GCLIM).
    pub fn top_clamped(&self) -> u64 {
        u64::try_from(self.top).unwrap_or(u64::MAX)
    }

    pub fn offset(&self) -> u64 {
        self.cursor.wrapping_sub(self.base)
    }

    pub fn flags(&self) -> u8 {
        (self.cursor >> FLAGS_SHIFT) as u8
    }

    pub fn perms(&self) -> CapPerms {
        self.perms
    }

    pub fn has_perms(&self, perms: CapPerms) -> bool {
        self.perms.contains(perms)
    }

    pub fn otype(&self) -> ObjectType {
        self.otype
    }

    pub fn tag(&self) -> bool {
        self.tag
    }

    pub fn bounds(&self) -> Bounds {
        self.bounds
    }

    pub fn is_sealed(&self) -> bool {
        !self.otype.is_unsealed()
    }

    /// Sealed with a non-reserved object type.
    pub fn is_sealed_with_type(&self) -> bool {
        self.otype.value() > ObjectType::MAX_RESERVED
    }

    pub fn is_sentry(&self) -> bool {
        self.otype == ObjectType::SENTRY
    }

    pub fn is_exact(&self) -> bool {
        !self.bounds.internal_exponent()
    }

    pub fn in_bounds(&self, addr: u64, size: u64) -> bool {
        addr >= self.base && u128::from(addr) + u128::from(size) <= self.top
    }

    pub fn compress(&self) -> CompressedCap {
        codec::compress(self)
    }

    /// Metadata word as stored in memory (CFHI).
    pub fn pesbt(&self) -> u64 {
        self.compress().pesbt
    }

    pub fn clear_tag(&mut self) {
        self.tag = false;
    }

    pub fn with_tag(mut self, tag: bool) -> Self {
        self.tag = tag && u128::from(self.base) <= self.top;
        self
    }

    pub fn untagged(mut self) -> Self {
        self.tag = false;
        self
    }

    /// Sets the cursor, clearing the tag for sealed sources or when the new
    /// address is outside the representable region.
    pub fn set_cursor(&mut self, cursor: u64) -> CursorUpdate {
        let was_tagged = self.tag;
        let sealed = self.is_sealed();
        let representable = codec::is_representable(self, cursor);
        self.cursor = cursor;
        if !representable {
            let (base, top) = self.bounds.decode(bounds_address(cursor));
            self.base = base;
            self.top = top;
        }
        if !was_tagged {
            return CursorUpdate::WasUntagged;
        }
        if sealed {
            self.tag = false;
            CursorUpdate::ClearedSealed
        } else if !representable {
            self.tag = false;
            CursorUpdate::ClearedUnrepresentable
        } else {
            CursorUpdate::Kept
        }
    }

    pub fn with_cursor(mut self, cursor: u64) -> Self {
        self.set_cursor(cursor);
        self
    }

    /// Replaces the flag byte; the bounds address is unaffected.
    pub fn set_flags(&mut self, flags: u8) -> CursorUpdate {
        let cursor = (self.cursor & !FLAGS_MASK) | (u64::from(flags) << FLAGS_SHIFT);
        self.set_cursor(cursor)
    }

    /// Narrows bounds to `[cursor, cursor + length)`, rounding outward when the
    /// request is not exactly representable. The tag is dropped for sealed
    /// sources, when the rounded region escapes the current bounds, or when
    /// `exact` is requested and rounding was needed.
    pub fn set_bounds(&mut self, length: u64, exact: bool) -> BoundsUpdate {
        let req_base = self.address();
        let req_top = u128::from(req_base) + u128::from(length);
        let (bounds, is_exact) = codec::encode_bounds(req_base, req_top);
        let (new_base, new_top) = bounds.decode(req_base);
        let escapes = req_base < self.base || req_top > self.top;
        let was_tagged = self.tag;
        let sealed = self.is_sealed();
        self.bounds = bounds;
        self.base = new_base;
        self.top = new_top;
        if escapes || sealed || (exact && !is_exact) {
            self.tag = false;
        }
        BoundsUpdate {
            exact: is_exact,
            cleared_tag: was_tagged && !self.tag,
        }
    }

    /// Removes `mask` from the permission set; sealed capabilities lose their tag.
    pub fn clear_perms(&mut self, mask: CapPerms) {
        self.perms.remove(mask);
        if self.is_sealed() {
            self.tag = false;
        }
    }

    pub(crate) fn set_perms_unchecked(&mut self, perms: CapPerms) {
        self.perms = perms;
    }

    pub fn sealed_as(mut self, otype: ObjectType) -> Self {
        self.otype = otype;
        self
    }

    pub fn unsealed(mut self) -> Self {
        self.otype = ObjectType::UNSEALED;
        self
    }

    /// Template bounds, perms and otype are taken from `self`; cursor from `cursor`.
    pub fn rebased(&self, cursor: u64) -> Self {
        Capability::from_parts(cursor, self.bounds, self.perms, self.otype, self.tag)
    }

    /// Non-strict subset: bounds inside `other` and no extra permissions.
    pub fn is_subset_of(&self, other: &Capability) -> bool {
        self.base >= other.base && self.top <= other.top && other.perms.contains(self.perms)
    }

    /// Subset test that also requires matching tags (CHKSS).
    pub fn is_subset_and_tag_eq(&self, other: &Capability) -> bool {
        self.tag == other.tag && self.is_subset_of(other)
    }

    /// Bitwise equality of tag, cursor and metadata (CHKEQ, CAS).
    pub fn bits_eq(&self, other: &Capability) -> bool {
        self.tag == other.tag && self.cursor == other.cursor && self.pesbt() == other.pesbt()
    }
}
