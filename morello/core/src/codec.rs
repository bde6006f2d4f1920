//! 128-bit compressed capability format.
//!
//! The metadata half (`pesbt`) packs permissions, object type and a
//! floating-point style bounds field (mantissa width 16, exponent up to 50).
//! Bounds are recovered relative to the cursor, so moving the cursor far
//! enough away from the region makes the capability unrepresentable.

use crate::capability::{bounds_address, CapPerms, Capability, ObjectType};
use serde::{Deserialize, Serialize};

pub const MANTISSA_WIDTH: u32 = 16;
pub const EXPONENT_WIDTH: u32 = 6;
pub const MAX_EXPONENT: u32 = 64 - MANTISSA_WIDTH + 2;

const PERMS_SHIFT: u32 = 46;
const OTYPE_SHIFT: u32 = 31;
const IE_SHIFT: u32 = 30;
const T_SHIFT: u32 = 16;
const T_WIDTH: u32 = MANTISSA_WIDTH - 2;
const B_WIDTH: u32 = MANTISSA_WIDTH;
const IE_FIELD_WIDTH: u32 = MANTISSA_WIDTH - 3;
const BOUNDS_MASK: u64 = (1 << OTYPE_SHIFT) - 1;

/// Raw metadata of the null capability; memory holds `raw ^ NULL_XOR_MASK`.
pub const NULL_XOR_MASK: u64 = Bounds::MAX.0 as u64;

const fn low_mask(bits: u32) -> u128 {
    (1u128 << bits) - 1
}

/// Encoded exponent/bottom/top field (31 bits: IE, T, B).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Bounds(u32);

impl Bounds {
    /// Whole address space: E = 50, B = 0, T = 0x4000.
    pub const MAX: Bounds = Bounds(
        (1 << IE_SHIFT) | (((MAX_EXPONENT >> 3) & 7) << T_SHIFT) | (MAX_EXPONENT & 7),
    );

    pub const fn from_raw(raw: u32) -> Self {
        Bounds(raw & BOUNDS_MASK as u32)
    }

    pub const fn raw(self) -> u32 {
        self.0
    }

    pub const fn internal_exponent(self) -> bool {
        (self.0 >> IE_SHIFT) & 1 == 1
    }

    fn t_field(self) -> u32 {
        (self.0 >> T_SHIFT) & ((1 << T_WIDTH) - 1)
    }

    fn b_field(self) -> u32 {
        self.0 & ((1 << B_WIDTH) - 1)
    }

    pub fn exponent(self) -> u32 {
        if self.internal_exponent() {
            (((self.t_field() & 7) << 3) | (self.b_field() & 7)).min(MAX_EXPONENT)
        } else {
            0
        }
    }

    /// Recovers `(base, top)` for a capability whose bounds address is `addr`.
    pub fn decode(self, addr: u64) -> (u64, u128) {
        let mw = MANTISSA_WIDTH;
        let e = self.exponent();
        let (b, t_low, lmsb) = if self.internal_exponent() {
            (self.b_field() & !7, self.t_field() & !7, 1)
        } else {
            (self.b_field(), self.t_field(), 0)
        };
        let carry = u32::from(t_low < (b & ((1 << T_WIDTH) - 1)));
        let t_top = ((b >> T_WIDTH) + lmsb + carry) & 3;
        let t = (t_top << T_WIDTH) | t_low;

        let r = b.wrapping_sub(1 << (mw - 2)) & 0xFFFF;
        let a = u128::from(addr);
        let a3 = ((a >> (e + mw - 3)) & 7) as u32;
        let r3 = r >> (mw - 3);
        let a_hi = i128::from(a3 < r3);
        let b_hi = i128::from((b >> (mw - 3)) < r3);
        let t_hi = i128::from((t >> (mw - 3)) < r3);
        let a_top = (a >> (e + mw)) as i128;

        let mask66 = low_mask(66);
        let base = ((((a_top + b_hi - a_hi) as u128) << (e + mw)) | (u128::from(b) << e)) & mask66;
        let mut top =
            ((((a_top + t_hi - a_hi) as u128) << (e + mw)) | (u128::from(t) << e)) & mask66;

        let base_hi = ((base >> 63) & 1) as u32;
        let top_hi = ((top >> 63) & 3) as u32;
        if e < MAX_EXPONENT - 1 && (top_hi.wrapping_sub(base_hi) & 3) > 1 {
            top ^= 1 << 64;
        }
        (base as u64, top & low_mask(65))
    }
}

/// Chooses the smallest encoding covering `[base, top)`. Returns the bounds
/// field and whether it decodes to exactly the requested region.
pub fn encode_bounds(base: u64, top: u128) -> (Bounds, bool) {
    let mw = MANTISSA_WIDTH;
    let base128 = u128::from(base);
    let top = top.max(base128);
    let length = top - base128;
    let high = (length >> (mw - 1)) as u64;
    let mut e = 64 - high.leading_zeros();
    let ie = e != 0 || (length >> (mw - 2)) & 1 == 1;

    if !ie {
        let b = (base128 & low_mask(B_WIDTH)) as u32;
        let t = (top & low_mask(T_WIDTH)) as u32;
        return (Bounds((t << T_SHIFT) | b), true);
    }

    let field = |value: u128, e: u32| ((value >> (e + 3)) & low_mask(IE_FIELD_WIDTH)) as u32;
    let lost = |value: u128, e: u32| value & low_mask(e + 3) != 0;

    let mut b_ie = field(base128, e);
    let mut t_ie = field(top, e);
    let mut lost_base = lost(base128, e);
    let mut lost_top = lost(top, e);
    if lost_top {
        t_ie = (t_ie + 1) & low_mask(IE_FIELD_WIDTH) as u32;
    }
    let len_ie = t_ie.wrapping_sub(b_ie) & low_mask(IE_FIELD_WIDTH) as u32;
    if (len_ie >> (mw - 4)) & 1 == 1 {
        lost_base |= b_ie & 1 == 1;
        lost_top |= t_ie & 1 == 1;
        e += 1;
        b_ie = field(base128, e);
        t_ie = field(top, e);
        if lost_top {
            t_ie = (t_ie + 1) & low_mask(IE_FIELD_WIDTH) as u32;
        }
    }
    let e = e.min(MAX_EXPONENT);
    let b_enc = (b_ie << 3) | (e & 7);
    let t_enc = ((t_ie << 3) & ((1 << T_WIDTH) - 1)) | ((e >> 3) & 7);
    let raw = (1 << IE_SHIFT) | (t_enc << T_SHIFT) | b_enc;
    (Bounds(raw), !(lost_base || lost_top))
}

/// True when moving the cursor of `cap` to `cursor` decodes to the same bounds.
pub fn is_representable(cap: &Capability, cursor: u64) -> bool {
    cap.bounds().decode(bounds_address(cursor)) == (cap.base(), cap.top())
}

/// Alignment mask a region of `length` bytes needs to be exactly representable (RRMASK).
pub fn representable_mask(length: u64) -> u64 {
    let (bounds, _) = encode_bounds(0, u128::from(length));
    if bounds.internal_exponent() {
        !((1u64 << (bounds.exponent() + 3)) - 1)
    } else {
        u64::MAX
    }
}

/// Smallest exactly representable length not below `length` (RRLEN).
pub fn representable_length(length: u64) -> u64 {
    let mask = representable_mask(length);
    length.wrapping_add(!mask) & mask
}

/// Wire form of a capability: metadata word, cursor and the out-of-band tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct CompressedCap {
    #[serde(default)]
    pub tag: bool,
    #[serde(default)]
    pub cursor: u64,
    #[serde(default)]
    pub pesbt: u64,
}

impl CompressedCap {
    pub fn new(pesbt: u64, cursor: u64, tag: bool) -> Self {
        CompressedCap { tag, cursor, pesbt }
    }

    pub fn decompress(self) -> Capability {
        decompress(self.pesbt, self.cursor, self.tag)
    }
}

pub fn compress(cap: &Capability) -> CompressedCap {
    let raw = (u64::from(cap.perms().bits()) << PERMS_SHIFT)
        | (u64::from(cap.otype().value()) << OTYPE_SHIFT)
        | u64::from(cap.bounds().raw());
    CompressedCap {
        tag: cap.tag(),
        cursor: cap.cursor(),
        pesbt: raw ^ NULL_XOR_MASK,
    }
}

pub fn decompress(pesbt: u64, cursor: u64, tag: bool) -> Capability {
    let raw = pesbt ^ NULL_XOR_MASK;
    let perms = CapPerms::from_field(raw >> PERMS_SHIFT);
    let otype = ObjectType::new(raw >> OTYPE_SHIFT);
    let bounds = Bounds::from_raw((raw & BOUNDS_MASK) as u32);
    Capability::from_parts(cursor, bounds, perms, otype, tag)
}

impl From<CompressedCap> for Capability {
    fn from(value: CompressedCap) -> Self {
        value.decompress()
    }
}

impl From<Capability> for CompressedCap {
    fn from(value: Capability) -> Self {
        compress(&value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn null_capability_is_all_zero_in_memory() {
        let bits = compress(&Capability::null());
        assert_eq!(bits.pesbt, 0);
        assert_eq!(bits.cursor, 0);
        assert!(!bits.tag);
        assert_eq!(decompress(0, 0, false), Capability::null());
    }

    #[test]
    fn max_bounds_cover_address_space() {
        assert_eq!(Bounds::MAX.exponent(), MAX_EXPONENT);
        assert_eq!(Bounds::MAX.decode(0), (0, 1u128 << 64));
        assert_eq!(Bounds::MAX.decode(u64::MAX), (0, 1u128 << 64));
    }

    #[test]
    fn small_regions_encode_exactly() {
        let (bounds, exact) = encode_bounds(0x1000, 0x1100);
        assert!(exact);
        assert!(!bounds.internal_exponent());
        assert_eq!(bounds.decode(0x1000), (0x1000, 0x1100));
        assert_eq!(bounds.decode(0x10ff), (0x1000, 0x1100));
    }

    #[test]
    fn large_unaligned_regions_round_outward() {
        let (bounds, exact) = encode_bounds(0x1_0001, 0x1_0001 + 0x12_3457);
        assert!(!exact);
        let (base, top) = bounds.decode(0x1_0001);
        assert!(base <= 0x1_0001);
        assert!(top >= 0x1_0001 + 0x12_3457);
    }

    #[test]
    fn rounding_matches_representable_length() {
        let len = 0x12_3457u64;
        let rounded = representable_length(len);
        let mask = representable_mask(len);
        assert!(rounded >= len);
        assert_eq!(rounded & !mask, 0);
        let (_, exact) = encode_bounds(0, u128::from(rounded));
        assert!(exact);
    }

    #[test]
    fn small_lengths_need_no_alignment() {
        assert_eq!(representable_mask(0x100), u64::MAX);
        assert_eq!(representable_length(0x100), 0x100);
    }

    #[test]
    fn perms_and_otype_survive_compression() {
        let cap = Capability::root()
            .with_cursor(0x8000)
            .sealed_as(ObjectType::new(0x1234));
        let back = cap.compress().decompress();
        assert_eq!(back.otype(), ObjectType::new(0x1234));
        assert_eq!(back.perms(), CapPerms::all());
        assert_eq!(back, cap);
    }
}
