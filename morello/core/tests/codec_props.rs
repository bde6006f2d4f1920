use morello_core::codec::{representable_length, representable_mask};
use morello_core::{bounds_address, Capability, CompressedCap};
use proptest::prelude::*;

const ADDR_LIMIT: u64 = 1 << 48;
const LEN_LIMIT: u64 = 1 << 40;

proptest! {
    #[test]
    fn set_bounds_covers_the_request(base in 0..ADDR_LIMIT, len in 0..LEN_LIMIT) {
        let mut cap = Capability::root().with_cursor(base);
        let update = cap.set_bounds(len, false);
        prop_assert!(cap.tag());
        prop_assert!(cap.base() <= base);
        prop_assert!(cap.top() >= u128::from(base) + u128::from(len));
        prop_assert_eq!(cap.cursor(), base);
        if update.exact {
            prop_assert_eq!(cap.base(), base);
            prop_assert_eq!(cap.length(), u128::from(len));
        }
    }

    #[test]
    fn small_lengths_are_always_exact(base in 0..ADDR_LIMIT, len in 0u64..0x4000) {
        let mut cap = Capability::root().with_cursor(base);
        let update = cap.set_bounds(len, true);
        prop_assert!(update.exact);
        prop_assert!(cap.tag());
        prop_assert_eq!(cap.base(), base);
        prop_assert_eq!(cap.length(), u128::from(len));
    }

    #[test]
    fn rounded_requests_are_exact(base in 0..ADDR_LIMIT, len in 0..LEN_LIMIT) {
        let mask = representable_mask(len);
        let rounded = representable_length(len);
        prop_assert!(rounded >= len);
        prop_assert_eq!(rounded & !mask, 0);

        let mut cap = Capability::root().with_cursor(base & mask);
        prop_assert!(cap.set_bounds(rounded, true).exact);
        prop_assert!(cap.tag());
    }

    #[test]
    fn cursors_inside_bounds_stay_tagged(
        base in 0..ADDR_LIMIT,
        len in 1..LEN_LIMIT,
        pick in any::<u64>(),
    ) {
        let mut cap = Capability::root().with_cursor(base);
        cap.set_bounds(len, false);
        let span = u64::try_from(cap.length()).unwrap_or(u64::MAX);
        let cursor = cap.base() + pick % span;
        let moved = cap.with_cursor(cursor);
        prop_assert!(moved.tag());
        prop_assert_eq!(moved.base(), cap.base());
        prop_assert_eq!(moved.top(), cap.top());
    }

    #[test]
    fn compressed_form_reproduces_derived_capabilities(
        base in 0..ADDR_LIMIT,
        len in 0..LEN_LIMIT,
        perms in any::<u32>(),
    ) {
        let mut cap = Capability::root().with_cursor(base);
        cap.set_bounds(len, false);
        cap.clear_perms(morello_core::CapPerms::from_bits_truncate(perms));
        let wire = cap.compress();
        prop_assert_eq!(wire.decompress(), cap);
        prop_assert_eq!(CompressedCap::new(wire.pesbt, wire.cursor, false).decompress(), cap.untagged());
    }
}

fn full_range_request() -> impl Strategy<Value = (u64, u64)> {
    (any::<u64>(), any::<u64>()).prop_map(|(raw, pick)| {
        let base = bounds_address(raw);
        let room = (1u128 << 64) - u128::from(base);
        (base, (u128::from(pick) % room) as u64)
    })
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(2048))]

    #[test]
    fn whole_address_space_requests_are_covered((base, len) in full_range_request()) {
        let mut cap = Capability::root().with_cursor(base);
        let update = cap.set_bounds(len, false);
        prop_assert!(cap.tag());
        prop_assert!(cap.base() <= base);
        prop_assert!(cap.top() >= u128::from(base) + u128::from(len));
        if update.exact {
            prop_assert_eq!(cap.length(), u128::from(len));
        }
        prop_assert_eq!(cap.compress().decompress(), cap);
    }
}

#[test]
fn null_compresses_to_zero_words() {
    assert_eq!(Capability::null().compress(), CompressedCap::default());
    assert_eq!(CompressedCap::default().decompress(), Capability::null());
}
