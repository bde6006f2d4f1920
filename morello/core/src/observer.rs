//! Instrumentation hooks.
//!
//! The executor reports validation outcomes and cursor derivations through
//! [`CapObserver`]; nothing on the execution path depends on what an
//! observer does with them.

use crate::capability::Capability;
use crate::check::CapFault;
use crate::morello::state::CapReg;
use std::collections::BTreeMap;
use std::fmt::Write as _;

/// Cursor-moving derivations tracked for out-of-bounds statistics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Derivation {
    Add,
    SetOffset,
    SetAddress,
    FromPointer,
    Writeback,
}

impl Derivation {
    pub fn name(self) -> &'static str {
        match self {
            Derivation::Add => "add",
            Derivation::SetOffset => "scoff",
            Derivation::SetAddress => "scvalue",
            Derivation::FromPointer => "cvt",
            Derivation::Writeback => "writeback",
        }
    }
}

pub trait CapObserver {
    /// Outcome of one access validation.
    fn on_check(&mut self, _mnemonic: &'static str, _result: Result<(), CapFault>) {}
    /// A derivation produced `cap` (tag as computed before any clearing).
    fn on_derive(&mut self, _kind: Derivation, _cap: &Capability) {}
    /// The derivation written to `reg` left the representable region.
    fn on_unrepresentable(&mut self, _kind: Derivation, _reg: CapReg, _cap: &Capability) {}
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NullObserver;

impl CapObserver for NullObserver {}

/// Forwards failed checks and tag-clearing derivations to the `log` facade.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogObserver;

impl CapObserver for LogObserver {
    fn on_check(&mut self, mnemonic: &'static str, result: Result<(), CapFault>) {
        if let Err(fault) = result {
            log::debug!("{mnemonic}: check failed: {fault}");
        }
    }

    fn on_unrepresentable(&mut self, kind: Derivation, reg: CapReg, cap: &Capability) {
        log::debug!(
            "BOUNDS: unrepresentable capability created using {} in {reg}: {cap:?}",
            kind.name()
        );
    }
}

const BUCKETS: [(u64, &str); 13] = [
    (1, "1"),
    (2, "2"),
    (4, "4"),
    (8, "8"),
    (16, "16"),
    (32, "32"),
    (64, "64"),
    (256, "256"),
    (1024, "1K"),
    (4096, "4K"),
    (64 * 1024, "64K"),
    (1024 * 1024, "1M"),
    (64 * 1024 * 1024, "64M"),
];

fn bucket_index(howmuch: u128) -> usize {
    BUCKETS
        .iter()
        .position(|&(limit, _)| howmuch <= u128::from(limit))
        .unwrap_or(BUCKETS.len())
}

/// Signed distance of the cursor outside the bounds; one past the end counts as 1.
fn howmuch_out_of_bounds(cap: &Capability) -> i128 {
    if !cap.tag() {
        return 0;
    }
    let addr = u128::from(cap.address());
    let base = u128::from(cap.base());
    if addr == cap.top() {
        1
    } else if addr < base {
        -((base - addr) as i128)
    } else if addr > cap.top() {
        (addr - cap.top() + 1) as i128
    } else {
        0
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OobStats {
    pub uses: u64,
    pub unrepresentable: u64,
    pub after_bounds: [u64; BUCKETS.len() + 1],
    pub before_bounds: [u64; BUCKETS.len() + 1],
}

impl OobStats {
    fn record(&mut self, cap: &Capability) {
        let howmuch = howmuch_out_of_bounds(cap);
        if howmuch > 0 {
            self.after_bounds[bucket_index(howmuch.unsigned_abs())] += 1;
        } else if howmuch < 0 {
            self.before_bounds[bucket_index(howmuch.unsigned_abs())] += 1;
        }
    }
}

/// Out-of-bounds histogram per derivation kind, plus check failure counts.
#[derive(Debug, Clone, Default)]
pub struct BoundsStats {
    pub per_kind: BTreeMap<Derivation, OobStats>,
    pub checks: u64,
    pub check_failures: u64,
}

impl BoundsStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, kind: Derivation) -> Option<&OobStats> {
        self.per_kind.get(&kind)
    }

    pub fn report(&self) -> String {
        let mut out = String::new();
        for (kind, info) in &self.per_kind {
            let _ = writeln!(out, "Number of {}s: {}", kind.name(), info.uses);
            let _ = writeln!(out, "  One past the end: {}", info.after_bounds[0]);
            for (i, (_, name)) in BUCKETS.iter().enumerate().skip(1) {
                let _ = writeln!(out, "  Out of bounds by up to {name}: {}", info.after_bounds[i]);
            }
            let _ = writeln!(
                out,
                "  Out of bounds by over 64M: {}",
                info.after_bounds[BUCKETS.len()]
            );
            for (i, (_, name)) in BUCKETS.iter().enumerate() {
                let _ = writeln!(out, "  Before bounds by up to -{name}: {}", info.before_bounds[i]);
            }
            let _ = writeln!(
                out,
                "  Before bounds by over -64M: {}",
                info.before_bounds[BUCKETS.len()]
            );
            let _ = writeln!(out, "  Became unrepresentable: {}", info.unrepresentable);
        }
        let _ = writeln!(out, "Checks: {} ({} failed)", self.checks, self.check_failures);
        out
    }
}

impl CapObserver for BoundsStats {
    fn on_check(&mut self, _mnemonic: &'static str, result: Result<(), CapFault>) {
        self.checks += 1;
        if result.is_err() {
            self.check_failures += 1;
        }
    }

    fn on_derive(&mut self, kind: Derivation, cap: &Capability) {
        let info = self.per_kind.entry(kind).or_default();
        info.uses += 1;
        info.record(cap);
    }

    fn on_unrepresentable(&mut self, kind: Derivation, _reg: CapReg, _cap: &Capability) {
        self.per_kind.entry(kind).or_default().unrepresentable += 1;
    }
}
