use crate::capability::CAP_SIZE;
use crate::codec::CompressedCap;
use serde::Serialize;
use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};
use thiserror::Error;

pub const PAGE_SIZE: u64 = 0x1000;
/// Granules covered by one LDCT/STCT access.
pub const TAG_GROUP: usize = 4;

pub type CoreId = usize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BusError {
    #[error("write to read-only memory at {addr:#x}")]
    ReadOnly { addr: u64 },
    #[error("unprivileged access to privileged memory at {addr:#x}")]
    Privileged { addr: u64 },
    #[error("unsupported access size {size}")]
    BadSize { size: usize },
}

/// Privilege the access is performed with (LDTR/STTR use `Unprivileged`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Access {
    #[default]
    Normal,
    Unprivileged,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Barrier {
    Acquire,
    Release,
    Full,
}

/// Byte memory plus the parallel tag channel, as seen by one core.
///
/// All addresses reaching the bus have already been validated against a
/// capability. Values are little-endian.
pub trait CapBus {
    fn read(&mut self, addr: u64, size: usize, access: Access) -> Result<u64, BusError>;
    fn write(&mut self, addr: u64, size: usize, value: u64, access: Access)
        -> Result<(), BusError>;
    fn read_cap(&mut self, addr: u64, access: Access) -> Result<CompressedCap, BusError>;
    fn write_cap(&mut self, addr: u64, cap: CompressedCap, access: Access)
        -> Result<(), BusError>;
    /// Tag bits of `count` consecutive granules starting at `addr`, bit 0 first.
    fn get_tags(&mut self, addr: u64, count: usize) -> Result<u8, BusError>;
    fn set_tags(&mut self, addr: u64, count: usize, tags: u8) -> Result<(), BusError>;

    /// Establishes an exclusive reservation over `[addr, addr + len)`.
    fn reserve(&mut self, addr: u64, len: u64);
    /// Consumes the reservation; true if it still covered `[addr, addr + len)`.
    fn take_reservation(&mut self, addr: u64, len: u64) -> bool;

    /// Fails without side effects if a write of `len` bytes would fault.
    fn probe_write(&mut self, _addr: u64, _len: u64, _access: Access) -> Result<(), BusError> {
        Ok(())
    }

    fn barrier(&mut self, _kind: Barrier) {}

    fn swap(&mut self, addr: u64, size: usize, value: u64) -> Result<u64, BusError> {
        let old = self.read(addr, size, Access::Normal)?;
        self.write(addr, size, value, Access::Normal)?;
        Ok(old)
    }

    fn compare_swap(
        &mut self,
        addr: u64,
        size: usize,
        expected: u64,
        value: u64,
    ) -> Result<u64, BusError> {
        let old = self.read(addr, size, Access::Normal)?;
        if old == expected {
            self.write(addr, size, value, Access::Normal)?;
        }
        Ok(old)
    }

    fn swap_cap(&mut self, addr: u64, value: CompressedCap) -> Result<CompressedCap, BusError> {
        let old = self.read_cap(addr, Access::Normal)?;
        self.write_cap(addr, value, Access::Normal)?;
        Ok(old)
    }

    fn compare_swap_cap(
        &mut self,
        addr: u64,
        expected: CompressedCap,
        value: CompressedCap,
    ) -> Result<CompressedCap, BusError> {
        let old = self.read_cap(addr, Access::Normal)?;
        if old == expected {
            self.write_cap(addr, value, Access::Normal)?;
        }
        Ok(old)
    }
}

fn granule(addr: u64) -> u64 {
    addr / CAP_SIZE
}

fn overlaps(a: (u64, u64), b: (u64, u64)) -> bool {
    a.0 < b.0.saturating_add(b.1) && b.0 < a.0.saturating_add(a.1)
}

/// Sparse byte memory with one tag bit per 16-byte granule.
#[derive(Clone, Default)]
pub struct MemoryImage {
    pages: HashMap<u64, Box<[u8]>>,
    tags: BTreeSet<u64>,
    readonly_ranges: Vec<(u64, u64)>,
    privileged_ranges: Vec<(u64, u64)>,
    reservations: HashMap<CoreId, (u64, u64)>,
}

impl MemoryImage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_readonly_ranges(&mut self, ranges: Vec<(u64, u64)>) {
        self.readonly_ranges = ranges;
    }

    pub fn set_privileged_ranges(&mut self, ranges: Vec<(u64, u64)>) {
        self.privileged_ranges = ranges;
    }

    pub fn readonly_ranges(&self) -> &[(u64, u64)] {
        &self.readonly_ranges
    }

    pub fn privileged_ranges(&self) -> &[(u64, u64)] {
        &self.privileged_ranges
    }

    fn in_ranges(ranges: &[(u64, u64)], addr: u64, len: u64) -> bool {
        ranges
            .iter()
            .any(|&(start, end)| overlaps((addr, len), (start, end.saturating_sub(start))))
    }

    fn check_read(&self, addr: u64, len: u64, access: Access) -> Result<(), BusError> {
        if access == Access::Unprivileged && Self::in_ranges(&self.privileged_ranges, addr, len) {
            return Err(BusError::Privileged { addr });
        }
        Ok(())
    }

    fn check_write(&self, addr: u64, len: u64, access: Access) -> Result<(), BusError> {
        self.check_read(addr, len, access)?;
        if Self::in_ranges(&self.readonly_ranges, addr, len) {
            return Err(BusError::ReadOnly { addr });
        }
        Ok(())
    }

    pub fn read_byte(&self, addr: u64) -> u8 {
        self.pages
            .get(&(addr / PAGE_SIZE))
            .map(|page| page[(addr % PAGE_SIZE) as usize])
            .unwrap_or(0)
    }

    fn poke(&mut self, addr: u64, value: u8) {
        let page = self
            .pages
            .entry(addr / PAGE_SIZE)
            .or_insert_with(|| vec![0u8; PAGE_SIZE as usize].into_boxed_slice());
        page[(addr % PAGE_SIZE) as usize] = value;
    }

    /// Raw byte write that clears the tags of the granules it touches.
    pub fn write_bytes(&mut self, addr: u64, bytes: &[u8]) {
        for (i, byte) in bytes.iter().enumerate() {
            self.poke(addr.wrapping_add(i as u64), *byte);
        }
        self.clear_tags_for(addr, bytes.len() as u64);
        self.invalidate_reservations(addr, bytes.len() as u64);
    }

    pub fn read_bytes(&self, addr: u64, len: usize) -> Vec<u8> {
        (0..len as u64)
            .map(|i| self.read_byte(addr.wrapping_add(i)))
            .collect()
    }

    fn read_le(&self, addr: u64, size: usize) -> u64 {
        (0..size).fold(0u64, |acc, i| {
            acc | (u64::from(self.read_byte(addr.wrapping_add(i as u64))) << (8 * i))
        })
    }

    fn write_le(&mut self, addr: u64, size: usize, value: u64) {
        for i in 0..size {
            self.poke(addr.wrapping_add(i as u64), (value >> (8 * i)) as u8);
        }
    }

    fn clear_tags_for(&mut self, addr: u64, len: u64) {
        if len == 0 {
            return;
        }
        let first = granule(addr);
        let last = granule(addr.saturating_add(len - 1));
        let doomed: Vec<u64> = self.tags.range(first..=last).copied().collect();
        for g in doomed {
            self.tags.remove(&g);
        }
    }

    pub fn tag_at(&self, addr: u64) -> bool {
        self.tags.contains(&granule(addr))
    }

    /// Stores a capability granule, tag included (test and loader helper).
    pub fn store_cap(&mut self, addr: u64, cap: CompressedCap) {
        let addr = addr & !(CAP_SIZE - 1);
        self.write_le(addr, 8, cap.cursor);
        self.write_le(addr + 8, 8, cap.pesbt);
        if cap.tag {
            self.tags.insert(granule(addr));
        } else {
            self.tags.remove(&granule(addr));
        }
        self.invalidate_reservations(addr, CAP_SIZE);
    }

    pub fn load_cap(&self, addr: u64) -> CompressedCap {
        let addr = addr & !(CAP_SIZE - 1);
        CompressedCap {
            tag: self.tag_at(addr),
            cursor: self.read_le(addr, 8),
            pesbt: self.read_le(addr + 8, 8),
        }
    }

    pub fn dump_tags(&self) -> Vec<u64> {
        self.tags.iter().map(|g| g * CAP_SIZE).collect()
    }

    /// Sets the tags of the granules at `addrs` without touching data.
    pub fn restore_tags(&mut self, addrs: impl IntoIterator<Item = u64>) {
        self.tags.extend(addrs.into_iter().map(granule));
    }

    /// Non-zero pages as `(address, bytes)`, in address order.
    pub fn segments(&self) -> Vec<(u64, Vec<u8>)> {
        let mut pages: Vec<_> = self
            .pages
            .iter()
            .filter(|(_, page)| page.iter().any(|b| *b != 0))
            .map(|(index, page)| (index * PAGE_SIZE, page.to_vec()))
            .collect();
        pages.sort_by_key(|(addr, _)| *addr);
        pages
    }

    pub fn reserve_for(&mut self, core: CoreId, addr: u64, len: u64) {
        self.reservations.insert(core, (addr, len));
    }

    pub fn take_reservation_for(&mut self, core: CoreId, addr: u64, len: u64) -> bool {
        match self.reservations.remove(&core) {
            Some((start, rlen)) => {
                start <= addr && addr.saturating_add(len) <= start.saturating_add(rlen)
            }
            None => false,
        }
    }

    fn invalidate_reservations(&mut self, addr: u64, len: u64) {
        self.reservations
            .retain(|_, range| !overlaps(*range, (addr, len)));
    }

    fn bus_read(&mut self, addr: u64, size: usize, access: Access) -> Result<u64, BusError> {
        if !matches!(size, 1 | 2 | 4 | 8) {
            return Err(BusError::BadSize { size });
        }
        self.check_read(addr, size as u64, access)?;
        Ok(self.read_le(addr, size))
    }

    fn bus_write(
        &mut self,
        addr: u64,
        size: usize,
        value: u64,
        access: Access,
    ) -> Result<(), BusError> {
        if !matches!(size, 1 | 2 | 4 | 8) {
            return Err(BusError::BadSize { size });
        }
        self.check_write(addr, size as u64, access)?;
        self.write_le(addr, size, value);
        self.clear_tags_for(addr, size as u64);
        self.invalidate_reservations(addr, size as u64);
        Ok(())
    }

    fn bus_read_cap(&mut self, addr: u64, access: Access) -> Result<CompressedCap, BusError> {
        self.check_read(addr, CAP_SIZE, access)?;
        Ok(self.load_cap(addr))
    }

    fn bus_write_cap(
        &mut self,
        addr: u64,
        cap: CompressedCap,
        access: Access,
    ) -> Result<(), BusError> {
        self.check_write(addr, CAP_SIZE, access)?;
        self.store_cap(addr, cap);
        Ok(())
    }

    fn bus_get_tags(&self, addr: u64, count: usize) -> u8 {
        (0..count.min(8)).fold(0u8, |acc, i| {
            let g_addr = addr.wrapping_add(i as u64 * CAP_SIZE);
            acc | (u8::from(self.tag_at(g_addr)) << i)
        })
    }

    fn bus_set_tags(&mut self, addr: u64, count: usize, tags: u8) {
        for i in 0..count.min(8) {
            let g = granule(addr.wrapping_add(i as u64 * CAP_SIZE));
            if tags >> i & 1 == 1 {
                self.tags.insert(g);
            } else {
                self.tags.remove(&g);
            }
        }
        self.invalidate_reservations(addr, count as u64 * CAP_SIZE);
    }
}

impl CapBus for MemoryImage {
    fn read(&mut self, addr: u64, size: usize, access: Access) -> Result<u64, BusError> {
        self.bus_read(addr, size, access)
    }

    fn write(
        &mut self,
        addr: u64,
        size: usize,
        value: u64,
        access: Access,
    ) -> Result<(), BusError> {
        self.bus_write(addr, size, value, access)
    }

    fn read_cap(&mut self, addr: u64, access: Access) -> Result<CompressedCap, BusError> {
        self.bus_read_cap(addr, access)
    }

    fn write_cap(
        &mut self,
        addr: u64,
        cap: CompressedCap,
        access: Access,
    ) -> Result<(), BusError> {
        self.bus_write_cap(addr, cap, access)
    }

    fn get_tags(&mut self, addr: u64, count: usize) -> Result<u8, BusError> {
        Ok(self.bus_get_tags(addr, count))
    }

    fn set_tags(&mut self, addr: u64, count: usize, tags: u8) -> Result<(), BusError> {
        self.bus_set_tags(addr, count, tags);
        Ok(())
    }

    fn reserve(&mut self, addr: u64, len: u64) {
        self.reserve_for(0, addr, len);
    }

    fn take_reservation(&mut self, addr: u64, len: u64) -> bool {
        self.take_reservation_for(0, addr, len)
    }

    fn probe_write(&mut self, addr: u64, len: u64, access: Access) -> Result<(), BusError> {
        self.check_write(addr, len, access)
    }
}

/// Per-core handle onto memory shared between execution contexts.
///
/// Every bus operation, including the read-modify-write ones, runs under a
/// single lock, so swaps, compare-and-swaps and tag updates are atomic with
/// respect to the other handles.
#[derive(Clone)]
pub struct SharedBus {
    mem: Arc<Mutex<MemoryImage>>,
    core: CoreId,
}

impl SharedBus {
    pub fn new(image: MemoryImage) -> Self {
        SharedBus {
            mem: Arc::new(Mutex::new(image)),
            core: 0,
        }
    }

    /// Another handle onto the same memory for `core`.
    pub fn for_core(&self, core: CoreId) -> Self {
        SharedBus {
            mem: Arc::clone(&self.mem),
            core,
        }
    }

    pub fn core(&self) -> CoreId {
        self.core
    }

    pub fn lock(&self) -> MutexGuard<'_, MemoryImage> {
        self.mem.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl CapBus for SharedBus {
    fn read(&mut self, addr: u64, size: usize, access: Access) -> Result<u64, BusError> {
        self.lock().bus_read(addr, size, access)
    }

    fn write(
        &mut self,
        addr: u64,
        size: usize,
        value: u64,
        access: Access,
    ) -> Result<(), BusError> {
        self.lock().bus_write(addr, size, value, access)
    }

    fn read_cap(&mut self, addr: u64, access: Access) -> Result<CompressedCap, BusError> {
        self.lock().bus_read_cap(addr, access)
    }

    fn write_cap(
        &mut self,
        addr: u64,
        cap: CompressedCap,
        access: Access,
    ) -> Result<(), BusError> {
        self.lock().bus_write_cap(addr, cap, access)
    }

    fn get_tags(&mut self, addr: u64, count: usize) -> Result<u8, BusError> {
        Ok(self.lock().bus_get_tags(addr, count))
    }

    fn set_tags(&mut self, addr: u64, count: usize, tags: u8) -> Result<(), BusError> {
        self.lock().bus_set_tags(addr, count, tags);
        Ok(())
    }

    fn reserve(&mut self, addr: u64, len: u64) {
        let core = self.core;
        self.lock().reserve_for(core, addr, len);
    }

    fn take_reservation(&mut self, addr: u64, len: u64) -> bool {
        let core = self.core;
        self.lock().take_reservation_for(core, addr, len)
    }

    fn probe_write(&mut self, addr: u64, len: u64, access: Access) -> Result<(), BusError> {
        self.lock().check_write(addr, len, access)
    }

    fn barrier(&mut self, _kind: Barrier) {
        std::sync::atomic::fence(std::sync::atomic::Ordering::SeqCst);
    }

    fn swap(&mut self, addr: u64, size: usize, value: u64) -> Result<u64, BusError> {
        let mut mem = self.lock();
        let old = mem.bus_read(addr, size, Access::Normal)?;
        mem.bus_write(addr, size, value, Access::Normal)?;
        Ok(old)
    }

    fn compare_swap(
        &mut self,
        addr: u64,
        size: usize,
        expected: u64,
        value: u64,
    ) -> Result<u64, BusError> {
        let mut mem = self.lock();
        let old = mem.bus_read(addr, size, Access::Normal)?;
        if old == expected {
            mem.bus_write(addr, size, value, Access::Normal)?;
        }
        Ok(old)
    }

    fn swap_cap(&mut self, addr: u64, value: CompressedCap) -> Result<CompressedCap, BusError> {
        let mut mem = self.lock();
        let old = mem.bus_read_cap(addr, Access::Normal)?;
        mem.bus_write_cap(addr, value, Access::Normal)?;
        Ok(old)
    }

    fn compare_swap_cap(
        &mut self,
        addr: u64,
        expected: CompressedCap,
        value: CompressedCap,
    ) -> Result<CompressedCap, BusError> {
        let mut mem = self.lock();
        let old = mem.bus_read_cap(addr, Access::Normal)?;
        if old == expected {
            mem.bus_write_cap(addr, value, Access::Normal)?;
        }
        Ok(old)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn data_write_clears_granule_tag() {
        let mut mem = MemoryImage::new();
        mem.store_cap(0x100, CompressedCap::new(0, 0x1234, true));
        assert!(mem.tag_at(0x100));
        mem.write(0x10f, 1, 0xff, Access::Normal).unwrap();
        assert!(!mem.tag_at(0x100));
        assert_eq!(mem.load_cap(0x100).cursor, 0x1234);
    }

    #[test]
    fn tag_group_round_trips_bits() {
        let mut mem = MemoryImage::new();
        mem.set_tags(0x400, TAG_GROUP, 0b0101).unwrap();
        assert_eq!(mem.get_tags(0x400, TAG_GROUP).unwrap(), 0b0101);
        assert!(mem.tag_at(0x420));
        assert!(!mem.tag_at(0x410));
    }

    #[test]
    fn readonly_and_privileged_ranges_fault() {
        let mut mem = MemoryImage::new();
        mem.set_readonly_ranges(vec![(0x1000, 0x2000)]);
        mem.set_privileged_ranges(vec![(0x3000, 0x4000)]);
        assert_eq!(
            mem.write(0x1800, 4, 1, Access::Normal),
            Err(BusError::ReadOnly { addr: 0x1800 })
        );
        assert!(mem.read(0x3000, 8, Access::Normal).is_ok());
        assert_eq!(
            mem.read(0x3000, 8, Access::Unprivileged),
            Err(BusError::Privileged { addr: 0x3000 })
        );
    }

    #[test]
    fn overlapping_write_breaks_reservation() {
        let mut mem = MemoryImage::new();
        mem.reserve_for(1, 0x200, 16);
        mem.write_bytes(0x208, &[1]);
        assert!(!mem.take_reservation_for(1, 0x200, 16));
        mem.reserve_for(1, 0x200, 16);
        mem.write_bytes(0x300, &[1]);
        assert!(mem.take_reservation_for(1, 0x200, 16));
        assert!(!mem.take_reservation_for(1, 0x200, 16));
    }

    #[test]
    fn shared_compare_swap_is_atomic_across_cores() {
        let bus = SharedBus::new(MemoryImage::new());
        let handles: Vec<_> = (0..4)
            .map(|core| {
                let mut bus = bus.for_core(core);
                thread::spawn(move || {
                    for _ in 0..250 {
                        loop {
                            let old = bus.read(0x80, 8, Access::Normal).unwrap();
                            if bus.compare_swap(0x80, 8, old, old + 1).unwrap() == old {
                                break;
                            }
                        }
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        let mut bus = bus;
        assert_eq!(bus.read(0x80, 8, Access::Normal).unwrap(), 1000);
    }
}
