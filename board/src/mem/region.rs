/// Address ranges handed between boot stages, and byte access to them.
use core::fmt;
use core::ptr;

pub const KIB: usize = 1024;
pub const MIB: usize = 1024 * KIB;

/// A contiguous range of the physical address space.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct MemoryRegion {
    base: usize,
    size: usize,
}

impl MemoryRegion {
    pub const fn new(base: usize, size: usize) -> Self {
        Self { base, size }
    }

    pub const fn base(self) -> usize {
        self.base
    }

    pub const fn size(self) -> usize {
        self.size
    }

    /// One past the last byte. Saturates at the top of the address space.
    pub const fn end(self) -> usize {
        self.base.saturating_add(self.size)
    }

    pub const fn contains(self, addr: usize) -> bool {
        addr >= self.base && addr < self.end()
    }

    pub const fn as_ptr(self) -> *mut u8 {
        self.base as *mut u8
    }
}

impl fmt::Debug for MemoryRegion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "MemoryRegion({:#x}..{:#x})", self.base, self.end())
    }
}

/// Volatile byte access to a region under test.
///
/// Offsets are relative to `region().base()` and must be below its size.
pub trait RegionAccess {
    fn region(&self) -> MemoryRegion;
    fn write_byte(&mut self, offset: usize, value: u8);
    fn read_byte(&self, offset: usize) -> u8;

    fn len(&self) -> usize {
        self.region().size()
    }

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl RegionAccess for [u8] {
    fn region(&self) -> MemoryRegion {
        MemoryRegion::new(self.as_ptr() as usize, <[u8]>::len(self))
    }

    fn write_byte(&mut self, offset: usize, value: u8) {
        let slot = &mut self[offset];
        // SAFETY: `slot` is a valid, exclusive reference.
        unsafe { ptr::write_volatile(slot, value) }
    }

    fn read_byte(&self, offset: usize) -> u8 {
        let slot = &self[offset];
        // SAFETY: `slot` is a valid reference.
        unsafe { ptr::read_volatile(slot) }
    }
}

/// Physical RAM reached through its bus address.
pub struct MappedRegion {
    region: MemoryRegion,
}

impl MappedRegion {
    /// # Safety
    /// `region` must be mapped, readable and writable for as long as this
    /// value lives, and nothing else may access it in the meantime.
    pub const unsafe fn new(region: MemoryRegion) -> Self {
        Self { region }
    }
}

impl RegionAccess for MappedRegion {
    fn region(&self) -> MemoryRegion {
        self.region
    }

    fn write_byte(&mut self, offset: usize, value: u8) {
        debug_assert!(offset < self.region.size());
        // SAFETY: in bounds, and the constructor's contract grants access.
        unsafe { ptr::write_volatile(self.region.as_ptr().add(offset), value) }
    }

    fn read_byte(&self, offset: usize) -> u8 {
        debug_assert!(offset < self.region.size());
        // SAFETY: as for `write_byte`.
        unsafe { ptr::read_volatile(self.region.as_ptr().add(offset)) }
    }
}
