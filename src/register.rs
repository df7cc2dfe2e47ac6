//! Register Window — a typed view over a memory-mapped register region.
//!
//! Real hardware is reached through [`MmioBackend`], a thin wrapper around
//! a raw base pointer handed to us by the external capability/memory-mapping
//! layer (out of scope, spec §1). Tests back the same [`RegisterWindow`]
//! API with [`MemoryBackend`], an in-process byte buffer, the way
//! `examples/original_source/l4/pkg/nvme-driver/server/src/iomem.h` wraps a
//! base address behind typed accessors.
//!
//! Accesses are volatile and never reordered across other accesses to the
//! same window; out-of-window offsets are a programming error (a panic in
//! debug builds of the backend), not a recoverable `DriverError`.

use core::cell::UnsafeCell;

/// A source of 32-bit register reads/writes at byte offsets.
///
/// # Safety
/// Implementors must guarantee that `read_u32`/`write_u32` access exactly
/// the 4 bytes at `offset` within the mapped region, with no reordering
/// relative to other accesses through the same backend.
pub unsafe trait RegisterBackend {
    fn read_u32(&self, offset: usize) -> u32;
    fn write_u32(&self, offset: usize, value: u32);
}

/// Real MMIO backend: `base` is a pointer into a window mapped by the
/// external capability layer for the lifetime of the owning Adapter/Port.
pub struct MmioBackend {
    base: *mut u8,
}

impl MmioBackend {
    /// # Safety
    /// `base` must point at a valid, device-owned MMIO region at least as
    /// large as every offset ever passed to `read`/`write` on the
    /// resulting window, and must remain mapped for the backend's lifetime.
    pub unsafe fn new(base: *mut u8) -> Self {
        Self { base }
    }
}

// A raw MMIO pointer is only ever touched through volatile accesses, which
// is the synchronization the hardware itself provides; the pointee is not
// aliased by ordinary Rust references.
unsafe impl Send for MmioBackend {}
unsafe impl Sync for MmioBackend {}

unsafe impl RegisterBackend for MmioBackend {
    fn read_u32(&self, offset: usize) -> u32 {
        unsafe { core::ptr::read_volatile(self.base.add(offset) as *const u32) }
    }

    fn write_u32(&self, offset: usize, value: u32) {
        unsafe { core::ptr::write_volatile(self.base.add(offset) as *mut u32, value) }
    }
}

/// In-memory backend used by tests and simulated-hardware scenarios.
pub struct MemoryBackend {
    cells: UnsafeCell<alloc::vec::Vec<u8>>,
}

impl MemoryBackend {
    pub fn new(size: usize) -> Self {
        Self {
            cells: UnsafeCell::new(alloc::vec![0u8; size]),
        }
    }

    /// Seed the backing store from a byte slice (e.g. a canned identify page).
    pub fn with_bytes(bytes: &[u8]) -> Self {
        Self {
            cells: UnsafeCell::new(bytes.to_vec()),
        }
    }

    /// Borrow the raw backing bytes, for tests that want to assert on
    /// exact byte layout (PRDT entries, FIS bytes, SQE contents).
    pub fn bytes(&self) -> &[u8] {
        unsafe { &*self.cells.get() }
    }
}

unsafe impl Sync for MemoryBackend {}

unsafe impl RegisterBackend for MemoryBackend {
    fn read_u32(&self, offset: usize) -> u32 {
        let buf = unsafe { &*self.cells.get() };
        u32::from_le_bytes(buf[offset..offset + 4].try_into().unwrap())
    }

    fn write_u32(&self, offset: usize, value: u32) {
        let buf = unsafe { &mut *self.cells.get() };
        buf[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
    }
}

/// Typed view over a memory-mapped register region.
pub struct RegisterWindow<B: RegisterBackend> {
    backend: B,
}

impl<B: RegisterBackend> RegisterWindow<B> {
    pub fn new(backend: B) -> Self {
        Self { backend }
    }

    pub fn read(&self, offset: usize) -> u32 {
        self.backend.read_u32(offset)
    }

    pub fn write(&self, offset: usize, value: u32) {
        self.backend.write_u32(offset, value)
    }

    pub fn set_bits(&self, offset: usize, mask: u32) {
        let v = self.read(offset);
        self.write(offset, v | mask);
    }

    pub fn clear_bits(&self, offset: usize, mask: u32) {
        let v = self.read(offset);
        self.write(offset, v & !mask);
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }
}
