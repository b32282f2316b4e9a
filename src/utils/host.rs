//! Services the hypervisor needs from the operating system it runs on.
//!
//! The engine itself never calls an OS routine directly. Everything it needs
//! (page-granular allocations, virtual/physical translation, pinning,
//! instruction-cache invalidation) goes through the [`Host`] trait, which is
//! bound exactly once at start-up. On Windows the `nt` module provides the
//! implementation backed by the kernel memory manager.

use core::ptr::NonNull;
use spin::Once;

/// Token returned by [`Host::pin_page`], passed back on unpin.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PinToken(pub u64);

pub trait Host: Sync {
    /// Translates a virtual address to the backing physical address.
    fn physical_address(&self, va: u64) -> u64;

    /// Translates a physical address to an accessible virtual address.
    fn virtual_address(&self, pa: u64) -> u64;

    /// Allocates `bytes` of zeroed, page-aligned, physically contiguous
    /// non-paged memory.
    fn alloc_contiguous(&self, bytes: usize) -> Option<NonNull<u8>>;

    /// Frees memory previously returned by `alloc_contiguous`.
    ///
    /// # Safety
    ///
    /// The allocation must originate from `alloc_contiguous` with the same
    /// size and must not be referenced afterwards.
    unsafe fn free_contiguous(&self, ptr: NonNull<u8>, bytes: usize);

    /// Allocates `bytes` of executable non-paged memory.
    fn alloc_executable(&self, bytes: usize) -> Option<NonNull<u8>>;

    /// Frees memory previously returned by `alloc_executable`.
    ///
    /// # Safety
    ///
    /// The allocation must originate from `alloc_executable` with the same
    /// size and must not be referenced afterwards.
    unsafe fn free_executable(&self, ptr: NonNull<u8>, bytes: usize);

    /// Locks the page at `page_va` so that its virtual-to-physical binding
    /// cannot change while the hypervisor maps it 1:1.
    fn pin_page(&self, page_va: u64) -> Option<PinToken>;

    /// Releases a pin taken with `pin_page`.
    ///
    /// # Safety
    ///
    /// The token must originate from `pin_page` and must only be released
    /// once.
    unsafe fn unpin_page(&self, token: PinToken);

    /// Invalidates all instruction caches on all processors.
    fn invalidate_instruction_caches(&self);
}

static HOST: Once<&'static dyn Host> = Once::new();

/// Binds the host services. Later calls are ignored.
pub fn register(host: &'static dyn Host) {
    HOST.call_once(|| host);
}

pub fn host() -> &'static dyn Host {
    *HOST.get().expect("host services have not been registered")
}
