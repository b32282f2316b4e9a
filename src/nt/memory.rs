//! The [`Host`] implementation backed by the NT kernel memory manager.

use crate::{
    hook::physmem::{PhysicalMemoryDescriptor, PhysicalMemoryRange},
    nt::include::{
        ExAllocatePoolWithTag, ExFreePool, ExFreePoolWithTag, IoAllocateMdl, IoFreeMdl,
        KeInvalidateAllCaches, MmAllocateContiguousMemorySpecifyCacheNode,
        MmFreeContiguousMemory, MmGetPhysicalAddress, MmGetPhysicalMemoryRanges,
        MmGetVirtualForPhysical, MmProbeAndLockPages, MmUnlockPages, IO_READ_ACCESS,
        KERNEL_MODE, MDL, MM_ANY_NODE_OK, MM_CACHED, NON_PAGED_POOL_EXECUTE,
    },
    utils::host::{Host, PinToken},
};
use alloc::vec::Vec;
use core::ptr::NonNull;
use x86::bits64::paging::BASE_PAGE_SIZE;

/// 'SvHk'
const TAG: u32 = u32::from_le_bytes(*b"SvHk");

pub struct NtHost;

impl Host for NtHost {
    fn physical_address(&self, va: u64) -> u64 {
        unsafe { MmGetPhysicalAddress(va as _) as u64 }
    }

    fn virtual_address(&self, pa: u64) -> u64 {
        unsafe { MmGetVirtualForPhysical(pa as _) as u64 }
    }

    fn alloc_contiguous(&self, bytes: usize) -> Option<NonNull<u8>> {
        let memory = unsafe {
            MmAllocateContiguousMemorySpecifyCacheNode(
                bytes,
                0,
                i64::MAX,
                0,
                MM_CACHED,
                MM_ANY_NODE_OK,
            )
        } as *mut u8;

        let memory = NonNull::new(memory)?;
        unsafe { core::ptr::write_bytes(memory.as_ptr(), 0, bytes) };

        Some(memory)
    }

    unsafe fn free_contiguous(&self, ptr: NonNull<u8>, _bytes: usize) {
        MmFreeContiguousMemory(ptr.as_ptr() as _);
    }

    fn alloc_executable(&self, bytes: usize) -> Option<NonNull<u8>> {
        let pool = unsafe { ExAllocatePoolWithTag(NON_PAGED_POOL_EXECUTE, bytes, TAG) };
        NonNull::new(pool as *mut u8)
    }

    unsafe fn free_executable(&self, ptr: NonNull<u8>, _bytes: usize) {
        ExFreePoolWithTag(ptr.as_ptr() as _, TAG);
    }

    fn pin_page(&self, page_va: u64) -> Option<PinToken> {
        let mdl = unsafe {
            IoAllocateMdl(
                page_va as _,
                BASE_PAGE_SIZE as u32,
                0,
                0,
                core::ptr::null_mut(),
            )
        };
        if mdl.is_null() {
            return None;
        }

        unsafe { MmProbeAndLockPages(mdl, KERNEL_MODE, IO_READ_ACCESS) };

        Some(PinToken(mdl as u64))
    }

    unsafe fn unpin_page(&self, token: PinToken) {
        let mdl = token.0 as *mut MDL;
        MmUnlockPages(mdl);
        IoFreeMdl(mdl);
    }

    fn invalidate_instruction_caches(&self) {
        unsafe { KeInvalidateAllCaches() };
    }
}

static NT_HOST: NtHost = NtHost;

/// Binds the NT-backed host services. Call once from DriverEntry, before
/// anything else in this crate.
pub fn register_host() {
    crate::utils::host::register(&NT_HOST);
}

/// Reads the physical memory ranges of the system, the 1:1 mapping source
/// for the nested page tables.
pub fn physical_memory_descriptor() -> Option<PhysicalMemoryDescriptor> {
    let ranges = unsafe { MmGetPhysicalMemoryRanges() };
    if ranges.is_null() {
        log::error!("MmGetPhysicalMemoryRanges() returned null");
        return None;
    }

    let mut runs = Vec::new();
    let mut index = 0;
    loop {
        let current = unsafe { &*ranges.add(index) };
        if current.BaseAddress == 0 && current.NumberOfBytes == 0 {
            break;
        }

        runs.push(PhysicalMemoryRange::new(
            current.BaseAddress as u64 >> 12,
            current.NumberOfBytes as u64 >> 12,
        ));
        index += 1;
    }

    unsafe { ExFreePool(ranges as _) };

    if runs.is_empty() {
        return None;
    }

    Some(PhysicalMemoryDescriptor::from_runs(&runs))
}
