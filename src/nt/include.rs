//! Definitions of the NT kernel functions and structures this driver-side
//! glue relies on.

#![allow(bad_style)]
#![allow(missing_docs)]

use core::ffi::c_void;

pub type PVOID = *mut c_void;
pub type NTSTATUS = i32;
pub type PHYSICAL_ADDRESS = i64;
pub type SIZE_T = usize;
pub type KPROCESSOR_MODE = i8;
pub type LOCK_OPERATION = u32;

pub const KERNEL_MODE: KPROCESSOR_MODE = 0;
pub const IO_READ_ACCESS: LOCK_OPERATION = 0;

pub const NON_PAGED_POOL: u32 = 0;
pub const NON_PAGED_POOL_EXECUTE: u32 = 0;

pub const MM_CACHED: u32 = 1;
pub const MM_ANY_NODE_OK: u32 = 0x8000_0000;

pub const ALL_PROCESSOR_GROUPS: u16 = 0xFFFF;

pub fn NT_SUCCESS(status: NTSTATUS) -> bool {
    status >= 0
}

#[repr(C)]
pub struct UNICODE_STRING {
    pub Length: u16,
    pub MaximumLength: u16,
    pub Buffer: *mut u16,
}

#[repr(C)]
#[derive(Clone, Copy)]
pub struct PROCESSOR_NUMBER {
    pub Group: u16,
    pub Number: u8,
    pub Reserved: u8,
}

#[repr(C)]
#[derive(Clone, Copy)]
pub struct GROUP_AFFINITY {
    pub Mask: usize,
    pub Group: u16,
    pub Reserved: [u16; 3],
}

/// Opaque; only ever handled by pointer.
#[repr(C)]
pub struct MDL {
    _opaque: [u8; 0],
}

#[repr(C)]
pub struct PHYSICAL_MEMORY_RANGE {
    pub BaseAddress: PHYSICAL_ADDRESS,
    pub NumberOfBytes: i64,
}

extern "system" {
    pub fn ExAllocatePoolWithTag(PoolType: u32, NumberOfBytes: SIZE_T, Tag: u32) -> PVOID;
    pub fn ExFreePoolWithTag(P: PVOID, Tag: u32);
    pub fn ExFreePool(P: PVOID);

    pub fn MmAllocateContiguousMemorySpecifyCacheNode(
        NumberOfBytes: SIZE_T,
        LowestAcceptableAddress: PHYSICAL_ADDRESS,
        HighestAcceptableAddress: PHYSICAL_ADDRESS,
        BoundaryAddressMultiple: PHYSICAL_ADDRESS,
        CacheType: u32,
        PreferredNode: u32,
    ) -> PVOID;
    pub fn MmFreeContiguousMemory(BaseAddress: PVOID);

    pub fn MmGetPhysicalAddress(BaseAddress: PVOID) -> PHYSICAL_ADDRESS;
    pub fn MmGetVirtualForPhysical(PhysicalAddress: PHYSICAL_ADDRESS) -> PVOID;
    pub fn MmGetSystemRoutineAddress(SystemRoutineName: *mut UNICODE_STRING) -> PVOID;
    pub fn MmGetPhysicalMemoryRanges() -> *mut PHYSICAL_MEMORY_RANGE;

    pub fn IoAllocateMdl(
        VirtualAddress: PVOID,
        Length: u32,
        SecondaryBuffer: u8,
        ChargeQuota: u8,
        Irp: PVOID,
    ) -> *mut MDL;
    pub fn IoFreeMdl(Mdl: *mut MDL);
    pub fn MmProbeAndLockPages(
        Mdl: *mut MDL,
        AccessMode: KPROCESSOR_MODE,
        Operation: LOCK_OPERATION,
    );
    pub fn MmUnlockPages(Mdl: *mut MDL);

    pub fn KeInvalidateAllCaches() -> u8;

    pub fn KeQueryActiveProcessorCountEx(GroupNumber: u16) -> u32;
    pub fn KeGetProcessorNumberFromIndex(
        ProcIndex: u32,
        ProcNumber: *mut PROCESSOR_NUMBER,
    ) -> NTSTATUS;
    pub fn KeSetSystemGroupAffinityThread(
        Affinity: *mut GROUP_AFFINITY,
        PreviousAffinity: *mut GROUP_AFFINITY,
    );
    pub fn KeRevertToUserGroupAffinityThread(PreviousAffinity: *mut GROUP_AFFINITY);
}
