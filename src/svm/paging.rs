use bitfield::bitfield;
use x86::bits64::paging::{BASE_PAGE_SHIFT, BASE_PAGE_SIZE};

pub const ENTRY_COUNT: usize = 512;
pub const _1GB: u64 = 1 << 30;

bitfield! {
    /// Nested page-table entry.
    ///
    /// The format is shared by all four levels (PML4E, PDPE, PDE, PTE); only
    /// 4 KiB translations are used, so the PS bit never comes into play. See
    /// `Figure 5-17` to `5-21` (4-Kbyte Page Translation, Long Mode).
    #[derive(Copy, Clone, PartialEq, Eq)]
    pub struct NptEntry(u64);
    impl Debug;
    pub get_valid, set_valid: 0, 0;                             // [0]
    pub get_write, set_write: 1, 1;                             // [1]
    pub get_user, set_user: 2, 2;                               // [2]
    pub get_page_frame_number, set_page_frame_number: 51, 12;   // [12-51]
    pub get_no_execute, set_no_execute: 63, 63;                 // [63]
}

impl NptEntry {
    /// The raw 64-bit record, for comparisons.
    pub fn raw(&self) -> u64 {
        self.0
    }
}

/// One 4 KiB table of any of the four levels.
#[repr(C, align(4096))]
pub struct NptTable {
    pub entries: [NptEntry; ENTRY_COUNT],
}
const_assert_eq!(core::mem::size_of::<NptTable>(), BASE_PAGE_SIZE);

/// PML4 index (bits 39-47), selects 512 GB.
pub fn pxe_index(pa: u64) -> usize {
    ((pa >> 39) & 0x1FF) as usize
}

/// PDPT index (bits 30-38), selects 1 GB.
pub fn ppe_index(pa: u64) -> usize {
    ((pa >> 30) & 0x1FF) as usize
}

/// PD index (bits 21-29), selects 2 MB.
pub fn pde_index(pa: u64) -> usize {
    ((pa >> 21) & 0x1FF) as usize
}

/// PT index (bits 12-20), selects 4 KB.
pub fn pte_index(pa: u64) -> usize {
    ((pa >> 12) & 0x1FF) as usize
}

pub fn bytes_to_pages(bytes: u64) -> u64 {
    (bytes + BASE_PAGE_SIZE as u64 - 1) >> BASE_PAGE_SHIFT
}
