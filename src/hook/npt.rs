use crate::{
    hook::physmem::PhysicalMemoryDescriptor,
    svm::paging::{pde_index, ppe_index, pte_index, pxe_index, NptEntry, NptTable},
    utils::{addresses::PhysicalAddress, host::host},
};
use core::{
    ptr::NonNull,
    sync::atomic::{AtomicUsize, Ordering},
};

/// Number of zeroed tables kept aside for sub-table construction during
/// nested page fault handling. Sized for the MMIO fault burst seen during
/// boot; running out is fatal because the faulting access cannot be
/// suspended.
pub const PRE_ALLOCATED_TABLE_COUNT: usize = 50;

/// Fixed reserve of zeroed 4 KiB tables for on-demand mapping.
///
/// Tables handed out by [`allocate`] become part of the nested paging
/// hierarchy and are freed by its destructor; only the remainder is freed
/// here.
///
/// [`allocate`]: PreAllocPool::allocate
pub struct PreAllocPool {
    tables: [*mut NptTable; PRE_ALLOCATED_TABLE_COUNT],
    used: AtomicUsize,
}

impl PreAllocPool {
    pub fn new() -> Option<Self> {
        let mut tables: [*mut NptTable; PRE_ALLOCATED_TABLE_COUNT] =
            [core::ptr::null_mut(); PRE_ALLOCATED_TABLE_COUNT];

        for slot in tables.iter_mut() {
            let Some(table) = allocate_table() else {
                // Partial allocation. Give back what we already took.
                for allocated in tables.iter().take_while(|table| !table.is_null()) {
                    unsafe { free_table(*allocated) };
                }
                return None;
            };

            *slot = table.as_ptr();
        }

        Some(Self {
            tables,
            used: AtomicUsize::new(0),
        })
    }

    /// Takes the next unused table. The table is zeroed and page aligned.
    pub fn allocate(&self) -> NonNull<NptTable> {
        let index = self.used.fetch_add(1, Ordering::Relaxed);
        if index >= PRE_ALLOCATED_TABLE_COUNT {
            panic!("pre-allocated nested paging tables exhausted");
        }

        // Safety: every slot is backed by a live allocation from `new`.
        unsafe { NonNull::new_unchecked(self.tables[index]) }
    }

    pub fn used(&self) -> usize {
        self.used.load(Ordering::Relaxed).min(PRE_ALLOCATED_TABLE_COUNT)
    }

    pub fn capacity(&self) -> usize {
        PRE_ALLOCATED_TABLE_COUNT
    }
}

impl Drop for PreAllocPool {
    fn drop(&mut self) {
        // Consumed tables are owned by the hierarchy now; skip them.
        for table in self.tables.iter().skip(self.used()) {
            unsafe { free_table(*table) };
        }
    }
}

/// A 4-level nested page table translating guest physical to host physical
/// addresses 1:1 at 4 KiB granularity.
///
/// The US (User) bit of all entries is set, as all guest accesses are treated
/// as user accesses at the nested level, and the RW (Write) bit is set since
/// guest page table walks are treated as write accesses. See "Nested versus
/// Guest Page Faults, Fault Ordering". Execute permission is the only bit
/// this hypervisor ever changes after construction.
pub struct NestedPageTable {
    pml4: *mut NptTable,
    max_ppe_index: usize,
}

impl NestedPageTable {
    /// Builds 1:1 mappings for every page of every RAM run, plus the page
    /// containing the local APIC. MMIO regions are left unmapped and are
    /// materialised on nested page fault instead.
    pub fn identity_4kb(
        descriptor: &PhysicalMemoryDescriptor,
        apic_base_pa: u64,
    ) -> Option<Self> {
        let pml4 = allocate_table()?;
        let mut npt = Self {
            pml4: pml4.as_ptr(),
            max_ppe_index: descriptor.max_ppe_index(),
        };

        for run in descriptor.ranges() {
            for page_index in 0..run.page_count {
                let pa = run.base_address() + page_index * 0x1000;
                npt.build(pa, None)?;
            }
        }

        // The APIC base is not part of any RAM run but is touched on every
        // interrupt; missing it hangs the system.
        npt.build(apic_base_pa & !0xFFF, None)?;

        Some(npt)
    }

    pub fn pml4(&self) -> *mut NptTable {
        self.pml4
    }

    pub fn pml4_pa(&self) -> PhysicalAddress {
        PhysicalAddress::from_va(self.pml4 as u64)
    }

    pub fn max_ppe_index(&self) -> usize {
        self.max_ppe_index
    }

    /// Returns the leaf entry for `pa`, or `None` if any table on the walk is
    /// missing.
    pub fn find(&mut self, pa: u64) -> Option<&mut NptEntry> {
        let pml4_entry = unsafe { &mut (*self.pml4).entries[pxe_index(pa)] };
        if pml4_entry.get_valid() == 0 {
            return None;
        }

        let pdpt = table_from_entry(pml4_entry);
        let pdpt_entry = unsafe { &mut (*pdpt).entries[ppe_index(pa)] };
        if pdpt_entry.get_valid() == 0 {
            return None;
        }

        let pd = table_from_entry(pdpt_entry);
        let pd_entry = unsafe { &mut (*pd).entries[pde_index(pa)] };
        if pd_entry.get_valid() == 0 {
            return None;
        }

        let pt = table_from_entry(pd_entry);
        Some(unsafe { &mut (*pt).entries[pte_index(pa)] })
    }

    /// Builds every table needed to translate `pa` and points the leaf at
    /// `pa` itself.
    ///
    /// Missing sub-tables are drawn from `pool` when given (nested page
    /// fault handling), or freshly allocated (initial construction). Returns
    /// `None` only when a fresh allocation fails.
    pub fn build(&mut self, pa: u64, pool: Option<&PreAllocPool>) -> Option<&mut NptEntry> {
        let pml4_entry = unsafe { &mut (*self.pml4).entries[pxe_index(pa)] };
        if pml4_entry.get_valid() == 0 {
            link_sub_table(pml4_entry, pool)?;
        }

        let pdpt = table_from_entry(pml4_entry);
        let pdpt_entry = unsafe { &mut (*pdpt).entries[ppe_index(pa)] };
        if pdpt_entry.get_valid() == 0 {
            link_sub_table(pdpt_entry, pool)?;
        }

        let pd = table_from_entry(pdpt_entry);
        let pd_entry = unsafe { &mut (*pd).entries[pde_index(pa)] };
        if pd_entry.get_valid() == 0 {
            link_sub_table(pd_entry, pool)?;
        }

        let pt = table_from_entry(pd_entry);
        let leaf = unsafe { &mut (*pt).entries[pte_index(pa)] };
        debug_assert_eq!(leaf.get_valid(), 0);

        leaf.set_valid(1);
        leaf.set_write(1);
        leaf.set_user(1);
        leaf.set_page_frame_number(pa >> 12);

        Some(leaf)
    }

    /// Changes the execute permission of the 4 KiB page at `pa`.
    ///
    /// The effective permission of a translation is the AND over all levels
    /// of the walk, so making a leaf executable while a parent is
    /// non-executable is a no-op, and simply clearing the parent would make
    /// its whole 1 GB (or 2 MB) range executable. When the request is to
    /// allow execution and a covering PDPT or PD entry is currently
    /// non-executable, that entry is cleared and *all* of its children are
    /// made non-executable first:
    ///
    /// ```text
    ///  Before                       After
    ///
    ///   PDPT                         PDPT
    ///  +----+                       +----+
    ///  | NX |    PD                 | NX |    PD
    ///  +----+---+----+              +----+---+----+
    ///  | NX |   | EX |    PT        |*EX*|   | NX |    PT
    ///  +----+   +----+---+----+     +----+   +----+---+----+
    ///  | NX |\  | EX |   | EX | ==> | NX |\  |*EX*|   | NX |
    ///  +----+ | +----+   +----+     +----+ | +----+   +----+
    ///         | | EX |\  | EX |            | | NX |\  |*EX*|  << executable
    ///         | +----+ | +----+            | +----+ | +----+
    ///          \| EX | | | EX |             \| NX | | | NX |
    ///           +----+ | +----+              +----+ | +----+
    ///                   \| EX |                      \| NX |
    ///                    +----+                       +----+
    /// ```
    ///
    /// This requires up to two times 512 iterations, making this function
    /// VERY slow.
    pub fn change_page_permission(&mut self, pa: u64, disallow_execute: bool) {
        // The PML4 entry stays executable and is never changed; the top
        // level we touch is the PDPT.
        let pml4_entry = unsafe { &mut (*self.pml4).entries[pxe_index(pa)] };
        debug_assert_ne!(pml4_entry.get_valid(), 0);

        let pdpt = table_from_entry(pml4_entry);
        let pdpt_entry = unsafe { &mut (*pdpt).entries[ppe_index(pa)] };
        debug_assert_ne!(pdpt_entry.get_valid(), 0);

        let pd = table_from_entry(pdpt_entry);

        if !disallow_execute && pdpt_entry.get_no_execute() != 0 {
            pdpt_entry.set_no_execute(0);

            // This 1 GB range inherited non-execute from the PDPT entry.
            // Push the permission down into the PD so only the requested
            // page becomes executable.
            for pd_entry in unsafe { (*pd).entries.iter_mut() } {
                pd_entry.set_no_execute(1);
            }
        }

        let pd_entry = unsafe { &mut (*pd).entries[pde_index(pa)] };
        debug_assert_ne!(pd_entry.get_valid(), 0);

        let pt = table_from_entry(pd_entry);

        if !disallow_execute && pd_entry.get_no_execute() != 0 {
            // Do the same thing as we did for the PDPT.
            pd_entry.set_no_execute(0);

            for pt_entry in unsafe { (*pt).entries.iter_mut() } {
                pt_entry.set_no_execute(1);
            }
        }

        let pt_entry = unsafe { &mut (*pt).entries[pte_index(pa)] };
        debug_assert_ne!(pt_entry.get_valid(), 0);

        pt_entry.set_no_execute(disallow_execute as u64);
    }

    /// Changes the execute permission of all mapped physical memory by
    /// toggling every PDPT entry up to the highest index backed by RAM.
    ///
    /// When making memory executable, the PD and PT covering `active_pa`
    /// may still carry non-execute bits pushed down by a prior
    /// [`change_page_permission`] call and are restored entry by entry.
    pub fn change_all_permissions(&mut self, active_pa: u64, disallow_execute: bool) {
        // A single guest is assumed to own no more than 512 GB of RAM, so
        // only the sub-tables of the first PML4 entry are walked.
        let pml4_entry = unsafe { &mut (*self.pml4).entries[0] };
        debug_assert_ne!(pml4_entry.get_valid(), 0);

        let pdpt = table_from_entry(pml4_entry);

        for ppe in 0..self.max_ppe_index {
            let pdpt_entry = unsafe { &mut (*pdpt).entries[ppe] };
            pdpt_entry.set_no_execute(disallow_execute as u64);
        }

        if !disallow_execute {
            Self::make_sub_tables_executable(pdpt, active_pa);
        }
    }

    /// Clears the non-execute bit on every entry of the PD and PT that
    /// translate `active_pa`. Two times 512 iterations, also VERY slow.
    fn make_sub_tables_executable(pdpt: *mut NptTable, active_pa: u64) {
        let pdpt_entry = unsafe { &mut (*pdpt).entries[ppe_index(active_pa)] };
        debug_assert_ne!(pdpt_entry.get_valid(), 0);

        let pd = table_from_entry(pdpt_entry);
        for pd_entry in unsafe { (*pd).entries.iter_mut() } {
            pd_entry.set_no_execute(0);
        }

        let pd_entry = unsafe { &mut (*pd).entries[pde_index(active_pa)] };
        debug_assert_ne!(pd_entry.get_valid(), 0);

        let pt = table_from_entry(pd_entry);
        for pt_entry in unsafe { (*pt).entries.iter_mut() } {
            pt_entry.set_no_execute(0);
        }
    }
}

impl Drop for NestedPageTable {
    fn drop(&mut self) {
        unsafe { destruct_tables(self.pml4, 4) };
    }
}

fn allocate_table() -> Option<NonNull<NptTable>> {
    host()
        .alloc_contiguous(core::mem::size_of::<NptTable>())
        .map(NonNull::cast)
}

unsafe fn free_table(table: *mut NptTable) {
    if let Some(table) = NonNull::new(table) {
        host().free_contiguous(table.cast(), core::mem::size_of::<NptTable>());
    }
}

fn table_from_entry(entry: &NptEntry) -> *mut NptTable {
    PhysicalAddress::from_pfn(entry.get_page_frame_number()).as_va()
}

/// Makes `entry` point at a fresh zeroed sub-table.
fn link_sub_table(entry: &mut NptEntry, pool: Option<&PreAllocPool>) -> Option<()> {
    let table = match pool {
        Some(pool) => pool.allocate(),
        None => allocate_table()?,
    };

    entry.set_valid(1);
    entry.set_write(1);
    entry.set_user(1);
    entry.set_page_frame_number(PhysicalAddress::from_va(table.as_ptr() as u64).pfn());

    Some(())
}

/// Frees `table` and all live sub-tables below it, leaves first.
unsafe fn destruct_tables(table: *mut NptTable, level: u32) {
    for entry in (*table).entries.iter() {
        if entry.get_valid() == 0 {
            continue;
        }

        match level {
            4 | 3 => destruct_tables(table_from_entry(entry), level - 1),
            // Level 2 entries reference page tables whose entries are leaf
            // translations, not owned tables.
            2 => free_table(table_from_entry(entry)),
            _ => unreachable!(),
        }
    }

    free_table(table);
}

#[cfg(test)]
impl NestedPageTable {
    /// Effective execute permission for `pa`: the AND of `!no_execute` along
    /// the whole walk.
    pub fn is_executable(&mut self, pa: u64) -> bool {
        let pml4_entry = unsafe { &(*self.pml4).entries[pxe_index(pa)] };
        assert_ne!(pml4_entry.get_valid(), 0);
        if pml4_entry.get_no_execute() != 0 {
            return false;
        }

        let pdpt = table_from_entry(pml4_entry);
        let pdpt_entry = unsafe { &(*pdpt).entries[ppe_index(pa)] };
        assert_ne!(pdpt_entry.get_valid(), 0);
        if pdpt_entry.get_no_execute() != 0 {
            return false;
        }

        let pd = table_from_entry(pdpt_entry);
        let pd_entry = unsafe { &(*pd).entries[pde_index(pa)] };
        assert_ne!(pd_entry.get_valid(), 0);
        if pd_entry.get_no_execute() != 0 {
            return false;
        }

        let pt = table_from_entry(pd_entry);
        let pt_entry = unsafe { &(*pt).entries[pte_index(pa)] };
        assert_ne!(pt_entry.get_valid(), 0);

        pt_entry.get_no_execute() == 0
    }

    /// Raw dump of every table, in walk order. Two dumps compare equal iff
    /// the hierarchies are byte-identical.
    pub fn snapshot(&mut self) -> std::vec::Vec<u64> {
        fn walk(table: *mut NptTable, level: u32, out: &mut std::vec::Vec<u64>) {
            for entry in unsafe { (*table).entries.iter() } {
                out.push(entry.raw());
                if entry.get_valid() != 0 && level > 2 {
                    walk(table_from_entry(entry), level - 1, out);
                }
            }
        }

        let mut out = std::vec::Vec::new();
        walk(self.pml4, 4, &mut out);
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{hook::physmem::PhysicalMemoryRange, utils::testing};

    fn small_npt() -> NestedPageTable {
        testing::init_host();

        // Two runs: [0, 2 MB) and [4 MB, 4 MB + 16 pages), APIC at its usual
        // spot far above.
        let descriptor = PhysicalMemoryDescriptor::from_runs(&[
            PhysicalMemoryRange::new(0x0, 0x200),
            PhysicalMemoryRange::new(0x400, 0x10),
        ]);

        NestedPageTable::identity_4kb(&descriptor, 0xFEE0_0000).unwrap()
    }

    #[test]
    fn identity_mapping_covers_every_run_page() {
        let mut npt = small_npt();

        for pa in [0x0u64, 0x1000, 0x1F_F000, 0x40_0000, 0x40_F000, 0xFEE0_0000] {
            let leaf = npt.find(pa).unwrap();
            assert_eq!(leaf.get_valid(), 1);
            assert_eq!(leaf.get_write(), 1);
            assert_eq!(leaf.get_user(), 1);
            assert_eq!(leaf.get_no_execute(), 0);
            assert_eq!(leaf.get_page_frame_number(), pa >> 12);
        }
    }

    #[test]
    fn find_returns_none_for_unmapped_holes() {
        let mut npt = small_npt();

        // Hole between the runs and far beyond RAM.
        assert!(npt.find(0x20_0000).is_none());
        assert!(npt.find(0x123_4567_8000).is_none());
    }

    #[test]
    fn build_from_pool_consumes_bounded_slots() {
        let mut npt = small_npt();
        let pool = PreAllocPool::new().unwrap();

        // PML4 entry exists, PDPT entry for 2 GB does not: PD + PT.
        npt.build(0x8000_0000, Some(&pool)).unwrap();
        assert_eq!(pool.used(), 2);

        // Direct neighbour page: whole path exists now.
        npt.build(0x8000_1000, Some(&pool)).unwrap();
        assert_eq!(pool.used(), 2);

        // Above 512 GB: PDPT + PD + PT.
        npt.build(0x80_0000_0000, Some(&pool)).unwrap();
        assert_eq!(pool.used(), 5);

        assert!(npt.find(0x8000_0000).is_some());
        assert!(npt.find(0x8000_1000).is_some());
        assert!(npt.find(0x80_0000_0000).is_some());
    }

    #[test]
    #[should_panic(expected = "exhausted")]
    fn pool_exhaustion_is_fatal() {
        testing::init_host();

        let pool = PreAllocPool::new().unwrap();
        for _ in 0..=PRE_ALLOCATED_TABLE_COUNT {
            pool.allocate();
        }
    }

    #[test]
    fn clearing_leaf_nx_under_nx_parent_masks_siblings() {
        let mut npt = small_npt();
        let pa = 0x4000u64;

        // Force the covering PDPT entry non-executable, as the bulk toggle
        // does.
        npt.change_all_permissions(0, true);
        assert!(!npt.is_executable(pa));

        npt.change_page_permission(pa, false);

        // The requested page is executable again, its neighbours are not.
        assert!(npt.is_executable(pa));
        assert!(!npt.is_executable(0x3000));
        assert!(!npt.is_executable(0x5000));
        assert!(!npt.is_executable(0x40_0000));
    }

    #[test]
    fn leaf_nx_set_is_a_plain_leaf_toggle() {
        let mut npt = small_npt();

        npt.change_page_permission(0x4000, true);

        assert!(!npt.is_executable(0x4000));
        assert!(npt.is_executable(0x3000));
        assert!(npt.is_executable(0x5000));
    }

    #[test]
    fn bulk_toggle_round_trip_restores_sub_tables() {
        let mut npt = small_npt();
        let hook_pa = 0x4000u64;

        let before = npt.snapshot();

        // Arm, make everything non-executable, then restore around the
        // active page.
        npt.change_page_permission(hook_pa, true);
        npt.change_all_permissions(0, true);
        npt.change_page_permission(hook_pa, false);

        npt.change_all_permissions(hook_pa, false);
        npt.change_page_permission(hook_pa, true);
        npt.change_page_permission(hook_pa, false);

        assert_eq!(before, npt.snapshot());
    }
}
