//! Per-processor state machine that makes hooks executable yet invisible.
//!
//! Nested paging has no execute-only permission, so a hooked page can never
//! be "readable as original, executable as patched" at the same time.
//! Instead, hooks are realised by switching permissions and backing physical
//! pages as a state machine. States, page types, their permissions, and
//! backing page types are summarized below.
//!
//! ```text
//!     State                  : Page Type
//!                            : Current : Hooked : Other
//!     0) Off                 : RWX(O)  : RWX(O) : RWX(O)
//!     1) HookArmedInvisible  : RWX(O)  : RW-(O) : RWX(O)
//!     2) HookExecVisible     : RWX(E)  : RW-(O) : RW-(O)
//!
//!         Current = The page the processor is currently executing on.
//!         Hooked  = The pages hooks are installed into and not being
//!                   executed by the processor.
//!         Other   = The rest of pages.
//!
//!         (O) = Backed by the original physical page where no hook exists.
//!         (E) = Backed by the exec physical page where hooks exist.
//! ```
//!
//! State changes:
//!
//! ```text
//!     0 -> 1 on enabling hooks (via CPUID)
//!
//!     1 -> 1 on any read or write access (no #VMEXIT)
//!       -> 2 on execution access against any of the hooked pages
//!       -> 0 on disabling hooks (via CPUID)
//!
//!     2 -> 2 on any read or write access (no #VMEXIT)
//!       -> 2 on execution access against another hooked page
//!       -> 1 on execution access against any of the non hooked pages
//!       -> 0 on disabling hooks (via CPUID)
//! ```
//!
//! While a hook page is backed by its exec copy, a read issued from code on
//! that same page observes the breakpoint byte. Nested paging cannot forbid
//! reads without also forbidding execution, so this case is accepted.

use crate::{
    hook::{
        npt::{NestedPageTable, PreAllocPool},
        physmem::PhysicalMemoryDescriptor,
        HookRegistry,
    },
    svm::{
        events::EventInjection,
        paging::NptEntry,
        vmcb::{control_area::NptExitInfo, Vmcb},
    },
    utils::addresses::PhysicalAddress,
};
use core::sync::atomic::Ordering;

/// Hook visibility state of one processor's nested page tables.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NptState {
    Off,
    HookArmedInvisible,
    HookExecVisible,
}

/// Everything one logical processor needs to run the state machine: its own
/// nested paging hierarchy, the table reserve for MMIO faults, and the
/// currently visible hook, if any.
///
/// Owned exclusively by that processor; the #VMEXIT handler runs with GIF
/// clear, so no locking is needed.
pub struct HookData {
    npt: NestedPageTable,
    pool: PreAllocPool,
    state: NptState,

    /// Index into the hook registry. `Some` exactly while the state is
    /// [`NptState::HookExecVisible`].
    active_hook: Option<usize>,
}

impl HookData {
    /// Builds the 1:1 nested page table and the pre-allocated table reserve
    /// for the current processor.
    pub fn new(descriptor: &PhysicalMemoryDescriptor, apic_base_pa: u64) -> Option<Self> {
        let npt = NestedPageTable::identity_4kb(descriptor, apic_base_pa)?;
        let pool = PreAllocPool::new()?;

        Some(Self {
            npt,
            pool,
            state: NptState::Off,
            active_hook: None,
        })
    }

    pub fn state(&self) -> NptState {
        self.state
    }

    pub fn active_hook(&self) -> Option<usize> {
        self.active_hook
    }

    pub fn pml4_pa(&self) -> PhysicalAddress {
        self.npt.pml4_pa()
    }

    /// Enables all hooks (0 -> 1): every page with hooks becomes
    /// non-executable, everything else is untouched.
    pub fn enable_hooks(&mut self, registry: &HookRegistry) {
        debug_assert_eq!(self.state, NptState::Off);
        debug_assert!(self.active_hook.is_none());

        for hook in registry.hooks() {
            self.npt.change_page_permission(hook.orig_page_pa, true);
        }

        self.state = NptState::HookArmedInvisible;
    }

    /// Disables all hooks (1 -> 0 or 2 -> 0): every page goes back to
    /// original backing, fully executable.
    pub fn disable_hooks(&mut self, registry: &HookRegistry) {
        debug_assert_ne!(self.state, NptState::Off);

        if self.state == NptState::HookArmedInvisible {
            debug_assert!(self.active_hook.is_none());

            // The processor is not on a hooked page. Just make all hooked
            // pages executable again.
            for hook in registry.hooks() {
                self.npt.change_page_permission(hook.orig_page_pa, false);
            }
        } else {
            // The processor is executing on a hooked page. This can only
            // happen when a hook sits on the same page as the code issuing
            // the disable request.
            log::warn!("Disabling hooks while one is visible");

            let index = self
                .active_hook
                .take()
                .expect("a visible hook state requires an active hook");
            let entry = &registry.hooks()[index];

            self.npt.change_all_permissions(entry.orig_page_pa, false);
            for hook in registry.hooks() {
                self.npt.change_page_permission(hook.orig_page_pa, false);
            }

            // The current page must be backed by the exec page; restore the
            // original.
            let leaf = leaf_for(&mut self.npt, entry.orig_page_pa);
            debug_assert_eq!(leaf.get_page_frame_number(), entry.exec_page_pa >> 12);
            leaf.set_page_frame_number(entry.orig_page_pa >> 12);
        }

        self.state = NptState::Off;
    }

    /// Handles a nested page fault: either materialises a missing MMIO
    /// mapping from the pre-allocated reserve, or runs a state transition
    /// for an execute violation.
    ///
    /// The faulting instruction is always retried; guest RIP is never
    /// advanced here.
    pub fn handle_nested_page_fault(&mut self, vmcb: &mut Vmcb, registry: &HookRegistry) {
        // The faulting guest physical address is saved in the VMCB's
        // EXITINFO2 field; EXITINFO1 delivers an error code similar to a #PF
        // error code. See `15.25.6 Nested versus Guest Page Faults, Fault
        // Ordering`.
        let faulting_pa = vmcb.control_area.exit_info2;
        let exit_info = NptExitInfo::from_bits_truncate(vmcb.control_area.exit_info1);

        if !exit_info.contains(NptExitInfo::PRESENT) {
            // The faulting physical page has no nested paging entry at all.
            // It is MMIO access, since all physical memory ranges visible
            // from the system already have their entries.
            #[cfg(debug_assertions)]
            if let Some(leaf) = self.npt.find(faulting_pa) {
                debug_assert_eq!(leaf.get_valid(), 0);
            }

            self.npt
                .build(faulting_pa, Some(&self.pool))
                .expect("on-demand mapping only draws from the pre-allocated reserve");
            return;
        }

        // The entry existed, so this fault must be a protection violation
        // due to an execution attempt.
        debug_assert!(exit_info.contains(NptExitInfo::ID));
        self.transition(registry, faulting_pa);
    }

    /// Handles a #BP #VMEXIT: transfers the guest into the hook handler when
    /// the breakpoint is ours, or reflects the exception otherwise.
    pub fn handle_breakpoint(&mut self, vmcb: &mut Vmcb, registry: &HookRegistry) {
        match registry.find_by_address(vmcb.save_area.rip) {
            Some(entry) => {
                entry.invocations.fetch_add(1, Ordering::Relaxed);
                vmcb.save_area.rip = entry.handler;
            }
            None => {
                // #BP originated from something else and must be delivered
                // to the guest.
                EventInjection::bp().inject(vmcb);

                // When #BP is delivered, RIP must point to the next
                // instruction.
                vmcb.save_area.rip = vmcb.control_area.nrip;
            }
        }
    }

    /// Reports pool usage; called on de-virtualization.
    pub fn report_usage(&self) {
        log::info!(
            "Pre-allocated table usage: {} / {}",
            self.pool.used(),
            self.pool.capacity()
        );
    }

    /// Picks the transition matching the faulting page.
    fn transition(&mut self, registry: &HookRegistry, faulting_pa: u64) {
        debug_assert_ne!(self.state, NptState::Off);

        match registry.position_by_physical_page(faulting_pa) {
            Some(index) => {
                if self.active_hook.is_none() {
                    // Running outside the hooked pages and jumping into one.
                    self.transition_1_to_2(registry, index);
                } else {
                    // Already on a hooked page and jumping into another one.
                    // Transit through state 1 first; not the fastest way but
                    // it keeps a single pair of transitions.
                    self.transition_2_to_1(registry);
                    self.transition_1_to_2(registry, index);
                }
            }
            None => {
                // No hooks on the faulting page, so the processor is leaving
                // the active hook page.
                self.transition_2_to_1(registry);
            }
        }
    }

    /// 1 -> 2: the processor is about to execute a hooked page.
    fn transition_1_to_2(&mut self, registry: &HookRegistry, index: usize) {
        debug_assert_eq!(self.state, NptState::HookArmedInvisible);
        debug_assert!(self.active_hook.is_none());

        let entry = &registry.hooks()[index];

        // Make all pages non-executable, then carve the current page back
        // out. Interrupts are off for the whole #VMEXIT, so the intermediate
        // all-non-executable hierarchy is never observable.
        self.npt.change_all_permissions(0, true);

        // The page is still backed by the original at this point. Switch to
        // the exec page so the hook can fire, and make it executable.
        let leaf = leaf_for(&mut self.npt, entry.orig_page_pa);
        debug_assert_ne!(leaf.get_no_execute(), 0);
        debug_assert_eq!(leaf.get_page_frame_number(), entry.orig_page_pa >> 12);
        leaf.set_page_frame_number(entry.exec_page_pa >> 12);

        self.npt.change_page_permission(entry.orig_page_pa, false);

        self.active_hook = Some(index);
        self.state = NptState::HookExecVisible;
    }

    /// 2 -> 1: the processor is leaving the active hook page.
    fn transition_2_to_1(&mut self, registry: &HookRegistry) {
        debug_assert_eq!(self.state, NptState::HookExecVisible);

        let index = self
            .active_hook
            .take()
            .expect("a visible hook state requires an active hook");
        let entry = &registry.hooks()[index];

        // Make all pages executable. This also clears the non-execute bits
        // pushed down into the PD and PT covering the active page.
        self.npt.change_all_permissions(entry.orig_page_pa, false);

        // Re-arm: make every hooked page non-executable again. A plain leaf
        // toggle, since the previous step cleared every covering entry.
        for hook in registry.hooks() {
            self.npt.change_page_permission(hook.orig_page_pa, true);
        }

        // The page is backed by the exec page at this point. Switch back to
        // the original so it looks as if there were no hooks.
        let leaf = leaf_for(&mut self.npt, entry.orig_page_pa);
        debug_assert_ne!(leaf.get_no_execute(), 0);
        debug_assert_eq!(leaf.get_page_frame_number(), entry.exec_page_pa >> 12);
        leaf.set_page_frame_number(entry.orig_page_pa >> 12);

        self.state = NptState::HookArmedInvisible;
    }
}

impl Drop for HookData {
    fn drop(&mut self) {
        self.report_usage();
    }
}

fn leaf_for(npt: &mut NestedPageTable, pa: u64) -> &mut NptEntry {
    npt.find(pa)
        .expect("hooked pages always have a nested paging entry")
}

#[cfg(test)]
impl HookData {
    pub fn npt_mut(&mut self) -> &mut NestedPageTable {
        &mut self.npt
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{hook::HookDescriptor, utils::testing};
    use alloc::boxed::Box;

    const HANDLER: u64 = 0xFFFF_8000_DEAD_0000;

    struct Setup {
        registry: HookRegistry,
        data: HookData,
        vmcb: Box<Vmcb>,
        hook_va: u64,
        hook_pa: u64,
        exec_pa: u64,
    }

    fn setup() -> Setup {
        testing::init_host();

        let page = testing::leak_page();
        page.0[0] = 0x40; // push rbx
        page.0[1] = 0x53;
        let hook_va = page.0.as_ptr() as u64;

        let registry = HookRegistry::new(
            &[HookDescriptor {
                function_name: "NtTestRoutine",
                handler: HANDLER,
            }],
            |_| Some(hook_va),
        )
        .unwrap();

        let hook_pa = registry.hooks()[0].orig_page_pa;
        let exec_pa = registry.hooks()[0].exec_page_pa;

        // RAM window generously covering every synthetic physical address
        // the test host hands out.
        let descriptor = PhysicalMemoryDescriptor::from_runs(&[
            crate::hook::physmem::PhysicalMemoryRange::new(0x0, 0x1000),
        ]);
        assert!(hook_pa < 0x1000 * 4096);

        let data = HookData::new(&descriptor, 0xFEE0_0000).unwrap();

        Setup {
            registry,
            data,
            vmcb: Vmcb::new(),
            hook_va,
            hook_pa,
            exec_pa,
        }
    }

    fn exec_fault(vmcb: &mut Vmcb, pa: u64) {
        vmcb.control_area.exit_info2 = pa;
        vmcb.control_area.exit_info1 = (NptExitInfo::PRESENT | NptExitInfo::ID).bits();
    }

    fn mmio_fault(vmcb: &mut Vmcb, pa: u64) {
        vmcb.control_area.exit_info2 = pa;
        vmcb.control_area.exit_info1 = 0;
    }

    #[test]
    fn enabling_hooks_arms_only_the_hooked_pages() {
        let mut s = setup();

        s.data.enable_hooks(&s.registry);

        assert_eq!(s.data.state(), NptState::HookArmedInvisible);
        assert!(s.data.active_hook().is_none());
        assert!(!s.data.npt.is_executable(s.hook_pa));
        assert!(s.data.npt.is_executable(s.hook_pa + 0x1000));
        assert!(s.data.npt.is_executable(0x2000));

        // Original backing while armed: reads see clean bytes.
        let leaf = s.data.npt.find(s.hook_pa).unwrap();
        assert_eq!(leaf.get_page_frame_number(), s.hook_pa >> 12);
    }

    #[test]
    fn executing_the_hooked_page_swaps_in_the_exec_copy() {
        let mut s = setup();

        s.data.enable_hooks(&s.registry);
        exec_fault(&mut s.vmcb, s.hook_pa);
        s.data.handle_nested_page_fault(&mut s.vmcb, &s.registry);

        assert_eq!(s.data.state(), NptState::HookExecVisible);
        assert_eq!(s.data.active_hook(), Some(0));

        // The current page is executable and backed by the exec copy.
        assert!(s.data.npt.is_executable(s.hook_pa));
        let leaf = s.data.npt.find(s.hook_pa).unwrap();
        assert_eq!(leaf.get_page_frame_number(), s.exec_pa >> 12);

        // Every other page lost execute permission.
        assert!(!s.data.npt.is_executable(0x2000));
        assert!(!s.data.npt.is_executable(s.hook_pa + 0x1000));
    }

    #[test]
    fn leaving_the_hook_page_restores_the_armed_state() {
        let mut s = setup();

        s.data.enable_hooks(&s.registry);
        let armed = s.data.npt.snapshot();

        exec_fault(&mut s.vmcb, s.hook_pa);
        s.data.handle_nested_page_fault(&mut s.vmcb, &s.registry);

        // Jump out to a page without hooks.
        exec_fault(&mut s.vmcb, 0x2000);
        s.data.handle_nested_page_fault(&mut s.vmcb, &s.registry);

        assert_eq!(s.data.state(), NptState::HookArmedInvisible);
        assert!(s.data.active_hook().is_none());
        assert!(s.data.npt.is_executable(0x2000));
        assert!(!s.data.npt.is_executable(s.hook_pa));

        let leaf = s.data.npt.find(s.hook_pa).unwrap();
        assert_eq!(leaf.get_page_frame_number(), s.hook_pa >> 12);

        // Entering and leaving a hook leaves the hierarchy exactly as it was
        // right after enabling.
        assert_eq!(armed, s.data.npt.snapshot());
    }

    #[test]
    fn crossing_from_hook_to_hook_keeps_one_exec_page_at_a_time() {
        testing::init_host();

        let first_page = testing::leak_page();
        first_page.0[0] = 0x40;
        first_page.0[1] = 0x53;
        let second_page = testing::leak_page();
        second_page.0[0] = 0x40;
        second_page.0[1] = 0x55;

        let first_va = first_page.0.as_ptr() as u64;
        let second_va = second_page.0.as_ptr() as u64;

        let registry = HookRegistry::new(
            &[
                HookDescriptor {
                    function_name: "NtFirst",
                    handler: HANDLER,
                },
                HookDescriptor {
                    function_name: "NtSecond",
                    handler: HANDLER + 0x100,
                },
            ],
            |name| match name {
                "NtFirst" => Some(first_va),
                "NtSecond" => Some(second_va),
                _ => None,
            },
        )
        .unwrap();

        let first_pa = registry.hooks()[0].orig_page_pa;
        let second_pa = registry.hooks()[1].orig_page_pa;

        let descriptor = PhysicalMemoryDescriptor::from_runs(&[
            crate::hook::physmem::PhysicalMemoryRange::new(0x0, 0x1000),
        ]);
        let mut data = HookData::new(&descriptor, 0xFEE0_0000).unwrap();
        let mut vmcb = Vmcb::new();

        data.enable_hooks(&registry);

        exec_fault(&mut vmcb, first_pa);
        data.handle_nested_page_fault(&mut vmcb, &registry);
        assert_eq!(data.active_hook(), Some(0));

        // Direct jump into the second hooked page.
        exec_fault(&mut vmcb, second_pa);
        data.handle_nested_page_fault(&mut vmcb, &registry);

        assert_eq!(data.state(), NptState::HookExecVisible);
        assert_eq!(data.active_hook(), Some(1));

        // The outgoing page went back to original backing and is armed
        // again; the incoming one carries its exec copy.
        let first_leaf = data.npt.find(first_pa).unwrap();
        assert_eq!(first_leaf.get_page_frame_number(), first_pa >> 12);
        assert!(!data.npt.is_executable(first_pa));

        let second_leaf = data.npt.find(second_pa).unwrap();
        assert_eq!(
            second_leaf.get_page_frame_number(),
            registry.hooks()[1].exec_page_pa >> 12
        );
        assert!(data.npt.is_executable(second_pa));
    }

    #[test]
    fn mmio_fault_maps_the_page_without_a_state_change() {
        let mut s = setup();

        s.data.enable_hooks(&s.registry);

        mmio_fault(&mut s.vmcb, 0xF000_1234);
        s.data.handle_nested_page_fault(&mut s.vmcb, &s.registry);

        assert_eq!(s.data.state(), NptState::HookArmedInvisible);
        let leaf = s.data.npt.find(0xF000_1234).unwrap();
        assert_eq!(leaf.get_valid(), 1);
        assert_eq!(leaf.get_page_frame_number(), 0xF000_1234 >> 12);
        assert!(s.data.pool.used() <= 4);
    }

    #[test]
    fn disable_round_trip_is_byte_identical() {
        let mut s = setup();

        let before = s.data.npt.snapshot();

        s.data.enable_hooks(&s.registry);
        s.data.disable_hooks(&s.registry);

        assert_eq!(s.data.state(), NptState::Off);
        assert_eq!(before, s.data.npt.snapshot());
    }

    #[test]
    fn disabling_while_a_hook_is_visible_recovers_cleanly() {
        let mut s = setup();

        s.data.enable_hooks(&s.registry);
        exec_fault(&mut s.vmcb, s.hook_pa);
        s.data.handle_nested_page_fault(&mut s.vmcb, &s.registry);
        assert_eq!(s.data.state(), NptState::HookExecVisible);

        s.data.disable_hooks(&s.registry);

        assert_eq!(s.data.state(), NptState::Off);
        assert!(s.data.active_hook().is_none());
        assert!(s.data.npt.is_executable(s.hook_pa));
        assert!(s.data.npt.is_executable(0x2000));

        let leaf = s.data.npt.find(s.hook_pa).unwrap();
        assert_eq!(leaf.get_page_frame_number(), s.hook_pa >> 12);
    }

    #[test]
    fn breakpoint_on_a_hook_redirects_to_the_handler() {
        let mut s = setup();

        s.vmcb.save_area.rip = s.hook_va;
        s.data.handle_breakpoint(&mut s.vmcb, &s.registry);

        assert_eq!(s.vmcb.save_area.rip, HANDLER);
        assert_eq!(s.vmcb.control_area.event_inj, 0);
        assert_eq!(
            s.registry.hooks()[0].invocations.load(Ordering::Relaxed),
            1
        );
    }

    #[test]
    fn foreign_breakpoint_is_reflected_into_the_guest() {
        let mut s = setup();

        s.vmcb.save_area.rip = 0x1234_5678;
        s.vmcb.control_area.nrip = 0x1234_5679;
        s.data.handle_breakpoint(&mut s.vmcb, &s.registry);

        // Vector 3, type exception, valid, no error code.
        assert_eq!(s.vmcb.control_area.event_inj, (3 << 8) | (1 << 31) | 3);
        assert_eq!(s.vmcb.save_area.rip, 0x1234_5679);
    }
}
