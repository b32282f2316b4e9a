//! Scenario tests driving the exit dispatcher the way the hardware would:
//! a fabricated VMCB and register block per exit, no VMRUN involved.

use crate::{
    hook::{
        engine::{HookData, NptState},
        physmem::{PhysicalMemoryDescriptor, PhysicalMemoryRange},
        HookDescriptor, HookRegistry, BREAKPOINT_OPCODE,
    },
    svm::{
        data::{guest::GuestRegisters, processor_data::ProcessorData, shared_data::SharedData},
        msr::EFER_SVME,
        vmcb::control_area::{
            NptExitInfo, VMEXIT_CPUID, VMEXIT_EXCEPTION_BP, VMEXIT_MSR, VMEXIT_NPF,
            VMEXIT_VMRUN,
        },
        vmexit::{
            cpuid::{
                CPUID_LEAF_CONTROL, CPUID_SUBLEAF_DISABLE_HOOKS, CPUID_SUBLEAF_ENABLE_HOOKS,
                CPUID_SUBLEAF_UNLOAD,
            },
            dispatch, ExitType,
        },
    },
    utils::testing,
};
use alloc::boxed::Box;
use x86::msr::IA32_EFER;

const HANDLER: u64 = 0xFFFF_8000_CAFE_0000;

/// #GP(0): vector 13, type exception, error code valid, valid.
const GP_RECORD: u64 = 13 | (3 << 8) | (1 << 11) | (1 << 31);

const DPL_KERNEL: u16 = 0;
const DPL_USER: u16 = 3 << 5;

struct Harness {
    // Box addresses are wired into `ProcessorData` as raw pointers; the
    // fields only exist to keep everything alive.
    _shared: Box<SharedData>,
    hook_data: Box<HookData>,
    data: Box<ProcessorData>,
    regs: GuestRegisters,
    hook_va: u64,
    hook_pa: u64,
    exec_pa: u64,
}

impl Harness {
    fn new() -> Self {
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

        let descriptor =
            PhysicalMemoryDescriptor::from_runs(&[PhysicalMemoryRange::new(0, 0x1000)]);
        assert!(hook_pa < 0x1000 * 4096);

        let mut shared = SharedData::new(registry, descriptor).unwrap();
        let mut hook_data =
            Box::new(HookData::new(&shared.memory_descriptor, 0xFEE0_0000).unwrap());

        let mut data = ProcessorData::new();
        data.configure(&mut shared, &mut hook_data);
        data.guest_vmcb.save_area.ss_attrib = DPL_KERNEL;

        Self {
            _shared: shared,
            hook_data,
            data,
            regs: GuestRegisters::default(),
            hook_va,
            hook_pa,
            exec_pa,
        }
    }

    fn cpuid(&mut self, leaf: u32, subleaf: u32) -> ExitType {
        self.regs.rax = leaf as u64;
        self.regs.rcx = subleaf as u64;
        self.data.guest_vmcb.save_area.rax = leaf as u64;
        self.data.guest_vmcb.control_area.exit_code = VMEXIT_CPUID;
        dispatch(&mut self.data, &mut self.regs)
    }

    fn npf(&mut self, pa: u64, exit_info: u64) -> ExitType {
        self.data.guest_vmcb.control_area.exit_code = VMEXIT_NPF;
        self.data.guest_vmcb.control_area.exit_info1 = exit_info;
        self.data.guest_vmcb.control_area.exit_info2 = pa;
        dispatch(&mut self.data, &mut self.regs)
    }

    fn exec_fault(&mut self, pa: u64) -> ExitType {
        self.npf(pa, (NptExitInfo::PRESENT | NptExitInfo::ID).bits())
    }

    fn state(&self) -> NptState {
        self.hook_data.state()
    }
}

#[test]
fn enable_execute_and_redirect() {
    let mut h = Harness::new();

    // Enable hooks from kernel mode.
    h.data.guest_vmcb.control_area.nrip = 0x1000;
    assert_eq!(
        h.cpuid(CPUID_LEAF_CONTROL, CPUID_SUBLEAF_ENABLE_HOOKS),
        ExitType::IncrementRip
    );
    assert_eq!(h.data.guest_vmcb.save_area.rip, 0x1000);
    assert_eq!(h.state(), NptState::HookArmedInvisible);

    // The guest fetches from the hooked page: one execute violation, no RIP
    // change, the page flips to the exec copy.
    let rip_before = h.data.guest_vmcb.save_area.rip;
    assert_eq!(h.exec_fault(h.hook_pa), ExitType::Continue);
    assert_eq!(h.data.guest_vmcb.save_area.rip, rip_before);
    assert_eq!(h.state(), NptState::HookExecVisible);

    // The retried fetch hits the breakpoint byte; the exit rewrites RIP to
    // the handler.
    assert_eq!(
        unsafe { *((h.exec_pa + (h.hook_va & 0xFFF)) as *const u8) },
        BREAKPOINT_OPCODE
    );
    h.data.guest_vmcb.save_area.rip = h.hook_va;
    h.data.guest_vmcb.control_area.exit_code = VMEXIT_EXCEPTION_BP;
    assert_eq!(dispatch(&mut h.data, &mut h.regs), ExitType::Continue);
    assert_eq!(h.data.guest_vmcb.save_area.rip, HANDLER);
}

#[test]
fn leaving_the_hook_page_rearms_it() {
    let mut h = Harness::new();

    h.cpuid(CPUID_LEAF_CONTROL, CPUID_SUBLEAF_ENABLE_HOOKS);
    h.exec_fault(h.hook_pa);
    assert_eq!(h.state(), NptState::HookExecVisible);

    // Exec on a plain page: back to armed, original backing.
    assert_eq!(h.exec_fault(0x2000), ExitType::Continue);
    assert_eq!(h.state(), NptState::HookArmedInvisible);
}

#[test]
fn mmio_access_is_mapped_lazily() {
    let mut h = Harness::new();

    // Not-present fault far outside RAM; no state machine involvement.
    assert_eq!(h.npf(0xF800_0040, 0), ExitType::Continue);
    assert_eq!(h.state(), NptState::Off);

    // The access is retried, not skipped.
    assert_eq!(h.data.guest_vmcb.save_area.rip, 0);
}

#[test]
fn enable_disable_round_trip_returns_to_off() {
    let mut h = Harness::new();

    h.cpuid(CPUID_LEAF_CONTROL, CPUID_SUBLEAF_ENABLE_HOOKS);
    assert_eq!(h.state(), NptState::HookArmedInvisible);

    h.cpuid(CPUID_LEAF_CONTROL, CPUID_SUBLEAF_DISABLE_HOOKS);
    assert_eq!(h.state(), NptState::Off);
}

#[test]
fn control_leaf_is_ignored_outside_kernel_mode() {
    let mut h = Harness::new();

    h.data.guest_vmcb.save_area.ss_attrib = DPL_USER;
    assert_eq!(
        h.cpuid(CPUID_LEAF_CONTROL, CPUID_SUBLEAF_ENABLE_HOOKS),
        ExitType::IncrementRip
    );

    // Only the plain CPUID effect; hooks stay off.
    assert_eq!(h.state(), NptState::Off);
}

#[test]
fn vendor_leaf_reports_the_hypervisor() {
    let mut h = Harness::new();

    h.cpuid(0x4000_0000, 0);

    assert_eq!(h.regs.rax, 0x4000_0001);
    assert_eq!(h.regs.rbx, u32::from_le_bytes(*b"Simp") as u64);
    assert_eq!(h.regs.rcx, u32::from_le_bytes(*b"leSv") as u64);
    assert_eq!(h.regs.rdx, u32::from_le_bytes(*b"m   ") as u64);
}

#[test]
fn feature_leaf_sets_the_hypervisor_present_bit() {
    let mut h = Harness::new();

    h.cpuid(0x0000_0001, 0);

    assert_ne!(h.regs.rcx & (1 << 31), 0);
}

#[test]
fn interface_leaf_is_not_the_microsoft_interface() {
    let mut h = Harness::new();

    h.cpuid(0x4000_0001, 0);

    assert_eq!(h.regs.rax, u32::from_le_bytes(*b"Hv#0") as u64);
    assert_eq!(h.regs.rbx, 0);
}

#[test]
fn unload_reports_the_continuation_protocol() {
    let mut h = Harness::new();

    h.data.guest_vmcb.control_area.nrip = 0xFFFF_8000_0000_1234;
    h.data.guest_vmcb.save_area.rsp = 0xFFFF_8000_0000_9000;

    assert_eq!(
        h.cpuid(CPUID_LEAF_CONTROL, CPUID_SUBLEAF_UNLOAD),
        ExitType::ExitHypervisor
    );

    assert_eq!(h.regs.rbx, 0xFFFF_8000_0000_1234);
    assert_eq!(h.regs.rcx, 0xFFFF_8000_0000_9000);

    let data_va = &*h.data as *const ProcessorData as u64;
    assert_eq!(h.regs.rax | (h.regs.rdx << 32), data_va);
}

#[test]
fn clearing_efer_svme_injects_gp_without_completing() {
    let mut h = Harness::new();

    h.data.guest_vmcb.save_area.efer = EFER_SVME | 0x500;
    h.data.guest_vmcb.save_area.rip = 0x4000;
    h.data.guest_vmcb.control_area.nrip = 0x4002;
    h.data.guest_vmcb.control_area.exit_code = VMEXIT_MSR;
    h.data.guest_vmcb.control_area.exit_info1 = 1; // write
    h.regs.rcx = IA32_EFER as u64;
    h.regs.rdx = 0;

    // The guest RAX of the faulting WRMSR lives in the VMCB state save.
    h.data.guest_vmcb.save_area.rax = 0x500;

    assert_eq!(dispatch(&mut h.data, &mut h.regs), ExitType::Continue);

    assert_eq!(h.data.guest_vmcb.control_area.event_inj, GP_RECORD);
    assert_eq!(h.data.guest_vmcb.save_area.efer, EFER_SVME | 0x500);
    assert_eq!(h.data.guest_vmcb.save_area.rip, 0x4000);
}

#[test]
fn efer_writes_keeping_svme_go_through() {
    let mut h = Harness::new();

    h.data.guest_vmcb.control_area.nrip = 0x4002;
    h.data.guest_vmcb.control_area.exit_code = VMEXIT_MSR;
    h.data.guest_vmcb.control_area.exit_info1 = 1;
    h.regs.rcx = IA32_EFER as u64;
    h.regs.rdx = 0;
    h.data.guest_vmcb.save_area.rax = EFER_SVME | 0xD01;

    assert_eq!(dispatch(&mut h.data, &mut h.regs), ExitType::IncrementRip);

    assert_eq!(h.data.guest_vmcb.save_area.efer, EFER_SVME | 0xD01);
    assert_eq!(h.data.guest_vmcb.save_area.rip, 0x4002);
    assert_eq!(h.data.guest_vmcb.control_area.event_inj, 0);
}

#[test]
fn guest_vmrun_is_rejected_with_gp() {
    let mut h = Harness::new();

    h.data.guest_vmcb.control_area.exit_code = VMEXIT_VMRUN;
    assert_eq!(dispatch(&mut h.data, &mut h.regs), ExitType::Continue);
    assert_eq!(h.data.guest_vmcb.control_area.event_inj, GP_RECORD);
}

#[test]
#[should_panic(expected = "unhandled #VMEXIT")]
fn unexpected_exit_codes_are_fatal() {
    let mut h = Harness::new();

    h.data.guest_vmcb.control_area.exit_code = 0x7F; // shutdown
    dispatch(&mut h.data, &mut h.regs);
}

#[test]
fn any_walk_across_the_hook_ends_byte_identical_to_armed() {
    let mut h = Harness::new();

    h.cpuid(CPUID_LEAF_CONTROL, CPUID_SUBLEAF_ENABLE_HOOKS);
    let armed = h.hook_data.npt_mut().snapshot();

    // Bounce in and out of the hooked page a few times, ending outside it.
    let hook_pa = h.hook_pa;
    for pa in [hook_pa, 0x2000, hook_pa, 0x3000, hook_pa, 0x7000] {
        h.exec_fault(pa);

        // The active hook exists exactly while a hook page is visible.
        let visible = h.state() == NptState::HookExecVisible;
        assert_eq!(h.hook_data.active_hook().is_some(), visible);
        assert_eq!(visible, pa == hook_pa);
    }

    assert_eq!(h.state(), NptState::HookArmedInvisible);
    assert_eq!(armed, h.hook_data.npt_mut().snapshot());
}

#[test]
fn armed_state_keeps_original_backing_for_reads() {
    let mut h = Harness::new();

    h.cpuid(CPUID_LEAF_CONTROL, CPUID_SUBLEAF_ENABLE_HOOKS);

    // The leaf still points at the original frame, so any read through the
    // nested mapping sees clean bytes.
    let hook_pa = h.hook_pa;
    let leaf = h.hook_data.npt_mut().find(hook_pa).unwrap();
    assert_eq!(leaf.get_page_frame_number(), hook_pa >> 12);
    assert_eq!(leaf.get_no_execute(), 1);
    assert_ne!(unsafe { *(h.hook_va as *const u8) }, BREAKPOINT_OPCODE);
}

#[test]
fn foreign_breakpoints_reach_the_guest() {
    let mut h = Harness::new();

    h.data.guest_vmcb.save_area.rip = 0x9000;
    h.data.guest_vmcb.control_area.nrip = 0x9001;
    h.data.guest_vmcb.control_area.exit_code = VMEXIT_EXCEPTION_BP;

    assert_eq!(dispatch(&mut h.data, &mut h.regs), ExitType::Continue);

    // Vector 3, type exception, valid, no error code; RIP on the next
    // instruction.
    assert_eq!(h.data.guest_vmcb.control_area.event_inj, 3 | (3 << 8) | (1 << 31));
    assert_eq!(h.data.guest_vmcb.save_area.rip, 0x9001);
}
