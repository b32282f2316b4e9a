use crate::{
    hook::engine::HookData,
    svm::{
        data::shared_data::SharedData,
        vmcb::{
            control_area::{ExceptionVector, InterceptMisc1, InterceptMisc2, NpEnable},
            Vmcb,
        },
    },
    utils::addresses::physical_address,
};
use alloc::boxed::Box;
use x86::bits64::paging::BASE_PAGE_SIZE;

pub const KERNEL_STACK_SIZE: usize = 0x6000;
pub const STACK_CONTENTS_SIZE: usize = KERNEL_STACK_SIZE - core::mem::size_of::<u64>() * 8;

/// The host stack of one processor. The #VMEXIT assembly runs on
/// `stack_contents` and finds everything it needs at the fixed offsets
/// above it, starting with `guest_vmcb_pa` which HostRsp points at.
#[repr(C, align(4096))]
pub struct HostStackLayout {
    pub stack_contents: [u8; STACK_CONTENTS_SIZE],

    /// HostRsp.
    pub guest_vmcb_pa: u64,
    pub host_vmcb_pa: u64,

    pub self_data: *mut ProcessorData,
    pub shared_data: *mut SharedData,
    pub hook_data: *mut HookData,

    /// Keeps HostRsp 16 bytes aligned.
    pub padding_1: u64,
    pub padding_2: u64,
    pub reserved_1: u64,
}
const_assert_eq!(core::mem::size_of::<HostStackLayout>(), KERNEL_STACK_SIZE);

/// The data for a single virtual processor.
///
/// ```text
///  Low     HostStackLimit[0]                        StackLimit
///  ^       ...
///  ^       HostStackLimit[KERNEL_STACK_SIZE - 2]    StackBase
///  High    HostStackLimit[KERNEL_STACK_SIZE - 1]    StackBase
/// ```
#[repr(C, align(4096))]
pub struct ProcessorData {
    pub host_stack_layout: HostStackLayout,
    pub guest_vmcb: Vmcb,
    pub host_vmcb: Vmcb,
    pub host_state_area: [u8; BASE_PAGE_SIZE],
}
const_assert_eq!(
    core::mem::size_of::<ProcessorData>(),
    KERNEL_STACK_SIZE + 3 * BASE_PAGE_SIZE
);

impl ProcessorData {
    pub fn new() -> Box<Self> {
        unsafe { Box::new_zeroed().assume_init() }
    }

    /// Wires up the interceptions and nested paging for this processor.
    ///
    /// Everything the engine relies on is unconditional: #BP for hook
    /// delivery, CPUID for the control interface, MSR protection for EFER,
    /// VMRUN because nested SVM is forbidden, and nested paging itself.
    pub fn configure(&mut self, shared_data: &mut SharedData, hook_data: &mut HookData) {
        let guest_vmcb_pa = physical_address(&self.guest_vmcb as *const _ as _);
        let host_vmcb_pa = physical_address(&self.host_vmcb as *const _ as _);

        let control = &mut self.guest_vmcb.control_area;
        control
            .intercept_exception
            .insert(ExceptionVector::BREAKPOINT);
        control
            .intercept_misc1
            .insert(InterceptMisc1::INTERCEPT_CPUID | InterceptMisc1::INTERCEPT_MSR_PROT);
        control
            .intercept_misc2
            .insert(InterceptMisc2::INTERCEPT_VMRUN);

        control.msrpm_base_pa = shared_data.msr_bitmap.pa().as_u64();

        // Specify the guest's address space ID (ASID). TLB is maintained by
        // the ID for guests. Use the same value for all processors since all
        // of them run a single guest in our case. Use 1 as the most likely
        // supported ASID by the processor. The actual supported number of
        // ASIDs can be obtained with CPUID. See "CPUID Fn8000_000A_EBX SVM
        // Revision and Feature Identification". Zero of ASID is reserved and
        // illegal.
        control.guest_asid = 1;

        control.np_enable.insert(NpEnable::NESTED_PAGING);
        control.ncr3 = hook_data.pml4_pa().as_u64();

        // Store everything the #VMEXIT assembly and the dispatcher need at
        // the fixed stack offsets.
        self.host_stack_layout.guest_vmcb_pa = guest_vmcb_pa.as_u64();
        self.host_stack_layout.host_vmcb_pa = host_vmcb_pa.as_u64();
        self.host_stack_layout.self_data = self as *mut _;
        self.host_stack_layout.shared_data = shared_data as *mut _;
        self.host_stack_layout.hook_data = hook_data as *mut _;
        self.host_stack_layout.reserved_1 = u64::MAX;
    }

    /// Captures the running system as the initial guest state and saves the
    /// host state, right before the first VMRUN.
    pub fn prepare_for_virtualization(&mut self, context: &crate::svm::vmlaunch::Context) {
        use crate::svm::msr::SVM_MSR_VM_HSAVE_PA;
        use core::arch::asm;
        use x86::msr::wrmsr;

        self.guest_vmcb.save_area.build(context);

        // Save some of the current state on the VMCB; the rest is loaded by
        // VMLOAD. See `15.5.2 VMSAVE and VMLOAD Instructions`.
        unsafe { asm!("vmsave rax", in("rax") self.host_stack_layout.guest_vmcb_pa) };

        // Set the physical address for the VMRUN instruction, which saves
        // the current host state there.
        let host_state_area_pa = physical_address(self.host_state_area.as_ptr() as _);
        unsafe { wrmsr(SVM_MSR_VM_HSAVE_PA, host_state_area_pa.as_u64()) };

        // Also save the current state for the host.
        unsafe { asm!("vmsave rax", in("rax") self.host_stack_layout.host_vmcb_pa) };
    }

    /// The hook state machine of this processor. Usable from the #VMEXIT
    /// path only after [`configure`] ran.
    ///
    /// [`configure`]: Self::configure
    pub fn hook_data(&mut self) -> &mut HookData {
        unsafe { &mut *self.host_stack_layout.hook_data }
    }

    pub fn shared_data(&self) -> &SharedData {
        unsafe { &*self.host_stack_layout.shared_data }
    }
}
