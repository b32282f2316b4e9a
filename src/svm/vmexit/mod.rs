use crate::{
    svm::{
        data::{guest::GuestRegisters, processor_data::ProcessorData},
        events::EventInjection,
        msr::EFER_SVME,
        vmcb::control_area::{
            VMEXIT_CPUID, VMEXIT_EXCEPTION_BP, VMEXIT_MSR, VMEXIT_NPF, VMEXIT_VMRUN,
        },
    },
    utils::addresses::physical_address,
};
use core::arch::asm;
use core::ptr::NonNull;
use x86::msr::{rdmsr, wrmsr, IA32_EFER};

pub mod bp;
pub mod cpuid;
pub mod msr;
pub mod npf;

#[derive(Debug, PartialOrd, PartialEq, Eq, Clone, Copy)]
pub enum ExitType {
    /// Tear the hypervisor down and resume the guest bare.
    ExitHypervisor,

    /// Advance RIP past the intercepted instruction.
    IncrementRip,

    /// Retry the faulting instruction or deliver an injected event.
    Continue,
}

/// Routes a #VMEXIT to its handler and applies the resulting RIP/RAX
/// bookkeeping. Everything here operates purely on the VMCB and the spilled
/// register block.
pub fn dispatch(data: &mut ProcessorData, guest_regs: &mut GuestRegisters) -> ExitType {
    // Guest's RAX is overwritten by the host's value on #VMEXIT and saved in
    // the VMCB instead. Reflect the guest RAX to the context.
    guest_regs.rax = data.guest_vmcb.save_area.rax;

    let exit_type = match data.guest_vmcb.control_area.exit_code {
        VMEXIT_CPUID => cpuid::handle_cpuid(data, guest_regs),
        VMEXIT_MSR => msr::handle_msr(data, guest_regs),
        VMEXIT_EXCEPTION_BP => bp::handle_bp(data, guest_regs),
        VMEXIT_NPF => npf::handle_npf(data, guest_regs),
        VMEXIT_VMRUN => {
            // The guest is forbidden from nested SVM.
            EventInjection::gp().inject(&mut data.guest_vmcb);
            ExitType::Continue
        }
        code => panic!("unhandled #VMEXIT: {code:#x}"),
    };

    match exit_type {
        ExitType::ExitHypervisor => {
            // Set return values of the back-door CPUID as follows:
            //  RBX     = an address to continue at
            //  RCX     = a stack pointer to restore
            //  EDX:EAX = an address of the per-processor data, for the
            //            caller to free
            let data_va = data as *mut ProcessorData as u64;
            guest_regs.rax = data_va & 0xFFFF_FFFF;
            guest_regs.rdx = data_va >> 32;

            guest_regs.rbx = data.guest_vmcb.control_area.nrip;
            guest_regs.rcx = data.guest_vmcb.save_area.rsp;
        }
        ExitType::IncrementRip => {
            // Reflect the potentially updated guest RAX to the VMCB; unlike
            // the other GPRs, RAX is loaded from the VMCB on VMRUN. Then
            // advance RIP to "complete" the instruction.
            data.guest_vmcb.save_area.rax = guest_regs.rax;
            data.guest_vmcb.save_area.rip = data.guest_vmcb.control_area.nrip;
        }
        ExitType::Continue => {
            data.guest_vmcb.save_area.rax = guest_regs.rax;
        }
    }

    exit_type
}

/// Undoes virtualization from inside the #VMEXIT path: loads the guest
/// state, re-enables GIF with interrupts still masked, clears EFER.SVME and
/// restores the guest RFLAGS. The assembly loop then restores RSP and jumps
/// back into the guest.
unsafe fn exit_hypervisor(data: &mut ProcessorData) {
    // Load guest state (currently host state is loaded).
    let guest_vmcb_pa = physical_address(&data.guest_vmcb as *const _ as _).as_u64();
    asm!("vmload rax", in("rax") guest_vmcb_pa);

    // Set the global interrupt flag (GIF) but still disable interrupts by
    // clearing IF. GIF must be set to return to the normal execution, but
    // interruptions are not desirable until SVM is disabled as it would
    // execute random kernel code in the host context.
    asm!("cli");
    asm!("stgi");

    // Disable SVM.
    let msr = rdmsr(IA32_EFER) & !EFER_SVME;
    wrmsr(IA32_EFER, msr);

    // Restore the guest RFLAGS; some of the arithmetic flags are destroyed
    // by the subsequent code.
    asm!("push {}; popfq", in(reg) data.guest_vmcb.save_area.rflags);
}

/// C-level entry point of the host, called from the #VMEXIT assembly.
///
/// Interrupts are disabled when this function is called due to the cleared
/// GIF. Not all host state is loaded yet, so do that with the VMLOAD
/// instruction first.
///
/// # Safety
///
/// Both pointers come from the assembly loop and are valid by construction.
#[no_mangle]
unsafe extern "win64" fn handle_vmexit(
    mut data: NonNull<ProcessorData>,
    mut guest_regs: NonNull<GuestRegisters>,
) -> u8 {
    let data = data.as_mut();
    let guest_regs = guest_regs.as_mut();

    // Load host state that is not loaded on #VMEXIT.
    asm!("vmload rax", in("rax") data.host_stack_layout.host_vmcb_pa);
    debug_assert_eq!(data.host_stack_layout.reserved_1, u64::MAX);

    let exit_type = dispatch(data, guest_regs);
    if exit_type == ExitType::ExitHypervisor {
        exit_hypervisor(data);
    }

    (exit_type == ExitType::ExitHypervisor) as u8
}
