use crate::svm::{
    data::{guest::GuestRegisters, processor_data::ProcessorData},
    events::EventInjection,
    msr::EFER_SVME,
    vmexit::ExitType,
};
use x86::msr::IA32_EFER;

/// Handles MSR access. The permissions map only intercepts write accesses to
/// EFER, so this protects EFER.SVME from being cleared by the guest.
pub fn handle_msr(data: &mut ProcessorData, regs: &mut GuestRegisters) -> ExitType {
    // 1 in EXITINFO1 indicates a write access.
    debug_assert_eq!(regs.rcx as u32, IA32_EFER);
    debug_assert_ne!(data.guest_vmcb.control_area.exit_info1, 0);

    let low_part = regs.rax & 0xFFFF_FFFF;
    let high_part = regs.rdx & 0xFFFF_FFFF;
    let value = high_part << 32 | low_part;

    // Inject #GP if the guest attempts to clear the SVME bit. Protection of
    // this bit is required because clearing it while the guest is running
    // leads to undefined behavior. The instruction is not completed in that
    // case.
    if value & EFER_SVME == 0 {
        EventInjection::gp().inject(&mut data.guest_vmcb);
        return ExitType::Continue;
    }

    // Otherwise, update the MSR as requested. Note that the value should be
    // checked not to allow any illegal values, and inject #GP as needed.
    // Otherwise, the hypervisor attempts to resume the guest with an illegal
    // EFER value and immediately receives #VMEXIT due to VMEXIT_INVALID. See
    // "Extended Feature Enable Register (EFER)" for what values are allowed.
    // This code does not implement the check intentionally, for simplicity.
    data.guest_vmcb.save_area.efer = value;

    ExitType::IncrementRip
}
