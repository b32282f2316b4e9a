use crate::svm::{
    data::{guest::GuestRegisters, processor_data::ProcessorData},
    vmexit::ExitType,
};

/// Handles a nested page fault by running the hook state machine. No RIP
/// advance: the faulting instruction is retried once the permissions or the
/// mapping changed.
pub fn handle_npf(data: &mut ProcessorData, _regs: &mut GuestRegisters) -> ExitType {
    let hook_data = unsafe { &mut *data.host_stack_layout.hook_data };
    let registry = unsafe { &(*data.host_stack_layout.shared_data).registry };

    hook_data.handle_nested_page_fault(&mut data.guest_vmcb, registry);

    ExitType::Continue
}
