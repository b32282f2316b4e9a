use crate::svm::{
    data::{guest::GuestRegisters, processor_data::ProcessorData},
    vmexit::ExitType,
};

/// Handles the intercepted #BP exception by handing it to the hook engine:
/// the guest resumes either in a hook handler or with the exception
/// reflected back at it.
pub fn handle_bp(data: &mut ProcessorData, _regs: &mut GuestRegisters) -> ExitType {
    let hook_data = unsafe { &mut *data.host_stack_layout.hook_data };
    let registry = unsafe { &(*data.host_stack_layout.shared_data).registry };

    hook_data.handle_breakpoint(&mut data.guest_vmcb, registry);

    ExitType::Continue
}
