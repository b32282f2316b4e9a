use crate::svm::{
    data::{guest::GuestRegisters, processor_data::ProcessorData},
    vmexit::ExitType,
};
use x86::cpuid::cpuid;

pub const CPUID_PROCESSOR_AND_PROCESSOR_FEATURE_IDENTIFIERS: u32 = 0x0000_0001;
pub const CPUID_HV_VENDOR_AND_MAX_FUNCTIONS: u32 = 0x4000_0000;
pub const CPUID_HV_INTERFACE: u32 = 0x4000_0001;
pub const CPUID_HV_MAX: u32 = CPUID_HV_INTERFACE;

/// The control leaf. Only honored from CPL 0; anything else sees plain CPUID
/// results.
pub const CPUID_LEAF_CONTROL: u32 = 0x4141_4141;
pub const CPUID_SUBLEAF_UNLOAD: u32 = 0x4141_4141;
pub const CPUID_SUBLEAF_ENABLE_HOOKS: u32 = 0x4141_4142;
pub const CPUID_SUBLEAF_DISABLE_HOOKS: u32 = 0x4141_4143;

const CPUID_FN0000_0001_ECX_HYPERVISOR_PRESENT: u32 = 1 << 31;

const DPL_SYSTEM: u16 = 0;

/// Handles CPUID: forwards to the hardware, then rewrites the few leaves
/// that advertise the hypervisor, and runs the control protocol.
pub fn handle_cpuid(data: &mut ProcessorData, regs: &mut GuestRegisters) -> ExitType {
    // Execute CPUID as requested.
    let leaf = regs.rax as u32;
    let subleaf = regs.rcx as u32;
    let mut result = cpuid!(leaf, subleaf);

    match leaf {
        CPUID_PROCESSOR_AND_PROCESSOR_FEATURE_IDENTIFIERS => {
            // Indicate presence of a hypervisor by setting the bit that is
            // reserved for use by hypervisors to indicate guest status. See
            // "CPUID Fn0000_0001_ECX Feature Identifiers".
            result.ecx |= CPUID_FN0000_0001_ECX_HYPERVISOR_PRESENT;
        }
        CPUID_HV_VENDOR_AND_MAX_FUNCTIONS => {
            // Return the maximum supported hypervisor CPUID leaf range and a
            // vendor ID signature, as the hypervisor CPUID convention
            // requires.
            result.eax = CPUID_HV_MAX;
            result.ebx = u32::from_le_bytes(*b"Simp"); // "SimpleSvm   "
            result.ecx = u32::from_le_bytes(*b"leSv");
            result.edx = u32::from_le_bytes(*b"m   ");
        }
        CPUID_HV_INTERFACE => {
            // Return a non Hv#1 value, indicating that this hypervisor does
            // NOT conform to the Microsoft hypervisor interface.
            result.eax = u32::from_le_bytes(*b"Hv#0");
            result.ebx = 0;
            result.ecx = 0;
            result.edx = 0;
        }
        CPUID_LEAF_CONTROL => {
            // Only accept requests from kernel mode.
            if data.guest_vmcb.save_area.ss_dpl() == DPL_SYSTEM {
                match subleaf {
                    CPUID_SUBLEAF_UNLOAD => return ExitType::ExitHypervisor,
                    CPUID_SUBLEAF_ENABLE_HOOKS => {
                        let hook_data = unsafe { &mut *data.host_stack_layout.hook_data };
                        hook_data.enable_hooks(&data.shared_data().registry);
                    }
                    CPUID_SUBLEAF_DISABLE_HOOKS => {
                        let hook_data = unsafe { &mut *data.host_stack_layout.hook_data };
                        hook_data.disable_hooks(&data.shared_data().registry);
                    }
                    _ => log::warn!("unknown control subleaf: {subleaf:#x}"),
                }
            }
        }
        _ => {}
    }

    // Update the guest's GPRs with the results.
    regs.rax = result.eax as u64;
    regs.rbx = result.ebx as u64;
    regs.rcx = result.ecx as u64;
    regs.rdx = result.edx as u64;

    ExitType::IncrementRip
}
