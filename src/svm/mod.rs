use crate::{
    hook::{
        engine::HookData, physmem::PhysicalMemoryDescriptor, HookDescriptor, HookRegistry,
        RegistrationError,
    },
    svm::{
        data::{processor_data::ProcessorData, shared_data::SharedData},
        support::SupportError,
    },
};
use alloc::{boxed::Box, vec::Vec};
use snafu::prelude::*;

pub mod data;
pub mod events;
pub mod msr;
pub mod paging;
pub mod support;
pub mod vmcb;
pub mod vmexit;
pub mod vmlaunch;

#[derive(Debug, Snafu)]
pub enum HypervisorError {
    #[snafu(display("hook registration failed"))]
    Registration { source: RegistrationError },

    #[snafu(display("this host cannot be virtualized"))]
    Unsupported { source: SupportError },

    #[snafu(display("out of memory during initialization"))]
    OutOfMemory,

    #[snafu(display("failed to switch to processor {index}"))]
    ProcessorSwitchFailed { index: u32 },
}

/// A virtual processor: its VMCBs, host stack and hook state machine.
pub struct Processor {
    index: u32,
    processor_data: Option<Box<ProcessorData>>,
    hook_data: Option<Box<HookData>>,
}

impl Processor {
    pub fn new(index: u32) -> Self {
        Self {
            index,
            processor_data: None,
            hook_data: None,
        }
    }

    pub fn id(&self) -> u32 {
        self.index
    }
}

/// The hypervisor: hooks, trampolines and shared configuration, plus one
/// [`Processor`] per virtualized logical processor.
pub struct Hypervisor {
    shared_data: Box<SharedData>,
    processors: Vec<Processor>,
}

impl Hypervisor {
    /// Builds the hook registry, the original-call stubs and the exec pages.
    /// Hooks are installed but stay inactive until enabled through the CPUID
    /// control leaf.
    pub fn new(
        hooks: &[HookDescriptor],
        resolve: impl Fn(&str) -> Option<u64>,
        memory_descriptor: PhysicalMemoryDescriptor,
    ) -> Result<Self, HypervisorError> {
        let registry = HookRegistry::new(hooks, resolve).context(RegistrationSnafu)?;
        let shared_data =
            SharedData::new(registry, memory_descriptor).context(OutOfMemorySnafu)?;

        Ok(Self {
            shared_data,
            processors: Vec::new(),
        })
    }

    pub fn registry(&self) -> &HookRegistry {
        &self.shared_data.registry
    }

    pub fn shared_data(&mut self) -> &mut SharedData {
        &mut self.shared_data
    }
}

#[cfg(target_os = "windows")]
mod orchestration {
    use super::*;
    use crate::{
        nt::processor::{processor_count, ProcessorExecutor},
        svm::{
            msr::EFER_SVME,
            support,
            vmexit::cpuid::{
                CPUID_LEAF_CONTROL, CPUID_SUBLEAF_DISABLE_HOOKS, CPUID_SUBLEAF_ENABLE_HOOKS,
                CPUID_SUBLEAF_UNLOAD,
            },
            vmlaunch::{launch_vm, Context},
        },
    };
    use x86::{
        cpuid::cpuid,
        msr::{rdmsr, wrmsr, IA32_APIC_BASE, IA32_EFER},
    };

    /// 'MVSS', returned in RCX by the unload back-door of a virtualized
    /// processor.
    const UNLOAD_TAG: u64 = 0x4D56_5353;

    /// The page frame of the local APIC registers, bits 12-35 of the APIC
    /// base MSR.
    const APIC_BASE_PAGE_MASK: u64 = 0x000F_FFFF_F000;

    impl Hypervisor {
        /// Virtualizes every logical processor in turn.
        pub fn virtualize(&mut self) -> Result<(), HypervisorError> {
            support::check_svm_support().context(UnsupportedSnafu)?;

            log::info!("Virtualizing {} processors", processor_count());

            for index in 0..processor_count() {
                let Some(executor) = ProcessorExecutor::switch_to_processor(index) else {
                    self.devirtualize();
                    return ProcessorSwitchFailedSnafu { index }.fail();
                };

                let mut processor = Processor::new(index);
                if let Err(error) = processor.virtualize(&mut self.shared_data) {
                    log::error!("Failed to virtualize processor {index}");
                    self.devirtualize();
                    return Err(error);
                }

                self.processors.push(processor);
                core::mem::drop(executor);
            }

            Ok(())
        }

        /// Devirtualizes every processor that was virtualized, via the CPUID
        /// back-door.
        pub fn devirtualize(&mut self) {
            for processor in self.processors.iter_mut() {
                let Some(executor) = ProcessorExecutor::switch_to_processor(processor.id())
                else {
                    log::error!("Failed to switch to processor {}", processor.id());
                    continue;
                };

                processor.devirtualize();
                core::mem::drop(executor);
            }

            self.processors.clear();
            self.shared_data.registry.report_activity();
        }

        /// Makes every hook invisible and active on all processors.
        pub fn enable_hooks(&mut self) {
            self.control_on_each_processor(CPUID_SUBLEAF_ENABLE_HOOKS);
        }

        /// Returns every hooked page to its plain state on all processors.
        pub fn disable_hooks(&mut self) {
            self.control_on_each_processor(CPUID_SUBLEAF_DISABLE_HOOKS);
        }

        fn control_on_each_processor(&mut self, subleaf: u32) {
            for processor in self.processors.iter() {
                let Some(executor) = ProcessorExecutor::switch_to_processor(processor.id())
                else {
                    log::error!("Failed to switch to processor {}", processor.id());
                    continue;
                };

                let _ = cpuid!(CPUID_LEAF_CONTROL, subleaf);
                core::mem::drop(executor);
            }
        }
    }

    impl Processor {
        /// Virtualizes the current processor. The guest resumes transparently
        /// right behind the captured context.
        pub fn virtualize(
            &mut self,
            shared_data: &mut SharedData,
        ) -> Result<(), HypervisorError> {
            log::info!("Virtualizing processor {}", self.index);

            // IMPORTANT: the context has to be captured right here so that
            // `launch_vm` continues the execution of the current flow at
            // this exact point. Once the processor is virtualized, execution
            // falls out of the `is_virtualized` check below as the guest.
            let context = Context::capture();

            if support::is_virtualized(self.index) {
                return Ok(());
            }

            support::set_virtualized(self.index);

            // Enable SVM by setting EFER.SVME.
            unsafe { wrmsr(IA32_EFER, rdmsr(IA32_EFER) | EFER_SVME) };

            let apic_base_pa = unsafe { rdmsr(IA32_APIC_BASE) } & APIC_BASE_PAGE_MASK;
            let mut hook_data =
                HookData::new(&shared_data.memory_descriptor, apic_base_pa)
                    .context(OutOfMemorySnafu)?;

            let mut processor_data = ProcessorData::new();
            processor_data.configure(shared_data, &mut hook_data);
            processor_data.prepare_for_virtualization(&context);

            let host_rsp =
                &mut processor_data.host_stack_layout.guest_vmcb_pa as *mut u64;

            self.hook_data = Some(hook_data);
            self.processor_data = Some(processor_data);

            // Does not return; execution continues as the guest at the
            // captured context.
            unsafe { launch_vm(host_rsp) };
            unreachable!();
        }

        /// Devirtualizes the current processor if it is virtualized.
        pub fn devirtualize(&mut self) {
            let result = cpuid!(CPUID_LEAF_CONTROL, CPUID_SUBLEAF_UNLOAD);
            if result.ecx as u64 != UNLOAD_TAG {
                log::info!("Processor {} was not virtualized", self.index);
                return;
            }

            support::clear_virtualized(self.index);
            log::info!("Processor {} has been devirtualized", self.index);

            self.hook_data = None;
            self.processor_data = None;
        }
    }
}
