use crate::{
    hook::{physmem::PhysicalMemoryDescriptor, HookRegistry},
    svm::data::msr_bitmap::MsrBitmap,
};
use alloc::boxed::Box;

/// Data shared read-only by every virtualized processor: the hook registry,
/// the MSR permissions map, and the RAM layout the per-processor nested page
/// tables are built from.
pub struct SharedData {
    pub msr_bitmap: MsrBitmap,
    pub registry: HookRegistry,
    pub memory_descriptor: PhysicalMemoryDescriptor,
}

impl SharedData {
    pub fn new(
        registry: HookRegistry,
        memory_descriptor: PhysicalMemoryDescriptor,
    ) -> Option<Box<Self>> {
        Some(Box::new(Self {
            msr_bitmap: MsrBitmap::new()?,
            registry,
            memory_descriptor,
        }))
    }
}
