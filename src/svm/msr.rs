/// See `15.30.4 VM_HSAVE_PA MSR (C001_0117h)`.
pub const SVM_MSR_VM_HSAVE_PA: u32 = 0xC001_0117;

/// See `15.30.1 VM_CR MSR (C001_0114h)`.
pub const SVM_MSR_VM_CR: u32 = 0xC001_0114;
pub const SVM_VM_CR_SVMDIS: u64 = 1 << 4;

/// EFER.SVME, the gate for every SVM instruction.
pub const EFER_SVME: u64 = 1 << 12;
