//! Checks whether the current system is able to run the hypervisor.

use crate::svm::msr::{SVM_MSR_VM_CR, SVM_VM_CR_SVMDIS};
use core::sync::atomic::{AtomicU64, Ordering};
use snafu::prelude::*;
use x86::{cpuid::CpuId, msr::rdmsr};

#[derive(Debug, Snafu)]
pub enum SupportError {
    #[snafu(display("the processor does not support SVM"))]
    SvmUnsupported,

    #[snafu(display("the processor does not support nested paging"))]
    NestedPagingUnsupported,

    #[snafu(display("SVM is disabled at BIOS and locked; change the platform firmware setting"))]
    SvmLockedAtBios,

    #[snafu(display("SVM is disabled with a key; consult platform firmware or TPM"))]
    SvmDisabledWithKey,
}

/// Checks that the processor can run this hypervisor.
///
/// # Recommended Algorithm
/// This algorithm has been taken from section `15.4 Enabling SVM` of the AMD
/// manual.
/// ```pseudocode
/// if (CPUID Fn8000_0001_ECX[SVM] == 0)
///     return SVM_NOT_AVAIL;
///
/// if (VM_CR.SVMDIS == 0)
///     return SVM_ALLOWED;
///
/// if (CPUID Fn8000_000A_EDX[SVML]==0)
///     return SVM_DISABLED_AT_BIOS_NOT_UNLOCKABLE
///     // the user must change a platform firmware setting to enable SVM
/// else
///     return SVM_DISABLED_WITH_KEY;
///     // SVMLock may be unlockable; consult platform firmware or TPM to obtain the key.
/// ```
pub fn check_svm_support() -> Result<(), SupportError> {
    let cpuid = CpuId::new();

    // Check `CPUID Fn8000_0001_ECX[SVM]`.
    let has_svm = cpuid
        .get_extended_processor_and_feature_identifiers()
        .map(|features| features.has_svm())
        .unwrap_or_default();
    ensure!(has_svm, SvmUnsupportedSnafu);

    // The backing-page swap lives and dies with nested paging.
    let has_nested_paging = cpuid
        .get_svm_info()
        .map(|svm_info| svm_info.has_nested_paging())
        .unwrap_or_default();
    ensure!(has_nested_paging, NestedPagingUnsupportedSnafu);

    // Check `VM_CR.SVMDIS`.
    let vm_cr = unsafe { rdmsr(SVM_MSR_VM_CR) };
    if (vm_cr & SVM_VM_CR_SVMDIS) == 0 {
        return Ok(());
    }

    // Check `CPUID Fn8000_000A_EDX[SVML]`.
    let has_svm_lock = cpuid
        .get_svm_info()
        .map(|svm_info| svm_info.has_svm_lock())
        .unwrap_or_default();

    if has_svm_lock {
        SvmDisabledWithKeySnafu.fail()
    } else {
        SvmLockedAtBiosSnafu.fail()
    }
}

/// The bitmap used to track which processor has been virtualized.
static VIRTUALIZED_BITSET: AtomicU64 = AtomicU64::new(0);

/// Checks whether the specified processor is already virtualized.
pub fn is_virtualized(index: u32) -> bool {
    VIRTUALIZED_BITSET.load(Ordering::Relaxed) & (1 << index) != 0
}

/// Marks the specified processor as virtualized.
pub fn set_virtualized(index: u32) {
    VIRTUALIZED_BITSET.fetch_or(1 << index, Ordering::Relaxed);
}

/// Marks the specified processor as no longer virtualized.
pub fn clear_virtualized(index: u32) {
    VIRTUALIZED_BITSET.fetch_and(!(1 << index), Ordering::Relaxed);
}
