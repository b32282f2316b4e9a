//! Glue to the NT kernel: FFI declarations, the kernel-backed host
//! services, processor affinity switching, and symbol resolution.

use crate::nt::include::{MmGetSystemRoutineAddress, UNICODE_STRING};

pub mod include;
pub mod memory;
pub mod processor;

pub use memory::{physical_memory_descriptor, register_host, NtHost};

/// Resolves an exported NT kernel symbol to its virtual address.
pub fn resolve_system_routine(name: &str) -> Option<u64> {
    // Exported routine names are short ASCII; anything longer is not ours.
    let mut buffer = [0u16; 128];
    if name.len() >= buffer.len() {
        return None;
    }

    for (slot, unit) in buffer.iter_mut().zip(name.encode_utf16()) {
        *slot = unit;
    }

    let mut unicode = UNICODE_STRING {
        Length: (name.len() * 2) as u16,
        MaximumLength: (name.len() * 2 + 2) as u16,
        Buffer: buffer.as_mut_ptr(),
    };

    let address = unsafe { MmGetSystemRoutineAddress(&mut unicode) };
    if address.is_null() {
        log::error!("Could not find the exported routine: {}", name);
        return None;
    }

    Some(address as u64)
}
