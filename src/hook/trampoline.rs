use crate::utils::host::host;
use core::ptr::NonNull;
use snafu::prelude::*;

#[derive(Debug, Snafu)]
pub enum TrampolineError {
    #[snafu(display("no supported byte pattern at {hook_va:#x}"))]
    UnsupportedPrefix { hook_va: u64 },

    #[snafu(display("the first instruction at {hook_va:#x} belongs to two pages"))]
    InstructionStraddlesPages { hook_va: u64 },

    #[snafu(display("failed to allocate {bytes} bytes of executable memory"))]
    AllocationFailed { bytes: usize },
}

/// A byte array that represents the below x64 code.
///  90               nop
///  ff2500000000     jmp     qword ptr cs:jmp_addr
/// jmp_addr:
///  0000000000000000 dq 0
#[repr(C, packed)]
struct JmpCode {
    nop: u8,
    jmp: [u8; 6],
    address: u64,
}
const_assert_eq!(core::mem::size_of::<JmpCode>(), 15);

impl JmpCode {
    fn new(destination: u64) -> Self {
        Self {
            nop: 0x90,
            jmp: [0xFF, 0x25, 0x00, 0x00, 0x00, 0x00],
            address: destination,
        }
    }
}

struct BytePattern {
    /// The actual instruction length in bytes.
    instruction_length: usize,

    /// How many of `bytes` take part in the match. Can be smaller than
    /// `instruction_length` when the trailing bytes are variable (immediates,
    /// displacements) and unnecessary for determination of the instruction.
    match_length: usize,

    bytes: [u8; 5],
}

/// The known function prologue openings. This is a deliberately simplistic
/// length disassembler: anything outside this table is refused at load time
/// rather than mis-measured at runtime.
static KNOWN_PATTERNS: [BytePattern; 8] = [
    // push rbx
    BytePattern {
        instruction_length: 2,
        match_length: 2,
        bytes: [0x40, 0x53, 0x00, 0x00, 0x00],
    },
    // push rbp
    BytePattern {
        instruction_length: 2,
        match_length: 2,
        bytes: [0x40, 0x55, 0x00, 0x00, 0x00],
    },
    // push rdi
    BytePattern {
        instruction_length: 2,
        match_length: 2,
        bytes: [0x40, 0x57, 0x00, 0x00, 0x00],
    },
    // sub rsp, imm8
    BytePattern {
        instruction_length: 4,
        match_length: 3,
        bytes: [0x48, 0x83, 0xEC, 0x00, 0x00],
    },
    // mov [rsp - 8 + arg_8], rdx
    BytePattern {
        instruction_length: 5,
        match_length: 5,
        bytes: [0x48, 0x89, 0x54, 0x24, 0x10],
    },
    // mov [rsp + offset], rbx
    BytePattern {
        instruction_length: 5,
        match_length: 4,
        bytes: [0x48, 0x89, 0x5C, 0x24, 0x00],
    },
    // mov rax, rsp
    BytePattern {
        instruction_length: 3,
        match_length: 3,
        bytes: [0x48, 0x8B, 0xC4, 0x00, 0x00],
    },
    // xor edx, edx
    BytePattern {
        instruction_length: 2,
        match_length: 2,
        bytes: [0x33, 0xD2, 0x00, 0x00, 0x00],
    },
];

/// Determines the length of the first instruction at `hook_va` by matching
/// against the known prologue patterns.
fn first_instruction_length(hook_va: u64) -> Option<usize> {
    for pattern in KNOWN_PATTERNS.iter() {
        let bytes = unsafe {
            core::slice::from_raw_parts(hook_va as *const u8, pattern.match_length)
        };

        if bytes == &pattern.bytes[..pattern.match_length] {
            return Some(pattern.instruction_length);
        }
    }

    None
}

/// An executable stub that reproduces the first instruction of a hooked
/// function and then jumps back to the remainder of it. Handlers call this
/// to invoke the original function while the hook is armed.
pub struct Trampoline {
    stub: NonNull<u8>,
    size: usize,
    instruction_length: usize,
}

impl Trampoline {
    pub fn new(hook_va: u64) -> Result<Self, TrampolineError> {
        // Determine the first instruction at the hook address, so that it
        // can safely be replaced with a breakpoint.
        let instruction_length = first_instruction_length(hook_va)
            .with_context(|| UnsupportedPrefixSnafu { hook_va })?;

        // Bail out if the instruction belongs to two pages.
        let last_byte = hook_va + instruction_length as u64 - 1;
        if last_byte & !0xFFF != hook_va & !0xFFF {
            return InstructionStraddlesPagesSnafu { hook_va }.fail();
        }

        let size = instruction_length + core::mem::size_of::<JmpCode>();
        let stub = host()
            .alloc_executable(size)
            .with_context(|| AllocationFailedSnafu { bytes: size })?;

        // Copy the first instruction, then append "jmp to the next
        // instruction of the hooked address".
        let jmp_code = JmpCode::new(hook_va + instruction_length as u64);
        unsafe {
            core::ptr::copy_nonoverlapping(
                hook_va as *const u8,
                stub.as_ptr(),
                instruction_length,
            );
            core::ptr::copy_nonoverlapping(
                &jmp_code as *const JmpCode as *const u8,
                stub.as_ptr().add(instruction_length),
                core::mem::size_of::<JmpCode>(),
            );
        }

        log::trace!(
            "Built original-call stub for {:#x} at {:p} (first instruction: {} bytes)",
            hook_va,
            stub.as_ptr(),
            instruction_length
        );

        Ok(Self {
            stub,
            size,
            instruction_length,
        })
    }

    /// The address handlers jump to in order to run the original function.
    pub fn address(&self) -> u64 {
        self.stub.as_ptr() as u64
    }

    pub fn instruction_length(&self) -> usize {
        self.instruction_length
    }
}

impl Drop for Trampoline {
    fn drop(&mut self) {
        unsafe { host().free_executable(self.stub, self.size) };
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::testing;

    #[test]
    fn push_rbx_prologue_produces_two_byte_copy() {
        testing::init_host();

        let page = testing::leak_page();
        page.0[0x10] = 0x40;
        page.0[0x11] = 0x53;

        let hook_va = page.0.as_ptr() as u64 + 0x10;
        let trampoline = Trampoline::new(hook_va).unwrap();

        assert_eq!(trampoline.instruction_length(), 2);

        let stub =
            unsafe { core::slice::from_raw_parts(trampoline.address() as *const u8, 2 + 15) };
        assert_eq!(&stub[..2], &[0x40, 0x53]);
        assert_eq!(&stub[2..9], &[0x90, 0xFF, 0x25, 0x00, 0x00, 0x00, 0x00]);
        assert_eq!(&stub[9..], &(hook_va + 2).to_le_bytes());
    }

    #[test]
    fn sub_rsp_matches_without_the_immediate() {
        testing::init_host();

        let page = testing::leak_page();
        page.0[..4].copy_from_slice(&[0x48, 0x83, 0xEC, 0x28]);

        let trampoline = Trampoline::new(page.0.as_ptr() as u64).unwrap();
        assert_eq!(trampoline.instruction_length(), 4);

        // The copied instruction includes the immediate.
        let stub = unsafe { core::slice::from_raw_parts(trampoline.address() as *const u8, 4) };
        assert_eq!(stub, &[0x48, 0x83, 0xEC, 0x28]);
    }

    #[test]
    fn unknown_prologue_is_refused() {
        testing::init_host();

        let page = testing::leak_page();
        page.0[..2].copy_from_slice(&[0xCC, 0xCC]);

        assert!(matches!(
            Trampoline::new(page.0.as_ptr() as u64),
            Err(TrampolineError::UnsupportedPrefix { .. })
        ));
    }

    #[test]
    fn instruction_crossing_a_page_boundary_is_refused() {
        testing::init_host();

        let region = testing::leak_pages();
        // 4-byte `sub rsp, imm8` whose last byte lands on the next page.
        region.0[0xFFD..0x1001].copy_from_slice(&[0x48, 0x83, 0xEC, 0x28]);

        assert!(matches!(
            Trampoline::new(region.0.as_ptr() as u64 + 0xFFD),
            Err(TrampolineError::InstructionStraddlesPages { .. })
        ));
    }
}
