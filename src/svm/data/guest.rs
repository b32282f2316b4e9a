/// The general-purpose registers of the guest, as spilled by the #VMEXIT
/// assembly.
///
/// The field order matches the push sequence exactly: RAX is pushed first and
/// R15 last, so R15 sits at the lowest address. RSP is a dummy slot; the real
/// guest RSP lives in the VMCB state-save area. RAX is special as well: the
/// processor saves the guest value into the VMCB on #VMEXIT and reloads it on
/// VMRUN, so the dispatcher copies it between this block and the VMCB at its
/// boundaries.
#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
pub struct GuestRegisters {
    pub r15: u64,
    pub r14: u64,
    pub r13: u64,
    pub r12: u64,
    pub r11: u64,
    pub r10: u64,
    pub r9: u64,
    pub r8: u64,
    pub rdi: u64,
    pub rsi: u64,
    pub rbp: u64,
    pub rsp: u64,
    pub rbx: u64,
    pub rdx: u64,
    pub rcx: u64,
    pub rax: u64,
}
const_assert_eq!(core::mem::size_of::<GuestRegisters>(), 0x80);
