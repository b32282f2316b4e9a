use bitflags::bitflags;

// Size: 0x400
#[repr(C)]
pub struct ControlArea {
    pub intercept_cr_read: u16,   // +0x000
    pub intercept_cr_write: u16,  // +0x002
    pub intercept_dr_read: u16,   // +0x004
    pub intercept_dr_write: u16,  // +0x006
    pub intercept_exception: ExceptionVector, // +0x008

    pub intercept_misc1: InterceptMisc1,     // +0x00c
    pub intercept_misc2: InterceptMisc2,     // +0x010
    pub reserved1: [u8; 0x03C - 0x014],      // +0x014
    pub pause_filter_threshold: u16,         // +0x03c
    pub pause_filter_count: u16,             // +0x03e
    pub iopm_base_pa: u64,                   // +0x040
    pub msrpm_base_pa: u64,                  // +0x048
    pub tsc_offset: u64,                     // +0x050
    pub guest_asid: u32,                     // +0x058
    pub tlb_control: TlbControl,             // +0x05c
    pub vintr: u64,                          // +0x060
    pub interrupt_shadow: u64,               // +0x068
    pub exit_code: u64,                      // +0x070
    pub exit_info1: u64,                     // +0x078
    pub exit_info2: u64,                     // +0x080
    pub exit_int_info: u64,                  // +0x088
    pub np_enable: NpEnable,                 // +0x090
    pub avic_apic_bar: u64,                  // +0x098
    pub guest_pa_of_ghcb: u64,               // +0x0a0
    pub event_inj: u64,                      // +0x0a8
    pub ncr3: u64,                           // +0x0b0
    pub lbr_virtualization_enable: u64,      // +0x0b8
    pub vmcb_clean: VmcbClean,               // +0x0c0
    pub nrip: u64,                           // +0x0c8
    pub num_of_bytes_fetched: u8,            // +0x0d0
    pub guest_instruction_bytes: [u8; 15],   // +0x0d1
    pub avic_apic_backing_page_pointer: u64, // +0x0e0
    pub reserved2: u64,                      // +0x0e8
    pub avic_logical_table_pointer: u64,     // +0x0f0
    pub avic_physical_table_pointer: u64,    // +0x0f8
    pub reserved3: u64,                      // +0x100
    pub vmcb_save_state_pointer: u64,        // +0x108
    pub reserved4: [u8; 0x400 - 0x110],      // +0x110
}
const_assert_eq!(core::mem::size_of::<ControlArea>(), 0x400);

/// `#VMEXIT` codes. See `Appendix C SVM Intercept Exit Codes`. Only a
/// handful are ever routed; everything else arriving at the dispatcher is a
/// configuration bug and therefore fatal.
pub const VMEXIT_CR0_READ: u64 = 0x00;
pub const VMEXIT_CR3_READ: u64 = 0x03;
pub const VMEXIT_CR4_READ: u64 = 0x04;
pub const VMEXIT_CR0_WRITE: u64 = 0x10;
pub const VMEXIT_CR3_WRITE: u64 = 0x13;
pub const VMEXIT_CR4_WRITE: u64 = 0x14;
pub const VMEXIT_EXCEPTION_DE: u64 = 0x40;
pub const VMEXIT_EXCEPTION_DB: u64 = 0x41;
pub const VMEXIT_EXCEPTION_NMI: u64 = 0x42;
pub const VMEXIT_EXCEPTION_BP: u64 = 0x43;
pub const VMEXIT_EXCEPTION_OF: u64 = 0x44;
pub const VMEXIT_EXCEPTION_BR: u64 = 0x45;
pub const VMEXIT_EXCEPTION_UD: u64 = 0x46;
pub const VMEXIT_EXCEPTION_NM: u64 = 0x47;
pub const VMEXIT_EXCEPTION_DF: u64 = 0x48;
pub const VMEXIT_EXCEPTION_TS: u64 = 0x4A;
pub const VMEXIT_EXCEPTION_NP: u64 = 0x4B;
pub const VMEXIT_EXCEPTION_SS: u64 = 0x4C;
pub const VMEXIT_EXCEPTION_GP: u64 = 0x4D;
pub const VMEXIT_EXCEPTION_PF: u64 = 0x4E;
pub const VMEXIT_EXCEPTION_MF: u64 = 0x50;
pub const VMEXIT_EXCEPTION_AC: u64 = 0x51;
pub const VMEXIT_EXCEPTION_MC: u64 = 0x52;
pub const VMEXIT_EXCEPTION_XF: u64 = 0x53;
pub const VMEXIT_INTR: u64 = 0x60;
pub const VMEXIT_NMI: u64 = 0x61;
pub const VMEXIT_SMI: u64 = 0x62;
pub const VMEXIT_INIT: u64 = 0x63;
pub const VMEXIT_VINTR: u64 = 0x64;
pub const VMEXIT_RDTSC: u64 = 0x6E;
pub const VMEXIT_RDPMC: u64 = 0x6F;
pub const VMEXIT_PUSHF: u64 = 0x70;
pub const VMEXIT_POPF: u64 = 0x71;
pub const VMEXIT_CPUID: u64 = 0x72;
pub const VMEXIT_RSM: u64 = 0x73;
pub const VMEXIT_IRET: u64 = 0x74;
pub const VMEXIT_SWINT: u64 = 0x75;
pub const VMEXIT_INVD: u64 = 0x76;
pub const VMEXIT_PAUSE: u64 = 0x77;
pub const VMEXIT_HLT: u64 = 0x78;
pub const VMEXIT_INVLPG: u64 = 0x79;
pub const VMEXIT_INVLPGA: u64 = 0x7A;
pub const VMEXIT_IOIO: u64 = 0x7B;
pub const VMEXIT_MSR: u64 = 0x7C;
pub const VMEXIT_TASK_SWITCH: u64 = 0x7D;
pub const VMEXIT_FERR_FREEZE: u64 = 0x7E;
pub const VMEXIT_SHUTDOWN: u64 = 0x7F;
pub const VMEXIT_VMRUN: u64 = 0x80;
pub const VMEXIT_VMMCALL: u64 = 0x81;
pub const VMEXIT_VMLOAD: u64 = 0x82;
pub const VMEXIT_VMSAVE: u64 = 0x83;
pub const VMEXIT_STGI: u64 = 0x84;
pub const VMEXIT_CLGI: u64 = 0x85;
pub const VMEXIT_SKINIT: u64 = 0x86;
pub const VMEXIT_RDTSCP: u64 = 0x87;
pub const VMEXIT_ICEBP: u64 = 0x88;
pub const VMEXIT_WBINVD: u64 = 0x89;
pub const VMEXIT_MONITOR: u64 = 0x8A;
pub const VMEXIT_MWAIT: u64 = 0x8B;
pub const VMEXIT_XSETBV: u64 = 0x8D;
pub const VMEXIT_EFER_WRITE_TRAP: u64 = 0x8F;
pub const VMEXIT_NPF: u64 = 0x400;
pub const AVIC_INCOMPLETE_IPI: u64 = 0x401;
pub const AVIC_NOACCEL: u64 = 0x402;
pub const VMEXIT_VMGEXIT: u64 = 0x403;
pub const VMEXIT_INVALID: u64 = u64::MAX;

bitflags! {
    /// Intercepted exception vectors, one bit per vector (offset 0x008).
    pub struct ExceptionVector: u32 {
        const DIVIDE_ERROR = 1 << 0;
        const DEBUG = 1 << 1;
        const NMI = 1 << 2;
        const BREAKPOINT = 1 << 3;
        const OVERFLOW = 1 << 4;
        const BOUND_RANGE = 1 << 5;
        const INVALID_OPCODE = 1 << 6;
        const DEVICE_NOT_AVAILABLE = 1 << 7;
        const DOUBLE_FAULT = 1 << 8;
        const INVALID_TSS = 1 << 10;
        const SEGMENT_NOT_PRESENT = 1 << 11;
        const STACK = 1 << 12;
        const GENERAL_PROTECTION = 1 << 13;
        const PAGE_FAULT = 1 << 14;
        const FP_EXCEPTION = 1 << 16;
        const ALIGNMENT_CHECK = 1 << 17;
        const MACHINE_CHECK = 1 << 18;
        const SIMD_FP = 1 << 19;
    }

    /// See `15.15.3 VMCB Clean Field`.
    ///
    /// The hypervisor should write 0h to indicate that the VMCB is new or
    /// potentially inconsistent with the CPU's cached copy. This hypervisor
    /// never sets clean bits; correctness over the marginal VMRUN speedup.
    pub struct VmcbClean: u64 {
        /// Intercepts: all the intercept vectors, TSC offset, Pause Filter
        /// Count.
        const I = 1 << 0;

        /// IOMSRPM: IOPM_BASE, MSRPM_BASE.
        const IOPM = 1 << 1;

        /// ASID.
        const ASID = 1 << 2;

        /// V_TPR, V_IRQ, V_INTR_PRIO, V_IGN_TPR, V_INTR_MASKING,
        /// V_INTR_VECTOR (offset 60h-67h).
        const TPR = 1 << 3;

        /// Nested Paging: NCR3, G_PAT.
        const NP = 1 << 4;

        /// CR0, CR3, CR4, EFER.
        const CR_X = 1 << 5;

        /// DR6, DR7.
        const DR_X = 1 << 6;

        /// GDT/IDT Limit and Base.
        const DT = 1 << 7;

        /// CS/DS/SS/ES Sel/Base/Limit/Attr, CPL.
        const SEG = 1 << 8;

        /// CR2.
        const CR2 = 1 << 9;

        /// DbgCtlMsr, br_from/to, lastint_from/to.
        const LBR = 1 << 10;

        /// AVIC APIC_BAR; AVIC APIC_BACKING_PAGE, AVIC PHYSICAL_TABLE and
        /// AVIC LOGICAL_TABLE pointers.
        const AVIC = 1 << 11;
    }

    /// TLB maintenance requests honored on the next VMRUN (offset 0x05c).
    ///
    /// Never set by the engine: NPT entry changes are covered by the
    /// per-ASID nested TLB maintenance the hardware performs, and the guest
    /// CR3 is never touched.
    pub struct TlbControl: u32 {
        /// 00h—Do nothing.
        const DO_NOTHING = 0;

        /// 01h—Flush entire TLB (all entries, all ASIDs) on VMRUN. Should
        /// only be used by legacy hypervisors.
        const FLUSH_ENTIRE_TLB = 1;

        /// 03h—Flush this guest's TLB entries.
        const FLUSH_GUEST_TLB = 3;

        /// 07h—Flush this guest's non-global TLB entries.
        const FLUSH_GUEST_NON_GLOBAL_TLB = 7;
    }

    pub struct InterceptMisc1: u32 {
        const INTERCEPT_INTR = 1 << 0;
        const INTERCEPT_NMI = 1 << 1;
        const INTERCEPT_SMI = 1 << 2;
        const INTERCEPT_INIT = 1 << 3;
        const INTERCEPT_VINTR = 1 << 4;
        const INTERCEPT_CR0 = 1 << 5;

        const INTERCEPT_READ_IDTR = 1 << 6;
        const INTERCEPT_READ_GDTR = 1 << 7;
        const INTERCEPT_READ_LDTR = 1 << 8;
        const INTERCEPT_READ_TR = 1 << 9;

        const INTERCEPT_WRITE_IDTR = 1 << 10;
        const INTERCEPT_WRITE_GDTR = 1 << 11;
        const INTERCEPT_WRITE_LDTR = 1 << 12;
        const INTERCEPT_WRITE_TR = 1 << 13;

        const INTERCEPT_RDTSC = 1 << 14;
        const INTERCEPT_RDPMC = 1 << 15;
        const INTERCEPT_PUSHF = 1 << 16;
        const INTERCEPT_POPF = 1 << 17;
        const INTERCEPT_CPUID = 1 << 18;
        const INTERCEPT_RSM = 1 << 19;
        const INTERCEPT_IRET = 1 << 20;
        const INTERCEPT_INTN = 1 << 21;
        const INTERCEPT_INVD = 1 << 22;
        const INTERCEPT_PAUSE = 1 << 23;
        const INTERCEPT_HLT = 1 << 24;
        const INTERCEPT_INVLPG = 1 << 25;
        const INTERCEPT_INVLPGA = 1 << 26;
        const INTERCEPT_IOIO_PROT = 1 << 27;
        const INTERCEPT_MSR_PROT = 1 << 28;
        const INTERCEPT_TASK_SWITCHES = 1 << 29;
        const INTERCEPT_FERR_FREEZE = 1 << 30;
        const INTERCEPT_SHUTDOWN = 1 << 31;
    }

    pub struct InterceptMisc2: u32 {
        const INTERCEPT_VMRUN = 1 << 0;
        const INTERCEPT_VMCALL = 1 << 1;
        const INTERCEPT_VMLOAD = 1 << 2;
        const INTERCEPT_VMSAVE = 1 << 3;
        const INTERCEPT_STGI = 1 << 4;
        const INTERCEPT_CLGI = 1 << 5;
        const INTERCEPT_SKINIT = 1 << 6;
        const INTERCEPT_RDTSCP = 1 << 7;
        const INTERCEPT_ICEBP = 1 << 8;
        const INTERCEPT_WBINVD = 1 << 9;
        const INTERCEPT_MONITOR = 1 << 10;
        const INTERCEPT_MWAIT = 1 << 11;
        const INTERCEPT_MWAIT_CONDITIONAL = 1 << 12;
        const INTERCEPT_XSETBV = 1 << 13;
        const INTERCEPT_RDPRU = 1 << 14;
        const INTERCEPT_EFER = 1 << 15;
    }

    pub struct NpEnable: u64 {
        const NESTED_PAGING                     = 1 << 0;
        const SECURE_ENCRYPTED_VIRTUALIZATION   = 1 << 1;
        const ENCRYPTED_STATE                   = 1 << 2;
        const GUEST_MODE_EXECUTE_TRAP           = 1 << 3;
        const SSS_CHECK_EN                      = 1 << 4;
        const VIRTUAL_TRANSPARENT_ENCRYPTION    = 1 << 5;
        const ENABLE_INVLPGB                    = 1 << 7;
    }

    /// EXITINFO1 of a nested page fault. See `15.25.6 Nested versus Guest
    /// Page Faults, Fault Ordering`.
    pub struct NptExitInfo: u64 {
        /// Cleared to 0 if the nested page was not present, 1 otherwise.
        const PRESENT           = 1 << 0;

        /// Set to 1 if the nested page table level access was a write.
        const RW                = 1 << 1;

        /// Set to 1 if the nested page table level access was a user access.
        const US                = 1 << 2;

        /// Set to 1 if reserved bits were set in the corresponding nested
        /// page table entry.
        const RSV               = 1 << 3;

        /// Set to 1 if the nested page table level access was a code read.
        const ID                = 1 << 4;

        /// Set to 1 if the nested page fault occurred while translating the
        /// guest's final physical address.
        const GUEST_PA          = 1 << 32;

        /// Set to 1 if the nested page fault occurred while translating the
        /// guest page tables.
        const GUEST_PAGE_TABLES = 1 << 33;
    }
}
