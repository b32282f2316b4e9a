use crate::svm::vmlaunch::Context;
use bitfield::bitfield;
use core::arch::asm;
use x86::{
    controlregs::{cr2, cr3},
    msr::{rdmsr, IA32_EFER, IA32_PAT},
};
use x86_64::{
    instructions::tables::{sgdt, sidt},
    registers::control::{Cr0, Cr4},
};

bitfield! {
    /// See `Figure 4-20. Code-Segment Descriptor—Long Mode`.
    pub struct SegmentDescriptor(u64);
    pub get_limit_low, set_limit_low: 15, 0;
    pub get_base_low, set_base_low: 39, 16;
    pub get_type, set_type: 43, 40;
    pub get_system, set_system: 44, 44;
    pub get_dpl, set_dpl: 46, 45;
    pub get_present, set_present: 47, 47;
    pub get_limit_high, set_limit_high: 51, 48;
    pub get_avl, set_avl: 52, 52;
    pub get_long_mode, set_long_mode: 53, 53;
    pub get_default_bit, set_default_bit: 54, 54;
    pub get_granularity, set_granularity: 55, 55;
    pub get_base_high, set_base_high: 63, 56;
}

bitfield! {
    /// Packed attribute format of the VMCB segment registers. See
    /// `Appendix B` notes on the state save area.
    pub struct SegmentAttribute(u16);
    pub get_type, set_type: 3, 0;
    pub get_system, set_system: 4, 4;
    pub get_dpl, set_dpl: 6, 5;
    pub get_present, set_present: 7, 7;
    pub get_avl, set_avl: 8, 8;
    pub get_long_mode, set_long_mode: 9, 9;
    pub get_default_bit, set_default_bit: 10, 10;
    pub get_granularity, set_granularity: 11, 11;
}

// Size: 0x298
#[repr(C)]
pub struct SaveArea {
    pub es_selector: u16,
    pub es_attrib: u16,
    pub es_limit: u32,
    pub es_base: u64,

    pub cs_selector: u16,
    pub cs_attrib: u16,
    pub cs_limit: u32,
    pub cs_base: u64,

    pub ss_selector: u16,
    pub ss_attrib: u16,
    pub ss_limit: u32,
    pub ss_base: u64,

    pub ds_selector: u16,
    pub ds_attrib: u16,
    pub ds_limit: u32,
    pub ds_base: u64,

    pub fs_selector: u16,
    pub fs_attrib: u16,
    pub fs_limit: u32,
    pub fs_base: u64,

    pub gs_selector: u16,
    pub gs_attrib: u16,
    pub gs_limit: u32,
    pub gs_base: u64,

    pub gdtr_selector: u16,
    pub gdtr_attrib: u16,
    pub gdtr_limit: u32,
    pub gdtr_base: u64,

    pub ldtr_selector: u16,
    pub ldtr_attrib: u16,
    pub ldtr_limit: u32,
    pub ldtr_base: u64,

    pub idtr_selector: u16,
    pub idtr_attrib: u16,
    pub idtr_limit: u32,
    pub idtr_base: u64,

    pub tr_selector: u16,
    pub tr_attrib: u16,
    pub tr_limit: u32,
    pub tr_base: u64,

    pub reserved1: [u8; 43],
    pub cpl: u8,
    pub reserved2: u32,
    pub efer: u64,
    pub reserved3: [u8; 112],
    pub cr4: u64,
    pub cr3: u64,
    pub cr0: u64,
    pub dr7: u64,
    pub dr6: u64,
    pub rflags: u64,
    pub rip: u64,
    pub reserved4: [u8; 88],
    pub rsp: u64,
    pub reserved5: [u8; 24],
    pub rax: u64,
    pub star: u64,
    pub lstar: u64,
    pub cstar: u64,
    pub sf_mask: u64,
    pub kernel_gs_base: u64,
    pub sysenter_cs: u64,
    pub sysenter_esp: u64,
    pub sysenter_eip: u64,
    pub cr2: u64,
    pub reserved6: [u8; 32],
    pub gpat: u64,
    pub dbg_ctl: u64,
    pub br_from: u64,
    pub br_to: u64,
    pub last_excep_from: u64,
    pub last_excep_to: u64,
}
const_assert_eq!(core::mem::size_of::<SaveArea>(), 0x298);

impl SaveArea {
    /// Current privilege level of the guest, from the SS attributes as the
    /// save area always has them.
    pub fn ss_dpl(&self) -> u16 {
        SegmentAttribute(self.ss_attrib).get_dpl()
    }

    /// Reads the access rights of `segment_selector` out of the descriptor
    /// table and packs them into the VMCB attribute format.
    fn segment_access_right(segment_selector: u16, gdt_base: u64) -> u16 {
        const RPL_MASK: u16 = 3;
        let descriptor = gdt_base + (segment_selector & !RPL_MASK) as u64;

        let descriptor = descriptor as *mut u64 as *mut SegmentDescriptor;
        let descriptor = unsafe { descriptor.read_volatile() };

        let mut attribute = SegmentAttribute(0);
        attribute.set_type(descriptor.get_type() as u16);
        attribute.set_system(descriptor.get_system() as u16);
        attribute.set_dpl(descriptor.get_dpl() as u16);
        attribute.set_present(descriptor.get_present() as u16);
        attribute.set_avl(descriptor.get_avl() as u16);
        attribute.set_long_mode(descriptor.get_long_mode() as u16);
        attribute.set_default_bit(descriptor.get_default_bit() as u16);
        attribute.set_granularity(descriptor.get_granularity() as u16);

        attribute.0
    }

    /// See: https://www.felixcloutier.com/x86/lsl
    fn segment_limit(selector: u16) -> u32 {
        let limit: u32;
        unsafe {
            asm!("lsl {0:e}, {1:x}", out(reg) limit, in(reg) selector, options(nostack, nomem));
        }
        limit
    }

    /// Initializes the guest state from the captured context of the running
    /// system, so that VMRUN continues exactly where the capture happened.
    pub fn build(&mut self, context: &Context) {
        let gdt = sgdt();
        let idt = sidt();

        self.gdtr_base = gdt.base.as_u64();
        self.gdtr_limit = gdt.limit as _;

        self.idtr_base = idt.base.as_u64();
        self.idtr_limit = idt.limit as _;

        self.cs_limit = Self::segment_limit(context.seg_cs);
        self.ds_limit = Self::segment_limit(context.seg_ds);
        self.es_limit = Self::segment_limit(context.seg_es);
        self.ss_limit = Self::segment_limit(context.seg_ss);

        self.cs_selector = context.seg_cs;
        self.ds_selector = context.seg_ds;
        self.es_selector = context.seg_es;
        self.ss_selector = context.seg_ss;

        self.cs_attrib = Self::segment_access_right(context.seg_cs, gdt.base.as_u64());
        self.ds_attrib = Self::segment_access_right(context.seg_ds, gdt.base.as_u64());
        self.es_attrib = Self::segment_access_right(context.seg_es, gdt.base.as_u64());
        self.ss_attrib = Self::segment_access_right(context.seg_ss, gdt.base.as_u64());

        self.gpat = unsafe { rdmsr(IA32_PAT) };
        self.efer = unsafe { rdmsr(IA32_EFER) };
        self.cr0 = Cr0::read_raw();
        self.cr2 = unsafe { cr2() } as _;
        self.cr3 = unsafe { cr3() };
        self.cr4 = Cr4::read_raw();
        self.rflags = context.rflags;
        self.rsp = context.rsp;
        self.rip = context.rip;
    }
}
