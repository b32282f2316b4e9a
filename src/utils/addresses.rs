use crate::utils::host::host;
use x86::bits64::paging::{PAddr, BASE_PAGE_SHIFT};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PhysicalAddress(PAddr);

impl PhysicalAddress {
    pub fn from_pa(pa: u64) -> Self {
        Self(PAddr::from(pa))
    }

    pub fn from_pfn(pfn: u64) -> Self {
        Self(PAddr::from(pfn << BASE_PAGE_SHIFT))
    }

    pub fn from_va(va: u64) -> Self {
        Self(PAddr::from(host().physical_address(va)))
    }

    pub fn align_down_to_base_page(self) -> Self {
        Self(self.0.align_down_to_base_page())
    }

    pub fn pfn(self) -> u64 {
        self.0.as_u64() >> BASE_PAGE_SHIFT
    }

    pub fn as_u64(self) -> u64 {
        self.0.as_u64()
    }

    /// Maps the physical address back to an accessible pointer.
    pub fn as_va<T>(self) -> *mut T {
        host().virtual_address(self.0.as_u64()) as *mut T
    }
}

pub fn physical_address(ptr: *const u64) -> PAddr {
    PAddr::from(host().physical_address(ptr as u64))
}
