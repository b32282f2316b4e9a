use crate::svm::paging::_1GB;
use tinyvec::ArrayVec;
use x86::bits64::paging::{BASE_PAGE_SHIFT, BASE_PAGE_SIZE};

/// https://github.com/wbenny/hvpp/blob/84b3f3c241e1eec3ab42f75cad9deef3ad67e6ab/src/hvpp/hvpp/lib/mm/physical_memory_descriptor.h#L22
const MAX_RANGE_COUNT: usize = 32;

/// One contiguous run of system RAM.
#[derive(Debug, Default, Clone, Copy)]
pub struct PhysicalMemoryRange {
    pub base_page: u64,
    pub page_count: u64,
}

impl PhysicalMemoryRange {
    pub fn new(base_page: u64, page_count: u64) -> Self {
        Self {
            base_page,
            page_count,
        }
    }

    pub fn base_address(&self) -> u64 {
        self.base_page << BASE_PAGE_SHIFT
    }

    pub fn number_of_bytes(&self) -> u64 {
        self.page_count << BASE_PAGE_SHIFT
    }
}

/// The physical memory address ranges of the system, ordered by base address.
///
/// Everything listed here is mapped 1:1 into the nested page tables at
/// start-up. Whatever is *not* listed (MMIO, firmware holes) is mapped lazily
/// when the guest first touches it.
///
/// You can use `RAMMap` to verify and see the physical memory ranges of your
/// system: https://codemachine.com/articles/physical_memory_ranges_in_kernel_debugger.html
#[derive(Debug, Default)]
pub struct PhysicalMemoryDescriptor {
    ranges: ArrayVec<[PhysicalMemoryRange; MAX_RANGE_COUNT]>,
}

impl PhysicalMemoryDescriptor {
    /// Builds a descriptor from ordered `(base page frame, page count)` runs.
    pub fn from_runs(runs: &[PhysicalMemoryRange]) -> Self {
        let mut ranges = ArrayVec::new();
        for run in runs {
            ranges.push(*run);
        }

        Self { ranges }
    }

    pub fn ranges(&self) -> &[PhysicalMemoryRange] {
        &self.ranges
    }

    /// Returns the number of physical memory pages.
    pub fn page_count(&self) -> u64 {
        self.ranges
            .iter()
            .fold(0, |acc, range| acc + range.page_count)
    }

    /// Returns the total physical memory size in bytes.
    pub fn total_size(&self) -> u64 {
        self.page_count() * BASE_PAGE_SIZE as u64
    }

    /// Highest PDPT index + 1 that covers the described memory. One PDPT
    /// entry manages 1 GB, so the result is the top of RAM rounded up to
    /// 1 GB. (eg, the index is 2 if the highest physical address is at
    /// 1800 MB.)
    pub fn max_ppe_index(&self) -> usize {
        let last = match self.ranges.last() {
            Some(last) => last,
            None => return 0,
        };

        let highest = last.base_address() + last.number_of_bytes();
        highest.div_ceil(_1GB) as usize
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn page_count_sums_all_runs() {
        let descriptor = PhysicalMemoryDescriptor::from_runs(&[
            PhysicalMemoryRange::new(0x1, 0xFF),
            PhysicalMemoryRange::new(0x100, 0x100),
        ]);

        assert_eq!(descriptor.page_count(), 0x1FF);
        assert_eq!(descriptor.total_size(), 0x1FF * 4096);
    }

    #[test]
    fn max_ppe_index_rounds_up_to_one_gigabyte() {
        // Top of RAM at 1800 MB -> two PDPT entries needed.
        let descriptor = PhysicalMemoryDescriptor::from_runs(&[PhysicalMemoryRange::new(
            0x0,
            (1800 * 1024 * 1024) >> 12,
        )]);

        assert_eq!(descriptor.max_ppe_index(), 2);
    }

    #[test]
    fn max_ppe_index_of_empty_descriptor_is_zero() {
        let descriptor = PhysicalMemoryDescriptor::from_runs(&[]);
        assert_eq!(descriptor.max_ppe_index(), 0);
    }
}
