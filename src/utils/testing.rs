//! In-process host services for tests.
//!
//! Pages come from the std allocator. Translation is the identity, except
//! for pinned pages: those are assigned small synthetic physical addresses so
//! that hooked pages land inside the identity-mapped RAM window of a nested
//! page table under test.

use crate::utils::host::{register, Host, PinToken};
use core::{
    ptr::NonNull,
    sync::atomic::{AtomicU64, Ordering},
};
use std::alloc::{alloc_zeroed, dealloc, Layout};
use std::sync::Mutex;

/// Synthetic physical addresses handed out for pinned pages, growing upwards
/// from 1 MB.
static NEXT_PIN_PA: AtomicU64 = AtomicU64::new(0x10_0000);

/// (virtual page, synthetic physical page) pairs of currently pinned pages.
static PINNED: Mutex<Vec<(u64, u64)>> = Mutex::new(Vec::new());

pub struct TestHost;

impl Host for TestHost {
    fn physical_address(&self, va: u64) -> u64 {
        let page = va & !0xFFF;
        let pinned = PINNED.lock().unwrap();

        match pinned.iter().find(|(pinned_va, _)| *pinned_va == page) {
            Some((_, pa)) => *pa | (va & 0xFFF),
            None => va,
        }
    }

    fn virtual_address(&self, pa: u64) -> u64 {
        let page = pa & !0xFFF;
        let pinned = PINNED.lock().unwrap();

        match pinned.iter().find(|(_, pinned_pa)| *pinned_pa == page) {
            Some((va, _)) => *va | (pa & 0xFFF),
            None => pa,
        }
    }

    fn alloc_contiguous(&self, bytes: usize) -> Option<NonNull<u8>> {
        let layout = Layout::from_size_align(bytes.max(1), 4096).ok()?;
        NonNull::new(unsafe { alloc_zeroed(layout) })
    }

    unsafe fn free_contiguous(&self, ptr: NonNull<u8>, bytes: usize) {
        let layout = Layout::from_size_align(bytes.max(1), 4096).unwrap();
        dealloc(ptr.as_ptr(), layout);
    }

    fn alloc_executable(&self, bytes: usize) -> Option<NonNull<u8>> {
        let layout = Layout::from_size_align(bytes.max(1), 16).ok()?;
        NonNull::new(unsafe { alloc_zeroed(layout) })
    }

    unsafe fn free_executable(&self, ptr: NonNull<u8>, bytes: usize) {
        let layout = Layout::from_size_align(bytes.max(1), 16).unwrap();
        dealloc(ptr.as_ptr(), layout);
    }

    fn pin_page(&self, page_va: u64) -> Option<PinToken> {
        let page = page_va & !0xFFF;
        let pa = NEXT_PIN_PA.fetch_add(0x1000, Ordering::Relaxed);

        PINNED.lock().unwrap().push((page, pa));
        Some(PinToken(pa))
    }

    unsafe fn unpin_page(&self, token: PinToken) {
        PINNED.lock().unwrap().retain(|(_, pa)| *pa != token.0);
    }

    fn invalidate_instruction_caches(&self) {}
}

static TEST_HOST: TestHost = TestHost;

pub fn init_host() {
    register(&TEST_HOST);
}

/// A page-aligned buffer standing in for a pinned kernel code page.
#[repr(C, align(4096))]
pub struct FakePage(pub [u8; 4096]);

/// Leaks a zeroed page so its address stays valid for the whole test run,
/// like pinned kernel memory would.
pub fn leak_page() -> &'static mut FakePage {
    Box::leak(Box::new(FakePage([0; 4096])))
}

/// Two consecutive pages, for cases that need bytes on both sides of a page
/// boundary.
#[repr(C, align(4096))]
pub struct FakeRegion(pub [u8; 8192]);

pub fn leak_pages() -> &'static mut FakeRegion {
    Box::leak(Box::new(FakeRegion([0; 8192])))
}
