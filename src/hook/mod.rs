//! Load-time registration of execute-invisible function hooks.
//!
//! A hook replaces the first byte of a kernel function with `0xCC` — but only
//! on a private copy of the containing page (the "exec page"). Which of the
//! two physical pages backs the guest-visible mapping is decided at runtime
//! by the engine, so the breakpoint byte is never observable through an
//! ordinary read.

use crate::{
    hook::trampoline::{Trampoline, TrampolineError},
    utils::{
        addresses::PhysicalAddress,
        host::{host, PinToken},
    },
};
use alloc::vec::Vec;
use core::{
    ptr::NonNull,
    sync::atomic::{AtomicU64, Ordering},
};
use snafu::prelude::*;
use x86::bits64::paging::BASE_PAGE_SIZE;

pub mod engine;
pub mod npt;
pub mod physmem;
pub mod trampoline;

pub const BREAKPOINT_OPCODE: u8 = 0xCC;

#[derive(Debug, Snafu)]
pub enum RegistrationError {
    #[snafu(display("could not resolve exported symbol {name}"))]
    SymbolNotFound { name: &'static str },

    #[snafu(display("could not build the original-call stub for {name}"))]
    OriginalCallStub {
        name: &'static str,
        source: TrampolineError,
    },

    #[snafu(display("failed to allocate the exec page for {page_base_va:#x}"))]
    ExecPageAllocationFailed { page_base_va: u64 },

    #[snafu(display("failed to pin the hooked page at {page_base_va:#x}"))]
    PinningFailed { page_base_va: u64 },
}

/// A function to hook: the exported name and the handler that runs instead of
/// it once hooks are enabled.
#[derive(Debug, Clone, Copy)]
pub struct HookDescriptor {
    pub function_name: &'static str,
    pub handler: u64,
}

/// One installed hook. Immutable once registered.
pub struct HookEntry {
    pub function_name: &'static str,

    /// Where the hook sits inside the kernel function.
    pub hook_va: u64,

    /// Where the guest resumes when the breakpoint fires.
    pub handler: u64,

    /// Physical base of the page containing `hook_va`, backed by the
    /// unmodified original contents.
    pub orig_page_pa: u64,

    /// Physical base of the private copy carrying the breakpoint byte.
    pub exec_page_pa: u64,

    /// How many times the breakpoint fired for this hook.
    pub invocations: AtomicU64,

    trampoline: Trampoline,
}

impl HookEntry {
    /// The stub handlers call to reach the original function.
    pub fn original_call(&self) -> u64 {
        self.trampoline.address()
    }
}

/// Memory backing one distinct hooked page. Shared by all hooks that target
/// the same 4 KiB page.
struct SharedPageResource {
    /// Page-aligned virtual address of the hooked page.
    page_base_va: u64,

    /// The private copy of that page.
    exec_page: NonNull<u8>,

    /// Keeps the original page resident so its virtual-to-physical binding
    /// cannot change underneath the 1:1 mapping.
    pin: PinToken,
}

impl SharedPageResource {
    fn exec_page_va(&self) -> u64 {
        self.exec_page.as_ptr() as u64
    }
}

impl Drop for SharedPageResource {
    fn drop(&mut self) {
        unsafe {
            host().free_contiguous(self.exec_page, BASE_PAGE_SIZE);
            host().unpin_page(self.pin);
        }
    }
}

/// The fixed set of hooks, built once at load and read-only afterwards.
pub struct HookRegistry {
    hooks: Vec<HookEntry>,
    shared_pages: Vec<SharedPageResource>,
}

impl HookRegistry {
    /// Installs all requested hooks *without* activating them. Activation is
    /// a per-processor nested paging operation done after virtualization.
    pub fn new(
        descriptors: &[HookDescriptor],
        resolve: impl Fn(&str) -> Option<u64>,
    ) -> Result<Self, RegistrationError> {
        let mut registry = Self {
            hooks: Vec::with_capacity(descriptors.len()),
            shared_pages: Vec::new(),
        };

        for descriptor in descriptors {
            let name = descriptor.function_name;
            let hook_va = resolve(name).with_context(|| SymbolNotFoundSnafu { name })?;

            registry.register(name, hook_va, descriptor.handler)?;

            log::info!("Hook installed at {:#x} for {}", hook_va, name);
        }

        Ok(registry)
    }

    fn register(
        &mut self,
        name: &'static str,
        hook_va: u64,
        handler: u64,
    ) -> Result<(), RegistrationError> {
        let trampoline =
            Trampoline::new(hook_va).with_context(|_| OriginalCallStubSnafu { name })?;

        let shared = self.shared_page_for(hook_va)?;
        let exec_page_va = shared.exec_page_va();
        let page_base_va = shared.page_base_va;

        // Install the breakpoint on the exec page so the hypervisor can tell
        // when the hook is being executed, and make sure no stale
        // instruction bytes survive on any core.
        let offset = (hook_va & 0xFFF) as usize;
        unsafe { *(exec_page_va as *mut u8).add(offset) = BREAKPOINT_OPCODE };
        host().invalidate_instruction_caches();

        let orig_page_pa = PhysicalAddress::from_va(page_base_va)
            .align_down_to_base_page()
            .as_u64();
        let exec_page_pa = PhysicalAddress::from_va(exec_page_va)
            .align_down_to_base_page()
            .as_u64();
        debug_assert_ne!(orig_page_pa, exec_page_pa);

        self.hooks.push(HookEntry {
            function_name: name,
            hook_va,
            handler,
            orig_page_pa,
            exec_page_pa,
            invocations: AtomicU64::new(0),
            trampoline,
        });

        Ok(())
    }

    /// Returns the shared resource managing the page containing `hook_va`,
    /// creating it when this is the first hook on that page.
    fn shared_page_for(
        &mut self,
        hook_va: u64,
    ) -> Result<&SharedPageResource, RegistrationError> {
        let page_base_va = hook_va & !0xFFF;

        if let Some(index) = self
            .shared_pages
            .iter()
            .position(|shared| shared.page_base_va == page_base_va)
        {
            return Ok(&self.shared_pages[index]);
        }

        let exec_page = host()
            .alloc_contiguous(BASE_PAGE_SIZE)
            .with_context(|| ExecPageAllocationFailedSnafu { page_base_va })?;

        // The exec page starts out as an exact copy; hooks are stamped in
        // afterwards, one by one.
        unsafe {
            core::ptr::copy_nonoverlapping(
                page_base_va as *const u8,
                exec_page.as_ptr(),
                BASE_PAGE_SIZE,
            );
        }

        // The hooked page may be pageable or movable; the permanent 1:1
        // mapping assumes neither.
        let Some(pin) = host().pin_page(page_base_va) else {
            unsafe { host().free_contiguous(exec_page, BASE_PAGE_SIZE) };
            return PinningFailedSnafu { page_base_va }.fail();
        };

        self.shared_pages.push(SharedPageResource {
            page_base_va,
            exec_page,
            pin,
        });

        Ok(self.shared_pages.last().unwrap())
    }

    pub fn hooks(&self) -> &[HookEntry] {
        &self.hooks
    }

    pub fn is_empty(&self) -> bool {
        self.hooks.is_empty()
    }

    /// Finds the hook installed on the physical page containing `pa`.
    pub fn find_by_physical_page(&self, pa: u64) -> Option<&HookEntry> {
        self.position_by_physical_page(pa).map(|index| &self.hooks[index])
    }

    /// Like [`find_by_physical_page`], but returns the index of the entry.
    ///
    /// [`find_by_physical_page`]: Self::find_by_physical_page
    pub fn position_by_physical_page(&self, pa: u64) -> Option<usize> {
        let page = PhysicalAddress::from_pa(pa).align_down_to_base_page();

        self.hooks
            .iter()
            .position(|hook| hook.orig_page_pa == page.as_u64())
    }

    /// Finds the hook installed exactly at the virtual address `va`.
    pub fn find_by_address(&self, va: u64) -> Option<&HookEntry> {
        self.hooks.iter().find(|hook| hook.hook_va == va)
    }

    /// Finds the original-call stub for the given handler. Meant for the
    /// handlers themselves, which only know their own address.
    pub fn original_call_for(&self, handler: u64) -> Option<u64> {
        self.hooks
            .iter()
            .find(|hook| hook.handler == handler)
            .map(|hook| hook.original_call())
    }

    /// Tests whether every hook is invisible, by reading the first byte of
    /// every hooked address the same way the guest would.
    pub fn all_hooks_invisible(&self) -> bool {
        let mut invisible = true;
        for hook in self.hooks.iter() {
            if unsafe { *(hook.hook_va as *const u8) } == BREAKPOINT_OPCODE {
                log::warn!(
                    "Hook at {:#x} for {} is visible",
                    hook.hook_va,
                    hook.function_name
                );
                invisible = false;
            }
        }

        invisible
    }

    /// Prints out how many times each hook was called.
    pub fn report_activity(&self) {
        for hook in self.hooks.iter() {
            log::info!(
                "{} called {} times",
                hook.function_name,
                hook.invocations.load(Ordering::Relaxed)
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::testing;

    fn fake_function(page: &mut testing::FakePage, offset: usize) -> u64 {
        // push rbx
        page.0[offset] = 0x40;
        page.0[offset + 1] = 0x53;
        page.0.as_ptr() as u64 + offset as u64
    }

    #[test]
    fn registration_builds_exec_copy_with_breakpoint() {
        testing::init_host();

        let page = testing::leak_page();
        page.0[0x200] = 0xAB;
        let hook_va = fake_function(page, 0x20);

        let registry = HookRegistry::new(
            &[HookDescriptor {
                function_name: "NtTestRoutine",
                handler: 0xFFFF_8000_1234_0000,
            }],
            |name| (name == "NtTestRoutine").then_some(hook_va),
        )
        .unwrap();

        let hook = registry.find_by_address(hook_va).unwrap();
        assert_ne!(hook.orig_page_pa, hook.exec_page_pa);
        assert_eq!(
            hook.orig_page_pa,
            host().physical_address(page.0.as_ptr() as u64)
        );

        // The exec page is a faithful copy except for the breakpoint.
        let exec = hook.exec_page_pa as *const u8;
        assert_eq!(unsafe { *exec.add(0x20) }, BREAKPOINT_OPCODE);
        assert_eq!(unsafe { *exec.add(0x21) }, 0x53);
        assert_eq!(unsafe { *exec.add(0x200) }, 0xAB);

        // The original page is untouched.
        assert!(registry.all_hooks_invisible());
    }

    #[test]
    fn hooks_on_the_same_page_share_one_exec_page() {
        testing::init_host();

        let page = testing::leak_page();
        let first_va = fake_function(page, 0x10);
        let second_va = fake_function(page, 0x400);

        let registry = HookRegistry::new(
            &[
                HookDescriptor {
                    function_name: "NtFirst",
                    handler: 0x1000,
                },
                HookDescriptor {
                    function_name: "NtSecond",
                    handler: 0x2000,
                },
            ],
            |name| match name {
                "NtFirst" => Some(first_va),
                "NtSecond" => Some(second_va),
                _ => None,
            },
        )
        .unwrap();

        assert_eq!(registry.hooks().len(), 2);
        assert_eq!(registry.shared_pages.len(), 1);

        let first = registry.find_by_address(first_va).unwrap();
        let second = registry.find_by_address(second_va).unwrap();
        assert_eq!(first.exec_page_pa, second.exec_page_pa);

        // Both breakpoints live on the shared copy.
        let exec = first.exec_page_pa as *const u8;
        assert_eq!(unsafe { *exec.add(0x10) }, BREAKPOINT_OPCODE);
        assert_eq!(unsafe { *exec.add(0x400) }, BREAKPOINT_OPCODE);
    }

    #[test]
    fn unresolvable_symbol_fails_registration() {
        testing::init_host();

        let result = HookRegistry::new(
            &[HookDescriptor {
                function_name: "NtDoesNotExist",
                handler: 0x1000,
            }],
            |_| None,
        );

        assert!(matches!(
            result,
            Err(RegistrationError::SymbolNotFound { .. })
        ));
    }

    #[test]
    fn original_call_resolves_by_handler_address() {
        testing::init_host();

        let page = testing::leak_page();
        let hook_va = fake_function(page, 0x30);

        let registry = HookRegistry::new(
            &[HookDescriptor {
                function_name: "NtTestRoutine",
                handler: 0x4242,
            }],
            |_| Some(hook_va),
        )
        .unwrap();

        let stub = registry.original_call_for(0x4242).unwrap();
        assert_eq!(stub, registry.hooks()[0].original_call());
        assert!(registry.original_call_for(0x4343).is_none());
    }

    #[test]
    fn a_breakpoint_byte_at_the_hook_site_is_reported_as_visible() {
        testing::init_host();

        let page = testing::leak_page();
        let hook_va = fake_function(page, 0x50);

        let registry = HookRegistry::new(
            &[HookDescriptor {
                function_name: "NtTestRoutine",
                handler: 0x1000,
            }],
            |_| Some(hook_va),
        )
        .unwrap();
        assert!(registry.all_hooks_invisible());

        // What the guest would see if the exec page leaked through.
        page.0[0x50] = BREAKPOINT_OPCODE;
        assert!(!registry.all_hooks_invisible());

        page.0[0x50] = 0x40;
        assert!(registry.all_hooks_invisible());
    }

    #[test]
    fn lookup_by_physical_page_ignores_the_offset() {
        testing::init_host();

        let page = testing::leak_page();
        let hook_va = fake_function(page, 0x40);

        let registry = HookRegistry::new(
            &[HookDescriptor {
                function_name: "NtTestRoutine",
                handler: 0x1000,
            }],
            |_| Some(hook_va),
        )
        .unwrap();

        let base_pa = host().physical_address(page.0.as_ptr() as u64);
        assert!(registry.find_by_physical_page(base_pa + 0xF00).is_some());
        assert!(registry.find_by_physical_page(base_pa + 0x1000).is_none());
    }
}
