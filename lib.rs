//! Duovisor - a bare-metal AArch64 Type-1 hypervisor
//!
//! Runs at EL2 and multiplexes guest VMs over the physical cores; the
//! same scheduler, task model and low-level primitives also back a
//! native EL1 kernel mode (build without the `hv` feature).
//!
//! Unit tests build against the host: every privileged instruction is
//! fenced behind `aarch64-unknown-none` with inert fallbacks, so the
//! allocators, scheduler, Stage-2 walker, vGIC and virtual timer are
//! exercised as plain data structures.

#![cfg_attr(target_os = "none", no_std)]

// Core modules
pub mod config;
pub mod utils;

// Architecture-specific code
pub mod arch;

// Core hypervisor modules
pub mod core;

// Device drivers
pub mod drivers;

/// Duovisor version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Common error type for Duovisor
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// Allocator exhaustion (PMM or heap).
    NoSpace,
    /// Free of an unmanaged address or a failed header check.
    BadPointer,
    /// Zero-size request, bad alignment, bad descriptor.
    InvalidArgument,
    /// Named object does not exist.
    NotFound,
    /// Storage volume not available.
    NotMounted,
    /// Translation-table corruption; always fatal.
    Corruption,
    /// Guest access outside every emulated window.
    GuestFault,
}

/// Result type alias
pub type Result<T> = ::core::result::Result<T, Error>;

/// Park this CPU forever; the last stop for fatal errors.
pub fn halt_cpu() -> ! {
    log::error!("cpu {}: halted", arch::cpu::cpu_id());
    loop {
        arch::cpu::wait_for_interrupt();
    }
}

// Global allocator over the kernel heap, target builds only.
#[cfg(target_os = "none")]
struct DuovisorAllocator;

#[cfg(target_os = "none")]
unsafe impl ::core::alloc::GlobalAlloc for DuovisorAllocator {
    unsafe fn alloc(&self, layout: ::core::alloc::Layout) -> *mut u8 {
        match core::mm::HEAP.alloc(layout.size(), layout.align()) {
            Ok(ptr) => ptr.as_ptr(),
            Err(_) => ::core::ptr::null_mut(),
        }
    }

    unsafe fn dealloc(&self, ptr: *mut u8, _layout: ::core::alloc::Layout) {
        if let Some(ptr) = ::core::ptr::NonNull::new(ptr) {
            let _ = core::mm::HEAP.free(ptr);
        }
    }
}

#[cfg(target_os = "none")]
#[global_allocator]
static ALLOCATOR: DuovisorAllocator = DuovisorAllocator;

// Panic handler
#[cfg(target_os = "none")]
#[panic_handler]
fn panic(info: &::core::panic::PanicInfo) -> ! {
    if let Some(location) = info.location() {
        log::error!(
            "panic at {}:{}: {}",
            location.file(),
            location.line(),
            info.message()
        );
    } else {
        log::error!("panic: {}", info.message());
    }
    halt_cpu()
}
