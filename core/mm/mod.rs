//! Memory management
//!
//! The physical page allocator ([`pmm::Pmm`]) hands out page frames from
//! a bitmap over the managed RAM range; the kernel heap
//! ([`heap::KernelHeap`]) carves small objects out of those pages.

pub mod heap;
pub mod pmm;

pub use heap::KernelHeap;
pub use pmm::Pmm;

/// The boot-published page allocator. Components take `&Pmm`; only the
/// boot path and the global allocator reach for this directly.
pub static PMM: Pmm = Pmm::new();

/// The boot-published kernel heap over [`PMM`].
pub static HEAP: KernelHeap = KernelHeap::new(&PMM);

/// Physical address type
pub type PhysAddr = u64;

/// Virtual address type
pub type VirtAddr = u64;

/// Intermediate physical address (a guest's view of physical memory).
pub type Ipa = u64;

/// Page size re-exported from the platform configuration.
pub const PAGE_SIZE: u64 = crate::config::PAGE_SIZE as u64;

/// Page mask
pub const PAGE_MASK: u64 = !(PAGE_SIZE - 1);

/// Truncate an address to its page base.
#[inline]
pub fn page_base(addr: PhysAddr) -> PhysAddr {
    addr & PAGE_MASK
}

/// Number of pages needed to hold `bytes`.
#[inline]
pub fn pages_for(bytes: usize) -> usize {
    bytes.div_ceil(PAGE_SIZE as usize)
}
