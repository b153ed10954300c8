//! Physical memory manager
//!
//! A flat bitmap over the contiguous managed RAM range, one bit per page
//! frame; a set bit means allocated. The bitmap is the single source of
//! truth: `free_pages() + count_ones(bitmap) == total_pages()` holds at
//! every quiescent point, and only the PMM writes the bitmap.

use crate::core::mm::{page_base, PhysAddr, PAGE_SIZE};
use crate::core::sync::SpinLock;
use crate::utils::bitmap::Bitmap;
use crate::{Error, Result};

/// Physical page allocator
pub struct Pmm {
    inner: SpinLock<PmmInner>,
}

struct PmmInner {
    bitmap: Option<Bitmap>,
    start: PhysAddr,
    total_pages: usize,
    free_pages: usize,
    /// First bitmap index probed by [`Pmm::alloc_pages_fs`].
    fs_offset: usize,
}

impl Pmm {
    /// Create an uninitialized allocator; [`Pmm::init`] must run before
    /// any allocation.
    pub const fn new() -> Self {
        Self {
            inner: SpinLock::new(PmmInner {
                bitmap: None,
                start: 0,
                total_pages: 0,
                free_pages: 0,
                fs_offset: 0,
            }),
        }
    }

    /// Initialize over `[start, start + size)` with the given bitmap
    /// storage. Fails with `InvalidArgument` if `size` is not a multiple
    /// of the page size or the bitmap is too small.
    pub fn init(&self, start: PhysAddr, size: u64, mut bitmap: Bitmap) -> Result<()> {
        if size == 0 || size % PAGE_SIZE != 0 {
            log::error!("pmm: misconfigured region {:#x}+{:#x}", start, size);
            return Err(Error::InvalidArgument);
        }
        let total = (size / PAGE_SIZE) as usize;
        if bitmap.bits() < total {
            return Err(Error::InvalidArgument);
        }
        // Word-granular storage may carry bits past the managed range;
        // pin them allocated so the run scan never hands them out.
        if bitmap.bits() > total {
            bitmap.set_range(total, bitmap.bits() - total);
        }

        let mut inner = self.inner.lock();
        inner.bitmap = Some(bitmap);
        inner.start = start;
        inner.total_pages = total;
        inner.free_pages = total;
        inner.fs_offset = crate::config::FS_RESERVED_PAGE_OFFSET.min(total);

        log::info!(
            "pmm: managing {:#x}..{:#x} ({} pages)",
            start,
            start + size,
            total
        );
        Ok(())
    }

    /// Allocate `n` contiguous pages, first-fit from the bottom of the
    /// range. Returns the physical address of the first page.
    pub fn alloc_pages(&self, n: usize) -> Result<PhysAddr> {
        self.alloc_from(0, n)
    }

    /// Allocate `n` contiguous pages from the filesystem-reserved region,
    /// so buffer-cache allocations never collide with the general pool.
    pub fn alloc_pages_fs(&self, n: usize) -> Result<PhysAddr> {
        let from = self.inner.lock().fs_offset;
        self.alloc_from(from, n)
    }

    fn alloc_from(&self, from: usize, n: usize) -> Result<PhysAddr> {
        if n == 0 {
            return Err(Error::InvalidArgument);
        }
        let mut inner = self.inner.lock();
        let start_addr = inner.start;
        let bitmap = inner.bitmap.as_mut().ok_or(Error::InvalidArgument)?;

        let index = bitmap.find_zero_run(from, n).ok_or(Error::NoSpace)?;
        bitmap.set_range(index, n);
        inner.free_pages -= n;
        Ok(start_addr + index as u64 * PAGE_SIZE)
    }

    /// Free `n` pages starting at `addr`. An address outside the managed
    /// range is logged and ignored; clearing already-clear bits (a
    /// double free) is tolerated.
    pub fn free_pages(&self, addr: PhysAddr, n: usize) {
        let mut inner = self.inner.lock();
        let start = inner.start;
        let total = inner.total_pages;

        let addr = page_base(addr);
        if addr < start || (addr - start) / PAGE_SIZE + n as u64 > total as u64 {
            log::warn!("pmm: free of unmanaged range {:#x} ({} pages)", addr, n);
            return;
        }

        let index = ((addr - start) / PAGE_SIZE) as usize;
        let bitmap = match inner.bitmap.as_mut() {
            Some(b) => b,
            None => return,
        };
        let mut freed = 0;
        for i in index..index + n {
            if bitmap.test(i) {
                bitmap.clear_bit(i);
                freed += 1;
            }
        }
        inner.free_pages += freed;
    }

    /// Mark `[start, end)` allocated without going through the free path.
    /// Used at boot to protect the kernel image and static heap.
    pub fn mark_allocated(&self, start: PhysAddr, end: PhysAddr) {
        let mut inner = self.inner.lock();
        let base = inner.start;
        let total = inner.total_pages;

        let first = page_base(start.max(base));
        let last = end.min(base + total as u64 * PAGE_SIZE);
        if first >= last {
            return;
        }

        let from = ((first - base) / PAGE_SIZE) as usize;
        let to = ((last - base).div_ceil(PAGE_SIZE)) as usize;
        let bitmap = match inner.bitmap.as_mut() {
            Some(b) => b,
            None => return,
        };
        let mut taken = 0;
        for i in from..to {
            if !bitmap.test(i) {
                bitmap.set_bit(i);
                taken += 1;
            }
        }
        inner.free_pages -= taken;
    }

    /// Number of free pages.
    pub fn free_pages_count(&self) -> usize {
        self.inner.lock().free_pages
    }

    /// Total managed pages.
    pub fn total_pages(&self) -> usize {
        self.inner.lock().total_pages
    }

    /// Number of allocated pages according to the bitmap.
    pub fn allocated_pages(&self) -> usize {
        let inner = self.inner.lock();
        inner.bitmap.as_ref().map_or(0, |b| {
            // Only the first total_pages bits belong to the range.
            let mut count = 0;
            for i in 0..inner.total_pages {
                if b.test(i) {
                    count += 1;
                }
            }
            count
        })
    }

    /// Start of the managed range.
    pub fn start_addr(&self) -> PhysAddr {
        self.inner.lock().start
    }

    /// Check whether `addr` lies in the managed range.
    pub fn contains(&self, addr: PhysAddr) -> bool {
        let inner = self.inner.lock();
        addr >= inner.start && addr < inner.start + inner.total_pages as u64 * PAGE_SIZE
    }
}

impl Default for Pmm {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const START: PhysAddr = 0x4000_0000;

    fn make_pmm(pages: usize, storage: &mut Vec<u64>) -> Pmm {
        storage.resize(pages.div_ceil(64), 0);
        let pmm = Pmm::new();
        let bitmap = Bitmap::from_slice(storage.as_mut_slice());
        pmm.init(START, pages as u64 * PAGE_SIZE, bitmap).unwrap();
        pmm
    }

    fn invariant_holds(pmm: &Pmm) -> bool {
        pmm.free_pages_count() + pmm.allocated_pages() == pmm.total_pages()
    }

    #[test]
    fn init_rejects_unaligned_size() {
        let mut storage = vec![0u64; 16];
        let pmm = Pmm::new();
        let bitmap = Bitmap::from_slice(storage.as_mut_slice());
        assert_eq!(
            pmm.init(START, PAGE_SIZE + 1, bitmap),
            Err(Error::InvalidArgument)
        );
    }

    #[test]
    fn first_fit_alloc_free_balance() {
        // Scenario: 1024 pages; alloc 3 -> page 0; alloc 5 -> page 3;
        // free the first run; alloc 2 -> page 0 again (first fit).
        let mut storage = Vec::new();
        let pmm = make_pmm(1024, &mut storage);

        let a = pmm.alloc_pages(3).unwrap();
        assert_eq!(a, START);
        let b = pmm.alloc_pages(5).unwrap();
        assert_eq!(b, START + 3 * PAGE_SIZE);

        pmm.free_pages(a, 3);
        let c = pmm.alloc_pages(2).unwrap();
        assert_eq!(c, START);

        assert_eq!(pmm.allocated_pages(), 5 + 2);
        assert!(invariant_holds(&pmm));
    }

    #[test]
    fn bitmap_invariant_over_random_walk() {
        let mut storage = Vec::new();
        let pmm = make_pmm(256, &mut storage);

        let mut held = Vec::new();
        // Deterministic pseudo-random interleaving of allocs and frees.
        let mut seed = 0x9e37_79b9_u64;
        for _ in 0..200 {
            seed = seed.wrapping_mul(6364136223846793005).wrapping_add(1);
            let n = (seed >> 33) as usize % 7 + 1;
            if seed & 1 == 0 || held.is_empty() {
                if let Ok(addr) = pmm.alloc_pages(n) {
                    held.push((addr, n));
                }
            } else {
                let (addr, n) = held.swap_remove((seed >> 13) as usize % held.len());
                pmm.free_pages(addr, n);
            }
            assert!(invariant_holds(&pmm));
        }
    }

    #[test]
    fn out_of_range_free_is_ignored() {
        let mut storage = Vec::new();
        let pmm = make_pmm(32, &mut storage);
        let a = pmm.alloc_pages(4).unwrap();

        pmm.free_pages(0x1000, 4);
        pmm.free_pages(START + 40 * PAGE_SIZE, 4);
        assert_eq!(pmm.allocated_pages(), 4);

        // Double free only clears what is set.
        pmm.free_pages(a, 4);
        pmm.free_pages(a, 4);
        assert_eq!(pmm.allocated_pages(), 0);
        assert!(invariant_holds(&pmm));
    }

    #[test]
    fn exhaustion_reports_no_space() {
        let mut storage = Vec::new();
        let pmm = make_pmm(8, &mut storage);
        assert!(pmm.alloc_pages(8).is_ok());
        assert_eq!(pmm.alloc_pages(1), Err(Error::NoSpace));
    }

    #[test]
    fn mark_allocated_protects_boot_image() {
        let mut storage = Vec::new();
        let pmm = make_pmm(64, &mut storage);

        pmm.mark_allocated(START, START + 16 * PAGE_SIZE);
        assert_eq!(pmm.free_pages_count(), 48);

        let a = pmm.alloc_pages(1).unwrap();
        assert_eq!(a, START + 16 * PAGE_SIZE);
        assert!(invariant_holds(&pmm));
    }

    #[test]
    fn fs_allocations_start_past_the_reserved_offset() {
        // fs_offset clamps to the pool size; with a pool smaller than the
        // configured offset every fs allocation fails rather than
        // overlapping the general pool.
        let mut storage = Vec::new();
        let pmm = make_pmm(64, &mut storage);
        assert_eq!(pmm.alloc_pages_fs(1), Err(Error::NoSpace));

        let general = pmm.alloc_pages(1).unwrap();
        assert_eq!(general, START);
    }

    #[test]
    fn fs_pool_is_disjoint_from_general_pool() {
        let offset = crate::config::FS_RESERVED_PAGE_OFFSET;
        let mut storage = Vec::new();
        let pmm = make_pmm(offset + 16, &mut storage);

        let fs = pmm.alloc_pages_fs(4).unwrap();
        assert_eq!(fs, START + offset as u64 * PAGE_SIZE);

        let general = pmm.alloc_pages(4).unwrap();
        assert_eq!(general, START);
        assert!(invariant_holds(&pmm));
    }
}
