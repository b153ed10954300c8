//! Kernel heap (kallocator)
//!
//! An arena over PMM pages with two allocation paths:
//!
//! - **Large** (>= [`LARGE_THRESHOLD`]): the request gets a whole run of
//!   pages straight from the PMM.
//! - **Small**: the request is carved out of a page-wide free list. Each
//!   live block is prefixed by an [`AllocHeader`] whose magic is checked
//!   on free; freed blocks become free-list nodes and physically
//!   adjacent nodes within the same page are coalesced.
//!
//! A page is owned by the heap until the last block in it is freed, at
//! which point the whole page goes back to the PMM.

use crate::core::mm::{page_base, pages_for, PhysAddr, Pmm, PAGE_SIZE};
use crate::core::sync::SpinLock;
use crate::utils::{align_up, is_power_of_two};
use crate::{Error, Result};
use core::ptr::NonNull;

/// Requests at or above this many bytes take the whole-page path.
pub const LARGE_THRESHOLD: usize = 2048;

/// Smallest alignment handed out.
pub const MIN_ALIGN: usize = 8;

/// Allocation granularity of the small path. Bounds fragmentation and
/// keeps freed slots reusable for slightly larger follow-up requests.
const MIN_SMALL_BLOCK: usize = 128;

/// Header magic for live small blocks.
pub const HEAP_MAGIC: u64 = 0xDEAD_BEEF;

/// Maximum number of page runs the heap can own at once.
const MAX_RUNS: usize = 64;

/// Prefix of every live small block, immediately before the user
/// pointer. `size` is the full block span from the header to the block
/// end, padding included.
#[repr(C)]
struct AllocHeader {
    size: u64,
    magic: u64,
}

const HEADER_SIZE: usize = core::mem::size_of::<AllocHeader>();

/// A free-list node, stored inside the free block itself.
#[repr(C)]
struct FreeNode {
    size: usize,
    next: *mut FreeNode,
}

const FREE_NODE_SIZE: usize = core::mem::size_of::<FreeNode>();

/// One run of pages owned by the heap.
#[derive(Debug, Clone, Copy)]
struct PageRun {
    base: PhysAddr,
    pages: usize,
    /// The whole run serves a single user request.
    is_large: bool,
    /// Bytes handed out from this run (block spans for small pages,
    /// the request size for large runs).
    used: usize,
}

struct HeapInner {
    runs: [Option<PageRun>; MAX_RUNS],
    free_head: *mut FreeNode,
}

unsafe impl Send for HeapInner {}

/// The kernel heap.
pub struct KernelHeap {
    pmm: &'static Pmm,
    inner: SpinLock<HeapInner>,
}

unsafe impl Sync for KernelHeap {}

struct Fit {
    block_start: usize,
    payload: usize,
    span: usize,
    lead: usize,
    trail: usize,
}

impl KernelHeap {
    /// Create a heap over the given page allocator.
    pub const fn new(pmm: &'static Pmm) -> Self {
        Self {
            pmm,
            inner: SpinLock::new(HeapInner {
                runs: [None; MAX_RUNS],
                free_head: core::ptr::null_mut(),
            }),
        }
    }

    /// Allocate `size` bytes aligned to `align` (power of two; values
    /// below 8 are rounded up to 8).
    pub fn alloc(&self, size: usize, align: usize) -> Result<NonNull<u8>> {
        if size == 0 {
            return Err(Error::InvalidArgument);
        }
        if !is_power_of_two(align) {
            return Err(Error::InvalidArgument);
        }
        let align = align.max(MIN_ALIGN);
        if align > PAGE_SIZE as usize {
            return Err(Error::InvalidArgument);
        }

        if size >= LARGE_THRESHOLD {
            return self.alloc_large(size);
        }
        self.alloc_small(size, align)
    }

    /// Free a pointer previously returned by [`KernelHeap::alloc`].
    ///
    /// Unknown addresses and corrupted headers yield `BadPointer`; the
    /// release build logs and carries on, the debug build halts.
    pub fn free(&self, ptr: NonNull<u8>) -> Result<()> {
        let addr = ptr.as_ptr() as usize;
        let mut inner = self.inner.lock();

        let slot = match inner
            .runs
            .iter()
            .position(|r| r.is_some_and(|r| r.contains(addr)))
        {
            Some(slot) => slot,
            None => {
                log::warn!("heap: free of unmanaged pointer {:#x}", addr);
                #[cfg(not(test))]
                debug_assert!(false, "heap: free of unmanaged pointer");
                return Err(Error::BadPointer);
            }
        };
        let run = inner.runs[slot].unwrap();

        if run.is_large {
            inner.runs[slot] = None;
            drop(inner);
            self.pmm.free_pages(run.base, run.pages);
            return Ok(());
        }

        self.free_small(&mut inner, slot, addr)
    }

    /// Total pages currently owned by the heap. Returns to zero after
    /// every matched alloc/free sequence.
    pub fn pages_held(&self) -> usize {
        self.inner
            .lock()
            .runs
            .iter()
            .flatten()
            .map(|r| r.pages)
            .sum()
    }

    fn alloc_large(&self, size: usize) -> Result<NonNull<u8>> {
        let pages = pages_for(size);
        let mut inner = self.inner.lock();
        let slot = inner
            .runs
            .iter()
            .position(|r| r.is_none())
            .ok_or(Error::NoSpace)?;

        let base = self.pmm.alloc_pages(pages)?;
        inner.runs[slot] = Some(PageRun {
            base,
            pages,
            is_large: true,
            used: size,
        });
        Ok(unsafe { NonNull::new_unchecked(base as usize as *mut u8) })
    }

    fn alloc_small(&self, size: usize, align: usize) -> Result<NonNull<u8>> {
        let mut inner = self.inner.lock();

        // Second pass runs after growing by one page.
        for attempt in 0..2 {
            if let Some(payload) = Self::carve(&mut inner, size, align) {
                return Ok(unsafe { NonNull::new_unchecked(payload as *mut u8) });
            }
            if attempt == 0 {
                self.grow(&mut inner)?;
            }
        }
        Err(Error::NoSpace)
    }

    /// First-fit scan of the free list; on success the block is carved
    /// out, its header written, and its span charged to the owning page.
    fn carve(inner: &mut HeapInner, size: usize, align: usize) -> Option<usize> {
        let mut prev: *mut FreeNode = core::ptr::null_mut();
        let mut cur = inner.free_head;

        while !cur.is_null() {
            let node_addr = cur as usize;
            let node_size = unsafe { (*cur).size };

            if let Some(fit) = Self::fit(node_addr, node_size, size, align) {
                let next = unsafe { (*cur).next };

                // Replace the consumed node by the leading and trailing
                // remainders, keeping the list address-ordered.
                let mut link_to = next;
                if fit.trail > 0 {
                    let t = (fit.block_start + fit.span) as *mut FreeNode;
                    unsafe {
                        (*t).size = fit.trail;
                        (*t).next = link_to;
                    }
                    link_to = t;
                }
                if fit.lead > 0 {
                    let l = node_addr as *mut FreeNode;
                    unsafe {
                        (*l).size = fit.lead;
                        (*l).next = link_to;
                    }
                    link_to = l;
                }
                if prev.is_null() {
                    inner.free_head = link_to;
                } else {
                    unsafe { (*prev).next = link_to };
                }

                let header = fit.block_start as *mut AllocHeader;
                unsafe {
                    (*header).size = fit.span as u64;
                    (*header).magic = HEAP_MAGIC;
                }

                let run = inner
                    .runs
                    .iter_mut()
                    .flatten()
                    .find(|r| r.contains(fit.block_start))
                    .expect("free node outside every heap page");
                run.used += fit.span;

                return Some(fit.payload);
            }

            prev = cur;
            cur = unsafe { (*cur).next };
        }
        None
    }

    /// Try to place a block of `size` bytes with payload alignment
    /// `align` inside the free node at `node_addr`.
    fn fit(node_addr: usize, node_size: usize, size: usize, align: usize) -> Option<Fit> {
        let mut payload = align_up(node_addr + HEADER_SIZE, align);
        // A leading remainder must be able to hold a free node.
        loop {
            let lead = payload - HEADER_SIZE - node_addr;
            if lead == 0 || lead >= FREE_NODE_SIZE {
                break;
            }
            payload += align;
        }

        let block_start = payload - HEADER_SIZE;
        let lead = block_start - node_addr;
        let mut span = align_up(payload + size, MIN_ALIGN) - block_start;
        if span < MIN_SMALL_BLOCK {
            span = MIN_SMALL_BLOCK;
        }
        if lead + span > node_size {
            return None;
        }

        let mut trail = node_size - lead - span;
        if trail > 0 && trail < FREE_NODE_SIZE {
            // Too small to stand alone; absorb into the block.
            span += trail;
            trail = 0;
        }

        Some(Fit {
            block_start,
            payload,
            span,
            lead,
            trail,
        })
    }

    /// Pull one page from the PMM and seed it as a single free node.
    fn grow(&self, inner: &mut HeapInner) -> Result<()> {
        let slot = inner
            .runs
            .iter()
            .position(|r| r.is_none())
            .ok_or(Error::NoSpace)?;
        let base = self.pmm.alloc_pages(1)?;
        inner.runs[slot] = Some(PageRun {
            base,
            pages: 1,
            is_large: false,
            used: 0,
        });

        let node = base as usize as *mut FreeNode;
        unsafe {
            (*node).size = PAGE_SIZE as usize;
            (*node).next = core::ptr::null_mut();
        }
        Self::insert_free(inner, node);
        Ok(())
    }

    fn free_small(&self, inner: &mut HeapInner, slot: usize, addr: usize) -> Result<()> {
        let run = inner.runs[slot].unwrap();
        if addr < run.base as usize + HEADER_SIZE {
            log::warn!("heap: free of {:#x} has no room for a header", addr);
            return Err(Error::BadPointer);
        }
        let block_start = addr - HEADER_SIZE;
        let header = block_start as *mut AllocHeader;

        let (span, magic) = unsafe { ((*header).size as usize, (*header).magic) };
        if magic != HEAP_MAGIC {
            log::warn!("heap: bad magic {:#x} freeing {:#x}", magic, addr);
            #[cfg(not(test))]
            debug_assert!(false, "heap: bad magic on free");
            return Err(Error::BadPointer);
        }
        if span < HEADER_SIZE || block_start + span > (run.base as usize) + run.pages * PAGE_SIZE as usize
        {
            log::warn!("heap: corrupt span {} freeing {:#x}", span, addr);
            return Err(Error::BadPointer);
        }

        unsafe { (*header).magic = 0 };

        let node = block_start as *mut FreeNode;
        unsafe {
            (*node).size = span;
            (*node).next = core::ptr::null_mut();
        }
        Self::insert_free(inner, node);

        let run = inner.runs[slot].as_mut().unwrap();
        run.used -= span;
        if run.used == 0 {
            let base = run.base;
            let pages = run.pages;
            Self::unlink_page_nodes(inner, base);
            inner.runs[slot] = None;
            self.pmm.free_pages(base, pages);
        }
        Ok(())
    }

    /// Address-ordered insert with boundary coalescing. Nodes only merge
    /// with neighbours in the same physical page.
    fn insert_free(inner: &mut HeapInner, node: *mut FreeNode) {
        let node_addr = node as usize;

        let mut prev: *mut FreeNode = core::ptr::null_mut();
        let mut cur = inner.free_head;
        while !cur.is_null() && (cur as usize) < node_addr {
            prev = cur;
            cur = unsafe { (*cur).next };
        }

        // Merge the successor into the node.
        unsafe {
            if !cur.is_null()
                && node_addr + (*node).size == cur as usize
                && same_page(node_addr, cur as usize)
            {
                (*node).size += (*cur).size;
                (*node).next = (*cur).next;
            } else {
                (*node).next = cur;
            }
        }

        // Link, or merge the node into its predecessor.
        unsafe {
            if !prev.is_null()
                && prev as usize + (*prev).size == node_addr
                && same_page(prev as usize, node_addr)
            {
                (*prev).size += (*node).size;
                (*prev).next = (*node).next;
            } else if prev.is_null() {
                inner.free_head = node;
            } else {
                (*prev).next = node;
            }
        }
    }

    /// Drop every free node living in the page at `base`.
    fn unlink_page_nodes(inner: &mut HeapInner, base: PhysAddr) {
        let mut prev: *mut FreeNode = core::ptr::null_mut();
        let mut cur = inner.free_head;
        while !cur.is_null() {
            let next = unsafe { (*cur).next };
            if page_base(cur as u64) == base {
                if prev.is_null() {
                    inner.free_head = next;
                } else {
                    unsafe { (*prev).next = next };
                }
            } else {
                prev = cur;
            }
            cur = next;
        }
    }
}

impl PageRun {
    fn contains(&self, addr: usize) -> bool {
        let base = self.base as usize;
        addr >= base && addr < base + self.pages * PAGE_SIZE as usize
    }
}

#[inline]
fn same_page(a: usize, b: usize) -> bool {
    page_base(a as u64) == page_base(b as u64)
}
