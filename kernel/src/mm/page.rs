//! The `Page` descriptor table: one fixed-size record per physical frame.
//!
//! Grounded on `original_source/kernel/include/frame_alloc.h`'s `struct page`
//! — a tagged union selected by `flags`, keeping the record compact instead
//! of giving every role its own field set. The table itself lives in memory
//! handed out by [`crate::mm::early`] (it must exist before the buddy
//! allocator, which is the memory it describes, is usable), so it is a raw
//! pointer + length rather than a `Vec`.

use core::{
    cell::UnsafeCell,
    sync::atomic::{AtomicU32, Ordering},
};

use crate::{mm::addr::PhysAddr, sync::OnceLock};

pub const FLAG_COMPOSITE_TAIL: u32 = 1 << 0;
pub const FLAG_SLAB_COMPOSITE_HEAD: u32 = 1 << 1;
pub const FLAG_KMALLOC_BUDDY_DIRECT: u32 = 1 << 2;
pub const FLAG_BUDDY_FREE: u32 = 1 << 3;

/// Tagged-union payload, discriminated by [`Page::flags`]. Matches the
/// compact (~40 B) layout the spec calls for: the free-buddy-head, slab-head,
/// large-alloc-head, and composite-tail shapes share the same storage.
#[repr(C)]
#[derive(Clone, Copy)]
pub union PageUnion {
    pub buddy: BuddyLinks,
    pub slab: SlabHead,
    pub large_alloc: LargeAllocHead,
    pub composite_tail: CompositeTail,
}

#[repr(C)]
#[derive(Clone, Copy)]
pub struct BuddyLinks {
    pub next: u32,
    pub prev: u32,
}

#[repr(C)]
#[derive(Clone, Copy)]
pub struct SlabHead {
    pub slab_next: u32,
    pub slab_prev: u32,
    pub owning_cache: u32,
    pub freelist_head: u64,
    pub used_objs: u16,
    pub total_objs: u16,
}

#[repr(C)]
#[derive(Clone, Copy)]
pub struct LargeAllocHead {
    pub order: u32,
}

#[repr(C)]
#[derive(Clone, Copy)]
pub struct CompositeTail {
    pub comp_head: u32,
}

pub const NO_FRAME: u32 = u32::MAX;

/// One record per physical page frame, addressed by frame index
/// (`phys >> 12`). 16-byte aligned, compact (`flags` + one 16-byte union).
///
/// `order` and `union` are mutated through shared `&'static Page` references
/// (every bijection helper below hands out `&Page`, never `&mut Page`, since
/// the table has no notion of per-entry ownership). Callers are expected to
/// hold the lock that owns the page's current role — the buddy lock while it
/// is a free-list or large-alloc head, the owning cache's lock while it is a
/// slab head — before touching `order`/`union`.
#[repr(C, align(16))]
pub struct Page {
    pub flags: AtomicU32,
    order: AtomicU32,
    union: UnsafeCell<PageUnion>,
}

impl Page {
    const fn empty() -> Self {
        Self {
            flags: AtomicU32::new(0),
            order: AtomicU32::new(0),
            union: UnsafeCell::new(PageUnion {
                buddy: BuddyLinks {
                    next: NO_FRAME,
                    prev: NO_FRAME,
                },
            }),
        }
    }

    pub fn flags(&self) -> u32 {
        self.flags.load(Ordering::Relaxed)
    }

    pub fn set_flags(&self, flags: u32) {
        self.flags.store(flags, Ordering::Relaxed);
    }

    pub fn is_composite_tail(&self) -> bool {
        self.flags() & FLAG_COMPOSITE_TAIL != 0
    }

    pub fn is_slab_head(&self) -> bool {
        self.flags() & FLAG_SLAB_COMPOSITE_HEAD != 0
    }

    pub fn is_kmalloc_direct(&self) -> bool {
        self.flags() & FLAG_KMALLOC_BUDDY_DIRECT != 0
    }

    pub fn is_buddy_free(&self) -> bool {
        self.flags() & FLAG_BUDDY_FREE != 0
    }

    pub fn order(&self) -> u32 {
        self.order.load(Ordering::Relaxed)
    }

    pub fn set_order(&self, order: u32) {
        self.order.store(order, Ordering::Relaxed);
    }

    /// Reads the free-buddy-head link pair.
    ///
    /// # Safety
    /// Caller must hold the buddy allocator's lock; this page must currently
    /// be playing the free-buddy-head role (no other union variant active).
    pub unsafe fn buddy_links(&self) -> BuddyLinks {
        unsafe { (*self.union.get()).buddy }
    }

    /// # Safety
    /// Same precondition as [`Page::buddy_links`].
    pub unsafe fn set_buddy_links(&self, links: BuddyLinks) {
        unsafe {
            (*self.union.get()).buddy = links;
        }
    }

    /// # Safety
    /// Caller must hold the owning cache's lock; this page must currently be
    /// a slab head.
    pub unsafe fn slab_head(&self) -> SlabHead {
        unsafe { (*self.union.get()).slab }
    }

    /// # Safety
    /// Same precondition as [`Page::slab_head`].
    pub unsafe fn set_slab_head(&self, head: SlabHead) {
        unsafe {
            (*self.union.get()).slab = head;
        }
    }

    /// # Safety
    /// This page must currently be a composite tail.
    pub unsafe fn comp_head_idx(&self) -> u32 {
        unsafe { (*self.union.get()).composite_tail.comp_head }
    }

    /// # Safety
    /// This page must currently be (becoming) a composite tail.
    pub unsafe fn set_comp_head_idx(&self, head_idx: u32) {
        unsafe {
            (*self.union.get()).composite_tail = CompositeTail { comp_head: head_idx };
        }
    }
}

// SAFETY: every union access is `unsafe` and documented as requiring the
// relevant role's lock to be held by the caller; the table itself is only
// ever shared, never exclusively borrowed.
unsafe impl Sync for Page {}

struct PageTableHandle {
    base: *mut Page,
    len: usize,
}

// SAFETY: the table's entries are individually synchronized by the buddy
// allocator's global lock or the owning slab cache's lock; the raw pointer
// itself is only ever read after `init()` has run once.
unsafe impl Send for PageTableHandle {}
unsafe impl Sync for PageTableHandle {}

static PAGE_TABLE: OnceLock<PageTableHandle> = OnceLock::new();

/// Installs the `Page` table over `base[0..len)`, which must already be
/// zeroed (every entry starts as an empty free-buddy-head with no flags).
///
/// # Safety
/// `base` must point to `len * size_of::<Page>()` zeroed, live-forever bytes
/// (typically the region [`crate::mm::early::alloc_zeroed`] just returned).
pub unsafe fn init(base: *mut Page, len: usize) {
    PAGE_TABLE
        .set(PageTableHandle { base, len })
        .unwrap_or_else(|_| panic!("mm::page::init called more than once"));
}

pub fn frame_count() -> usize {
    PAGE_TABLE.get().expect("page table not initialized").len
}

fn handle() -> &'static PageTableHandle {
    PAGE_TABLE.get().expect("page table not initialized")
}

/// Bijection: physical address to its `Page` descriptor.
pub fn phys_to_page(phys: PhysAddr) -> &'static Page {
    let idx = phys.frame_index();
    let h = handle();
    assert!(idx < h.len, "phys_to_page: frame index out of range");
    // SAFETY: idx < len, base points to a live array for the process lifetime.
    unsafe { &*h.base.add(idx) }
}

/// Bijection: `Page` descriptor to its physical address (page-aligned).
pub fn page_to_phys(page: &Page) -> PhysAddr {
    PhysAddr::new((page_to_idx(page) as u64) << crate::mm::addr::PAGE_SHIFT)
}

/// Bijection: `Page` descriptor to its frame index.
pub fn page_to_idx(page: &Page) -> usize {
    let h = handle();
    let base = h.base as usize;
    let this = page as *const Page as usize;
    assert!(this >= base, "page_to_idx: pointer precedes table base");
    let idx = (this - base) / core::mem::size_of::<Page>();
    assert!(idx < h.len, "page_to_idx: pointer past table end");
    idx
}

/// Drops the installed table so a test can call [`init`] again. Nothing in
/// the running kernel calls this.
#[cfg(all(test, not(target_os = "none")))]
pub fn reset_for_test() {
    PAGE_TABLE.take();
}

pub fn page_at(idx: usize) -> &'static Page {
    let h = handle();
    assert!(idx < h.len, "page_at: frame index out of range");
    // SAFETY: idx < len, base points to a live array for the process lifetime.
    unsafe { &*h.base.add(idx) }
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;

    fn with_fake_table<R>(pages: usize, f: impl FnOnce() -> R) -> R {
        let mut storage: alloc::vec::Vec<Page> = (0..pages).map(|_| Page::empty()).collect();
        // SAFETY: storage outlives the call to `f` and is zero-initialized
        // by construction (`Page::empty()` matches the all-zero layout).
        unsafe { init(storage.as_mut_ptr(), storage.len()) };
        let r = f();
        core::mem::forget(storage);
        r
    }

    #[test]
    fn bijection_holds() {
        with_fake_table(16, || {
            let phys = PhysAddr::new(4 * 4096);
            let page = phys_to_page(phys);
            assert_eq!(page_to_phys(page), phys);
            assert_eq!(page_to_idx(page), 4);
        });
    }
}
