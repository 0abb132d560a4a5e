//! C3: Buddy page allocator.
//!
//! Owns every physical page once [`init`] runs and is the sole source of
//! contiguous, power-of-two-aligned physical blocks for the rest of the
//! kernel, grounded on `original_source/kernel/src/mm/frame_alloc.c`. Unlike
//! the source (and unlike the teacher's old `frame_allocator.rs`, which
//! heap-allocated a `BuddyBlock` per free block), every free-list node lives
//! inside the block's own head [`Page`] descriptor — no allocation happens
//! inside the allocator that hands out allocations.

use crate::{
    error::MmError,
    mm::{
        addr::{PhysAddr, PAGE_SIZE},
        memmap::{self, MemoryRegionType},
        page::{self, BuddyLinks, FLAG_BUDDY_FREE, NO_FRAME},
    },
    sync::SpinLock,
};

pub const MAX_ORDER: u32 = 10;
const ORDER_COUNT: usize = MAX_ORDER as usize + 1;

struct BitmapHandle {
    base: *mut u64,
    words: usize,
}

// SAFETY: each order's bitmap is only ever touched with the buddy lock held.
unsafe impl Send for BitmapHandle {}

impl BitmapHandle {
    const fn empty() -> Self {
        Self {
            base: core::ptr::null_mut(),
            words: 0,
        }
    }

    fn toggle(&mut self, bit: usize) -> bool {
        debug_assert!(bit / 64 < self.words, "buddy bitmap index out of range");
        // SAFETY: bounds-checked above; base was sized to cover every order's
        // pair count in `init`.
        unsafe {
            let word = self.base.add(bit / 64);
            *word ^= 1 << (bit % 64);
            (*word >> (bit % 64)) & 1 != 0
        }
    }
}

struct Zone {
    head: u32,
    bitmap: BitmapHandle,
}

impl Zone {
    const fn empty() -> Self {
        Self {
            head: NO_FRAME,
            bitmap: BitmapHandle::empty(),
        }
    }
}

struct Buddy {
    zones: [Zone; ORDER_COUNT],
    total_pages: usize,
    usable_pages: usize,
    free_pages: usize,
}

impl Buddy {
    const fn new() -> Self {
        Self {
            zones: [
                Zone::empty(),
                Zone::empty(),
                Zone::empty(),
                Zone::empty(),
                Zone::empty(),
                Zone::empty(),
                Zone::empty(),
                Zone::empty(),
                Zone::empty(),
                Zone::empty(),
                Zone::empty(),
            ],
            total_pages: 0,
            usable_pages: 0,
            free_pages: 0,
        }
    }

    fn link(&self, frame: u32) -> &'static page::Page {
        page::page_at(frame as usize)
    }

    /// Pushes `frame` onto order `o`'s freelist and marks it free.
    fn push_free(&mut self, o: u32, frame: u32) {
        let p = self.link(frame);
        let zone = &mut self.zones[o as usize];
        // SAFETY: buddy lock held (method takes `&mut self` behind the lock);
        // `p` is about to become (or remain) a free-buddy-head.
        unsafe {
            p.set_buddy_links(BuddyLinks {
                next: zone.head,
                prev: NO_FRAME,
            });
        }
        if zone.head != NO_FRAME {
            let old_head = page::page_at(zone.head as usize);
            // SAFETY: same as above; `old_head` is a free-buddy-head.
            unsafe {
                let mut links = old_head.buddy_links();
                links.prev = frame;
                old_head.set_buddy_links(links);
            }
        }
        zone.head = frame;
        p.set_flags(FLAG_BUDDY_FREE);
        p.set_order(o);
    }

    /// Detaches `frame` from order `o`'s freelist, wherever it sits.
    fn unlink(&mut self, o: u32, frame: u32) {
        let p = self.link(frame);
        // SAFETY: `p` is a free-buddy-head (caller guarantees it is currently
        // on order `o`'s list) and the buddy lock is held.
        let links = unsafe { p.buddy_links() };
        let zone = &mut self.zones[o as usize];
        match links.prev {
            NO_FRAME => zone.head = links.next,
            prev => unsafe {
                let mut pl = self.link(prev).buddy_links();
                pl.next = links.next;
                self.link(prev).set_buddy_links(pl);
            },
        }
        if links.next != NO_FRAME {
            unsafe {
                let mut nl = self.link(links.next).buddy_links();
                nl.prev = links.prev;
                self.link(links.next).set_buddy_links(nl);
            }
        }
        p.set_flags(p.flags() & !FLAG_BUDDY_FREE);
    }

    fn pop_head(&mut self, o: u32) -> Option<u32> {
        let head = self.zones[o as usize].head;
        if head == NO_FRAME {
            return None;
        }
        self.unlink(o, head);
        Some(head)
    }

    /// Toggles the shared bit for the buddy pair containing `frame` at order
    /// `o` and returns the new value (`true` means both buddies now agree
    /// on the same allocated/free state).
    fn toggle_pair_bit(&mut self, o: u32, frame: u32) -> bool {
        let pair = (frame >> (o + 1)) as usize;
        self.zones[o as usize].bitmap.toggle(pair)
    }
}

static BUDDY: SpinLock<Buddy> = SpinLock::new(Buddy::new());

fn words_for_pairs(pairs: usize) -> usize {
    pairs.div_ceil(64).max(1)
}

/// Sizes and installs the per-order bitmaps (via the still-open bootstrap
/// allocator), closes the bootstrap allocator, then populates every usable
/// frame into the freelists at the largest order its position allows.
///
/// Must run after [`crate::mm::page::init`] and before any `alloc`/`free`
/// call. Mirrors the C1→C2→C3 boot sequence: the bitmap storage is itself an
/// early-bump allocation, just like the `Page` table.
pub fn init(pages_count: usize) -> Result<(), MmError> {
    let mut pair_counts = [0usize; ORDER_COUNT];
    let mut total_words = 0usize;
    for o in 0..ORDER_COUNT {
        let pairs = pages_count.div_ceil(1usize << (o + 1));
        pair_counts[o] = pairs;
        total_words += words_for_pairs(pairs);
    }

    let bitmap_bytes = (total_words * 8) as u64;
    let storage = crate::mm::early::alloc_zeroed(bitmap_bytes, 8)?;
    let mut cursor = storage.to_virt().as_mut_ptr::<u64>();

    {
        let mut buddy = BUDDY.lock();
        for o in 0..ORDER_COUNT {
            let words = words_for_pairs(pair_counts[o]);
            buddy.zones[o].bitmap = BitmapHandle {
                base: cursor,
                words,
            };
            // SAFETY: `storage` reserved `total_words` contiguous u64s; each
            // order claims a disjoint, correctly sized prefix in order.
            cursor = unsafe { cursor.add(words) };
        }
        buddy.total_pages = pages_count;
    }

    crate::mm::early::exit();

    let mut usable = 0usize;
    memmap::with_map(|map| {
        for entry in map.entries() {
            if entry.ty != MemoryRegionType::Usable {
                continue;
            }
            let mut frame = (entry.start / PAGE_SIZE) as u32;
            let end_frame = (entry.end() / PAGE_SIZE) as u32;
            let mut buddy = BUDDY.lock();
            while frame < end_frame {
                let remaining = end_frame - frame;
                let mut order = MAX_ORDER;
                while order > 0 && (frame % (1 << order) != 0 || remaining < (1 << order)) {
                    order -= 1;
                }
                buddy.push_free(order, frame);
                usable += 1usize << order;
                frame += 1 << order;
            }
        }
    });

    let mut buddy = BUDDY.lock();
    buddy.usable_pages = usable;
    buddy.free_pages = usable;
    Ok(())
}

/// `{total, usable, free}` page-count snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryStats {
    pub total: usize,
    pub usable: usize,
    pub free: usize,
}

pub fn stat_memory() -> MemoryStats {
    let buddy = BUDDY.lock();
    MemoryStats {
        total: buddy.total_pages,
        usable: buddy.usable_pages,
        free: buddy.free_pages,
    }
}

/// Allocates a `2^order`-page, `2^order`-page-aligned contiguous block.
///
/// # Errors
/// [`MmError::OutOfMemory`] if no free block of `order` or larger exists.
pub fn page_alloc(order: u32) -> Result<&'static page::Page, MmError> {
    assert!(order <= MAX_ORDER, "page_alloc: order exceeds MAX_ORDER");
    let mut buddy = BUDDY.lock();

    let mut found = None;
    for o in order..=MAX_ORDER {
        if let Some(frame) = buddy.pop_head(o) {
            found = Some((o, frame));
            break;
        }
    }
    let (mut o, mut frame) = found.ok_or(MmError::OutOfMemory {
        requested_bytes: (1u64 << order) * PAGE_SIZE,
    })?;
    buddy.toggle_pair_bit(o, frame);

    while o > order {
        o -= 1;
        let right = frame + (1 << o);
        buddy.push_free(o, right);
        buddy.toggle_pair_bit(o, right);
    }

    buddy.free_pages -= 1usize << order;
    let head = buddy.link(frame);
    head.set_order(order);
    Ok(head)
}

/// As [`page_alloc`], but the block is zero-filled (through the HHDM) before
/// return.
pub fn page_alloc_zeroed(order: u32) -> Result<&'static page::Page, MmError> {
    let head = page_alloc(order)?;
    let phys = page::page_to_phys(head);
    let len = (1usize << order) * PAGE_SIZE as usize;
    // SAFETY: the block was just allocated and is not aliased elsewhere.
    unsafe {
        core::ptr::write_bytes(phys.to_virt().as_mut_ptr::<u8>(), 0, len);
    }
    Ok(head)
}

/// Returns `page` (the head of a `2^order`-page block) to the allocator,
/// coalescing with its buddy at each level while the buddy is also free.
///
/// # Panics
/// If `page.order()` does not match `order` (the caller presented a
/// different order than was used at allocation) — an `INVARIANT_VIOLATION`
/// per the documented decision to panic rather than silently corrupt state.
pub fn page_free(page: &'static page::Page, order: u32) {
    assert!(order <= MAX_ORDER, "page_free: order exceeds MAX_ORDER");
    assert_eq!(
        page.order(),
        order,
        "page_free: order mismatch against allocation (INVARIANT_VIOLATION)"
    );

    let mut buddy = BUDDY.lock();
    let mut o = order;
    let mut b = page::page_to_idx(page) as u32;

    loop {
        // `toggle_pair_bit` returns the post-toggle XOR bit: 1 means this
        // frame's new (free) state now mismatches its buddy's, i.e. the
        // buddy is still allocated and coalescing must stop here; 0 means
        // both halves agree, which — since this half just became free — can
        // only mean the buddy is free too.
        let buddy_mismatched = buddy.toggle_pair_bit(o, b);
        if buddy_mismatched || o >= MAX_ORDER {
            break;
        }
        let buddy_idx = b ^ (1 << o);
        if buddy_idx as usize >= buddy.total_pages {
            break;
        }
        let buddy_page = buddy.link(buddy_idx);
        if !buddy_page.is_buddy_free() || buddy_page.order() != o {
            break;
        }
        buddy.unlink(o, buddy_idx);
        b = b.min(buddy_idx);
        o += 1;
    }

    buddy.push_free(o, b);
    buddy.free_pages += 1usize << order;
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;

    /// Builds a `Page` table, a fake physical-memory backing buffer, and a
    /// memory map covering it as one usable region, then runs buddy `init`
    /// over all of it. The returned buffers must outlive the calling test.
    fn fresh_arena(pages: usize) -> (alloc::vec::Vec<page::Page>, alloc::vec::Vec<u8>) {
        memmap::reset_for_test();
        page::reset_for_test();
        crate::mm::early::reset_for_test();

        let mut backing: alloc::vec::Vec<u8> = alloc::vec![0u8; pages * PAGE_SIZE as usize];
        crate::mm::addr::set_hhdm_offset_for_test(backing.as_mut_ptr() as u64);

        let mut table: alloc::vec::Vec<page::Page> =
            (0..pages).map(|_| unsafe { core::mem::zeroed() }).collect();
        unsafe { page::init(table.as_mut_ptr(), table.len()) };

        memmap::import(&[(0, (pages as u64) * PAGE_SIZE, MemoryRegionType::Usable)]).unwrap();
        init(pages).unwrap();
        (table, backing)
    }

    #[test]
    fn alloc_zero_returns_single_aligned_page() {
        let _arena = fresh_arena(64);
        let p = page_alloc(0).unwrap();
        assert_eq!(page::page_to_phys(p).0 % PAGE_SIZE, 0);
    }

    #[test]
    fn split_then_free_restores_stats() {
        let _arena = fresh_arena(64);
        let before = stat_memory();
        let p = page_alloc(0).unwrap();
        assert_eq!(stat_memory().free, before.free - 1);
        page_free(p, 0);
        assert_eq!(stat_memory().free, before.free);
    }

    #[test]
    fn coalesce_reassembles_full_block() {
        let _arena = fresh_arena(16);
        let before = stat_memory();
        let blocks: alloc::vec::Vec<_> = (0..16).map(|_| page_alloc(0).unwrap()).collect();
        assert_eq!(stat_memory().free, 0);
        for b in blocks {
            page_free(b, 0);
        }
        assert_eq!(stat_memory(), before);
        // The aggregate free count alone doesn't prove the 16 freed order-0
        // pages actually merged back into contiguous blocks; only a
        // successful order-4 allocation (the whole arena as one block)
        // does.
        let whole = page_alloc(4).expect("freed pages should have recombined into one order-4 block");
        page_free(whole, 4);
    }

    #[test]
    #[should_panic(expected = "order mismatch")]
    fn free_with_wrong_order_panics() {
        let _arena = fresh_arena(16);
        let p = page_alloc(0).unwrap();
        page_free(p, 1);
    }
}
