//! C2: Bootstrap (early) allocator.
//!
//! A first-fit bump allocator over the usable regions of the firmware memory
//! map, grounded on `original_source/kernel/src/mm/mem_init.c`'s
//! `early_alloc`/`early_exit`. It exists to hand out the handful of
//! allocations — the `Page` table itself, the kernel's initial page tables —
//! that the buddy allocator needs before it can initialize itself.
//!
//! Every allocation made through here is recorded so [`exit`] can punch the
//! consumed ranges out of the usable memory map before C3 claims the rest.

use crate::{
    error::MmError,
    mm::{
        addr::{PhysAddr, PAGE_SIZE},
        memmap::{self, MemoryRegionType},
    },
    sync::SpinLock,
};

/// Upper bound on distinct early allocations. The source's `mem_init.c`
/// tracks a similarly small fixed count; a real boot makes on the order of
/// ten (page table, a few bootstrap page-table levels, the PGD).
pub const MAX_EARLY_ALLOCS: usize = 64;

#[derive(Clone, Copy)]
struct Reservation {
    start: PhysAddr,
    len: u64,
}

struct State {
    reservations: [Reservation; MAX_EARLY_ALLOCS],
    count: usize,
    closed: bool,
}

static STATE: SpinLock<State> = SpinLock::new(State {
    reservations: [Reservation {
        start: PhysAddr::new(0),
        len: 0,
    }; MAX_EARLY_ALLOCS],
    count: 0,
    closed: false,
});

/// Finds `len` bytes, aligned to `align`, inside a usable region that does
/// not overlap any prior early reservation, and reserves them.
///
/// # Errors
/// [`MmError::OutOfMemory`] if no usable region has room;
/// [`MmError::InvariantViolation`] if called after [`exit`], or if the
/// reservation table is full.
pub fn alloc(len: u64, align: u64) -> Result<PhysAddr, MmError> {
    let mut state = STATE.lock();
    if state.closed {
        return Err(MmError::InvariantViolation {
            what: "mm::early::alloc called after exit()",
        });
    }
    if state.count >= MAX_EARLY_ALLOCS {
        return Err(MmError::InvariantViolation {
            what: "mm::early::alloc exceeded MAX_EARLY_ALLOCS",
        });
    }

    let found = memmap::with_map(|map| {
        for entry in map.entries() {
            if entry.ty != MemoryRegionType::Usable {
                continue;
            }
            let mut cursor = entry.start;
            loop {
                let aligned = (cursor + align - 1) & !(align - 1);
                if aligned + len > entry.end() {
                    break;
                }
                let candidate = PhysAddr::new(aligned);
                if !overlaps_any(&state, candidate, len) {
                    return Some(candidate);
                }
                cursor = aligned + PAGE_SIZE;
            }
        }
        None
    });

    let start = found.ok_or(MmError::OutOfMemory {
        requested_bytes: len,
    })?;
    let idx = state.count;
    state.reservations[idx] = Reservation { start, len };
    state.count += 1;
    Ok(start)
}

fn overlaps_any(state: &State, start: PhysAddr, len: u64) -> bool {
    let end = start.0 + len;
    state.reservations[..state.count]
        .iter()
        .any(|r| start.0 < r.start.0 + r.len && r.start.0 < end)
}

/// Convenience wrapper over [`alloc`] that zeroes the returned region through
/// the HHDM before returning it. Used for the `Page` table, which the spec
/// requires to start all-zero.
pub fn alloc_zeroed(len: u64, align: u64) -> Result<PhysAddr, MmError> {
    let phys = alloc(len, align)?;
    let virt = phys.to_virt();
    // SAFETY: `phys..phys+len` was just reserved by `alloc` and is not
    // aliased by any other live reference.
    unsafe {
        core::ptr::write_bytes(virt.as_mut_ptr::<u8>(), 0, len as usize);
    }
    Ok(phys)
}

/// Snapshots every reservation granted so far as `(phys_start, length)`
/// pairs, for C5 to map into the kernel address space during bootstrap
/// (before [`exit`] is called).
pub fn reservations_snapshot() -> alloc::vec::Vec<(PhysAddr, u64)> {
    let state = STATE.lock();
    state.reservations[..state.count]
        .iter()
        .map(|r| (r.start, r.len))
        .collect()
}

/// Reopens the bootstrap allocator with no reservations. Nothing in the
/// running kernel calls this; it exists so tests can reuse the shared static
/// across cases.
#[cfg(all(test, not(target_os = "none")))]
pub fn reset_for_test() {
    *STATE.lock() = State {
        reservations: [Reservation {
            start: PhysAddr::new(0),
            len: 0,
        }; MAX_EARLY_ALLOCS],
        count: 0,
        closed: false,
    };
}

/// Closes the bootstrap allocator: further [`alloc`] calls fail, every byte
/// this allocator ever handed out is carved out of the usable memory map
/// entries so C3 never double-allocates it, and each surviving usable
/// entry's start is page-aligned upward (cutting any sub-page remainder).
/// Returns the total bytes reserved by this allocator, not counting the
/// alignment cut.
pub fn exit() -> u64 {
    let mut state = STATE.lock();
    state.closed = true;
    let reservations: alloc::vec::Vec<Reservation> =
        state.reservations[..state.count].to_vec();
    let total: u64 = reservations.iter().map(|r| r.len).sum();

    memmap::with_map(|map| {
        for r in &reservations {
            carve_out(map, r.start.0, r.len);
        }
        map.align_usable_entries();
    });
    total
}

/// Splits any usable entry overlapping `[start, start+len)` so that range is
/// excluded, inserting a trailing remainder entry when the cut lands in the
/// middle. Mirrors `early_mem_exit`'s region-splitting pass.
fn carve_out(map: &mut memmap::MemoryMap, start: u64, len: u64) {
    let end = start + len;
    let mut to_append: alloc::vec::Vec<memmap::MemoryMapEntry> = alloc::vec::Vec::new();
    for entry in map.entries_mut() {
        if entry.ty != MemoryRegionType::Usable {
            continue;
        }
        let e_end = entry.end();
        if start >= e_end || end <= entry.start {
            continue;
        }
        let head_len = start.saturating_sub(entry.start);
        let tail_start = end.max(entry.start);
        let tail_len = e_end.saturating_sub(tail_start);
        if head_len > 0 {
            if tail_len > 0 {
                to_append.push(memmap::MemoryMapEntry {
                    start: tail_start,
                    length: tail_len,
                    ty: MemoryRegionType::Usable,
                });
            }
            entry.length = head_len;
        } else if tail_len > 0 {
            entry.start = tail_start;
            entry.length = tail_len;
        } else {
            entry.length = 0;
        }
    }
    for appended in to_append {
        map.push(appended)
            .expect("mm::early::exit: memory map full while splitting a region");
    }
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;

    fn reset_map() {
        memmap::reset_for_test();
        reset_for_test();
        memmap::import(&[(0, 16 * PAGE_SIZE, MemoryRegionType::Usable)]).unwrap();
    }

    #[test]
    fn first_fit_advances_cursor() {
        reset_map();
        let a = alloc(PAGE_SIZE, PAGE_SIZE).unwrap();
        let b = alloc(PAGE_SIZE, PAGE_SIZE).unwrap();
        assert_eq!(a.0, 0);
        assert_eq!(b.0, PAGE_SIZE);
    }

    #[test]
    fn exit_carves_usable_entries() {
        reset_map();
        let _ = alloc(4 * PAGE_SIZE, PAGE_SIZE).unwrap();
        let reserved = exit();
        assert_eq!(reserved, 4 * PAGE_SIZE);
        memmap::with_map(|map| {
            assert_eq!(map.total_usable_bytes(), 12 * PAGE_SIZE);
        });
    }
}
