//! Fixed-item executable slab allocator.
//!
//! Each backing allocation is carved into same-sized slabs; each slab has a
//! header at its start and a `data` region follows directly after. Slabs
//! move between three intrusive doubly linked lists (`partial`, `empty`,
//! `full`) as items are taken and returned, mirroring
//! [`n1ght-hunter-rtmalloc`'s `SpanList`](../../examples/n1ght-hunter-rtmalloc/src/span.rs)
//! generalized from one free list to three. A slab's 64-bit `slots` bitmap
//! tracks which of its (at most 64) items are free.
//!
//! One slab per backing allocation is the "anchor": its `refcount` counts
//! how many slabs of that allocation are not on the `empty` list, and it
//! alone owns the [`Allocation`] handle needed to free the whole region.
//!
//! Every header and bitmap here is addressed through the backing
//! allocation's *writable* view. That view is never sealed — only its
//! executable mirror is — so splicing lists or flipping `slots` bits stays
//! legal for the lifetime of the slab, including after its trampolines are
//! in active use. See [`crate::memory`] for the writable/executable dual
//! mapping this depends on.

use std::marker::PhantomData;
use std::ptr;

use crate::error::HookError;
use crate::memory::{Allocation, ExecutableMemory};

const SYSTEM_PAGE_SIZE: usize = 4096;

#[repr(C)]
struct SlabHeader<O> {
    prev: *mut SlabHeader<O>,
    next: *mut SlabHeader<O>,
    /// Anchor slab of this allocation. Unused (and left null) on the anchor
    /// itself, since the anchor's own `refcount` is consulted directly.
    page: *mut SlabHeader<O>,
    refcount: usize,
    slots: u64,
    exe_data: usize,
    /// `Some` only on the anchor slab: the backing allocation this slab and
    /// its siblings were carved from, together with the policy blob it was
    /// allocated with (needed again when the whole allocation is freed).
    alloc: Option<Allocation<O>>,
}

fn next_pow_2(v: usize) -> usize {
    if v <= 1 {
        return 1;
    }
    let mut v = v - 1;
    v |= v >> 1;
    v |= v >> 2;
    v |= v >> 4;
    v |= v >> 8;
    v |= v >> 16;
    v |= v >> 32;
    v + 1
}

/// A chain of fixed-item executable slabs, all sized for `item_size` bytes.
pub struct SlabChain<M: ExecutableMemory> {
    item_size: usize,
    item_count: usize,
    slab_size: usize,
    pages_per_alloc: usize,
    empty_slotmask: u64,
    initial_slotmask: u64,
    alignment_mask: usize,
    /// Header size for `SlabHeader<M::Opt>`, computed once in `new` since
    /// `M::Opt`'s size (and therefore the header's layout) isn't known until
    /// the chain is parameterized over a concrete backend.
    data_offset: usize,
    partial: *mut SlabHeader<M::Opt>,
    empty: *mut SlabHeader<M::Opt>,
    full: *mut SlabHeader<M::Opt>,
    /// Set by `grow` when `alloc` just created a fresh backing allocation;
    /// the installer drains this with `take_last_grown` to know which
    /// allocations need sealing after their trampolines are written.
    last_grown: Option<Allocation<M::Opt>>,
    _marker: PhantomData<M>,
}

// SAFETY: all mutation of the raw intrusive lists happens through `&mut
// self`, same as `n1ght-hunter-rtmalloc`'s `SpanSlabInner`; the pointers
// never escape to another thread without that exclusive borrow.
unsafe impl<M: ExecutableMemory> Send for SlabChain<M> {}

impl<M: ExecutableMemory> SlabChain<M> {
    pub fn new(item_size: usize) -> Self {
        assert!(item_size >= 1);

        let data_offset = std::mem::size_of::<SlabHeader<M::Opt>>();
        let least_slabsize = data_offset + 64 * item_size;
        let mut slab_size = next_pow_2(least_slabsize);
        let mut item_count = 64;

        if slab_size - least_slabsize != 0 {
            let shrinked = slab_size >> 1;
            if data_offset < shrinked && shrinked - data_offset >= 2 * item_size {
                slab_size = shrinked;
                item_count = (shrinked - data_offset) / item_size;
            }
        }

        let pages_per_alloc = slab_size.max(SYSTEM_PAGE_SIZE);
        let empty_slotmask = if item_count >= 64 {
            u64::MAX
        } else {
            (1u64 << item_count) - 1
        };
        let initial_slotmask = empty_slotmask ^ 1;
        let alignment_mask = !(slab_size - 1);

        log::debug!(
            "slab chain: item_size={item_size} slab_size={slab_size} item_count={item_count}"
        );

        Self {
            item_size,
            item_count,
            slab_size,
            pages_per_alloc,
            empty_slotmask,
            initial_slotmask,
            alignment_mask,
            data_offset,
            partial: ptr::null_mut(),
            empty: ptr::null_mut(),
            full: ptr::null_mut(),
            last_grown: None,
            _marker: PhantomData,
        }
    }

    /// Take the allocation created by the most recent `alloc` call, if that
    /// call triggered a fresh `grow`. Returns `None` if the item came from
    /// an existing partial or empty slab.
    pub fn take_last_grown(&mut self) -> Option<Allocation<M::Opt>> {
        self.last_grown.take()
    }

    #[inline]
    fn data_ptr(&self, slab: *mut SlabHeader<M::Opt>) -> usize {
        slab as usize + self.data_offset
    }

    fn one_used_slot(&self, slots: u64) -> bool {
        let t = (!slots) & self.empty_slotmask;
        (t & t.wrapping_sub(1)) == 0
    }

    /// Allocate one item, returning its writable address and its executable
    /// mirror address. `opt` is the policy blob forwarded to the memory
    /// manager if (and only if) this call needs to grow the chain with a
    /// fresh backing allocation.
    pub fn alloc(&mut self, opt: M::Opt) -> Result<(usize, usize), HookError> {
        self.last_grown = None;
        unsafe {
            if !self.partial.is_null() {
                let slot = (*self.partial).slots.trailing_zeros() as usize;
                (*self.partial).slots ^= 1u64 << slot;

                if (*self.partial).slots == 0 {
                    let tmp = self.partial;
                    self.partial = (*tmp).next;
                    if !self.partial.is_null() {
                        (*self.partial).prev = ptr::null_mut();
                    }
                    (*tmp).next = self.full;
                    if !self.full.is_null() {
                        (*self.full).prev = tmp;
                    }
                    self.full = tmp;
                    let exe = (*self.full).exe_data + slot * self.item_size;
                    let data = self.data_ptr(self.full) + slot * self.item_size;
                    Ok((data, exe))
                } else {
                    let exe = (*self.partial).exe_data + slot * self.item_size;
                    let data = self.data_ptr(self.partial) + slot * self.item_size;
                    Ok((data, exe))
                }
            } else if !self.empty.is_null() {
                self.partial = self.empty;
                self.empty = (*self.partial).next;
                if !self.empty.is_null() {
                    (*self.empty).prev = ptr::null_mut();
                }
                (*self.partial).next = ptr::null_mut();

                if (*self.partial).refcount != 0 {
                    (*self.partial).refcount += 1;
                } else {
                    (*(*self.partial).page).refcount += 1;
                }

                (*self.partial).slots = self.initial_slotmask;
                let exe = (*self.partial).exe_data;
                let data = self.data_ptr(self.partial);
                Ok((data, exe))
            } else {
                self.grow(opt)?;
                let exe = (*self.partial).exe_data;
                let data = self.data_ptr(self.partial);
                Ok((data, exe))
            }
        }
    }

    fn grow(&mut self, opt: M::Opt) -> Result<(), HookError> {
        let alloc = M::alloc_unsealed(self.pages_per_alloc, opt)?;
        let base_w = alloc.writable;
        let base_x = alloc.executable;
        let n_slabs = (self.pages_per_alloc / self.slab_size).max(1);

        self.last_grown = Some(alloc);

        let anchor = base_w as *mut SlabHeader<M::Opt>;
        unsafe {
            ptr::write(
                anchor,
                SlabHeader {
                    prev: ptr::null_mut(),
                    next: ptr::null_mut(),
                    page: ptr::null_mut(),
                    refcount: 1,
                    slots: self.initial_slotmask,
                    exe_data: base_x + self.data_offset,
                    alloc: Some(alloc),
                },
            );
        }
        self.partial = anchor;

        let mut prev: *mut SlabHeader<M::Opt> = ptr::null_mut();
        for i in 1..n_slabs {
            let slab = (base_w + i * self.slab_size) as *mut SlabHeader<M::Opt>;
            unsafe {
                ptr::write(
                    slab,
                    SlabHeader {
                        prev,
                        next: ptr::null_mut(),
                        page: anchor,
                        refcount: 0,
                        slots: self.empty_slotmask,
                        exe_data: base_x + i * self.slab_size + self.data_offset,
                        alloc: None,
                    },
                );
                if prev.is_null() {
                    self.empty = slab;
                } else {
                    (*prev).next = slab;
                }
                prev = slab;
            }
        }

        log::trace!("grew slab chain by {n_slabs} slabs at {base_w:#x}");
        Ok(())
    }

    /// Return an item to the chain.
    ///
    /// # Safety
    /// `addr` must be the writable address of an item previously returned
    /// by `alloc` on this chain, and must not already be freed.
    pub unsafe fn free(&mut self, addr: usize) {
        let slab = (addr & self.alignment_mask) as *mut SlabHeader<M::Opt>;
        let slot = (addr - slab as usize - self.data_offset) / self.item_size;

        unsafe {
            if (*slab).slots == 0 {
                (*slab).slots = 1u64 << slot;
                self.unlink(slab, ListKind::Full);
                self.push_front(slab, ListKind::Partial);
            } else if self.one_used_slot((*slab).slots) {
                let anchor_refcount_is_one = if (*slab).refcount != 0 {
                    (*slab).refcount == 1
                } else {
                    (*(*slab).page).refcount == 1
                };

                if anchor_refcount_is_one {
                    self.unlink(slab, ListKind::Partial);

                    let page = if (*slab).refcount != 0 {
                        slab
                    } else {
                        (*slab).page
                    };
                    let page_end = page as usize + self.pages_per_alloc;
                    let mut found_empty_head = false;
                    let mut cursor = page as usize;
                    while cursor != page_end {
                        let sibling = cursor as *mut SlabHeader<M::Opt>;
                        if sibling == self.empty {
                            found_empty_head = true;
                        } else if sibling != slab {
                            let p = (*sibling).prev;
                            let n = (*sibling).next;
                            if !p.is_null() {
                                (*p).next = n;
                            }
                            if !n.is_null() {
                                (*n).prev = p;
                            }
                        }
                        cursor += self.slab_size;
                    }
                    if found_empty_head {
                        self.empty = (*self.empty).next;
                        if !self.empty.is_null() {
                            (*self.empty).prev = ptr::null_mut();
                        }
                    }

                    let owned = (*page)
                        .alloc
                        .take()
                        .expect("anchor slab must own its backing allocation");
                    if let Err(e) = M::free(&owned) {
                        log::warn!("failed to free backing allocation: {e}");
                    }
                } else {
                    (*slab).slots = self.empty_slotmask;
                    self.unlink(slab, ListKind::Partial);
                    self.push_front(slab, ListKind::Empty);

                    if (*slab).refcount != 0 {
                        (*slab).refcount -= 1;
                    } else {
                        (*(*slab).page).refcount -= 1;
                    }
                }
            } else {
                (*slab).slots |= 1u64 << slot;
            }
        }
    }

    unsafe fn unlink(&mut self, slab: *mut SlabHeader<M::Opt>, from: ListKind) {
        unsafe {
            let head = self.list_mut(from);
            if slab != *head {
                let p = (*slab).prev;
                let n = (*slab).next;
                if !p.is_null() {
                    (*p).next = n;
                }
                if !n.is_null() {
                    (*n).prev = p;
                }
                (*slab).prev = ptr::null_mut();
            } else {
                *head = (*slab).next;
                if !(*head).is_null() {
                    (**head).prev = ptr::null_mut();
                }
            }
            (*slab).next = ptr::null_mut();
        }
    }

    unsafe fn push_front(&mut self, slab: *mut SlabHeader<M::Opt>, onto: ListKind) {
        unsafe {
            let head = self.list_mut(onto);
            (*slab).next = *head;
            if !(*slab).next.is_null() {
                (*(*slab).next).prev = slab;
            }
            (*slab).prev = ptr::null_mut();
            *head = slab;
        }
    }

    fn list_mut(&mut self, kind: ListKind) -> &mut *mut SlabHeader<M::Opt> {
        match kind {
            ListKind::Partial => &mut self.partial,
            ListKind::Empty => &mut self.empty,
            ListKind::Full => &mut self.full,
        }
    }

    /// The executable-view address corresponding to a writable address
    /// previously returned by `alloc`.
    pub fn mirror(&self, addr: usize) -> usize {
        let slab = (addr & self.alignment_mask) as *mut SlabHeader<M::Opt>;
        unsafe { (*slab).exe_data + (addr - self.data_ptr(slab)) }
    }

    /// Visit every live (allocated) item across all slabs.
    pub fn traverse(&self, mut f: impl FnMut(usize)) {
        unsafe {
            let mut slab = self.partial;
            while !slab.is_null() {
                let base = self.data_ptr(slab);
                for i in 0..self.item_count {
                    if (*slab).slots & (1u64 << i) == 0 {
                        f(base + i * self.item_size);
                    }
                }
                slab = (*slab).next;
            }
            let mut slab = self.full;
            while !slab.is_null() {
                let base = self.data_ptr(slab);
                for i in 0..self.item_count {
                    f(base + i * self.item_size);
                }
                slab = (*slab).next;
            }
        }
    }

    #[cfg(test)]
    fn live_slot_count(&self) -> usize {
        let mut n = 0;
        self.traverse(|_| n += 1);
        n
    }
}

#[derive(Clone, Copy)]
enum ListKind {
    Partial,
    Empty,
    Full,
}

impl<M: ExecutableMemory> Drop for SlabChain<M> {
    fn drop(&mut self) {
        for head in [self.partial, self.empty, self.full] {
            let mut slab = head;
            while !slab.is_null() {
                let next = unsafe { (*slab).next };
                if let Some(alloc) = unsafe { (*slab).alloc.take() } {
                    if let Err(e) = unsafe { M::free(&alloc) } {
                        log::warn!("failed to free backing allocation on drop: {e}");
                    }
                }
                slab = next;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::ForeignWrite;
    use std::alloc::{alloc_zeroed, dealloc, Layout};

    /// A heap-backed stand-in for the OS memory manager, used so slab logic
    /// can be tested without mapping real executable pages.
    struct TestMemory;

    impl ExecutableMemory for TestMemory {
        type Opt = ();

        fn alloc_unsealed(size: usize, opt: ()) -> Result<Allocation<()>, HookError> {
            let layout = Layout::from_size_align(size, 4096).unwrap();
            let ptr = unsafe { alloc_zeroed(layout) };
            if ptr.is_null() {
                return Err(HookError::OutOfMemory);
            }
            let addr = ptr as usize;
            Ok(Allocation {
                writable: addr,
                executable: addr,
                size,
                opt,
            })
        }

        unsafe fn seal(_alloc: &Allocation<()>) -> Result<(), HookError> {
            Ok(())
        }

        unsafe fn free(alloc: &Allocation<()>) -> Result<(), HookError> {
            let layout = Layout::from_size_align(alloc.size, 4096).unwrap();
            unsafe { dealloc(alloc.writable as *mut u8, layout) };
            Ok(())
        }

        unsafe fn foreign_write_with_pc_patch(_writes: &[ForeignWrite<()>]) -> Result<(), HookError> {
            Ok(())
        }
    }

    #[test]
    fn alloc_free_single_item() {
        let mut chain = SlabChain::<TestMemory>::new(32);
        let (w, x) = chain.alloc(()).unwrap();
        assert_ne!(w, 0);
        assert_eq!(chain.mirror(w), x);
        assert_eq!(chain.live_slot_count(), 1);
        unsafe { chain.free(w) };
        assert_eq!(chain.live_slot_count(), 0);
    }

    #[test]
    fn alloc_does_not_overlap() {
        let mut chain = SlabChain::<TestMemory>::new(32);
        let mut addrs = Vec::new();
        for _ in 0..10 {
            addrs.push(chain.alloc(()).unwrap().0);
        }
        let mut sorted = addrs.clone();
        sorted.sort_unstable();
        sorted.dedup();
        assert_eq!(sorted.len(), addrs.len(), "overlapping allocations");
        for a in addrs {
            unsafe { chain.free(a) };
        }
    }

    #[test]
    fn alignment_invariant_holds() {
        let mut chain = SlabChain::<TestMemory>::new(64);
        for _ in 0..5 {
            let (w, _) = chain.alloc(()).unwrap();
            assert_eq!(w & !chain.alignment_mask, w - (w & chain.alignment_mask));
        }
    }

    #[test]
    fn wraps_across_many_slabs() {
        let mut chain = SlabChain::<TestMemory>::new(16);
        let per_slab = chain.item_count;
        let total = per_slab * 2 + 2;

        let mut addrs = Vec::new();
        for _ in 0..total {
            addrs.push(chain.alloc(()).unwrap().0);
        }
        assert_eq!(chain.live_slot_count(), total);

        // Free every other one.
        let mut kept = Vec::new();
        for (i, a) in addrs.into_iter().enumerate() {
            if i % 2 == 0 {
                unsafe { chain.free(a) };
            } else {
                kept.push(a);
            }
        }
        let half = kept.len();
        assert_eq!(chain.live_slot_count(), half);

        for _ in 0..half {
            kept.push(chain.alloc(()).unwrap().0);
        }
        assert_eq!(chain.live_slot_count(), half * 2);

        let mut sorted = kept.clone();
        sorted.sort_unstable();
        sorted.dedup();
        assert_eq!(sorted.len(), kept.len());

        for a in kept {
            unsafe { chain.free(a) };
        }
        assert_eq!(chain.live_slot_count(), 0);
    }

    #[test]
    fn freeing_last_item_unmaps_allocation() {
        let mut chain = SlabChain::<TestMemory>::new(64);
        let (w, _) = chain.alloc(()).unwrap();
        assert_eq!(chain.live_slot_count(), 1);
        unsafe { chain.free(w) };
        assert_eq!(chain.live_slot_count(), 0);
        assert!(chain.partial.is_null());
        assert!(chain.empty.is_null());
        assert!(chain.full.is_null());
    }
}
