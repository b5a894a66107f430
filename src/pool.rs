//! The block pool and its lock-free freelist.
//!
//! The pool is a fixed contiguous array of [`Block`] records laid over a
//! caller-owned buffer, addressed by 16-bit slot numbers with slot 0
//! reserved as the null sentinel. Unused slots form a Treiber stack
//! threaded through each block's `child` field.
//!
//! The stack head is a single 32-bit word packing `[tag:16][index:16]`.
//! A plain index head would be subject to the ABA problem: a slow
//! allocator that loaded head `A` could succeed in a later CAS even
//! though `A` was popped, recycled and pushed back in the meantime,
//! installing a stale next pointer and corrupting the stack. Folding a
//! counter, bumped on every pop attempt, into the high 16 bits makes the
//! stale install fail: the recycled head comes back with a different tag.

use core::cmp;
use core::mem;
use core::ptr;
use core::sync::atomic::{AtomicBool, AtomicPtr, AtomicU16, AtomicU32, Ordering};

use bytemuck::Zeroable;

use crate::block::{self, Block};

/// Upper bound on pool capacity; slots are 16-bit and slot 0 never
/// leaves the pool.
pub(crate) const MAX_BLOCKS: usize = 65535;

pub(crate) struct Pool {
    blocks: AtomicPtr<Block>,
    capacity: AtomicU32,
    // [tag:16][index:16]; index 0 means empty
    head: AtomicU32,
    tag: AtomicU32,
    warned: AtomicBool,
}

/// Atomic view of a block's `child` field.
///
/// The freelist races on this one field: a stale allocator may still
/// load `child` of a block that was just popped by someone else, so all
/// freelist-side accesses go through this view. Every other block field
/// is only touched under exclusive ownership.
unsafe fn child_atomic(block: *mut Block) -> &'static AtomicU16 {
    &*(ptr::addr_of_mut!((*block).child) as *const AtomicU16)
}

/// Zeroes a freshly claimed block; `child` goes through the atomic view.
unsafe fn reset(block: *mut Block) {
    child_atomic(block).store(0, Ordering::Relaxed);
    (*block).previous = 0;
    (*block).sibling = 0;
    (*block).id = 0;
    (*block).parentid = 0;
    (*block).processor = 0;
    (*block).thread = 0;
    (*block).start = 0;
    (*block).end = 0;
    (*block).name = [0; block::NAME_SIZE];
}

impl Pool {
    pub const fn new() -> Self {
        Pool {
            blocks: AtomicPtr::new(ptr::null_mut()),
            capacity: AtomicU32::new(0),
            head: AtomicU32::new(0),
            tag: AtomicU32::new(0),
            warned: AtomicBool::new(false),
        }
    }

    /// Interprets `memory` as the block array and threads the initial
    /// freelist through it.
    ///
    /// The buffer start is aligned up as needed, so part of it may go
    /// unused. Returns the number of slots, including the reserved
    /// sentinel, or 0 if the buffer cannot hold a single block.
    pub fn attach(&self, memory: &'static mut [u8]) -> u32 {
        let mut p = memory.as_mut_ptr();
        let mut len = memory.len();

        let align = mem::align_of::<Block>();
        let rem = (p as usize) % align;
        if rem != 0 {
            let offset = align - rem;
            if offset >= len {
                return 0;
            }
            p = unsafe { p.add(offset) };
            len -= offset;
        }

        let capacity = cmp::min(len / block::RECORD_SIZE, MAX_BLOCKS) as u32;
        if capacity == 0 {
            return 0;
        }

        let blocks = p as *mut Block;
        unsafe {
            // slot 0 is the sentinel; slot i links to i + 1, the last
            // slot terminates the list
            for i in 0..capacity {
                let b = blocks.add(i as usize);
                *b = Block::zeroed();
                if i != 0 && i + 1 < capacity {
                    (*b).child = (i + 1) as u16;
                }
            }
        }

        self.blocks.store(blocks, Ordering::Relaxed);
        self.capacity.store(capacity, Ordering::Relaxed);
        self.warned.store(false, Ordering::Relaxed);
        self.head
            .store(if capacity > 1 { 1 } else { 0 }, Ordering::Release);
        capacity
    }

    /// Takes the pool offline. Stale producers may still write into the
    /// caller-owned buffer; the drained head keeps them from claiming
    /// new slots.
    pub fn detach(&self) {
        self.head.store(0, Ordering::Release);
        self.capacity.store(0, Ordering::Relaxed);
    }

    pub fn is_attached(&self) -> bool {
        self.capacity.load(Ordering::Relaxed) != 0
    }

    pub fn capacity(&self) -> u32 {
        self.capacity.load(Ordering::Relaxed)
    }

    /// Returns the block at `slot`.
    ///
    /// `slot` must be nonzero and in range, and the caller must own the
    /// block (hold it allocated, or own the detached tree it sits in).
    pub unsafe fn get(&self, slot: u16) -> *mut Block {
        debug_assert_ne!(slot, 0);
        self.blocks.load(Ordering::Relaxed).add(slot as usize)
    }

    /// Claims a slot from the pool; the block comes back zeroed.
    ///
    /// Returns `None` when the pool is observed as exhausted. The event
    /// is dropped; a one-shot warning goes to the host log.
    ///
    /// *NOTE:* This method does *not* have bounded execution time; i.e. it contains a CAS loop
    pub fn alloc(&self) -> Option<u16> {
        let mut head = self.head.load(Ordering::Acquire);
        loop {
            let index = (head & 0xffff) as u16;
            if index == 0 {
                if !self.warned.swap(true, Ordering::Relaxed) {
                    log::warn!(
                        "block pool exhausted; dropping events \
                         (grow the pool buffer or lower the output wait)"
                    );
                }
                return None;
            }

            let next = unsafe { child_atomic(self.get(index)).load(Ordering::Relaxed) };
            let tag = self.tag.fetch_add(1, Ordering::Relaxed).wrapping_add(1) & 0xffff;
            let proposed = u32::from(next) | (tag << 16);

            match self
                .head
                .compare_exchange_weak(head, proposed, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => {
                    unsafe { reset(self.get(index)) }
                    return Some(index);
                }
                // head was changed by another producer or the drain
                Err(h) => head = h,
            }
        }
    }

    /// Returns a chain of blocks, linked through `child` from `first`
    /// down to `last`, to the freelist in one shot.
    ///
    /// *NOTE:* This method does *not* have bounded execution time; i.e. it contains a CAS loop
    pub fn free_chain(&self, first: u16, last: u16) {
        let tag = self.tag.fetch_add(1, Ordering::Relaxed).wrapping_add(1) & 0xffff;
        let proposed = u32::from(first) | (tag << 16);

        let mut head = self.head.load(Ordering::Relaxed);
        loop {
            unsafe { child_atomic(self.get(last)).store((head & 0xffff) as u16, Ordering::Relaxed) }
            match self
                .head
                .compare_exchange_weak(head, proposed, Ordering::Release, Ordering::Relaxed)
            {
                Ok(_) => return,
                Err(h) => head = h,
            }
        }
    }

    /// Walks the freelist and returns how many blocks are free and how
    /// many of those still carry a stale `sibling` link. Only meaningful
    /// at quiescence; used by the shutdown accounting check.
    pub fn accounting(&self) -> (u32, u32) {
        let capacity = self.capacity.load(Ordering::Relaxed);
        let mut free = 0;
        let mut stale = 0;
        let mut slot = (self.head.load(Ordering::Acquire) & 0xffff) as u16;
        while slot != 0 && free <= capacity {
            free += 1;
            unsafe {
                let b = self.get(slot);
                if (*b).sibling != 0 {
                    stale += 1;
                }
                slot = (*b).child;
            }
        }
        (free, stale)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn buffer(blocks: usize) -> &'static mut [u8] {
        bytemuck::cast_slice_mut(Box::leak(vec![0u64; blocks * 8].into_boxed_slice()))
    }

    #[test]
    fn rejects_undersized_buffers() {
        let pool = Pool::new();
        assert_eq!(pool.attach(buffer(0)), 0);
        assert!(!pool.is_attached());
        assert!(pool.alloc().is_none());
    }

    #[test]
    fn sentinel_slot_is_never_handed_out() {
        let pool = Pool::new();
        // room for the sentinel only
        assert_eq!(pool.attach(buffer(1)), 1);
        assert!(pool.alloc().is_none());
    }

    #[test]
    fn allocates_in_freelist_order_and_recycles() {
        let pool = Pool::new();
        assert_eq!(pool.attach(buffer(4)), 4);

        let a = pool.alloc().unwrap();
        let b = pool.alloc().unwrap();
        let c = pool.alloc().unwrap();
        assert_eq!((a, b, c), (1, 2, 3));

        // pool exhausted
        assert!(pool.alloc().is_none());

        // chain a -> b -> c through `child` and give it all back
        unsafe {
            (*pool.get(a)).child = b;
            (*pool.get(b)).child = c;
        }
        pool.free_chain(a, c);

        assert_eq!(pool.accounting(), (3, 0));

        // should be possible to allocate again, and the block is clean
        let again = pool.alloc().unwrap();
        assert_eq!(again, a);
        unsafe {
            assert_eq!((*pool.get(again)).child, 0);
            assert_eq!((*pool.get(again)).id, 0);
        }
    }

    #[test]
    fn head_tag_advances_across_recycles() {
        let pool = Pool::new();
        pool.attach(buffer(3));

        let before = pool.head.load(Ordering::Relaxed) >> 16;
        let slot = pool.alloc().unwrap();
        pool.free_chain(slot, slot);
        let after = pool.head.load(Ordering::Relaxed) >> 16;

        assert_ne!(before, after);
    }
}
