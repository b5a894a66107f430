//! The root chain: handoff of completed trees from producers to the
//! drain.
//!
//! A single 32-bit atomic names the head of a list of finished top-level
//! trees, linked through `sibling`. Producers install with a CAS from 0
//! and merge by stealing on contention; the drain detaches the whole
//! chain with a swap. Because every install starts from an observed 0,
//! the chain needs no tag to stay ABA-free.

use core::sync::atomic::{AtomicU32, Ordering};

use crate::pool::Pool;

pub(crate) struct RootChain {
    head: AtomicU32,
}

impl RootChain {
    pub const fn new() -> Self {
        RootChain {
            head: AtomicU32::new(0),
        }
    }

    pub fn reset(&self) {
        self.head.store(0, Ordering::Release);
    }

    pub fn is_empty(&self) -> bool {
        self.head.load(Ordering::Relaxed) == 0
    }

    /// Publishes a completed top-level tree.
    ///
    /// `block` must be the root of a tree this thread owns, with a zero
    /// `sibling`. On contention the publisher steals the current head
    /// and hangs it off the tail of its own sibling chain, then retries;
    /// sibling order at the root level carries no meaning, the children
    /// of each tree stay intact.
    pub fn publish(&self, pool: &Pool, block: u16) {
        loop {
            if self
                .head
                .compare_exchange(0, u32::from(block), Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return;
            }

            let stolen = self.head.swap(0, Ordering::AcqRel) as u16;
            if stolen == 0 {
                // lost the head to the drain or another publisher
                continue;
            }

            unsafe {
                let b = pool.get(block);
                if (*b).sibling != 0 {
                    let mut leaf = (*b).sibling;
                    while (*pool.get(leaf)).sibling != 0 {
                        leaf = (*pool.get(leaf)).sibling;
                    }
                    (*pool.get(stolen)).previous = leaf;
                    (*pool.get(leaf)).sibling = stolen;
                } else {
                    (*b).sibling = stolen;
                }
            }
        }
    }

    /// Detaches the whole chain, yielding a privately owned list of
    /// trees linked through `sibling`; 0 when the chain was empty.
    pub fn detach(&self) -> u16 {
        self.head.swap(0, Ordering::AcqRel) as u16
    }
}
