//! The drain worker: detaches completed trees, flattens them into the
//! output stream and recycles their blocks.

use bytemuck::Zeroable;

use crate::block::{self, Block};
use crate::platform;
use crate::pool::Pool;
use crate::profiler::Profiler;

/// Stack reserve for the `profile-io` thread; the flattening recursion
/// is bounded by pool capacity, one frame per block in the worst case.
pub(crate) const DRAIN_STACK_SIZE: usize = 8 * 1024 * 1024;

// a sysinfo record goes out once every this many productive wakes
const SYSINFO_INTERVAL: u32 = 11;

impl Profiler {
    /// Body of the `profile-io` thread.
    pub(crate) fn drain_loop(&'static self) {
        let mut wakes = 0;
        while !self.wait_exit() {
            self.drain_cycle(&mut wakes);
        }
        // pick up whatever was published between the last wake and the
        // shutdown request, then terminate the stream
        self.drain_cycle(&mut wakes);
        self.emit_end_of_stream();
    }

    /// One drain pass: detach the root chain, flatten and emit every
    /// tree, recycle the blocks and keep the sysinfo cadence. Does
    /// nothing when no tree has been completed since the last pass.
    pub(crate) fn drain_cycle(&self, wakes: &mut u32) {
        if self.root.is_empty() {
            return;
        }

        // the drain's own cost shows up in the trace like any other scope
        self.begin_block("profile_io");
        self.begin_block("process");

        {
            let mut guard = self.writer_lock();
            match guard.as_mut() {
                Some(write) => self.process_chain(&mut **write),
                None => self.process_chain(&mut |_: &[u8]| {}),
            }
        }

        self.end_block();

        *wakes += 1;
        if *wakes % SYSINFO_INTERVAL == 0 {
            self.emit_sysinfo();
        }

        self.end_block();
    }

    /// Flattens and frees any residual trees without emitting; used once
    /// the record stream has already been terminated.
    pub(crate) fn reclaim_silently(&self) {
        self.process_chain(&mut |_: &[u8]| {});
    }

    fn process_chain(&self, write: &mut dyn FnMut(&[u8])) {
        let mut root = self.root.detach();
        while root != 0 {
            unsafe {
                let b = self.pool.get(root);
                let next = (*b).sibling;
                // sever the tree before the flattening rewrites its links
                (*b).sibling = 0;
                let leaf = process_tree(&self.pool, write, root);
                self.pool.free_chain(root, leaf);
                root = next;
            }
        }
    }

    fn emit_sysinfo(&self) {
        let mut record = Block::zeroed();
        record.id = block::ID_SYSINFO;
        record.start = platform::ticks_per_second();
        record.set_name(b"sysinfo");
        self.emit(&record);
    }

    fn emit_end_of_stream(&self) {
        self.emit(&Block::zeroed());
    }

    fn emit(&self, record: &Block) {
        if let Some(write) = self.writer_lock().as_mut() {
            write(bytemuck::bytes_of(record));
        }
    }
}

/// Serializes the tree rooted at `slot` in child-then-sibling preorder
/// and rewrites it, in place, into a single chain linked through
/// `child`. Returns the tail of that chain, so the whole tree can go
/// back to the freelist in one call.
///
/// The caller must own the tree exclusively; the blocks are garbage
/// (from the tree's point of view) once this returns.
pub(crate) unsafe fn process_tree(
    pool: &Pool,
    write: &mut dyn FnMut(&[u8]),
    slot: u16,
) -> u16 {
    let b = pool.get(slot);
    write(bytemuck::bytes_of(&*b));

    let child = (*b).child;
    let sibling = (*b).sibling;

    #[cfg(feature = "sanity-checks")]
    {
        if child != 0 {
            assert_eq!(
                (*pool.get(child)).previous,
                slot,
                "first child does not point back at its parent"
            );
        }
    }

    if child != 0 {
        let leaf = process_tree(pool, write, child);
        if sibling != 0 {
            let subleaf = process_tree(pool, write, sibling);
            // splice the sibling chain in between this block and its
            // child chain
            (*pool.get(subleaf)).child = child;
            (*b).child = sibling;
            (*b).sibling = 0;
        }
        leaf
    } else if sibling != 0 {
        let leaf = process_tree(pool, write, sibling);
        (*b).child = sibling;
        (*b).sibling = 0;
        leaf
    } else {
        slot
    }
}
