//! A low-overhead, in-process hierarchical profiler
//!
//! Producer threads record timed, nested scopes ("blocks") for the cost
//! of a handful of atomic operations and stores per event, cheap enough
//! to stay enabled in production-like builds. Completed scope trees are
//! handed off to a background drain thread which serializes them as
//! fixed-size records through a user-supplied writer, for a viewer or a
//! later analysis pass to consume.
//!
//! The engine is a fixed-capacity pool of 64-byte block records laid
//! over a caller-owned buffer, addressed by 16-bit slot numbers. Free
//! slots form a lock-free stack; each thread grows a tree of open and
//! recently closed scopes in place, and publishes the tree to a global
//! root chain when its outermost scope closes. The drain detaches that
//! chain, flattens every tree into the output stream and returns the
//! slots to the free stack in bulk.
//!
//! # Examples
//!
//! ```
//! // the pool memory is caller-owned; room for 1024 blocks
//! let memory = Box::leak(vec![0u8; 1024 * 64].into_boxed_slice());
//!
//! blockprof::initialize("example", memory);
//! blockprof::set_output(Some(Box::new(|record: &[u8]| {
//!     // ship `record` to a file, a socket, ..
//!     let _ = record;
//! })));
//! blockprof::enable(true);
//!
//! blockprof::begin_block("frame");
//! // .. do stuff ..
//! blockprof::log("still alive");
//! blockprof::end_block();
//!
//! blockprof::finalize();
//! ```
//!
//! # Portability
//!
//! The free stack is a Treiber stack which is known to be susceptible to
//! the ABA problem: between one allocator's load of the stack head and
//! its compare-and-swap, other threads may pop the head, recycle it and
//! push it back, so the CAS would succeed against a re-used head and
//! install a stale next pointer. Rather than relying on LL/SC semantics,
//! the stack head here packs a 16-bit tag next to the 16-bit slot index
//! in a single 32-bit word; the tag is bumped on every pop attempt, so a
//! stale install fails the CAS. The root chain always installs against
//! an observed zero and needs no tag.
//!
//! Timestamps are nanoseconds from a monotonic clock, hardware-core ids
//! come from the host scheduler where available (Linux), and records are
//! written in the native byte order of the producing process.
//!
//! # Dropped events
//!
//! Producers never block and never fail: when the pool is exhausted,
//! events are dropped (a one-shot warning goes to the host log) until
//! the drain catches up. Size the pool to the expected number of
//! in-flight blocks, which is bounded by scope depth times thread count
//! plus the events completed between two drain passes.

#![deny(missing_docs)]
#![deny(warnings)]

mod block;
mod chain;
mod drain;
mod platform;
mod pool;
mod profiler;
#[cfg(test)]
mod tests;

pub use crate::block::{
    Block, ID_END_FRAME, ID_END_OF_STREAM, ID_LOCK, ID_LOG, ID_SIGNAL, ID_SYSINFO, ID_TRY_LOCK,
    ID_UNLOCK, ID_USER, ID_WAIT, NAME_MAX, RECORD_PREFIX_SIZE, RECORD_SIZE,
};

use crate::profiler::PROFILER;

/// Byte-writer callback for the serialized record stream.
///
/// Called only from the drain thread, always with one full record of
/// [`RECORD_SIZE`] bytes; the first [`RECORD_PREFIX_SIZE`] bytes are the
/// defined layout and the rest is padding that writers should preserve.
/// The callback is assumed infallible; a fallible sink must absorb its
/// own errors.
pub type Writer = Box<dyn FnMut(&[u8]) + Send>;

/// Interprets the caller-owned `memory` as the block pool and prepares
/// the profiler for use.
///
/// The pool holds `min(memory.len() / 64, 65535)` blocks, one of which
/// is reserved. `identifier` names this profiler in host log messages.
/// Profiling stays off until [`enable`] is called.
pub fn initialize(identifier: &str, memory: &'static mut [u8]) {
    PROFILER.initialize(identifier, memory)
}

/// Shuts the profiler down: disables it, closes any scopes left open by
/// the calling thread, reclaims all outstanding blocks and verifies pool
/// accounting (mismatches are reported through the host log).
pub fn finalize() {
    PROFILER.finalize()
}

/// Installs the writer that consumes the record stream, or uninstalls it
/// with `None`. Records are still produced and recycled without a
/// writer, just not emitted.
pub fn set_output(writer: Option<Writer>) {
    PROFILER.set_output(writer)
}

/// Sets the drain period in milliseconds (clamped to at least 1).
pub fn set_output_wait(ms: u64) {
    PROFILER.set_output_wait(ms)
}

/// Turns profiling on or off. Idempotent; turning on starts the drain
/// thread, turning off requests shutdown, waits for the final drain and
/// the end-of-stream record, and joins the thread.
pub fn enable(enabled: bool) {
    PROFILER.enable(enabled)
}

/// Opens a timed scope on the calling thread, nested inside the
/// currently open one. Names keep their first [`NAME_MAX`] bytes.
pub fn begin_block(name: &str) {
    PROFILER.begin_block(name)
}

/// Closes the deepest open scope on the calling thread. Closing the
/// outermost scope publishes the finished tree to the drain.
pub fn end_block() {
    PROFILER.end_block()
}

/// Mid-scope checkpoint for hot loops: if the thread has migrated to
/// another hardware core since the open scope started, the scope is
/// split into adjacent segments with the same name, so CPU time stays
/// attributable to one core per record.
pub fn update_block() {
    PROFILER.update_block()
}

/// Emits a frame demarcation marker carrying `counter`, e.g. a frame
/// number, in the record's `end` field.
pub fn end_frame(counter: u64) {
    PROFILER.end_frame(counter)
}

/// Records a log message. Messages longer than [`NAME_MAX`] bytes are
/// split across continuation records linked by sequence numbers.
pub fn log(message: &str) {
    PROFILER.message(block::ID_LOG, message)
}

/// Records a lock acquisition attempt on the named lock.
pub fn try_lock(name: &str) {
    PROFILER.message(block::ID_TRY_LOCK, name)
}

/// Records a lock acquisition.
pub fn lock(name: &str) {
    PROFILER.message(block::ID_LOCK, name)
}

/// Records a lock release.
pub fn unlock(name: &str) {
    PROFILER.message(block::ID_UNLOCK, name)
}

/// Records a wait on the named synchronization primitive.
pub fn wait(name: &str) {
    PROFILER.message(block::ID_WAIT, name)
}

/// Records a signal of the named synchronization primitive.
pub fn signal(name: &str) {
    PROFILER.message(block::ID_SIGNAL, name)
}

/// Closes any scopes the calling thread still has open, from deepest to
/// outermost. Runs automatically when a producer thread exits; call it
/// explicitly to flush earlier.
pub fn thread_finalize() {
    PROFILER.thread_finalize()
}
