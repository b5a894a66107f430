//! The fixed-size block record and the serialized stream layout.

use core::mem;

use bytemuck::{Pod, Zeroable};
use static_assertions::const_assert_eq;

/// Size in bytes of one record as handed to the writer callback.
pub const RECORD_SIZE: usize = 64;

/// Length of the defined serialized prefix of a record; the remaining
/// 6 bytes hold in-pool links and writers should treat them as opaque
/// padding.
pub const RECORD_PREFIX_SIZE: usize = 58;

/// Maximum number of significant bytes in a block name; longer messages
/// are split across continuation blocks.
pub const NAME_MAX: usize = 25;

pub(crate) const NAME_SIZE: usize = NAME_MAX + 1;

/// End-of-stream marker, emitted as the last record of a stream.
pub const ID_END_OF_STREAM: i32 = 0;
/// System information record; `start` holds the tick rate of the clock.
pub const ID_SYSINFO: i32 = 1;
/// Log message. Continuations of a long message carry this id plus one.
pub const ID_LOG: i32 = 2;
/// End-of-frame marker; `end` holds the caller-supplied frame counter.
pub const ID_END_FRAME: i32 = 4;
/// Lock acquisition attempt.
pub const ID_TRY_LOCK: i32 = 5;
/// Lock acquisition.
pub const ID_LOCK: i32 = 7;
/// Lock release.
pub const ID_UNLOCK: i32 = 9;
/// Wait on a synchronization primitive.
pub const ID_WAIT: i32 = 11;
/// Signal of a synchronization primitive.
pub const ID_SIGNAL: i32 = 12;
/// First id handed out to user scopes; [0, 127] is reserved for the
/// event kinds above.
pub const ID_USER: i32 = 128;

/// One profiling event.
///
/// The first 58 bytes are the serialized record prefix, in the field
/// order below, native byte order. The trailing `previous` / `sibling` /
/// `child` fields thread the block into the in-pool tree structures and
/// carry no meaning once a record has been written out.
///
/// For message-class records (`ID_LOG` and friends) the `end` field is
/// not a tick but a sequence number drawn from the shared scope counter;
/// continuation blocks point back at it through `parentid`.
#[repr(C)]
#[derive(Clone, Copy, Pod, Zeroable)]
pub struct Block {
    /// Event kind: one of the reserved ids, or a monotonically assigned
    /// scope identifier starting at [`ID_USER`].
    pub id: i32,
    /// Scope id of the enclosing scope, 0 at top level. Continuation
    /// blocks store the predecessor's sequence number here instead.
    pub parentid: i32,
    /// Hardware core captured when the block was started.
    pub processor: u32,
    /// Identifier of the producing thread.
    pub thread: u32,
    /// Start tick relative to the ground time; the sysinfo record stores
    /// the clock's ticks-per-second here.
    pub start: u64,
    /// End tick relative to the ground time, or the sequence number of a
    /// message block.
    pub end: u64,
    /// NUL-terminated name, up to [`NAME_MAX`] significant bytes.
    pub name: [u8; NAME_SIZE],
    /// In-pool back link: the parent for the most recent child, an
    /// earlier sibling otherwise.
    pub previous: u16,
    /// Next sibling in the parent's child list, 0 at the end.
    pub sibling: u16,
    /// First (most recently inserted) child; doubles as the freelist
    /// link while the block is free.
    pub child: u16,
}

const_assert_eq!(mem::size_of::<Block>(), RECORD_SIZE);
const_assert_eq!(mem::align_of::<Block>(), mem::align_of::<u64>());

impl Block {
    /// Copies up to [`NAME_MAX`] bytes of `name` into the block and
    /// returns how many were taken.
    pub(crate) fn set_name(&mut self, name: &[u8]) -> usize {
        let taken = name.len().min(NAME_MAX);
        self.name[..taken].copy_from_slice(&name[..taken]);
        taken
    }
}
