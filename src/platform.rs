//! Host platform queries: clock, hardware core and thread id.
//!
//! These are the only points of contact with the operating system;
//! everything else in the crate is plain memory and atomics.

use std::cell::Cell;
use std::sync::OnceLock;
use std::time::Instant;

/// Ticks (nanoseconds) elapsed since the first query in this process.
pub(crate) fn ticks() -> u64 {
    static EPOCH: OnceLock<Instant> = OnceLock::new();
    EPOCH.get_or_init(Instant::now).elapsed().as_nanos() as u64
}

/// Tick rate of the clock behind [`ticks`].
pub(crate) fn ticks_per_second() -> u64 {
    1_000_000_000
}

/// Hardware core currently executing the calling thread, best effort.
pub(crate) fn current_processor() -> u32 {
    #[cfg(test)]
    {
        if let Some(forced) = force::PROCESSOR.try_with(|p| p.get()).unwrap_or(None) {
            return forced;
        }
    }
    processor_impl()
}

#[cfg(target_os = "linux")]
fn processor_impl() -> u32 {
    let cpu = unsafe { libc::sched_getcpu() };
    if cpu < 0 {
        0
    } else {
        cpu as u32
    }
}

#[cfg(not(target_os = "linux"))]
fn processor_impl() -> u32 {
    0
}

/// Identifier of the calling thread as it appears in emitted records.
/// Queried once per thread and cached.
pub(crate) fn current_thread_id() -> u32 {
    thread_local! {
        static ID: Cell<u32> = Cell::new(0);
    }
    ID.try_with(|id| {
        if id.get() == 0 {
            id.set(thread_id_impl());
        }
        id.get()
    })
    // thread storage is already gone; the record keeps a zero id
    .unwrap_or(0)
}

#[cfg(target_os = "linux")]
fn thread_id_impl() -> u32 {
    unsafe { libc::syscall(libc::SYS_gettid) as u32 }
}

#[cfg(not(target_os = "linux"))]
fn thread_id_impl() -> u32 {
    use std::sync::atomic::{AtomicU32, Ordering};

    static NEXT: AtomicU32 = AtomicU32::new(1);
    NEXT.fetch_add(1, Ordering::Relaxed)
}

/// Per-thread overrides used by the migration tests.
#[cfg(test)]
pub(crate) mod force {
    use std::cell::Cell;

    thread_local! {
        pub(crate) static PROCESSOR: Cell<Option<u32>> = Cell::new(None);
    }

    /// Forces [`super::current_processor`] for the calling thread;
    /// `None` restores the real query.
    pub(crate) fn processor(value: Option<u32>) {
        PROCESSOR.with(|p| p.set(value));
    }
}
