//! The process-wide profiler instance: per-thread scope stacks, message
//! events and lifecycle management.

use std::cell::Cell;
use std::cmp;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Condvar, Mutex, MutexGuard};
use std::thread;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crate::block;
use crate::chain::RootChain;
use crate::drain;
use crate::platform;
use crate::pool::Pool;

/// The one profiler of this process.
pub(crate) static PROFILER: Profiler = Profiler::new();

thread_local! {
    static SCOPE: ThreadScope = ThreadScope::new();
}

/// Locks a mutex, shrugging off poisoning; none of the guarded state
/// can be left logically inconsistent by a panicking holder.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Per-thread scope state: the currently open deepest block plus the
/// profiler generation it belongs to. The generation guard discards an
/// index left over from an earlier initialize/finalize cycle.
///
/// Dropping the state (the thread is exiting) closes out any blocks the
/// thread still has open.
struct ThreadScope {
    generation: Cell<u32>,
    current: Cell<u16>,
}

impl ThreadScope {
    fn new() -> Self {
        ThreadScope {
            generation: Cell::new(0),
            current: Cell::new(0),
        }
    }
}

impl Drop for ThreadScope {
    fn drop(&mut self) {
        PROFILER.flush_scope(&self.generation, &self.current);
    }
}

struct ExitSignal {
    posted: Mutex<bool>,
    condvar: Condvar,
}

impl ExitSignal {
    const fn new() -> Self {
        ExitSignal {
            posted: Mutex::new(false),
            condvar: Condvar::new(),
        }
    }

    fn reset(&self) {
        *lock(&self.posted) = false;
    }

    fn post(&self) {
        *lock(&self.posted) = true;
        self.condvar.notify_all();
    }

    /// Waits for the signal, up to `timeout`; returns whether it was
    /// posted.
    fn wait_timeout(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut posted = lock(&self.posted);
        while !*posted {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            posted = match self.condvar.wait_timeout(posted, deadline - now) {
                Ok((guard, _)) => guard,
                Err(poisoned) => poisoned.into_inner().0,
            };
        }
        true
    }
}

pub(crate) struct Profiler {
    pub(crate) pool: Pool,
    pub(crate) root: RootChain,
    // shared counter behind scope ids and message sequence numbers
    counter: AtomicU32,
    ground: AtomicU64,
    enabled: AtomicBool,
    generation: AtomicU32,
    wait_ms: AtomicU64,
    writer: Mutex<Option<crate::Writer>>,
    worker: Mutex<Option<JoinHandle<()>>>,
    exit: ExitSignal,
    identifier: Mutex<String>,
}

impl Profiler {
    const fn new() -> Self {
        Profiler {
            pool: Pool::new(),
            root: RootChain::new(),
            counter: AtomicU32::new(block::ID_USER as u32 - 1),
            ground: AtomicU64::new(0),
            enabled: AtomicBool::new(false),
            generation: AtomicU32::new(0),
            wait_ms: AtomicU64::new(100),
            writer: Mutex::new(None),
            worker: Mutex::new(None),
            exit: ExitSignal::new(),
            identifier: Mutex::new(String::new()),
        }
    }

    fn next_counter(&self) -> u32 {
        self.counter.fetch_add(1, Ordering::Relaxed).wrapping_add(1)
    }

    fn elapsed(&self) -> u64 {
        platform::ticks().wrapping_sub(self.ground.load(Ordering::Relaxed))
    }

    fn ready(&self) -> bool {
        self.enabled.load(Ordering::Relaxed) && self.pool.is_attached()
    }

    /// Runs `f` with the calling thread's current-open-block cell,
    /// revalidated against the profiler generation. Returns `None` when
    /// thread storage is already torn down.
    fn with_scope<R>(&self, f: impl FnOnce(&Cell<u16>) -> R) -> Option<R> {
        SCOPE
            .try_with(|scope| {
                let generation = self.generation.load(Ordering::Relaxed);
                if scope.generation.get() != generation {
                    scope.generation.set(generation);
                    scope.current.set(0);
                }
                f(&scope.current)
            })
            .ok()
    }

    // ------------------------------------------------------------------
    // scopes
    // ------------------------------------------------------------------

    pub(crate) fn begin_block(&self, name: &str) {
        if !self.ready() {
            return;
        }
        self.with_scope(|current| self.begin_block_at(current, name.as_bytes()));
    }

    fn begin_block_at(&self, current: &Cell<u16>, name: &[u8]) {
        let slot = match self.pool.alloc() {
            Some(slot) => slot,
            // exhausted; drop the scope
            None => return,
        };

        unsafe {
            let b = self.pool.get(slot);
            (*b).id = self.next_counter() as i32;
            (*b).processor = platform::current_processor();
            (*b).thread = platform::current_thread_id();
            (*b).start = self.elapsed();
            (*b).set_name(name);

            let parent = current.get();
            if parent != 0 {
                let p = self.pool.get(parent);
                (*b).parentid = (*p).id;
                (*b).previous = parent;
                (*b).sibling = (*p).child;
                if (*p).child != 0 {
                    (*self.pool.get((*p).child)).previous = slot;
                }
                (*p).child = slot;
            }
        }
        current.set(slot);
    }

    pub(crate) fn end_block(&self) {
        if !self.ready() {
            return;
        }
        self.with_scope(|current| self.end_block_at(current));
    }

    fn end_block_at(&self, current: &Cell<u16>) {
        let slot = current.get();
        if slot == 0 {
            return;
        }

        unsafe {
            let b = self.pool.get(slot);
            (*b).end = self.elapsed();

            if (*b).previous != 0 {
                // skip over earlier siblings to find the parent
                let mut parent = (*b).previous;
                while (*self.pool.get(parent)).child != slot {
                    #[cfg(feature = "sanity-checks")]
                    assert_ne!(
                        (*self.pool.get(parent)).previous,
                        0,
                        "open scope chain lost its parent"
                    );
                    parent = (*self.pool.get(parent)).previous;
                }
                current.set(parent);

                let p = self.pool.get(parent);
                if (*p).processor != platform::current_processor() {
                    // the thread migrated while the parent was open;
                    // split it into adjacent segments
                    let name = (*p).name;
                    self.end_block_at(current);
                    self.begin_block_at(current, &name);
                }
            } else {
                self.root.publish(&self.pool, slot);
                current.set(0);
            }
        }
    }

    pub(crate) fn update_block(&self) {
        if !self.ready() {
            return;
        }
        self.with_scope(|current| {
            let slot = current.get();
            if slot == 0 {
                return;
            }
            unsafe {
                let b = self.pool.get(slot);
                if (*b).processor != platform::current_processor() {
                    let name = (*b).name;
                    self.end_block_at(current);
                    self.begin_block_at(current, &name);
                }
            }
        });
    }

    // ------------------------------------------------------------------
    // peer entries: messages and frame markers
    // ------------------------------------------------------------------

    /// Records a message-class event. The head block carries `id` and a
    /// sequence number in `end`; overflow text goes into continuation
    /// blocks chained underneath it, each pointing at its predecessor's
    /// sequence number through `parentid`.
    pub(crate) fn message(&self, id: i32, text: &str) {
        if !self.ready() {
            return;
        }
        let head = match self.build_message(id, text.as_bytes()) {
            Some(head) => head,
            None => return,
        };
        self.put_peer(head);
    }

    fn build_message(&self, id: i32, mut text: &[u8]) -> Option<u16> {
        let head = self.pool.alloc()?;
        unsafe {
            let b = self.pool.get(head);
            (*b).id = id;
            (*b).processor = platform::current_processor();
            (*b).thread = platform::current_thread_id();
            (*b).start = self.elapsed();
            (*b).end = u64::from(self.next_counter());
            let taken = (*b).set_name(text);
            text = &text[taken..];

            let mut previous_seq = (*b).end;
            while !text.is_empty() {
                let slot = match self.pool.alloc() {
                    Some(slot) => slot,
                    // exhausted; drop the tail of the message
                    None => break,
                };
                let c = self.pool.get(slot);
                (*c).id = id.wrapping_add(1);
                (*c).parentid = previous_seq as i32;
                (*c).processor = (*b).processor;
                (*c).thread = (*b).thread;
                (*c).start = self.elapsed();
                (*c).end = u64::from(self.next_counter());
                let taken = (*c).set_name(text);
                text = &text[taken..];
                previous_seq = (*c).end;

                (*c).previous = head;
                (*c).sibling = (*b).child;
                if (*b).child != 0 {
                    (*self.pool.get((*b).child)).previous = slot;
                }
                (*b).child = slot;
            }
        }
        Some(head)
    }

    pub(crate) fn end_frame(&self, counter: u64) {
        if !self.ready() {
            return;
        }
        let slot = match self.pool.alloc() {
            Some(slot) => slot,
            None => return,
        };
        unsafe {
            let b = self.pool.get(slot);
            (*b).id = block::ID_END_FRAME;
            (*b).processor = platform::current_processor();
            (*b).thread = platform::current_thread_id();
            (*b).start = self.elapsed();
            (*b).end = counter;
        }
        self.put_peer(slot);
    }

    /// Inserts a completed block (or message chain head) as a peer
    /// entry: as a child of the current open scope if there is one, or
    /// straight into the root chain. The entry never becomes the
    /// current open block.
    fn put_peer(&self, slot: u16) {
        let inserted = self.with_scope(|current| {
            let parent = current.get();
            if parent == 0 {
                return false;
            }
            unsafe {
                let b = self.pool.get(slot);
                let p = self.pool.get(parent);
                (*b).parentid = (*p).id;
                (*b).previous = parent;
                (*b).sibling = (*p).child;
                if (*p).child != 0 {
                    (*self.pool.get((*p).child)).previous = slot;
                }
                (*p).child = slot;
            }
            true
        });

        if inserted != Some(true) {
            self.root.publish(&self.pool, slot);
        }
    }

    // ------------------------------------------------------------------
    // thread cleanup
    // ------------------------------------------------------------------

    pub(crate) fn thread_finalize(&self) {
        let _ = SCOPE.try_with(|scope| self.flush_scope(&scope.generation, &scope.current));
    }

    /// Walks the thread's open chain from deepest to root, ending every
    /// block. Bails out with a warning if no progress is being made.
    fn flush_scope(&self, generation: &Cell<u32>, current: &Cell<u16>) {
        if generation.get() != self.generation.load(Ordering::Relaxed) || !self.pool.is_attached() {
            current.set(0);
            return;
        }

        let mut last = 0;
        loop {
            let open = current.get();
            if open == 0 {
                break;
            }
            if open == last {
                log::warn!(
                    "thread scope stack is self-referential at slot {}; abandoning cleanup",
                    open
                );
                break;
            }
            last = open;
            self.end_block_at(current);
        }
    }

    // ------------------------------------------------------------------
    // lifecycle
    // ------------------------------------------------------------------

    pub(crate) fn initialize(&self, identifier: &str, memory: &'static mut [u8]) {
        if self.pool.is_attached() {
            log::warn!("profiler is already initialized; ignoring");
            return;
        }
        if self.pool.attach(memory) == 0 {
            log::warn!("profile buffer cannot hold a single block; profiler stays offline");
            return;
        }
        self.root.reset();
        self.counter
            .store(block::ID_USER as u32 - 1, Ordering::Relaxed);
        self.ground.store(platform::ticks(), Ordering::Relaxed);
        self.generation.fetch_add(1, Ordering::Relaxed);
        *lock(&self.identifier) = identifier.to_owned();
    }

    pub(crate) fn set_output(&self, writer: Option<crate::Writer>) {
        *lock(&self.writer) = writer;
    }

    pub(crate) fn writer_lock(&self) -> MutexGuard<'_, Option<crate::Writer>> {
        lock(&self.writer)
    }

    pub(crate) fn set_output_wait(&self, ms: u64) {
        // bounded above so the wait deadline arithmetic cannot overflow
        self.wait_ms
            .store(cmp::min(cmp::max(ms, 1), 3_600_000), Ordering::Relaxed);
    }

    /// Sleeps on the exit signal for one output wait period; returns
    /// whether shutdown was requested.
    pub(crate) fn wait_exit(&self) -> bool {
        let ms = self.wait_ms.load(Ordering::Relaxed);
        self.exit.wait_timeout(Duration::from_millis(ms))
    }

    pub(crate) fn enable(&self, enabled: bool) {
        if enabled {
            if !self.pool.is_attached() {
                log::warn!("enable requested before initialize; ignoring");
                return;
            }
            if self.enabled.swap(true, Ordering::AcqRel) {
                return;
            }
            self.exit.reset();
            let spawned = thread::Builder::new()
                .name("profile-io".into())
                .stack_size(drain::DRAIN_STACK_SIZE)
                .spawn(|| PROFILER.drain_loop());
            match spawned {
                Ok(handle) => *lock(&self.worker) = Some(handle),
                Err(err) => {
                    self.enabled.store(false, Ordering::Release);
                    log::error!("failed to spawn the profile-io thread: {}", err);
                }
            }
        } else {
            if !self.enabled.swap(false, Ordering::AcqRel) {
                return;
            }
            self.exit.post();
            if let Some(handle) = lock(&self.worker).take() {
                let _ = handle.join();
            }
        }
    }

    pub(crate) fn finalize(&self) {
        self.enable(false);

        // close out any scopes still open on the calling thread
        self.thread_finalize();

        if !self.pool.is_attached() {
            return;
        }

        // the stream is already terminated, so whatever the drain did
        // not get to is reclaimed without being emitted
        self.reclaim_silently();

        if !self.root.is_empty() {
            log::warn!("root chain is not empty at shutdown");
        }
        let capacity = self.pool.capacity();
        let (free, stale) = self.pool.accounting();
        if free + 1 != capacity || stale != 0 {
            log::warn!(
                "profiler '{}' shut down with {} of {} blocks free and {} stale sibling links",
                lock(&self.identifier),
                free,
                capacity - 1,
                stale
            );
        }

        self.pool.detach();
        *lock(&self.writer) = None;
        lock(&self.identifier).clear();
    }
}
