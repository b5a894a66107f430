use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;

use crate::block::{self, Block};
use crate::platform;
use crate::profiler::PROFILER;

// the profiler is a process-wide singleton; scenarios take turns
static SERIAL: Mutex<()> = Mutex::new(());

fn serial() -> MutexGuard<'static, ()> {
    SERIAL.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

// leaked and 8-aligned, as the pool wants it
fn buffer(blocks: usize) -> &'static mut [u8] {
    bytemuck::cast_slice_mut(Box::leak(vec![0u64; blocks * 8].into_boxed_slice()))
}

#[derive(Clone)]
struct Capture(Arc<Mutex<Vec<Block>>>);

impl Capture {
    fn new() -> Self {
        Capture(Arc::new(Mutex::new(Vec::new())))
    }

    fn writer(&self) -> crate::Writer {
        let records = self.0.clone();
        Box::new(move |bytes: &[u8]| {
            assert_eq!(bytes.len(), block::RECORD_SIZE);
            records
                .lock()
                .unwrap()
                .push(bytemuck::pod_read_unaligned(bytes));
        })
    }

    fn records(&self) -> Vec<Block> {
        self.0.lock().unwrap().clone()
    }
}

fn name_of(record: &Block) -> &str {
    let len = record
        .name
        .iter()
        .position(|&b| b == 0)
        .unwrap_or(record.name.len());
    core::str::from_utf8(&record.name[..len]).unwrap()
}

#[test]
fn nested_scopes_roundtrip() {
    let _serial = serial();
    let capture = Capture::new();

    crate::initialize("nested", buffer(1024));
    crate::set_output(Some(capture.writer()));
    crate::set_output_wait(1);
    crate::enable(true);

    crate::begin_block("a");
    crate::begin_block("b");
    crate::end_block();
    crate::end_block();

    // joins the drain and terminates the stream
    crate::enable(false);

    let records = capture.records();
    assert_eq!(records.last().unwrap().id, block::ID_END_OF_STREAM);

    let a = records.iter().find(|r| name_of(r) == "a").unwrap();
    let b = records.iter().find(|r| name_of(r) == "b").unwrap();
    assert!(a.id >= block::ID_USER);
    assert!(b.id >= block::ID_USER);
    assert_eq!(a.parentid, 0);
    assert_eq!(b.parentid, a.id);
    assert!(a.end >= a.start);
    assert!(b.end >= b.start);
    assert!(b.start >= a.start);
    assert!(b.end <= a.end);

    crate::finalize();
}

#[test]
fn long_message_splits_into_continuations() {
    let _serial = serial();
    let capture = Capture::new();

    crate::initialize("messages", buffer(256));
    crate::set_output(Some(capture.writer()));
    crate::enable(true);

    let text = "x".repeat(60);
    crate::log(&text);

    crate::enable(false);

    let records = capture.records();
    let head = records.iter().find(|r| r.id == block::ID_LOG).unwrap();
    let continuations: Vec<&Block> = records
        .iter()
        .filter(|r| r.id == block::ID_LOG + 1)
        .collect();
    assert_eq!(continuations.len(), 2);

    // stitch the message back together through the sequence numbers
    let first = continuations
        .iter()
        .find(|c| c.parentid as u32 as u64 == head.end)
        .unwrap();
    let second = continuations
        .iter()
        .find(|c| c.parentid as u32 as u64 == first.end)
        .unwrap();

    assert_eq!(name_of(head).len(), block::NAME_MAX);
    assert_eq!(name_of(first).len(), block::NAME_MAX);
    assert_eq!(name_of(second).len(), 10);

    let mut stitched = String::new();
    stitched.push_str(name_of(head));
    stitched.push_str(name_of(first));
    stitched.push_str(name_of(second));
    assert_eq!(stitched, text);

    crate::finalize();
}

#[test]
fn lock_events_carry_their_reserved_ids() {
    let _serial = serial();
    let capture = Capture::new();

    crate::initialize("locks", buffer(256));
    crate::set_output(Some(capture.writer()));
    crate::enable(true);

    crate::try_lock("m");
    crate::lock("m");
    crate::unlock("m");
    crate::wait("cv");
    crate::signal("cv");

    crate::enable(false);

    let records = capture.records();
    for &(id, name) in [
        (block::ID_TRY_LOCK, "m"),
        (block::ID_LOCK, "m"),
        (block::ID_UNLOCK, "m"),
        (block::ID_WAIT, "cv"),
        (block::ID_SIGNAL, "cv"),
    ]
    .iter()
    {
        let record = records.iter().find(|r| r.id == id).unwrap();
        assert_eq!(name_of(record), name);
    }

    crate::finalize();
}

#[test]
fn end_frame_marks_the_stream() {
    let _serial = serial();
    let capture = Capture::new();

    crate::initialize("frames", buffer(256));
    crate::set_output(Some(capture.writer()));
    crate::enable(true);

    crate::end_frame(42);

    crate::enable(false);

    let records = capture.records();
    let markers: Vec<&Block> = records
        .iter()
        .filter(|r| r.id == block::ID_END_FRAME)
        .collect();
    assert_eq!(markers.len(), 1);
    assert_eq!(markers[0].end, 42);

    crate::finalize();
}

#[test]
fn exhausted_pool_drops_silently() {
    let _serial = serial();

    // one sentinel, two usable blocks
    crate::initialize("tiny", buffer(3));
    crate::enable(true);

    crate::begin_block("one");
    crate::begin_block("two");
    // no slot left; dropped
    crate::begin_block("three");
    crate::end_block();
    crate::end_block();

    crate::enable(false);

    // everything the producers took must be back
    PROFILER.reclaim_silently();
    let (free, stale) = PROFILER.pool.accounting();
    assert_eq!(free + 1, PROFILER.pool.capacity());
    assert_eq!(stale, 0);

    crate::finalize();
}

#[test]
fn balanced_runs_conserve_the_pool() {
    let _serial = serial();

    crate::initialize("conserve", buffer(64));
    crate::enable(true);

    for _ in 0..10 {
        crate::begin_block("outer");
        crate::begin_block("inner");
        crate::end_block();
        crate::end_block();
    }

    crate::enable(false);

    PROFILER.reclaim_silently();
    let (free, stale) = PROFILER.pool.accounting();
    assert_eq!(free + 1, PROFILER.pool.capacity());
    assert_eq!(stale, 0);

    crate::finalize();
}

#[test]
fn concurrent_producers_account_for_every_scope() {
    let _serial = serial();
    const THREADS: usize = 8;
    const ITERATIONS: usize = 8000;

    let capture = Capture::new();

    // sized so that even a drain that never runs cannot overflow
    crate::initialize("swarm", buffer(65535));
    crate::set_output(Some(capture.writer()));
    crate::set_output_wait(1);
    crate::enable(true);

    let mut handles = Vec::new();
    for _ in 0..THREADS {
        handles.push(thread::spawn(|| {
            for _ in 0..ITERATIONS {
                crate::begin_block("t");
                crate::end_block();
            }
        }));
    }
    for handle in handles {
        handle.join().unwrap();
    }

    crate::enable(false);

    let records = capture.records();
    assert_eq!(records.last().unwrap().id, block::ID_END_OF_STREAM);

    let scopes: Vec<&Block> = records.iter().filter(|r| name_of(r) == "t").collect();
    assert_eq!(scopes.len(), THREADS * ITERATIONS);

    let mut ids: Vec<i32> = scopes.iter().map(|r| r.id).collect();
    ids.sort_unstable();
    ids.dedup();
    assert_eq!(ids.len(), THREADS * ITERATIONS);

    crate::finalize();
}

#[test]
fn update_splits_blocks_across_core_migration() {
    let _serial = serial();
    let capture = Capture::new();

    crate::initialize("migrate", buffer(256));
    crate::set_output(Some(capture.writer()));
    crate::enable(true);

    platform::force::processor(Some(1));
    crate::begin_block("hop");
    platform::force::processor(Some(2));
    crate::update_block();
    crate::end_block();
    platform::force::processor(None);

    crate::enable(false);

    let records = capture.records();
    let hops: Vec<&Block> = records.iter().filter(|r| name_of(r) == "hop").collect();
    assert_eq!(hops.len(), 2);

    let first = hops.iter().find(|r| r.processor == 1).unwrap();
    let second = hops.iter().find(|r| r.processor == 2).unwrap();
    assert_ne!(first.id, second.id);
    assert!(first.end >= first.start);
    assert!(second.start >= first.end);

    crate::finalize();
}

#[test]
fn closing_a_child_splits_a_migrated_parent() {
    let _serial = serial();
    let capture = Capture::new();

    crate::initialize("migrate-parent", buffer(256));
    crate::set_output(Some(capture.writer()));
    crate::enable(true);

    platform::force::processor(Some(1));
    crate::begin_block("outer");
    crate::begin_block("inner");
    platform::force::processor(Some(2));
    // closing the child notices the parent's stale core and splits it
    crate::end_block();
    crate::end_block();
    platform::force::processor(None);

    crate::enable(false);

    let records = capture.records();
    let outers: Vec<&Block> = records.iter().filter(|r| name_of(r) == "outer").collect();
    assert_eq!(outers.len(), 2);
    let inner = records.iter().find(|r| name_of(r) == "inner").unwrap();

    let first = outers.iter().find(|r| r.processor == 1).unwrap();
    let second = outers.iter().find(|r| r.processor == 2).unwrap();
    assert_eq!(inner.parentid, first.id);
    assert!(second.start >= first.end);

    crate::finalize();
}

#[test]
fn sysinfo_keeps_cadence() {
    let _serial = serial();
    let capture = Capture::new();

    crate::initialize("cadence", buffer(128));
    crate::set_output(Some(capture.writer()));
    // park the worker far in the future and drive the drain by hand
    crate::set_output_wait(600_000);
    crate::enable(true);

    let mut wakes = 0;
    for _ in 0..33 {
        crate::begin_block("tick");
        crate::end_block();
        PROFILER.drain_cycle(&mut wakes);
    }

    crate::enable(false);

    let records = capture.records();
    let sysinfo: Vec<&Block> = records
        .iter()
        .filter(|r| r.id == block::ID_SYSINFO)
        .collect();
    assert_eq!(sysinfo.len(), 3);
    for record in &sysinfo {
        assert_eq!(record.start, 1_000_000_000);
        assert_eq!(name_of(record), "sysinfo");
    }

    crate::finalize();
}

#[test]
fn thread_exit_closes_open_scopes() {
    let _serial = serial();
    let capture = Capture::new();

    crate::initialize("orphans", buffer(128));
    crate::set_output(Some(capture.writer()));
    crate::enable(true);

    thread::spawn(|| {
        crate::begin_block("left-open");
        // exits without end_block(); thread cleanup closes the scope
    })
    .join()
    .unwrap();

    crate::enable(false);

    let records = capture.records();
    let record = records.iter().find(|r| name_of(r) == "left-open").unwrap();
    assert!(record.end >= record.start);

    crate::finalize();
}

#[test]
fn disabled_profiler_ignores_producers() {
    let _serial = serial();
    let capture = Capture::new();

    crate::initialize("dormant", buffer(64));
    crate::set_output(Some(capture.writer()));

    // never enabled: everything is a no-op
    crate::begin_block("ghost");
    crate::end_block();
    crate::log("ghost");
    crate::end_frame(7);

    let (free, _) = PROFILER.pool.accounting();
    assert_eq!(free + 1, PROFILER.pool.capacity());

    crate::finalize();
    assert!(capture.records().is_empty());
}
