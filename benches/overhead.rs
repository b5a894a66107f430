use criterion::{criterion_group, criterion_main, Criterion};

fn instrumentation(c: &mut Criterion) {
    // 16 MiB of pool, drained every millisecond; no writer, so records
    // are produced and recycled without I/O in the way
    let memory = Box::leak(vec![0u8; 16 * 1024 * 1024].into_boxed_slice());
    blockprof::initialize("bench", memory);
    blockprof::set_output_wait(1);
    blockprof::enable(true);

    c.bench_function("begin/end", |b| {
        b.iter(|| {
            blockprof::begin_block("scope");
            blockprof::end_block();
        })
    });

    c.bench_function("update", |b| {
        blockprof::begin_block("hot-loop");
        b.iter(blockprof::update_block);
        blockprof::end_block();
    });

    c.bench_function("log", |b| {
        b.iter(|| blockprof::log("a log line that spans two records"))
    });

    blockprof::finalize();
}

criterion_group!(benches, instrumentation);
criterion_main!(benches);
