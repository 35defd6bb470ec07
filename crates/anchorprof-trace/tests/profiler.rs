mod common;

use anchorprof_trace::counters::PerfCounter;
use anchorprof_trace::{CounterFlags, CounterKind, Profiler, ProfilerConfig, ResultKind};
use common::{read_blocks, records_for, timing_records};
use memmap2::MmapMut;
use std::time::Duration;

fn config() -> ProfilerConfig {
    ProfilerConfig {
        flush_interval: None,
        max_anchors: 16,
        thread_slots: 8,
        slot_capacity: 4096,
        ..Default::default()
    }
}

#[test]
fn single_measurement_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("work.bin");
    let profiler = Profiler::start(&path, config()).unwrap();
    {
        let _m = profiler.measure(1, "work", CounterFlags::CYCLES);
        std::hint::black_box((0..1000u64).sum::<u64>());
    }
    profiler.shutdown().unwrap();

    let blocks = read_blocks(&path);
    let records = records_for(&blocks, "work");
    assert_eq!(records.len(), 1);
    assert_eq!(timing_records(&records), 1);
    assert!(records[0].value > 0);
}

#[test]
fn concurrent_threads_lose_no_records() {
    const THREADS: usize = 8;
    const PER_THREAD: usize = 2_000;

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("threads.bin");
    // Few slots and small buffers: threads collide and flush often.
    let profiler = Profiler::start(
        &path,
        ProfilerConfig {
            thread_slots: 3,
            slot_capacity: 256,
            flush_interval: Some(Duration::from_millis(2)),
            ..config()
        },
    )
    .unwrap();

    std::thread::scope(|scope| {
        for _ in 0..THREADS {
            scope.spawn(|| {
                for _ in 0..PER_THREAD {
                    let _m = profiler.measure(2, "worker", CounterFlags::CYCLES);
                }
            });
        }
    });
    profiler.shutdown().unwrap();

    let blocks = read_blocks(&path);
    assert!(blocks.iter().all(|b| b.header.thread_slot < 3));
    let records = records_for(&blocks, "worker");
    assert_eq!(records.len(), THREADS * PER_THREAD);
    assert_eq!(timing_records(&records), THREADS * PER_THREAD);
}

#[test]
fn nested_measurements_record_both_anchors() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("nested.bin");
    let profiler = Profiler::start(&path, config()).unwrap();
    for _ in 0..10 {
        let _outer = profiler.measure(1, "outer", CounterFlags::CYCLES);
        for _ in 0..3 {
            let _inner = profiler.measure(2, "inner", CounterFlags::CYCLES);
        }
    }
    profiler.shutdown().unwrap();

    let blocks = read_blocks(&path);
    assert_eq!(timing_records(&records_for(&blocks, "outer")), 10);
    assert_eq!(timing_records(&records_for(&blocks, "inner")), 30);
}

#[test]
fn explicit_flush_streams_records_before_shutdown() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("flush.bin");
    let profiler = Profiler::start(&path, config()).unwrap();

    profiler.measure(1, "early", CounterFlags::CYCLES).finish();
    assert!(profiler.flush().unwrap() > 0);
    assert_eq!(records_for(&read_blocks(&path), "early").len(), 1);

    // Nothing buffered: a second flush writes nothing.
    assert_eq!(profiler.flush().unwrap(), 0);

    profiler.measure(1, "early", CounterFlags::CYCLES).finish();
    profiler.shutdown().unwrap();
    assert_eq!(records_for(&read_blocks(&path), "early").len(), 2);
}

#[test]
fn shutdown_is_idempotent_and_later_guards_are_inert() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("idem.bin");
    let profiler = Profiler::start(&path, config()).unwrap();
    profiler.measure(1, "once", CounterFlags::CYCLES).finish();

    profiler.shutdown().unwrap();
    let len = std::fs::metadata(&path).unwrap().len();
    profiler.shutdown().unwrap();
    profiler.measure(1, "once", CounterFlags::CYCLES).finish();
    drop(profiler);

    assert_eq!(std::fs::metadata(&path).unwrap().len(), len);
}

#[test]
fn guard_started_before_shutdown_is_discarded() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("late.bin");
    let profiler = Profiler::start(&path, config()).unwrap();

    let m = profiler.measure(1, "straddler", CounterFlags::CYCLES);
    profiler.shutdown().unwrap();
    drop(m);

    assert!(records_for(&read_blocks(&path), "straddler").is_empty());
}

#[test]
fn pid_prefix_names_the_log() {
    let dir = tempfile::tempdir().unwrap();
    let profiler = Profiler::start(
        dir.path().join("run.bin"),
        ProfilerConfig {
            pid_prefix: true,
            ..config()
        },
    )
    .unwrap();
    let expected = dir.path().join(format!("{}-run.bin", std::process::id()));
    assert_eq!(profiler.log_path(), expected);
    profiler.shutdown().unwrap();
    assert!(expected.exists());
}

#[test]
fn page_fault_deltas_are_logged_when_permitted() {
    if let Err(err) = PerfCounter::open(CounterKind::PageFaults) {
        eprintln!("skipping: {err}");
        return;
    }

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("faults.bin");
    let profiler = Profiler::start(&path, config()).unwrap();
    // Untouched anonymous mapping, so every page faults inside the guard.
    let mut pages = MmapMut::map_anon(64 * 4096).unwrap();
    {
        let _m = profiler.measure(3, "touch", CounterFlags::PAGE_FAULTS);
        for page in pages.chunks_mut(4096) {
            page[0] = 1;
        }
        std::hint::black_box(&pages[..]);
    }
    profiler.shutdown().unwrap();

    let records = records_for(&read_blocks(&path), "touch");
    assert_eq!(timing_records(&records), 1);
    let faults: Vec<_> = records
        .iter()
        .filter(|r| r.kind() == Some(ResultKind::PageFaults))
        .collect();
    assert_eq!(faults.len(), 1);
    assert!(faults[0].value > 0);
}
