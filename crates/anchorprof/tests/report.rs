use anchorprof_trace::format::write_block;
use anchorprof_trace::{CounterFlags, Profiler, ProfilerConfig, ResultKind, ResultRecord};
use std::path::Path;
use std::process::{Command, Output};

fn anchorprof(args: &[&str]) -> Output {
    Command::new(env!("CARGO_BIN_EXE_anchorprof"))
        .args(args)
        .output()
        .unwrap()
}

fn path_str(path: &Path) -> &str {
    path.to_str().unwrap()
}

fn record_run(path: &Path, name: &'static str, times: usize) {
    let config = ProfilerConfig {
        flush_interval: None,
        ..Default::default()
    };
    let profiler = Profiler::start(path, config).unwrap();
    for _ in 0..times {
        let _m = profiler.measure(1, name, CounterFlags::CYCLES);
        std::hint::black_box((0..100u64).product::<u64>());
    }
    profiler.shutdown().unwrap();
}

fn raw_block(name: &str, records: &[ResultRecord]) -> Vec<u8> {
    let payload: Vec<u8> = records.iter().flat_map(|r| r.encode()).collect();
    let mut out = Vec::new();
    write_block(&mut out, 0, name.as_bytes(), &payload).unwrap();
    out
}

#[test]
fn single_measurement_reports_one_cycle_sample() {
    let dir = tempfile::tempdir().unwrap();
    let log = dir.path().join("work.bin");
    record_run(&log, "work", 1);

    let output = anchorprof(&["--csv", path_str(&log)]);
    assert!(output.status.success());
    let stdout = String::from_utf8(output.stdout).unwrap();
    let rows: Vec<Vec<&str>> = stdout.lines().skip(1).map(|l| l.split(',').collect()).collect();

    assert_eq!(rows.len(), 1);
    let row = &rows[0];
    assert_eq!(row[0], "\"work\"");
    // A migration during the single measurement is logged instead of cycles.
    assert!(row[1] == "cycles" || row[1] == "cpu_migrations");
    assert_eq!(row[2], "1");
    assert!(row[3].parse::<f64>().unwrap() > 0.0);
}

#[test]
fn files_merge_and_truncation_is_reported() {
    let dir = tempfile::tempdir().unwrap();
    let first = dir.path().join("first.bin");
    let second = dir.path().join("second.bin");

    let mut bytes = raw_block(
        "parse",
        &[
            ResultRecord::new(ResultKind::Cycles, 10),
            ResultRecord::new(ResultKind::Cycles, 20),
        ],
    );
    std::fs::write(&first, &bytes).unwrap();

    bytes = raw_block("parse", &[ResultRecord::new(ResultKind::Cycles, 30)]);
    let cut = raw_block("parse", &[ResultRecord::new(ResultKind::Cycles, 40)]);
    bytes.extend(&cut[..cut.len() - 1]);
    std::fs::write(&second, &bytes).unwrap();

    let output = anchorprof(&["--csv", path_str(&first), path_str(&second)]);
    assert!(output.status.success());

    let stderr = String::from_utf8(output.stderr).unwrap();
    assert!(stderr.contains("second.bin"));
    assert!(stderr.contains("truncated"));

    let stdout = String::from_utf8(output.stdout).unwrap();
    assert_eq!(
        stdout.lines().nth(1).unwrap(),
        "\"parse\",cycles,3,20.000,8.165,10,20,30,30"
    );
}

#[test]
fn missing_file_still_prints_other_stats() {
    let dir = tempfile::tempdir().unwrap();
    let log = dir.path().join("ok.bin");
    std::fs::write(
        &log,
        raw_block("ok", &[ResultRecord::new(ResultKind::BranchMisses, 4)]),
    )
    .unwrap();
    let missing = dir.path().join("missing.bin");

    let output = anchorprof(&[path_str(&missing), path_str(&log)]);
    assert!(output.status.success());
    let stdout = String::from_utf8(output.stdout).unwrap();
    assert!(stdout.lines().any(|l| l.starts_with("ok") && l.contains("branch_misses")));
    assert!(String::from_utf8(output.stderr).unwrap().contains("missing.bin"));
}

#[test]
fn filter_and_json_output() {
    let dir = tempfile::tempdir().unwrap();
    let log = dir.path().join("mixed.bin");
    let mut bytes = raw_block("db::query", &[ResultRecord::new(ResultKind::Cycles, 5)]);
    bytes.extend(raw_block("net::send", &[ResultRecord::new(ResultKind::Cycles, 7)]));
    std::fs::write(&log, bytes).unwrap();

    let output = anchorprof(&["--json", "--filter", "db::", path_str(&log)]);
    assert!(output.status.success());
    let stdout = String::from_utf8(output.stdout).unwrap();
    assert!(stdout.contains("\"function\": \"db::query\""));
    assert!(!stdout.contains("net::send"));
}

#[test]
fn usage_errors_exit_with_one() {
    assert_eq!(anchorprof(&[]).status.code(), Some(1));
    assert_eq!(anchorprof(&["--json", "--csv", "x.bin"]).status.code(), Some(1));
    assert_eq!(anchorprof(&["--help"]).status.code(), Some(0));
}
