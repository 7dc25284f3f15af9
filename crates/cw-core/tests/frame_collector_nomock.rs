//! Frame collector against a real child process.
//!
//! `/bin/sh` replays captured `top` bursts with pauses between them, standing
//! in for `top -l 0` so the tests run anywhere.
#![cfg(unix)]

use cw_core::collect::{CollectError, CollectorConfig, FrameCollector, ProducerSpec};
use std::path::Path;
use std::time::{Duration, Instant};

const IDLE: Duration = Duration::from_millis(150);
const GAP: &str = "0.5";
const WAIT: Duration = Duration::from_secs(10);

fn burst(cpu: &str) -> String {
    format!(
        "Processes: 306 total, 2 running, 2 stuck, 302 sleeping, 1772 threads
2016/11/20 20:18:55
Load Avg: 1.36, 1.41, 1.35
CPU usage: 3.70% user, 22.22% sys, 74.7% idle
SharedLibs: 150M resident, 19M data, 15M linkedit.
MemRegions: 83717 total, 3073M resident, 71M private, 868M shared.
PhysMem: 8688M used (3048M wired), 7694M unused.
VM: 2471G vsize, 533M framework vsize, 15758266(0) swapins, 17238545(0) swapouts.
Networks: packets: 26102141/14G in, 21138143/6128M out.
Disks: 6676021/171G read, 6960487/301G written.

PID    %CPU #TH   STATE    TIME     PAGEINS  COMMAND
80917  {cpu} 31    sleeping 10:00.14 1+       Spotify
80920  0.3  18    sleeping 00:41.02 0        Spotify Helper
"
    )
}

/// Shell script that cats each file, pausing between them, then runs `tail`.
fn replay(dir: &Path, bursts: &[String], tail: &str) -> ProducerSpec {
    let mut script = String::new();
    for (i, text) in bursts.iter().enumerate() {
        let path = dir.join(format!("burst{i}.txt"));
        std::fs::write(&path, text).unwrap();
        script.push_str(&format!("cat '{}'; sleep {GAP}; ", path.display()));
    }
    script.push_str(tail);
    ProducerSpec::new("/bin/sh", vec!["-c".to_string(), script])
}

fn spawn(spec: ProducerSpec) -> FrameCollector {
    let config = CollectorConfig::new(spec, Duration::from_secs(1), IDLE).unwrap();
    FrameCollector::spawn(&config).unwrap()
}

fn next(collector: &FrameCollector) -> cw_core::collect::Frame {
    collector
        .next_frame_timeout(WAIT)
        .unwrap()
        .expect("frame within timeout")
}

#[test]
fn first_burst_is_discarded_and_rest_are_framed() {
    let dir = tempfile::tempdir().unwrap();
    let spec = replay(
        dir.path(),
        &[burst("0.0"), burst("11.0"), burst("22.0")],
        "exec sleep 30",
    );
    let collector = spawn(spec);

    let first = next(&collector);
    assert_eq!(first.sequence, 1);
    assert_eq!(first.find_command("Spotify").unwrap().cpu, "11.0");
    assert_eq!(first.processes.len(), 2);

    let second = next(&collector);
    assert_eq!(second.sequence, 2);
    assert_eq!(second.find_command("Spotify").unwrap().cpu, "22.0");

    let start = Instant::now();
    assert!(collector.shutdown());
    assert!(!collector.shutdown());
    assert!(matches!(collector.next_frame(), Err(CollectError::Closed)));
    assert!(start.elapsed() < WAIT);
}

#[test]
fn producer_exit_is_reported_after_last_frame() {
    let dir = tempfile::tempdir().unwrap();
    let spec = replay(dir.path(), &[burst("0.0"), burst("5.0")], "exit 3");
    let collector = spawn(spec);

    let frame = next(&collector);
    assert_eq!(frame.find_command("Spotify").unwrap().cpu, "5.0");

    match collector.next_frame() {
        Err(CollectError::ProducerExited { status }) => assert!(status.contains('3')),
        other => panic!("unexpected result: {other:?}"),
    }
    // The exited producer was reaped; its pid must not be signalled.
    assert!(!collector.shutdown());
    let err: cw_common::Error = CollectError::ProducerExited {
        status: "exit status: 3".into(),
    }
    .into();
    assert_eq!(err.category(), cw_common::ErrorCategory::Producer);
}

#[test]
fn header_change_is_fatal() {
    let dir = tempfile::tempdir().unwrap();
    let changed = burst("1.0").replace("PAGEINS ", "MEM     ");
    let spec = replay(dir.path(), &[burst("0.0"), changed], "exec sleep 30");
    let collector = spawn(spec);

    let start = Instant::now();
    match collector.next_frame() {
        Err(CollectError::Format(e)) => assert!(e.to_string().contains("MEM")),
        other => panic!("unexpected result: {other:?}"),
    }
    // The producer is stopped rather than left running.
    assert!(start.elapsed() < WAIT);
}

#[test]
fn slow_consumer_sees_latest_frame() {
    let dir = tempfile::tempdir().unwrap();
    let spec = replay(
        dir.path(),
        &[burst("0.0"), burst("1.0"), burst("2.0"), burst("3.0")],
        "exec sleep 30",
    );
    let collector = spawn(spec);

    // Let every burst be framed before looking.
    std::thread::sleep(Duration::from_millis(2500));
    let frame = collector.try_next_frame().unwrap().expect("a frame is ready");
    assert_eq!(frame.find_command("Spotify").unwrap().cpu, "3.0");
    assert_eq!(frame.sequence, 3);
    assert!(collector.try_next_frame().unwrap().is_none());
}

#[test]
fn shutdown_handle_stops_from_another_thread() {
    let dir = tempfile::tempdir().unwrap();
    let spec = replay(dir.path(), &[burst("0.0"), burst("7.0")], "exec sleep 30");
    let collector = spawn(spec);
    assert_eq!(next(&collector).find_command("Spotify").unwrap().cpu, "7.0");

    let handle = collector.shutdown_handle();
    let signalled = std::thread::spawn(move || handle.shutdown()).join().unwrap();
    assert!(signalled);
    assert!(matches!(collector.next_frame(), Err(CollectError::Closed)));
}

#[test]
fn missing_producer_fails_to_spawn() {
    let config = CollectorConfig::new(
        ProducerSpec::new("/nonexistent/top", vec![]),
        Duration::from_secs(1),
        IDLE,
    )
    .unwrap();
    assert!(matches!(
        FrameCollector::spawn(&config),
        Err(CollectError::Spawn { .. })
    ));
}
