// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! End-to-end scheduling scenarios on mock devices.

use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use ucc_sched::{CuId, Priority, SeState, Step, UccError};

mod common;

use common::{params, sched, setup_test, wait_until, Consume, TestDevice, LONG};

/// Three LOW streams on two units spread out as {2, 1}, and no unit sits
/// idle while one of its entities is ready.
#[test]
fn test_load_balanced_placement() {
    setup_test();
    let dev = TestDevice::new(Consume::Nothing);
    let sched = sched(dev.clone(), 2);

    let ids: Vec<_> = (0..3)
        .map(|_| {
            let id = sched.alloc(params()).unwrap();
            sched.kick(id, 1).unwrap();
            id
        })
        .collect();

    let cus: Vec<_> = ids
        .iter()
        .map(|id| sched.stream(*id).unwrap().se().cu().unwrap())
        .collect();
    assert_eq!(cus, vec![CuId(0), CuId(1), CuId(0)]);

    let mut counts: Vec<_> = sched.snapshot().cus.iter().map(|c| c.nr_running).collect();
    counts.sort();
    assert_eq!(counts, vec![1, 2]);

    assert!(wait_until(LONG, || sched
        .snapshot()
        .cus
        .iter()
        .all(|c| c.curr.is_some())));
}

/// A HIGH stream enqueued behind a running SLOW-step LOW stream takes over
/// within one further submission round of the LOW stream.
#[test]
fn test_high_priority_takes_over_within_one_round() {
    setup_test();
    let dev = TestDevice::new(Consume::Batch(5));
    let sched = sched(dev.clone(), 1);

    let low = sched
        .alloc(params().priority(Priority::Low).step(Step::Slow))
        .unwrap();
    // Hold the first LOW round inside the device so LOW is surely running.
    dev.gate.close();
    sched.kick(low, 1000).unwrap();
    assert!(wait_until(LONG, || dev.runs_of(low) > 0));

    let high = sched.alloc(params().priority(Priority::High)).unwrap();
    let before = dev.nr_runs();
    sched.kick(high, 1000).unwrap();
    dev.gate.open();
    assert!(wait_until(LONG, || dev.runs_of(high) > 0));

    let runs = dev.runs();
    let first_high = runs.iter().position(|r| *r == high).unwrap();
    let low_after_kick = runs[before..first_high]
        .iter()
        .filter(|r| **r == low)
        .count();
    assert!(low_after_kick <= 1, "low ran {low_after_kick} more rounds");
    assert!(sched.stream_stats(low).unwrap().nr_preempted >= 1);
}

/// A drained stream whose last run submitted nothing blocks and leaves the
/// run queue; a new kick brings it back.
#[test]
fn test_drained_stream_blocks() {
    setup_test();
    let dev = TestDevice::new(Consume::All);
    let sched = sched(dev.clone(), 1);

    let id = sched.alloc(params()).unwrap();
    sched.kick(id, 5).unwrap();
    let stream = sched.stream(id).unwrap();
    assert!(wait_until(LONG, || stream.se().state() == SeState::Block));
    assert!(!stream.se().on_cu());
    assert_eq!(sched.cu_stats(CuId(0)).unwrap().nr_running, 0);
    assert_eq!(sched.xcu(CuId(0)).unwrap().nr_running(), 0);

    sched.kick(id, 8).unwrap();
    assert!(wait_until(LONG, || stream.se().stats().nr_kernels == 8
        && stream.se().state() == SeState::Block));
    let stats = sched.stream_stats(id).unwrap();
    assert!(stats.nr_blocks >= 2);
    assert_eq!(stream.nr_completed(), 8);
}

/// `free` racing a worker that sits inside `run` waits for the worker, and
/// the stream is released exactly once afterwards.
#[test]
fn test_free_waits_for_in_flight_submission() {
    setup_test();
    let dev = TestDevice::new(Consume::All);
    let sched = Arc::new(sched(dev.clone(), 1));

    let id = sched.alloc(params()).unwrap();
    let weak = Arc::downgrade(&sched.stream(id).unwrap());
    dev.gate.close();
    sched.kick(id, 3).unwrap();
    assert!(wait_until(LONG, || dev.runs_of(id) > 0));

    let done = Arc::new(AtomicBool::new(false));
    let freer = {
        let sched = sched.clone();
        let done = done.clone();
        thread::spawn(move || {
            let ret = sched.free(id);
            done.store(true, Ordering::SeqCst);
            ret
        })
    };

    thread::sleep(Duration::from_millis(50));
    assert!(!done.load(Ordering::SeqCst), "free returned mid-submission");
    assert!(matches!(sched.stream(id), Err(UccError::UnknownStream(_))));

    dev.gate.open();
    freer.join().unwrap().unwrap();
    assert_eq!(dev.finished(), vec![id]);
    assert!(wait_until(LONG, || weak.upgrade().is_none()));
    assert!(matches!(sched.free(id), Err(UccError::UnknownStream(_))));
}
