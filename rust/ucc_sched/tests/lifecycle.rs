// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

use std::sync::mpsc;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use ucc_sched::{
    CqId, CuId, CuState, DevId, Priority, SchedConfig, SeState, Step, StreamParams, TsId, UccError,
    UccScheduler,
};

mod common;

use common::{params, sched, sched_with, setup_test, wait_until, Consume, TestDevice, LONG};

#[test]
fn test_alloc_without_compute_unit_fails() {
    setup_test();
    let sched = sched(TestDevice::new(Consume::All), 1);
    assert!(matches!(
        sched.alloc(StreamParams::new(DevId(0), TsId(7))),
        Err(UccError::NoComputeUnit {
            dev: DevId(0),
            ts: TsId(7)
        })
    ));
    assert!(matches!(
        sched.alloc(StreamParams::new(DevId(3), TsId(0))),
        Err(UccError::NoComputeUnit { .. })
    ));
    assert_eq!(sched.nr_streams(), 0);
}

#[test]
fn test_stream_table_capacity() {
    setup_test();
    let config = SchedConfig {
        max_streams: 2,
        ..SchedConfig::default()
    };
    let sched = sched_with(TestDevice::new(Consume::All), 1, config);
    let a = sched.alloc(params()).unwrap();
    sched.alloc(params()).unwrap();
    assert!(matches!(
        sched.alloc(params()),
        Err(UccError::StreamTableFull)
    ));
    sched.free(a).unwrap();
    let c = sched.alloc(params()).unwrap();
    assert_eq!(c.index, a.index);
    assert_ne!(c, a);
}

#[test]
fn test_invalid_config_rejected() {
    let config = SchedConfig {
        completion_timeout: Duration::ZERO,
        ..SchedConfig::default()
    };
    assert!(matches!(
        UccScheduler::new(config),
        Err(UccError::InvalidConfig(_))
    ));
}

#[test]
fn test_kick_validates_tail() {
    setup_test();
    let sched = sched(TestDevice::new(Consume::Nothing), 1);
    let id = sched.alloc(params().depth(8)).unwrap();
    assert!(matches!(
        sched.kick(id, 8),
        Err(UccError::TailOutOfRange { tail: 8, depth: 8 })
    ));
    sched.kick(id, 7).unwrap();
    assert!(matches!(
        sched.kick(id, 0),
        Err(UccError::RingOverflow { .. })
    ));
}

#[test]
fn test_wake_up_and_dequeue_are_idempotent() {
    setup_test();
    let sched = sched(TestDevice::new(Consume::Nothing), 1);
    let id = sched.alloc(params()).unwrap();
    let stream = sched.stream(id).unwrap();
    assert_eq!(stream.se().state(), SeState::Prepare);
    assert_eq!(stream.se().cu(), None);

    sched.kick(id, 1).unwrap();
    sched.wake_up(id).unwrap();
    assert_eq!(sched.snapshot().nr_running(), 1);

    sched.dequeue(id).unwrap();
    let first = sched.snapshot();
    sched.dequeue(id).unwrap();
    let second = sched.snapshot();
    assert_eq!(first.nr_running(), 0);
    assert_eq!(first.cus[0].queued, second.cus[0].queued);
    assert!(!stream.se().on_cu());

    // The unit picked at the first wake-up sticks.
    sched.wake_up(id).unwrap();
    assert_eq!(stream.se().cu(), Some(first.cus[0].cu));
}

#[test]
fn test_freed_handles_are_rejected() {
    setup_test();
    let dev = TestDevice::new(Consume::All);
    let sched = sched(dev.clone(), 1);
    let never_kicked = sched.alloc(params()).unwrap();
    sched.free(never_kicked).unwrap();
    assert_eq!(dev.finished(), vec![never_kicked]);

    for err in [
        sched.kick(never_kicked, 1),
        sched.wake_up(never_kicked),
        sched.dequeue(never_kicked),
        sched.free(never_kicked),
        sched.set_step(never_kicked, Step::Fast),
    ] {
        assert!(matches!(err, Err(UccError::UnknownStream(_))));
    }
}

#[test]
fn test_tunables_apply_to_idle_stream() {
    setup_test();
    let sched = sched(TestDevice::new(Consume::All), 1);
    let id = sched.alloc(params()).unwrap();
    sched.set_priority(id, Priority::High).unwrap();
    sched.set_step(id, Step::Fast).unwrap();
    let stats = sched.stream_stats(id).unwrap();
    assert_eq!(stats.priority, Priority::High);
    assert_eq!(stats.step, Step::Fast);
}

#[test]
fn test_shared_completion_queue() {
    setup_test();
    let sched = sched(TestDevice::new(Consume::All), 1);
    let cq = sched.create_cq().unwrap();
    let a = sched.alloc(params().cq(cq)).unwrap();
    let b = sched.alloc(params().cq(cq)).unwrap();
    sched.kick(a, 2).unwrap();
    sched.kick(b, 3).unwrap();

    let mut seen = 0;
    assert!(wait_until(LONG, || {
        seen += sched
            .wait(cq, Duration::from_millis(5))
            .unwrap()
            .iter()
            .map(|c| c.nr_kernels)
            .sum::<u32>();
        seen == 5
    }));

    // Freeing a sharer leaves the queue alive.
    sched.free(a).unwrap();
    assert!(sched.wait(cq, Duration::ZERO).unwrap().is_empty());
    sched.free(b).unwrap();
    sched.destroy_cq(cq).unwrap();
    assert!(matches!(
        sched.wait(cq, Duration::ZERO),
        Err(UccError::UnknownCq(_))
    ));
    assert!(matches!(
        sched.alloc(params().cq(CqId(999))),
        Err(UccError::UnknownCq(CqId(999)))
    ));
}

#[test]
fn test_wait_times_out_empty() {
    setup_test();
    let sched = sched(TestDevice::new(Consume::All), 1);
    let id = sched.alloc(params()).unwrap();
    let cq = sched.stream(id).unwrap().cq();
    assert!(sched.wait(cq, Duration::from_millis(5)).unwrap().is_empty());
}

#[test]
fn test_shutdown_stops_workers() {
    setup_test();
    let sched = sched(TestDevice::new(Consume::Nothing), 2);
    let id = sched.alloc(params()).unwrap();
    sched.kick(id, 1).unwrap();
    sched.shutdown();
    for cu in sched.snapshot().cus {
        assert_eq!(cu.state, CuState::Inactive);
    }
    // Nothing serves the topology anymore.
    assert!(matches!(
        sched.alloc(params()),
        Err(UccError::NoComputeUnit { .. })
    ));
    sched.shutdown();
    sched.free(id).unwrap();
}

#[test]
fn test_deep_ring_kick_does_not_overflow() {
    setup_test();
    let sched = sched(TestDevice::new(Consume::Nothing), 1);
    let id = sched.alloc(params().depth(u32::MAX)).unwrap();
    sched.kick(id, u32::MAX - 1).unwrap();
    let ring = sched.stream(id).unwrap().ring();
    assert_eq!(ring.pending(), u32::MAX - 1);
    assert_eq!(ring.credit(), 0);
    assert!(matches!(
        sched.kick(id, 0),
        Err(UccError::RingOverflow { .. })
    ));
}

/// A rejected submission parks the entity instead of retrying it, and the
/// next kick gives it another try.
#[test]
fn test_failed_submission_blocks_entity() {
    setup_test();
    let dev = TestDevice::new(Consume::Fail);
    let sched = sched(dev.clone(), 1);
    let id = sched.alloc(params()).unwrap();
    let stream = sched.stream(id).unwrap();

    sched.kick(id, 3).unwrap();
    assert!(wait_until(LONG, || stream.se().state() == SeState::Block));
    assert!(!stream.se().on_cu());
    thread::sleep(Duration::from_millis(50));
    assert_eq!(dev.runs_of(id), 1);
    assert_eq!(stream.pending(), 3);
    assert_eq!(sched.stream_stats(id).unwrap().nr_blocks, 1);
    assert_eq!(sched.snapshot().nr_running(), 0);

    sched.kick(id, 3).unwrap();
    assert!(wait_until(LONG, || sched.stream_stats(id).unwrap().nr_blocks == 2));
    assert_eq!(dev.runs_of(id), 2);
    assert_eq!(sched.snapshot().cus[0].nr_blocks, 2);
}

/// `free` racing with `shutdown` still waits for the worker to leave `run`
/// before the backend sees `finish`.
#[test]
fn test_free_during_shutdown_waits_for_submission() {
    setup_test();
    let dev = TestDevice::new(Consume::All);
    let sched = Arc::new(sched(dev.clone(), 1));
    let id = sched.alloc(params()).unwrap();
    dev.gate.close();
    sched.kick(id, 1).unwrap();
    assert!(wait_until(LONG, || dev.runs_of(id) > 0));

    let stopper = {
        let sched = sched.clone();
        thread::spawn(move || sched.shutdown())
    };
    assert!(wait_until(LONG, || {
        sched.cu_stats(CuId(0)).unwrap().state == CuState::Inactive
    }));

    let (tx, rx) = mpsc::channel();
    let freer = {
        let sched = sched.clone();
        thread::spawn(move || {
            let res = sched.free(id);
            tx.send(()).unwrap();
            res
        })
    };
    assert!(rx.recv_timeout(Duration::from_millis(100)).is_err());
    assert!(dev.finished().is_empty());

    dev.gate.open();
    rx.recv_timeout(LONG).unwrap();
    freer.join().unwrap().unwrap();
    stopper.join().unwrap();
    assert_eq!(dev.finished(), vec![id]);
}
