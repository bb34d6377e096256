// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use ucc_sched::{DevId, SchedConfig, SimDevice, StreamParams, TsId, UccScheduler};

mod common;

use common::{setup_test, wait_until, LONG};

fn sim_sched(sim: Arc<SimDevice>, nr_cus: usize, config: SchedConfig) -> UccScheduler {
    let sched = UccScheduler::new(config).unwrap();
    sched.register_device(DevId(0), sim).unwrap();
    sched
        .register_compute_units(DevId(0), TsId(0), nr_cus)
        .unwrap();
    sched
}

/// Every kicked command comes back exactly once through the stream's
/// completion queue.
#[test]
fn test_clients_see_all_completions() {
    setup_test();
    let sim = SimDevice::new(4, Duration::from_micros(200)).unwrap();
    let sched = Arc::new(sim_sched(sim.clone(), 2, SchedConfig::default()));
    const DEPTH: u32 = 32;
    const PER_CLIENT: u32 = 100;

    let clients: Vec<_> = (0..4)
        .map(|_| {
            let sched = sched.clone();
            thread::spawn(move || {
                let id = sched
                    .alloc(StreamParams::new(DevId(0), TsId(0)).depth(DEPTH))
                    .unwrap();
                let cq = sched.stream(id).unwrap().cq();
                let mut tail = 0;
                let mut queued = 0;
                let mut done = 0;
                while done < PER_CLIENT {
                    let credit = sched.stream(id).unwrap().ring().credit();
                    let n = credit.min(PER_CLIENT - queued);
                    if n > 0 {
                        tail = (tail + n) % DEPTH;
                        queued += n;
                        sched.kick(id, tail).unwrap();
                    }
                    for completion in sched.wait(cq, Duration::from_millis(50)).unwrap() {
                        assert_eq!(completion.stream, id);
                        done += completion.nr_kernels;
                    }
                }
                assert_eq!(done, PER_CLIENT);
                assert!(wait_until(LONG, || {
                    sched.stream_stats(id).unwrap().nr_kernels == PER_CLIENT as u64
                }));
                sched.free(id).unwrap();
            })
        })
        .collect();
    for client in clients {
        client.join().unwrap();
    }

    assert_eq!(sim.nr_submitted(), 4 * PER_CLIENT as u64);
    assert!(wait_until(LONG, || sim.nr_completed() == 4 * PER_CLIENT as u64));
    assert!(wait_until(LONG, || sched.snapshot().nr_kernels() == 4 * PER_CLIENT as u64));
    assert_eq!(sched.snapshot().nr_running(), 0);
}

/// A device slower than the completion timeout costs timeouts, not
/// progress.
#[test]
fn test_slow_device_records_timeouts() {
    setup_test();
    let sim = SimDevice::new(2, Duration::from_millis(20)).unwrap();
    let config = SchedConfig {
        completion_timeout: Duration::from_millis(2),
        sq_high_water: 2,
        ..SchedConfig::default()
    };
    let sched = sim_sched(sim.clone(), 1, config);

    let id = sched
        .alloc(StreamParams::new(DevId(0), TsId(0)))
        .unwrap();
    sched.kick(id, 8).unwrap();
    let stream = sched.stream(id).unwrap();
    assert!(wait_until(LONG, || stream.nr_completed() == 8));

    let stats = sched.stream_stats(id).unwrap();
    assert!(stats.nr_timeouts >= 1);
    assert_eq!(stats.nr_kernels, 8);
    assert!(sched.snapshot().cus[0].nr_timeouts >= 1);
}

/// The per-stream high-water override wins over the scheduler default.
#[test]
fn test_high_water_override_limits_inflight() {
    setup_test();
    let sim = SimDevice::new(1, Duration::from_millis(30)).unwrap();
    let config = SchedConfig {
        completion_timeout: Duration::from_millis(200),
        ..SchedConfig::default()
    };
    let sched = sim_sched(sim.clone(), 1, config);

    let id = sched
        .alloc(StreamParams::new(DevId(0), TsId(0)).sq_high_water(3))
        .unwrap();
    let stream = sched.stream(id).unwrap();
    assert_eq!(stream.sq_high_water(), 3);
    sched.kick(id, 10).unwrap();

    let mut peak = 0;
    assert!(wait_until(LONG, || {
        peak = peak.max(stream.inflight());
        stream.nr_completed() == 10
    }));
    assert!(peak <= 3, "peak inflight {peak}");
}
