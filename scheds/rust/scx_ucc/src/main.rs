// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.
mod stats;
mod workload;

use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use std::time::Instant;

use anyhow::bail;
use anyhow::Context;
use anyhow::Result;
use clap::Parser;
use log::info;
use log::warn;
use metrics::describe_counter;
use metrics_exporter_prometheus::PrometheusBuilder;
use ucc_sched::{DevId, Priority, SchedConfig, SimDevice, Step, TsId, UccScheduler};

use stats::Metrics;
use workload::ClientSpec;

const SCHEDULER_NAME: &str = "scx_ucc";

const VERSION: &str = env!("CARGO_PKG_VERSION");

/// scx_ucc: priority multi-queue scheduler for accelerator compute units
///
/// Runs the ucc_sched core against software devices and a synthetic set of
/// clients. Each client owns a virtual stream, keeps its command ring topped
/// up and drains its completion queue. Every compute unit has a worker
/// thread that serves its HIGH tier before its LOW tier, FIFO within a tier.
///
/// A HIGH stream that becomes ready while a LOW one runs asks for the unit;
/// the LOW stream yields once it has submitted its step worth of commands
/// (1 for slow, 10 for fast) since it was scheduled in.
#[derive(Debug, Parser)]
struct Opts {
    /// Number of simulated devices.
    #[clap(short = 'd', long, default_value = "1")]
    devices: u32,

    /// Task streams per device.
    #[clap(short = 't', long, default_value = "1")]
    task_streams: u32,

    /// Compute units per task stream.
    #[clap(short = 'c', long, default_value = "2")]
    cus_per_ts: usize,

    /// Number of client threads, each owning one vstream.
    #[clap(short = 'n', long, default_value = "8")]
    clients: usize,

    /// How many of the clients run at HIGH priority.
    #[clap(short = 'H', long, default_value = "2")]
    high_clients: usize,

    /// Give LOW clients the fast step (10 submissions before yielding)
    /// instead of the slow one.
    #[clap(short = 'f', long, action = clap::ArgAction::SetTrue)]
    fast_step: bool,

    /// Commands a client queues per kick.
    #[clap(long, default_value = "16")]
    burst: u32,

    /// Command ring depth of each vstream.
    #[clap(long, default_value = "256")]
    depth: u32,

    /// Commands the simulated device takes per run.
    #[clap(short = 'b', long, default_value = "8")]
    batch: u32,

    /// Simulated device latency in microseconds.
    #[clap(short = 'l', long, default_value = "500")]
    latency_us: u64,

    /// Upper bound on a worker's wait for device completions, in
    /// milliseconds.
    #[clap(long, default_value = "10")]
    completion_timeout_ms: u64,

    /// Unacknowledged commands a stream may have on the device before its
    /// worker waits for completions.
    #[clap(long, default_value = "20")]
    sq_high_water: u64,

    /// Statistics reporting interval in seconds.
    #[clap(short = 'i', long, default_value = "1.0")]
    stats_interval: f64,

    /// Stop after this many seconds. 0 runs until interrupted.
    #[clap(short = 'D', long, default_value = "0")]
    duration: u64,

    /// Print each statistics snapshot as JSON instead of a summary line.
    #[clap(long, action = clap::ArgAction::SetTrue)]
    stats_json: bool,

    /// Enable verbose output. Repeat for trace output.
    #[clap(short = 'v', long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Enable the Prometheus endpoint for metrics on port 9000.
    #[clap(long, action = clap::ArgAction::SetTrue)]
    enable_prometheus: bool,

    /// Print scheduler version and exit.
    #[clap(short = 'V', long, action = clap::ArgAction::SetTrue)]
    version: bool,
}

impl Opts {
    fn sched_config(&self) -> SchedConfig {
        SchedConfig {
            completion_timeout: Duration::from_millis(self.completion_timeout_ms),
            sq_high_water: self.sq_high_water,
            ..SchedConfig::default()
        }
    }

    /// Clients spread round-robin over every (device, task stream) pair;
    /// the first `high_clients` run at HIGH priority.
    fn client_specs(&self) -> Vec<ClientSpec> {
        let topo: Vec<_> = (0..self.devices)
            .flat_map(|d| (0..self.task_streams).map(move |t| (DevId(d), TsId(t))))
            .collect();
        (0..self.clients)
            .map(|i| {
                let (dev, ts) = topo[i % topo.len()];
                let high = i < self.high_clients;
                ClientSpec {
                    dev,
                    ts,
                    priority: if high { Priority::High } else { Priority::Low },
                    step: if high || !self.fast_step {
                        Step::Slow
                    } else {
                        Step::Fast
                    },
                    depth: self.depth,
                    burst: self.burst,
                }
            })
            .collect()
    }
}

struct Scheduler {
    sched: Arc<UccScheduler>,
    devices: Vec<Arc<SimDevice>>,
}

impl Scheduler {
    fn init(opts: &Opts) -> Result<Self> {
        let config = opts.sched_config();
        let sched = UccScheduler::new(config).context("Invalid scheduler configuration")?;
        info!(
            "{} config: {}",
            SCHEDULER_NAME,
            serde_json::to_string(sched.config())?
        );

        let mut devices = Vec::new();
        for d in 0..opts.devices {
            let dev = DevId(d);
            let sim = SimDevice::new(opts.batch, Duration::from_micros(opts.latency_us))
                .with_context(|| format!("Failed to start simulated {dev}"))?;
            sched.register_device(dev, sim.clone())?;
            for t in 0..opts.task_streams {
                sched
                    .register_compute_units(dev, TsId(t), opts.cus_per_ts)
                    .with_context(|| format!("Failed to register compute units for {dev}/ts{t}"))?;
            }
            devices.push(sim);
        }

        Ok(Self {
            sched: Arc::new(sched),
            devices,
        })
    }

    fn report(&self, prev: &Metrics, json: bool) -> Result<Metrics> {
        let snap = self.sched.snapshot();
        let cur = Metrics::from_snapshot(&snap);
        if json {
            println!("{}", serde_json::to_string(&snap)?);
        } else {
            cur.delta(prev).format(&mut std::io::stdout())?;
        }
        Ok(cur)
    }

    fn run(&self, opts: &Opts, shutdown: Arc<AtomicBool>) -> Result<()> {
        let clients = workload::spawn_clients(&self.sched, opts.client_specs(), &shutdown)?;
        info!(
            "{} running: {} clients ({} high) on {} compute units",
            SCHEDULER_NAME,
            opts.clients,
            opts.high_clients.min(opts.clients),
            self.sched.nr_compute_units()
        );

        let interval = Duration::from_secs_f64(opts.stats_interval);
        let deadline =
            (opts.duration > 0).then(|| Instant::now() + Duration::from_secs(opts.duration));
        let mut prev = Metrics::default();
        let mut next_report = Instant::now() + interval;
        while !shutdown.load(Ordering::Relaxed) {
            if deadline.map_or(false, |d| Instant::now() >= d) {
                shutdown.store(true, Ordering::Relaxed);
                break;
            }
            if Instant::now() >= next_report {
                prev = self.report(&prev, opts.stats_json)?;
                next_report += interval;
            }
            thread::sleep(Duration::from_millis(10));
        }

        let mut queued = 0;
        let mut completed = 0;
        for client in clients {
            match client.join() {
                Ok(Ok(report)) => {
                    queued += report.queued;
                    completed += report.completed;
                }
                Ok(Err(e)) => warn!("client failed: {e:#}"),
                Err(_) => warn!("client panicked"),
            }
        }

        self.sched.shutdown();
        let retired: u64 = self.devices.iter().map(|d| d.nr_completed()).sum();
        info!(
            "{} exiting: queued {} completed {} (device retired {})",
            SCHEDULER_NAME, queued, completed, retired
        );
        Ok(())
    }
}

fn stats_interval_valid(secs: f64) -> bool {
    Duration::try_from_secs_f64(secs).map_or(false, |d| !d.is_zero())
}

fn main() -> Result<()> {
    let opts = Opts::parse();

    if opts.version {
        println!(
            "{} version {} - ucc_sched {}",
            SCHEDULER_NAME,
            VERSION,
            ucc_sched::VERSION
        );
        return Ok(());
    }

    let loglevel = match opts.verbose {
        0 => simplelog::LevelFilter::Info,
        1 => simplelog::LevelFilter::Debug,
        _ => simplelog::LevelFilter::Trace,
    };

    let mut lcfg = simplelog::ConfigBuilder::new();
    lcfg.set_time_level(simplelog::LevelFilter::Error)
        .set_location_level(simplelog::LevelFilter::Off)
        .set_target_level(simplelog::LevelFilter::Off)
        .set_thread_level(simplelog::LevelFilter::Off);
    simplelog::TermLogger::init(
        loglevel,
        lcfg.build(),
        simplelog::TerminalMode::Stderr,
        simplelog::ColorChoice::Auto,
    )?;

    if opts.devices == 0 || opts.task_streams == 0 {
        bail!("at least one device and one task stream are required");
    }
    if !stats_interval_valid(opts.stats_interval) {
        bail!("--stats-interval must be a positive number of seconds");
    }

    if opts.enable_prometheus {
        info!("Enabling Prometheus endpoint: http://localhost:9000");
        PrometheusBuilder::new()
            .install()
            .context("failed to install Prometheus recorder")?;
        describe_counter!("ucc_kernels_submitted_total", "Commands handed to a device");
        describe_counter!("ucc_kernels_completed_total", "Commands a device reported done");
        describe_counter!("ucc_preemptions_total", "Honoured preemption requests");
        describe_counter!("ucc_completion_timeouts_total", "Completion waits that timed out");
        describe_counter!("ucc_blocks_total", "Entities blocked on an empty ring");
        describe_counter!("ucc_context_switches_total", "Changes of the running entity");
    }

    let shutdown = Arc::new(AtomicBool::new(false));
    let shutdown_clone = shutdown.clone();
    ctrlc::set_handler(move || {
        shutdown_clone.store(true, Ordering::Relaxed);
    })
    .context("Error setting Ctrl-C handler")?;

    let sched = Scheduler::init(&opts)?;
    sched.run(&opts, shutdown)
}
