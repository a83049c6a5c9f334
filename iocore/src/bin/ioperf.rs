//! Small performance tool driving the runtime end to end: attaches NVMe
//! controllers (or creates bdevs from URIs), fans a queue-depth worth of
//! I/O out on every core and reports per-second numbers at the end.

#[macro_use]
extern crate log;

use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};

use structopt::StructOpt;

use iocore::{
    bdev::{bdev_create, nvmx},
    core::{
        environment_stop,
        ticks,
        Bdev,
        CliArgs,
        Descriptor,
        DmaBuf,
        Environment,
        IoChannel,
        IoStatus,
        Reactor,
        Reactors,
    },
};

#[derive(Debug, Clone, StructOpt)]
#[structopt(name = "ioperf", about = "I/O performance tool")]
struct PerfOpts {
    /// queue depth per core
    #[structopt(short = "q", default_value = "32")]
    queue_depth: u32,
    /// I/O size in bytes
    #[structopt(short = "o", default_value = "4096")]
    io_size: u64,
    /// workload: read write randread randwrite rw randrw
    #[structopt(short = "w", default_value = "randread")]
    workload: String,
    /// percentage of reads in mixed workloads
    #[structopt(short = "M", default_value = "50")]
    read_percent: u32,
    /// runtime in seconds
    #[structopt(short = "t", default_value = "10")]
    time: u64,
    /// core mask
    #[structopt(short = "c", default_value = "0x1")]
    core_mask: String,
    /// NVMe transport ids to attach, e.g. "trtype:PCIe traddr:0000:01:00.0"
    #[structopt(short = "r")]
    trids: Vec<String>,
    /// hugepage memory in MiB
    #[structopt(short = "s", default_value = "0")]
    mem_size: i32,
    /// shared memory id
    #[structopt(short = "i", default_value = "-1")]
    shm_id: i32,
    /// debug logging
    #[structopt(short = "G")]
    debug: bool,
    /// enable a log component
    #[structopt(short = "T")]
    log_flags: Vec<String>,
    /// bdev URIs to drive instead of (or besides) NVMe targets
    uris: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Workload {
    Read,
    Write,
    RandRead,
    RandWrite,
    Rw,
    RandRw,
}

impl Workload {
    fn parse(s: &str) -> Option<Workload> {
        match s {
            "read" => Some(Workload::Read),
            "write" => Some(Workload::Write),
            "randread" => Some(Workload::RandRead),
            "randwrite" => Some(Workload::RandWrite),
            "rw" => Some(Workload::Rw),
            "randrw" => Some(Workload::RandRw),
            _ => None,
        }
    }

    fn is_random(&self) -> bool {
        matches!(
            self,
            Workload::RandRead | Workload::RandWrite | Workload::RandRw
        )
    }

    fn is_mixed(&self) -> bool {
        matches!(self, Workload::Rw | Workload::RandRw)
    }

    fn is_read(&self) -> bool {
        matches!(self, Workload::Read | Workload::RandRead)
    }
}

#[derive(Default)]
struct Counters {
    reads: AtomicU64,
    writes: AtomicU64,
    errors: AtomicU64,
    outstanding: AtomicU64,
}

struct Job {
    desc: Descriptor,
    channel: IoChannel,
    workload: Workload,
    read_percent: u32,
    io_size: u64,
    num_ios: u64,
    deadline: u64,
    next: AtomicU64,
    rng: AtomicU64,
    counters: Arc<Counters>,
}

impl Job {
    /// cheap xorshift; every core seeds differently
    fn rand(&self) -> u64 {
        let mut x = self.rng.load(Ordering::Relaxed);
        x ^= x << 13;
        x ^= x >> 7;
        x ^= x << 17;
        self.rng.store(x, Ordering::Relaxed);
        x
    }

    fn next_offset(&self) -> u64 {
        let slot = if self.workload.is_random() {
            self.rand() % self.num_ios
        } else {
            self.next.fetch_add(1, Ordering::Relaxed) % self.num_ios
        };
        slot * self.io_size
    }

    fn next_is_read(&self) -> bool {
        if self.workload.is_mixed() {
            (self.rand() % 100) < self.read_percent as u64
        } else {
            self.workload.is_read()
        }
    }
}

fn submit_one(job: &Arc<Job>) {
    let offset = job.next_offset();
    let is_read = job.next_is_read();

    let buf = match DmaBuf::new(job.io_size as usize, 12) {
        Ok(buf) => buf,
        Err(_) => {
            job.counters.errors.fetch_add(1, Ordering::Relaxed);
            job.counters.outstanding.fetch_sub(1, Ordering::Relaxed);
            return;
        }
    };

    let j = Arc::clone(job);
    let cb = move |status: IoStatus, _bufs: Vec<DmaBuf>| {
        match status {
            IoStatus::Success => {
                if is_read {
                    j.counters.reads.fetch_add(1, Ordering::Relaxed);
                } else {
                    j.counters.writes.fetch_add(1, Ordering::Relaxed);
                }
            }
            _ => {
                j.counters.errors.fetch_add(1, Ordering::Relaxed);
            }
        }
        if ticks::now() < j.deadline {
            submit_one(&j);
        } else {
            j.counters.outstanding.fetch_sub(1, Ordering::Relaxed);
        }
    };

    let res = if is_read {
        job.desc
            .read(&job.channel, buf, offset, job.io_size, cb)
    } else {
        job.desc
            .write(&job.channel, buf, offset, job.io_size, cb)
    };

    if let Err(e) = res {
        debug!("submission failed: {}", e);
        job.counters.errors.fetch_add(1, Ordering::Relaxed);
        job.counters.outstanding.fetch_sub(1, Ordering::Relaxed);
    }
}

fn start_job(
    bdev_name: &str,
    opts: &PerfOpts,
    workload: Workload,
    counters: Arc<Counters>,
) -> Result<(), String> {
    let desc = Bdev::open_by_name(bdev_name, true)
        .map_err(|e| format!("cannot open {}: {}", bdev_name, e))?;
    let channel = desc
        .get_io_channel()
        .ok_or_else(|| format!("cannot get a channel to {}", bdev_name))?;

    let bdev = desc.get_bdev();
    if opts.io_size % bdev.block_len() as u64 != 0 {
        return Err(format!(
            "I/O size {} is not a multiple of the {} block size of {}",
            opts.io_size,
            bdev.block_len(),
            bdev_name
        ));
    }
    let num_ios = bdev.size_in_bytes() / opts.io_size;
    if num_ios == 0 {
        return Err(format!("{} is smaller than one I/O", bdev_name));
    }

    let job = Arc::new(Job {
        desc,
        channel,
        workload,
        read_percent: opts.read_percent,
        io_size: opts.io_size,
        num_ios,
        deadline: ticks::now() + ticks::from_micros(opts.time * 1_000_000),
        next: AtomicU64::new(0),
        rng: AtomicU64::new(rand::random::<u64>() | 1),
        counters,
    });

    for _ in 0 .. opts.queue_depth {
        job.counters.outstanding.fetch_add(1, Ordering::Relaxed);
        submit_one(&job);
    }
    Ok(())
}

fn attach_targets(opts: &PerfOpts) -> Result<Vec<String>, String> {
    let mut bdevs = Vec::new();

    let need_pci = opts
        .trids
        .iter()
        .any(|t| t.to_lowercase().contains("trtype:pcie"));
    nvmx::register_default_transports(!need_pci);

    for (i, trid) in opts.trids.iter().enumerate() {
        let trid: nvmx::NvmeTransportId = trid
            .parse()
            .map_err(|e| format!("bad transport id '{}': {}", trid, e))?;

        let attached = nvmx::probe(
            &trid,
            &nvmx::NvmeControllerOpts::default(),
            |_, _| true,
            |cand, _carc| {
                info!("attached controller {}", cand);
            },
        )
        .map_err(|e| format!("probe of '{}' failed: {}", trid, e))?;

        if attached == 0 && nvmx::NVME_CONTROLLERS.is_empty() {
            return Err(format!("no controllers found for '{}'", trid));
        }

        for (c, name) in nvmx::NVME_CONTROLLERS.names().iter().enumerate() {
            let alias = format!("nvme{}n{}", i, c + 1);
            if Bdev::lookup_by_name(&alias).is_none() {
                nvmx::create_block_device(name, &alias)
                    .map_err(|e| format!("{}: {}", name, e))?;
                bdevs.push(alias);
            }
        }
    }

    for uri in opts.uris.iter() {
        let target = uri.clone();
        let name =
            Reactor::block_on(async move { bdev_create(&target).await })
                .expect("block_on failed")
                .map_err(|e| format!("cannot create '{}': {}", uri, e))?;
        bdevs.push(name);
    }

    if bdevs.is_empty() {
        info!("no targets given, using a ram disk");
        let name = Reactor::block_on(async {
            bdev_create("malloc:///perf0?size_mb=64").await
        })
        .expect("block_on failed")
        .map_err(|e| format!("cannot create ram disk: {}", e))?;
        bdevs.push(name);
    }

    Ok(bdevs)
}

fn run(opts: PerfOpts, workload: Workload) {
    let targets = match attach_targets(&opts) {
        Ok(t) => t,
        Err(e) => {
            eprintln!("{}", e);
            environment_stop(1);
            return;
        }
    };

    info!(
        "running '{}' at qd {} / {} bytes for {} s against {:?}",
        opts.workload, opts.queue_depth, opts.io_size, opts.time, targets
    );

    let counters = Arc::new(Counters::default());
    let started = ticks::now();

    // one job per core per target
    for r in Reactors::iter() {
        let opts = opts.clone();
        let targets = targets.clone();
        let counters = Arc::clone(&counters);
        r.send_future(async move {
            for name in targets.iter() {
                if let Err(e) =
                    start_job(name, &opts, workload, Arc::clone(&counters))
                {
                    error!("{}", e);
                    environment_stop(1);
                    return;
                }
            }
        });
    }

    // completion watcher on the master core
    let poll_counters = Arc::clone(&counters);
    let duration_us = opts.time * 1_000_000;
    Reactors::master().send_future(async move {
        let watcher = iocore::core::poller::Builder::new()
            .with_name("perf_watcher")
            .with_interval(100_000)
            .with_poll_fn(move || {
                let done = ticks::now()
                    >= started + ticks::from_micros(duration_us);
                if !done
                    || poll_counters.outstanding.load(Ordering::Relaxed) > 0
                {
                    return 0;
                }

                let elapsed_s = ((ticks::now() - started)
                    / ticks::from_micros(1_000_000))
                .max(1);
                let reads = poll_counters.reads.load(Ordering::Relaxed);
                let writes = poll_counters.writes.load(Ordering::Relaxed);
                let errors = poll_counters.errors.load(Ordering::Relaxed);

                println!(
                    "read iops: {:>12}  write iops: {:>12}  errors: {}",
                    reads / elapsed_s,
                    writes / elapsed_s,
                    errors
                );
                environment_stop(if errors > 0 { 1 } else { 0 });
                1
            })
            .build();
        std::mem::forget(watcher);
    });
}

fn main() {
    let opts = PerfOpts::from_args();

    let workload = match Workload::parse(&opts.workload) {
        Some(w) => w,
        None => {
            eprintln!("unknown workload '{}'", opts.workload);
            std::process::exit(1);
        }
    };

    let mut log_level =
        if opts.debug { "debug".to_string() } else { "info".to_string() };
    for flag in opts.log_flags.iter() {
        log_level.push_str(&format!(",{}=trace", flag));
    }

    let env = Environment::new(CliArgs {
        core_mask: opts.core_mask.clone(),
        mem_size: opts.mem_size,
        shm_id: opts.shm_id,
        log_level,
        ..CliArgs::default()
    })
    .with_name("ioperf");

    let opts_for_start = opts;
    let rc = env
        .start(move || run(opts_for_start, workload))
        .unwrap_or(1);

    std::process::exit(if rc == 0 { 0 } else { 1 });
}
