//! Environment bootstrap: argument parsing, memory and reactor
//! initialization and orderly shutdown. The environment is initialized
//! once; `start` enters the master reactor poll loop and only returns once
//! [`environment_stop`] ran on all reactors.

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

use byte_unit::{Byte, ByteUnit};
use once_cell::sync::Lazy;
use parking_lot::Mutex;
use snafu::Snafu;
use structopt::StructOpt;

use crate::core::{
    bio,
    cpu_cores::Cores,
    memory::{self, IovaMode},
    reactor::Reactors,
    ticks,
};

fn parse_mb(src: &str) -> Result<i32, String> {
    // For compatibility, we check to see if there are no alphabetic
    // characters passed in; if so, we interpret the value to be in MiB
    // which is what the memory reservation expects it to be in.
    let has_unit = src.trim_end().chars().any(|c| c.is_alphabetic());

    if let Ok(val) = Byte::from_str(src) {
        let value = if has_unit {
            val.get_adjusted_unit(ByteUnit::MiB).get_value() as i32
        } else {
            val.get_bytes() as i32
        };
        Ok(value)
    } else {
        Err(format!("Invalid argument {}", src))
    }
}

#[derive(Debug, Clone, StructOpt)]
#[structopt(
    name = "iocore",
    about = "Userspace block storage runtime",
    setting(structopt::clap::AppSettings::ColoredHelp)
)]
pub struct CliArgs {
    /// The core mask (hex) or core list to run the reactors on.
    #[structopt(short = "c", default_value = "0x1")]
    pub core_mask: String,
    /// The maximum amount of hugepage memory we are allowed to allocate in
    /// MiB. A value of 0 means the built-in default.
    #[structopt(short = "s", parse(try_from_str = parse_mb), default_value = "0")]
    pub mem_size: i32,
    /// Shared memory id, used to keep multiple instances apart.
    #[structopt(short = "i", default_value = "-1")]
    pub shm_id: i32,
    /// How buffers are addressed by devices: va or pa.
    #[structopt(long = "iova-mode", default_value = "va")]
    pub iova_mode: String,
    /// Back the memory region by one single segment.
    #[structopt(long = "single-file-segments")]
    pub hugepage_single_segment: bool,
    /// Disable the use of PCIe devices.
    #[structopt(short = "u")]
    pub no_pci: bool,
    /// Number of entries in the pool for bdev I/O contexts.
    #[structopt(long = "bdev-pool-size", default_value = "65535")]
    pub bdev_io_ctx_pool_size: u64,
    /// Log level when RUST_LOG is not set.
    #[structopt(short = "l", long = "log-level", default_value = "info")]
    pub log_level: String,
}

impl Default for CliArgs {
    fn default() -> Self {
        Self {
            core_mask: "0x1".into(),
            mem_size: 0,
            shm_id: -1,
            iova_mode: "va".into(),
            hugepage_single_segment: false,
            no_pci: true,
            bdev_io_ctx_pool_size: bio::BDEV_IO_POOL_SIZE,
            log_level: "info".into(),
        }
    }
}

/// Global exit code of the program, initially set to -1 to capture double
/// shutdown during test cases
pub static GLOBAL_RC: Lazy<Arc<Mutex<i32>>> =
    Lazy::new(|| Arc::new(Mutex::new(-1)));

/// keep track if we have received a signal already
pub static SIG_RECEIVED: Lazy<AtomicBool> =
    Lazy::new(|| AtomicBool::new(false));

static INITIALIZED: AtomicBool = AtomicBool::new(false);

#[derive(Debug, Snafu)]
pub enum EnvError {
    #[snafu(display("Failed to install signal handler"))]
    SetSigHdl { source: std::io::Error },
    #[snafu(display("Invalid core mask {}", mask))]
    InvalidCoreMask { mask: String },
    #[snafu(display("Environment initialized twice"))]
    AlreadyInitialized {},
}

type Result<T, E = EnvError> = std::result::Result<T, E>;

/// Runtime environment arguments.
#[derive(Debug, Clone)]
pub struct Environment {
    pub name: String,
    pub core_mask: String,
    pub mem_size: i32,
    pub shm_id: i32,
    pub iova_mode: IovaMode,
    pub hugepage_single_segment: bool,
    pub no_pci: bool,
    pub bdev_io_ctx_pool_size: u64,
    pub log_level: String,
}

impl Default for Environment {
    fn default() -> Self {
        Self::new(CliArgs::default())
    }
}

impl Environment {
    pub fn new(args: CliArgs) -> Self {
        Self {
            name: "iocore".into(),
            core_mask: args.core_mask,
            mem_size: args.mem_size,
            shm_id: args.shm_id,
            iova_mode: match args.iova_mode.as_str() {
                "pa" | "PA" => IovaMode::Pa,
                _ => IovaMode::Va,
            },
            hugepage_single_segment: args.hugepage_single_segment,
            no_pci: args.no_pci,
            bdev_io_ctx_pool_size: args.bdev_io_ctx_pool_size,
            log_level: args.log_level,
        }
    }

    pub fn with_name(mut self, name: &str) -> Self {
        self.name = name.into();
        self
    }

    /// Initialize the runtime: logging, tick source, memory region, I/O
    /// context pools and the reactors. Idempotent across test runs.
    pub fn init(self) -> Result<Self> {
        if INITIALIZED.swap(true, Ordering::SeqCst) {
            // tests set up the environment repeatedly; everything below is
            // a one-time affair
            return Ok(self);
        }

        crate::logger::init(&self.log_level);
        info!("{} starting up", self.name);

        Cores::set_from_mask(&self.core_mask).ok_or_else(|| {
            EnvError::InvalidCoreMask {
                mask: self.core_mask.clone(),
            }
        })?;

        // first tick read pins the monotonic base
        let _ = ticks::now();

        memory::init(
            self.mem_size.max(0) as usize,
            self.hugepage_single_segment,
            self.iova_mode,
        );
        bio::bdev_io_pool_init(self.bdev_io_ctx_pool_size);

        // built-in plugins register here, not via hidden constructors
        crate::sock::register_default_impls();
        crate::bdev::nvmx::register_default_transports(self.no_pci);

        Reactors::init();
        self.install_signal_handlers()?;

        Ok(self)
    }

    fn install_signal_handlers(&self) -> Result<()> {
        for sig in
            [signal_hook::consts::SIGINT, signal_hook::consts::SIGTERM].iter()
        {
            signal_hook::flag::register(
                *sig,
                Lazy::force(&SIG_RECEIVED_ARC).clone(),
            )
            .map(|_| ())
            .map_err(|source| EnvError::SetSigHdl {
                source,
            })?;
        }
        Ok(())
    }

    /// Launch the remote reactors, run `start_cb` on the master reactor and
    /// poll until shutdown. Returns the global exit code.
    pub fn start<F>(self, start_cb: F) -> Result<i32>
    where
        F: FnOnce() + Send + 'static,
    {
        let env = self.init()?;

        Cores::set_current(Cores::first());
        for core in Cores::count().into_iter() {
            if core != Cores::first() {
                let _ = Reactors::launch_remote(core);
            }
        }

        let master = Reactors::master();
        master.send_future(async move {
            start_cb();
        });

        // watch for signals from the master reactor
        master.thread().with(|| {
            let poller = crate::core::poller::Builder::new()
                .with_name("signal_poller")
                .with_interval(10_000)
                .with_poll_fn(|| {
                    if SIG_RECEIVED_ARC.load(Ordering::SeqCst)
                        && !SIG_RECEIVED.swap(true, Ordering::SeqCst)
                    {
                        warn!("signal received, shutting down");
                        environment_stop(0);
                    }
                    0
                })
                .build();
            // lives until the reactor tears its thread down
            std::mem::forget(poller);
        });

        for r in Reactors::iter() {
            if r.core() != Cores::first() {
                r.running();
            }
        }
        master.running();
        info!("{} ready; polling {} cores", env.name, Cores::count().into_iter().count());
        Reactors::launch_master();

        let rc = *GLOBAL_RC.lock();
        info!("{} stopped, rc: {}", env.name, rc);
        Ok(rc)
    }
}

static SIG_RECEIVED_ARC: Lazy<Arc<AtomicBool>> =
    Lazy::new(|| Arc::new(AtomicBool::new(false)));

/// Signal all reactors to terminate after draining and record the exit
/// code. The call returns immediately; `Environment::start` unblocks once
/// the master loop exits.
pub fn environment_stop(rc: i32) {
    let mut global = GLOBAL_RC.lock();
    if *global != -1 {
        debug!("stop called more than once, rc {} kept", *global);
        return;
    }
    *global = rc;

    for r in Reactors::iter() {
        r.shutdown();
    }
}
