//!
//! core contains the primary abstractions of the runtime: reactors and
//! threads, the device/channel registry, DMA memory and the bdev layer.

use nix::errno::Errno;
use snafu::Snafu;

pub use bdev::{Bdev, BdevOps};
pub use bio::{BdevIo, IoCompletionCb, IoStatus, IoType};
pub use channel::IoChannel;
pub use cpu_cores::{Core, Cores};
pub use descriptor::Descriptor;
pub use device_events::{DeviceEventDispatcher, DeviceEventType};
pub use dma::{DmaBuf, DmaError};
pub use env::{
    environment_stop,
    CliArgs,
    EnvError,
    Environment,
    GLOBAL_RC,
    SIG_RECEIVED,
};
pub use handle::BdevHandle;
pub use io_device::{IoDevice, IoDeviceId};
pub use memory::IovaMode;
pub use mempool::{MemoryPool, PoolItem};
pub use mthread::{for_each_thread, Mthread, PollStatus, ThreadState};
pub use poller::Poller;
pub use reactor::{Reactor, ReactorState, Reactors, REACTOR_LIST};

mod bdev;
mod bio;
mod channel;
pub mod cpu_cores;
mod descriptor;
mod device_events;
pub mod dma;
mod env;
mod handle;
pub mod io_device;
pub mod memory;
pub mod mempool;
pub mod mthread;
pub mod poller;
mod reactor;
pub mod ticks;

/// completion callback for controller level operations (reset, shutdown)
pub type OpCompletionCallback = Box<dyn FnOnce(bool) + Send>;

#[derive(Debug, Snafu)]
#[snafu(visibility = "pub(crate)")]
pub enum CoreError {
    #[snafu(display("bdev {} not found", name))]
    BdevNotFound {
        name: String,
    },
    #[snafu(display("bdev {} already exists", name))]
    BdevExists {
        name: String,
    },
    #[snafu(display("failed to open bdev: {}", source))]
    OpenBdev {
        source: Errno,
    },
    #[snafu(display("descriptor for {} is stale", name))]
    InvalidDescriptor {
        name: String,
    },
    #[snafu(display("descriptor for {} is not opened for writing", name))]
    ReadOnlyDescriptor {
        name: String,
    },
    #[snafu(display("failed to get IO channel for {}", name))]
    GetIoChannel {
        name: String,
    },
    #[snafu(display("invalid offset {}", offset))]
    InvalidOffset {
        offset: u64,
    },
    #[snafu(display("invalid length {}", len))]
    InvalidLength {
        len: u64,
    },
    #[snafu(display("buffer does not honour the required alignment {}", alignment))]
    UnalignedBuffer {
        alignment: u64,
    },
    #[snafu(display(
        "Failed to dispatch read at offset {} length {}",
        offset,
        len
    ))]
    ReadDispatch {
        source: Errno,
        offset: u64,
        len: u64,
    },
    #[snafu(display(
        "Failed to dispatch write at offset {} length {}",
        offset,
        len
    ))]
    WriteDispatch {
        source: Errno,
        offset: u64,
        len: u64,
    },
    #[snafu(display(
        "Failed to dispatch unmap at offset {} length {}",
        offset,
        len
    ))]
    UnmapDispatch {
        source: Errno,
        offset: u64,
        len: u64,
    },
    #[snafu(display(
        "Failed to dispatch write-zeroes at offset {} length {}",
        offset,
        len
    ))]
    WriteZeroesDispatch {
        source: Errno,
        offset: u64,
        len: u64,
    },
    #[snafu(display("Failed to dispatch flush: {}", source))]
    FlushDispatch {
        source: Errno,
    },
    #[snafu(display("Failed to dispatch reset: {}", source))]
    ResetDispatch {
        source: Errno,
    },
    #[snafu(display(
        "Read failed at offset {} length {} with status {:?}",
        offset,
        len,
        status
    ))]
    ReadFailed {
        status: IoStatus,
        offset: u64,
        len: u64,
    },
    #[snafu(display(
        "Write failed at offset {} length {} with status {:?}",
        offset,
        len,
        status
    ))]
    WriteFailed {
        status: IoStatus,
        offset: u64,
        len: u64,
    },
    #[snafu(display("Reset failed"))]
    ResetFailed {},
    #[snafu(display("Flush failed"))]
    FlushFailed {},
    #[snafu(display("the operation is not supported by this bdev: {}", source))]
    NotSupported {
        source: Errno,
    },
    #[snafu(display("out of memory: {}", source))]
    NoMemory {
        source: Errno,
    },
    #[snafu(display("Failed to allocate DMA buffer of {} bytes", size))]
    DmaAllocationFailed {
        size: u64,
    },
    #[snafu(display("device {} has been removed", name))]
    DeviceRemoved {
        name: String,
    },
    #[snafu(display("message ring of thread {} is full", name))]
    MessageRingFull {
        name: String,
    },
    #[snafu(display("thread {} is gone", name))]
    ThreadGone {
        name: String,
    },
    #[snafu(display("not called from within a thread context"))]
    NoThreadContext {},
    #[snafu(display("no transport registered for {}", trtype))]
    TransportNotFound {
        trtype: String,
    },
    #[snafu(display("invalid transport id '{}': {}", trid, reason))]
    InvalidTransportId {
        trid: String,
        reason: String,
    },
    #[snafu(display("failed to connect to {}: {}", target, source))]
    ConnectFailed {
        source: Errno,
        target: String,
    },
    #[snafu(display(
        "Failed to dispatch NVMe admin command {:x}h: {}",
        opcode,
        source
    ))]
    NvmeAdminDispatch {
        source: Errno,
        opcode: u8,
    },
    #[snafu(display("NVMe admin command {:x}h failed", opcode))]
    NvmeAdminFailed {
        opcode: u8,
    },
    #[snafu(display("qpair {} does not accept submissions", qid))]
    QpairUnavailable {
        qid: u16,
    },
    #[snafu(display("controller {} is failed", name))]
    ControllerFailed {
        name: String,
    },
    #[snafu(display("controller {} is busy", name))]
    ControllerBusy {
        name: String,
    },
    #[snafu(display("bdev {} has open descriptors", name))]
    BdevBusy {
        name: String,
    },
}

/// Represent error as Errno value.
pub trait ToErrno {
    fn to_errno(self) -> Errno;
}

/// Map CoreError to errno code, following the common taxonomy: EINVAL for
/// malformed input, ENOMEM for back-pressure, ENODEV/ENXIO for missing or
/// failed resources, EBUSY for operations in progress.
impl ToErrno for CoreError {
    fn to_errno(self) -> Errno {
        match self {
            Self::BdevNotFound {
                ..
            }
            | Self::DeviceRemoved {
                ..
            } => Errno::ENODEV,
            Self::BdevExists {
                ..
            } => Errno::EEXIST,
            Self::OpenBdev {
                source,
            } => source,
            Self::InvalidDescriptor {
                ..
            } => Errno::ENODEV,
            Self::ReadOnlyDescriptor {
                ..
            } => Errno::EPERM,
            Self::GetIoChannel {
                ..
            }
            | Self::QpairUnavailable {
                ..
            } => Errno::ENXIO,
            Self::InvalidOffset {
                ..
            }
            | Self::InvalidLength {
                ..
            }
            | Self::UnalignedBuffer {
                ..
            }
            | Self::InvalidTransportId {
                ..
            }
            | Self::NoThreadContext {} => Errno::EINVAL,
            Self::ReadDispatch {
                source, ..
            }
            | Self::WriteDispatch {
                source, ..
            }
            | Self::UnmapDispatch {
                source, ..
            }
            | Self::WriteZeroesDispatch {
                source, ..
            }
            | Self::FlushDispatch {
                source,
            }
            | Self::ResetDispatch {
                source,
            }
            | Self::NvmeAdminDispatch {
                source, ..
            }
            | Self::ConnectFailed {
                source, ..
            }
            | Self::NotSupported {
                source,
            }
            | Self::NoMemory {
                source,
            } => source,
            Self::ReadFailed {
                ..
            }
            | Self::WriteFailed {
                ..
            }
            | Self::ResetFailed {
                ..
            }
            | Self::FlushFailed {
                ..
            }
            | Self::NvmeAdminFailed {
                ..
            }
            | Self::ControllerFailed {
                ..
            } => Errno::EIO,
            Self::DmaAllocationFailed {
                ..
            } => Errno::ENOMEM,
            Self::MessageRingFull {
                ..
            } => Errno::EAGAIN,
            Self::ThreadGone {
                ..
            } => Errno::ESRCH,
            Self::TransportNotFound {
                ..
            } => Errno::ENODEV,
            Self::ControllerBusy {
                ..
            }
            | Self::BdevBusy {
                ..
            } => Errno::EBUSY,
        }
    }
}

/// Obtain the full error chain
pub trait VerboseError {
    fn verbose(&self) -> String;
}

impl<T> VerboseError for T
where
    T: std::error::Error,
{
    /// loops through the error chain and formats into a single string
    /// containing all the lower level errors
    fn verbose(&self) -> String {
        let mut msg = format!("{}", self);
        let mut opt_source = self.source();
        while let Some(source) = opt_source {
            msg = format!("{}: {}", msg, source);
            opt_source = source.source();
        }
        msg
    }
}
