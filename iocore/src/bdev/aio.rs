//! File backed leaf driver. Each channel owns an io_uring instance; I/O is
//! mapped onto ring submissions and a per-channel poller reaps the
//! completion queue. This is the minimum contract every leaf driver must
//! satisfy: submit maps onto a native async primitive, a poller drains
//! completions on the owning thread.

use std::{
    collections::{HashMap, VecDeque},
    convert::TryFrom,
    fs::{File, OpenOptions},
    os::unix::io::{AsRawFd, RawFd},
    sync::Arc,
};

use async_trait::async_trait;
use io_uring::{opcode, types, IoUring};
use nix::errno::Errno;
use parking_lot::Mutex;
use snafu::ResultExt;
use url::Url;

use crate::{
    bdev::{
        uri::{self, BdevError},
        CreateDestroy,
        GetName,
    },
    core::{
        io_device::{self, IoDeviceId},
        Bdev,
        BdevIo,
        BdevOps,
        IoChannel,
        IoDevice,
        IoStatus,
        IoType,
        Poller,
    },
};

/// ring entries per channel
const RING_DEPTH: u32 = 128;

#[derive(Debug)]
pub(super) struct Aio {
    name: String,
    file: String,
    blk_size: u32,
}

/// Convert a URI to an Aio "object"
impl TryFrom<&Url> for Aio {
    type Error = BdevError;

    fn try_from(url: &Url) -> Result<Self, Self::Error> {
        let segments = uri::segments(url);

        if segments.is_empty() {
            return Err(BdevError::UriInvalid {
                uri: url.to_string(),
                message: String::from("no path segments"),
            });
        }

        let mut parameters: HashMap<String, String> =
            url.query_pairs().into_owned().collect();

        let blk_size: u32 = match parameters.remove("blk_size") {
            Some(value) => {
                value.parse().context(uri::IntParamParseFailed {
                    uri: url.to_string(),
                    parameter: String::from("blk_size"),
                })?
            }
            None => 512,
        };

        if let Some(keys) = uri::keys(parameters) {
            warn!("ignored parameters: {}", keys);
        }

        Ok(Aio {
            name: url.to_string(),
            file: format!("/{}", segments.join("/")),
            blk_size,
        })
    }
}

impl GetName for Aio {
    fn get_name(&self) -> String {
        self.name.clone()
    }
}

#[async_trait(? Send)]
impl CreateDestroy for Aio {
    type Error = BdevError;

    /// Create an AIO bdev
    async fn create(&self) -> Result<String, Self::Error> {
        if Bdev::lookup_by_name(&self.name).is_some() {
            return Err(BdevError::BdevExists {
                name: self.get_name(),
            });
        }

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&self.file)
            .map_err(|_| BdevError::UriInvalid {
                uri: self.name.clone(),
                message: format!("cannot open {}", self.file),
            })?;

        let len = file
            .metadata()
            .map_err(|_| BdevError::UriInvalid {
                uri: self.name.clone(),
                message: "cannot stat backing file".into(),
            })?
            .len();

        if len == 0 || len % self.blk_size as u64 != 0 {
            return Err(BdevError::UriInvalid {
                uri: self.name.clone(),
                message: format!(
                    "backing file size {} not a multiple of block size {}",
                    len, self.blk_size
                ),
            });
        }

        let file = Arc::new(file);
        let file_for_channels = Arc::clone(&file);

        let device = IoDevice::register::<AioChannel>(
            &self.name,
            move |id| AioChannel::new(id, Arc::clone(&file_for_channels)),
            |_, chan| chan.drain(),
        );
        let device_id = device.id();

        Bdev::new(
            self.name.clone(),
            "AIO disk".into(),
            self.blk_size,
            len / self.blk_size as u64,
            9,
            true,
            Box::new(AioDevice {
                device_id,
                device: Mutex::new(Some(device)),
                _file: file,
            }),
        )
        .register()
        .map(|bdev| bdev.name().to_string())
        .map_err(|source| BdevError::CreateBdev {
            source,
            name: self.get_name(),
        })
    }

    /// Destroy the given AIO bdev
    async fn destroy(self: Box<Self>) -> Result<(), Self::Error> {
        match Bdev::lookup_by_name(&self.name) {
            Some(_) => Bdev::unregister(&self.name).map_err(|source| {
                BdevError::DestroyBdev {
                    source,
                    name: self.get_name(),
                }
            }),
            None => Err(BdevError::BdevNotFound {
                name: self.get_name(),
            }),
        }
    }
}

struct AioDevice {
    device_id: IoDeviceId,
    device: Mutex<Option<IoDevice>>,
    _file: Arc<File>,
}

struct Inflight {
    io: BdevIo,
    /// keeps the iovec array alive until the cqe arrives
    _iovs: Box<[libc::iovec]>,
}

pub(crate) struct AioChannel {
    ring: IoUring,
    fd: RawFd,
    inflight: HashMap<u64, Inflight>,
    next_id: u64,
    pending_reset: Option<BdevIo>,
    overflow: VecDeque<BdevIo>,
    _poller: Poller,
}

impl AioChannel {
    fn new(device: IoDeviceId, file: Arc<File>) -> Result<Self, Errno> {
        let ring = IoUring::new(RING_DEPTH).map_err(|e| {
            Errno::from_i32(e.raw_os_error().unwrap_or(libc::ENOMEM))
        })?;

        let poller = crate::core::poller::Builder::new()
            .with_name("aio_channel_poller")
            .with_poll_fn(move || poll_channel(device))
            .build();

        Ok(Self {
            ring,
            fd: file.as_raw_fd(),
            inflight: HashMap::new(),
            next_id: 1,
            pending_reset: None,
            overflow: VecDeque::new(),
            _poller: poller,
        })
    }

    fn drain(mut self) {
        // inflight entries are lost with the ring; fail them out
        for (_, entry) in self.inflight.drain() {
            entry.io.complete(IoStatus::Aborted);
        }
        for io in self.overflow.drain(..) {
            io.complete(IoStatus::Aborted);
        }
        if let Some(reset) = self.pending_reset.take() {
            reset.complete(IoStatus::Aborted);
        }
    }

    /// push one I/O onto the ring; false when the submission queue is full
    fn submit_one(&mut self, io: BdevIo) -> Result<(), BdevIo> {
        let id = self.next_id;

        let remaining = io.num_bytes() as usize;
        let iovs: Vec<libc::iovec> = io
            .bufs()
            .iter()
            .scan(remaining, |remaining, b| {
                if *remaining == 0 {
                    return None;
                }
                let l = b.len().min(*remaining);
                *remaining -= l;
                Some(libc::iovec {
                    iov_base: b.as_ptr() as *mut libc::c_void,
                    iov_len: l,
                })
            })
            .collect();
        let iovs = iovs.into_boxed_slice();

        let entry = match io.io_type() {
            IoType::Read => opcode::Readv::new(
                types::Fd(self.fd),
                iovs.as_ptr(),
                iovs.len() as u32,
            )
            .offset(io.offset() as _)
            .build()
            .user_data(id),
            IoType::Write => opcode::Writev::new(
                types::Fd(self.fd),
                iovs.as_ptr(),
                iovs.len() as u32,
            )
            .offset(io.offset() as _)
            .build()
            .user_data(id),
            IoType::Flush => opcode::Fsync::new(types::Fd(self.fd))
                .build()
                .user_data(id),
            _ => return Err(io),
        };

        {
            let mut sq = self.ring.submission();
            if unsafe { sq.push(&entry) }.is_err() {
                drop(sq);
                return Err(io);
            }
        }

        if let Err(e) = self.ring.submit() {
            error!("io_uring submit failed: {}", e);
        }

        self.next_id += 1;
        self.inflight.insert(
            id,
            Inflight {
                io,
                _iovs: iovs,
            },
        );
        Ok(())
    }
}

/// reap the completion ring; runs on the channel's thread
fn poll_channel(device: IoDeviceId) -> i32 {
    let completed = io_device::with_channel_ctx::<AioChannel, _>(
        device,
        |chan| {
            let mut done: Vec<(BdevIo, IoStatus)> = Vec::new();

            let ids: Vec<(u64, i32)> = {
                let mut cq = chan.ring.completion();
                let mut v = Vec::new();
                while let Some(cqe) = cq.next() {
                    v.push((cqe.user_data(), cqe.result()));
                }
                v
            };

            for (id, result) in ids {
                if let Some(entry) = chan.inflight.remove(&id) {
                    let status = if result < 0 {
                        IoStatus::Failed
                    } else {
                        IoStatus::Success
                    };
                    done.push((entry.io, status));
                }
            }

            // retry what did not fit into the ring previously
            while let Some(io) = chan.overflow.pop_front() {
                if let Err(io) = chan.submit_one(io) {
                    chan.overflow.push_front(io);
                    break;
                }
            }

            // a reset drains the channel before completing
            if chan.inflight.is_empty() {
                if let Some(reset) = chan.pending_reset.take() {
                    done.push((reset, IoStatus::Success));
                }
            }

            done
        },
    )
    .unwrap_or_default();

    let did = completed.len() as i32;
    for (io, status) in completed {
        io.complete(status);
    }
    did
}

impl BdevOps for AioDevice {
    fn submit_request(&self, chan: &IoChannel, io: BdevIo) {
        let mut io = Some(io);
        let accepted = chan
            .with_ctx::<AioChannel, _>(|c| {
                let io = io.take().unwrap();
                match io.io_type() {
                    IoType::Reset => {
                        if c.pending_reset.is_some() {
                            io.complete(IoStatus::Failed);
                        } else {
                            c.pending_reset = Some(io);
                        }
                    }
                    _ => {
                        if let Err(io) = c.submit_one(io) {
                            // ring full; park it for the poller
                            c.overflow.push_back(io);
                        }
                    }
                }
            })
            .is_some();

        if !accepted {
            if let Some(io) = io.take() {
                error!("aio channel context gone, failing I/O");
                io.complete(IoStatus::Failed);
            }
        }
    }

    fn io_type_supported(&self, io_type: IoType) -> bool {
        matches!(
            io_type,
            IoType::Read | IoType::Write | IoType::Flush | IoType::Reset
        )
    }

    fn io_device(&self) -> IoDeviceId {
        self.device_id
    }

    fn destruct(&self) {
        if let Some(device) = self.device.lock().take() {
            device.unregister(None);
        }
    }

    fn dump_config(&self) -> Option<serde_json::Value> {
        Some(serde_json::json!({
            "driver": "aio",
        }))
    }
}

impl Drop for AioDevice {
    fn drop(&mut self) {
        if let Some(device) = self.device.lock().take() {
            device.unregister(None);
        }
    }
}
