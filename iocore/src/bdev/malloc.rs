//! Hugepage backed ram disk. The backing store is shared between all
//! channels; each channel queues its I/O locally and a per-channel poller
//! executes and completes it on the owning thread.

use std::{
    collections::{HashMap, VecDeque},
    convert::TryFrom,
    sync::Arc,
};

use async_trait::async_trait;
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
        DmaBuf,
        IoChannel,
        IoDevice,
        IoStatus,
        IoType,
        Poller,
    },
};

#[derive(Debug)]
pub(super) struct Malloc {
    name: String,
    size_mb: u64,
    blk_size: u32,
}

/// Convert a URI to a Malloc "object"
impl TryFrom<&Url> for Malloc {
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

        let size_mb: u64 = match parameters.remove("size_mb") {
            Some(value) => {
                value.parse().context(uri::IntParamParseFailed {
                    uri: url.to_string(),
                    parameter: String::from("size_mb"),
                })?
            }
            None => 64,
        };

        if let Some(keys) = uri::keys(parameters) {
            warn!("ignored parameters: {}", keys);
        }

        Ok(Malloc {
            name: segments[0].to_string(),
            size_mb,
            blk_size,
        })
    }
}

impl GetName for Malloc {
    fn get_name(&self) -> String {
        self.name.clone()
    }
}

#[async_trait(? Send)]
impl CreateDestroy for Malloc {
    type Error = BdevError;

    async fn create(&self) -> Result<String, Self::Error> {
        if Bdev::lookup_by_name(&self.name).is_some() {
            return Err(BdevError::BdevExists {
                name: self.get_name(),
            });
        }

        let size = self.size_mb * 1024 * 1024;
        let disk = DmaBuf::new(size as usize, 12).map_err(|_| {
            BdevError::CreateBdev {
                source: crate::core::CoreError::DmaAllocationFailed {
                    size,
                },
                name: self.get_name(),
            }
        })?;
        let disk = Arc::new(Mutex::new(disk));

        let disk_for_channels = Arc::clone(&disk);
        let device = IoDevice::register::<MallocChannel>(
            &self.name,
            move |id| {
                Ok(MallocChannel::new(id, Arc::clone(&disk_for_channels)))
            },
            |_, chan| chan.drain(),
        );
        let device_id = device.id();

        let ops = MallocDevice {
            device_id,
            device: Mutex::new(Some(device)),
            disk,
        };

        Bdev::new(
            self.name.clone(),
            "Malloc disk".into(),
            self.blk_size,
            size / self.blk_size as u64,
            9,
            false,
            Box::new(ops),
        )
        .register()
        .map(|bdev| bdev.name().to_string())
        .map_err(|source| BdevError::CreateBdev {
            source,
            name: self.get_name(),
        })
    }

    async fn destroy(self: Box<Self>) -> Result<(), Self::Error> {
        if Bdev::lookup_by_name(&self.name).is_none() {
            return Err(BdevError::BdevNotFound {
                name: self.get_name(),
            });
        }
        Bdev::unregister(&self.name).map_err(|source| {
            BdevError::DestroyBdev {
                source,
                name: self.get_name(),
            }
        })
    }
}

struct MallocDevice {
    device_id: IoDeviceId,
    device: Mutex<Option<IoDevice>>,
    disk: Arc<Mutex<DmaBuf>>,
}

pub(crate) struct MallocChannel {
    disk: Arc<Mutex<DmaBuf>>,
    queue: VecDeque<BdevIo>,
    reset: Option<BdevIo>,
    _poller: Poller,
}

impl MallocChannel {
    fn new(device: IoDeviceId, disk: Arc<Mutex<DmaBuf>>) -> Self {
        let poller = crate::core::poller::Builder::new()
            .with_name("malloc_channel_poller")
            .with_poll_fn(move || poll_channel(device))
            .build();

        Self {
            disk,
            queue: VecDeque::new(),
            reset: None,
            _poller: poller,
        }
    }

    /// abort whatever is still queued; runs when the channel is destroyed
    fn drain(mut self) {
        for io in self.queue.drain(..) {
            io.complete(IoStatus::Aborted);
        }
        if let Some(reset) = self.reset.take() {
            reset.complete(IoStatus::Aborted);
        }
    }
}

/// take the pending batch out of the channel and complete it; runs on the
/// channel's thread. Completions happen with the channel context attached
/// so callbacks are free to resubmit.
fn poll_channel(device: IoDeviceId) -> i32 {
    let work = io_device::with_channel_ctx::<MallocChannel, _>(
        device,
        |chan| {
            let batch: Vec<BdevIo> = chan.queue.drain(..).collect();
            (batch, chan.reset.take(), Arc::clone(&chan.disk))
        },
    );

    let (batch, reset, disk) = match work {
        Some(w) => w,
        None => return 0,
    };

    let mut did = 0;

    if let Some(reset) = reset {
        // a reset races with queued I/O which completes aborted
        for io in batch {
            io.complete(IoStatus::Aborted);
            did += 1;
        }
        reset.complete(IoStatus::Success);
        return did + 1;
    }

    for mut io in batch {
        let status = execute(&mut disk.lock(), &mut io);
        io.complete(status);
        did += 1;
    }

    did
}

fn execute(disk: &mut DmaBuf, io: &mut BdevIo) -> IoStatus {
    let off = io.offset() as usize;
    let len = io.num_bytes() as usize;

    match io.io_type() {
        IoType::Read => {
            let src = &disk.as_slice()[off .. off + len];
            io.bufs_mut()[0].as_mut_slice()[.. len].copy_from_slice(src);
            IoStatus::Success
        }
        IoType::Write => {
            let src = io.bufs()[0].as_slice()[.. len].to_vec();
            disk.as_mut_slice()[off .. off + len].copy_from_slice(&src);
            IoStatus::Success
        }
        IoType::Unmap | IoType::WriteZeroes => {
            for b in disk.as_mut_slice()[off .. off + len].iter_mut() {
                *b = 0;
            }
            IoStatus::Success
        }
        IoType::Flush | IoType::Reset => IoStatus::Success,
    }
}

impl BdevOps for MallocDevice {
    fn submit_request(&self, chan: &IoChannel, io: BdevIo) {
        let mut io = Some(io);
        let queued = chan
            .with_ctx::<MallocChannel, _>(|c| match io.as_ref() {
                Some(b) if b.io_type() == IoType::Reset => {
                    c.reset = Some(io.take().unwrap())
                }
                _ => c.queue.push_back(io.take().unwrap()),
            })
            .is_some();

        if !queued {
            if let Some(io) = io.take() {
                error!("malloc channel context gone, failing I/O");
                io.complete(IoStatus::Failed);
            }
        }
    }

    fn io_type_supported(&self, io_type: IoType) -> bool {
        matches!(
            io_type,
            IoType::Read
                | IoType::Write
                | IoType::Unmap
                | IoType::WriteZeroes
                | IoType::Flush
                | IoType::Reset
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
            "driver": "malloc",
            "size": self.disk.lock().len(),
        }))
    }
}

impl Drop for MallocDevice {
    fn drop(&mut self) {
        if let Some(device) = self.device.lock().take() {
            device.unregister(None);
        }
    }
}
