//! Null device: reads complete with zeroed buffers, writes are discarded.
//! Useful to measure the overhead of the I/O stack itself.

use std::{
    collections::{HashMap, VecDeque},
    convert::TryFrom,
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
        IoChannel,
        IoDevice,
        IoStatus,
        IoType,
        Poller,
    },
};

#[derive(Debug)]
pub(super) struct Null {
    name: String,
    size_mb: u64,
    blk_size: u32,
}

impl TryFrom<&Url> for Null {
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

        Ok(Null {
            name: segments[0].to_string(),
            size_mb,
            blk_size,
        })
    }
}

impl GetName for Null {
    fn get_name(&self) -> String {
        self.name.clone()
    }
}

#[async_trait(? Send)]
impl CreateDestroy for Null {
    type Error = BdevError;

    async fn create(&self) -> Result<String, Self::Error> {
        if Bdev::lookup_by_name(&self.name).is_some() {
            return Err(BdevError::BdevExists {
                name: self.get_name(),
            });
        }

        let device = IoDevice::register::<NullChannel>(
            &self.name,
            |id| Ok(NullChannel::new(id)),
            |_, chan| chan.drain(),
        );
        let device_id = device.id();

        Bdev::new(
            self.name.clone(),
            "Null disk".into(),
            self.blk_size,
            self.size_mb * 1024 * 1024 / self.blk_size as u64,
            9,
            false,
            Box::new(NullDevice {
                device_id,
                device: Mutex::new(Some(device)),
            }),
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

struct NullDevice {
    device_id: IoDeviceId,
    device: Mutex<Option<IoDevice>>,
}

pub(crate) struct NullChannel {
    queue: VecDeque<BdevIo>,
    _poller: Poller,
}

impl NullChannel {
    fn new(device: IoDeviceId) -> Self {
        let poller = crate::core::poller::Builder::new()
            .with_name("null_channel_poller")
            .with_poll_fn(move || poll_channel(device))
            .build();
        Self {
            queue: VecDeque::new(),
            _poller: poller,
        }
    }

    fn drain(mut self) {
        for io in self.queue.drain(..) {
            io.complete(IoStatus::Aborted);
        }
    }
}

fn poll_channel(device: IoDeviceId) -> i32 {
    let batch = io_device::with_channel_ctx::<NullChannel, _>(device, |c| {
        c.queue.drain(..).collect::<Vec<_>>()
    })
    .unwrap_or_default();

    let mut did = 0;
    for mut io in batch {
        if io.io_type() == IoType::Read {
            let len = io.num_bytes() as usize;
            for buf in io.bufs_mut() {
                let n = buf.len().min(len);
                buf.as_mut_slice()[.. n].iter_mut().for_each(|b| *b = 0);
            }
        }
        io.complete(IoStatus::Success);
        did += 1;
    }
    did
}

impl BdevOps for NullDevice {
    fn submit_request(&self, chan: &IoChannel, io: BdevIo) {
        let mut io = Some(io);
        let queued = chan
            .with_ctx::<NullChannel, _>(|c| {
                c.queue.push_back(io.take().unwrap())
            })
            .is_some();
        if !queued {
            if let Some(io) = io.take() {
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
}

impl Drop for NullDevice {
    fn drop(&mut self) {
        if let Some(device) = self.device.lock().take() {
            device.unregister(None);
        }
    }
}
