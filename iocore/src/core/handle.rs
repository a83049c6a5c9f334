//! A bdev handle bundles a descriptor with a channel on the calling thread
//! and exposes the submission paths as futures, bridging the callback
//! contract through oneshot channels. Intended for management and test
//! paths; the hot path talks to the descriptor directly.

use futures::channel::oneshot;

use crate::core::{
    bdev::Bdev,
    bio::IoStatus,
    channel::IoChannel,
    descriptor::Descriptor,
    CoreError,
    DmaBuf,
};

pub struct BdevHandle {
    desc: Descriptor,
    channel: IoChannel,
}

impl BdevHandle {
    /// open a bdev by name and bundle a channel on the current thread
    pub fn open(
        name: &str,
        read_write: bool,
    ) -> Result<BdevHandle, CoreError> {
        let desc = Bdev::open_by_name(name, read_write)?;
        let channel =
            desc.get_io_channel().ok_or_else(|| CoreError::GetIoChannel {
                name: name.to_string(),
            })?;
        Ok(BdevHandle {
            desc,
            channel,
        })
    }

    pub fn get_bdev(&self) -> Bdev {
        self.desc.get_bdev()
    }

    /// allocate a buffer suitable for I/O against this bdev
    pub fn dma_malloc(&self, size: u64) -> Result<DmaBuf, CoreError> {
        DmaBuf::new(size as usize, self.get_bdev().alignment()).map_err(|_| {
            CoreError::DmaAllocationFailed {
                size,
            }
        })
    }

    /// read `buf.len()` bytes at `offset`; the buffer travels through the
    /// I/O and is handed back on completion
    pub async fn read_at(
        &self,
        offset: u64,
        buf: DmaBuf,
    ) -> Result<DmaBuf, CoreError> {
        let len = buf.len() as u64;
        let (s, r) = oneshot::channel::<(IoStatus, Vec<DmaBuf>)>();

        self.desc.read(&self.channel, buf, offset, len, move |status, bufs| {
            // the receiver may have given up; nothing to do then
            let _ = s.send((status, bufs));
        })?;

        let (status, mut bufs) =
            r.await.expect("read completion channel dropped");
        match status {
            IoStatus::Success => Ok(bufs.pop().unwrap()),
            _ => Err(CoreError::ReadFailed {
                status,
                offset,
                len,
            }),
        }
    }

    /// write the whole buffer at `offset`
    pub async fn write_at(
        &self,
        offset: u64,
        buf: DmaBuf,
    ) -> Result<DmaBuf, CoreError> {
        let len = buf.len() as u64;
        let (s, r) = oneshot::channel::<(IoStatus, Vec<DmaBuf>)>();

        self.desc.write(
            &self.channel,
            buf,
            offset,
            len,
            move |status, bufs| {
                let _ = s.send((status, bufs));
            },
        )?;

        let (status, mut bufs) =
            r.await.expect("write completion channel dropped");
        match status {
            IoStatus::Success => Ok(bufs.pop().unwrap()),
            _ => Err(CoreError::WriteFailed {
                status,
                offset,
                len,
            }),
        }
    }

    pub async fn unmap(&self, offset: u64, len: u64) -> Result<(), CoreError> {
        let (s, r) = oneshot::channel::<IoStatus>();
        self.desc.unmap(&self.channel, offset, len, move |status, _| {
            let _ = s.send(status);
        })?;
        match r.await.expect("unmap completion channel dropped") {
            IoStatus::Success => Ok(()),
            status => Err(CoreError::WriteFailed {
                status,
                offset,
                len,
            }),
        }
    }

    pub async fn flush(&self) -> Result<(), CoreError> {
        let (s, r) = oneshot::channel::<IoStatus>();
        self.desc.flush(&self.channel, move |status, _| {
            let _ = s.send(status);
        })?;
        match r.await.expect("flush completion channel dropped") {
            IoStatus::Success => Ok(()),
            _ => Err(CoreError::FlushFailed {}),
        }
    }

    pub async fn reset(&self) -> Result<(), CoreError> {
        let (s, r) = oneshot::channel::<IoStatus>();
        self.desc.reset(&self.channel, move |status, _| {
            let _ = s.send(status);
        })?;
        match r.await.expect("reset completion channel dropped") {
            IoStatus::Success => Ok(()),
            _ => Err(CoreError::ResetFailed {}),
        }
    }
}

impl std::fmt::Debug for BdevHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "handle for {:?}", self.desc)
    }
}
