//! Descriptors reference an open bdev with a usage class and carry the
//! submission entry points. Offsets and lengths are validated here, before
//! an I/O context is allocated; validation failures are returned
//! synchronously and never reach the driver.

use nix::errno::Errno;

use crate::core::{
    bdev::Bdev,
    bio::{BdevIo, IoStatus, IoType},
    channel::IoChannel,
    bio,
    CoreError,
    DmaBuf,
};

pub struct Descriptor {
    bdev: Bdev,
    read_write: bool,
}

impl Descriptor {
    pub(crate) fn new(bdev: Bdev, read_write: bool) -> Self {
        Self {
            bdev,
            read_write,
        }
    }

    pub fn get_bdev(&self) -> Bdev {
        self.bdev.clone()
    }

    /// get an I/O channel for the bdev this descriptor references, on the
    /// calling thread
    pub fn get_io_channel(&self) -> Option<IoChannel> {
        self.bdev.get_io_channel()
    }

    fn check_io(
        &self,
        chan: &IoChannel,
        io_type: IoType,
        buf: Option<&DmaBuf>,
        offset: u64,
        len: u64,
    ) -> Result<(), CoreError> {
        let block_len = self.bdev.block_len() as u64;

        if len == 0 || len % block_len != 0 {
            return Err(CoreError::InvalidLength {
                len,
            });
        }
        if offset % block_len != 0 {
            return Err(CoreError::InvalidOffset {
                offset,
            });
        }
        if offset + len > self.bdev.size_in_bytes() {
            return Err(CoreError::InvalidOffset {
                offset,
            });
        }
        if let Some(buf) = buf {
            if (buf.len() as u64) < len {
                return Err(CoreError::InvalidLength {
                    len,
                });
            }
            let align = 1u64 << self.bdev.alignment();
            if buf.as_ptr() as u64 % align != 0 {
                return Err(CoreError::UnalignedBuffer {
                    alignment: align,
                });
            }
        }
        if matches!(
            io_type,
            IoType::Write | IoType::Unmap | IoType::WriteZeroes
        ) && !self.read_write
        {
            return Err(CoreError::ReadOnlyDescriptor {
                name: self.bdev.name().to_string(),
            });
        }
        if !self.bdev.io_type_supported(io_type) {
            return Err(CoreError::NotSupported {
                source: Errno::ENOTSUP,
            });
        }
        if chan.device() != self.bdev.ops().io_device() {
            return Err(CoreError::GetIoChannel {
                name: self.bdev.name().to_string(),
            });
        }
        Ok(())
    }

    fn submit(
        &self,
        chan: &IoChannel,
        io_type: IoType,
        bufs: Vec<DmaBuf>,
        offset: u64,
        len: u64,
        cb: impl FnOnce(IoStatus, Vec<DmaBuf>) + Send + 'static,
    ) -> Result<(), CoreError> {
        let io = BdevIo::alloc(
            self.bdev.clone(),
            io_type,
            bufs,
            offset,
            len,
            chan.thread().clone(),
            Box::new(cb),
        )
        .ok_or_else(bio::enomem)?;

        self.bdev.ops().submit_request(chan, io);
        Ok(())
    }

    /// Read `len` bytes at `offset` into `buf`. On successful submission the
    /// callback runs exactly once on the submitting thread and hands the
    /// buffer back.
    pub fn read(
        &self,
        chan: &IoChannel,
        buf: DmaBuf,
        offset: u64,
        len: u64,
        cb: impl FnOnce(IoStatus, Vec<DmaBuf>) + Send + 'static,
    ) -> Result<(), CoreError> {
        self.check_io(chan, IoType::Read, Some(&buf), offset, len)?;
        self.submit(chan, IoType::Read, vec![buf], offset, len, cb)
    }

    /// Write `len` bytes from `buf` at `offset`.
    pub fn write(
        &self,
        chan: &IoChannel,
        buf: DmaBuf,
        offset: u64,
        len: u64,
        cb: impl FnOnce(IoStatus, Vec<DmaBuf>) + Send + 'static,
    ) -> Result<(), CoreError> {
        self.check_io(chan, IoType::Write, Some(&buf), offset, len)?;
        self.submit(chan, IoType::Write, vec![buf], offset, len, cb)
    }

    /// Deallocate the given range.
    pub fn unmap(
        &self,
        chan: &IoChannel,
        offset: u64,
        len: u64,
        cb: impl FnOnce(IoStatus, Vec<DmaBuf>) + Send + 'static,
    ) -> Result<(), CoreError> {
        self.check_io(chan, IoType::Unmap, None, offset, len)?;
        self.submit(chan, IoType::Unmap, Vec::new(), offset, len, cb)
    }

    /// Zero the given range without transferring data.
    pub fn write_zeroes(
        &self,
        chan: &IoChannel,
        offset: u64,
        len: u64,
        cb: impl FnOnce(IoStatus, Vec<DmaBuf>) + Send + 'static,
    ) -> Result<(), CoreError> {
        self.check_io(chan, IoType::WriteZeroes, None, offset, len)?;
        self.submit(chan, IoType::WriteZeroes, Vec::new(), offset, len, cb)
    }

    /// Flush the write cache of the device.
    pub fn flush(
        &self,
        chan: &IoChannel,
        cb: impl FnOnce(IoStatus, Vec<DmaBuf>) + Send + 'static,
    ) -> Result<(), CoreError> {
        if !self.bdev.io_type_supported(IoType::Flush) {
            return Err(CoreError::NotSupported {
                source: Errno::ENOTSUP,
            });
        }
        self.submit(
            chan,
            IoType::Flush,
            Vec::new(),
            0,
            self.bdev.size_in_bytes(),
            cb,
        )
    }

    /// Quiesce the backing device. A reset races with in-flight I/O which
    /// may complete with `Aborted` status.
    pub fn reset(
        &self,
        chan: &IoChannel,
        cb: impl FnOnce(IoStatus, Vec<DmaBuf>) + Send + 'static,
    ) -> Result<(), CoreError> {
        if !self.bdev.io_type_supported(IoType::Reset) {
            return Err(CoreError::NotSupported {
                source: Errno::ENOTSUP,
            });
        }
        self.submit(chan, IoType::Reset, Vec::new(), 0, 0, cb)
    }
}

impl Drop for Descriptor {
    fn drop(&mut self) {
        self.bdev.descriptor_closed();
    }
}

impl std::fmt::Debug for Descriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "descriptor for {} (rw: {})",
            self.bdev.name(),
            self.read_write
        )
    }
}
