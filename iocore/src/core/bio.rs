//! Bdev I/O descriptors. An I/O is allocated by the bdev layer out of a
//! fixed pool before it reaches the driver, is owned by the driver until it
//! completes it, and is released after the user callback ran. Completion
//! happens exactly once, on the thread the I/O was submitted from.

use once_cell::sync::OnceCell;

use crate::core::{
    bdev::Bdev,
    mempool::{MemoryPool, PoolItem},
    mthread::Mthread,
    CoreError,
    DmaBuf,
};

/// default number of in-flight bdev I/O contexts
pub const BDEV_IO_POOL_SIZE: u64 = 65535;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoType {
    Read,
    Write,
    Unmap,
    WriteZeroes,
    Flush,
    Reset,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoStatus {
    Success,
    Failed,
    NoMemory,
    Aborted,
}

impl IoStatus {
    pub fn is_success(&self) -> bool {
        *self == IoStatus::Success
    }
}

pub type IoCompletionCb = Box<dyn FnOnce(IoStatus, Vec<DmaBuf>) + Send>;

pub(crate) struct Bio {
    bdev: Bdev,
    io_type: IoType,
    bufs: Vec<DmaBuf>,
    offset: u64,
    len: u64,
    thread: Mthread,
    cb: Option<IoCompletionCb>,
}

impl Drop for Bio {
    fn drop(&mut self) {
        // safety net: an I/O dropped by a driver without a completion still
        // owes its caller exactly one callback
        if let Some(cb) = self.cb.take() {
            warn!(
                "I/O for {} dropped without completion, failing it",
                self.bdev.name()
            );
            cb(IoStatus::Failed, std::mem::take(&mut self.bufs));
        }
    }
}

static BDEV_IO_POOL: OnceCell<MemoryPool<Bio>> = OnceCell::new();

/// size the I/O context pool; called once during environment setup
pub(crate) fn bdev_io_pool_init(size: u64) {
    BDEV_IO_POOL.get_or_init(|| {
        MemoryPool::create("bdev_io_ctx", size)
            .expect("failed to create bdev I/O context pool")
    });
}

fn pool() -> &'static MemoryPool<Bio> {
    BDEV_IO_POOL.get_or_init(|| {
        MemoryPool::create("bdev_io_ctx", BDEV_IO_POOL_SIZE)
            .expect("failed to create bdev I/O context pool")
    })
}

/// A bdev I/O in flight. Leaf drivers receive it from `submit_request` and
/// must eventually pass it to [`BdevIo::complete`].
pub struct BdevIo(PoolItem<Bio>);

impl BdevIo {
    /// Allocate an I/O out of the shared pool; `None` is the soft
    /// back-pressure signal surfaced as `-ENOMEM` by the submission paths.
    pub(crate) fn alloc(
        bdev: Bdev,
        io_type: IoType,
        bufs: Vec<DmaBuf>,
        offset: u64,
        len: u64,
        thread: Mthread,
        cb: IoCompletionCb,
    ) -> Option<BdevIo> {
        pool()
            .get(Bio {
                bdev,
                io_type,
                bufs,
                offset,
                len,
                thread,
                cb: Some(cb),
            })
            .map(BdevIo)
    }

    pub fn bdev(&self) -> &Bdev {
        &self.0.bdev
    }

    pub fn io_type(&self) -> IoType {
        self.0.io_type
    }

    /// byte offset into the device
    pub fn offset(&self) -> u64 {
        self.0.offset
    }

    /// length of the operation in bytes
    pub fn num_bytes(&self) -> u64 {
        self.0.len
    }

    pub fn offset_blocks(&self) -> u64 {
        self.0.offset / self.0.bdev.block_len() as u64
    }

    pub fn num_blocks(&self) -> u64 {
        self.0.len / self.0.bdev.block_len() as u64
    }

    /// the thread this I/O was submitted from; its completion runs there
    pub fn thread(&self) -> &Mthread {
        &self.0.thread
    }

    pub fn bufs(&self) -> &[DmaBuf] {
        &self.0.bufs
    }

    pub fn bufs_mut(&mut self) -> &mut [DmaBuf] {
        &mut self.0.bufs
    }

    /// Detach the data buffer so it can travel through a driver request;
    /// pair with [`BdevIo::put_buf`] before completing.
    pub fn take_buf(&mut self) -> Option<DmaBuf> {
        self.0.bufs.pop()
    }

    pub fn put_buf(&mut self, buf: DmaBuf) {
        self.0.bufs.push(buf);
    }

    /// Complete the I/O. Must be called on the submitting thread; consumes
    /// the I/O so a second completion cannot be expressed.
    pub fn complete(self, status: IoStatus) {
        let mut bio = self.0.into_inner();
        if let Some(current) = Mthread::current() {
            assert!(
                current == bio.thread,
                "I/O for {} completed on foreign thread",
                bio.bdev.name()
            );
        }
        let cb = bio.cb.take().expect("bdev I/O completed twice");
        cb(status, std::mem::take(&mut bio.bufs));
    }
}

impl std::fmt::Debug for BdevIo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BdevIo")
            .field("bdev", &self.0.bdev.name())
            .field("io_type", &self.0.io_type)
            .field("offset", &self.0.offset)
            .field("len", &self.0.len)
            .finish()
    }
}

/// number of free I/O contexts, used by tests exercising back-pressure
pub fn bdev_io_pool_available() -> u64 {
    pool().available()
}

/// report an allocation failure as the soft no-memory condition
pub(crate) fn enomem() -> CoreError {
    CoreError::NoMemory {
        source: nix::errno::Errno::ENOMEM,
    }
}
