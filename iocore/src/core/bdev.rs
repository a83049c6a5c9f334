//! The bdev layer: a uniform block device contract dispatched through a
//! capability trait that leaf drivers implement. Registered bdevs form a
//! name-keyed set; duplicates are rejected.

use std::{
    fmt::{Debug, Display, Formatter},
    sync::{
        atomic::{AtomicU32, Ordering},
        Arc,
    },
};

use once_cell::sync::Lazy;
use parking_lot::Mutex;
use uuid::Uuid;

use crate::core::{
    bio::{BdevIo, IoType},
    channel::IoChannel,
    descriptor::Descriptor,
    io_device::{self, IoDeviceId},
    CoreError,
};

/// The function table every leaf driver provides. `submit_request` is called
/// on the thread owning `chan` with an I/O the layer allocated; the driver
/// owns the I/O until it completes it.
pub trait BdevOps: Send + Sync + 'static {
    fn submit_request(&self, chan: &IoChannel, io: BdevIo);
    fn io_type_supported(&self, io_type: IoType) -> bool;
    /// the I/O device whose channels carry this bdev's per-thread state
    fn io_device(&self) -> IoDeviceId;
    /// called when the bdev is unregistered
    fn destruct(&self) {}
    fn dump_config(&self) -> Option<serde_json::Value> {
        None
    }
}

pub(crate) struct BdevInner {
    name: String,
    product_name: String,
    uuid: Uuid,
    block_len: u32,
    num_blocks: u64,
    /// power-of-two shift buffers must be aligned to
    required_alignment: u8,
    write_cache: bool,
    ops: Box<dyn BdevOps>,
    open_descriptors: AtomicU32,
}

/// Newtype structure that represents a block device. Looking up or opening
/// a bdev yields a valid handle; operations on the handle are safe for the
/// lifetime of the scope.
#[derive(Clone)]
pub struct Bdev(pub(crate) Arc<BdevInner>);

static BDEVS: Lazy<Mutex<Vec<Bdev>>> = Lazy::new(|| Mutex::new(Vec::new()));

impl Bdev {
    /// Assemble a new bdev; it only becomes visible once registered.
    pub fn new(
        name: String,
        product_name: String,
        block_len: u32,
        num_blocks: u64,
        required_alignment: u8,
        write_cache: bool,
        ops: Box<dyn BdevOps>,
    ) -> Self {
        assert!(block_len > 0, "block length can not be zero");
        Bdev(Arc::new(BdevInner {
            name,
            product_name,
            uuid: Uuid::new_v4(),
            block_len,
            num_blocks,
            required_alignment,
            write_cache,
            ops,
            open_descriptors: AtomicU32::new(0),
        }))
    }

    /// Add the bdev to the name-keyed set; duplicate names are rejected.
    pub fn register(self) -> Result<Bdev, CoreError> {
        let mut bdevs = BDEVS.lock();
        if bdevs.iter().any(|b| b.name() == self.name()) {
            return Err(CoreError::BdevExists {
                name: self.name().to_string(),
            });
        }
        info!("registered bdev {} ({})", self.name(), self.product_name());
        bdevs.push(self.clone());
        Ok(self)
    }

    /// Remove the bdev from the set and let the driver tear down. Fails
    /// while descriptors are still open.
    pub fn unregister(name: &str) -> Result<(), CoreError> {
        let bdev = {
            let mut bdevs = BDEVS.lock();
            let pos = bdevs.iter().position(|b| b.name() == name).ok_or(
                CoreError::BdevNotFound {
                    name: name.to_string(),
                },
            )?;
            let bdev = bdevs[pos].clone();
            if bdev.0.open_descriptors.load(Ordering::SeqCst) > 0 {
                return Err(CoreError::BdevBusy {
                    name: name.to_string(),
                });
            }
            bdevs.remove(pos);
            bdev
        };
        bdev.0.ops.destruct();
        info!("unregistered bdev {}", name);
        Ok(())
    }

    pub fn lookup_by_name(name: &str) -> Option<Bdev> {
        BDEVS.lock().iter().find(|b| b.name() == name).cloned()
    }

    /// all registered bdevs
    pub fn bdevs() -> Vec<Bdev> {
        BDEVS.lock().clone()
    }

    /// open a bdev by its name in read_write mode.
    pub fn open_by_name(
        name: &str,
        read_write: bool,
    ) -> Result<Descriptor, CoreError> {
        match Self::lookup_by_name(name) {
            Some(bdev) => bdev.open(read_write),
            None => Err(CoreError::BdevNotFound {
                name: name.to_string(),
            }),
        }
    }

    /// open the current bdev, the bdev can be opened multiple times
    /// resulting in a new descriptor for each call.
    pub fn open(&self, read_write: bool) -> Result<Descriptor, CoreError> {
        self.0.open_descriptors.fetch_add(1, Ordering::SeqCst);
        Ok(Descriptor::new(self.clone(), read_write))
    }

    pub(crate) fn descriptor_closed(&self) {
        self.0.open_descriptors.fetch_sub(1, Ordering::SeqCst);
    }

    /// get a channel suitable for submitting I/O to this bdev from the
    /// current thread
    pub fn get_io_channel(&self) -> Option<IoChannel> {
        io_device::get_io_channel(self.0.ops.io_device())
    }

    pub(crate) fn ops(&self) -> &dyn BdevOps {
        self.0.ops.as_ref()
    }

    pub fn name(&self) -> &str {
        &self.0.name
    }

    pub fn product_name(&self) -> &str {
        &self.0.product_name
    }

    pub fn uuid_as_string(&self) -> String {
        self.0.uuid.to_string()
    }

    pub fn block_len(&self) -> u32 {
        self.0.block_len
    }

    pub fn num_blocks(&self) -> u64 {
        self.0.num_blocks
    }

    pub fn size_in_bytes(&self) -> u64 {
        self.0.num_blocks * self.0.block_len as u64
    }

    /// power-of-two shift I/O buffers must be aligned to
    pub fn alignment(&self) -> u8 {
        self.0.required_alignment
    }

    pub fn write_cache(&self) -> bool {
        self.0.write_cache
    }

    pub fn io_type_supported(&self, io_type: IoType) -> bool {
        self.0.ops.io_type_supported(io_type)
    }

    pub fn dump_config(&self) -> Option<serde_json::Value> {
        self.0.ops.dump_config()
    }
}

impl Debug for Bdev {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "name: {}, driver: {}, block_len: {}, num_blocks: {}",
            self.name(),
            self.product_name(),
            self.block_len(),
            self.num_blocks(),
        )
    }
}

impl Display for Bdev {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}
