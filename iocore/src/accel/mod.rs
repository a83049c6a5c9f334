//! Acceleration engine: batched copy/fill/compare/crc offload with
//! per-channel descriptor pools and a FIFO completion ring drained by a
//! per-channel poller. Only the software execution path is provided;
//! hardware portals would slot in behind the same descriptor model.

use std::collections::VecDeque;

use crc::crc32;
use nix::errno::Errno;
use once_cell::sync::Lazy;
use parking_lot::Mutex;

use crate::core::{
    io_device::{self, IoDeviceId},
    CoreError,
    DmaBuf,
    IoChannel,
    IoDevice,
    MemoryPool,
    PoolItem,
    Poller,
};

/// descriptors per channel; enqueueing past this is back-pressure
const CHANNEL_POOL_SIZE: u64 = 256;

static CRC32C_TABLE: Lazy<[u32; 256]> =
    Lazy::new(|| crc32::make_table(crc32::CASTAGNOLI));

/// One offload operation. Buffers travel with the descriptor and are
/// handed back through the completion.
pub enum AccelOp {
    Copy {
        src: DmaBuf,
        dst: DmaBuf,
        len: usize,
    },
    Dualcast {
        src: DmaBuf,
        dst1: DmaBuf,
        dst2: DmaBuf,
        len: usize,
    },
    Compare {
        src1: DmaBuf,
        src2: DmaBuf,
        len: usize,
    },
    Fill {
        dst: DmaBuf,
        val: u8,
        len: usize,
    },
    Crc32c {
        src: DmaBuf,
        seed: u32,
        len: usize,
    },
    CopyCrc32c {
        src: DmaBuf,
        dst: DmaBuf,
        seed: u32,
        len: usize,
    },
}

/// completion of a single operation: 0 or a negated errno, the crc result
/// for the checksum flavours, and the buffers given back
pub struct AccelResult {
    pub status: i32,
    pub crc: Option<u32>,
    pub bufs: Vec<DmaBuf>,
}

pub type AccelCb = Box<dyn FnOnce(AccelResult) + Send>;
pub type BatchCb = Box<dyn FnOnce(i32) + Send>;

struct AccelTask {
    op: AccelOp,
    cb: Option<AccelCb>,
}

enum RingEntry {
    Single(PoolItem<AccelTask>),
    Batch {
        tasks: Vec<PoolItem<AccelTask>>,
        batch_cb: Option<BatchCb>,
    },
}

pub struct AccelChannel {
    pool: MemoryPool<AccelTask>,
    ring: VecDeque<RingEntry>,
    _poller: Poller,
}

impl AccelChannel {
    fn new(device: IoDeviceId) -> Self {
        let pool = MemoryPool::create("accel_task", CHANNEL_POOL_SIZE)
            .expect("failed to create accel task pool");
        let poller = crate::core::poller::Builder::new()
            .with_name("accel_channel_poller")
            .with_poll_fn(move || poll_channel(device))
            .build();
        Self {
            pool,
            ring: VecDeque::new(),
            _poller: poller,
        }
    }

    fn drain(mut self) {
        while let Some(entry) = self.ring.pop_front() {
            complete_entry(entry, -(Errno::ECANCELED as i32));
        }
    }

    fn alloc(
        &self,
        op: AccelOp,
        cb: AccelCb,
    ) -> Result<PoolItem<AccelTask>, CoreError> {
        self.pool
            .get(AccelTask {
                op,
                cb: Some(cb),
            })
            .ok_or(CoreError::NoMemory {
                source: Errno::ENOMEM,
            })
    }
}

/// A batch under construction; submitted as one unit, with per-operation
/// completion and one batch completion at the end.
pub struct AccelBatch {
    ops: Vec<(AccelOp, AccelCb)>,
}

impl Default for AccelBatch {
    fn default() -> Self {
        Self::new()
    }
}

impl AccelBatch {
    pub fn new() -> Self {
        Self {
            ops: Vec::new(),
        }
    }

    pub fn add(&mut self, op: AccelOp, cb: AccelCb) {
        self.ops.push((op, cb));
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }
}

/// The engine itself is stateless beyond its channel registration.
pub struct AccelEngine {
    device: Mutex<Option<IoDevice>>,
    device_id: IoDeviceId,
}

impl AccelEngine {
    /// register the engine; channels come from the generic registry
    pub fn new(name: &str) -> Self {
        let device = IoDevice::register::<AccelChannel>(
            name,
            |id| Ok(AccelChannel::new(id)),
            |_, chan| chan.drain(),
        );
        let device_id = device.id();
        Self {
            device: Mutex::new(Some(device)),
            device_id,
        }
    }

    pub fn get_channel(&self) -> Option<IoChannel> {
        io_device::get_io_channel(self.device_id)
    }

    pub fn unregister(&self) {
        if let Some(device) = self.device.lock().take() {
            device.unregister(None);
        }
    }
}

impl Drop for AccelEngine {
    fn drop(&mut self) {
        self.unregister();
    }
}

fn enqueue(
    chan: &IoChannel,
    op: AccelOp,
    cb: AccelCb,
) -> Result<(), CoreError> {
    let mut op_cb = Some((op, cb));
    chan.with_ctx::<AccelChannel, _>(|c| {
        let (op, cb) = op_cb.take().unwrap();
        let task = c.alloc(op, cb)?;
        c.ring.push_back(RingEntry::Single(task));
        Ok(())
    })
    .unwrap_or(Err(CoreError::GetIoChannel {
        name: "accel".to_string(),
    }))
}

pub fn submit_copy(
    chan: &IoChannel,
    src: DmaBuf,
    dst: DmaBuf,
    len: usize,
    cb: AccelCb,
) -> Result<(), CoreError> {
    enqueue(
        chan,
        AccelOp::Copy {
            src,
            dst,
            len,
        },
        cb,
    )
}

pub fn submit_dualcast(
    chan: &IoChannel,
    src: DmaBuf,
    dst1: DmaBuf,
    dst2: DmaBuf,
    len: usize,
    cb: AccelCb,
) -> Result<(), CoreError> {
    enqueue(
        chan,
        AccelOp::Dualcast {
            src,
            dst1,
            dst2,
            len,
        },
        cb,
    )
}

pub fn submit_compare(
    chan: &IoChannel,
    src1: DmaBuf,
    src2: DmaBuf,
    len: usize,
    cb: AccelCb,
) -> Result<(), CoreError> {
    enqueue(
        chan,
        AccelOp::Compare {
            src1,
            src2,
            len,
        },
        cb,
    )
}

pub fn submit_fill(
    chan: &IoChannel,
    dst: DmaBuf,
    val: u8,
    len: usize,
    cb: AccelCb,
) -> Result<(), CoreError> {
    enqueue(
        chan,
        AccelOp::Fill {
            dst,
            val,
            len,
        },
        cb,
    )
}

pub fn submit_crc32c(
    chan: &IoChannel,
    src: DmaBuf,
    seed: u32,
    len: usize,
    cb: AccelCb,
) -> Result<(), CoreError> {
    enqueue(
        chan,
        AccelOp::Crc32c {
            src,
            seed,
            len,
        },
        cb,
    )
}

pub fn submit_copy_crc32c(
    chan: &IoChannel,
    src: DmaBuf,
    dst: DmaBuf,
    seed: u32,
    len: usize,
    cb: AccelCb,
) -> Result<(), CoreError> {
    enqueue(
        chan,
        AccelOp::CopyCrc32c {
            src,
            dst,
            seed,
            len,
        },
        cb,
    )
}

/// Submit a batch. Each operation completes individually; `batch_cb` runs
/// after the last one with 0 or the first per-operation error.
pub fn submit_batch(
    chan: &IoChannel,
    batch: AccelBatch,
    batch_cb: BatchCb,
) -> Result<(), CoreError> {
    let mut moved = Some((batch, batch_cb));
    chan.with_ctx::<AccelChannel, _>(|c| {
        let (batch, batch_cb) = moved.take().unwrap();
        if batch.ops.len() as u64 > c.pool.available() {
            return Err(CoreError::NoMemory {
                source: Errno::ENOMEM,
            });
        }
        let mut tasks = Vec::with_capacity(batch.ops.len());
        for (op, cb) in batch.ops {
            tasks.push(c.alloc(op, cb)?);
        }
        c.ring.push_back(RingEntry::Batch {
            tasks,
            batch_cb: Some(batch_cb),
        });
        Ok(())
    })
    .unwrap_or(Err(CoreError::GetIoChannel {
        name: "accel".to_string(),
    }))
}

fn crc32c(seed: u32, data: &[u8]) -> u32 {
    crc32::update(seed, &CRC32C_TABLE, data)
}

fn execute(op: AccelOp) -> AccelResult {
    match op {
        AccelOp::Copy {
            src,
            mut dst,
            len,
        } => {
            let status = if len <= src.len() && len <= dst.len() {
                dst.as_mut_slice()[.. len]
                    .copy_from_slice(&src.as_slice()[.. len]);
                0
            } else {
                -(Errno::EINVAL as i32)
            };
            AccelResult {
                status,
                crc: None,
                bufs: vec![src, dst],
            }
        }
        AccelOp::Dualcast {
            src,
            mut dst1,
            mut dst2,
            len,
        } => {
            let status = if len <= src.len()
                && len <= dst1.len()
                && len <= dst2.len()
            {
                dst1.as_mut_slice()[.. len]
                    .copy_from_slice(&src.as_slice()[.. len]);
                dst2.as_mut_slice()[.. len]
                    .copy_from_slice(&src.as_slice()[.. len]);
                0
            } else {
                -(Errno::EINVAL as i32)
            };
            AccelResult {
                status,
                crc: None,
                bufs: vec![src, dst1, dst2],
            }
        }
        AccelOp::Compare {
            src1,
            src2,
            len,
        } => {
            let status = if len <= src1.len() && len <= src2.len() {
                if src1.as_slice()[.. len] == src2.as_slice()[.. len] {
                    0
                } else {
                    -(libc::EILSEQ)
                }
            } else {
                -(Errno::EINVAL as i32)
            };
            AccelResult {
                status,
                crc: None,
                bufs: vec![src1, src2],
            }
        }
        AccelOp::Fill {
            mut dst,
            val,
            len,
        } => {
            let status = if len <= dst.len() {
                dst.as_mut_slice()[.. len]
                    .iter_mut()
                    .for_each(|b| *b = val);
                0
            } else {
                -(Errno::EINVAL as i32)
            };
            AccelResult {
                status,
                crc: None,
                bufs: vec![dst],
            }
        }
        AccelOp::Crc32c {
            src,
            seed,
            len,
        } => {
            if len <= src.len() {
                let crc = crc32c(seed, &src.as_slice()[.. len]);
                AccelResult {
                    status: 0,
                    crc: Some(crc),
                    bufs: vec![src],
                }
            } else {
                AccelResult {
                    status: -(Errno::EINVAL as i32),
                    crc: None,
                    bufs: vec![src],
                }
            }
        }
        AccelOp::CopyCrc32c {
            src,
            mut dst,
            seed,
            len,
        } => {
            if len <= src.len() && len <= dst.len() {
                dst.as_mut_slice()[.. len]
                    .copy_from_slice(&src.as_slice()[.. len]);
                let crc = crc32c(seed, &dst.as_slice()[.. len]);
                AccelResult {
                    status: 0,
                    crc: Some(crc),
                    bufs: vec![src, dst],
                }
            } else {
                AccelResult {
                    status: -(Errno::EINVAL as i32),
                    crc: None,
                    bufs: vec![src, dst],
                }
            }
        }
    }
}

fn op_bufs(op: AccelOp) -> Vec<DmaBuf> {
    match op {
        AccelOp::Copy {
            src,
            dst,
            ..
        } => vec![src, dst],
        AccelOp::Dualcast {
            src,
            dst1,
            dst2,
            ..
        } => vec![src, dst1, dst2],
        AccelOp::Compare {
            src1,
            src2,
            ..
        } => vec![src1, src2],
        AccelOp::Fill {
            dst, ..
        } => vec![dst],
        AccelOp::Crc32c {
            src, ..
        } => vec![src],
        AccelOp::CopyCrc32c {
            src,
            dst,
            ..
        } => vec![src, dst],
    }
}

fn run_task(task: PoolItem<AccelTask>) -> i32 {
    let AccelTask {
        op,
        cb,
    } = task.into_inner();
    let result = execute(op);
    let status = result.status;
    if let Some(cb) = cb {
        cb(result);
    }
    status
}

fn complete_entry(entry: RingEntry, forced_status: i32) -> i32 {
    match entry {
        RingEntry::Single(task) => {
            if forced_status != 0 {
                fail_task(task, forced_status);
                forced_status
            } else {
                run_task(task)
            }
        }
        RingEntry::Batch {
            tasks,
            mut batch_cb,
        } => {
            let mut first_error = 0;
            for task in tasks {
                let status = if forced_status != 0 {
                    fail_task(task, forced_status);
                    forced_status
                } else {
                    run_task(task)
                };
                if status != 0 && first_error == 0 {
                    first_error = status;
                }
            }
            if let Some(cb) = batch_cb.take() {
                cb(first_error);
            }
            first_error
        }
    }
}

fn fail_task(task: PoolItem<AccelTask>, status: i32) {
    let AccelTask {
        op,
        cb,
    } = task.into_inner();
    if let Some(cb) = cb {
        cb(AccelResult {
            status,
            crc: None,
            bufs: op_bufs(op),
        });
    }
}

/// execute everything queued on the channel, FIFO
fn poll_channel(device: IoDeviceId) -> i32 {
    let entries = io_device::with_channel_ctx::<AccelChannel, _>(
        device,
        |chan| chan.ring.drain(..).collect::<Vec<_>>(),
    )
    .unwrap_or_default();

    let mut did = 0;
    for entry in entries {
        complete_entry(entry, 0);
        did += 1;
    }
    did
}

#[cfg(test)]
mod tests {
    use super::crc32c;

    #[test]
    fn crc32c_known_answer() {
        // "123456789" has a well-known castagnoli checksum
        assert_eq!(crc32c(0, b"123456789"), 0xe306_9283);
    }
}
