//! Expose a namespace of an attached controller as a bdev, plugging the
//! NVMe path into the generic block layer. The bdev's channels are the
//! controller's channels, so I/O flows straight onto the per-core qpair.

use std::sync::Arc;

use parking_lot::Mutex;

use crate::{
    bdev::nvmx::{
        channel::NvmeIoChannel,
        controller::NvmeController,
        namespace::{
            ns_cmd_dataset_management,
            ns_cmd_flush,
            ns_cmd_read,
            ns_cmd_write,
            ns_cmd_write_zeroes,
            NvmeNamespace,
        },
        protocol::{DsmRange, NvmeCompletion},
        qpair::NvmeIoCb,
        NVME_CONTROLLERS,
    },
    core::{
        io_device::IoDeviceId,
        Bdev,
        BdevIo,
        BdevOps,
        CoreError,
        DmaBuf,
        IoChannel,
        IoStatus,
        IoType,
    },
};

pub struct NvmeBlockDevice {
    ctrlr_name: String,
    ns: Arc<NvmeNamespace>,
    device_id: IoDeviceId,
}

/// Register a bdev named `alias` on top of the first namespace of the
/// attached controller.
pub fn create_block_device(
    ctrlr_name: &str,
    alias: &str,
) -> Result<Bdev, CoreError> {
    let carc = NVME_CONTROLLERS.lookup_by_name(ctrlr_name).ok_or_else(|| {
        CoreError::BdevNotFound {
            name: ctrlr_name.to_string(),
        }
    })?;

    let (ns, device_id) = {
        let controller = carc.lock();
        let ns = controller.namespace().ok_or_else(|| {
            CoreError::BdevNotFound {
                name: format!("{}: no active namespace", ctrlr_name),
            }
        })?;
        let device_id = controller.device_id().ok_or_else(|| {
            CoreError::GetIoChannel {
                name: ctrlr_name.to_string(),
            }
        })?;
        (ns, device_id)
    };

    let bdev = Bdev::new(
        alias.to_string(),
        "NVMe disk".into(),
        ns.block_len(),
        ns.num_blocks(),
        9,
        true,
        Box::new(NvmeBlockDevice {
            ctrlr_name: ctrlr_name.to_string(),
            ns,
            device_id,
        }),
    )
    .register()?;

    info!("{}: namespace exposed as bdev '{}'", ctrlr_name, alias);
    Ok(bdev)
}

fn io_status_from(cpl: &NvmeCompletion) -> IoStatus {
    if cpl.status.is_success() {
        IoStatus::Success
    } else if cpl.status.is_aborted() {
        IoStatus::Aborted
    } else {
        IoStatus::Failed
    }
}

/// completion glue: hand the buffer back to the I/O and finish it
fn completion_cb(mut io: BdevIo) -> NvmeIoCb {
    Box::new(move |cpl, buf| {
        if let Some(buf) = buf {
            io.put_buf(buf);
        }
        io.complete(io_status_from(cpl));
    })
}

impl NvmeBlockDevice {
    fn submit_to_qpair(&self, chan: &IoChannel, io: BdevIo) {
        let ns = Arc::clone(&self.ns);

        let mut io = Some(io);
        let submitted = chan.with_ctx::<NvmeIoChannel, _>(|c| {
            let mut io = io.take().unwrap();
            let qpair = match c.qpair_mut() {
                Some(q) => q,
                None => {
                    io.complete(IoStatus::Failed);
                    return;
                }
            };

            if !qpair.can_submit() {
                // a full tracker is soft back-pressure, anything else is a
                // dead qpair
                let status = if qpair.state()
                    == crate::bdev::nvmx::qpair::QPairState::Enabled
                {
                    IoStatus::NoMemory
                } else {
                    IoStatus::Failed
                };
                io.complete(status);
                return;
            }

            let lba = io.offset_blocks();
            let blocks = io.num_blocks() as u32;

            let res = match io.io_type() {
                IoType::Read => {
                    let buf = io.take_buf().expect("read without a buffer");
                    ns_cmd_read(&ns, qpair, buf, lba, blocks, completion_cb(io))
                }
                IoType::Write => {
                    let buf = io.take_buf().expect("write without a buffer");
                    ns_cmd_write(
                        &ns,
                        qpair,
                        buf,
                        lba,
                        blocks,
                        completion_cb(io),
                    )
                }
                IoType::WriteZeroes => ns_cmd_write_zeroes(
                    &ns,
                    qpair,
                    lba,
                    blocks,
                    completion_cb(io),
                ),
                IoType::Flush => ns_cmd_flush(&ns, qpair, completion_cb(io)),
                IoType::Unmap => {
                    match dsm_buffer(lba, blocks) {
                        Ok(buf) => ns_cmd_dataset_management(
                            &ns,
                            qpair,
                            buf,
                            1,
                            completion_cb(io),
                        ),
                        Err(e) => Err(e),
                    }
                }
                IoType::Reset => unreachable!("reset handled before dispatch"),
            };

            if let Err(e) = res {
                // the request was not accepted; the I/O is inside the
                // callback we just built, which will never run
                debug!("NVMe submission failed: {}", e);
            }
        });

        if submitted.is_none() {
            if let Some(io) = io.take() {
                error!("NVMe channel context gone, failing I/O");
                io.complete(IoStatus::Failed);
            }
        }
    }
}

fn dsm_buffer(lba: u64, blocks: u32) -> Result<DmaBuf, CoreError> {
    let mut buf = DmaBuf::new(4096, 12).map_err(|_| {
        CoreError::DmaAllocationFailed {
            size: 4096,
        }
    })?;
    let range = DsmRange {
        attributes: 0,
        length: blocks,
        starting_lba: lba,
    };
    let bytes: [u8; 16] = unsafe { std::mem::transmute(range) };
    buf.as_mut_slice()[.. 16].copy_from_slice(&bytes);
    Ok(buf)
}

impl BdevOps for NvmeBlockDevice {
    fn submit_request(&self, chan: &IoChannel, io: BdevIo) {
        if io.io_type() == IoType::Reset {
            // a bdev reset maps onto a full controller reset
            let carc = match NVME_CONTROLLERS.lookup_by_name(&self.ctrlr_name)
            {
                Some(c) => c,
                None => {
                    io.complete(IoStatus::Failed);
                    return;
                }
            };
            let thread = io.thread().clone();
            let mut io_slot = Some(io);
            let res = reset_controller(&carc, move |success| {
                if let Some(io) = io_slot.take() {
                    let status = if success {
                        IoStatus::Success
                    } else {
                        IoStatus::Failed
                    };
                    let _ = thread.send_msg(move || io.complete(status));
                }
            });
            if let Err(e) = res {
                warn!("{}: reset not dispatched: {}", self.ctrlr_name, e);
            }
            return;
        }

        self.submit_to_qpair(chan, io)
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
        // the channel device belongs to the controller, nothing to tear
        // down here
        debug!("{}: NVMe bdev destructed", self.ctrlr_name);
    }

    fn dump_config(&self) -> Option<serde_json::Value> {
        Some(serde_json::json!({
            "driver": "nvmx",
            "controller": self.ctrlr_name,
            "nsid": self.ns.nsid(),
        }))
    }
}

fn reset_controller(
    carc: &Arc<Mutex<NvmeController>>,
    cb: impl FnMut(bool) + Send + 'static,
) -> Result<(), CoreError> {
    let mut cb = cb;
    let mut controller = carc.lock();
    controller.reset(Box::new(move |success| cb(success)), false)
}
