//! Namespace geometry and the NVM command builders.

use nix::errno::Errno;

use crate::{
    bdev::nvmx::{
        protocol::{nvm_opc, IdentifyNamespaceData, NvmeCmd},
        qpair::{NvmeIoCb, NvmeRequest, QPair},
    },
    core::{CoreError, DmaBuf},
};

#[derive(Debug, Clone)]
pub struct NvmeNamespace {
    id: u32,
    num_blocks: u64,
    block_len: u32,
}

impl NvmeNamespace {
    pub fn from_identify(id: u32, data: &IdentifyNamespaceData) -> Self {
        Self {
            id,
            num_blocks: data.nsze,
            block_len: data.block_len(),
        }
    }

    pub fn nsid(&self) -> u32 {
        self.id
    }

    pub fn num_blocks(&self) -> u64 {
        self.num_blocks
    }

    pub fn block_len(&self) -> u32 {
        self.block_len
    }

    pub fn size_in_bytes(&self) -> u64 {
        self.num_blocks * self.block_len as u64
    }

    fn check_range(
        &self,
        lba: u64,
        blocks: u32,
    ) -> Result<(), CoreError> {
        if blocks == 0 {
            return Err(CoreError::InvalidLength {
                len: 0,
            });
        }
        if lba + blocks as u64 > self.num_blocks {
            return Err(CoreError::InvalidOffset {
                offset: lba,
            });
        }
        Ok(())
    }
}

fn rw_cmd(opc: u8, nsid: u32, lba: u64, blocks: u32) -> NvmeCmd {
    NvmeCmd {
        opc,
        nsid,
        cdw10: lba as u32,
        cdw11: (lba >> 32) as u32,
        // zero based block count
        cdw12: blocks - 1,
        ..Default::default()
    }
}

/// Read `blocks` starting at `lba` into `buf`. Submission errors are
/// returned synchronously; a full tracker surfaces as the ENOMEM
/// back-pressure signal.
pub fn ns_cmd_read(
    ns: &NvmeNamespace,
    qpair: &mut QPair,
    buf: DmaBuf,
    lba: u64,
    blocks: u32,
    cb: NvmeIoCb,
) -> Result<(), CoreError> {
    ns.check_range(lba, blocks)?;
    if (buf.len() as u64) < blocks as u64 * ns.block_len as u64 {
        return Err(CoreError::InvalidLength {
            len: buf.len() as u64,
        });
    }
    let cmd = rw_cmd(nvm_opc::READ, ns.id, lba, blocks);
    qpair.submit(NvmeRequest::new(cmd, Some(buf), cb)).map_err(|e| {
        map_dispatch(e, lba, blocks, false)
    })
}

/// Write `blocks` starting at `lba` out of `buf`.
pub fn ns_cmd_write(
    ns: &NvmeNamespace,
    qpair: &mut QPair,
    buf: DmaBuf,
    lba: u64,
    blocks: u32,
    cb: NvmeIoCb,
) -> Result<(), CoreError> {
    ns.check_range(lba, blocks)?;
    if (buf.len() as u64) < blocks as u64 * ns.block_len as u64 {
        return Err(CoreError::InvalidLength {
            len: buf.len() as u64,
        });
    }
    let cmd = rw_cmd(nvm_opc::WRITE, ns.id, lba, blocks);
    qpair.submit(NvmeRequest::new(cmd, Some(buf), cb)).map_err(|e| {
        map_dispatch(e, lba, blocks, true)
    })
}

/// Zero `blocks` starting at `lba` without a data transfer.
pub fn ns_cmd_write_zeroes(
    ns: &NvmeNamespace,
    qpair: &mut QPair,
    lba: u64,
    blocks: u32,
    cb: NvmeIoCb,
) -> Result<(), CoreError> {
    ns.check_range(lba, blocks)?;
    let cmd = rw_cmd(nvm_opc::WRITE_ZEROES, ns.id, lba, blocks);
    qpair.submit(NvmeRequest::new(cmd, None, cb))
}

/// Flush the namespace.
pub fn ns_cmd_flush(
    ns: &NvmeNamespace,
    qpair: &mut QPair,
    cb: NvmeIoCb,
) -> Result<(), CoreError> {
    let cmd = NvmeCmd {
        opc: nvm_opc::FLUSH,
        nsid: ns.id,
        ..Default::default()
    };
    qpair.submit(NvmeRequest::new(cmd, None, cb))
}

/// Deallocate a range; the range descriptor travels in `buf`.
pub fn ns_cmd_dataset_management(
    ns: &NvmeNamespace,
    qpair: &mut QPair,
    buf: DmaBuf,
    nr_ranges: u32,
    cb: NvmeIoCb,
) -> Result<(), CoreError> {
    let cmd = NvmeCmd {
        opc: nvm_opc::DATASET_MANAGEMENT,
        nsid: ns.id,
        // zero based number of ranges
        cdw10: nr_ranges.saturating_sub(1),
        // attribute: deallocate
        cdw11: 1 << 2,
        ..Default::default()
    };
    qpair.submit(NvmeRequest::new(cmd, Some(buf), cb))
}

fn map_dispatch(
    e: CoreError,
    lba: u64,
    blocks: u32,
    write: bool,
) -> CoreError {
    match e {
        CoreError::QpairUnavailable {
            ..
        } => {
            if write {
                CoreError::WriteDispatch {
                    source: Errno::ENXIO,
                    offset: lba,
                    len: blocks as u64,
                }
            } else {
                CoreError::ReadDispatch {
                    source: Errno::ENXIO,
                    offset: lba,
                    len: blocks as u64,
                }
            }
        }
        other => other,
    }
}
