//! NVMe wire structures shared by the transports: submission and
//! completion entries, opcodes, status decoding and the identify payloads
//! the controller path consumes.

/// 64-byte submission queue entry.
#[derive(Debug, Clone, Copy, Default)]
#[repr(C)]
pub struct NvmeCmd {
    pub opc: u8,
    pub flags: u8,
    pub cid: u16,
    pub nsid: u32,
    pub cdw2: u32,
    pub cdw3: u32,
    pub mptr: u64,
    pub prp1: u64,
    pub prp2: u64,
    pub cdw10: u32,
    pub cdw11: u32,
    pub cdw12: u32,
    pub cdw13: u32,
    pub cdw14: u32,
    pub cdw15: u32,
}

/// 16-byte completion queue entry as it sits in host memory.
#[derive(Debug, Clone, Copy, Default)]
#[repr(C)]
pub struct NvmeCqe {
    pub cdw0: u32,
    pub rsvd: u32,
    pub sqhd: u16,
    pub sqid: u16,
    pub cid: u16,
    /// bit 0 is the phase tag, bits 1..16 the status field
    pub status: u16,
}

impl NvmeCqe {
    pub fn phase(&self) -> bool {
        self.status & 1 == 1
    }
}

/// Decoded status field of a completion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NvmeStatus {
    /// status code type
    pub sct: u8,
    /// status code
    pub sc: u8,
    /// do not retry
    pub dnr: bool,
}

#[derive(Debug, Copy, Clone, Eq, PartialOrd, PartialEq)]
pub enum GenericStatusCode {
    Success,
    InvalidOpcode,
    InvalidField,
    CommandIdConflict,
    DataTransferError,
    InternalDeviceError,
    AbortedRequested,
    AbortedSubmissionQueueDeleted,
    Reserved,
}

impl From<u8> for GenericStatusCode {
    fn from(i: u8) -> Self {
        match i {
            0x00 => Self::Success,
            0x01 => Self::InvalidOpcode,
            0x02 => Self::InvalidField,
            0x03 => Self::CommandIdConflict,
            0x04 => Self::DataTransferError,
            0x06 => Self::InternalDeviceError,
            0x07 => Self::AbortedRequested,
            0x08 => Self::AbortedSubmissionQueueDeleted,
            _ => {
                error!("unknown status code {}", i);
                Self::Reserved
            }
        }
    }
}

impl NvmeStatus {
    pub fn success() -> Self {
        Self {
            sct: 0,
            sc: 0,
            dnr: false,
        }
    }

    pub fn aborted_by_request() -> Self {
        Self {
            sct: 0,
            sc: 0x07,
            dnr: false,
        }
    }

    pub fn aborted_sq_deleted() -> Self {
        Self {
            sct: 0,
            sc: 0x08,
            dnr: false,
        }
    }

    pub fn internal_error() -> Self {
        Self {
            sct: 0,
            sc: 0x06,
            dnr: false,
        }
    }

    pub fn invalid_field() -> Self {
        Self {
            sct: 0,
            sc: 0x02,
            dnr: true,
        }
    }

    /// decode the 15-bit status field (phase already stripped)
    pub fn from_raw(raw: u16) -> Self {
        Self {
            sct: ((raw >> 8) & 0x7) as u8,
            sc: (raw & 0xff) as u8,
            dnr: raw & (1 << 14) != 0,
        }
    }

    /// encode into the on-wire status field, without the phase bit
    pub fn to_raw(&self) -> u16 {
        (self.sc as u16)
            | ((self.sct as u16 & 0x7) << 8)
            | if self.dnr { 1 << 14 } else { 0 }
    }

    pub fn is_success(&self) -> bool {
        self.sct == 0 && self.sc == 0
    }

    pub fn is_aborted(&self) -> bool {
        self.sct == 0 && (self.sc == 0x07 || self.sc == 0x08)
    }

    pub fn generic(&self) -> GenericStatusCode {
        GenericStatusCode::from(self.sc)
    }
}

/// Completion handed to the request callback; transport agnostic.
#[derive(Debug, Clone, Copy)]
pub struct NvmeCompletion {
    pub cdw0: u32,
    pub sqid: u16,
    pub cid: u16,
    pub status: NvmeStatus,
}

impl NvmeCompletion {
    /// log page identifier carried by an asynchronous event completion
    pub fn aer_log_page(&self) -> u8 {
        ((self.cdw0 >> 16) & 0xff) as u8
    }
}

pub mod admin_opc {
    pub const DELETE_IO_SQ: u8 = 0x00;
    pub const CREATE_IO_SQ: u8 = 0x01;
    pub const GET_LOG_PAGE: u8 = 0x02;
    pub const DELETE_IO_CQ: u8 = 0x04;
    pub const CREATE_IO_CQ: u8 = 0x05;
    pub const IDENTIFY: u8 = 0x06;
    pub const ABORT: u8 = 0x08;
    pub const SET_FEATURES: u8 = 0x09;
    pub const ASYNC_EVENT_REQUEST: u8 = 0x0c;
}

pub mod nvm_opc {
    pub const FLUSH: u8 = 0x00;
    pub const WRITE: u8 = 0x01;
    pub const READ: u8 = 0x02;
    pub const WRITE_ZEROES: u8 = 0x08;
    pub const DATASET_MANAGEMENT: u8 = 0x09;
}

pub mod log_page {
    pub const ERROR: u8 = 0x01;
    pub const HEALTH: u8 = 0x02;
    pub const CHANGED_NS_LIST: u8 = 0x04;
    pub const DISCOVERY: u8 = 0x70;
}

pub mod identify_cns {
    pub const NAMESPACE: u8 = 0x00;
    pub const CONTROLLER: u8 = 0x01;
    pub const ACTIVE_NS_LIST: u8 = 0x02;
}

/// feature identifier for the queue count negotiation
pub const FEAT_NUM_QUEUES: u8 = 0x07;

pub const DISCOVERY_NQN: &str = "nqn.2014-08.org.nvmexpress.discovery";

/// The slice of the identify controller payload the host side cares about.
#[derive(Debug, Clone, Default)]
pub struct IdentifyControllerData {
    pub vid: u16,
    pub sn: String,
    pub mn: String,
    pub fr: String,
    pub cntlid: u16,
    /// asynchronous event request limit (zero based)
    pub aerl: u8,
    /// abort command limit (zero based)
    pub acl: u8,
    /// number of namespaces
    pub nn: u32,
    pub subnqn: String,
}

fn fixed_string(buf: &[u8]) -> String {
    String::from_utf8_lossy(buf)
        .trim_end_matches(char::from(0))
        .trim_end()
        .to_string()
}

fn put_fixed(dst: &mut [u8], s: &str) {
    let bytes = s.as_bytes();
    let n = bytes.len().min(dst.len());
    dst[.. n].copy_from_slice(&bytes[.. n]);
}

impl IdentifyControllerData {
    /// parse the 4096-byte identify controller payload
    pub fn parse(buf: &[u8]) -> Self {
        assert!(buf.len() >= 1024);
        Self {
            vid: u16::from_le_bytes([buf[0], buf[1]]),
            sn: fixed_string(&buf[4 .. 24]),
            mn: fixed_string(&buf[24 .. 64]),
            fr: fixed_string(&buf[64 .. 72]),
            cntlid: u16::from_le_bytes([buf[78], buf[79]]),
            acl: buf[258],
            aerl: buf[259],
            nn: u32::from_le_bytes([
                buf[516], buf[517], buf[518], buf[519],
            ]),
            subnqn: fixed_string(&buf[768 .. 1024]),
        }
    }

    /// encode into an identify controller payload; used by software
    /// endpoints
    pub fn encode(&self, buf: &mut [u8]) {
        assert!(buf.len() >= 1024);
        buf[0 .. 2].copy_from_slice(&self.vid.to_le_bytes());
        put_fixed(&mut buf[4 .. 24], &self.sn);
        put_fixed(&mut buf[24 .. 64], &self.mn);
        put_fixed(&mut buf[64 .. 72], &self.fr);
        buf[78 .. 80].copy_from_slice(&self.cntlid.to_le_bytes());
        buf[258] = self.acl;
        buf[259] = self.aerl;
        buf[516 .. 520].copy_from_slice(&self.nn.to_le_bytes());
        put_fixed(&mut buf[768 .. 1024], &self.subnqn);
    }
}

/// The slice of the identify namespace payload the host side cares about.
#[derive(Debug, Clone, Copy, Default)]
pub struct IdentifyNamespaceData {
    /// namespace size in blocks
    pub nsze: u64,
    /// namespace capacity in blocks
    pub ncap: u64,
    /// log2 of the block size
    pub lbads: u8,
}

impl IdentifyNamespaceData {
    pub fn parse(buf: &[u8]) -> Self {
        assert!(buf.len() >= 132);
        let mut nsze = [0u8; 8];
        nsze.copy_from_slice(&buf[0 .. 8]);
        let mut ncap = [0u8; 8];
        ncap.copy_from_slice(&buf[8 .. 16]);
        Self {
            nsze: u64::from_le_bytes(nsze),
            ncap: u64::from_le_bytes(ncap),
            // lbaf[0], bits 16..24 hold the lba data size
            lbads: buf[130],
        }
    }

    pub fn encode(&self, buf: &mut [u8]) {
        assert!(buf.len() >= 132);
        buf[0 .. 8].copy_from_slice(&self.nsze.to_le_bytes());
        buf[8 .. 16].copy_from_slice(&self.ncap.to_le_bytes());
        buf[130] = self.lbads;
    }

    pub fn block_len(&self) -> u32 {
        1u32 << self.lbads
    }
}

/// one dataset-management (deallocate) range
#[derive(Debug, Clone, Copy, Default)]
#[repr(C)]
pub struct DsmRange {
    pub attributes: u32,
    pub length: u32,
    pub starting_lba: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_roundtrip() {
        let s = NvmeStatus {
            sct: 1,
            sc: 0x86,
            dnr: true,
        };
        assert_eq!(NvmeStatus::from_raw(s.to_raw()), s);
        assert!(NvmeStatus::success().is_success());
        assert!(NvmeStatus::aborted_by_request().is_aborted());
        assert!(NvmeStatus::aborted_sq_deleted().is_aborted());
    }

    #[test]
    fn identify_roundtrip() {
        let mut buf = vec![0u8; 4096];
        let cdata = IdentifyControllerData {
            vid: 0x1b36,
            sn: "UTSN001".into(),
            mn: "iocore software controller".into(),
            fr: "1.0".into(),
            cntlid: 7,
            aerl: 3,
            acl: 3,
            nn: 2,
            subnqn: "nqn.2019-05.io.iocore:utest".into(),
        };
        cdata.encode(&mut buf);
        let parsed = IdentifyControllerData::parse(&buf);
        assert_eq!(parsed.sn, cdata.sn);
        assert_eq!(parsed.mn, cdata.mn);
        assert_eq!(parsed.nn, 2);
        assert_eq!(parsed.aerl, 3);
        assert_eq!(parsed.subnqn, cdata.subnqn);
    }

    #[test]
    fn aer_log_page_decoding() {
        let cpl = NvmeCompletion {
            cdw0: (log_page::DISCOVERY as u32) << 16,
            sqid: 0,
            cid: 1,
            status: NvmeStatus::success(),
        };
        assert_eq!(cpl.aer_log_page(), log_page::DISCOVERY);
    }
}
