//! Shared helpers for the integration tests: logging/bootstrap glue and a
//! software NVMe endpoint that plugs in behind the custom transport type,
//! so the controller and qpair state machines can be exercised without
//! hardware.

#![allow(dead_code)]

use std::{
    collections::{HashMap, VecDeque},
    sync::{
        atomic::{AtomicBool, AtomicU32, Ordering},
        Arc,
    },
};

use nix::errno::Errno;
use parking_lot::Mutex;

use iocore::{
    bdev::nvmx::{
        protocol::{
            admin_opc,
            identify_cns,
            nvm_opc,
            IdentifyControllerData,
            IdentifyNamespaceData,
            NvmeCompletion,
            NvmeStatus,
        },
        transport::{
            ControllerTransport,
            NvmeTransport,
            NvmeTransportId,
            QpairTransport,
            TransportType,
        },
        NvmeControllerOpts,
        NvmeRequest,
    },
    core::{CoreError, Mthread},
};

pub fn test_init() {
    iocore::logger::init("info");
}

/// create a thread and enter/poll helpers used by most tests
pub fn test_thread(name: &str) -> Mthread {
    Mthread::new(name.to_string(), 0).expect("failed to create thread")
}

type DoneQueue = Arc<Mutex<VecDeque<NvmeCompletion>>>;

/// The model of one software NVMe target shared by all its qpairs.
pub struct EmuEndpoint {
    pub serial: String,
    /// nsid -> backing store
    disks: Mutex<HashMap<u32, Vec<u8>>>,
    pub block_len: u32,
    /// fail the next admin-queue completion poll with ENXIO
    fail_admin: AtomicBool,
    /// fail that many upcoming controller connect attempts
    pub fail_connects: AtomicU32,
    /// queued asynchronous events (log page ids)
    aer_events: Mutex<VecDeque<u8>>,
    /// per-qpair completion queues, so aborts can reach their victims
    queues: Mutex<HashMap<u16, DoneQueue>>,
    /// pending AER command ids per qpair
    pending_aers: Mutex<HashMap<u16, u16>>,
    /// hold io completions back until released
    pub hold_io: AtomicBool,
}

impl EmuEndpoint {
    pub fn new(serial: &str, ns_blocks: u64, block_len: u32) -> Arc<Self> {
        let mut disks = HashMap::new();
        disks.insert(1, vec![0u8; (ns_blocks * block_len as u64) as usize]);
        Arc::new(Self {
            serial: serial.to_string(),
            disks: Mutex::new(disks),
            block_len,
            fail_admin: AtomicBool::new(false),
            fail_connects: AtomicU32::new(0),
            aer_events: Mutex::new(VecDeque::new()),
            queues: Mutex::new(HashMap::new()),
            pending_aers: Mutex::new(HashMap::new()),
            hold_io: AtomicBool::new(false),
        })
    }

    /// make the next admin poll report transport failure
    pub fn inject_admin_failure(&self) {
        self.fail_admin.store(true, Ordering::SeqCst);
    }

    /// make the next `n` reconnect attempts fail
    pub fn fail_next_connects(&self, n: u32) {
        self.fail_connects.store(n, Ordering::SeqCst);
    }

    /// report an asynchronous event with the given log page id
    pub fn trigger_aer(&self, lid: u8) {
        self.aer_events.lock().push_back(lid);
    }

    fn lbads(&self) -> u8 {
        self.block_len.trailing_zeros() as u8
    }
}

/// All software endpoints of this process, keyed by their address. One
/// transport instance dispatches to them, so concurrently running tests do
/// not fight over the custom transport slot.
static EMU_ENDPOINTS: once_cell::sync::Lazy<
    Mutex<HashMap<String, Arc<EmuEndpoint>>>,
> = once_cell::sync::Lazy::new(|| Mutex::new(HashMap::new()));

/// transport front-end; register endpoints with [`register_emu_transport`]
pub struct EmuTransport {}

pub fn register_emu_transport(endpoint: &Arc<EmuEndpoint>) {
    EMU_ENDPOINTS
        .lock()
        .insert(endpoint.serial.clone(), Arc::clone(endpoint));
    iocore::bdev::nvmx::register_transport(Arc::new(EmuTransport {}));
}

/// make an endpoint disappear from the bus, as a hot-removal would
pub fn unregister_emu_endpoint(serial: &str) {
    EMU_ENDPOINTS.lock().remove(serial);
}

/// the trid the emulated endpoint answers to
pub fn emu_trid(serial: &str) -> NvmeTransportId {
    format!(
        "trtype:CUSTOM traddr:{} subnqn:nqn.2019-05.io.iocore:{}",
        serial, serial
    )
    .parse()
    .unwrap()
}

impl NvmeTransport for EmuTransport {
    fn trtype(&self) -> TransportType {
        TransportType::Custom
    }

    fn enumerate(
        &self,
        trid: &NvmeTransportId,
    ) -> Result<Vec<NvmeTransportId>, CoreError> {
        let endpoints = EMU_ENDPOINTS.lock();
        Ok(endpoints
            .values()
            .filter(|e| trid.traddr.is_empty() || trid.traddr == e.serial)
            .map(|e| emu_trid(&e.serial))
            .collect())
    }

    fn connect(
        &self,
        trid: &NvmeTransportId,
        _opts: &NvmeControllerOpts,
    ) -> Result<Box<dyn ControllerTransport>, CoreError> {
        let endpoint = EMU_ENDPOINTS
            .lock()
            .get(&trid.traddr)
            .cloned()
            .ok_or_else(|| CoreError::ConnectFailed {
                source: Errno::EHOSTUNREACH,
                target: trid.to_string(),
            })?;

        let remaining = endpoint.fail_connects.load(Ordering::SeqCst);
        if remaining > 0 {
            endpoint
                .fail_connects
                .store(remaining - 1, Ordering::SeqCst);
            return Err(CoreError::ConnectFailed {
                source: Errno::EHOSTDOWN,
                target: trid.to_string(),
            });
        }
        Ok(Box::new(EmuController {
            endpoint,
        }))
    }
}

struct EmuController {
    endpoint: Arc<EmuEndpoint>,
}

impl ControllerTransport for EmuController {
    fn alloc_qpair(
        &mut self,
        qid: u16,
        size: u32,
    ) -> Result<Box<dyn QpairTransport>, CoreError> {
        let done: DoneQueue = Arc::new(Mutex::new(VecDeque::new()));
        self.endpoint.queues.lock().insert(qid, Arc::clone(&done));
        Ok(Box::new(EmuQpair {
            endpoint: Arc::clone(&self.endpoint),
            qid,
            size,
            done,
            connected: false,
        }))
    }

    fn reconnect(&mut self) -> Result<(), Errno> {
        // force the generic layer through the full connect path, which is
        // where the failure injection lives
        Err(Errno::EIO)
    }
}

struct EmuQpair {
    endpoint: Arc<EmuEndpoint>,
    qid: u16,
    size: u32,
    done: DoneQueue,
    connected: bool,
}

impl EmuQpair {
    fn push(&self, cid: u16, cdw0: u32, status: NvmeStatus) {
        self.done.lock().push_back(NvmeCompletion {
            cdw0,
            sqid: self.qid,
            cid,
            status,
        });
    }

    fn execute_admin(&mut self, req: &mut NvmeRequest) {
        let cid = req.cmd.cid;
        match req.cmd.opc {
            admin_opc::IDENTIFY => {
                let cns = (req.cmd.cdw10 & 0xff) as u8;
                let buf = match req.buf.as_mut() {
                    Some(b) => b,
                    None => {
                        self.push(cid, 0, NvmeStatus::invalid_field());
                        return;
                    }
                };
                match cns {
                    identify_cns::CONTROLLER => {
                        let cdata = IdentifyControllerData {
                            vid: 0x1b36,
                            sn: self.endpoint.serial.clone(),
                            mn: "iocore software controller".into(),
                            fr: "1.0".into(),
                            cntlid: 1,
                            aerl: 3,
                            acl: 7,
                            nn: 1,
                            subnqn: format!(
                                "nqn.2019-05.io.iocore:{}",
                                self.endpoint.serial
                            ),
                        };
                        cdata.encode(buf.as_mut_slice());
                        self.push(cid, 0, NvmeStatus::success());
                    }
                    identify_cns::NAMESPACE => {
                        let disks = self.endpoint.disks.lock();
                        match disks.get(&req.cmd.nsid) {
                            Some(disk) => {
                                let data = IdentifyNamespaceData {
                                    nsze: disk.len() as u64
                                        / self.endpoint.block_len as u64,
                                    ncap: disk.len() as u64
                                        / self.endpoint.block_len as u64,
                                    lbads: self.endpoint.lbads(),
                                };
                                data.encode(buf.as_mut_slice());
                                self.push(cid, 0, NvmeStatus::success());
                            }
                            None => {
                                // inactive namespace identifies as zeroes
                                self.push(cid, 0, NvmeStatus::success());
                            }
                        }
                    }
                    _ => self.push(cid, 0, NvmeStatus::invalid_field()),
                }
            }
            admin_opc::ABORT => {
                let target_qid = (req.cmd.cdw10 & 0xffff) as u16;
                let target_cid = (req.cmd.cdw10 >> 16) as u16;
                let aborted = self.abort_in_target(target_qid, target_cid);
                // cdw0 bit 0 clear means the command was aborted
                let cdw0 = if aborted { 0 } else { 1 };
                self.push(cid, cdw0, NvmeStatus::success());
            }
            admin_opc::ASYNC_EVENT_REQUEST => {
                // stays pending until an event fires
                self.endpoint.pending_aers.lock().insert(self.qid, cid);
            }
            admin_opc::GET_LOG_PAGE => {
                if let Some(buf) = req.buf.as_mut() {
                    buf.fill(0);
                }
                self.push(cid, 0, NvmeStatus::success());
            }
            admin_opc::SET_FEATURES => {
                self.push(cid, 0, NvmeStatus::success());
            }
            _ => self.push(cid, 0, NvmeStatus::invalid_field()),
        }
    }

    /// try to abort a command that is still queued for completion in the
    /// target qpair: replace its completion with an aborted one
    fn abort_in_target(&self, qid: u16, cid: u16) -> bool {
        let queues = self.endpoint.queues.lock();
        let queue = match queues.get(&qid) {
            Some(q) => q,
            None => return false,
        };
        let mut queue = queue.lock();
        for cpl in queue.iter_mut() {
            if cpl.cid == cid && cpl.status.is_success() {
                cpl.status = NvmeStatus::aborted_by_request();
                return true;
            }
        }
        false
    }

    fn execute_nvm(&mut self, req: &mut NvmeRequest) {
        let cid = req.cmd.cid;
        let nsid = req.cmd.nsid;
        let lba = req.cmd.cdw10 as u64 | ((req.cmd.cdw11 as u64) << 32);
        let blocks = (req.cmd.cdw12 & 0xffff) as u64 + 1;
        let block_len = self.endpoint.block_len as u64;

        let mut disks = self.endpoint.disks.lock();
        let disk = match disks.get_mut(&nsid) {
            Some(d) => d,
            None => {
                self.push(cid, 0, NvmeStatus::invalid_field());
                return;
            }
        };

        let start = (lba * block_len) as usize;
        let len = (blocks * block_len) as usize;
        if start + len > disk.len() {
            self.push(cid, 0, NvmeStatus::invalid_field());
            return;
        }

        let status = match req.cmd.opc {
            nvm_opc::READ => match req.buf.as_mut() {
                Some(buf) => {
                    buf.as_mut_slice()[.. len]
                        .copy_from_slice(&disk[start .. start + len]);
                    NvmeStatus::success()
                }
                None => NvmeStatus::invalid_field(),
            },
            nvm_opc::WRITE => match req.buf.as_ref() {
                Some(buf) => {
                    disk[start .. start + len]
                        .copy_from_slice(&buf.as_slice()[.. len]);
                    NvmeStatus::success()
                }
                None => NvmeStatus::invalid_field(),
            },
            nvm_opc::WRITE_ZEROES => {
                disk[start .. start + len].iter_mut().for_each(|b| *b = 0);
                NvmeStatus::success()
            }
            nvm_opc::FLUSH | nvm_opc::DATASET_MANAGEMENT => {
                NvmeStatus::success()
            }
            _ => NvmeStatus::invalid_field(),
        };
        self.push(cid, 0, status);
    }
}

impl QpairTransport for EmuQpair {
    fn qid(&self) -> u16 {
        self.qid
    }

    fn connect(&mut self) -> Result<(), Errno> {
        self.connected = true;
        Ok(())
    }

    fn disconnect(&mut self) {
        self.connected = false;
    }

    fn submit(&mut self, req: &mut NvmeRequest) -> Result<(), Errno> {
        if !self.connected {
            return Err(Errno::ENXIO);
        }
        if self.done.lock().len() >= self.size as usize {
            return Err(Errno::ENOMEM);
        }
        if self.qid == 0 {
            self.execute_admin(req);
        } else {
            self.execute_nvm(req);
        }
        Ok(())
    }

    fn process_completions(
        &mut self,
        max: u32,
        out: &mut Vec<NvmeCompletion>,
    ) -> Result<u32, Errno> {
        if !self.connected {
            return Err(Errno::ENXIO);
        }

        if self.qid == 0 {
            if self.endpoint.fail_admin.swap(false, Ordering::SeqCst) {
                return Err(Errno::ENXIO);
            }

            // deliver a pending asynchronous event if one fired
            let lid = self.endpoint.aer_events.lock().pop_front();
            if let Some(lid) = lid {
                let aer_cid =
                    self.endpoint.pending_aers.lock().remove(&self.qid);
                match aer_cid {
                    Some(cid) => {
                        self.push(
                            cid,
                            (lid as u32) << 16,
                            NvmeStatus::success(),
                        );
                    }
                    None => {
                        // nothing armed; put the event back
                        self.endpoint.aer_events.lock().push_front(lid);
                    }
                }
            }
        } else if self.endpoint.hold_io.load(Ordering::SeqCst) {
            return Ok(0);
        }

        let mut count = 0u32;
        let mut queue = self.done.lock();
        while let Some(cpl) = queue.pop_front() {
            out.push(cpl);
            count += 1;
            if max != 0 && count >= max {
                break;
            }
        }
        Ok(count)
    }
}
