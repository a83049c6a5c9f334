//! PCIe transport: enumerates NVMe functions through sysfs, maps BAR0 and
//! drives the admin and I/O rings with doorbell writes. Register access
//! goes through a typed MMIO block with explicit compiler fences around
//! each volatile access.
//!
//! The claim file keeps two processes off the same function; taking it is
//! serialized by a driver-level mutex.

use std::{
    collections::HashMap,
    fs,
    os::unix::io::AsRawFd,
    path::{Path, PathBuf},
    ptr::NonNull,
    sync::{atomic::compiler_fence, atomic::Ordering, Arc},
};

use nix::{
    errno::Errno,
    fcntl::{flock, FlockArg},
    sys::mman::{mmap, munmap, MapFlags, ProtFlags},
};
use once_cell::sync::Lazy;
use parking_lot::Mutex;

use crate::{
    bdev::nvmx::{
        controller::NvmeControllerOpts,
        protocol::{NvmeCmd, NvmeCompletion, NvmeCqe, NvmeStatus, admin_opc},
        qpair::NvmeRequest,
        transport::{
            ControllerTransport,
            NvmeTransport,
            NvmeTransportId,
            QpairTransport,
            TransportType,
        },
    },
    core::{memory, ticks, CoreError, DmaBuf},
};

const NVME_CLASS_CODE: &str = "0x010802";
const PCI_SYSFS_ROOT: &str = "/sys/bus/pci/devices";

// register block offsets
const REG_CAP: usize = 0x00;
const REG_CC: usize = 0x14;
const REG_CSTS: usize = 0x1c;
const REG_AQA: usize = 0x24;
const REG_ASQ: usize = 0x28;
const REG_ACQ: usize = 0x30;
const REG_DOORBELLS: usize = 0x1000;

const CC_EN: u32 = 1;
const CSTS_RDY: u32 = 1;
const CSTS_CFS: u32 = 1 << 1;

const PAGE: usize = 4096;

/// the PCI configuration/claim path is serialized process-wide
static PCI_CLAIM_LOCK: Lazy<Mutex<()>> = Lazy::new(|| Mutex::new(()));

/// Typed access to the mapped register block. Every access is volatile
/// with a compiler barrier on each side, mirroring how the registers must
/// be touched.
struct Mmio {
    base: NonNull<u8>,
    len: usize,
}

unsafe impl Send for Mmio {}
unsafe impl Sync for Mmio {}

impl Mmio {
    fn read32(&self, off: usize) -> u32 {
        assert!(off + 4 <= self.len);
        compiler_fence(Ordering::SeqCst);
        let v = unsafe {
            std::ptr::read_volatile(self.base.as_ptr().add(off) as *const u32)
        };
        compiler_fence(Ordering::SeqCst);
        v
    }

    fn write32(&self, off: usize, val: u32) {
        assert!(off + 4 <= self.len);
        compiler_fence(Ordering::SeqCst);
        unsafe {
            std::ptr::write_volatile(
                self.base.as_ptr().add(off) as *mut u32,
                val,
            )
        };
        compiler_fence(Ordering::SeqCst);
    }

    fn read64(&self, off: usize) -> u64 {
        assert!(off + 8 <= self.len);
        compiler_fence(Ordering::SeqCst);
        let v = unsafe {
            std::ptr::read_volatile(self.base.as_ptr().add(off) as *const u64)
        };
        compiler_fence(Ordering::SeqCst);
        v
    }

    fn write64(&self, off: usize, val: u64) {
        assert!(off + 8 <= self.len);
        compiler_fence(Ordering::SeqCst);
        unsafe {
            std::ptr::write_volatile(
                self.base.as_ptr().add(off) as *mut u64,
                val,
            )
        };
        compiler_fence(Ordering::SeqCst);
    }
}

impl Drop for Mmio {
    fn drop(&mut self) {
        unsafe {
            let _ = munmap(self.base.as_ptr() as *mut _, self.len);
        }
    }
}

fn sysfs_path(bdf: &str) -> PathBuf {
    Path::new(PCI_SYSFS_ROOT).join(bdf)
}

fn map_bar0(bdf: &str) -> Result<Mmio, Errno> {
    let path = sysfs_path(bdf).join("resource0");
    let file = fs::OpenOptions::new()
        .read(true)
        .write(true)
        .open(&path)
        .map_err(|e| Errno::from_i32(e.raw_os_error().unwrap_or(libc::ENODEV)))?;
    let len = file
        .metadata()
        .map_err(|_| Errno::EIO)?
        .len() as usize;

    let ptr = unsafe {
        mmap(
            std::ptr::null_mut(),
            len,
            ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
            MapFlags::MAP_SHARED,
            file.as_raw_fd(),
            0,
        )
    }
    .map_err(|e| e.as_errno().unwrap_or(Errno::EIO))?;

    // the fd may be closed once the mapping exists
    Ok(Mmio {
        base: NonNull::new(ptr as *mut u8).ok_or(Errno::EIO)?,
        len,
    })
}

/// Ring pair of one queue: submission entries, completion entries, the
/// host-side tail/head indices and the doorbell offsets.
struct RingPair {
    qid: u16,
    size: u32,
    sq: DmaBuf,
    cq: DmaBuf,
    sq_tail: u32,
    /// last head the device reported through a completion
    sq_head: u32,
    cq_head: u32,
    phase: bool,
    sq_db: usize,
    cq_db: usize,
    mmio: Arc<Mmio>,
    /// completions reaped while waiting inline for a specific command
    stash: Vec<NvmeCompletion>,
    /// PRP list pages, one per cid that needed one
    prp_lists: HashMap<u16, DmaBuf>,
}

impl RingPair {
    fn new(
        qid: u16,
        size: u32,
        dstrd: u32,
        mmio: Arc<Mmio>,
    ) -> Result<Self, CoreError> {
        let sq = DmaBuf::new(size as usize * 64, 12).map_err(|_| {
            CoreError::DmaAllocationFailed {
                size: size as u64 * 64,
            }
        })?;
        let cq = DmaBuf::new(size as usize * 16, 12).map_err(|_| {
            CoreError::DmaAllocationFailed {
                size: size as u64 * 16,
            }
        })?;

        let stride = 4usize << dstrd;
        Ok(Self {
            qid,
            size,
            sq,
            cq,
            sq_tail: 0,
            sq_head: 0,
            cq_head: 0,
            phase: true,
            sq_db: REG_DOORBELLS + (2 * qid as usize) * stride,
            cq_db: REG_DOORBELLS + (2 * qid as usize + 1) * stride,
            mmio,
            stash: Vec::new(),
            prp_lists: HashMap::new(),
        })
    }

    fn controller_alive(&self) -> bool {
        let csts = self.mmio.read32(REG_CSTS);
        csts != u32::MAX && csts & CSTS_CFS == 0
    }

    /// Fill prp1/prp2 for the payload of the command. The first entry may
    /// point into the middle of a page; every further entry is a page
    /// boundary.
    fn setup_prps(&mut self, req: &mut NvmeRequest) -> Result<(), Errno> {
        let buf = match req.buf.as_ref() {
            Some(buf) => buf,
            None => return Ok(()),
        };
        let len = buf.len();
        let base = buf.as_ptr();

        req.cmd.prp1 = memory::virt_to_phys(base);

        let first = PAGE - (base as usize % PAGE);
        if len <= first {
            req.cmd.prp2 = 0;
            return Ok(());
        }

        // page boundaries past the first chunk
        let bounds: Vec<u64> = (0 ..)
            .map(|i| first + i * PAGE)
            .take_while(|off| *off < len)
            .map(|off| memory::virt_to_phys(unsafe { base.add(off) }))
            .collect();

        if bounds.len() == 1 {
            req.cmd.prp2 = bounds[0];
            return Ok(());
        }

        if bounds.len() * 8 > PAGE {
            return Err(Errno::EFBIG);
        }
        let list = match self.prp_lists.get_mut(&req.cmd.cid) {
            Some(list) => list,
            None => {
                let list = DmaBuf::new(PAGE, 12).map_err(|_| Errno::ENOMEM)?;
                self.prp_lists.insert(req.cmd.cid, list);
                self.prp_lists.get_mut(&req.cmd.cid).unwrap()
            }
        };
        let entries = list.as_mut_slice();
        for (i, phys) in bounds.iter().enumerate() {
            entries[i * 8 .. i * 8 + 8].copy_from_slice(&phys.to_le_bytes());
        }
        req.cmd.prp2 = list.phys();
        Ok(())
    }

    fn submit(&mut self, req: &mut NvmeRequest) -> Result<(), Errno> {
        if !self.controller_alive() {
            return Err(Errno::ENXIO);
        }

        // one slot is kept open so tail never catches up with head
        let next_tail = (self.sq_tail + 1) % self.size;
        if next_tail == self.sq_head {
            return Err(Errno::ENOMEM);
        }
        self.setup_prps(req)?;

        unsafe {
            let slot = self.sq.as_ptr().add(self.sq_tail as usize * 64)
                as *mut NvmeCmd;
            std::ptr::write_volatile(slot, req.cmd);
        }
        self.sq_tail = next_tail;
        self.mmio.write32(self.sq_db, self.sq_tail);
        Ok(())
    }

    fn pop_cqe(&mut self) -> Option<NvmeCompletion> {
        let cqe = unsafe {
            let slot = self.cq.as_ptr().add(self.cq_head as usize * 16)
                as *const NvmeCqe;
            std::ptr::read_volatile(slot)
        };
        if cqe.phase() != self.phase {
            return None;
        }

        self.cq_head += 1;
        if self.cq_head == self.size {
            self.cq_head = 0;
            self.phase = !self.phase;
        }

        self.sq_head = cqe.sqhd as u32;
        self.prp_lists.remove(&cqe.cid);

        Some(NvmeCompletion {
            cdw0: cqe.cdw0,
            sqid: cqe.sqid,
            cid: cqe.cid,
            status: NvmeStatus::from_raw(cqe.status >> 1),
        })
    }

    fn process(
        &mut self,
        max: u32,
        out: &mut Vec<NvmeCompletion>,
    ) -> Result<u32, Errno> {
        if !self.controller_alive() {
            return Err(Errno::ENXIO);
        }

        let mut count = 0u32;
        while let Some(cpl) = self.stash.pop() {
            out.push(cpl);
            count += 1;
            if max != 0 && count >= max {
                return Ok(count);
            }
        }

        while let Some(cpl) = self.pop_cqe() {
            out.push(cpl);
            count += 1;
            if max != 0 && count >= max {
                break;
            }
        }

        if count > 0 {
            self.mmio.write32(self.cq_db, self.cq_head);
        }
        Ok(count)
    }

    /// poll inline until `cid` completes, stashing unrelated completions
    /// for the regular completion path
    fn wait_for(
        &mut self,
        cid: u16,
        deadline: u64,
    ) -> Result<NvmeCompletion, Errno> {
        loop {
            if !self.controller_alive() {
                return Err(Errno::ENXIO);
            }
            while let Some(cpl) = self.pop_cqe() {
                self.mmio.write32(self.cq_db, self.cq_head);
                if cpl.cid == cid {
                    return Ok(cpl);
                }
                self.stash.push(cpl);
            }
            if ticks::now() > deadline {
                return Err(Errno::ETIMEDOUT);
            }
            std::hint::spin_loop();
        }
    }
}

/// Handle implementing the qpair transport contract over a ring pair. The
/// admin ring is shared with the controller transport, which needs it to
/// create and delete I/O queues.
struct PcieQpair {
    rings: Arc<Mutex<RingPair>>,
    connected: bool,
}

impl QpairTransport for PcieQpair {
    fn qid(&self) -> u16 {
        self.rings.lock().qid
    }

    fn connect(&mut self) -> Result<(), Errno> {
        if !self.rings.lock().controller_alive() {
            return Err(Errno::ENXIO);
        }
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
        self.rings.lock().submit(req)
    }

    fn process_completions(
        &mut self,
        max: u32,
        out: &mut Vec<NvmeCompletion>,
    ) -> Result<u32, Errno> {
        if !self.connected {
            return Err(Errno::ENXIO);
        }
        self.rings.lock().process(max, out)
    }
}

pub struct PcieControllerTransport {
    bdf: String,
    mmio: Arc<Mmio>,
    dstrd: u32,
    /// CAP.TO, in ticks
    ready_timeout: u64,
    admin: Option<Arc<Mutex<RingPair>>>,
    /// keeps the exclusive flock on the function alive
    _claim: fs::File,
    /// command ids reserved for inline queue management commands
    next_mgmt_cid: u16,
}

impl PcieControllerTransport {
    fn new(bdf: &str) -> Result<Self, CoreError> {
        let connect_err = |source: Errno| CoreError::ConnectFailed {
            source,
            target: bdf.to_string(),
        };

        // claim the function before touching it
        let claim = {
            let _guard = PCI_CLAIM_LOCK.lock();
            let path = format!("/var/tmp/iocore-pci-{}.claim", bdf);
            let file = fs::OpenOptions::new()
                .create(true)
                .read(true)
                .write(true)
                .open(&path)
                .map_err(|_| connect_err(Errno::EACCES))?;
            flock(file.as_raw_fd(), FlockArg::LockExclusiveNonblock)
                .map_err(|_| connect_err(Errno::EBUSY))?;
            file
        };

        let mmio = Arc::new(map_bar0(bdf).map_err(connect_err)?);

        let cap = mmio.read64(REG_CAP);
        let dstrd = ((cap >> 32) & 0xf) as u32;
        // CAP.TO is in 500 ms units
        let to_ms = ((cap >> 24) & 0xff) * 500;
        let ready_timeout = ticks::from_micros(to_ms * 1000);

        info!(
            "{}: mapped BAR0, CAP {:#x} (dstrd {}, to {} ms)",
            bdf, cap, dstrd, to_ms
        );

        Ok(Self {
            bdf: bdf.to_string(),
            mmio,
            dstrd,
            ready_timeout,
            admin: None,
            _claim: claim,
            next_mgmt_cid: 0,
        })
    }

    fn wait_ready(&self, ready: bool) -> Result<(), Errno> {
        let want = if ready { CSTS_RDY } else { 0 };
        // devices may report CAP.TO of zero; wait at least half a second
        let floor = ticks::from_micros(500_000);
        let deadline = ticks::now() + self.ready_timeout.max(floor);
        loop {
            let csts = self.mmio.read32(REG_CSTS);
            if csts == u32::MAX || csts & CSTS_CFS != 0 {
                return Err(Errno::ENXIO);
            }
            if csts & CSTS_RDY == want {
                return Ok(());
            }
            if ticks::now() > deadline {
                return Err(Errno::ETIMEDOUT);
            }
            std::hint::spin_loop();
        }
    }

    fn disable_controller(&self) -> Result<(), Errno> {
        let cc = self.mmio.read32(REG_CC);
        self.mmio.write32(REG_CC, cc & !CC_EN);
        self.wait_ready(false)
    }

    /// bring the admin queue up and enable the controller
    fn setup_admin(
        &mut self,
        size: u32,
    ) -> Result<Arc<Mutex<RingPair>>, CoreError> {
        let enxio = |source: Errno| CoreError::ConnectFailed {
            source,
            target: self.bdf.clone(),
        };

        self.disable_controller().map_err(enxio)?;

        let rings =
            RingPair::new(0, size, self.dstrd, Arc::clone(&self.mmio))?;

        // zero based queue sizes
        self.mmio
            .write32(REG_AQA, ((size - 1) << 16) | (size - 1));
        self.mmio.write64(REG_ASQ, rings.sq.phys());
        self.mmio.write64(REG_ACQ, rings.cq.phys());

        // IOSQES = 64 bytes, IOCQES = 16 bytes
        self.mmio
            .write32(REG_CC, (6 << 16) | (4 << 20) | CC_EN);
        self.wait_ready(true).map_err(enxio)?;

        info!("{}: controller enabled", self.bdf);
        let rings = Arc::new(Mutex::new(rings));
        self.admin = Some(Arc::clone(&rings));
        Ok(rings)
    }

    /// submit a queue management command on the admin ring and wait for it
    /// inline; only used on setup paths where the admin queue is quiescent
    fn admin_mgmt_cmd(&mut self, mut cmd: NvmeCmd) -> Result<(), CoreError> {
        let admin = self.admin.as_ref().ok_or_else(|| {
            CoreError::ConnectFailed {
                source: Errno::ENXIO,
                target: self.bdf.clone(),
            }
        })?;

        // management cids live at the top of the id space to stay clear of
        // the generic tracker
        self.next_mgmt_cid = self.next_mgmt_cid.wrapping_add(1);
        let cid = 0xff00 | (self.next_mgmt_cid & 0xff);
        cmd.cid = cid;

        let opcode = cmd.opc;
        let mut rings = admin.lock();
        let mut req = NvmeRequest::new(cmd, None, Box::new(|_, _| {}));
        req.cmd.cid = cid;
        rings.submit(&mut req).map_err(|source| {
            CoreError::NvmeAdminDispatch {
                source,
                opcode,
            }
        })?;

        let deadline = ticks::now() + ticks::from_micros(1_000_000);
        let cpl = rings.wait_for(cid, deadline).map_err(|source| {
            CoreError::NvmeAdminDispatch {
                source,
                opcode,
            }
        })?;

        if cpl.status.is_success() {
            Ok(())
        } else {
            Err(CoreError::NvmeAdminFailed {
                opcode,
            })
        }
    }
}

impl ControllerTransport for PcieControllerTransport {
    fn alloc_qpair(
        &mut self,
        qid: u16,
        size: u32,
    ) -> Result<Box<dyn QpairTransport>, CoreError> {
        if qid == 0 {
            let rings = self.setup_admin(size)?;
            return Ok(Box::new(PcieQpair {
                rings,
                connected: false,
            }));
        }

        let rings =
            RingPair::new(qid, size, self.dstrd, Arc::clone(&self.mmio))?;

        // completion queue first, physically contiguous, no interrupts
        self.admin_mgmt_cmd(NvmeCmd {
            opc: admin_opc::CREATE_IO_CQ,
            prp1: rings.cq.phys(),
            cdw10: ((size - 1) << 16) | qid as u32,
            cdw11: 1,
            ..Default::default()
        })?;

        self.admin_mgmt_cmd(NvmeCmd {
            opc: admin_opc::CREATE_IO_SQ,
            prp1: rings.sq.phys(),
            cdw10: ((size - 1) << 16) | qid as u32,
            cdw11: ((qid as u32) << 16) | 1,
            ..Default::default()
        })?;

        debug!("{}: I/O qpair {} rings created", self.bdf, qid);
        Ok(Box::new(PcieQpair {
            rings: Arc::new(Mutex::new(rings)),
            connected: false,
        }))
    }

    fn reconnect(&mut self) -> Result<(), Errno> {
        // a controller level reset: disable and forget the rings; the
        // caller rebuilds the admin qpair which re-enables the function
        self.admin = None;
        self.disable_controller()
    }

    fn is_removed(&self) -> bool {
        !sysfs_path(&self.bdf).exists()
    }
}

impl Drop for PcieControllerTransport {
    fn drop(&mut self) {
        if self.admin.is_some() {
            let _ = self.disable_controller();
        }
        debug!("{}: PCIe transport released", self.bdf);
    }
}

#[derive(Default)]
pub struct PcieTransport {}

impl PcieTransport {
    fn list_functions() -> Vec<String> {
        let mut out = Vec::new();
        let entries = match fs::read_dir(PCI_SYSFS_ROOT) {
            Ok(entries) => entries,
            Err(_) => return out,
        };
        for entry in entries.flatten() {
            let class = entry.path().join("class");
            if let Ok(class) = fs::read_to_string(class) {
                if class.trim() == NVME_CLASS_CODE {
                    if let Some(bdf) = entry.file_name().to_str() {
                        out.push(bdf.to_string());
                    }
                }
            }
        }
        out.sort();
        out
    }
}

impl NvmeTransport for PcieTransport {
    fn trtype(&self) -> TransportType {
        TransportType::Pcie
    }

    fn enumerate(
        &self,
        trid: &NvmeTransportId,
    ) -> Result<Vec<NvmeTransportId>, CoreError> {
        let functions = Self::list_functions();
        Ok(functions
            .into_iter()
            .filter(|bdf| {
                trid.traddr.is_empty()
                    || trid.traddr.eq_ignore_ascii_case(bdf)
            })
            .map(|bdf| {
                NvmeTransportId::builder()
                    .with_trtype(TransportType::Pcie)
                    .with_traddr(&bdf)
                    .build()
            })
            .collect())
    }

    fn connect(
        &self,
        trid: &NvmeTransportId,
        _opts: &NvmeControllerOpts,
    ) -> Result<Box<dyn ControllerTransport>, CoreError> {
        Ok(Box::new(PcieControllerTransport::new(&trid.traddr)?))
    }
}
