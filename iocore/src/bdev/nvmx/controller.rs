//!
//!
//! This file contains the main structures for a NVMe controller: the
//! attach path, admin queue processing, asynchronous event handling,
//! aborts, timeout supervision and the reset/failover protocol.

use std::{
    collections::VecDeque,
    fmt,
    sync::{
        atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering},
        Arc,
    },
};

use futures::channel::oneshot;
use nix::errno::Errno;
use parking_lot::Mutex;

use crate::{
    bdev::nvmx::{
        channel::NvmeIoChannel,
        controller_state::{
            ControllerFailureReason,
            ControllerFlag,
            ControllerStateMachine,
            NvmeControllerState,
            NvmeControllerState::*,
        },
        namespace::NvmeNamespace,
        protocol::{
            admin_opc,
            identify_cns,
            log_page,
            NvmeCmd,
            NvmeCompletion,
            NvmeStatus,
            IdentifyControllerData,
            IdentifyNamespaceData,
        },
        qpair::{NvmeRequest, QPair},
        transport::{
            lookup_transport,
            ControllerTransport,
            NvmeTransportId,
            QpairTransport,
        },
        NVME_CONTROLLERS,
    },
    core::{
        io_device::{self, IoDeviceId},
        poller,
        ticks,
        CoreError,
        DeviceEventDispatcher,
        DeviceEventType,
        DmaBuf,
        IoDevice,
        Mthread,
        OpCompletionCallback,
        Poller,
    },
};

/// how long the synchronous admin helpers wait for a completion
const ADMIN_SYNC_TIMEOUT_US: u64 = 1_000_000;

/// Options a controller is attached with.
#[derive(Debug, Clone)]
pub struct NvmeControllerOpts {
    pub admin_queue_size: u32,
    pub io_queue_size: u32,
    pub admin_poll_period_us: u64,
    /// consecutive reset failures tolerated before the controller faults
    pub max_resets: u32,
    pub io_timeout_us: u64,
    pub admin_timeout_us: u64,
}

impl Default for NvmeControllerOpts {
    fn default() -> Self {
        Self {
            admin_queue_size: 32,
            io_queue_size: 256,
            admin_poll_period_us: 1_000,
            max_resets: 15,
            io_timeout_us: 0,
            admin_timeout_us: 0,
        }
    }
}

#[derive(Debug, Default)]
pub struct Builder {
    admin_queue_size: Option<u32>,
    io_queue_size: Option<u32>,
    admin_poll_period_us: Option<u64>,
    max_resets: Option<u32>,
    io_timeout_us: Option<u64>,
    admin_timeout_us: Option<u64>,
}

#[allow(dead_code)]
impl Builder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_admin_queue_size(mut self, size: u32) -> Self {
        self.admin_queue_size = Some(size);
        self
    }

    pub fn with_io_queue_size(mut self, size: u32) -> Self {
        self.io_queue_size = Some(size);
        self
    }

    pub fn with_admin_poll_period_us(mut self, period: u64) -> Self {
        self.admin_poll_period_us = Some(period);
        self
    }

    pub fn with_max_resets(mut self, resets: u32) -> Self {
        self.max_resets = Some(resets);
        self
    }

    pub fn with_timeouts(mut self, io_us: u64, admin_us: u64) -> Self {
        self.io_timeout_us = Some(io_us);
        self.admin_timeout_us = Some(admin_us);
        self
    }

    /// Builder to override default values
    pub fn build(self) -> NvmeControllerOpts {
        let mut opts = NvmeControllerOpts::default();
        if let Some(size) = self.admin_queue_size {
            opts.admin_queue_size = size;
        }
        if let Some(size) = self.io_queue_size {
            opts.io_queue_size = size;
        }
        if let Some(period) = self.admin_poll_period_us {
            opts.admin_poll_period_us = period;
        }
        if let Some(resets) = self.max_resets {
            opts.max_resets = resets;
        }
        if let Some(t) = self.io_timeout_us {
            opts.io_timeout_us = t;
        }
        if let Some(t) = self.admin_timeout_us {
            opts.admin_timeout_us = t;
        }
        opts
    }
}

pub type TimeoutCb = Arc<dyn Fn(&str, u16, u16) + Send + Sync>;

/// Timeout configuration shared between the controller and its qpairs.
/// Mutable members are atomics so the completion paths never take a lock.
pub struct TimeoutConfig {
    name: String,
    io_timeout_us: AtomicU64,
    admin_timeout_us: AtomicU64,
    cb: Mutex<Option<TimeoutCb>>,
    reset_pending: AtomicBool,
}

impl TimeoutConfig {
    fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            io_timeout_us: AtomicU64::new(0),
            admin_timeout_us: AtomicU64::new(0),
            cb: Mutex::new(None),
            reset_pending: AtomicBool::new(false),
        }
    }

    pub fn configure(
        &self,
        io_timeout_us: u64,
        admin_timeout_us: u64,
        cb: Option<TimeoutCb>,
    ) {
        self.io_timeout_us.store(io_timeout_us, Ordering::Relaxed);
        self.admin_timeout_us
            .store(admin_timeout_us, Ordering::Relaxed);
        *self.cb.lock() = cb;
    }

    pub fn timeout_enabled(&self) -> bool {
        self.io_timeout_us.load(Ordering::Relaxed) > 0
            || self.admin_timeout_us.load(Ordering::Relaxed) > 0
    }

    pub fn io_timeout_ticks(&self) -> u64 {
        ticks::from_micros(self.io_timeout_us.load(Ordering::Relaxed))
    }

    pub fn admin_timeout_ticks(&self) -> u64 {
        ticks::from_micros(self.admin_timeout_us.load(Ordering::Relaxed))
    }

    /// A command sat in flight past its deadline. The registered callback
    /// decides on the recovery action; without one the controller is reset.
    pub fn on_timeout(&self, qid: u16, cid: u16) {
        let cb = self.cb.lock().clone();
        match cb {
            Some(cb) => cb(&self.name, qid, cid),
            None => {
                warn!(
                    "{}: command timeout on qpair {} cid {}, \
                     requesting controller reset",
                    self.name, qid, cid
                );
                self.request_reset();
            }
        }
    }

    pub fn request_reset(&self) {
        self.reset_pending.store(true, Ordering::SeqCst);
    }

    pub(crate) fn take_reset_request(&self) -> bool {
        self.reset_pending.swap(false, Ordering::SeqCst)
    }
}

/// Outcome of an abort admin command: the device either aborted the target
/// command (cdw0 bit 0 clear), declined (bit set), or the abort itself
/// failed at the transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AbortOutcome {
    Successful,
    Unsuccessful,
    Failed,
}

pub type AerCb = Arc<dyn Fn(&str, &NvmeCompletion) + Send + Sync>;

struct ResetCtx {
    name: String,
    cb: Option<OpCompletionCallback>,
    failover: bool,
    device: Option<IoDeviceId>,
}

struct ShutdownCtx {
    name: String,
    cb: Option<OpCompletionCallback>,
}

pub(crate) struct NvmeControllerInner {
    pub(crate) transport: Box<dyn ControllerTransport>,
    pub(crate) admin: QPair,
    namespaces: Vec<Arc<NvmeNamespace>>,
    io_device: Option<IoDevice>,
    device_id: Option<IoDeviceId>,
    adminq_poller: Option<Poller>,
    next_qid: u16,
    cdata: IdentifyControllerData,
}

/*
 * NVME controller implementation.
 */
pub struct NvmeController {
    pub(crate) name: String,
    id: u64,
    trid: NvmeTransportId,
    opts: NvmeControllerOpts,
    state_machine: ControllerStateMachine,
    inner: Option<NvmeControllerInner>,
    timeout_config: Arc<TimeoutConfig>,
    event_dispatcher: DeviceEventDispatcher,
    aer_callbacks: Vec<AerCb>,
    aer_queue: Arc<Mutex<VecDeque<NvmeCompletion>>>,
    aer_inflight: Arc<AtomicBool>,
    num_resets: u32,
    outstanding_aborts: Arc<AtomicU32>,
    is_removed: bool,
}

impl fmt::Debug for NvmeController {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NvmeController")
            .field("name", &self.name)
            .field("state_machine", &self.state_machine)
            .field("num_resets", &self.num_resets)
            .finish()
    }
}

// The admin poller handle inside `inner` is only ever touched from the
// thread that attached the controller; everything else is either owned or
// synchronized.
unsafe impl Send for NvmeController {}

impl NvmeController {
    /// Creates a new NVMe controller for the given transport id.
    pub fn new(trid: NvmeTransportId, opts: NvmeControllerOpts) -> Self {
        let name = trid.to_string();
        let l = NvmeController {
            name: name.clone(),
            id: 0,
            trid,
            opts,
            state_machine: ControllerStateMachine::new(&name),
            inner: None,
            timeout_config: Arc::new(TimeoutConfig::new(&name)),
            event_dispatcher: DeviceEventDispatcher::new(),
            aer_callbacks: Vec::new(),
            aer_queue: Arc::new(Mutex::new(VecDeque::new())),
            aer_inflight: Arc::new(AtomicBool::new(false)),
            num_resets: 0,
            outstanding_aborts: Arc::new(AtomicU32::new(0)),
            is_removed: false,
        };

        debug!("{}: new NVMe controller created", l.name);
        l
    }

    /// returns the name of the current controller
    pub fn get_name(&self) -> String {
        self.name.clone()
    }

    /// returns the ID of the controller, set when attached
    pub fn id(&self) -> u64 {
        self.id
    }

    fn set_id(&mut self, id: u64) {
        assert_ne!(id, 0, "controller ID can't be zero");
        self.id = id;
        debug!("{} ID set to 0x{:X}", self.name, self.id);
    }

    /// Get controller state.
    pub fn get_state(&self) -> NvmeControllerState {
        self.state_machine.current_state()
    }

    pub fn transport_id(&self) -> &NvmeTransportId {
        &self.trid
    }

    pub fn opts(&self) -> &NvmeControllerOpts {
        &self.opts
    }

    /// consecutive failed resets so far
    pub fn reset_count(&self) -> u32 {
        self.num_resets
    }

    pub fn timeout_config(&self) -> Arc<TimeoutConfig> {
        Arc::clone(&self.timeout_config)
    }

    /// identify data of the attached controller
    pub fn controller_data(&self) -> Option<&IdentifyControllerData> {
        self.inner.as_ref().map(|i| &i.cdata)
    }

    /// the device has been hot-removed at the transport level
    pub fn is_removed(&self) -> bool {
        self.is_removed
    }

    pub(crate) fn mark_removed(&mut self) {
        self.is_removed = true;
    }

    // As of now, only the first namespace is exposed as a block device.
    pub fn namespace(&self) -> Option<Arc<NvmeNamespace>> {
        let inner = self
            .inner
            .as_ref()
            .expect("(BUG) no inner NVMe controller defined yet");

        if let Some(ns) = inner.namespaces.get(0) {
            Some(Arc::clone(ns))
        } else {
            debug!("no namespaces associated with the current controller");
            None
        }
    }

    pub fn namespaces(&self) -> Vec<Arc<NvmeNamespace>> {
        self.inner
            .as_ref()
            .map(|i| i.namespaces.clone())
            .unwrap_or_default()
    }

    /// the I/O device whose channels carry the controller's qpairs
    pub fn device_id(&self) -> Option<IoDeviceId> {
        self.inner.as_ref().and_then(|i| i.device_id)
    }

    /// Register listener to monitor device events related to this
    /// controller.
    pub fn add_event_listener(&self, listener: fn(DeviceEventType, &str)) {
        self.event_dispatcher.add_listener(listener);
        debug!("{} added event listener", self.name);
    }

    pub(crate) fn notify_event(&self, event: DeviceEventType) -> usize {
        self.event_dispatcher.dispatch(event, &self.name)
    }

    /// Register a callback invoked for every asynchronous event the
    /// controller reports. The driver keeps an AER command in flight and
    /// re-arms it after fan-out.
    pub fn register_aer_callback(&mut self, cb: AerCb) {
        self.aer_callbacks.push(cb);
    }

    /// Per-command timeout supervision; scanning happens while completions
    /// are processed.
    pub fn register_timeout_callback(
        &self,
        io_timeout_us: u64,
        admin_timeout_us: u64,
        cb: Option<TimeoutCb>,
    ) {
        self.timeout_config
            .configure(io_timeout_us, admin_timeout_us, cb);
        info!(
            "{} timeout supervision configured (io: {} us, admin: {} us)",
            self.name, io_timeout_us, admin_timeout_us
        );
    }

    /// Connect the transport, bring up the admin qpair and identify the
    /// controller and its namespaces.
    pub(crate) fn connect_internal(&mut self) -> Result<(), CoreError> {
        let transport = lookup_transport(self.trid.trtype)?;
        let mut ctrlr_transport = transport.connect(&self.trid, &self.opts)?;

        let admin_transport =
            ctrlr_transport.alloc_qpair(0, self.opts.admin_queue_size)?;
        let mut admin =
            QPair::new(0, self.opts.admin_queue_size, admin_transport)
                .with_timeout_config(Arc::clone(&self.timeout_config));
        admin.connect().map_err(|source| CoreError::ConnectFailed {
            source,
            target: self.name.clone(),
        })?;

        self.state_machine
            .transition(Initializing)
            .expect("failed to transition controller into Initializing state");

        self.inner = Some(NvmeControllerInner {
            transport: ctrlr_transport,
            admin,
            namespaces: Vec::new(),
            io_device: None,
            device_id: None,
            adminq_poller: None,
            next_qid: 1,
            cdata: IdentifyControllerData::default(),
        });

        if let Err(e) = self.identify_controller() {
            let _ = self
                .state_machine
                .transition(Faulted(ControllerFailureReason::NamespaceInit));
            return Err(e);
        }
        if let Err(e) = self.populate_namespaces() {
            let _ = self
                .state_machine
                .transition(Faulted(ControllerFailureReason::NamespaceInit));
            return Err(e);
        }

        if self.opts.io_timeout_us > 0 || self.opts.admin_timeout_us > 0 {
            self.timeout_config.configure(
                self.opts.io_timeout_us,
                self.opts.admin_timeout_us,
                None,
            );
        }

        self.set_id(ticks::now() | 1);
        self.state_machine
            .transition(Running)
            .expect("failed to transition controller into Running state");
        Ok(())
    }

    /// Issue an admin command and poll the admin queue until it completes.
    /// Only used on attach and reset paths where nothing else owns the
    /// admin queue.
    fn admin_sync(
        &mut self,
        cmd: NvmeCmd,
        buf: Option<DmaBuf>,
    ) -> Result<(NvmeCompletion, Option<DmaBuf>), CoreError> {
        let opcode = cmd.opc;
        let result: Arc<Mutex<Option<(NvmeCompletion, Option<DmaBuf>)>>> =
            Arc::new(Mutex::new(None));
        let waiter = Arc::clone(&result);

        let inner = self
            .inner
            .as_mut()
            .expect("(BUG) no inner NVMe controller defined yet");

        inner
            .admin
            .submit(NvmeRequest::new(
                cmd,
                buf,
                Box::new(move |cpl, buf| {
                    *waiter.lock() = Some((*cpl, buf));
                }),
            ))
            .map_err(|_| CoreError::NvmeAdminDispatch {
                source: Errno::ENXIO,
                opcode,
            })?;

        let deadline =
            ticks::now() + ticks::from_micros(ADMIN_SYNC_TIMEOUT_US);
        loop {
            inner.admin.process_completions(0).map_err(|source| {
                CoreError::NvmeAdminDispatch {
                    source,
                    opcode,
                }
            })?;

            if let Some((cpl, buf)) = result.lock().take() {
                if cpl.status.is_success() {
                    return Ok((cpl, buf));
                }
                return Err(CoreError::NvmeAdminFailed {
                    opcode,
                });
            }

            if ticks::now() > deadline {
                return Err(CoreError::NvmeAdminDispatch {
                    source: Errno::ETIMEDOUT,
                    opcode,
                });
            }
            std::hint::spin_loop();
        }
    }

    fn identify_controller(&mut self) -> Result<(), CoreError> {
        let buf = DmaBuf::new(4096, 12).map_err(|_| {
            CoreError::DmaAllocationFailed {
                size: 4096,
            }
        })?;
        let cmd = NvmeCmd {
            opc: admin_opc::IDENTIFY,
            cdw10: identify_cns::CONTROLLER as u32,
            ..Default::default()
        };

        let (_cpl, buf) = self.admin_sync(cmd, Some(buf))?;
        let buf = buf.expect("identify payload went missing");
        let cdata = IdentifyControllerData::parse(buf.as_slice());
        info!(
            "{}: identified controller '{}' (sn '{}', {} namespaces)",
            self.name, cdata.mn, cdata.sn, cdata.nn
        );
        self.inner.as_mut().unwrap().cdata = cdata;
        Ok(())
    }

    fn identify_namespace(
        &mut self,
        nsid: u32,
    ) -> Result<IdentifyNamespaceData, CoreError> {
        let buf = DmaBuf::new(4096, 12).map_err(|_| {
            CoreError::DmaAllocationFailed {
                size: 4096,
            }
        })?;
        let cmd = NvmeCmd {
            opc: admin_opc::IDENTIFY,
            nsid,
            cdw10: identify_cns::NAMESPACE as u32,
            ..Default::default()
        };
        let (_cpl, buf) = self.admin_sync(cmd, Some(buf))?;
        Ok(IdentifyNamespaceData::parse(
            buf.expect("identify payload went missing").as_slice(),
        ))
    }

    /// populate namespaces; inactive ones (zero size) are skipped
    fn populate_namespaces(&mut self) -> Result<(), CoreError> {
        let nn = self.inner.as_ref().unwrap().cdata.nn;
        let mut namespaces = Vec::new();

        for nsid in 1 ..= nn {
            match self.identify_namespace(nsid) {
                Ok(data) if data.nsze > 0 => {
                    namespaces
                        .push(Arc::new(NvmeNamespace::from_identify(nsid, &data)));
                }
                Ok(_) => debug!("{}: namespace {} inactive", self.name, nsid),
                Err(e) => {
                    warn!(
                        "{}: identify namespace {} failed: {}",
                        self.name, nsid, e
                    );
                }
            }
        }

        if namespaces.is_empty() {
            warn!("{} no namespaces reported by the NVMe controller", self.name);
        }
        self.inner.as_mut().unwrap().namespaces = namespaces;
        Ok(())
    }

    /// keep one asynchronous event request in flight
    pub(crate) fn arm_aer(&mut self) -> Result<(), CoreError> {
        if self.aer_inflight.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let queue = Arc::clone(&self.aer_queue);
        let inflight = Arc::clone(&self.aer_inflight);
        let inflight_err = Arc::clone(&self.aer_inflight);
        let cmd = NvmeCmd {
            opc: admin_opc::ASYNC_EVENT_REQUEST,
            ..Default::default()
        };

        let inner = self
            .inner
            .as_mut()
            .expect("(BUG) no inner NVMe controller defined yet");
        inner
            .admin
            .submit(NvmeRequest::new(
                cmd,
                None,
                Box::new(move |cpl, _| {
                    inflight.store(false, Ordering::SeqCst);
                    queue.lock().push_back(*cpl);
                }),
            ))
            .map_err(|e| {
                inflight_err.store(false, Ordering::SeqCst);
                e
            })?;
        debug!("{}: AER armed", self.name);
        Ok(())
    }

    /// Fetch the log page an asynchronous event pointed at; fire and
    /// forget, the payload is only logged here. Discovery controllers
    /// answer with the discovery log.
    fn fetch_log_page(&mut self, lid: u8) {
        let buf = match DmaBuf::new(4096, 12) {
            Ok(buf) => buf,
            Err(_) => return,
        };
        let name = self.name.clone();
        let cmd = NvmeCmd {
            opc: admin_opc::GET_LOG_PAGE,
            // dwords, zero based, and the log page id
            cdw10: ((4096 / 4 - 1) << 16) as u32 | lid as u32,
            ..Default::default()
        };

        let inner = self.inner.as_mut().unwrap();
        let _ = inner.admin.submit(NvmeRequest::new(
            cmd,
            Some(buf),
            Box::new(move |cpl, _buf| {
                if cpl.status.is_success() {
                    info!("{}: log page {:#x} fetched", name, lid);
                } else {
                    warn!("{}: log page {:#x} fetch failed", name, lid);
                }
            }),
        ));
    }

    /// One pass of admin queue processing. Returns the work count, the
    /// asynchronous events to fan out (after the caller drops the lock)
    /// and whether a reset must be initiated.
    pub(crate) fn poll_admin_once(
        &mut self,
    ) -> (i32, Vec<NvmeCompletion>, bool) {
        let mut need_reset = false;

        let work = match self.state_machine.current_state() {
            Running => {
                let inner = match self.inner.as_mut() {
                    Some(inner) => inner,
                    None => return (0, Vec::new(), false),
                };
                match inner.admin.process_completions(0) {
                    Ok(n) => n as i32,
                    Err(Errno::ENXIO) => {
                        warn!(
                            "{}: admin queue failed at the transport level",
                            self.name
                        );
                        need_reset = true;
                        0
                    }
                    Err(e) => {
                        warn!("{}: admin queue error: {}", self.name, e);
                        0
                    }
                }
            }
            _ => 0,
        };

        if self.timeout_config.take_reset_request() {
            need_reset = true;
        }

        let mut events = Vec::new();
        loop {
            let cpl = match self.aer_queue.lock().pop_front() {
                Some(cpl) => cpl,
                None => break,
            };
            if cpl.status.is_aborted() {
                // reset path cancelled the AER; it re-arms afterwards
                continue;
            }
            let lid = cpl.aer_log_page();
            if self.trid.is_discovery() && lid == log_page::DISCOVERY {
                self.fetch_log_page(lid);
            }
            events.push(cpl);
            if self.state_machine.current_state() == Running {
                let _ = self.arm_aer();
            }
        }

        (work, events, need_reset)
    }

    pub(crate) fn aer_callbacks(&self) -> Vec<AerCb> {
        self.aer_callbacks.clone()
    }

    /// Submit an abort for the command `cid` on the given qpair (admin
    /// qpair when None). The callback reports whether the device aborted
    /// the command, declined, or the abort itself failed.
    pub fn cmd_abort(
        &mut self,
        qid: Option<u16>,
        cid: u16,
        cb: impl FnOnce(AbortOutcome) + Send + 'static,
    ) -> Result<(), CoreError> {
        let name = self.name.clone();
        let inner = self
            .inner
            .as_mut()
            .ok_or_else(|| CoreError::ControllerFailed { name })?;

        // the device advertises how many aborts it can take (zero based)
        let limit = inner.cdata.acl as u32 + 1;
        if self.outstanding_aborts.load(Ordering::SeqCst) >= limit {
            return Err(CoreError::NoMemory {
                source: Errno::EAGAIN,
            });
        }

        let sqid = qid.unwrap_or(0);
        let cmd = NvmeCmd {
            opc: admin_opc::ABORT,
            cdw10: (sqid as u32) | ((cid as u32) << 16),
            ..Default::default()
        };

        self.outstanding_aborts.fetch_add(1, Ordering::SeqCst);
        let outstanding = Arc::clone(&self.outstanding_aborts);
        let outstanding_err = Arc::clone(&self.outstanding_aborts);

        inner
            .admin
            .submit(NvmeRequest::new(
                cmd,
                None,
                Box::new(move |cpl, _| {
                    outstanding.fetch_sub(1, Ordering::SeqCst);
                    let outcome = if !cpl.status.is_success() {
                        AbortOutcome::Failed
                    } else if cpl.cdw0 & 1 == 0 {
                        AbortOutcome::Successful
                    } else {
                        AbortOutcome::Unsuccessful
                    };
                    cb(outcome);
                }),
            ))
            .map_err(|e| {
                outstanding_err.fetch_sub(1, Ordering::SeqCst);
                e
            })
    }

    /// allocate the transport rings for a new I/O qpair
    pub(crate) fn alloc_io_qpair_transport(
        &mut self,
    ) -> Result<(u16, Box<dyn QpairTransport>), CoreError> {
        let name = self.name.clone();
        let inner = self
            .inner
            .as_mut()
            .ok_or_else(|| CoreError::ControllerFailed { name })?;
        let qid = inner.next_qid;
        inner.next_qid += 1;
        let t = inner.transport.alloc_qpair(qid, self.opts.io_queue_size)?;
        Ok((qid, t))
    }

    /// rebuild the rings of an existing qpair after a reset
    pub(crate) fn realloc_io_qpair_transport(
        &mut self,
        qid: u16,
    ) -> Result<Box<dyn QpairTransport>, CoreError> {
        let name = self.name.clone();
        let inner = self
            .inner
            .as_mut()
            .ok_or_else(|| CoreError::ControllerFailed { name })?;
        inner.transport.alloc_qpair(qid, self.opts.io_queue_size)
    }

    pub(crate) fn set_io_device(&mut self, device: IoDevice) {
        let inner = self.inner.as_mut().unwrap();
        inner.device_id = Some(device.id());
        inner.io_device = Some(device);
    }

    pub(crate) fn set_adminq_poller(&mut self, poller: Poller) {
        self.inner.as_mut().unwrap().adminq_poller = Some(poller);
    }

    /// Reset the controller. All I/O qpairs are disabled first (their
    /// in-flight requests move to internal pending lists), then the
    /// transport is reconnected (failing over to the alternative address if
    /// one is configured), identify is reissued and the qpairs are
    /// reconnected one by one. Consecutive failures beyond the configured
    /// budget fault the controller.
    pub fn reset(
        &mut self,
        cb: OpCompletionCallback,
        failover: bool,
    ) -> Result<(), CoreError> {
        match self.state_machine.current_state() {
            Running | Faulted(_) => {}
            state => {
                error!(
                    "{} controller is in '{:?}' state, reset not possible",
                    self.name, state
                );
                return Err(CoreError::ControllerBusy {
                    name: self.name.clone(),
                });
            }
        }

        self.state_machine
            .set_flag_exclusively(ControllerFlag::ResetActive)
            .map_err(|_| {
                error!("{} reset already in progress", self.name);
                CoreError::ControllerBusy {
                    name: self.name.clone(),
                }
            })?;

        self.state_machine
            .transition(Resetting)
            .expect("failed to transition controller into Resetting state");

        info!(
            "{} initiating controller reset, failover = {}",
            self.name, failover
        );

        let ctx = ResetCtx {
            name: self.name.clone(),
            cb: Some(cb),
            failover,
            device: self.device_id(),
        };

        Self::start_reset_attempt(ctx);
        Ok(())
    }

    /// One reset attempt; never takes the controller lock itself so it can
    /// be kicked off while the caller still holds it.
    fn start_reset_attempt(ctx: ResetCtx) {
        let device = ctx.device;

        match device {
            Some(device) => {
                // 1. disable all I/O channels, then reconnect the admin path
                let res = io_device::traverse_io_channels::<NvmeIoChannel, ResetCtx>(
                    device,
                    NvmeController::_reset_destroy_channels,
                    NvmeController::_reset_destroy_channels_done,
                    ctx,
                );
                if let Err(e) = res {
                    error!("reset channel traversal failed to start: {}", e);
                }
            }
            None => {
                // no channels yet; the reconnect phase runs from the
                // message loop as the caller may still hold the controller
                defer(|| NvmeController::_reset_reconnect_phase(ctx));
            }
        }
    }

    fn _reset_destroy_channels(
        channel: &mut NvmeIoChannel,
        _ctx: &mut ResetCtx,
    ) -> i32 {
        debug!("disabling I/O channel qpair for reset");
        channel.disable();
        0
    }

    fn _reset_destroy_channels_done(status: i32, ctx: ResetCtx) {
        if status != 0 {
            error!(
                "{}: failed to disable I/O channels, status = {}",
                ctx.name, status
            );
            NvmeController::_reset_attempt_failed(ctx);
            return;
        }
        info!("{}: all I/O channels disabled for reset", ctx.name);
        NvmeController::_reset_reconnect_phase(ctx);
    }

    fn _reset_reconnect_phase(mut ctx: ResetCtx) {
        let carc = match NVME_CONTROLLERS.lookup_by_name(&ctx.name) {
            Some(c) => c,
            None => {
                warn!("{}: controller disappeared during reset", ctx.name);
                NvmeController::_complete_reset(ctx, -1);
                return;
            }
        };

        let reconnected = {
            let mut controller = carc.lock();
            let failover = ctx.failover;
            // failover swaps once; retries reconnect whatever is current
            ctx.failover = false;
            controller.try_reconnect_admin(failover)
        };

        if !reconnected {
            NvmeController::_reset_attempt_failed(ctx);
            return;
        }

        let device = carc.lock().device_id();
        match device {
            Some(device) => {
                let res = io_device::traverse_io_channels::<NvmeIoChannel, ResetCtx>(
                    device,
                    NvmeController::_reset_create_channels,
                    NvmeController::_reset_create_channels_done,
                    ctx,
                );
                if let Err(e) = res {
                    error!("reset channel traversal failed to start: {}", e);
                }
            }
            None => NvmeController::_reset_create_channels_done(0, ctx),
        }
    }

    fn _reset_create_channels(
        channel: &mut NvmeIoChannel,
        ctx: &mut ResetCtx,
    ) -> i32 {
        debug!("reinitializing I/O channel after reset");
        channel.reinitialize(&ctx.name)
    }

    fn _reset_create_channels_done(status: i32, ctx: ResetCtx) {
        if status != 0 {
            error!(
                "{}: failed to reinitialize I/O channels, status = {}",
                ctx.name, status
            );
            NvmeController::_reset_attempt_failed(ctx);
            return;
        }

        if let Some(carc) = NVME_CONTROLLERS.lookup_by_name(&ctx.name) {
            let mut controller = carc.lock();
            controller.num_resets = 0;
            let _ = controller.state_machine.transition(Running);
            let _ = controller.arm_aer();
            info!("{}: controller successfully reset", ctx.name);
        }
        NvmeController::_complete_reset(ctx, 0);
    }

    fn _reset_attempt_failed(ctx: ResetCtx) {
        let carc = match NVME_CONTROLLERS.lookup_by_name(&ctx.name) {
            Some(c) => c,
            None => {
                NvmeController::_complete_reset(ctx, -1);
                return;
            }
        };

        let exhausted = {
            let mut controller = carc.lock();
            controller.num_resets += 1;
            warn!(
                "{}: reset attempt {} of {} failed",
                ctx.name, controller.num_resets, controller.opts.max_resets
            );
            controller.num_resets >= controller.opts.max_resets
        };

        if exhausted {
            error!(
                "{}: reset budget exhausted, failing the controller",
                ctx.name
            );
            {
                let mut controller = carc.lock();
                let _ = controller
                    .state_machine
                    .transition(Faulted(ControllerFailureReason::ResetFailed));
                controller.fail_admin_outstanding();
            }
            // surface `aborted` to every still-outstanding request
            let device = carc.lock().device_id();
            match device {
                Some(device) => {
                    let res =
                        io_device::traverse_io_channels::<NvmeIoChannel, ResetCtx>(
                            device,
                            |channel, _ctx| {
                                channel.fail_outstanding();
                                0
                            },
                            |_, ctx| {
                                NvmeController::_complete_reset(ctx, -1);
                            },
                            ctx,
                        );
                    if let Err(e) = res {
                        error!("failed to abort outstanding I/O: {}", e);
                    }
                }
                None => NvmeController::_complete_reset(ctx, -1),
            }
        } else {
            // schedule the next attempt from the message loop so the
            // reactor keeps breathing between attempts
            if let Some(thread) = Mthread::current() {
                let res = thread
                    .send_msg(move || NvmeController::start_reset_attempt(ctx));
                if let Err(e) = res {
                    error!("failed to schedule reset retry: {}", e);
                }
            } else {
                NvmeController::start_reset_attempt(ctx);
            }
        }
    }

    fn _complete_reset(mut ctx: ResetCtx, status: i32) {
        if let Some(carc) = NVME_CONTROLLERS.lookup_by_name(&ctx.name) {
            let controller = carc.lock();
            let _ = controller
                .state_machine
                .clear_flag_exclusively(ControllerFlag::ResetActive);
        }
        if let Some(cb) = ctx.cb.take() {
            cb(status == 0);
        }
    }

    fn fail_admin_outstanding(&mut self) {
        if let Some(inner) = self.inner.as_mut() {
            inner.admin.fail_outstanding(NvmeStatus::aborted_sq_deleted());
        }
    }

    /// Reconnect the controller-level transport (with an optional failover
    /// address swap), rebuild the admin qpair and re-identify.
    fn try_reconnect_admin(&mut self, failover: bool) -> bool {
        if failover {
            if self.trid.swap_alt_traddr() {
                info!(
                    "{}: failing over to alternative address {}",
                    self.name, self.trid.traddr
                );
            }
        }

        let full_reconnect = failover
            || self
                .inner
                .as_mut()
                .map(|i| i.transport.reconnect().is_err())
                .unwrap_or(true);

        if full_reconnect {
            let transport = match lookup_transport(self.trid.trtype) {
                Ok(t) => t,
                Err(e) => {
                    error!("{}: {}", self.name, e);
                    return false;
                }
            };
            match transport.connect(&self.trid, &self.opts) {
                Ok(t) => {
                    if let Some(inner) = self.inner.as_mut() {
                        inner.transport = t;
                    }
                }
                Err(e) => {
                    warn!("{}: transport reconnect failed: {}", self.name, e);
                    return false;
                }
            }
        }

        // rebuild the admin rings on the fresh transport
        let admin_transport = {
            let inner = self.inner.as_mut().unwrap();
            match inner.transport.alloc_qpair(0, self.opts.admin_queue_size) {
                Ok(t) => t,
                Err(e) => {
                    warn!(
                        "{}: failed to rebuild the admin qpair: {}",
                        self.name, e
                    );
                    return false;
                }
            }
        };
        {
            let inner = self.inner.as_mut().unwrap();
            // whatever was still on the admin queue (the AER included)
            // completes aborted before the rings are swapped
            inner.admin.fail_outstanding(NvmeStatus::aborted_sq_deleted());
            inner.admin.replace_transport(admin_transport);
            if let Err(e) = inner.admin.connect() {
                warn!("{}: admin qpair reconnect failed: {}", self.name, e);
                return false;
            }
        }

        // identify must succeed before I/O qpairs are brought back
        self.aer_inflight.store(false, Ordering::SeqCst);
        match self.identify_controller() {
            Ok(()) => true,
            Err(e) => {
                warn!("{}: identify after reset failed: {}", self.name, e);
                false
            }
        }
    }

    /// Shutdown the controller and all its resources: I/O channels are
    /// drained and their qpairs torn down, outstanding admin commands
    /// complete aborted and the admin poller stops.
    pub fn shutdown(
        &mut self,
        cb: OpCompletionCallback,
    ) -> Result<(), CoreError> {
        self.state_machine.transition(Unconfiguring).map_err(|_| {
            error!(
                "{} controller is in {:?} state, cannot shutdown",
                self.name,
                self.state_machine.current_state(),
            );
            CoreError::ControllerBusy {
                name: self.name.clone(),
            }
        })?;

        info!("{} shutting down the controller", self.name);

        let ctx = ShutdownCtx {
            name: self.get_name(),
            cb: Some(cb),
        };

        let device = self.device_id();
        match device {
            Some(device) => {
                let res = io_device::traverse_io_channels::<
                    NvmeIoChannel,
                    ShutdownCtx,
                >(
                    device,
                    NvmeController::_shutdown_channels,
                    NvmeController::_shutdown_channels_done,
                    ctx,
                );
                if let Err(e) = res {
                    error!("shutdown channel traversal failed to start: {}", e);
                }
            }
            None => {
                defer(|| NvmeController::_shutdown_channels_done(0, ctx))
            }
        }
        Ok(())
    }

    fn _shutdown_channels(
        channel: &mut NvmeIoChannel,
        ctx: &mut ShutdownCtx,
    ) -> i32 {
        debug!("{} shutting down I/O channel", ctx.name);
        channel.shutdown();
        0
    }

    fn _shutdown_channels_done(result: i32, mut ctx: ShutdownCtx) {
        info!("{} all I/O channels shut down", ctx.name);

        if let Some(carc) = NVME_CONTROLLERS.lookup_by_name(&ctx.name) {
            let mut controller = carc.lock();
            controller.fail_admin_outstanding();
            if let Some(inner) = controller.inner.as_mut() {
                if let Some(poller) = inner.adminq_poller.take() {
                    poller.stop();
                }
                if let Some(device) = inner.io_device.take() {
                    device.unregister(None);
                }
            }
            let _ = controller.state_machine.transition(Unconfigured);
            info!("{} shutdown complete, result = {}", ctx.name, result);
        }

        if let Some(cb) = ctx.cb.take() {
            cb(result == 0);
        }
    }
}

impl Drop for NvmeController {
    fn drop(&mut self) {
        let curr_state = self.get_state();
        debug!("{} dropping controller (state={:?})", self.name, curr_state);

        if !matches!(curr_state, New | Unconfigured | Faulted(_)) {
            warn!(
                "{} dropping active controller in {:?} state",
                self.name, curr_state
            );
        }

        if let Some(mut inner) = self.inner.take() {
            if let Some(poller) = inner.adminq_poller.take() {
                poller.stop();
            }
            if let Some(device) = inner.io_device.take() {
                device.unregister(None);
            }
        }
    }
}

/// Run `f` from the current thread's message loop rather than inline, so
/// whatever locks the caller holds have been released by the time it runs.
fn defer(f: impl FnOnce() + Send + 'static) {
    match Mthread::current() {
        Some(thread) => {
            if let Err(e) = thread.send_msg(f) {
                error!("failed to defer controller work: {}", e);
            }
        }
        None => f(),
    }
}

/// Process admin completions for the named controller; the poll function of
/// the per-controller admin poller. Transport failure triggers a reset.
pub(crate) fn nvme_poll_adminq(name: &str) -> i32 {
    let carc = match NVME_CONTROLLERS.lookup_by_name(name) {
        Some(c) => c,
        None => return 0,
    };

    let (work, events, need_reset, callbacks) = {
        let mut controller = carc.lock();
        let (work, events, need_reset) = controller.poll_admin_once();
        let callbacks = controller.aer_callbacks();
        (work, events, need_reset, callbacks)
    };

    // fan out events without holding the controller lock
    for cpl in events.iter() {
        for cb in callbacks.iter() {
            cb(name, cpl);
        }
    }

    if need_reset {
        let mut controller = carc.lock();
        let res = controller.reset(
            Box::new(|success| {
                if !success {
                    error!("controller reset triggered by admin poll failed");
                }
            }),
            false,
        );
        if let Err(e) = res {
            debug!("reset not dispatched: {}", e);
        }
        return 1;
    }

    if work > 0 || !events.is_empty() {
        1
    } else {
        0
    }
}

/// Destroy target controller and notify all listeners about device removal.
pub async fn destroy_device(name: String) -> Result<(), CoreError> {
    let carc = NVME_CONTROLLERS.lookup_by_name(&name).ok_or(
        CoreError::BdevNotFound {
            name: name.clone(),
        },
    )?;

    // 1. Initiate controller shutdown, which shuts down all I/O resources
    // of the controller.
    let (s, r) = oneshot::channel::<bool>();
    {
        let mut controller = carc.lock();
        controller.shutdown(Box::new(move |success| {
            let _ = s.send(success);
        }))?;
    }

    if !r.await.expect("failed awaiting at shutdown()") {
        error!("{}: failed to shutdown controller", name);
        return Err(CoreError::ControllerFailed {
            name,
        });
    }

    // 2. Remove controller from the list so that a new controller with the
    // same name can be inserted.
    if NVME_CONTROLLERS.remove_by_name(&name).is_none() {
        warn!("{}: no controller record found, proceeding with removal", name);
    } else {
        debug!("{}: removed from controller list", name);
    }

    // Notify the listeners.
    debug!("{}: notifying listeners about device removal", name);
    let num_listeners = {
        let controller = carc.lock();
        controller.notify_event(DeviceEventType::DeviceRemoved)
    };
    debug!(
        "{}: {} listeners notified about device removal",
        name, num_listeners
    );

    Ok(())
}

/// Attach a controller: connect, identify, expose the channel device,
/// start admin polling and arm the first AER.
pub(crate) fn connect_controller(
    trid: &NvmeTransportId,
    opts: NvmeControllerOpts,
) -> Result<Arc<Mutex<NvmeController>>, CoreError> {
    let name = trid.to_string();
    if NVME_CONTROLLERS.lookup_by_name(&name).is_some() {
        return Err(CoreError::ControllerBusy {
            name,
        });
    }

    let mut controller = NvmeController::new(trid.clone(), opts.clone());
    controller.connect_internal()?;

    // expose the per-core channels
    let cname = name.clone();
    let device = IoDevice::register::<NvmeIoChannel>(
        &name,
        move |id| NvmeIoChannel::new(id, cname.clone()),
        |_, chan| chan.shutdown_ctx(),
    );
    controller.set_io_device(device);

    let carc = Arc::new(Mutex::new(controller));
    NVME_CONTROLLERS.insert_controller(name.clone(), Arc::clone(&carc));

    // admin queue processing runs on the attaching thread
    let pname = name.clone();
    let poller = poller::Builder::new()
        .with_name("nvme_poll_adminq")
        .with_interval(opts.admin_poll_period_us)
        .with_poll_fn(move || nvme_poll_adminq(&pname))
        .build();

    {
        let mut controller = carc.lock();
        controller.set_adminq_poller(poller);
        if let Err(e) = controller.arm_aer() {
            warn!("{}: failed to arm AER: {}", name, e);
        }
    }

    info!("{}: controller attached", name);
    Ok(carc)
}
