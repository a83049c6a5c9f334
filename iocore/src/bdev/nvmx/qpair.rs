//! Queue pair state: command id allocation, in-flight request tracking,
//! completion dispatch and the reconnect protocol. The transport below
//! moves bytes; everything above (gating, accounting, retransmission)
//! lives here.

use std::collections::VecDeque;

use nix::errno::Errno;

use crate::{
    bdev::nvmx::{
        controller::TimeoutConfig,
        protocol::{NvmeCmd, NvmeCompletion, NvmeStatus},
        transport::QpairTransport,
    },
    core::{ticks, CoreError, DmaBuf},
};
use std::sync::Arc;

/// bounded retries for qpair-level reconnects
pub const DEFAULT_RECONNECT_RETRIES: u32 = 8;

pub type NvmeIoCb =
    Box<dyn FnOnce(&NvmeCompletion, Option<DmaBuf>) + Send + 'static>;

pub struct NvmeRequest {
    pub cmd: NvmeCmd,
    pub buf: Option<DmaBuf>,
    cb: Option<NvmeIoCb>,
    submit_tick: u64,
    timed_out: bool,
}

impl NvmeRequest {
    pub fn new(cmd: NvmeCmd, buf: Option<DmaBuf>, cb: NvmeIoCb) -> Self {
        Self {
            cmd,
            buf,
            cb: Some(cb),
            submit_tick: 0,
            timed_out: false,
        }
    }

    pub(crate) fn complete(mut self, cpl: &NvmeCompletion) {
        let buf = self.buf.take();
        if let Some(cb) = self.cb.take() {
            cb(cpl, buf);
        }
    }
}

impl std::fmt::Debug for NvmeRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NvmeRequest")
            .field("opc", &self.cmd.opc)
            .field("cid", &self.cmd.cid)
            .field("nsid", &self.cmd.nsid)
            .finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub enum QPairState {
    Enabled,
    Disabled,
    Disconnecting,
    Failed,
}

impl ToString for QPairState {
    fn to_string(&self) -> String {
        match *self {
            QPairState::Enabled => "Enabled",
            QPairState::Disabled => "Disabled",
            QPairState::Disconnecting => "Disconnecting",
            QPairState::Failed => "Failed",
        }
        .to_string()
    }
}

pub struct QPair {
    id: u16,
    size: u32,
    state: QPairState,
    transport: Box<dyn QpairTransport>,
    /// in-flight requests indexed by cid
    tracker: Vec<Option<NvmeRequest>>,
    free_cids: Vec<u16>,
    inflight: u32,
    /// requests detached during reset; not yet surfaced to their callers
    pending: VecDeque<NvmeRequest>,
    reconnect_attempts: u32,
    reconnect_retries: u32,
    timeout_config: Option<Arc<TimeoutConfig>>,
    cpl_buf: Vec<NvmeCompletion>,
}

impl QPair {
    pub fn new(
        id: u16,
        size: u32,
        transport: Box<dyn QpairTransport>,
    ) -> Self {
        let mut free_cids: Vec<u16> = (0 .. size as u16).collect();
        free_cids.reverse();
        let mut tracker = Vec::with_capacity(size as usize);
        tracker.resize_with(size as usize, || None);

        Self {
            id,
            size,
            state: QPairState::Disabled,
            transport,
            tracker,
            free_cids,
            inflight: 0,
            pending: VecDeque::new(),
            reconnect_attempts: 0,
            reconnect_retries: DEFAULT_RECONNECT_RETRIES,
            timeout_config: None,
            cpl_buf: Vec::with_capacity(64),
        }
    }

    pub fn with_timeout_config(
        mut self,
        cfg: Arc<TimeoutConfig>,
    ) -> Self {
        self.timeout_config = Some(cfg);
        self
    }

    pub fn id(&self) -> u16 {
        self.id
    }

    pub fn size(&self) -> u32 {
        self.size
    }

    pub fn state(&self) -> QPairState {
        self.state
    }

    pub fn requests_in_flight(&self) -> u32 {
        self.inflight
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Connect the underlying transport and start accepting submissions.
    pub fn connect(&mut self) -> Result<(), Errno> {
        self.transport.connect()?;
        self.state = QPairState::Enabled;
        Ok(())
    }

    /// true when a submission would be accepted right now
    pub fn can_submit(&self) -> bool {
        self.state == QPairState::Enabled && !self.free_cids.is_empty()
    }

    /// Submit a request. While the qpair is not enabled submissions are
    /// rejected with ENXIO; a full tracker is the ENOMEM back-pressure
    /// signal. A rejected request is dropped without its callback running;
    /// the synchronous error is the only signal.
    pub fn submit(&mut self, mut req: NvmeRequest) -> Result<(), CoreError> {
        if self.state != QPairState::Enabled {
            return Err(CoreError::QpairUnavailable {
                qid: self.id,
            });
        }

        let cid = match self.free_cids.pop() {
            Some(cid) => cid,
            None => {
                return Err(CoreError::NoMemory {
                    source: Errno::ENOMEM,
                })
            }
        };

        req.cmd.cid = cid;
        req.cmd.prp1 = req.buf.as_ref().map(|b| b.phys()).unwrap_or(0);
        req.submit_tick = ticks::now();
        req.timed_out = false;

        match self.transport.submit(&mut req) {
            Ok(()) => {
                debug_assert!(self.tracker[cid as usize].is_none());
                self.tracker[cid as usize] = Some(req);
                self.inflight += 1;
                Ok(())
            }
            Err(Errno::ENOMEM) | Err(Errno::EAGAIN) => {
                self.free_cids.push(cid);
                Err(CoreError::NoMemory {
                    source: Errno::ENOMEM,
                })
            }
            Err(_) => {
                self.free_cids.push(cid);
                Err(CoreError::QpairUnavailable {
                    qid: self.id,
                })
            }
        }
    }

    /// Reap completions and dispatch their callbacks inline. ENXIO reports
    /// transport failure; the qpair flips to `Failed` and the caller
    /// decides between a qpair level reconnect and a full controller
    /// reset.
    pub fn process_completions(&mut self, max: u32) -> Result<u32, Errno> {
        let done = self.reap(max)?;
        let count = done.len() as u32;
        for (req, cpl) in done {
            req.complete(&cpl);
        }
        Ok(count)
    }

    /// As [`QPair::process_completions`] but hands the finished requests
    /// back instead of running their callbacks, so the caller can dispatch
    /// them outside of any borrow it currently holds.
    pub(crate) fn reap(
        &mut self,
        max: u32,
    ) -> Result<Vec<(NvmeRequest, NvmeCompletion)>, Errno> {
        if self.state == QPairState::Disabled {
            return Ok(Vec::new());
        }
        if self.state == QPairState::Failed {
            return Err(Errno::ENXIO);
        }

        self.cpl_buf.clear();
        let mut completions = std::mem::take(&mut self.cpl_buf);

        let rc = self.transport.process_completions(max, &mut completions);

        if let Err(e) = rc {
            self.cpl_buf = completions;
            if e == Errno::ENXIO {
                warn!("qpair {} failed at the transport level", self.id);
                self.state = QPairState::Failed;
            }
            return Err(e);
        }

        let mut done = Vec::with_capacity(completions.len());
        for cpl in completions.iter() {
            match self.detach_cid(cpl.cid) {
                Some(req) => done.push((req, *cpl)),
                None => warn!(
                    "qpair {}: completion for unknown cid {}",
                    self.id, cpl.cid
                ),
            }
        }
        self.cpl_buf = completions;

        self.scan_timeouts();
        Ok(done)
    }

    fn detach_cid(&mut self, cid: u16) -> Option<NvmeRequest> {
        let req = self
            .tracker
            .get_mut(cid as usize)
            .and_then(|slot| slot.take())?;
        self.inflight -= 1;
        self.free_cids.push(cid);
        Some(req)
    }

    fn complete_cid(&mut self, cid: u16, cpl: &NvmeCompletion) {
        match self.detach_cid(cid) {
            Some(req) => req.complete(cpl),
            None => {
                warn!("qpair {}: completion for unknown cid {}", self.id, cid)
            }
        }
    }

    /// flag requests that sat in flight longer than the configured
    /// threshold
    fn scan_timeouts(&mut self) {
        let cfg = match self.timeout_config.as_ref() {
            Some(cfg) if cfg.timeout_enabled() => Arc::clone(cfg),
            _ => return,
        };

        let threshold = if self.id == 0 {
            cfg.admin_timeout_ticks()
        } else {
            cfg.io_timeout_ticks()
        };
        if threshold == 0 {
            return;
        }

        let now = ticks::now();
        let qid = self.id;
        for slot in self.tracker.iter_mut() {
            if let Some(req) = slot.as_mut() {
                // an asynchronous event request sits in flight by design
                if qid == 0
                    && req.cmd.opc
                        == crate::bdev::nvmx::protocol::admin_opc::ASYNC_EVENT_REQUEST
                {
                    continue;
                }
                if !req.timed_out
                    && now.saturating_sub(req.submit_tick) >= threshold
                {
                    req.timed_out = true;
                    cfg.on_timeout(qid, req.cmd.cid);
                }
            }
        }
    }

    /// Stop accepting submissions and detach all in-flight requests into
    /// the internal pending list without surfacing them to callers; part of
    /// the controller reset protocol.
    pub fn disable(&mut self) {
        if self.state == QPairState::Enabled
            || self.state == QPairState::Failed
        {
            self.state = QPairState::Disconnecting;
        }
        for cid in 0 .. self.tracker.len() {
            if let Some(req) = self.tracker[cid].take() {
                self.inflight -= 1;
                self.free_cids.push(cid as u16);
                self.pending.push_back(req);
            }
        }
        self.transport.disconnect();
        self.state = QPairState::Disabled;
    }

    /// Swap in a fresh transport ring pair; part of a controller reset,
    /// where the controller rebuilds the rings while the qpair object (and
    /// its pending list) survives.
    pub fn replace_transport(&mut self, transport: Box<dyn QpairTransport>) {
        self.transport.disconnect();
        self.transport = transport;
        self.state = QPairState::Disabled;
    }

    /// Reconnect after a transport level failure. On success requests that
    /// were tracked before the failure and have not been completed towards
    /// the caller are retransmitted. Retries are bounded; exhausting them
    /// fails the qpair permanently.
    pub fn reconnect(&mut self) -> Result<(), Errno> {
        if self.state == QPairState::Enabled {
            return Ok(());
        }

        // detach whatever is still tracked
        for cid in 0 .. self.tracker.len() {
            if let Some(req) = self.tracker[cid].take() {
                self.inflight -= 1;
                self.free_cids.push(cid as u16);
                self.pending.push_back(req);
            }
        }

        match self.transport.connect() {
            Ok(()) => {
                self.state = QPairState::Enabled;
                self.reconnect_attempts = 0;
                self.resubmit_pending();
                Ok(())
            }
            Err(e) => {
                self.reconnect_attempts += 1;
                if self.reconnect_attempts >= self.reconnect_retries {
                    error!(
                        "qpair {}: reconnect retries exhausted ({}), \
                         failing the qpair",
                        self.id, self.reconnect_retries
                    );
                    self.state = QPairState::Failed;
                    self.fail_outstanding(NvmeStatus::aborted_sq_deleted());
                    Err(Errno::EIO)
                } else {
                    Err(e)
                }
            }
        }
    }

    fn resubmit_pending(&mut self) {
        let mut requeue = std::mem::take(&mut self.pending);
        let n = requeue.len();
        while let Some(req) = requeue.pop_front() {
            // completion already went out for none of these; re-execute
            let cmd = req.cmd;
            let cid = match self.free_cids.pop() {
                Some(cid) => cid,
                None => {
                    // tracker exhausted; abort the leftovers
                    req.complete(&synthetic(
                        self.id,
                        cmd.cid,
                        NvmeStatus::aborted_sq_deleted(),
                    ));
                    continue;
                }
            };
            let mut req = req;
            req.cmd.cid = cid;
            req.submit_tick = ticks::now();
            match self.transport.submit(&mut req) {
                Ok(()) => {
                    self.tracker[cid as usize] = Some(req);
                    self.inflight += 1;
                }
                Err(_) => {
                    self.free_cids.push(cid);
                    req.complete(&synthetic(
                        self.id,
                        cid,
                        NvmeStatus::internal_error(),
                    ));
                }
            }
        }
        if n > 0 {
            info!("qpair {}: retransmitted {} requests", self.id, n);
        }
    }

    /// Complete every tracked and pending request with the given status;
    /// used when a reset runs out of budget or the device goes away.
    pub fn fail_outstanding(&mut self, status: NvmeStatus) {
        for cid in 0 .. self.tracker.len() {
            if let Some(req) = self.tracker[cid].take() {
                self.inflight -= 1;
                self.free_cids.push(cid as u16);
                req.complete(&synthetic(self.id, cid as u16, status));
            }
        }
        while let Some(req) = self.pending.pop_front() {
            let cid = req.cmd.cid;
            req.complete(&synthetic(self.id, cid, status));
        }
    }

    /// a request completed through a path outside of the ring (abort)
    pub fn complete_aborted(&mut self, cid: u16) -> bool {
        if self
            .tracker
            .get(cid as usize)
            .map(|s| s.is_some())
            .unwrap_or(false)
        {
            let cpl = synthetic(self.id, cid, NvmeStatus::aborted_by_request());
            self.complete_cid(cid, &cpl);
            true
        } else {
            false
        }
    }

    /// cids currently being tracked, oldest first; abort paths use this
    pub fn tracked_cids(&self) -> Vec<u16> {
        let mut cids: Vec<(u64, u16)> = self
            .tracker
            .iter()
            .enumerate()
            .filter_map(|(cid, slot)| {
                slot.as_ref().map(|r| (r.submit_tick, cid as u16))
            })
            .collect();
        cids.sort_unstable();
        cids.into_iter().map(|(_, cid)| cid).collect()
    }
}

impl Drop for QPair {
    fn drop(&mut self) {
        if self.inflight > 0 || !self.pending.is_empty() {
            warn!(
                "qpair {} dropped with {} in-flight and {} pending requests",
                self.id,
                self.inflight,
                self.pending.len()
            );
            self.fail_outstanding(NvmeStatus::aborted_sq_deleted());
        }
        self.transport.disconnect();
    }
}

fn synthetic(sqid: u16, cid: u16, status: NvmeStatus) -> NvmeCompletion {
    NvmeCompletion {
        cdw0: 0,
        sqid,
        cid,
        status,
    }
}
