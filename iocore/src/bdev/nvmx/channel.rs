/* I/O channel for NVMe controller, one per core. */

use nix::errno::Errno;

use crate::{
    bdev::nvmx::{
        controller_state::NvmeControllerState,
        qpair::QPair,
        NVME_CONTROLLERS,
    },
    core::{io_device, io_device::IoDeviceId, Poller},
};

/// Per-core channel of an NVMe controller: one I/O qpair plus the poller
/// that reaps its completions. The qpair object survives controller resets;
/// only its transport rings are swapped underneath it.
pub struct NvmeIoChannel {
    ctrlr_name: String,
    qid: u16,
    qpair: Option<QPair>,
    _poller: Poller,
}

impl NvmeIoChannel {
    pub(crate) fn new(
        device: IoDeviceId,
        ctrlr_name: String,
    ) -> Result<Self, Errno> {
        let carc = NVME_CONTROLLERS
            .lookup_by_name(&ctrlr_name)
            .ok_or(Errno::ENODEV)?;

        let (qid, transport, size, timeout_config) = {
            let mut controller = carc.lock();
            if controller.get_state() != NvmeControllerState::Running {
                return Err(Errno::ENXIO);
            }
            let (qid, transport) = controller
                .alloc_io_qpair_transport()
                .map_err(|_| Errno::ENOMEM)?;
            (
                qid,
                transport,
                controller.opts().io_queue_size,
                controller.timeout_config(),
            )
        };

        let mut qpair = QPair::new(qid, size, transport)
            .with_timeout_config(timeout_config);
        qpair.connect()?;

        let pname = ctrlr_name.clone();
        let poller = crate::core::poller::Builder::new()
            .with_name("nvme_io_channel_poller")
            .with_poll_fn(move || poll_io_channel(device, &pname))
            .build();

        debug!("{}: I/O channel created with qpair {}", ctrlr_name, qid);

        Ok(Self {
            ctrlr_name,
            qid,
            qpair: Some(qpair),
            _poller: poller,
        })
    }

    pub fn qpair_mut(&mut self) -> Option<&mut QPair> {
        self.qpair.as_mut()
    }

    pub fn qid(&self) -> u16 {
        self.qid
    }

    /// part of the reset protocol: stop accepting submissions and detach
    /// in-flight requests into the qpair's pending list
    pub(crate) fn disable(&mut self) {
        if let Some(qpair) = self.qpair.as_mut() {
            qpair.disable();
        }
    }

    /// rebuild the transport rings after a controller reset and retransmit
    /// whatever was pending
    pub(crate) fn reinitialize(&mut self, ctrlr_name: &str) -> i32 {
        let carc = match NVME_CONTROLLERS.lookup_by_name(ctrlr_name) {
            Some(c) => c,
            None => return -1,
        };

        let transport = {
            let mut controller = carc.lock();
            match controller.realloc_io_qpair_transport(self.qid) {
                Ok(t) => t,
                Err(e) => {
                    error!(
                        "{}: failed to rebuild qpair {}: {}",
                        ctrlr_name, self.qid, e
                    );
                    return -1;
                }
            }
        };

        match self.qpair.as_mut() {
            Some(qpair) => {
                qpair.replace_transport(transport);
                match qpair.reconnect() {
                    Ok(()) => {
                        info!(
                            "{}: qpair {} successfully reinitialized",
                            ctrlr_name, self.qid
                        );
                        0
                    }
                    Err(e) => {
                        error!(
                            "{}: qpair {} reconnect failed: {}",
                            ctrlr_name, self.qid, e
                        );
                        -1
                    }
                }
            }
            None => -1,
        }
    }

    /// complete everything still outstanding with `aborted`; used when the
    /// reset budget is exhausted
    pub(crate) fn fail_outstanding(&mut self) {
        use crate::bdev::nvmx::protocol::NvmeStatus;
        if let Some(qpair) = self.qpair.as_mut() {
            qpair.fail_outstanding(NvmeStatus::aborted_sq_deleted());
        }
    }

    /// tear the qpair down entirely; controller shutdown path
    pub(crate) fn shutdown(&mut self) {
        use crate::bdev::nvmx::protocol::NvmeStatus;
        if let Some(mut qpair) = self.qpair.take() {
            qpair.fail_outstanding(NvmeStatus::aborted_sq_deleted());
        }
    }

    /// destroy callback of the channel registry
    pub(crate) fn shutdown_ctx(mut self) {
        debug!("{}: I/O channel torn down", self.ctrlr_name);
        self.shutdown();
    }
}

/// Reap completions for the channel's qpair. On transport failure the qpair
/// is reconnected in place while the controller is healthy; a failing
/// controller recovers the qpair itself as part of its reset.
fn poll_io_channel(device: IoDeviceId, ctrlr_name: &str) -> i32 {
    let completed = io_device::with_channel_ctx::<NvmeIoChannel, _>(
        device,
        |chan| {
            let qpair = match chan.qpair_mut() {
                Some(q) => q,
                None => return Vec::new(),
            };

            match qpair.reap(0) {
                Ok(done) => done,
                Err(Errno::ENXIO) => {
                    // the transport level qpair failed; defer to the
                    // controller when it is recovering, otherwise try to
                    // restore the qpair right here
                    let healthy = NVME_CONTROLLERS
                        .lookup_by_name(ctrlr_name)
                        .map(|c| {
                            c.lock().get_state()
                                == NvmeControllerState::Running
                        })
                        .unwrap_or(false);
                    if healthy {
                        match qpair.reconnect() {
                            Ok(()) => debug!(
                                "{}: qpair reconnected in place",
                                ctrlr_name
                            ),
                            Err(Errno::ENXIO) => {
                                // controller must recover first
                            }
                            Err(e) => warn!(
                                "{}: unable to recover qpair: {}",
                                ctrlr_name, e
                            ),
                        }
                    }
                    Vec::new()
                }
                Err(e) => {
                    warn!("{}: completion error: {}", ctrlr_name, e);
                    Vec::new()
                }
            }
        },
    )
    .unwrap_or_default();

    let did = completed.len() as i32;
    for (req, cpl) in completed {
        req.complete(&cpl);
    }
    did
}
