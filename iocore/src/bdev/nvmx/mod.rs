//! NVMe driver: controller and qpair state machines over pluggable
//! transports, probe and hot-plug handling, and the glue that exposes
//! namespaces as bdevs.

use std::{collections::HashMap, sync::Arc};

use once_cell::sync::Lazy;
use parking_lot::{Mutex, RwLock};

use crate::core::{CoreError, Poller};

pub mod channel;
pub mod controller;
pub mod controller_state;
pub mod device;
pub mod namespace;
pub mod pcie;
pub mod protocol;
pub mod qpair;
pub mod transport;

pub use channel::NvmeIoChannel;
pub use controller::{
    destroy_device,
    AbortOutcome,
    AerCb,
    NvmeController,
    NvmeControllerOpts,
    TimeoutCb,
    TimeoutConfig,
};
pub use controller_state::{ControllerFailureReason, NvmeControllerState};
pub use device::create_block_device;
pub use namespace::NvmeNamespace;
pub use qpair::{NvmeIoCb, NvmeRequest, QPair, QPairState};
pub use transport::{
    lookup_transport,
    register_transport,
    NvmeTransport,
    NvmeTransportId,
    TransportType,
};

/// All attached controllers, keyed by the string form of their transport
/// id.
pub struct NvmeControllerList {
    entries: RwLock<HashMap<String, Arc<Mutex<NvmeController>>>>,
}

impl NvmeControllerList {
    fn new() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
        }
    }

    pub fn lookup_by_name<T: AsRef<str>>(
        &self,
        name: T,
    ) -> Option<Arc<Mutex<NvmeController>>> {
        self.entries.read().get(name.as_ref()).cloned()
    }

    pub(crate) fn insert_controller(
        &self,
        name: String,
        controller: Arc<Mutex<NvmeController>>,
    ) {
        self.entries.write().insert(name, controller);
    }

    pub fn remove_by_name<T: AsRef<str>>(
        &self,
        name: T,
    ) -> Option<Arc<Mutex<NvmeController>>> {
        self.entries.write().remove(name.as_ref())
    }

    pub fn names(&self) -> Vec<String> {
        self.entries.read().keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

pub static NVME_CONTROLLERS: Lazy<NvmeControllerList> =
    Lazy::new(NvmeControllerList::new);

/// register the built-in transports; PCIe unless `no_pci`
pub fn register_default_transports(no_pci: bool) {
    if !no_pci {
        register_transport(Arc::new(pcie::PcieTransport::default()));
    }
}

/// Probe for controllers reachable through `trid` and attach them. For
/// every candidate `probe_cb` decides (and may adjust the options);
/// successfully attached controllers are handed to `attach_cb`. Returns
/// the number of controllers attached.
pub fn probe<P, A>(
    trid: &NvmeTransportId,
    opts: &NvmeControllerOpts,
    mut probe_cb: P,
    mut attach_cb: A,
) -> Result<u32, CoreError>
where
    P: FnMut(&NvmeTransportId, &mut NvmeControllerOpts) -> bool,
    A: FnMut(&NvmeTransportId, Arc<Mutex<NvmeController>>),
{
    let transport = lookup_transport(trid.trtype)?;
    let candidates = transport.enumerate(trid)?;
    debug!(
        "probe of {} found {} candidate(s)",
        trid,
        candidates.len()
    );

    let mut attached = 0;
    for candidate in candidates {
        if NVME_CONTROLLERS
            .lookup_by_name(&candidate.to_string())
            .is_some()
        {
            continue;
        }

        let mut ctrlr_opts = opts.clone();
        if !probe_cb(&candidate, &mut ctrlr_opts) {
            debug!("{}: skipped by probe callback", candidate);
            continue;
        }

        match controller::connect_controller(&candidate, ctrlr_opts) {
            Ok(carc) => {
                attach_cb(&candidate, carc);
                attached += 1;
            }
            Err(e) => {
                warn!("{}: attach failed: {}", candidate, e);
            }
        }
    }
    Ok(attached)
}

/// Start the hot-plug monitor: enumeration is re-run periodically, newly
/// visible endpoints are attached (gated by `probe_cb`) and vanished ones
/// are flagged removed and reported through `remove_cb`. The caller keeps
/// the returned poller alive for as long as monitoring should continue.
pub fn start_hotplug_monitor<P, A, R>(
    trid: NvmeTransportId,
    opts: NvmeControllerOpts,
    mut probe_cb: P,
    mut attach_cb: A,
    mut remove_cb: R,
    period_us: u64,
) -> Poller
where
    P: FnMut(&NvmeTransportId, &mut NvmeControllerOpts) -> bool + 'static,
    A: FnMut(&NvmeTransportId, Arc<Mutex<NvmeController>>) + 'static,
    R: FnMut(&str, Arc<Mutex<NvmeController>>) + 'static,
{
    crate::core::poller::Builder::new()
        .with_name("nvme_hotplug_monitor")
        .with_interval(period_us)
        .with_poll_fn(move || {
            let transport = match lookup_transport(trid.trtype) {
                Ok(t) => t,
                Err(_) => return 0,
            };
            let present: Vec<String> = match transport.enumerate(&trid) {
                Ok(candidates) => {
                    let names: Vec<String> =
                        candidates.iter().map(|c| c.to_string()).collect();

                    // attach what is new
                    let _ = probe(
                        &trid,
                        &opts,
                        |cand, o| probe_cb(cand, o),
                        |cand, carc| attach_cb(cand, carc),
                    );
                    names
                }
                Err(e) => {
                    debug!("hot-plug enumeration failed: {}", e);
                    return 0;
                }
            };

            // detect what is gone
            let mut removed = 0;
            for name in NVME_CONTROLLERS.names() {
                if present.iter().any(|p| *p == name) {
                    continue;
                }
                if let Some(carc) = NVME_CONTROLLERS.lookup_by_name(&name) {
                    let newly_removed = {
                        let mut controller = carc.lock();
                        // only flag controllers of the monitored transport
                        if controller.transport_id().trtype != trid.trtype {
                            continue;
                        }
                        if controller.is_removed() {
                            false
                        } else {
                            warn!("{}: device removed", name);
                            controller.mark_removed();
                            true
                        }
                    };
                    if newly_removed {
                        remove_cb(&name, carc);
                        removed += 1;
                    }
                }
            }
            removed
        })
        .build()
}

/// Detach an attached controller: drain and tear down all its resources
/// and remove it from the list. The future resolves once teardown has been
/// reaped.
pub async fn detach_async(name: &str) -> Result<(), CoreError> {
    destroy_device(name.to_string()).await
}
