//! Reset and failover: transport failure on the admin queue drives the
//! controller through resetting back to running; a dead endpoint exhausts
//! the reset budget and faults the controller. Requests that were in
//! flight across a successful reset are retransmitted, not lost.

use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};

use iocore::{
    bdev::nvmx::{
        self,
        namespace::ns_cmd_read,
        ControllerFailureReason,
        NvmeControllerState,
        NvmeIoChannel,
    },
    core::{io_device, DmaBuf},
};

pub mod common;

fn poll_until<F: FnMut() -> bool>(
    thread: &iocore::core::Mthread,
    mut pred: F,
    what: &str,
) {
    let mut guard = 0;
    while !pred() {
        thread.poll(0);
        guard += 1;
        assert!(guard < 100_000, "{} never happened", what);
    }
}

#[test]
fn reset_on_transport_failure() {
    common::test_init();

    let endpoint = common::EmuEndpoint::new("reset0", 8192, 512);
    common::register_emu_transport(&endpoint);

    let master = common::test_thread("reset_master");

    master.with(|| {
        let trid = common::emu_trid("reset0");
        let opts = nvmx::controller::Builder::new()
            .with_admin_poll_period_us(0)
            .build();

        nvmx::probe(&trid, &opts, |_, _| true, |_, _| {}).unwrap();
        let carc = nvmx::NVME_CONTROLLERS
            .lookup_by_name(&trid.to_string())
            .unwrap();

        assert_eq!(
            carc.lock().get_state(),
            NvmeControllerState::Running
        );

        // a channel with an in-flight request that must survive the reset
        let device = carc.lock().device_id().unwrap();
        let channel = io_device::get_io_channel(device).unwrap();
        let ns = carc.lock().namespace().unwrap();

        endpoint.hold_io.store(true, Ordering::SeqCst);
        let survived = Arc::new(AtomicU64::new(0));
        channel
            .with_ctx::<NvmeIoChannel, _>(|chan| {
                let qpair = chan.qpair_mut().unwrap();
                let s = Arc::clone(&survived);
                ns_cmd_read(
                    &ns,
                    qpair,
                    DmaBuf::new(512, 9).unwrap(),
                    0,
                    1,
                    Box::new(move |cpl, _| {
                        if cpl.status.is_success() {
                            s.fetch_add(1, Ordering::SeqCst);
                        }
                    }),
                )
                .unwrap();
            })
            .unwrap();

        // inject the failure; the admin poller notices and resets
        endpoint.inject_admin_failure();

        let mut saw_resetting = false;
        poll_until(
            &master,
            || {
                let state = carc.lock().get_state();
                if state == NvmeControllerState::Resetting {
                    saw_resetting = true;
                }
                saw_resetting && state == NvmeControllerState::Running
            },
            "recovery after transport failure",
        );

        assert!(saw_resetting, "controller never entered resetting");
        assert_eq!(carc.lock().reset_count(), 0, "successful reset resets the budget");

        // the request queued before the failure was retransmitted against
        // the reconnected endpoint and completes normally
        endpoint.hold_io.store(false, Ordering::SeqCst);
        poll_until(
            &master,
            || survived.load(Ordering::SeqCst) == 1,
            "in-flight request survival",
        );

        drop(channel);
        master.poll(0);
    });

    master.destroy();
}

#[test]
fn reset_budget_exhaustion() {
    common::test_init();

    let endpoint = common::EmuEndpoint::new("reset1", 8192, 512);
    common::register_emu_transport(&endpoint);

    let master = common::test_thread("budget_master");

    master.with(|| {
        let trid = common::emu_trid("reset1");
        let opts = nvmx::controller::Builder::new()
            .with_admin_poll_period_us(0)
            .with_max_resets(15)
            .build();

        nvmx::probe(&trid, &opts, |_, _| true, |_, _| {}).unwrap();
        let carc = nvmx::NVME_CONTROLLERS
            .lookup_by_name(&trid.to_string())
            .unwrap();

        // the endpoint goes away for good
        endpoint.fail_next_connects(u32::MAX / 2);
        endpoint.inject_admin_failure();

        poll_until(
            &master,
            || {
                carc.lock().get_state()
                    == NvmeControllerState::Faulted(
                        ControllerFailureReason::ResetFailed,
                    )
            },
            "controller faulting",
        );

        assert_eq!(carc.lock().reset_count(), 15);

        // a faulted controller stays faulted
        for _ in 0 .. 100 {
            master.poll(0);
        }
        assert_eq!(
            carc.lock().get_state(),
            NvmeControllerState::Faulted(ControllerFailureReason::ResetFailed)
        );
    });

    master.destroy();
}
