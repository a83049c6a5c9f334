//! Hot-plug: the monitor attaches endpoints as they appear, flags them
//! removed when they vanish, and a detach reaps the teardown.

use std::{
    future::Future,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};

use futures::task::noop_waker;
use parking_lot::Mutex;

use iocore::bdev::nvmx::{self, NvmeControllerState};

pub mod common;

#[test]
fn hotplug_insert_and_remove() {
    common::test_init();

    let master = common::test_thread("hp_master");

    master.with(|| {
        let endpoint = common::EmuEndpoint::new("hp0", 4096, 512);
        common::register_emu_transport(&endpoint);

        let trid = common::emu_trid("hp0");
        let opts = nvmx::controller::Builder::new()
            .with_admin_poll_period_us(0)
            .build();

        let attached = Arc::new(AtomicU64::new(0));
        let removed: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));

        let a = Arc::clone(&attached);
        let r = Arc::clone(&removed);
        let _monitor = nvmx::start_hotplug_monitor(
            trid.clone(),
            opts,
            |_, _| true,
            move |_, _| {
                a.fetch_add(1, Ordering::SeqCst);
            },
            move |name, _| {
                r.lock().push(name.to_string());
            },
            0,
        );

        // first sweep attaches the endpoint
        let mut guard = 0;
        while attached.load(Ordering::SeqCst) == 0 {
            master.poll(0);
            guard += 1;
            assert!(guard < 1000, "endpoint never attached");
        }

        let name = trid.to_string();
        let carc = nvmx::NVME_CONTROLLERS.lookup_by_name(&name).unwrap();
        assert_eq!(carc.lock().get_state(), NvmeControllerState::Running);
        assert!(!carc.lock().is_removed());

        // pull the endpoint; the monitor notices and fires the removal
        common::unregister_emu_endpoint("hp0");
        let mut guard = 0;
        while removed.lock().is_empty() {
            master.poll(0);
            guard += 1;
            assert!(guard < 1000, "removal never reported");
        }
        assert_eq!(removed.lock()[0], name);
        assert!(carc.lock().is_removed());
        // reported once, not on every sweep
        for _ in 0 .. 10 {
            master.poll(0);
        }
        assert_eq!(removed.lock().len(), 1);

        // reap the teardown
        let fut = nvmx::detach_async(&name);
        pin_utils::pin_mut!(fut);
        let waker = noop_waker();
        let mut cx = std::task::Context::from_waker(&waker);
        let mut guard = 0;
        loop {
            match fut.as_mut().poll(&mut cx) {
                std::task::Poll::Ready(res) => {
                    res.expect("detach failed");
                    break;
                }
                std::task::Poll::Pending => {
                    master.poll(0);
                    guard += 1;
                    assert!(guard < 1000, "detach never completed");
                }
            }
        }

        assert!(nvmx::NVME_CONTROLLERS.lookup_by_name(&name).is_none());
    });

    master.destroy();
}
