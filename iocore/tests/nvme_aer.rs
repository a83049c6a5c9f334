//! Asynchronous event requests: the driver keeps one in flight, fans
//! completions out to registered callbacks and re-arms afterwards.

use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};

use iocore::bdev::nvmx::{self, protocol::log_page};

pub mod common;

#[test]
fn aer_fan_out_and_rearm() {
    common::test_init();

    let endpoint = common::EmuEndpoint::new("aer0", 4096, 512);
    common::register_emu_transport(&endpoint);

    let master = common::test_thread("aer_master");

    master.with(|| {
        let trid = common::emu_trid("aer0");
        let opts = nvmx::controller::Builder::new()
            .with_admin_poll_period_us(0)
            .build();

        nvmx::probe(&trid, &opts, |_, _| true, |_, _| {}).unwrap();
        let carc = nvmx::NVME_CONTROLLERS
            .lookup_by_name(&trid.to_string())
            .unwrap();

        let events = Arc::new(AtomicU64::new(0));
        let health_pages = Arc::new(AtomicU64::new(0));
        {
            let events = Arc::clone(&events);
            let pages = Arc::clone(&health_pages);
            carc.lock().register_aer_callback(Arc::new(move |_name, cpl| {
                events.fetch_add(1, Ordering::SeqCst);
                if cpl.aer_log_page() == log_page::HEALTH {
                    pages.fetch_add(1, Ordering::SeqCst);
                }
            }));
        }

        // first event
        endpoint.trigger_aer(log_page::HEALTH);
        let mut guard = 0;
        while events.load(Ordering::SeqCst) < 1 {
            master.poll(0);
            guard += 1;
            assert!(guard < 1000, "first event never delivered");
        }
        assert_eq!(health_pages.load(Ordering::SeqCst), 1);

        // the AER was re-armed: a second event also arrives
        endpoint.trigger_aer(log_page::CHANGED_NS_LIST);
        let mut guard = 0;
        while events.load(Ordering::SeqCst) < 2 {
            master.poll(0);
            guard += 1;
            assert!(guard < 1000, "second event never delivered");
        }
        // the health counter saw only the first one
        assert_eq!(health_pages.load(Ordering::SeqCst), 1);
    });

    master.destroy();
}
