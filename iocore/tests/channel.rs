//! Channel lifecycle: per-thread refcounting, single create/destroy, and
//! deferred device unregistration.

use std::sync::{
    atomic::{AtomicBool, AtomicU64, Ordering},
    Arc,
};

use iocore::core::{io_device, IoDevice};

pub mod common;

struct UtCtx {
    marker: u64,
}

#[test]
fn channel_lifecycle() {
    common::test_init();

    let t1 = common::test_thread("ch_t1");

    let creates = Arc::new(AtomicU64::new(0));
    let destroys = Arc::new(AtomicU64::new(0));

    let c = Arc::clone(&creates);
    let d = Arc::clone(&destroys);
    let device = IoDevice::register::<UtCtx>(
        "ut_device",
        move |_| {
            c.fetch_add(1, Ordering::SeqCst);
            Ok(UtCtx {
                marker: 0,
            })
        },
        move |_, _ctx| {
            d.fetch_add(1, Ordering::SeqCst);
        },
    );
    let id = device.id();

    t1.with(|| {
        let ch1 = io_device::get_io_channel(id).expect("first get");
        assert_eq!(creates.load(Ordering::SeqCst), 1);
        assert_eq!(ch1.ref_count(), 1);

        // second get bumps the refcount of the same channel
        let ch2 = io_device::get_io_channel(id).expect("second get");
        assert_eq!(creates.load(Ordering::SeqCst), 1, "created only once");
        assert_eq!(ch1.ref_count(), 2);

        // the context is shared: what one handle writes the other reads
        ch1.with_ctx::<UtCtx, _>(|ctx| ctx.marker = 0xfeed).unwrap();
        let seen =
            ch2.with_ctx::<UtCtx, _>(|ctx| ctx.marker).unwrap();
        assert_eq!(seen, 0xfeed);

        drop(ch2);
        assert_eq!(ch1.ref_count(), 1);
        drop(ch1);
    });

    // destruction is deferred to the message loop
    assert_eq!(destroys.load(Ordering::SeqCst), 0);
    t1.poll(0);
    assert_eq!(destroys.load(Ordering::SeqCst), 1);
    assert_eq!(io_device::channel_count(id), 0);

    // with all channels gone the unregister callback runs right away
    let fired = Arc::new(AtomicBool::new(false));
    let f = Arc::clone(&fired);
    t1.with(|| {
        device.unregister(Some(Box::new(move |_| {
            f.store(true, Ordering::SeqCst);
        })));
    });
    assert!(fired.load(Ordering::SeqCst));

    // an unregistered device no longer hands out channels
    t1.with(|| {
        assert!(io_device::get_io_channel(id).is_none());
    });

    t1.destroy();
}

#[test]
fn deferred_unregister() {
    common::test_init();

    let t1 = common::test_thread("ch_defer");

    let destroys = Arc::new(AtomicU64::new(0));
    let d = Arc::clone(&destroys);
    let device = IoDevice::register::<UtCtx>(
        "ut_deferred",
        |_| {
            Ok(UtCtx {
                marker: 1,
            })
        },
        move |_, _| {
            d.fetch_add(1, Ordering::SeqCst);
        },
    );
    let id = device.id();

    let fired = Arc::new(AtomicBool::new(false));

    t1.with(|| {
        let ch = io_device::get_io_channel(id).expect("get");

        // unregister with a live channel: removal from the registry is
        // immediate, the callback waits for the channel
        let f = Arc::clone(&fired);
        device.unregister(Some(Box::new(move |_| {
            f.store(true, Ordering::SeqCst);
        })));
        assert!(!fired.load(Ordering::SeqCst));
        assert!(
            io_device::get_io_channel(id).is_none(),
            "unregistered devices do not create channels"
        );

        drop(ch);
    });

    let mut guard = 0;
    while !fired.load(Ordering::SeqCst) {
        t1.poll(0);
        guard += 1;
        assert!(guard < 100, "unregister callback never fired");
    }
    assert_eq!(destroys.load(Ordering::SeqCst), 1);

    t1.destroy();
}
