//! Scheduler behaviour: cross-thread message ordering, serial thread
//! iteration and idle detection.

use std::sync::{
    atomic::{AtomicBool, AtomicU64, Ordering},
    Arc,
};

use parking_lot::Mutex;

use iocore::core::{for_each_thread, Mthread, PollStatus};

pub mod common;

#[test]
fn scheduler_roundtrip() {
    common::test_init();

    let t1 = common::test_thread("rt_t1");
    let t2 = common::test_thread("rt_t2");

    let counter = Arc::new(AtomicU64::new(0));
    let order: Arc<Mutex<Vec<u64>>> = Arc::new(Mutex::new(Vec::new()));

    // from T1, send 1000 increments to T2
    t1.with(|| {
        for i in 0 .. 1000u64 {
            let counter = Arc::clone(&counter);
            let order = Arc::clone(&order);
            t2.send_msg(move || {
                counter.fetch_add(1, Ordering::SeqCst);
                order.lock().push(i);
            })
            .expect("ring should not saturate at this rate");
        }
    });

    assert_eq!(counter.load(Ordering::SeqCst), 0, "delivery is deferred");

    while t2.poll(0) == PollStatus::Busy {}

    assert_eq!(counter.load(Ordering::SeqCst), 1000);
    // single sender, single receiver: strict FIFO
    let seen = order.lock();
    assert_eq!(seen.len(), 1000);
    assert!(seen.iter().enumerate().all(|(i, v)| i as u64 == *v));
    drop(seen);

    assert!(t2.is_idle());

    // serial fan-out over all threads, completion on the originator
    let visits = Arc::new(AtomicU64::new(0));
    let done = Arc::new(AtomicBool::new(false));
    t1.with(|| {
        let visits = Arc::clone(&visits);
        let done = Arc::clone(&done);
        for_each_thread(
            move || {
                visits.fetch_add(1, Ordering::SeqCst);
            },
            move || {
                done.store(true, Ordering::SeqCst);
            },
        )
        .unwrap();
    });

    let mut guard = 0;
    while !done.load(Ordering::SeqCst) {
        t1.poll(0);
        t2.poll(0);
        guard += 1;
        assert!(guard < 1000, "thread iteration did not complete");
    }
    assert!(visits.load(Ordering::SeqCst) >= 2);

    // restricted message batches leave the rest queued
    let more = Arc::new(AtomicU64::new(0));
    for _ in 0 .. 10 {
        let more = Arc::clone(&more);
        t2.send_msg(move || {
            more.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();
    }
    t2.poll(4);
    assert_eq!(more.load(Ordering::SeqCst), 4);
    t2.poll(0);
    assert_eq!(more.load(Ordering::SeqCst), 10);

    t1.destroy();
    t2.destroy();

    exited_thread_is_terminally_idle();
}

// runs as part of the test above: thread iteration enumerates the global
// registry, so the registry must not change concurrently
fn exited_thread_is_terminally_idle() {
    let t = common::test_thread("rt_exit");
    let hit = Arc::new(AtomicBool::new(false));
    let h = Arc::clone(&hit);
    t.send_msg(move || h.store(true, Ordering::SeqCst)).unwrap();

    t.exit();
    assert_eq!(t.poll(0), PollStatus::Busy);
    assert!(hit.load(Ordering::SeqCst), "exit drains pending messages");
    assert!(t.is_exited());
    assert_eq!(t.poll(0), PollStatus::Idle);

    // an exited thread no longer accepts messages
    assert!(t.send_msg(|| {}).is_err());
    t.destroy();
}
