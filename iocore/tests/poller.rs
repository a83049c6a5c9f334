//! Timed poller behaviour, driven in simulated time through the virtual
//! tick source.

use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};

use iocore::core::{poller, ticks};

pub mod common;

// everything in one test: the virtual clock is process global, so the
// parts must not advance it concurrently
#[test]
fn pollers_in_simulated_time() {
    common::test_init();
    assert!(ticks::use_virtual_clock());

    timed_and_active_pollers();
    pause_and_resume();
    next_expiration_hint();
}

fn timed_and_active_pollers() {
    let t = common::test_thread("poller_t");

    let timed_hits = Arc::new(AtomicU64::new(0));
    let active_hits = Arc::new(AtomicU64::new(0));

    t.with(|| {
        let hits = Arc::clone(&timed_hits);
        let timed = poller::Builder::new()
            .with_name("ut_timed")
            .with_interval(10_000)
            .with_poll_fn(move || {
                hits.fetch_add(1, Ordering::SeqCst);
                1
            })
            .build();

        let hits = Arc::clone(&active_hits);
        let active = poller::Builder::new()
            .with_name("ut_active")
            .with_poll_fn(move || {
                hits.fetch_add(1, Ordering::SeqCst);
                0
            })
            .build();

        // drive 100 simulated milliseconds in 1 ms steps
        for _ in 0 .. 100 {
            ticks::advance_us(1_000);
            t.poll(0);
        }

        let timed_count = timed_hits.load(Ordering::SeqCst);
        assert!(
            (9 ..= 11).contains(&timed_count),
            "expected ~10 invocations for a 10 ms period over 100 ms, \
             got {}",
            timed_count
        );
        // the active poller runs on every single poll
        assert_eq!(active_hits.load(Ordering::SeqCst), 100);

        timed.stop();
        active.stop();
    });

    // unregistered pollers are freed at the iteration boundary and never
    // run again
    t.poll(0);
    let after = timed_hits.load(Ordering::SeqCst);
    ticks::advance_us(50_000);
    t.poll(0);
    assert_eq!(timed_hits.load(Ordering::SeqCst), after);

    t.destroy();
}

fn pause_and_resume() {
    let t = common::test_thread("poller_pause");
    let hits = Arc::new(AtomicU64::new(0));

    t.with(|| {
        let h = Arc::clone(&hits);
        let mut p = poller::Builder::new()
            .with_poll_fn(move || {
                h.fetch_add(1, Ordering::SeqCst);
                1
            })
            .build();

        t.poll(0);
        assert_eq!(hits.load(Ordering::SeqCst), 1);

        p.pause();
        t.poll(0);
        t.poll(0);
        assert_eq!(hits.load(Ordering::SeqCst), 1);

        p.resume();
        t.poll(0);
        assert_eq!(hits.load(Ordering::SeqCst), 2);

        p.stop();
    });

    t.destroy();
}

fn next_expiration_hint() {
    let t = common::test_thread("poller_exp");
    t.with(|| {
        // no timed pollers: no deadline to report
        assert_eq!(t.next_poller_expiration(ticks::now()), 0);

        let p = poller::Builder::new()
            .with_interval(5_000)
            .with_poll_fn(|| 0)
            .build();

        let until = t.next_poller_expiration(ticks::now());
        assert!(until > 0 && until <= 5_000);
        assert!(t.is_idle(), "nothing is due yet");

        ticks::advance_us(5_000);
        assert!(!t.is_idle(), "a timed poller is due");
        p.stop();
    });
    t.destroy();
}
