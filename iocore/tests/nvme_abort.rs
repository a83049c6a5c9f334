//! Abort handling against the software endpoint: every submitted abort is
//! accounted as successful, unsuccessful or failed, and aborted I/O
//! surfaces with aborted status.

use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};

use iocore::{
    bdev::nvmx::{
        self,
        namespace::ns_cmd_read,
        AbortOutcome,
        NvmeIoChannel,
    },
    core::{io_device, DmaBuf},
};

pub mod common;

const QUEUE_DEPTH: u32 = 128;

#[derive(Default)]
struct AbortStats {
    submitted: AtomicU64,
    submit_failed: AtomicU64,
    successful: AtomicU64,
    unsuccessful: AtomicU64,
    failed: AtomicU64,
}

#[test]
fn abort_accounting() {
    common::test_init();

    let endpoint = common::EmuEndpoint::new("abort0", 8192, 512);
    // keep I/O completions queued so aborts can still catch them
    endpoint.hold_io.store(true, Ordering::SeqCst);
    common::register_emu_transport(&endpoint);

    let master = common::test_thread("abort_master");

    let io_done = Arc::new(AtomicU64::new(0));
    let io_aborted = Arc::new(AtomicU64::new(0));
    let stats = Arc::new(AbortStats::default());

    master.with(|| {
        let trid = common::emu_trid("abort0");
        let opts = nvmx::controller::Builder::new()
            .with_admin_poll_period_us(0)
            .with_io_queue_size(QUEUE_DEPTH * 2)
            .build();

        let attached =
            nvmx::probe(&trid, &opts, |_, _| true, |_, _| {}).unwrap();
        assert_eq!(attached, 1);

        let carc = nvmx::NVME_CONTROLLERS
            .lookup_by_name(&trid.to_string())
            .unwrap();
        let (ns, device) = {
            let controller = carc.lock();
            (
                controller.namespace().unwrap(),
                controller.device_id().unwrap(),
            )
        };

        let channel = io_device::get_io_channel(device).unwrap();

        // fill the queue
        let mut submitted = 0u64;
        channel
            .with_ctx::<NvmeIoChannel, _>(|chan| {
                let qpair = chan.qpair_mut().unwrap();
                for i in 0 .. QUEUE_DEPTH as u64 {
                    let buf = DmaBuf::new(512, 9).unwrap();
                    let done = Arc::clone(&io_done);
                    let aborted = Arc::clone(&io_aborted);
                    let res = ns_cmd_read(
                        &ns,
                        qpair,
                        buf,
                        i % ns.num_blocks(),
                        1,
                        Box::new(move |cpl, _buf| {
                            done.fetch_add(1, Ordering::SeqCst);
                            if cpl.status.is_aborted() {
                                aborted.fetch_add(1, Ordering::SeqCst);
                            }
                        }),
                    );
                    if res.is_ok() {
                        submitted += 1;
                    }
                }
            })
            .unwrap();
        assert_eq!(submitted, QUEUE_DEPTH as u64);

        // abort every submitted command
        let (qid, cids) = channel
            .with_ctx::<NvmeIoChannel, _>(|chan| {
                let qpair = chan.qpair_mut().unwrap();
                (qpair.id(), qpair.tracked_cids())
            })
            .unwrap();
        assert_eq!(cids.len(), QUEUE_DEPTH as usize);

        for cid in cids {
            // the abort limit throttles us; drain the admin queue and retry
            let mut attempts = 0;
            loop {
                let s = Arc::clone(&stats);
                let res = carc.lock().cmd_abort(
                    Some(qid),
                    cid,
                    move |outcome| {
                        match outcome {
                            AbortOutcome::Successful => {
                                s.successful.fetch_add(1, Ordering::SeqCst)
                            }
                            AbortOutcome::Unsuccessful => {
                                s.unsuccessful.fetch_add(1, Ordering::SeqCst)
                            }
                            AbortOutcome::Failed => {
                                s.failed.fetch_add(1, Ordering::SeqCst)
                            }
                        };
                    },
                );
                match res {
                    Ok(()) => {
                        stats.submitted.fetch_add(1, Ordering::SeqCst);
                        break;
                    }
                    Err(_) if attempts < 100 => {
                        attempts += 1;
                        master.poll(0);
                    }
                    Err(_) => {
                        stats.submit_failed.fetch_add(1, Ordering::SeqCst);
                        break;
                    }
                }
            }
        }

        // drain the admin queue until every abort reported back
        let mut guard = 0;
        loop {
            let acked = stats.successful.load(Ordering::SeqCst)
                + stats.unsuccessful.load(Ordering::SeqCst)
                + stats.failed.load(Ordering::SeqCst);
            if acked == stats.submitted.load(Ordering::SeqCst) {
                break;
            }
            master.poll(0);
            guard += 1;
            assert!(guard < 10_000, "aborts never completed");
        }

        // release the data path and drain the I/O completions
        endpoint.hold_io.store(false, Ordering::SeqCst);
        let mut guard = 0;
        while io_done.load(Ordering::SeqCst) < QUEUE_DEPTH as u64 {
            master.poll(0);
            guard += 1;
            assert!(guard < 10_000, "I/O never completed");
        }

        // abort accounting: every submitted abort resolved one way
        let submitted_aborts = stats.submitted.load(Ordering::SeqCst);
        assert_eq!(
            submitted_aborts + stats.submit_failed.load(Ordering::SeqCst),
            QUEUE_DEPTH as u64
        );
        assert_eq!(
            stats.successful.load(Ordering::SeqCst)
                + stats.unsuccessful.load(Ordering::SeqCst)
                + stats.failed.load(Ordering::SeqCst),
            submitted_aborts
        );

        // the endpoint granted at least some of them, and every granted
        // abort surfaced as an aborted I/O completion
        assert_eq!(
            io_aborted.load(Ordering::SeqCst),
            stats.successful.load(Ordering::SeqCst)
        );

        drop(channel);
        master.poll(0);
    });

    master.destroy();
}
