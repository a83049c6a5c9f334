//! Accel engine: single operations, batches and partial batch failure.

use std::sync::{Arc, Mutex};

use iocore::{
    accel::{
        self,
        AccelBatch,
        AccelEngine,
        AccelOp,
        AccelResult,
    },
    core::DmaBuf,
};

pub mod common;

type Results = Arc<Mutex<Vec<AccelResult>>>;

fn sink(results: &Results) -> accel::AccelCb {
    let results = Arc::clone(results);
    Box::new(move |res| results.lock().unwrap().push(res))
}

#[test]
fn copy_fill_compare_crc() {
    common::test_init();

    let t = common::test_thread("accel_t");
    let engine = AccelEngine::new("ut_accel");

    t.with(|| {
        let chan = engine.get_channel().expect("accel channel");
        let results: Results = Arc::new(Mutex::new(Vec::new()));

        // fill, then copy, then compare the two buffers
        let mut src = DmaBuf::new(4096, 12).unwrap();
        src.fill(0xab);
        let dst = DmaBuf::new(4096, 12).unwrap();
        accel::submit_copy(&chan, src, dst, 4096, sink(&results)).unwrap();
        t.poll_until_idle();

        {
            let mut r = results.lock().unwrap();
            assert_eq!(r.len(), 1);
            let res = r.pop().unwrap();
            assert_eq!(res.status, 0);
            assert!(res.bufs[1].as_slice().iter().all(|b| *b == 0xab));

            // compare the pair we just made equal
            let mut bufs = res.bufs;
            let b = bufs.pop().unwrap();
            let a = bufs.pop().unwrap();
            accel::submit_compare(&chan, a, b, 4096, sink(&results))
                .unwrap();
        }
        t.poll_until_idle();
        assert_eq!(results.lock().unwrap().pop().unwrap().status, 0);

        // a mismatch surfaces per-operation
        let mut a = DmaBuf::new(512, 9).unwrap();
        let b = DmaBuf::new(512, 9).unwrap();
        a.fill(1);
        accel::submit_compare(&chan, a, b, 512, sink(&results)).unwrap();
        t.poll_until_idle();
        assert_eq!(
            results.lock().unwrap().pop().unwrap().status,
            -libc::EILSEQ
        );

        // crc32c with the well-known check vector
        let mut src = DmaBuf::new(512, 9).unwrap();
        src.as_mut_slice()[.. 9].copy_from_slice(b"123456789");
        accel::submit_crc32c(&chan, src, 0, 9, sink(&results)).unwrap();
        t.poll_until_idle();
        let res = results.lock().unwrap().pop().unwrap();
        assert_eq!(res.status, 0);
        assert_eq!(res.crc, Some(0xe306_9283));

        drop(chan);
    });

    t.poll_until_idle();
    t.destroy();
}

#[test]
fn batched_operations() {
    common::test_init();

    let t = common::test_thread("accel_batch_t");
    let engine = AccelEngine::new("ut_accel_batch");

    t.with(|| {
        let chan = engine.get_channel().expect("accel channel");
        let results: Results = Arc::new(Mutex::new(Vec::new()));
        let batch_status = Arc::new(Mutex::new(None));

        let mut batch = AccelBatch::new();

        let dst = DmaBuf::new(512, 9).unwrap();
        batch.add(
            AccelOp::Fill {
                dst,
                val: 0x42,
                len: 512,
            },
            sink(&results),
        );

        let mut src = DmaBuf::new(512, 9).unwrap();
        src.fill(7);
        let dst1 = DmaBuf::new(512, 9).unwrap();
        let dst2 = DmaBuf::new(512, 9).unwrap();
        batch.add(
            AccelOp::Dualcast {
                src,
                dst1,
                dst2,
                len: 512,
            },
            sink(&results),
        );

        // an op that fails: compare of two different buffers
        let mut a = DmaBuf::new(512, 9).unwrap();
        a.fill(1);
        let b = DmaBuf::new(512, 9).unwrap();
        batch.add(
            AccelOp::Compare {
                src1: a,
                src2: b,
                len: 512,
            },
            sink(&results),
        );

        assert_eq!(batch.len(), 3);

        let bs = Arc::clone(&batch_status);
        accel::submit_batch(
            &chan,
            batch,
            Box::new(move |status| {
                *bs.lock().unwrap() = Some(status);
            }),
        )
        .unwrap();

        t.poll_until_idle();

        let r = results.lock().unwrap();
        assert_eq!(r.len(), 3, "each op completed individually");
        assert_eq!(r[0].status, 0);
        assert!(r[0].bufs[0].as_slice().iter().all(|v| *v == 0x42));
        assert_eq!(r[1].status, 0);
        assert!(r[1].bufs[1].as_slice().iter().all(|v| *v == 7));
        assert!(r[1].bufs[2].as_slice().iter().all(|v| *v == 7));
        assert_eq!(r[2].status, -libc::EILSEQ);
        drop(r);

        // the batch callback saw the first error
        assert_eq!(*batch_status.lock().unwrap(), Some(-libc::EILSEQ));

        drop(chan);
    });

    t.poll_until_idle();
    t.destroy();
}
