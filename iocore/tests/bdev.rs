//! Bdev layer: submit/complete through a ram disk leaf, argument
//! validation and registry behaviour.

use std::sync::{Arc, Mutex};

use assert_matches::assert_matches;
use futures::executor::block_on;

use iocore::{
    bdev::{bdev_create, bdev_destroy},
    core::{Bdev, CoreError, DmaBuf, IoStatus},
};

pub mod common;

type CplSlot = Arc<Mutex<Option<(IoStatus, Vec<DmaBuf>)>>>;

fn cpl_slot() -> CplSlot {
    Arc::new(Mutex::new(None))
}

fn catch(slot: &CplSlot) -> impl FnOnce(IoStatus, Vec<DmaBuf>) + Send {
    let slot = Arc::clone(slot);
    move |status, bufs| {
        *slot.lock().unwrap() = Some((status, bufs));
    }
}

#[test]
fn submit_and_complete() {
    common::test_init();

    let t = common::test_thread("bdev_t");

    // 512 byte blocks, 1 MiB in total
    let name = block_on(bdev_create("malloc:///d0?size_mb=1&blk_size=512"))
        .expect("create ram disk");
    let bdev = Bdev::lookup_by_name(&name).unwrap();
    assert_eq!(bdev.block_len(), 512);
    assert_eq!(bdev.num_blocks(), 2048);

    let desc = Bdev::open_by_name(&name, true).unwrap();

    t.with(|| {
        let ch = desc.get_io_channel().expect("channel");

        // write a pattern, then read it back
        let mut wbuf = DmaBuf::new(4096, 9).unwrap();
        wbuf.fill(0x5a);
        let wr = cpl_slot();
        desc.write(&ch, wbuf, 0, 4096, catch(&wr)).unwrap();

        // nothing completes until the channel poller ran
        assert!(wr.lock().unwrap().is_none());
        t.poll_until_idle();
        let (status, _bufs) = wr.lock().unwrap().take().expect("one write");
        assert_eq!(status, IoStatus::Success);

        let rbuf = DmaBuf::new(4096, 9).unwrap();
        let rd = cpl_slot();
        desc.read(&ch, rbuf, 0, 4096, catch(&rd)).unwrap();
        t.poll_until_idle();
        let (status, bufs) = rd.lock().unwrap().take().expect("one read");
        assert_eq!(status, IoStatus::Success);
        assert!(bufs[0].as_slice().iter().all(|b| *b == 0x5a));

        // reads past what was written observe the deterministic zero fill
        let rbuf = DmaBuf::new(4096, 9).unwrap();
        let rd = cpl_slot();
        desc.read(&ch, rbuf, 8192, 4096, catch(&rd)).unwrap();
        t.poll_until_idle();
        let (status, bufs) = rd.lock().unwrap().take().unwrap();
        assert_eq!(status, IoStatus::Success);
        assert!(bufs[0].as_slice().iter().all(|b| *b == 0));
    });

    drop(desc);
    block_on(bdev_destroy("malloc:///d0?size_mb=1&blk_size=512")).unwrap();
    t.destroy();
}

#[test]
fn submission_validation() {
    common::test_init();

    let t = common::test_thread("bdev_val");

    let name = block_on(bdev_create("malloc:///dval?size_mb=1&blk_size=512"))
        .expect("create ram disk");
    let bdev = Bdev::lookup_by_name(&name).unwrap();
    let size = bdev.size_in_bytes();

    let desc = Bdev::open_by_name(&name, true).unwrap();
    let ro = Bdev::open_by_name(&name, false).unwrap();

    t.with(|| {
        let ch = desc.get_io_channel().unwrap();

        // zero length
        let buf = DmaBuf::new(4096, 9).unwrap();
        assert_matches!(
            desc.read(&ch, buf, 0, 0, |_, _| {}),
            Err(CoreError::InvalidLength { .. })
        );

        // past the end of the device
        let buf = DmaBuf::new(4096, 9).unwrap();
        assert_matches!(
            desc.read(&ch, buf, size, 4096, |_, _| {}),
            Err(CoreError::InvalidOffset { .. })
        );

        // not a multiple of the block size
        let buf = DmaBuf::new(4096, 9).unwrap();
        assert_matches!(
            desc.read(&ch, buf, 0, 100, |_, _| {}),
            Err(CoreError::InvalidLength { .. })
        );
        let buf = DmaBuf::new(4096, 9).unwrap();
        assert_matches!(
            desc.write(&ch, buf, 7, 512, |_, _| {}),
            Err(CoreError::InvalidOffset { .. })
        );

        // writing through a read-only descriptor
        let buf = DmaBuf::new(4096, 9).unwrap();
        assert_matches!(
            ro.write(&ch, buf, 0, 512, |_, _| {}),
            Err(CoreError::ReadOnlyDescriptor { .. })
        );

        // a buffer smaller than the request
        let buf = DmaBuf::new(512, 9).unwrap();
        assert_matches!(
            desc.read(&ch, buf, 0, 4096, |_, _| {}),
            Err(CoreError::InvalidLength { .. })
        );
    });

    drop(desc);
    drop(ro);
    block_on(bdev_destroy("malloc:///dval?size_mb=1&blk_size=512")).unwrap();
    t.destroy();
}

#[test]
fn registry_and_reset() {
    common::test_init();

    let t = common::test_thread("bdev_reg");

    let uri = "malloc:///dreg?size_mb=1&blk_size=512";
    let name = block_on(bdev_create(uri)).unwrap();

    // duplicates are rejected
    assert_matches!(
        block_on(bdev_create(uri)),
        Err(iocore::bdev::BdevError::BdevExists { .. })
    );

    // busy while descriptors are open
    let desc = Bdev::open_by_name(&name, true).unwrap();
    assert_matches!(
        Bdev::unregister(&name),
        Err(CoreError::BdevBusy { .. })
    );

    t.with(|| {
        let ch = desc.get_io_channel().unwrap();

        // a reset races queued I/O, which completes aborted
        let rd = cpl_slot();
        let buf = DmaBuf::new(512, 9).unwrap();
        desc.read(&ch, buf, 0, 512, catch(&rd)).unwrap();

        let rst = cpl_slot();
        desc.reset(&ch, catch(&rst)).unwrap();
        t.poll_until_idle();

        let (status, _) = rd.lock().unwrap().take().unwrap();
        assert_eq!(status, IoStatus::Aborted);
        let (status, _) = rst.lock().unwrap().take().unwrap();
        assert_eq!(status, IoStatus::Success);
    });

    drop(desc);
    block_on(bdev_destroy(uri)).unwrap();

    // registering and then unregistering leaves the name set unchanged
    assert!(Bdev::lookup_by_name(&name).is_none());

    t.destroy();
}
