//! Sock abstraction over the posix implementation: group polling, queued
//! async writes and cancellation on close.

use std::{
    cell::RefCell,
    rc::Rc,
};

use iocore::sock::{register_default_impls, Sock, SockGroup};

pub mod common;

fn fresh_group() -> SockGroup {
    register_default_impls();
    SockGroup::new()
}

#[test]
fn group_echo_roundtrip() {
    common::test_init();

    let mut group = fresh_group();

    let port = 37251;
    let mut listener = match Sock::listen(&format!("127.0.0.1:{}", port)) {
        Ok(l) => l,
        Err(_) => {
            // port collision on the test host; nothing useful to assert
            return;
        }
    };

    let mut client =
        Sock::connect(&format!("127.0.0.1:{}", port)).expect("connect");

    // accept may race the connect; spin briefly
    let mut server = None;
    for _ in 0 .. 1000 {
        if let Some(s) = listener.accept().expect("accept") {
            server = Some(s);
            break;
        }
        std::thread::sleep(std::time::Duration::from_millis(1));
    }
    let server = server.expect("no connection accepted");

    let written = Rc::new(RefCell::new(Vec::new()));
    let w = Rc::clone(&written);
    client.writev_async(
        vec![b"hello ".to_vec(), b"world".to_vec()],
        move |status| {
            w.borrow_mut().push(status);
        },
    );

    // the write either completed inline or will on the next flush
    let received = Rc::new(RefCell::new(Vec::new()));
    let r = Rc::clone(&received);
    let id = group
        .add_sock(server, move |sock| {
            let mut buf = [0u8; 64];
            loop {
                match sock.recv(&mut buf) {
                    Ok(0) => break,
                    Ok(n) => {
                        r.borrow_mut().extend_from_slice(&buf[.. n])
                    }
                    Err(_) => break,
                }
            }
        })
        .expect("add to group");

    let mut spins = 0;
    while received.borrow().len() < 11 {
        client.flush();
        group.poll(32).expect("group poll");
        spins += 1;
        if spins > 2000 {
            panic!("echo data never arrived");
        }
        std::thread::sleep(std::time::Duration::from_millis(1));
    }

    assert_eq!(&received.borrow()[..], b"hello world");
    assert_eq!(written.borrow().as_slice(), &[0], "one callback, status 0");

    let server = group.remove_sock(id).expect("sock back out of the group");
    assert_eq!(group.len(), 0);
    drop(server);
}

#[test]
fn queued_writes_cancelled_on_close() {
    common::test_init();
    register_default_impls();

    let port = 37252;
    let _listener = match Sock::listen(&format!("127.0.0.1:{}", port)) {
        Ok(l) => l,
        Err(_) => return,
    };

    let mut client =
        Sock::connect(&format!("127.0.0.1:{}", port)).expect("connect");

    // stuff the socket until the kernel buffer pushes back and requests
    // stay queued
    let chunk = vec![0u8; 256 * 1024];
    let statuses = Rc::new(RefCell::new(Vec::new()));
    for _ in 0 .. 64 {
        let s = Rc::clone(&statuses);
        client.writev_async(vec![chunk.clone()], move |status| {
            s.borrow_mut().push(status);
        });
        if client.queued_requests() > 0 {
            break;
        }
    }

    if client.queued_requests() == 0 {
        // everything fit; nothing left to cancel
        client.close();
        return;
    }

    let queued = client.queued_requests();
    client.close();
    assert!(client.is_closed());

    let cancelled = statuses
        .borrow()
        .iter()
        .filter(|s| **s == -(nix::errno::Errno::ECANCELED as i32))
        .count();
    assert_eq!(cancelled, queued, "every queued request was cancelled");
}

#[test]
fn close_from_callback_is_deferred() {
    common::test_init();

    let mut group = fresh_group();

    let port = 37253;
    let mut listener = match Sock::listen(&format!("127.0.0.1:{}", port)) {
        Ok(l) => l,
        Err(_) => return,
    };

    let mut client =
        Sock::connect(&format!("127.0.0.1:{}", port)).expect("connect");

    let mut server = None;
    for _ in 0 .. 1000 {
        if let Some(s) = listener.accept().expect("accept") {
            server = Some(s);
            break;
        }
        std::thread::sleep(std::time::Duration::from_millis(1));
    }
    let server = server.expect("no connection accepted");

    let closed_inside = Rc::new(RefCell::new(false));
    let c = Rc::clone(&closed_inside);
    group
        .add_sock(server, move |sock| {
            let mut buf = [0u8; 16];
            let _ = sock.recv(&mut buf);
            // closing from within the callback must not tear the socket
            // down under our feet
            sock.close();
            assert!(sock.is_closed());
            *c.borrow_mut() = true;
        })
        .unwrap();

    client.writev_async(vec![b"x".to_vec()], |_| {});

    let mut spins = 0;
    while !*closed_inside.borrow() {
        client.flush();
        group.poll(32).expect("group poll");
        spins += 1;
        if spins > 2000 {
            panic!("server callback never ran");
        }
        std::thread::sleep(std::time::Duration::from_millis(1));
    }

    // the group reaped the closed socket after the callback unwound
    assert_eq!(group.len(), 0);
    client.close();
}
