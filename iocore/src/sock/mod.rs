//! Pluggable socket abstraction. Implementations register at startup; a
//! sock group bundles sockets from one or more implementations for
//! event-driven polling.
//!
//! Async writes are queued on the socket, which owns the request until its
//! callback runs: exactly once, with 0 on success, a negated errno on
//! failure, or -ECANCELED when the socket is closed with the request still
//! queued. Closing a socket from within a callback is deferred until the
//! callback stack unwinds; this is tracked with a callback depth counter
//! and a closed flag.

pub mod posix;

use std::{
    collections::{HashMap, VecDeque},
    os::unix::io::RawFd,
    sync::Arc,
};

use nix::errno::Errno;
use once_cell::sync::Lazy;
use parking_lot::Mutex;
use snafu::Snafu;

#[derive(Debug, Snafu)]
pub enum SockError {
    #[snafu(display("socket is closed"))]
    Closed {},
    #[snafu(display("socket is still part of a group"))]
    Busy {},
    #[snafu(display("invalid address '{}'", addr))]
    InvalidAddress { addr: String },
    #[snafu(display("no socket implementation accepted the request"))]
    NoImplementation {},
    #[snafu(display("socket error: {}", source))]
    Os { source: Errno },
}

/// One transport implementation (posix TCP, user-space stacks, ...).
pub trait NetImpl: Send + Sync {
    fn name(&self) -> &'static str;
    fn connect(&self, addr: &str, port: u16) -> Result<Box<dyn SockOps>, Errno>;
    fn listen(&self, addr: &str, port: u16) -> Result<Box<dyn SockOps>, Errno>;
    fn group_impl(&self) -> Result<Box<dyn GroupImpl>, Errno>;
}

/// Per-connection operations provided by an implementation.
pub trait SockOps: Send {
    /// accept a connection on a listening socket
    fn accept(&mut self) -> Result<Option<Box<dyn SockOps>>, Errno>;
    fn recv(&mut self, buf: &mut [u8]) -> Result<usize, Errno>;
    fn writev(&mut self, iovs: &[&[u8]]) -> Result<usize, Errno>;
    fn close(&mut self);
    /// readiness handle used by the group implementation
    fn fd(&self) -> RawFd;
}

/// Event-polling side of an implementation.
pub trait GroupImpl: Send {
    fn add(&mut self, id: u64, sock: &dyn SockOps) -> Result<(), Errno>;
    fn remove(&mut self, id: u64, sock: &dyn SockOps) -> Result<(), Errno>;
    /// collect up to `max` ready socket ids
    fn poll(&mut self, max: usize, ready: &mut Vec<u64>)
        -> Result<usize, Errno>;
}

static IMPLS: Lazy<Mutex<Vec<Arc<dyn NetImpl>>>> =
    Lazy::new(|| Mutex::new(Vec::new()));

/// Register a socket implementation. Implementations are consulted in
/// registration order when connecting or listening.
pub fn register_impl(imp: Arc<dyn NetImpl>) {
    info!("registered sock implementation '{}'", imp.name());
    IMPLS.lock().push(imp);
}

/// Register the built-in implementations; idempotent.
pub fn register_default_impls() {
    let mut impls = IMPLS.lock();
    if !impls.iter().any(|i| i.name() == "posix") {
        impls.push(Arc::new(posix::PosixNet::default()));
        info!("registered sock implementation 'posix'");
    }
}

fn parse_addr(uri: &str) -> Result<(String, u16), SockError> {
    let mut parts = uri.rsplitn(2, ':');
    let port = parts
        .next()
        .and_then(|p| p.parse::<u16>().ok())
        .ok_or_else(|| SockError::InvalidAddress {
            addr: uri.to_string(),
        })?;
    let host = parts.next().ok_or_else(|| SockError::InvalidAddress {
        addr: uri.to_string(),
    })?;
    Ok((host.to_string(), port))
}

/// A queued asynchronous write request; owned by the socket until the
/// callback has been invoked.
struct SockRequest {
    iovs: Vec<Vec<u8>>,
    /// bytes already transmitted across the iovs
    offset: usize,
    cb: Option<Box<dyn FnOnce(i32)>>,
}

impl SockRequest {
    fn complete(mut self, status: i32) {
        if let Some(cb) = self.cb.take() {
            cb(status);
        }
    }

    fn total(&self) -> usize {
        self.iovs.iter().map(|v| v.len()).sum()
    }
}

pub struct Sock {
    ops: Box<dyn SockOps>,
    impl_name: &'static str,
    queued: VecDeque<SockRequest>,
    /// callback depth; destructive operations are deferred while > 0
    cb_cnt: u32,
    closed: bool,
    finalized: bool,
}

impl Sock {
    fn new(ops: Box<dyn SockOps>, impl_name: &'static str) -> Self {
        Self {
            ops,
            impl_name,
            queued: VecDeque::new(),
            cb_cnt: 0,
            closed: false,
            finalized: false,
        }
    }

    /// Connect to `host:port`, trying each registered implementation in
    /// order.
    pub fn connect(uri: &str) -> Result<Sock, SockError> {
        let (host, port) = parse_addr(uri)?;
        for imp in IMPLS.lock().iter() {
            match imp.connect(&host, port) {
                Ok(ops) => return Ok(Sock::new(ops, imp.name())),
                Err(e) => {
                    debug!("{}: connect to {} failed: {}", imp.name(), uri, e)
                }
            }
        }
        Err(SockError::NoImplementation {})
    }

    /// Listen on `host:port`.
    pub fn listen(uri: &str) -> Result<Sock, SockError> {
        let (host, port) = parse_addr(uri)?;
        for imp in IMPLS.lock().iter() {
            match imp.listen(&host, port) {
                Ok(ops) => return Ok(Sock::new(ops, imp.name())),
                Err(e) => {
                    debug!("{}: listen on {} failed: {}", imp.name(), uri, e)
                }
            }
        }
        Err(SockError::NoImplementation {})
    }

    /// Accept a pending connection, None when nothing is pending.
    pub fn accept(&mut self) -> Result<Option<Sock>, SockError> {
        if self.closed {
            return Err(SockError::Closed {});
        }
        let name = self.impl_name;
        match self.ops.accept() {
            Ok(Some(ops)) => Ok(Some(Sock::new(ops, name))),
            Ok(None) => Ok(None),
            Err(e) => Err(SockError::Os {
                source: e,
            }),
        }
    }

    pub fn recv(&mut self, buf: &mut [u8]) -> Result<usize, SockError> {
        if self.closed {
            return Err(SockError::Closed {});
        }
        self.ops.recv(buf).map_err(|source| SockError::Os {
            source,
        })
    }

    /// Queue an asynchronous write. The request is owned by the socket; the
    /// callback is invoked exactly once.
    pub fn writev_async(
        &mut self,
        iovs: Vec<Vec<u8>>,
        cb: impl FnOnce(i32) + 'static,
    ) {
        if self.closed {
            cb(-(Errno::EBADF as i32));
            return;
        }
        self.queued.push_back(SockRequest {
            iovs,
            offset: 0,
            cb: Some(Box::new(cb)),
        });
        self.flush();
    }

    /// Push queued requests into the implementation. Completed requests
    /// invoke their callbacks here; a callback is free to queue more writes
    /// or close the socket.
    pub fn flush(&mut self) {
        while let Some(front) = self.queued.front() {
            // rebuild the iov view past what was already written
            let mut skip = front.offset;
            let mut iovs: Vec<&[u8]> = Vec::with_capacity(front.iovs.len());
            for v in front.iovs.iter() {
                if skip >= v.len() {
                    skip -= v.len();
                    continue;
                }
                iovs.push(&v[skip ..]);
                skip = 0;
            }

            let rc = if iovs.is_empty() {
                Ok(0)
            } else {
                self.ops.writev(&iovs)
            };

            match rc {
                Ok(n) => {
                    let front = self.queued.front_mut().unwrap();
                    front.offset += n;
                    if front.offset >= front.total() {
                        let req = self.queued.pop_front().unwrap();
                        self.cb_cnt += 1;
                        req.complete(0);
                        self.cb_cnt -= 1;
                        self.maybe_finalize();
                        if self.closed {
                            return;
                        }
                    } else {
                        // short write, try again on the next poll
                        return;
                    }
                }
                Err(Errno::EAGAIN) => return,
                Err(e) => {
                    let req = self.queued.pop_front().unwrap();
                    self.cb_cnt += 1;
                    req.complete(-(e as i32));
                    self.cb_cnt -= 1;
                    self.maybe_finalize();
                    return;
                }
            }
        }
    }

    /// Close the socket. If called from within a callback the close is
    /// deferred until the callback stack unwinds; queued requests are
    /// cancelled with -ECANCELED.
    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;

        if self.cb_cnt > 0 {
            // let the callback unwind before destroying the socket
            return;
        }
        self.finalize();
    }

    fn maybe_finalize(&mut self) {
        if self.closed && self.cb_cnt == 0 {
            self.finalize();
        }
    }

    fn finalize(&mut self) {
        if self.finalized {
            return;
        }
        self.finalized = true;
        self.abort_requests();
        self.ops.close();
    }

    /// cancel every queued request
    fn abort_requests(&mut self) {
        while let Some(req) = self.queued.pop_front() {
            self.cb_cnt += 1;
            req.complete(-(Errno::ECANCELED as i32));
            self.cb_cnt -= 1;
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    pub fn queued_requests(&self) -> usize {
        self.queued.len()
    }
}

impl Drop for Sock {
    fn drop(&mut self) {
        self.closed = true;
        if !self.finalized {
            self.finalize();
        }
    }
}

struct GroupedSock {
    sock: Sock,
    cb: Box<dyn FnMut(&mut Sock)>,
}

/// Bundles sockets from one or more implementations for polling. Each
/// ready socket gets its registered callback invoked; sockets closed from
/// inside the callback are reaped after the callback returns.
pub struct SockGroup {
    groups: HashMap<&'static str, Box<dyn GroupImpl>>,
    socks: HashMap<u64, GroupedSock>,
    next_id: u64,
}

impl Default for SockGroup {
    fn default() -> Self {
        Self::new()
    }
}

impl SockGroup {
    pub fn new() -> Self {
        Self {
            groups: HashMap::new(),
            socks: HashMap::new(),
            next_id: 1,
        }
    }

    /// Move the socket into the group. The callback runs whenever the
    /// socket is ready for reading.
    pub fn add_sock(
        &mut self,
        sock: Sock,
        cb: impl FnMut(&mut Sock) + 'static,
    ) -> Result<u64, SockError> {
        if sock.is_closed() {
            return Err(SockError::Closed {});
        }

        let name = sock.impl_name;
        if !self.groups.contains_key(name) {
            let imp = IMPLS
                .lock()
                .iter()
                .find(|i| i.name() == name)
                .cloned()
                .ok_or(SockError::NoImplementation {})?;
            let group =
                imp.group_impl().map_err(|source| SockError::Os {
                    source,
                })?;
            self.groups.insert(name, group);
        }

        let id = self.next_id;
        self.next_id += 1;

        self.groups
            .get_mut(name)
            .unwrap()
            .add(id, sock.ops.as_ref())
            .map_err(|source| SockError::Os {
                source,
            })?;

        self.socks.insert(
            id,
            GroupedSock {
                sock,
                cb: Box::new(cb),
            },
        );
        Ok(id)
    }

    /// Take a socket out of the group again.
    pub fn remove_sock(&mut self, id: u64) -> Option<Sock> {
        let entry = self.socks.remove(&id)?;
        if let Some(group) = self.groups.get_mut(entry.sock.impl_name) {
            let _ = group.remove(id, entry.sock.ops.as_ref());
        }
        Some(entry.sock)
    }

    /// Poll all underlying implementations and dispatch callbacks for ready
    /// sockets. Returns the number of callbacks dispatched.
    pub fn poll(&mut self, max_events: usize) -> Result<usize, SockError> {
        let mut ready: Vec<u64> = Vec::new();
        for group in self.groups.values_mut() {
            group.poll(max_events, &mut ready).map_err(|source| {
                SockError::Os {
                    source,
                }
            })?;
        }

        // writes progress on every poll, readiness or not
        let flush_ids: Vec<u64> = self
            .socks
            .iter()
            .filter(|(_, e)| !e.sock.queued.is_empty())
            .map(|(id, _)| *id)
            .collect();
        for id in flush_ids {
            if let Some(entry) = self.socks.get_mut(&id) {
                entry.sock.flush();
            }
        }

        let mut dispatched = 0;
        for id in ready {
            // detach the entry so the callback can use the group freely
            let mut entry = match self.socks.remove(&id) {
                Some(e) => e,
                None => continue,
            };

            entry.sock.cb_cnt += 1;
            (entry.cb)(&mut entry.sock);
            entry.sock.cb_cnt -= 1;
            dispatched += 1;

            if entry.sock.is_closed() {
                if let Some(group) = self.groups.get_mut(entry.sock.impl_name)
                {
                    let _ = group.remove(id, entry.sock.ops.as_ref());
                }
                entry.sock.maybe_finalize();
                // dropped here
            } else {
                self.socks.insert(id, entry);
            }
        }

        // reap sockets closed outside of the dispatch loop
        let dead: Vec<u64> = self
            .socks
            .iter()
            .filter(|(_, e)| e.sock.is_closed())
            .map(|(id, _)| *id)
            .collect();
        for id in dead {
            if let Some(mut entry) = self.socks.remove(&id) {
                if let Some(group) = self.groups.get_mut(entry.sock.impl_name)
                {
                    let _ = group.remove(id, entry.sock.ops.as_ref());
                }
                entry.sock.maybe_finalize();
            }
        }

        Ok(dispatched)
    }

    pub fn len(&self) -> usize {
        self.socks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.socks.is_empty()
    }
}
