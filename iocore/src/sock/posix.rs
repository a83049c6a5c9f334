//! Non-blocking TCP implementation of the sock contract, polled through
//! epoll. Connect is blocking (it happens on management paths only); all
//! data paths are non-blocking.

use std::{
    io::Read,
    net::{TcpListener, TcpStream},
    os::unix::io::{AsRawFd, RawFd},
};

use nix::{
    errno::Errno,
    sys::epoll::{
        epoll_create1,
        epoll_ctl,
        epoll_wait,
        EpollCreateFlags,
        EpollEvent,
        EpollFlags,
        EpollOp,
    },
    sys::uio::{writev, IoVec},
};

use crate::sock::{GroupImpl, NetImpl, SockOps};

#[derive(Default)]
pub struct PosixNet {}

impl NetImpl for PosixNet {
    fn name(&self) -> &'static str {
        "posix"
    }

    fn connect(
        &self,
        addr: &str,
        port: u16,
    ) -> Result<Box<dyn SockOps>, Errno> {
        let stream =
            TcpStream::connect((addr, port)).map_err(errno_from_io)?;
        stream.set_nonblocking(true).map_err(errno_from_io)?;
        stream.set_nodelay(true).map_err(errno_from_io)?;
        Ok(Box::new(PosixConn {
            stream: Some(stream),
        }))
    }

    fn listen(
        &self,
        addr: &str,
        port: u16,
    ) -> Result<Box<dyn SockOps>, Errno> {
        let listener =
            TcpListener::bind((addr, port)).map_err(errno_from_io)?;
        listener.set_nonblocking(true).map_err(errno_from_io)?;
        Ok(Box::new(PosixListener {
            listener: Some(listener),
        }))
    }

    fn group_impl(&self) -> Result<Box<dyn GroupImpl>, Errno> {
        let epfd = epoll_create1(EpollCreateFlags::empty())
            .map_err(errno_from_nix)?;
        Ok(Box::new(PosixGroup {
            epfd,
        }))
    }
}

fn errno_from_io(e: std::io::Error) -> Errno {
    Errno::from_i32(e.raw_os_error().unwrap_or(libc::EIO))
}

fn errno_from_nix(e: nix::Error) -> Errno {
    e.as_errno().unwrap_or(Errno::EIO)
}

struct PosixConn {
    stream: Option<TcpStream>,
}

impl PosixConn {
    fn stream(&mut self) -> Result<&mut TcpStream, Errno> {
        self.stream.as_mut().ok_or(Errno::EBADF)
    }
}

impl SockOps for PosixConn {
    fn accept(&mut self) -> Result<Option<Box<dyn SockOps>>, Errno> {
        Err(Errno::ENOTSUP)
    }

    fn recv(&mut self, buf: &mut [u8]) -> Result<usize, Errno> {
        match self.stream()?.read(buf) {
            Ok(n) => Ok(n),
            Err(ref e)
                if e.kind() == std::io::ErrorKind::WouldBlock =>
            {
                Err(Errno::EAGAIN)
            }
            Err(e) => Err(errno_from_io(e)),
        }
    }

    fn writev(&mut self, iovs: &[&[u8]]) -> Result<usize, Errno> {
        let fd = self.stream()?.as_raw_fd();
        let vecs: Vec<IoVec<&[u8]>> =
            iovs.iter().map(|s| IoVec::from_slice(*s)).collect();
        writev(fd, &vecs).map_err(errno_from_nix)
    }

    fn close(&mut self) {
        // dropping the stream closes the fd
        self.stream.take();
    }

    fn fd(&self) -> RawFd {
        self.stream.as_ref().map(|s| s.as_raw_fd()).unwrap_or(-1)
    }
}

struct PosixListener {
    listener: Option<TcpListener>,
}

impl SockOps for PosixListener {
    fn accept(&mut self) -> Result<Option<Box<dyn SockOps>>, Errno> {
        let listener = self.listener.as_mut().ok_or(Errno::EBADF)?;
        match listener.accept() {
            Ok((stream, _peer)) => {
                stream.set_nonblocking(true).map_err(errno_from_io)?;
                stream.set_nodelay(true).map_err(errno_from_io)?;
                Ok(Some(Box::new(PosixConn {
                    stream: Some(stream),
                })))
            }
            Err(ref e)
                if e.kind() == std::io::ErrorKind::WouldBlock =>
            {
                Ok(None)
            }
            Err(e) => Err(errno_from_io(e)),
        }
    }

    fn recv(&mut self, _buf: &mut [u8]) -> Result<usize, Errno> {
        Err(Errno::ENOTSUP)
    }

    fn writev(&mut self, _iovs: &[&[u8]]) -> Result<usize, Errno> {
        Err(Errno::ENOTSUP)
    }

    fn close(&mut self) {
        self.listener.take();
    }

    fn fd(&self) -> RawFd {
        self.listener.as_ref().map(|l| l.as_raw_fd()).unwrap_or(-1)
    }
}

struct PosixGroup {
    epfd: RawFd,
}

impl GroupImpl for PosixGroup {
    fn add(&mut self, id: u64, sock: &dyn SockOps) -> Result<(), Errno> {
        let mut ev = EpollEvent::new(EpollFlags::EPOLLIN, id);
        epoll_ctl(self.epfd, EpollOp::EpollCtlAdd, sock.fd(), &mut ev)
            .map_err(errno_from_nix)
    }

    fn remove(&mut self, _id: u64, sock: &dyn SockOps) -> Result<(), Errno> {
        if sock.fd() < 0 {
            // fd already went away with the socket
            return Ok(());
        }
        let mut ev = EpollEvent::new(EpollFlags::EPOLLIN, 0);
        epoll_ctl(self.epfd, EpollOp::EpollCtlDel, sock.fd(), &mut ev)
            .map_err(errno_from_nix)
    }

    fn poll(
        &mut self,
        max: usize,
        ready: &mut Vec<u64>,
    ) -> Result<usize, Errno> {
        let mut events = vec![EpollEvent::empty(); max.max(1)];
        let n = epoll_wait(self.epfd, &mut events, 0)
            .map_err(errno_from_nix)?;
        for ev in events.iter().take(n) {
            ready.push(ev.data());
        }
        Ok(n)
    }
}

impl Drop for PosixGroup {
    fn drop(&mut self) {
        let _ = nix::unistd::close(self.epfd);
    }
}
