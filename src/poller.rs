// src/poller.rs
use crate::context::Context;
use crate::error::Error;
use crate::promise::{Promise, Wait};
use mio::unix::SourceFd;
use mio::{Events, Interest, Poll, Registry, Token};
use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::io;
use std::net::ToSocketAddrs;
use std::os::fd::{IntoRawFd, RawFd};
use std::rc::{Rc, Weak};
use std::sync::Arc;
use std::time::Duration;
use tracing::trace;

// Reserved for the cross-thread wake-up; fd tokens count up from zero.
const WAKER_TOKEN: Token = Token(usize::MAX);

/// OS-facing readiness notification. Blocks in `wait` up to a bounded
/// timeout; returns when any registered descriptor is ready, a threadsafe
/// wake-up is posted, or the timeout elapses. Spurious returns are fine —
/// waiters retry their non-blocking I/O and re-wait.
pub(crate) struct Poller {
    io: RefCell<PollIo>,
    registry: Registry,
    waker: Arc<mio::Waker>,
    fds: RefCell<HashMap<usize, Rc<FdShared>>>,
    next_token: Cell<usize>,
}

struct PollIo {
    poll: Poll,
    events: Events,
}

struct FdShared {
    fd: RawFd,
    token: usize,
    waiters: RefCell<Vec<Promise<()>>>,
    closed: Cell<bool>,
}

impl Poller {
    pub(crate) fn new() -> Result<Self, Error> {
        let poll = Poll::new()?;
        let waker = Arc::new(mio::Waker::new(poll.registry(), WAKER_TOKEN)?);
        let registry = poll.registry().try_clone()?;
        Ok(Self {
            io: RefCell::new(PollIo {
                poll,
                events: Events::with_capacity(1024),
            }),
            registry,
            waker,
            fds: RefCell::new(HashMap::new()),
            next_token: Cell::new(0),
        })
    }

    pub(crate) fn waker(&self) -> Arc<mio::Waker> {
        self.waker.clone()
    }

    /// Block until readiness, wake-up, or timeout; then settle the readiness
    /// promises of every descriptor that fired.
    pub(crate) fn wait(&self, timeout: Duration) -> Result<(), Error> {
        let ready: Vec<Rc<FdShared>> = {
            let mut io = self.io.borrow_mut();
            let PollIo { poll, events } = &mut *io;
            if let Err(err) = poll.poll(events, Some(timeout)) {
                if err.kind() == io::ErrorKind::Interrupted {
                    return Ok(());
                }
                return Err(err.into());
            }
            let fds = self.fds.borrow();
            events
                .iter()
                .filter(|ev| ev.token() != WAKER_TOKEN)
                .filter_map(|ev| fds.get(&ev.token().0).cloned())
                .collect()
        };
        for fd in ready {
            trace!(fd = fd.fd, "readiness");
            let waiters = std::mem::take(&mut *fd.waiters.borrow_mut());
            for waiter in waiters {
                waiter.complete(Ok(()));
            }
        }
        Ok(())
    }

    /// Register `fd` for readiness events. Switches it to non-blocking mode.
    pub(crate) fn open(poller: &Rc<Poller>, fd: RawFd) -> Result<AsyncFd, Error> {
        set_nonblocking(fd)?;
        let token = poller.next_token.get();
        poller.next_token.set(token + 1);
        poller.registry.register(
            &mut SourceFd(&fd),
            Token(token),
            Interest::READABLE | Interest::WRITABLE,
        )?;
        let shared = Rc::new(FdShared {
            fd,
            token,
            waiters: RefCell::new(Vec::new()),
            closed: Cell::new(false),
        });
        poller.fds.borrow_mut().insert(token, shared.clone());
        Ok(AsyncFd {
            shared,
            poller: Rc::downgrade(poller),
        })
    }

    /// A non-blocking pipe, both ends registered.
    pub(crate) fn pipe(poller: &Rc<Poller>) -> Result<(AsyncFd, AsyncFd), Error> {
        let mut fds = [0 as libc::c_int; 2];
        if unsafe { libc::pipe(fds.as_mut_ptr()) } != 0 {
            return Err(io::Error::last_os_error().into());
        }
        let (rfd, wfd) = (fds[0], fds[1]);
        let r = match Poller::open(poller, rfd) {
            Ok(r) => r,
            Err(err) => {
                unsafe {
                    libc::close(rfd);
                    libc::close(wfd);
                }
                return Err(err);
            }
        };
        let w = match Poller::open(poller, wfd) {
            Ok(w) => w,
            Err(err) => {
                let _ = r.close();
                unsafe {
                    libc::close(wfd);
                }
                return Err(err);
            }
        };
        Ok((r, w))
    }

    /// Establish a connection. Only `"tcp"` is supported. The in-progress
    /// connect is awaited through the readiness path, so `ctx` cancellation
    /// aborts it.
    pub(crate) async fn dial(
        poller: &Rc<Poller>,
        ctx: &Context,
        network: &str,
        address: &str,
    ) -> Result<AsyncFd, Error> {
        if network != "tcp" {
            return Err(Error::msg(format!("unsupported network {network:?}")));
        }
        let addr = address
            .to_socket_addrs()
            .map_err(Error::from)?
            .next()
            .ok_or_else(|| Error::msg(format!("no addresses resolved for {address:?}")))?;
        let stream = mio::net::TcpStream::connect(addr)?;
        let fd = Poller::open(poller, stream.into_raw_fd())?;
        if let Err(err) = fd.wait_for_ready(ctx).await {
            let _ = fd.close();
            return Err(err);
        }
        if let Err(err) = take_socket_error(fd.raw_fd()) {
            let _ = fd.close();
            return Err(err);
        }
        Ok(fd)
    }

    fn close_fd(&self, shared: &FdShared) -> Result<(), Error> {
        self.fds.borrow_mut().remove(&shared.token);
        let _ = self.registry.deregister(&mut SourceFd(&shared.fd));
        if unsafe { libc::close(shared.fd) } != 0 {
            return Err(io::Error::last_os_error().into());
        }
        Ok(())
    }
}

/// A registered non-blocking file descriptor. `read`/`write` return
/// [`Error::WouldBlock`] when the kernel cannot make progress;
/// `wait_for_ready` suspends until the next readiness event.
pub struct AsyncFd {
    shared: Rc<FdShared>,
    poller: Weak<Poller>,
}

impl AsyncFd {
    #[inline]
    pub fn raw_fd(&self) -> RawFd {
        self.shared.fd
    }

    /// Non-blocking read. `Ok(0)` means end of file.
    pub fn read(&self, buf: &mut [u8]) -> Result<usize, Error> {
        loop {
            let n = unsafe {
                libc::read(
                    self.shared.fd,
                    buf.as_mut_ptr() as *mut libc::c_void,
                    buf.len(),
                )
            };
            if n >= 0 {
                return Ok(n as usize);
            }
            let errno = last_errno();
            if errno == libc::EINTR {
                continue;
            }
            if errno == libc::EAGAIN || errno == libc::EWOULDBLOCK {
                return Err(Error::WouldBlock);
            }
            return Err(io::Error::last_os_error().into());
        }
    }

    /// Non-blocking write.
    pub fn write(&self, buf: &[u8]) -> Result<usize, Error> {
        loop {
            let n = unsafe {
                libc::write(
                    self.shared.fd,
                    buf.as_ptr() as *const libc::c_void,
                    buf.len(),
                )
            };
            if n >= 0 {
                return Ok(n as usize);
            }
            let errno = last_errno();
            if errno == libc::EINTR {
                continue;
            }
            if errno == libc::EAGAIN || errno == libc::EWOULDBLOCK {
                return Err(Error::WouldBlock);
            }
            return Err(io::Error::last_os_error().into());
        }
    }

    /// A future completed by the descriptor's next readiness event.
    pub fn wait_for_ready(&self, ctx: &Context) -> Wait<()> {
        let fut: Promise<()> = Promise::new();
        if self.shared.closed.get() {
            fut.complete(Err(Error::Eof));
        } else {
            self.shared.waiters.borrow_mut().push(fut.clone());
        }
        fut.wait(ctx)
    }

    /// Deregister and close. Outstanding readiness waiters are cancelled so
    /// no task stays suspended on a dead descriptor. Idempotent.
    pub fn close(&self) -> Result<(), Error> {
        if self.shared.closed.replace(true) {
            return Ok(());
        }
        let waiters = std::mem::take(&mut *self.shared.waiters.borrow_mut());
        for waiter in waiters {
            waiter.cancel(None);
        }
        match self.poller.upgrade() {
            Some(poller) => poller.close_fd(&self.shared),
            None => {
                if unsafe { libc::close(self.shared.fd) } != 0 {
                    return Err(io::Error::last_os_error().into());
                }
                Ok(())
            }
        }
    }
}

fn set_nonblocking(fd: RawFd) -> Result<(), Error> {
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };
    if flags < 0 {
        return Err(io::Error::last_os_error().into());
    }
    if unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) } < 0 {
        return Err(io::Error::last_os_error().into());
    }
    Ok(())
}

fn take_socket_error(fd: RawFd) -> Result<(), Error> {
    let mut err: libc::c_int = 0;
    let mut len = std::mem::size_of::<libc::c_int>() as libc::socklen_t;
    let rc = unsafe {
        libc::getsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_ERROR,
            &mut err as *mut _ as *mut libc::c_void,
            &mut len,
        )
    };
    if rc != 0 {
        return Err(io::Error::last_os_error().into());
    }
    if err != 0 {
        return Err(io::Error::from_raw_os_error(err).into());
    }
    Ok(())
}

fn last_errno() -> libc::c_int {
    io::Error::last_os_error().raw_os_error().unwrap_or(0)
}
