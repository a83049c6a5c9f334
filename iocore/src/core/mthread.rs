//! A thread here is not an OS thread: it is a container to which work can be
//! submitted and which is polled, by one reactor, to drive that work to
//! completion. Each thread owns a message ring, a set of pollers and the
//! I/O channels that were created on it. All callbacks submitted to a thread
//! run within that thread's context, which is tracked in TLS so that code
//! can verify it runs where it is supposed to.
//!
//! Messages are multi-producer single-consumer: any thread may enqueue, only
//! the owning reactor dequeues. The ring has a fixed capacity and enqueueing
//! into a full ring is reported to the sender rather than blocking.

use std::{
    any::Any,
    cell::{Cell, RefCell},
    collections::HashMap,
    fmt,
    rc::Rc,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};

use crossbeam::{atomic::AtomicCell, queue::ArrayQueue};
use once_cell::sync::Lazy;
use parking_lot::Mutex;

use crate::core::{ticks, CoreError};

/// default capacity of the per-thread message ring
pub const MSG_RING_CAPACITY: usize = 65536;

type Msg = Box<dyn FnOnce() + Send + 'static>;

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ThreadState {
    Running,
    Exiting,
    Exited,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum PollStatus {
    Busy,
    Idle,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) enum PollerState {
    Waiting,
    Running,
    Paused,
    UnregisterPending,
}

/// poller bookkeeping shared between the thread and the poller handle
pub(crate) struct PollerEntry {
    pub(crate) id: u64,
    pub(crate) name: String,
    pub(crate) poll_fn: RefCell<Box<dyn FnMut() -> i32 + 'static>>,
    pub(crate) state: Cell<PollerState>,
    pub(crate) period_ticks: u64,
    pub(crate) next_tick: Cell<u64>,
}

impl PollerEntry {
    fn is_timed(&self) -> bool {
        self.period_ticks > 0
    }
}

/// per-thread channel slot; only ever touched from the owning thread
pub(crate) struct ChannelSlot {
    pub(crate) refs: u32,
    pub(crate) ctx: Box<dyn Any>,
    pub(crate) destroy_pending: bool,
}

/// the part of a thread that only its owning OS thread may touch
#[derive(Default)]
pub(crate) struct ThreadLocal {
    pub(crate) pollers: Vec<Rc<PollerEntry>>,
    pub(crate) channels: HashMap<u64, ChannelSlot>,
}

pub(crate) struct ThreadInner {
    id: u64,
    name: String,
    core: u32,
    msgs: ArrayQueue<Msg>,
    state: AtomicCell<ThreadState>,
    owner: AtomicCell<Option<std::thread::ThreadId>>,
}

/// Handle to a thread. The handle is freely clonable and sendable and is
/// valid as a message target from any context; polling and all local state
/// access must happen on the OS thread that owns it.
#[derive(Clone)]
pub struct Mthread(pub(crate) Arc<ThreadInner>);

impl fmt::Debug for Mthread {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Mthread")
            .field("id", &self.0.id)
            .field("name", &self.0.name)
            .field("core", &self.0.core)
            .field("state", &self.0.state.load())
            .finish()
    }
}

impl PartialEq for Mthread {
    fn eq(&self, other: &Self) -> bool {
        self.0.id == other.0.id
    }
}

static THREAD_ID: AtomicU64 = AtomicU64::new(1);
static THREADS: Lazy<Mutex<Vec<Mthread>>> = Lazy::new(|| Mutex::new(Vec::new()));

thread_local! {
    /// local state of every thread adopted by this OS thread
    static LOCALS: RefCell<HashMap<u64, ThreadLocal>> =
        RefCell::new(HashMap::new());
    /// context stack; the top is the current thread
    static CURRENT: RefCell<Vec<Mthread>> = RefCell::new(Vec::new());
}

impl Mthread {
    /// Create a new thread with the default message ring capacity and
    /// register it. The thread is bound to the OS thread that first polls or
    /// enters it.
    pub fn new(name: String, core: u32) -> Option<Self> {
        Self::with_capacity(name, core, MSG_RING_CAPACITY)
    }

    /// As [`Mthread::new`] with an explicit message ring capacity.
    pub fn with_capacity(name: String, core: u32, cap: usize) -> Option<Self> {
        let t = Mthread(Arc::new(ThreadInner {
            id: THREAD_ID.fetch_add(1, Ordering::Relaxed),
            name,
            core,
            msgs: ArrayQueue::new(cap),
            state: AtomicCell::new(ThreadState::Running),
            owner: AtomicCell::new(None),
        }));
        THREADS.lock().push(t.clone());
        debug!("{:?} created", t);
        Some(t)
    }

    /// the thread whose context the caller currently runs in
    pub fn current() -> Option<Mthread> {
        CURRENT.with(|c| c.borrow().last().cloned())
    }

    pub fn id(&self) -> u64 {
        self.0.id
    }

    pub fn name(&self) -> &str {
        &self.0.name
    }

    pub fn core(&self) -> u32 {
        self.0.core
    }

    pub fn lookup_by_name(name: &str) -> Option<Mthread> {
        THREADS.lock().iter().find(|t| t.0.name == name).cloned()
    }

    /// all threads in registration order
    pub fn threads() -> Vec<Mthread> {
        THREADS.lock().clone()
    }

    /// Bind the thread to the calling OS thread on first use and verify the
    /// binding afterwards. All local state lives in the TLS of the owner.
    fn adopt(&self) {
        let me = std::thread::current().id();
        match self.0.owner.load() {
            None => {
                self.0.owner.store(Some(me));
                LOCALS.with(|l| {
                    l.borrow_mut().insert(self.0.id, ThreadLocal::default())
                });
            }
            Some(owner) => {
                assert_eq!(
                    owner, me,
                    "thread '{}' accessed from a foreign OS thread",
                    self.0.name
                );
            }
        }
    }

    /// Enter the context of this thread. Context is a stack so nested enters
    /// are allowed; every enter must be paired with a [`Mthread::leave`].
    pub fn enter(&self) {
        self.adopt();
        CURRENT.with(|c| c.borrow_mut().push(self.clone()));
    }

    /// Leave the context of this thread.
    pub fn leave(&self) {
        CURRENT.with(|c| {
            let top = c.borrow_mut().pop();
            assert!(
                matches!(top, Some(ref t) if t == self),
                "unbalanced thread context"
            );
        });
    }

    /// With the given thread as context, execute the closure on that thread.
    pub fn with<R>(&self, f: impl FnOnce() -> R) -> R {
        self.enter();
        let out = f();
        self.leave();
        out
    }

    /// access this thread's local state; caller must be the owner
    pub(crate) fn with_local<R>(
        &self,
        f: impl FnOnce(&mut ThreadLocal) -> R,
    ) -> R {
        self.adopt();
        LOCALS.with(|l| {
            let mut map = l.borrow_mut();
            let local = map
                .get_mut(&self.0.id)
                .expect("thread local state missing");
            f(local)
        })
    }

    /// Send a message to this thread. The closure runs, in order with other
    /// messages from the same sender, during one of the next polls of the
    /// target. Fails when the ring is saturated; callers must not assume
    /// infinite capacity.
    pub fn send_msg(
        &self,
        f: impl FnOnce() + Send + 'static,
    ) -> Result<(), CoreError> {
        if self.0.state.load() == ThreadState::Exited {
            return Err(CoreError::ThreadGone {
                name: self.0.name.clone(),
            });
        }
        self.0.msgs.push(Box::new(f)).map_err(|_| {
            CoreError::MessageRingFull {
                name: self.0.name.clone(),
            }
        })
    }

    /// Perform one iteration worth of processing: up to `max_msgs` inbound
    /// messages (0 means all that are currently queued), expired timed
    /// pollers and one pass of the active pollers.
    pub fn poll(&self, max_msgs: u32) -> PollStatus {
        self.adopt();

        if self.0.state.load() == ThreadState::Exited {
            return PollStatus::Idle;
        }

        self.enter();
        let mut busy = false;

        // messages first; bound the batch so a producer cannot starve the
        // pollers
        let quota = if max_msgs == 0 {
            self.0.msgs.len()
        } else {
            max_msgs as usize
        };
        for _ in 0 .. quota {
            match self.0.msgs.pop() {
                Some(msg) => {
                    msg();
                    busy = true;
                }
                None => break,
            }
        }

        // snapshot the poller list so callbacks may register new pollers
        let pollers: Vec<Rc<PollerEntry>> =
            self.with_local(|local| local.pollers.clone());

        let now = ticks::now();
        for p in pollers.iter() {
            if p.state.get() != PollerState::Waiting {
                continue;
            }
            if p.is_timed() {
                if p.next_tick.get() > now {
                    continue;
                }
                p.next_tick.set(now + p.period_ticks);
            }
            p.state.set(PollerState::Running);
            let rc = (p.poll_fn.borrow_mut())();
            // the callback may have unregistered itself
            if p.state.get() == PollerState::Running {
                p.state.set(PollerState::Waiting);
            }
            if rc > 0 {
                busy = true;
            }
        }

        // free unregistered pollers at the iteration boundary, never during
        // their own callback
        self.with_local(|local| {
            local
                .pollers
                .retain(|p| p.state.get() != PollerState::UnregisterPending);
        });

        if self.0.state.load() == ThreadState::Exiting {
            self.finish_exit();
        }

        self.leave();
        if busy {
            PollStatus::Busy
        } else {
            PollStatus::Idle
        }
    }

    /// drive the thread until it reports idle
    pub fn poll_until_idle(&self) {
        while self.poll(0) == PollStatus::Busy {}
    }

    /// Number of ticks until the next timed poller expires, or 0 when no
    /// timed poller is registered. Used by the outer loop to compute a sleep
    /// deadline when no active poller exists.
    pub fn next_poller_expiration(&self, now: u64) -> u64 {
        self.with_local(|local| {
            local
                .pollers
                .iter()
                .filter(|p| {
                    p.is_timed() && p.state.get() == PollerState::Waiting
                })
                .map(|p| p.next_tick.get().saturating_sub(now))
                .min()
                .unwrap_or(0)
        })
    }

    /// true when there are no active pollers, no pending messages and no
    /// timed poller expiring right now
    pub fn is_idle(&self) -> bool {
        if !self.0.msgs.is_empty() {
            return false;
        }
        let now = ticks::now();
        self.with_local(|local| {
            !local.pollers.iter().any(|p| {
                p.state.get() == PollerState::Waiting
                    && (!p.is_timed() || p.next_tick.get() <= now)
            })
        })
    }

    /// Ask the thread to exit: pending messages are drained and remaining
    /// pollers unregistered on the next poll; channel references are
    /// expected to have been released already. After that the next poll
    /// reports terminal idle and the handle may be destroyed.
    pub fn exit(&self) {
        if self.0.state.load() == ThreadState::Running {
            debug!("{:?} exit requested", self);
            self.0.state.store(ThreadState::Exiting);
        }
    }

    fn finish_exit(&self) {
        // drain whatever was still queued
        while let Some(msg) = self.0.msgs.pop() {
            msg();
        }
        self.with_local(|local| {
            if !local.pollers.is_empty() {
                debug!(
                    "{:?} exiting with {} pollers still registered",
                    self,
                    local.pollers.len()
                );
                local.pollers.clear();
            }
            if !local.channels.is_empty() {
                warn!(
                    "{:?} exiting with {} channels still referenced",
                    self,
                    local.channels.len()
                );
            }
        });
        self.0.state.store(ThreadState::Exited);
        debug!("{:?} exited", self);
    }

    pub fn is_exited(&self) -> bool {
        self.0.state.load() == ThreadState::Exited
    }

    /// destroy the given thread waiting for it to become ready to destroy
    pub fn destroy(self) {
        debug!("destroying {:?}", self);
        self.exit();
        while !self.is_exited() {
            self.poll(0);
        }
        LOCALS.with(|l| {
            l.borrow_mut().remove(&self.0.id);
        });
        THREADS.lock().retain(|t| t.0.id != self.0.id);
        debug!("thread {} destroyed", self.0.name);
    }

    /// number of messages currently queued
    pub fn msg_backlog(&self) -> usize {
        self.0.msgs.len()
    }
}

/// Send a message to each thread, serially: `f` runs once on every thread in
/// registration order, no two invocations overlapping, and `cpl` runs on the
/// originating thread after the last one. Must be called from within a
/// thread context.
pub fn for_each_thread(
    f: impl Fn() + Send + Sync + 'static,
    cpl: impl FnOnce() + Send + 'static,
) -> Result<(), CoreError> {
    let orig = Mthread::current().ok_or(CoreError::NoThreadContext {})?;
    let targets = Mthread::threads();
    step_thread(Arc::new(f), Box::new(cpl), targets, 0, orig)
}

fn step_thread(
    f: Arc<dyn Fn() + Send + Sync>,
    cpl: Box<dyn FnOnce() + Send>,
    targets: Vec<Mthread>,
    idx: usize,
    orig: Mthread,
) -> Result<(), CoreError> {
    if idx >= targets.len() {
        return orig.send_msg(move || cpl());
    }
    let target = targets[idx].clone();
    target.send_msg(move || {
        f();
        if let Err(e) =
            step_thread(Arc::clone(&f), cpl, targets, idx + 1, orig)
        {
            error!("thread iteration aborted: {}", e);
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ring_backpressure() {
        let t =
            Mthread::with_capacity("ut_ring".into(), 0, 2).unwrap();
        assert!(t.send_msg(|| {}).is_ok());
        assert!(t.send_msg(|| {}).is_ok());
        assert!(matches!(
            t.send_msg(|| {}),
            Err(CoreError::MessageRingFull { .. })
        ));
        t.destroy();
    }

    #[test]
    fn exit_drains_messages() {
        let t = Mthread::new("ut_exit".into(), 0).unwrap();
        let flag = std::sync::Arc::new(std::sync::atomic::AtomicBool::new(false));
        let f = std::sync::Arc::clone(&flag);
        t.send_msg(move || f.store(true, Ordering::SeqCst)).unwrap();
        t.exit();
        t.poll(0);
        assert!(t.is_exited());
        assert!(flag.load(Ordering::SeqCst));
        t.destroy();
    }
}
