//! A reactor instance to CPU core is a one-to-one relation. Each reactor
//! owns one thread object which holds the messages, pollers and channels
//! for that core; during the poll loop we drain the future queues and then
//! poll the thread.
//!
//! Futures can be sent to any reactor; they are queued on a channel and
//! spawned onto the local run queue of the destination core. The messages
//! in the thread ring and the futures here are the two ways work crosses
//! cores.

use std::{future::Future, pin::Pin, time::Duration};

use async_task::Runnable;
use crossbeam::{
    atomic::AtomicCell,
    channel::{unbounded, Receiver, Sender},
};
use futures::task::{Context, Poll};
use once_cell::sync::OnceCell;
use parking_lot::Mutex;

use crate::core::{cpu_cores::Cores, mthread::Mthread, ticks};

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ReactorState {
    Init,
    Running,
    Shutdown,
    Delayed,
}

#[derive(Debug)]
pub struct Reactors(Vec<Reactor>);

pub static REACTOR_LIST: OnceCell<Reactors> = OnceCell::new();

static JOIN_HANDLES: OnceCell<Mutex<Vec<std::thread::JoinHandle<()>>>> =
    OnceCell::new();

type SentFuture = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

#[derive(Debug)]
pub struct Reactor {
    /// the thread that carries this core's pollers, messages and channels
    thread: Mthread,
    /// the logical core this reactor is created on
    lcore: u32,
    /// represents the state of the reactor
    flags: AtomicCell<ReactorState>,
    /// sender and receiver for sending futures across cores
    sx: Sender<SentFuture>,
    rx: Receiver<SentFuture>,
}

thread_local! {
    /// queue of runnables scheduled on this core
    static QUEUE: (Sender<Runnable>, Receiver<Runnable>) = unbounded();
}

impl Reactors {
    /// initialize the reactor subsystem for each core assigned to us
    pub fn init() {
        REACTOR_LIST.get_or_init(|| {
            Reactors(
                Cores::count()
                    .into_iter()
                    .map(|c| {
                        debug!("init core: {}", c);
                        Reactor::new(c)
                    })
                    .collect::<Vec<_>>(),
            )
        });
    }

    /// launch the poll loop on the master core; this blocks until the
    /// master reactor shuts down, then waits for the remote cores
    pub fn launch_master() {
        assert_eq!(Cores::current(), Cores::first());
        Reactor::poll_entry(Cores::current());
        Self::join_all();
    }

    /// start polling the given remote core on a pinned OS thread
    pub fn launch_remote(core: u32) -> Result<(), ()> {
        if core == Cores::current() {
            return Ok(());
        }

        if Cores::count().into_iter().any(|c| c == core) {
            let handle = std::thread::Builder::new()
                .name(format!("core_{}", core))
                .spawn(move || {
                    pin_to_core(core);
                    Cores::set_current(core);
                    Reactor::poll_entry(core);
                })
                .map_err(|e| {
                    error!("failed to spawn thread for core {}: {}", core, e);
                })?;
            JOIN_HANDLES
                .get_or_init(|| Mutex::new(Vec::new()))
                .lock()
                .push(handle);
            return Ok(());
        }

        error!("failed to launch core {}", core);
        Err(())
    }

    fn join_all() {
        if let Some(handles) = JOIN_HANDLES.get() {
            for h in handles.lock().drain(..) {
                let _ = h.join();
            }
        }
    }

    /// get a reference to a ['Reactor'] associated with the given core.
    pub fn get_by_core(core: u32) -> Option<&'static Reactor> {
        Reactors::iter().find(|c| c.lcore == core)
    }

    /// get a reference to the reactor on the current core
    pub fn current() -> &'static Reactor {
        Self::get_by_core(Cores::current()).expect("no reactor allocated")
    }

    pub fn master() -> &'static Reactor {
        Self::get_by_core(Cores::first()).expect("no reactor allocated")
    }

    /// returns an iterator over all reactors
    pub fn iter() -> std::slice::Iter<'static, Reactor> {
        REACTOR_LIST.get().expect("reactors not initialized").into_iter()
    }
}

impl<'a> IntoIterator for &'a Reactors {
    type Item = &'a Reactor;
    type IntoIter = std::slice::Iter<'a, Reactor>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}

fn pin_to_core(core: u32) {
    use nix::sched::{sched_setaffinity, CpuSet};
    use nix::unistd::Pid;

    let mut cpuset = CpuSet::new();
    if cpuset.set(core as usize).is_ok() {
        if let Err(e) = sched_setaffinity(Pid::from_raw(0), &cpuset) {
            warn!("failed to pin to core {}: {}", core, e);
        }
    }
}

impl Reactor {
    /// create a new ['Reactor'] instance
    fn new(core: u32) -> Self {
        let thread = Mthread::new(format!("core_{}", core), core)
            .expect("failed to allocate thread");
        let (sx, rx) = unbounded::<SentFuture>();

        Self {
            thread,
            lcore: core,
            flags: AtomicCell::new(ReactorState::Init),
            sx,
            rx,
        }
    }

    /// entry point of the poll loop for a core
    fn poll_entry(core: u32) {
        debug!("start polling of reactor {}", core);
        let reactor = Reactors::get_by_core(core).unwrap();
        if reactor.flags.load() != ReactorState::Init {
            warn!("calling poll on a reactor who is not in the INIT state");
        }

        if cfg!(debug_assertions) {
            reactor.developer_delayed();
        } else {
            reactor.running();
        }
        reactor.poll_reactor();
    }

    /// run the futures received on the local queue
    fn run_futures(&self) {
        QUEUE.with(|(_, r)| {
            r.try_iter().for_each(|f| {
                f.run();
            })
        });
    }

    /// receive futures if any
    fn receive_futures(&self) {
        self.rx.try_iter().for_each(|m| {
            self.spawn_local(m).detach();
        });
    }

    /// send a future to this core to be spawned there
    pub fn send_future<F>(&self, future: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.sx.send(Box::pin(future)).unwrap();
    }

    /// spawn a future locally on this core
    pub fn spawn_local<F, R>(&self, future: F) -> async_task::Task<R>
    where
        F: Future<Output = R> + 'static,
        R: 'static,
    {
        let schedule =
            |runnable| QUEUE.with(|(s, _)| s.send(runnable).unwrap());
        let (runnable, task) = async_task::spawn_local(future, schedule);
        runnable.schedule();
        task
    }

    /// spawn a future locally on the current core and block until it is
    /// completed; the reactor keeps polling its thread meanwhile
    pub fn block_on<F, R>(future: F) -> Option<R>
    where
        F: Future<Output = R> + 'static,
        R: 'static,
    {
        let reactor = Reactors::current();
        reactor.thread.enter();

        let task = reactor.spawn_local(future);
        pin_utils::pin_mut!(task);

        let waker = futures::task::noop_waker();
        let cx = &mut Context::from_waker(&waker);

        let result = loop {
            match task.as_mut().poll(cx) {
                Poll::Ready(output) => break Some(output),
                Poll::Pending => {
                    reactor.receive_futures();
                    reactor.run_futures();
                    reactor.thread.poll(0);
                }
            }
        };
        reactor.thread.leave();
        result
    }

    fn set_state(&self, state: ReactorState) {
        self.flags.store(state);
    }

    /// set the state of the reactor to running. In this state the reactor
    /// will poll for work on its thread as well as its future queues.
    pub fn running(&self) {
        self.set_state(ReactorState::Running)
    }

    /// sleep each iteration; used when speed does not matter
    pub fn developer_delayed(&self) {
        info!("core {} set to developer delayed poll mode", self.lcore);
        self.set_state(ReactorState::Delayed)
    }

    /// initiate shutdown of the reactor and stop polling
    pub fn shutdown(&self) {
        debug!("shutdown requested for core {}", self.lcore);
        self.set_state(ReactorState::Shutdown);
    }

    /// returns the current state of the reactor
    pub fn get_state(&self) -> ReactorState {
        self.flags.load()
    }

    /// returns core number of this reactor
    pub fn core(&self) -> u32 {
        self.lcore
    }

    /// the thread of this reactor
    pub fn thread(&self) -> &Mthread {
        &self.thread
    }

    /// poll this reactor to complete any work that is pending
    pub fn poll_reactor(&self) {
        loop {
            match self.flags.load() {
                ReactorState::Running => {
                    self.poll_once();
                    self.idle_sleep();
                }
                ReactorState::Shutdown => {
                    info!("reactor {} shutdown requested", self.lcore);
                    break;
                }
                ReactorState::Delayed => {
                    std::thread::sleep(Duration::from_millis(1));
                    self.poll_once();
                }
                ReactorState::Init => {
                    std::thread::sleep(Duration::from_millis(1));
                    self.poll_once();
                }
            }
        }

        debug!("initiating shutdown for core {}", Cores::current());
        self.thread.clone().destroy();

        if self.lcore == Cores::first() {
            debug!("master core stopped polling");
        }
    }

    /// polls the reactor once for any work regardless of its state
    pub fn poll_once(&self) {
        self.thread.enter();
        self.receive_futures();
        self.run_futures();
        self.thread.leave();

        self.thread.poll(0);
    }

    /// When the thread is idle and only timed pollers are outstanding there
    /// is no point in spinning; nap until the next expiration, bounded so
    /// incoming messages are still picked up promptly.
    fn idle_sleep(&self) {
        if !self.thread.is_idle() {
            return;
        }
        let until = self.thread.next_poller_expiration(ticks::now());
        if until > 0 {
            std::thread::sleep(Duration::from_micros(until.min(100)));
        }
    }
}
