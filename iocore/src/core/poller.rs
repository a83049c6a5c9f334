use std::{cell::Cell, cell::RefCell, fmt, rc::Rc, time::Duration};

use crate::core::{
    mthread::{Mthread, PollerEntry, PollerState},
    ticks,
};

static POLLER_ID: std::sync::atomic::AtomicU64 =
    std::sync::atomic::AtomicU64::new(1);

/// Poller structure that allows us to pause, stop, resume periodic tasks
pub struct Poller {
    entry: Rc<PollerEntry>,
    thread: Mthread,
    stopped: bool,
}

impl fmt::Debug for Poller {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Poller")
            .field("name", &self.entry.name)
            .field("stopped", &self.stopped)
            .finish()
    }
}

impl Poller {
    /// stop the given poller and consume self
    pub fn stop(mut self) {
        self.entry.state.set(PollerState::UnregisterPending);
        self.stopped = true;
    }

    /// pause the given poller
    pub fn pause(&mut self) {
        if self.entry.state.get() == PollerState::Waiting {
            self.entry.state.set(PollerState::Paused);
        }
    }

    /// resume the given poller
    pub fn resume(&mut self) {
        if self.entry.state.get() == PollerState::Paused {
            self.entry.state.set(PollerState::Waiting);
            if self.entry.period_ticks > 0 {
                self.entry
                    .next_tick
                    .set(ticks::now() + self.entry.period_ticks);
            }
        }
    }

    /// the thread this poller runs on
    pub fn thread(&self) -> &Mthread {
        &self.thread
    }
}

impl Drop for Poller {
    fn drop(&mut self) {
        if !self.stopped {
            self.entry.state.set(PollerState::UnregisterPending);
        }
    }
}

/// builder type to create a new poller
pub struct Builder {
    name: Option<String>,
    interval: Duration,
    poll_fn: Option<Box<dyn FnMut() -> i32 + 'static>>,
}

impl Default for Builder {
    fn default() -> Self {
        Self::new()
    }
}

impl Builder {
    /// create a new nameless poller that runs every time the thread the
    /// poller is created on is polled
    pub fn new() -> Self {
        Self {
            name: None,
            interval: Duration::from_micros(0),
            poll_fn: None,
        }
    }

    /// create the poller with a given name
    pub fn with_name<S: Into<String>>(mut self, name: S) -> Self {
        self.name = Some(name.into());
        self
    }

    /// set the interval for the poller in usec
    pub fn with_interval(mut self, usec: u64) -> Self {
        self.interval = Duration::from_micros(usec);
        self
    }

    /// set the function for this poller
    pub fn with_poll_fn(
        mut self,
        poll_fn: impl FnMut() -> i32 + 'static,
    ) -> Self {
        self.poll_fn = Some(Box::new(poll_fn));
        self
    }

    /// Register the poller on the current thread. Panics outside of a
    /// thread context, as there is nothing to run the poller then.
    pub fn build(mut self) -> Poller {
        let poll_fn = self
            .poll_fn
            .take()
            .expect("can not start poller without poll function");

        let thread = Mthread::current()
            .expect("pollers can only be registered within a thread context");

        let period_ticks =
            ticks::from_micros(self.interval.as_micros() as u64);

        let entry = Rc::new(PollerEntry {
            id: POLLER_ID
                .fetch_add(1, std::sync::atomic::Ordering::Relaxed),
            name: self
                .name
                .take()
                .unwrap_or_else(|| "<unnamed>".to_string()),
            poll_fn: RefCell::new(poll_fn),
            state: Cell::new(PollerState::Waiting),
            period_ticks,
            next_tick: Cell::new(if period_ticks > 0 {
                ticks::now() + period_ticks
            } else {
                0
            }),
        });

        thread.with_local(|local| local.pollers.push(Rc::clone(&entry)));

        Poller {
            entry,
            thread,
            stopped: false,
        }
    }
}
