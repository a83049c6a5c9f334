//! Process wide registry of I/O devices and their per-thread channels.
//!
//! A device registers a pair of callbacks that build and tear down the
//! thread-local context a channel carries. Channels are reference counted
//! per thread; the final release schedules destruction on the owning thread
//! and device unregistration is deferred until the last channel is gone.
//!
//! Cross-thread access to channel state never happens directly: the serial
//! traversal helper visits every channel on its owning thread and resumes
//! through a continuation token, so visitors may perform async work.

use std::{any::Any, collections::HashMap, collections::VecDeque, sync::Arc};

use nix::errno::Errno;
use once_cell::sync::Lazy;
use parking_lot::Mutex;

use crate::core::{channel::IoChannel, mthread::Mthread, CoreError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct IoDeviceId(pub(crate) u64);

type CreateCb =
    Arc<dyn Fn(IoDeviceId) -> Result<Box<dyn Any>, Errno> + Send + Sync>;
type DestroyCb = Arc<dyn Fn(IoDeviceId, Box<dyn Any>) + Send + Sync>;
type UnregisterCb = Box<dyn FnOnce(IoDeviceId) + Send>;

struct DeviceEntry {
    name: String,
    create: CreateCb,
    destroy: DestroyCb,
    unregistered: bool,
    unregister_cb: Option<UnregisterCb>,
    unregister_thread: Option<Mthread>,
    /// threads currently holding a live channel for this device
    channel_threads: HashMap<u64, Mthread>,
}

static DEVICES: Lazy<Mutex<HashMap<u64, DeviceEntry>>> =
    Lazy::new(|| Mutex::new(HashMap::new()));
static DEVICE_ID: std::sync::atomic::AtomicU64 =
    std::sync::atomic::AtomicU64::new(1);

/// Registration handle for an I/O device.
#[derive(Debug)]
pub struct IoDevice {
    id: IoDeviceId,
    name: String,
}

impl IoDevice {
    /// Register a new I/O device. `create` builds the per-thread channel
    /// context on the thread that first asks for a channel, `destroy` tears
    /// it down on the same thread.
    pub fn register<C: 'static>(
        name: &str,
        create: impl Fn(IoDeviceId) -> Result<C, Errno> + Send + Sync + 'static,
        destroy: impl Fn(IoDeviceId, C) + Send + Sync + 'static,
    ) -> Self {
        let id = IoDeviceId(
            DEVICE_ID.fetch_add(1, std::sync::atomic::Ordering::Relaxed),
        );

        let entry = DeviceEntry {
            name: name.to_string(),
            create: Arc::new(move |id| {
                create(id).map(|c| Box::new(c) as Box<dyn Any>)
            }),
            destroy: Arc::new(move |id, ctx: Box<dyn Any>| {
                match ctx.downcast::<C>() {
                    Ok(c) => destroy(id, *c),
                    Err(_) => {
                        error!("channel context of unexpected type dropped")
                    }
                }
            }),
            unregistered: false,
            unregister_cb: None,
            unregister_thread: None,
            channel_threads: HashMap::new(),
        };

        DEVICES.lock().insert(id.0, entry);
        debug!("{} I/O device registered with id {:?}", name, id);

        IoDevice {
            id,
            name: name.to_string(),
        }
    }

    pub fn id(&self) -> IoDeviceId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Get a channel for this device on the current thread.
    pub fn get_io_channel(&self) -> Option<IoChannel> {
        get_io_channel(self.id)
    }

    /// Remove the device from the registry. The memory backing the device is
    /// released, and `cb` invoked, only once the last outstanding channel
    /// has been destroyed; when no channels exist the callback runs right
    /// away on the calling thread.
    pub fn unregister(self, cb: Option<UnregisterCb>) {
        unregister(self.id, cb)
    }

    /// Iterate over all I/O channels associated with this I/O device,
    /// one at a time on their owning threads.
    pub fn traverse_io_channels<C: 'static, T: Send + 'static>(
        &self,
        channel_cb: impl Fn(&mut C, &mut T) -> i32 + Send + Sync + 'static,
        done_cb: impl FnOnce(i32, T) + Send + 'static,
        caller_ctx: T,
    ) -> Result<(), CoreError> {
        traverse_io_channels(self.id, channel_cb, done_cb, caller_ctx)
    }
}

/// Get an I/O channel for the device on the calling thread, creating it on
/// first use. Returns None when no thread context is active, the device is
/// not registered (or already unregistered), or context creation fails.
pub fn get_io_channel(device: IoDeviceId) -> Option<IoChannel> {
    let thread = Mthread::current()?;

    // an unregistered device hands out nothing, not even references to
    // channels that still exist
    {
        let devices = DEVICES.lock();
        let entry = devices.get(&device.0)?;
        if entry.unregistered {
            return None;
        }
    }

    // bump an existing channel
    let existing = thread.with_local(|local| {
        if let Some(slot) = local.channels.get_mut(&device.0) {
            slot.refs += 1;
            slot.destroy_pending = false;
            true
        } else {
            false
        }
    });
    if existing {
        return Some(IoChannel::new(device, thread));
    }

    // build a new context
    let create = {
        let mut devices = DEVICES.lock();
        let entry = devices.get_mut(&device.0)?;
        if entry.unregistered {
            return None;
        }
        entry
            .channel_threads
            .insert(thread.id(), thread.clone());
        Arc::clone(&entry.create)
    };

    match create(device) {
        Ok(ctx) => {
            thread.with_local(|local| {
                local.channels.insert(
                    device.0,
                    crate::core::mthread::ChannelSlot {
                        refs: 1,
                        ctx,
                        destroy_pending: false,
                    },
                );
            });
            Some(IoChannel::new(device, thread))
        }
        Err(e) => {
            error!("failed to create I/O channel context: {}", e);
            let mut devices = DEVICES.lock();
            if let Some(entry) = devices.get_mut(&device.0) {
                entry.channel_threads.remove(&thread.id());
            }
            None
        }
    }
}

/// name of a registered device, mainly for diagnostics
pub fn device_name(device: IoDeviceId) -> Option<String> {
    DEVICES.lock().get(&device.0).map(|e| e.name.clone())
}

fn unregister(device: IoDeviceId, cb: Option<UnregisterCb>) {
    let mut fire_cb = None;
    let fire_now = {
        let mut devices = DEVICES.lock();
        let entry = match devices.get_mut(&device.0) {
            Some(e) => e,
            None => {
                warn!("unregister of unknown I/O device {:?}", device);
                return;
            }
        };
        if entry.unregistered {
            warn!("I/O device {:?} unregistered twice", device);
            return;
        }
        entry.unregistered = true;
        if entry.channel_threads.is_empty() {
            devices.remove(&device.0);
            fire_cb = cb;
            true
        } else {
            entry.unregister_cb = cb;
            entry.unregister_thread = Mthread::current();
            false
        }
    };

    if fire_now {
        debug!("I/O device {:?} unregistered", device);
        if let Some(cb) = fire_cb {
            cb(device);
        }
    } else {
        debug!(
            "I/O device {:?} unregister deferred until channels are released",
            device
        );
    }
}

/// Called on the owning thread when a channel's refcount reached zero.
pub(crate) fn deferred_channel_destroy(device: IoDeviceId, thread: Mthread) {
    // re-check: a get_io_channel may have revived the channel in between
    let ctx = thread.with_local(|local| {
        match local.channels.get(&device.0) {
            Some(slot) if slot.refs == 0 && slot.destroy_pending => {
                local.channels.remove(&device.0).map(|s| s.ctx)
            }
            _ => None,
        }
    });

    let ctx = match ctx {
        Some(ctx) => ctx,
        None => return,
    };

    let destroy = DEVICES
        .lock()
        .get(&device.0)
        .map(|e| Arc::clone(&e.destroy));
    if let Some(destroy) = destroy {
        destroy(device, ctx);
    }

    // release the registry side and complete a pending unregister
    let pending = {
        let mut devices = DEVICES.lock();
        match devices.get_mut(&device.0) {
            Some(entry) => {
                entry.channel_threads.remove(&thread.id());
                if entry.unregistered && entry.channel_threads.is_empty() {
                    let entry = devices.remove(&device.0).unwrap();
                    Some((entry.unregister_cb, entry.unregister_thread))
                } else {
                    None
                }
            }
            None => None,
        }
    };

    if let Some((cb, unregister_thread)) = pending {
        debug!("I/O device {:?} unregistered", device);
        if let Some(cb) = cb {
            match unregister_thread {
                Some(t) => {
                    if let Err(e) = t.send_msg(move || cb(device)) {
                        error!("failed to deliver unregister callback: {}", e);
                    }
                }
                None => cb(device),
            }
        }
    }
}

/// Run `f` against the channel context of `device` on the current thread.
/// The context is detached for the duration of the call so `f` is free to
/// use the channel registry; re-entering the same channel context is not
/// possible.
pub fn with_channel_ctx<C: 'static, R>(
    device: IoDeviceId,
    f: impl FnOnce(&mut C) -> R,
) -> Option<R> {
    let thread = Mthread::current()?;
    let mut ctx = thread.with_local(|local| {
        local.channels.get_mut(&device.0).map(|slot| {
            std::mem::replace(&mut slot.ctx, Box::new(()) as Box<dyn Any>)
        })
    })?;

    let out = ctx.downcast_mut::<C>().map(f);

    thread.with_local(|local| {
        if let Some(slot) = local.channels.get_mut(&device.0) {
            slot.ctx = ctx;
        }
    });
    out
}

/// Continuation token for the serial channel walk.
pub struct ChannelIter {
    device: IoDeviceId,
    remaining: VecDeque<Mthread>,
    visit: Arc<dyn Fn(Box<ChannelIter>) + Send + Sync>,
    done: Option<Box<dyn FnOnce(i32, Box<dyn Any + Send>) + Send>>,
    ctx: Option<Box<dyn Any + Send>>,
    orig: Mthread,
}

impl ChannelIter {
    pub fn device(&self) -> IoDeviceId {
        self.device
    }

    /// caller context carried across the iteration
    pub fn ctx_mut<T: 'static>(&mut self) -> &mut T {
        self.ctx
            .as_mut()
            .and_then(|c| c.downcast_mut::<T>())
            .expect("channel iterator context of unexpected type")
    }
}

/// Call `visit` for each channel of the device, serially, on the channel's
/// owning thread. Each visit must resume the walk by handing the token to
/// [`for_each_channel_continue`]; `done` runs on the originating thread once
/// the walk ends or a visit reports a non-zero status.
pub fn for_each_channel(
    device: IoDeviceId,
    visit: Arc<dyn Fn(Box<ChannelIter>) + Send + Sync>,
    ctx: Box<dyn Any + Send>,
    done: Box<dyn FnOnce(i32, Box<dyn Any + Send>) + Send>,
) -> Result<(), CoreError> {
    let orig = Mthread::current().ok_or(CoreError::NoThreadContext {})?;

    let remaining: VecDeque<Mthread> = DEVICES
        .lock()
        .get(&device.0)
        .map(|e| e.channel_threads.values().cloned().collect())
        .unwrap_or_default();

    let iter = Box::new(ChannelIter {
        device,
        remaining,
        visit,
        done: Some(done),
        ctx: Some(ctx),
        orig,
    });

    step_channel(iter, 0);
    Ok(())
}

/// Resume a channel walk with the status of the last visit.
pub fn for_each_channel_continue(iter: Box<ChannelIter>, status: i32) {
    step_channel(iter, status)
}

fn step_channel(mut iter: Box<ChannelIter>, status: i32) {
    if status != 0 {
        finish_channel_walk(iter, status);
        return;
    }

    let next = loop {
        match iter.remaining.pop_front() {
            Some(t) if !t.is_exited() => break Some(t),
            Some(_) => continue,
            None => break None,
        }
    };

    match next {
        None => finish_channel_walk(iter, 0),
        Some(thread) => {
            let device = iter.device;
            let target = thread.clone();
            let res = target.send_msg(move || {
                let has_channel = thread.with_local(|local| {
                    local.channels.contains_key(&device.0)
                });
                if has_channel {
                    let visit = Arc::clone(&iter.visit);
                    visit(iter);
                } else {
                    // channel disappeared while the walk was in flight
                    step_channel(iter, 0);
                }
            });
            if let Err(e) = res {
                error!("channel walk aborted: {}", e);
            }
        }
    }
}

fn finish_channel_walk(mut iter: Box<ChannelIter>, status: i32) {
    let done = iter.done.take().expect("channel walk completed twice");
    let ctx = iter.ctx.take().expect("channel walk context gone");
    let res = iter.orig.send_msg(move || done(status, ctx));
    if let Err(e) = res {
        error!("failed to deliver channel walk completion: {}", e);
    }
}

/// Typed convenience wrapper over the raw walk: `channel_cb` gets the
/// channel context and the caller context and returns a status, the walk
/// continues automatically.
pub fn traverse_io_channels<C: 'static, T: Send + 'static>(
    device: IoDeviceId,
    channel_cb: impl Fn(&mut C, &mut T) -> i32 + Send + Sync + 'static,
    done_cb: impl FnOnce(i32, T) + Send + 'static,
    caller_ctx: T,
) -> Result<(), CoreError> {
    let visit = Arc::new(move |mut iter: Box<ChannelIter>| {
        let device = iter.device();
        let rc = with_channel_ctx::<C, i32>(device, |chan| {
            channel_cb(chan, iter.ctx_mut::<T>())
        })
        .unwrap_or(0);
        for_each_channel_continue(iter, rc);
    });

    let done = Box::new(move |status: i32, ctx: Box<dyn Any + Send>| {
        let ctx = ctx
            .downcast::<T>()
            .expect("channel walk context of unexpected type");
        done_cb(status, *ctx);
    });

    for_each_channel(device, visit, Box::new(caller_ctx), done)
}

/// number of threads with a live channel; diagnostics only
pub fn channel_count(device: IoDeviceId) -> usize {
    DEVICES
        .lock()
        .get(&device.0)
        .map(|e| e.channel_threads.len())
        .unwrap_or(0)
}
