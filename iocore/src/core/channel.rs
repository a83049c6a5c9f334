use std::fmt::{Debug, Formatter};

use crate::core::{
    io_device::{self, IoDeviceId},
    mthread::Mthread,
};

/// Per-thread reference to an I/O device. A channel belongs to exactly one
/// thread and must only be used, cloned and dropped on that thread; the last
/// reference schedules destruction of the channel context on the owning
/// thread.
pub struct IoChannel {
    device: IoDeviceId,
    thread: Mthread,
}

impl IoChannel {
    pub(crate) fn new(device: IoDeviceId, thread: Mthread) -> Self {
        Self {
            device,
            thread,
        }
    }

    pub fn device(&self) -> IoDeviceId {
        self.device
    }

    pub fn thread(&self) -> &Mthread {
        &self.thread
    }

    /// current reference count; mostly interesting for tests
    pub fn ref_count(&self) -> u32 {
        self.thread.with_local(|local| {
            local
                .channels
                .get(&self.device.0)
                .map(|slot| slot.refs)
                .unwrap_or(0)
        })
    }

    /// Run `f` against the typed channel context. Returns None when the
    /// context has a different type, or when called re-entrantly on the
    /// same channel.
    pub fn with_ctx<C: 'static, R>(
        &self,
        f: impl FnOnce(&mut C) -> R,
    ) -> Option<R> {
        io_device::with_channel_ctx(self.device, f)
    }
}

impl Clone for IoChannel {
    fn clone(&self) -> Self {
        self.thread.with_local(|local| {
            let slot = local
                .channels
                .get_mut(&self.device.0)
                .expect("cloning a channel whose slot is gone");
            slot.refs += 1;
        });
        Self {
            device: self.device,
            thread: self.thread.clone(),
        }
    }
}

impl Drop for IoChannel {
    fn drop(&mut self) {
        let device = self.device;
        let thread = self.thread.clone();

        let last = self.thread.with_local(|local| {
            match local.channels.get_mut(&device.0) {
                Some(slot) => {
                    assert!(slot.refs > 0, "channel refcount underflow");
                    slot.refs -= 1;
                    if slot.refs == 0 {
                        slot.destroy_pending = true;
                        true
                    } else {
                        false
                    }
                }
                None => false,
            }
        });

        if last {
            // actual destruction happens from the message loop so that a
            // callback currently running against this channel unwinds first
            let t = thread.clone();
            if thread
                .send_msg(move || {
                    io_device::deferred_channel_destroy(device, t)
                })
                .is_err()
            {
                // ring saturated; destroy in place as a last resort
                io_device::deferred_channel_destroy(device, thread);
            }
        }
    }
}

impl Debug for IoChannel {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "io channel to device {:?} on thread {}",
            self.device,
            self.thread.name()
        )
    }
}
