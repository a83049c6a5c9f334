use parking_lot::Mutex;

/// Events a device can report to interested parties.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceEventType {
    DeviceRemoved,
    DeviceResized,
    MediaManagement,
    AdminCommandCompleted,
}

/// Keeps a list of listeners and fans device events out to them. Listeners
/// are plain functions so the dispatcher can be shared freely.
#[derive(Default)]
pub struct DeviceEventDispatcher {
    listeners: Mutex<Vec<fn(DeviceEventType, &str)>>,
}

impl DeviceEventDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register listener to monitor events of a device.
    pub fn add_listener(&self, listener: fn(DeviceEventType, &str)) {
        self.listeners.lock().push(listener);
    }

    /// Dispatch the event to all listeners; returns the number of listeners
    /// notified. Listeners run without the lock held so they may register
    /// further listeners.
    pub fn dispatch(&self, event: DeviceEventType, name: &str) -> usize {
        let listeners = self.listeners.lock().clone();
        for l in listeners.iter() {
            (*l)(event, name);
        }
        listeners.len()
    }

    pub fn count(&self) -> usize {
        self.listeners.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    static HITS: AtomicUsize = AtomicUsize::new(0);

    fn on_event(event: DeviceEventType, _name: &str) {
        if event == DeviceEventType::DeviceRemoved {
            HITS.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn dispatch_counts_listeners() {
        let d = DeviceEventDispatcher::new();
        assert_eq!(d.dispatch(DeviceEventType::DeviceRemoved, "x"), 0);
        d.add_listener(on_event);
        d.add_listener(on_event);
        assert_eq!(d.dispatch(DeviceEventType::DeviceRemoved, "x"), 2);
        assert_eq!(HITS.load(Ordering::SeqCst), 2);
    }
}
