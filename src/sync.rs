//! Single-shot completion.
//!
//! The I/O bridge blocks each filesystem request on one of these until the
//! handler's completion fires, possibly from another thread.

use parking_lot::{Condvar, Mutex};

/// A one-shot rendezvous carrying a value from the signalling context to a
/// blocked waiter. Signalling broadcasts, so spurious wakeups and future
/// multi-waiter use cannot lose the event.
pub struct Completion<T> {
    slot: Mutex<Option<T>>,
    cond: Condvar,
}

impl<T> Completion<T> {
    /// Create an unsignalled completion.
    pub fn new() -> Self {
        Completion {
            slot: Mutex::new(None),
            cond: Condvar::new(),
        }
    }

    /// Deliver the value and wake every waiter.
    pub fn signal(&self, value: T) {
        let mut slot = self.slot.lock();
        debug_assert!(slot.is_none(), "completion signalled twice");
        *slot = Some(value);
        self.cond.notify_all();
    }

    /// Block until the value is delivered.
    pub fn wait(&self) -> T {
        let mut slot = self.slot.lock();
        loop {
            if let Some(v) = slot.take() {
                return v;
            }
            self.cond.wait(&mut slot);
        }
    }

    /// Take the value if it has already been delivered.
    pub fn try_take(&self) -> Option<T> {
        self.slot.lock().take()
    }
}

impl<T> Default for Completion<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn signal_before_wait() {
        let c = Completion::new();
        c.signal(7u32);
        assert_eq!(c.wait(), 7);
    }

    #[test]
    fn signal_from_other_thread() {
        let c = Arc::new(Completion::new());
        let c2 = c.clone();
        let t = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            c2.signal("done");
        });
        assert_eq!(c.wait(), "done");
        t.join().unwrap();
    }

    #[test]
    fn try_take() {
        let c = Completion::new();
        assert!(c.try_take().is_none());
        c.signal(1);
        assert_eq!(c.try_take(), Some(1));
        assert!(c.try_take().is_none());
    }
}
