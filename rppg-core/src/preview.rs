//! Single-slot rendezvous for the latest ingested frame.
//!
//! Writers overwrite whatever is in the slot; a reader blocks until a value
//! is present and takes it. There is no queue, so a slow reader only ever
//! sees the most recent frame. Closing the slot releases every waiter.

use std::sync::{Arc, Condvar, Mutex};

use crate::detection::BoundingBox;
use crate::video::RgbFrame;

/// What the ingestion path publishes after each fed frame.
#[derive(Debug, Clone)]
pub struct Preview {
    pub frame: Arc<RgbFrame>,
    pub bbox: Option<BoundingBox>,
    pub timestamp: f64,
}

#[derive(Debug)]
struct Slot<T> {
    value: Option<T>,
    closed: bool,
}

#[derive(Debug)]
pub struct PreviewSlot<T> {
    slot: Mutex<Slot<T>>,
    ready: Condvar,
}

impl<T> Default for PreviewSlot<T> {
    fn default() -> Self {
        Self {
            slot: Mutex::new(Slot {
                value: None,
                closed: false,
            }),
            ready: Condvar::new(),
        }
    }
}

impl<T> PreviewSlot<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the slot contents and wake one waiter.
    pub fn publish(&self, value: T) {
        let mut slot = self.slot.lock().unwrap_or_else(|p| p.into_inner());
        if slot.closed {
            return;
        }
        slot.value = Some(value);
        drop(slot);
        self.ready.notify_one();
    }

    /// Block until a value is available and take it. `None` once closed.
    pub fn wait(&self) -> Option<T> {
        let mut slot = self.slot.lock().unwrap_or_else(|p| p.into_inner());
        loop {
            if let Some(value) = slot.value.take() {
                return Some(value);
            }
            if slot.closed {
                return None;
            }
            slot = self.ready.wait(slot).unwrap_or_else(|p| p.into_inner());
        }
    }

    /// Take the current value without blocking.
    pub fn try_take(&self) -> Option<T> {
        self.slot
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .value
            .take()
    }

    pub fn close(&self) {
        let mut slot = self.slot.lock().unwrap_or_else(|p| p.into_inner());
        slot.closed = true;
        drop(slot);
        self.ready.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn later_writes_overwrite_earlier_ones() {
        let slot = PreviewSlot::new();
        slot.publish(1);
        slot.publish(2);
        assert_eq!(slot.wait(), Some(2));
        assert_eq!(slot.try_take(), None);
    }

    #[test]
    fn reader_blocks_until_a_write() {
        let slot = Arc::new(PreviewSlot::new());
        let reader = {
            let slot = Arc::clone(&slot);
            thread::spawn(move || slot.wait())
        };
        thread::sleep(Duration::from_millis(20));
        slot.publish("frame");
        assert_eq!(reader.join().unwrap(), Some("frame"));
    }

    #[test]
    fn close_releases_waiters() {
        let slot: Arc<PreviewSlot<u8>> = Arc::new(PreviewSlot::new());
        let reader = {
            let slot = Arc::clone(&slot);
            thread::spawn(move || slot.wait())
        };
        thread::sleep(Duration::from_millis(20));
        slot.close();
        assert_eq!(reader.join().unwrap(), None);
        slot.publish(3);
        assert_eq!(slot.wait(), None);
    }
}
