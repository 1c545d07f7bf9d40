//! An in-memory bus that records published payloads for assertions.

use mb_core::bus::{Bus, BusError};
use std::sync::{Arc, Mutex};

#[derive(Clone, Default)]
pub struct MemoryBus {
    published: Arc<Mutex<Vec<(String, Vec<u8>)>>>,
    failing: Arc<Mutex<bool>>,
}

impl MemoryBus {
    pub fn new() -> MemoryBus {
        MemoryBus::default()
    }

    /// Everything published so far, as `(channel, payload)` pairs.
    pub fn published(&self) -> Vec<(String, Vec<u8>)> {
        self.published.lock().expect("bus lock").clone()
    }

    /// Make subsequent publishes fail (or succeed again).
    pub fn set_failing(&self, failing: bool) {
        *self.failing.lock().expect("bus lock") = failing;
    }
}

impl Bus for MemoryBus {
    async fn publish(&mut self, channel: &str, payload: Vec<u8>) -> Result<(), BusError> {
        if *self.failing.lock().expect("bus lock") {
            return Err(BusError::Unavailable("memory bus set to fail".to_owned()));
        }
        self.published
            .lock()
            .expect("bus lock")
            .push((channel.to_owned(), payload));
        Ok(())
    }
}
