use std::time::Duration;

/// Configuration for a [`crate::calls::CallManager`].
#[derive(Clone, Debug)]
pub struct SignalerConfig {
    /// How long a call may ring (either direction) before it is given up.
    /// `None` lets a call ring until someone acts.
    pub ring_timeout: Option<Duration>,
    /// Depth of the local command queue.
    pub command_capacity: usize,
    /// Depth of the inbound channel queue.
    pub inbound_capacity: usize,
    /// Buffer of each broadcast channel on the event bus.
    pub event_capacity: usize,
}

impl Default for SignalerConfig {
    fn default() -> Self {
        Self {
            ring_timeout: Some(Duration::from_secs(45)),
            command_capacity: 64,
            inbound_capacity: 256,
            event_capacity: 100,
        }
    }
}

impl SignalerConfig {
    pub fn with_ring_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.ring_timeout = timeout;
        self
    }
}
