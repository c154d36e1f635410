use std::time::Duration;

/// Timeouts and channel sizes for one lobby. The defaults match the behavior the HTTP layer
/// expects: short waits for lobby bookkeeping, a longer grace period for teardown.
#[derive(Debug, Clone)]
pub struct LobbyConfig {
    /// Upper bound for waiting on ICE gathering and on the signaling channel setup.
    pub process_waiting_timeout: Duration,
    /// Upper bound for a single enqueue towards the hub or a subscriber endpoint.
    pub hub_dispatch_timeout: Duration,
    /// Upper bound for handing a create-session item to the lobby sequencer.
    pub session_create_timeout: Duration,
    /// Upper bound for handing a remove-session item to the lobby sequencer.
    pub session_remove_timeout: Duration,
    /// Capacity of the per-endpoint command inbox.
    pub endpoint_queue_size: usize,
    /// Capacity of the hub and sequencer inboxes.
    pub request_queue_size: usize,
}

impl Default for LobbyConfig {
    fn default() -> Self {
        Self {
            process_waiting_timeout: Duration::from_secs(5),
            hub_dispatch_timeout: Duration::from_secs(3),
            session_create_timeout: Duration::from_secs(1),
            session_remove_timeout: Duration::from_secs(10),
            endpoint_queue_size: 32,
            request_queue_size: 32,
        }
    }
}

#[cfg(test)]
impl LobbyConfig {
    /// Shrunk timeouts so failure paths resolve quickly in tests.
    pub(crate) fn short() -> Self {
        Self {
            process_waiting_timeout: Duration::from_millis(50),
            hub_dispatch_timeout: Duration::from_millis(50),
            session_create_timeout: Duration::from_millis(50),
            session_remove_timeout: Duration::from_millis(100),
            endpoint_queue_size: 4,
            request_queue_size: 4,
        }
    }
}
