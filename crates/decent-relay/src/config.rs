/// Port used when `PORT` is not set.
pub const DEFAULT_PORT: u16 = 5000;
/// Frames queued per client before forwards to it start failing.
pub const DEFAULT_OUTBOX_CAPACITY: usize = 128;

#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Reply `peer-unavailable` to a sender whose target is not connected.
    /// Off by default: undeliverable envelopes are dropped silently.
    pub notify_unreachable: bool,
    pub outbox_capacity: usize,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            notify_unreachable: false,
            outbox_capacity: DEFAULT_OUTBOX_CAPACITY,
        }
    }
}
