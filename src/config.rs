//! Broker configuration

/// Default capacity of the broker's command channel
pub const DEFAULT_COMMAND_BUFFER: usize = 100;

/// Default capacity of each client's outbound frame queue
pub const DEFAULT_OUTBOUND_BUFFER: usize = 32;

/// Channel sizing for the broker and its connections
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BrokerConfig {
    /// Requests queued for the broker before submitters wait
    pub command_buffer: usize,
    /// Frames queued per client before further frames are dropped
    pub outbound_buffer: usize,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            command_buffer: DEFAULT_COMMAND_BUFFER,
            outbound_buffer: DEFAULT_OUTBOUND_BUFFER,
        }
    }
}
