use std::time::Duration;

/// Tunables for the loop-thread side of the bridge.
#[derive(Debug, Clone)]
pub struct BridgeConfig {
    /// How long a parked continuation may wait before it is answered with a
    /// timeout. `None` waits forever.
    pub continuation_timeout: Option<Duration>,
    /// Upper bound on re-diff rounds for a single patch request.
    pub max_patch_rounds: u32,
    /// Upper bound on back-to-back `process_events` calls in one pump before
    /// control returns to the other event sources.
    pub max_pump_iterations: u32,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            continuation_timeout: Some(Duration::from_secs(60)),
            max_patch_rounds: 64,
            max_pump_iterations: 64,
        }
    }
}
