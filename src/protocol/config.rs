use std::time::Duration;

use anyhow::bail;


/// Timing parameters of [crate::protocol::persistent::PersistentProtocol]. Both peers should
///  use the same values, though nothing breaks if they don't.
#[derive(Debug, Clone)]
pub struct PersistentProtocolConfig {
    /// Received messages are acknowledged no earlier than this after they were received, to
    ///  give outgoing traffic a chance to carry the ack.
    pub acknowledge_time: Duration,
    /// The peer is considered unresponsive if nothing was received and the oldest
    ///  unacknowledged message has been waiting for this long.
    pub timeout_time: Duration,
    pub keep_alive_send_time: Duration,
    /// minimum interval between two replay requests
    pub replay_request_throttle: Duration,
    /// lower bound for re-checking for timeouts, to avoid polling in a tight loop
    pub min_timeout_check_interval: Duration,
    /// added to the delayed ack check so it fires *after* the ack time elapsed
    pub ack_check_slack: Duration,
}

impl Default for PersistentProtocolConfig {
    fn default() -> Self {
        PersistentProtocolConfig {
            acknowledge_time: Duration::from_millis(2000),
            timeout_time: Duration::from_millis(20000),
            keep_alive_send_time: Duration::from_millis(5000),
            replay_request_throttle: Duration::from_millis(10000),
            min_timeout_check_interval: Duration::from_millis(500),
            ack_check_slack: Duration::from_millis(5),
        }
    }
}

impl PersistentProtocolConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.acknowledge_time.is_zero() {
            bail!("acknowledge time must be positive");
        }
        if self.timeout_time.is_zero() {
            bail!("timeout time must be positive");
        }
        if self.keep_alive_send_time.is_zero() {
            bail!("keep-alive interval must be positive");
        }
        if self.min_timeout_check_interval.is_zero() {
            bail!("minimum timeout check interval must be positive");
        }
        Ok(())
    }
}
