use anyhow::bail;
use std::time::Duration;

/// Config for the fixed-timeout acknowledgement module: every pending message is retransmitted
///  whenever it has gone unacknowledged for longer than `retransmit_timeout`. There is no
///  backoff and no cap on attempts - the module keeps resending until an acknowledgement
///  arrives.
#[derive(Clone, Debug)]
pub struct AckConfig {
    pub retransmit_timeout: Duration,
}

impl Default for AckConfig {
    fn default() -> Self {
        AckConfig {
            retransmit_timeout: Duration::from_millis(500),
        }
    }
}

impl AckConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.retransmit_timeout.is_zero() {
            bail!("retransmit timeout must be non-zero");
        }
        Ok(())
    }
}

/// Config for the adaptive-timeout acknowledgement module. The effective retransmission
///  timeout is derived from the most recent round-trip measurement as
///  `max(min_timeout, measured * timeout_multiplier)`; `max_timeout` is a hard ceiling that
///  triggers retransmission even before any measurement exists.
#[derive(Clone, Debug)]
pub struct DynamicAckConfig {
    pub min_timeout: Duration,
    pub max_timeout: Duration,
    pub timeout_multiplier: f64,
}

impl Default for DynamicAckConfig {
    fn default() -> Self {
        DynamicAckConfig {
            min_timeout: Duration::from_millis(1),
            max_timeout: Duration::from_millis(1000),
            timeout_multiplier: 2.0,
        }
    }
}

impl DynamicAckConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.max_timeout < self.min_timeout {
            bail!("max timeout must not be smaller than min timeout");
        }
        if !self.timeout_multiplier.is_finite() || self.timeout_multiplier <= 0.0 {
            bail!("timeout multiplier must be a positive finite number");
        }
        Ok(())
    }
}

/// Config for the fixed-timeout stream module.
#[derive(Clone, Debug)]
pub struct StreamConfig {
    pub retransmit_timeout: Duration,

    /// Maximum distance beyond the next in-order sequence number that the receiver will
    ///  buffer; messages further ahead are dropped silently and must be retransmitted once
    ///  the window has moved.
    pub receive_buffer_size: u32,
}

impl Default for StreamConfig {
    fn default() -> Self {
        StreamConfig {
            retransmit_timeout: Duration::from_millis(50),
            receive_buffer_size: 50,
        }
    }
}

impl StreamConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.retransmit_timeout.is_zero() {
            bail!("retransmit timeout must be non-zero");
        }
        Ok(())
    }
}

/// Config for the adaptive-timeout stream module; see [DynamicAckConfig] for the timeout
///  derivation and [StreamConfig::receive_buffer_size] for the window semantics.
#[derive(Clone, Debug)]
pub struct DynamicStreamConfig {
    pub min_timeout: Duration,
    pub max_timeout: Duration,
    pub timeout_multiplier: f64,
    pub receive_buffer_size: u32,
}

impl Default for DynamicStreamConfig {
    fn default() -> Self {
        DynamicStreamConfig {
            min_timeout: Duration::from_millis(1),
            max_timeout: Duration::from_millis(500),
            timeout_multiplier: 2.0,
            receive_buffer_size: 50,
        }
    }
}

impl DynamicStreamConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.max_timeout < self.min_timeout {
            bail!("max timeout must not be smaller than min timeout");
        }
        if !self.timeout_multiplier.is_finite() || self.timeout_multiplier <= 0.0 {
            bail!("timeout multiplier must be a positive finite number");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    fn test_defaults_are_valid() {
        AckConfig::default().validate().unwrap();
        DynamicAckConfig::default().validate().unwrap();
        StreamConfig::default().validate().unwrap();
        DynamicStreamConfig::default().validate().unwrap();
    }

    #[rstest]
    fn test_rejects_zero_timeout() {
        let config = AckConfig { retransmit_timeout: Duration::ZERO };
        assert!(config.validate().is_err());

        let config = StreamConfig { retransmit_timeout: Duration::ZERO, ..StreamConfig::default() };
        assert!(config.validate().is_err());
    }

    #[rstest]
    #[case::inverted_bounds(Duration::from_millis(10), Duration::from_millis(5), 2.0)]
    #[case::zero_multiplier(Duration::from_millis(1), Duration::from_millis(10), 0.0)]
    #[case::nan_multiplier(Duration::from_millis(1), Duration::from_millis(10), f64::NAN)]
    fn test_rejects_bad_dynamic_config(
        #[case] min_timeout: Duration,
        #[case] max_timeout: Duration,
        #[case] timeout_multiplier: f64,
    ) {
        let config = DynamicAckConfig { min_timeout, max_timeout, timeout_multiplier };
        assert!(config.validate().is_err());

        let config = DynamicStreamConfig { min_timeout, max_timeout, timeout_multiplier, receive_buffer_size: 50 };
        assert!(config.validate().is_err());
    }
}
