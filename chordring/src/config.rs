//! Runtime configuration for ring nodes and the driver.
//!
//! The engine consumes an already-resolved [`RingConfig`]; whatever loads
//! parameters from files or the command line validates them once via
//! [`RingConfig::validated`] and the engine assumes valid input from then
//! on. Invalid parameters are startup errors and non-recoverable.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::id::{valid_bits, MAX_KEY_BITS};

/// Configuration error; fails the run at startup.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("bits per key must be a positive multiple of 32 up to {MAX_KEY_BITS}, got {0}")]
    BitsPerKey(u16),
    #[error("{0} must be nonzero")]
    ZeroBound(&'static str),
}

/// Resolved engine parameters.
///
/// Periods and offsets are in simulation steps. A task first fires at its
/// offset and every period steps thereafter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RingConfig {
    /// Ring width in bits; a positive multiple of 32, at most 160.
    pub bits_per_key: u16,
    /// Maximum successor-list length.
    pub successor_list_max: usize,
    /// Steps between stabilize firings.
    pub stabilize_period: u64,
    /// Step of the first stabilize firing.
    pub stabilize_offset: u64,
    /// Steps between fix-finger firings (one slot per firing).
    pub fix_finger_period: u64,
    /// Step of the first fix-finger firing.
    pub fix_finger_offset: u64,
    /// Capacity of each node's incoming and outgoing queue.
    pub queue_capacity: usize,
    /// Incoming messages a node may process per step.
    pub step_budget: usize,
    /// Steps run after each admission during incremental join.
    pub steps_between_joins: u64,
}

impl Default for RingConfig {
    fn default() -> Self {
        Self {
            bits_per_key: 160,
            successor_list_max: 8,
            stabilize_period: 4,
            stabilize_offset: 1,
            fix_finger_period: 2,
            fix_finger_offset: 2,
            queue_capacity: 256,
            step_budget: 16,
            steps_between_joins: 8,
        }
    }
}

impl RingConfig {
    /// Validate all parameters, consuming and returning the config.
    pub fn validated(self) -> Result<Self, ConfigError> {
        if !valid_bits(self.bits_per_key) {
            return Err(ConfigError::BitsPerKey(self.bits_per_key));
        }
        if self.successor_list_max == 0 {
            return Err(ConfigError::ZeroBound("successor_list_max"));
        }
        if self.stabilize_period == 0 {
            return Err(ConfigError::ZeroBound("stabilize_period"));
        }
        if self.fix_finger_period == 0 {
            return Err(ConfigError::ZeroBound("fix_finger_period"));
        }
        if self.queue_capacity == 0 {
            return Err(ConfigError::ZeroBound("queue_capacity"));
        }
        if self.step_budget == 0 {
            return Err(ConfigError::ZeroBound("step_budget"));
        }
        Ok(self)
    }

    /// A narrow 32-bit ring, convenient for tests and small scenarios.
    pub fn narrow() -> Self {
        Self {
            bits_per_key: 32,
            ..Self::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        assert!(RingConfig::default().validated().is_ok());
        assert!(RingConfig::narrow().validated().is_ok());
    }

    #[test]
    fn test_rejects_bad_bit_widths() {
        for bits in [0u16, 7, 33, 48, 192] {
            let cfg = RingConfig {
                bits_per_key: bits,
                ..RingConfig::default()
            };
            assert_eq!(cfg.validated(), Err(ConfigError::BitsPerKey(bits)));
        }
    }

    #[test]
    fn test_rejects_zero_bounds() {
        let cfg = RingConfig {
            successor_list_max: 0,
            ..RingConfig::default()
        };
        assert_eq!(
            cfg.validated(),
            Err(ConfigError::ZeroBound("successor_list_max"))
        );

        let cfg = RingConfig {
            queue_capacity: 0,
            ..RingConfig::default()
        };
        assert_eq!(cfg.validated(), Err(ConfigError::ZeroBound("queue_capacity")));
    }
}
