//! Error taxonomy for image builds and the on-device boot controller.
//!
//! Library code propagates `anyhow::Error` like the rest of the crate. The
//! variants here are raised where a caller (or a test) needs to tell the
//! failure classes apart, via `err.downcast_ref::<BuildError>()`.

use thiserror::Error;

/// Classified build and device errors.
#[derive(Debug, Error)]
pub enum BuildError {
    /// Invalid or missing configuration, or ambiguous discovered state
    /// (e.g. more than one installed kernel version).
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Corrupt or partially written cache entry. Always recovered as a miss.
    #[error("cache error: {0}")]
    Cache(String),

    /// Payload larger than the space allocated for it.
    #[error("overflow: {target} needs {needed} bytes but only {capacity} bytes are allocated")]
    Overflow {
        target: String,
        needed: u64,
        capacity: u64,
    },

    /// Boot configuration disagrees with the partition layout.
    #[error("layout error: {0}")]
    Layout(String),

    /// Persisted A/B state is unreadable. Recovered by falling back to a slot.
    #[error("device state error: {0}")]
    DeviceState(String),
}

impl BuildError {
    /// Short stable code, used in log fields.
    pub fn code(&self) -> &'static str {
        match self {
            BuildError::Configuration(_) => "configuration",
            BuildError::Cache(_) => "cache",
            BuildError::Overflow { .. } => "overflow",
            BuildError::Layout(_) => "layout",
            BuildError::DeviceState(_) => "device_state",
        }
    }

    pub(crate) fn overflow(target: impl Into<String>, needed: u64, capacity: u64) -> Self {
        BuildError::Overflow {
            target: target.into(),
            needed,
            capacity,
        }
    }
}

/// Returns the taxonomy error carried by `err`, if any.
pub fn classify(err: &anyhow::Error) -> Option<&BuildError> {
    err.chain().find_map(|cause| cause.downcast_ref::<BuildError>())
}
