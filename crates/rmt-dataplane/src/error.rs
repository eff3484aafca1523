//! Error types for data-plane operations

use thiserror::Error;

/// Result type alias for data-plane operations
pub type Result<T> = std::result::Result<T, DataplaneError>;

/// Errors that can occur while configuring or running the data plane
#[derive(Debug, Error)]
pub enum DataplaneError {
    /// A control-plane request carried a configuration that violates an
    /// invariant (dimension mismatch, width out of range, gap in a table)
    #[error("Invalid configuration: {reason}")]
    ConfigInvalid {
        /// What was wrong with the configuration
        reason: String,
    },

    /// A control-plane request arrived before a pipeline handle was installed
    #[error("Pipeline handle not installed")]
    NotInstalled,

    /// Processor id outside the addressable range
    #[error("Processor id {proc_id} out of range (have {count})")]
    InvalidProcessor {
        /// Requested processor id
        proc_id: i32,
        /// Number of addressable processors
        count: usize,
    },

    /// Matcher slot outside the per-processor range
    #[error("Matcher id {matcher_id} out of range (have {count} slots)")]
    InvalidMatcher {
        /// Requested matcher slot
        matcher_id: i32,
        /// Matcher slots per processor
        count: usize,
    },

    /// Action id outside the executor's table
    #[error("Action id {action_id} out of range (have {count} slots)")]
    InvalidAction {
        /// Requested action id
        action_id: i32,
        /// Action slots per executor
        count: usize,
    },

    /// Ingress frame larger than the packet buffer
    #[error("Frame of {len} bytes exceeds the {capacity}-byte packet buffer")]
    FrameTooLarge {
        /// Ingress frame length
        len: usize,
        /// Packet buffer capacity
        capacity: usize,
    },

    /// A field or header extraction reached past the packet buffer
    #[error("Extraction past packet buffer: bit {end_bit} beyond {capacity_bits}")]
    BufferOverrun {
        /// One past the last bit the access touched
        end_bit: usize,
        /// Buffer capacity in bits
        capacity_bits: usize,
    },

    /// A neuron-primitive context id that was never loaded
    #[error("Neuron primitive context {context_id} not loaded")]
    MissingContext {
        /// Requested context id
        context_id: u16,
    },

    /// Sigmoid lookup requested before a table was loaded
    #[error("Sigmoid table not loaded")]
    SigmoidNotLoaded,

    /// An accelerator operation failed a runtime precondition
    #[error("{op}: {reason}")]
    Accel {
        /// Operation name
        op: &'static str,
        /// Why the precondition failed
        reason: String,
    },
}

impl DataplaneError {
    /// Create a configuration-invalid error
    pub fn config_invalid(reason: impl Into<String>) -> Self {
        Self::ConfigInvalid {
            reason: reason.into(),
        }
    }

    /// Create an accelerator runtime error
    pub fn accel(op: &'static str, reason: impl Into<String>) -> Self {
        Self::Accel {
            op,
            reason: reason.into(),
        }
    }
}
