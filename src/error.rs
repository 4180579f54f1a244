//! Errors surfaced by the overlay's public operations.

use crate::bootstrap::BootstrapTierLevel;
use crate::discovery::DiscoveryResult;
use crate::identity::NodeId;

/// Result type alias.
pub type Result<T> = std::result::Result<T, OverlayError>;

#[derive(Debug, thiserror::Error)]
pub enum OverlayError {
    /// An RPC did not answer within its timeout after every local retry.
    #[error("RPC to {peer} timed out after {attempts} attempt(s)")]
    NetworkTimeout { peer: NodeId, attempts: usize },

    /// A remote call failed for a reason other than a timeout.
    #[error("RPC to {peer} failed: {reason}")]
    Rpc { peer: NodeId, reason: String },

    /// Discovery fell short of the required count beyond the configured
    /// tolerance. Whatever was found is attached.
    #[error("discovery found {found} of {required} required peers")]
    InsufficientNodes {
        found: usize,
        required: usize,
        partial: Box<DiscoveryResult>,
    },

    /// Every bootstrap tier was tried and none admitted us.
    #[error("bootstrap exhausted after {attempts} attempt(s) across tiers {tiers_tried:?}")]
    BootstrapExhausted {
        attempts: usize,
        tiers_tried: Vec<BootstrapTierLevel>,
    },

    /// Structural invariants of the routing table were violated.
    #[error("routing table corruption: {issues} issue(s)")]
    RoutingCorruption { issues: usize },

    /// Network size could not be estimated.
    #[error("network size estimation failed: {0}")]
    ParameterEstimation(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// A component's background actor has stopped.
    #[error("{0} stopped")]
    Closed(&'static str),
}

impl OverlayError {
    pub fn invalid_config<S: Into<String>>(msg: S) -> Self {
        Self::InvalidConfig(msg.into())
    }

    pub fn rpc<S: Into<String>>(peer: NodeId, reason: S) -> Self {
        Self::Rpc {
            peer,
            reason: reason.into(),
        }
    }

    /// Errors worth retrying locally.
    pub fn is_transient(&self) -> bool {
        matches!(self, OverlayError::NetworkTimeout { .. } | OverlayError::Rpc { .. })
    }
}
