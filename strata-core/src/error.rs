//! Error Types
//!
//! Three kinds of failure flow through the crate:
//!
//! - Absence is not an error at all. A missing identity or dependency is an
//!   ordinary value (`None`, an empty list) and never shows up here.
//! - Upstream failure is carried as an [`UpstreamError`] inside a node's
//!   cached value, so consumers can tell it apart from both absence and
//!   success.
//! - Invariant violations (dependency cycles, mutating the graph from inside
//!   a computation) are reported through [`GraphError`] and are fatal.

use std::fmt;
use std::sync::Arc;

use thiserror::Error;

use crate::graph::NodeId;

/// An error produced by an external stream and cached by the node that
/// wraps it.
///
/// Cheap to clone: every reader of a failed node receives the same message.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct UpstreamError {
    message: Arc<str>,
}

impl UpstreamError {
    pub fn new(message: impl fmt::Display) -> Self {
        Self {
            message: message.to_string().into(),
        }
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

/// Why a derived computation could not read one of its upstream nodes.
///
/// Computations return this with `?`; the store decides what it means for
/// the derived node being computed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ReadError {
    /// The upstream node has not produced a value yet.
    #[error("upstream value is not ready yet")]
    Pending,

    /// The upstream node is in its error state.
    #[error(transparent)]
    Upstream(#[from] UpstreamError),

    /// The handle points at a node that has been disposed and removed.
    #[error("node {0} is not registered")]
    Missing(NodeId),
}

/// Errors surfaced by the store's public API.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GraphError {
    #[error("node {0} is not registered")]
    UnknownNode(NodeId),

    #[error(transparent)]
    Upstream(#[from] UpstreamError),

    /// The node's stream finished before producing anything.
    #[error("node {0} finished without producing a value")]
    Closed(NodeId),

    #[error("dependency cycle: node {node} would read {upstream}, which already depends on it")]
    Cycle { node: NodeId, upstream: NodeId },

    #[error("graph mutated while node {0} was computing")]
    Reentrant(NodeId),

    #[error("node {0} is not a state node and cannot be set")]
    NotState(NodeId),
}

/// Errors raised while loading [`crate::config::Config`].
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Couldn't parse configuration.\n{0}")]
    Parse(#[from] serde_json::Error),

    #[error("tick period must be greater than zero")]
    InvalidTickPeriod,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn upstream_error_displays_message() {
        let err = UpstreamError::new("permission denied");
        assert_eq!(err.to_string(), "permission denied");
        assert_eq!(err.clone(), err);
    }

    #[test]
    fn read_error_wraps_upstream_transparently() {
        let err: ReadError = UpstreamError::new("offline").into();
        assert_eq!(err.to_string(), "offline");
        assert_ne!(err, ReadError::Pending);
    }
}
