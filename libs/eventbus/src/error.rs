//! Event Bus Error Types
//!
//! Failures that surface to reply handlers and deployment callers, plus the
//! operational errors returned directly by bus and context operations.

use std::fmt;
use thiserror::Error;

/// Failure kinds observable by senders and deployers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailureKind {
    /// Send or request with zero active consumers and a reply expected
    NoHandlers,
    /// Request exceeded its timeout
    ReplyTimeout,
    /// Consumer handler failed or panicked during dispatch
    HandlerFailure,
    /// Second reply on one envelope
    AlreadyReplied,
    /// Verticle construction or start lifecycle failed
    DeploymentFailed,
}

impl FailureKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureKind::NoHandlers => "NO_HANDLERS",
            FailureKind::ReplyTimeout => "REPLY_TIMEOUT",
            FailureKind::HandlerFailure => "HANDLER_FAILURE",
            FailureKind::AlreadyReplied => "ALREADY_REPLIED",
            FailureKind::DeploymentFailed => "DEPLOYMENT_FAILED",
        }
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Main event bus error type
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BusError {
    /// No local or remote consumer accepted a point-to-point message
    #[error("No handlers for address {address}")]
    NoHandlers { address: String },

    /// Reply did not arrive in time
    #[error("Timed out after {timeout_ms}ms waiting for a reply from {address}")]
    ReplyTimeout { address: String, timeout_ms: u64 },

    /// Consumer handler returned an error, panicked or failed the message explicitly
    #[error("Handler failure on {address}: {message}")]
    HandlerFailure { address: String, message: String },

    /// Reply attempted twice on the same message
    #[error("Message from {address} has already been replied to")]
    AlreadyReplied { address: String },

    /// Deployment could not be completed
    #[error("Deployment {deployment} failed: {reason}")]
    DeploymentFailed { deployment: String, reason: String },

    /// Context no longer accepts tasks
    #[error("Context {context} is closed")]
    ContextClosed { context: String },

    /// Address is empty
    #[error("Invalid address: {reason}")]
    InvalidAddress { reason: String },

    /// Reply attempted on a message sent without a reply handler
    #[error("Message from {address} carries no reply address")]
    NoReplyAddress { address: String },

    /// Deployment id not known to the deployment manager
    #[error("Unknown deployment {deployment}")]
    UnknownDeployment { deployment: String },

    /// Configuration errors
    #[error("Configuration error: {message}")]
    Configuration {
        message: String,
        field: Option<String>,
    },

    /// Body encoding or decoding errors
    #[error("Codec error: {codec}: {message}")]
    Codec { codec: String, message: String },

    /// System-level errors (thread spawn, runtime construction, shutdown)
    #[error("System error: {message}")]
    System { message: String },
}

/// Result type alias for bus operations
pub type Result<T> = std::result::Result<T, BusError>;

impl BusError {
    pub fn no_handlers(address: impl Into<String>) -> Self {
        Self::NoHandlers {
            address: address.into(),
        }
    }

    pub fn reply_timeout(address: impl Into<String>, timeout_ms: u64) -> Self {
        Self::ReplyTimeout {
            address: address.into(),
            timeout_ms,
        }
    }

    pub fn handler_failure(address: impl Into<String>, message: impl Into<String>) -> Self {
        Self::HandlerFailure {
            address: address.into(),
            message: message.into(),
        }
    }

    pub fn already_replied(address: impl Into<String>) -> Self {
        Self::AlreadyReplied {
            address: address.into(),
        }
    }

    pub fn deployment_failed(deployment: impl fmt::Display, reason: impl Into<String>) -> Self {
        Self::DeploymentFailed {
            deployment: deployment.to_string(),
            reason: reason.into(),
        }
    }

    pub fn context_closed(context: impl fmt::Display) -> Self {
        Self::ContextClosed {
            context: context.to_string(),
        }
    }

    pub fn invalid_address(reason: impl Into<String>) -> Self {
        Self::InvalidAddress {
            reason: reason.into(),
        }
    }

    pub fn no_reply_address(address: impl Into<String>) -> Self {
        Self::NoReplyAddress {
            address: address.into(),
        }
    }

    pub fn unknown_deployment(deployment: impl fmt::Display) -> Self {
        Self::UnknownDeployment {
            deployment: deployment.to_string(),
        }
    }

    /// Create a configuration error
    pub fn configuration(message: impl Into<String>, field: Option<&str>) -> Self {
        Self::Configuration {
            message: message.into(),
            field: field.map(|s| s.to_string()),
        }
    }

    pub fn codec(codec: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Codec {
            codec: codec.into(),
            message: message.into(),
        }
    }

    pub fn system(message: impl Into<String>) -> Self {
        Self::System {
            message: message.into(),
        }
    }

    /// Taxonomy kind for failures that are reported to senders and deployers
    pub fn kind(&self) -> Option<FailureKind> {
        match self {
            BusError::NoHandlers { .. } => Some(FailureKind::NoHandlers),
            BusError::ReplyTimeout { .. } => Some(FailureKind::ReplyTimeout),
            BusError::HandlerFailure { .. } => Some(FailureKind::HandlerFailure),
            BusError::AlreadyReplied { .. } => Some(FailureKind::AlreadyReplied),
            BusError::DeploymentFailed { .. } => Some(FailureKind::DeploymentFailed),
            _ => None,
        }
    }

    /// Check whether this error carries the given failure kind
    pub fn is(&self, kind: FailureKind) -> bool {
        self.kind() == Some(kind)
    }

    /// Get error category for logging
    pub fn category(&self) -> &'static str {
        match self {
            BusError::NoHandlers { .. } => "no_handlers",
            BusError::ReplyTimeout { .. } => "reply_timeout",
            BusError::HandlerFailure { .. } => "handler_failure",
            BusError::AlreadyReplied { .. } => "already_replied",
            BusError::DeploymentFailed { .. } => "deployment_failed",
            BusError::ContextClosed { .. } => "context_closed",
            BusError::InvalidAddress { .. } => "invalid_address",
            BusError::NoReplyAddress { .. } => "no_reply_address",
            BusError::UnknownDeployment { .. } => "unknown_deployment",
            BusError::Configuration { .. } => "configuration",
            BusError::Codec { .. } => "codec",
            BusError::System { .. } => "system",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_failure_kinds() {
        assert_eq!(
            BusError::no_handlers("a").kind(),
            Some(FailureKind::NoHandlers)
        );
        assert!(BusError::reply_timeout("a", 10).is(FailureKind::ReplyTimeout));
        assert!(BusError::deployment_failed("d", "boom").is(FailureKind::DeploymentFailed));
        assert_eq!(BusError::context_closed("context-1").kind(), None);
    }

    #[test]
    fn test_display_and_category() {
        let err = BusError::reply_timeout("orders", 250);
        assert_eq!(
            err.to_string(),
            "Timed out after 250ms waiting for a reply from orders"
        );
        assert_eq!(err.category(), "reply_timeout");
        assert_eq!(FailureKind::AlreadyReplied.to_string(), "ALREADY_REPLIED");
    }
}
