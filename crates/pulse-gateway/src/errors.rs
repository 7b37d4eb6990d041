//! Gateway error types.

use pulse_core::ids::{ConnectionId, UserId};

use crate::transport::TransportError;

/// Errors that can occur on the connection side of the service.
#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    /// User is at their connection quota and emergency cleanup could not
    /// reclaim enough. Surfaced to the connecting client.
    #[error("connection limit exceeded for user {user_id}: at {limit} connections")]
    ConnectionLimitExceeded {
        /// User at quota.
        user_id: UserId,
        /// The configured quota.
        limit: usize,
    },

    /// A write raced a close and lost. Local, logged, treated as an
    /// already-handled failed delivery — never surfaced to callers.
    #[error("send after close on connection {connection_id}")]
    SendAfterClose {
        /// Connection that was already closing/closed.
        connection_id: ConnectionId,
    },

    /// A connection presented for registration was already closing, closed,
    /// or in the error path.
    #[error("connection {connection_id} is not in a registrable state")]
    NotRegistrable {
        /// The rejected connection.
        connection_id: ConnectionId,
    },

    /// The underlying transport rejected a write.
    #[error("transport failure on connection {connection_id}: {source}")]
    Transport {
        /// Connection whose transport failed.
        connection_id: ConnectionId,
        /// Transport-level cause.
        #[source]
        source: TransportError,
    },
}

impl GatewayError {
    /// Error category string for logging and metrics labels.
    #[must_use]
    pub fn category(&self) -> &'static str {
        match self {
            Self::ConnectionLimitExceeded { .. } => "connection_limit",
            Self::SendAfterClose { .. } => "send_after_close",
            Self::NotRegistrable { .. } => "not_registrable",
            Self::Transport { .. } => "transport",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn limit_error_names_user_and_limit() {
        let err = GatewayError::ConnectionLimitExceeded {
            user_id: UserId::from("u1"),
            limit: 20,
        };
        let msg = err.to_string();
        assert!(msg.contains("u1"));
        assert!(msg.contains("20"));
    }

    #[test]
    fn send_after_close_display() {
        let err = GatewayError::SendAfterClose {
            connection_id: ConnectionId::from("c9"),
        };
        assert_eq!(err.to_string(), "send after close on connection c9");
    }

    #[test]
    fn categories() {
        let err = GatewayError::Transport {
            connection_id: ConnectionId::from("c1"),
            source: TransportError::Closed,
        };
        assert_eq!(err.category(), "transport");
        assert_eq!(
            GatewayError::SendAfterClose {
                connection_id: ConnectionId::from("c1")
            }
            .category(),
            "send_after_close"
        );
    }
}
