#[derive(Clone, Debug, thiserror::Error)]
pub enum AgentError {
    #[error("cannot connect to agent server: {0}")]
    Connection(String),

    #[error("agent request timed out after {0}s")]
    Timeout(u64),

    #[error("agent server error {status}: {body}")]
    Server { status: u16, body: String },

    #[error("agent request rejected ({status}): {body}")]
    Request { status: u16, body: String },

    #[error("malformed agent response: {0}")]
    Malformed(String),

    #[error("retry budget exhausted: {0}")]
    RetriesExhausted(String),
}

impl AgentError {
    /// Transient failures worth retrying: network, 5xx, timeout.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Connection(_) | Self::Timeout(_) | Self::Server { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_errors_are_retryable() {
        assert!(AgentError::Connection("refused".into()).is_retryable());
        assert!(AgentError::Timeout(60).is_retryable());
        assert!(AgentError::Server { status: 503, body: "overloaded".into() }.is_retryable());
    }

    #[test]
    fn client_errors_are_not_retryable() {
        assert!(!AgentError::Request { status: 400, body: "bad".into() }.is_retryable());
        assert!(!AgentError::Malformed("no choices".into()).is_retryable());
        assert!(!AgentError::RetriesExhausted("gave up".into()).is_retryable());
    }

    #[test]
    fn display_formatting() {
        let err = AgentError::Server { status: 500, body: "boom".into() };
        assert_eq!(err.to_string(), "agent server error 500: boom");
    }
}
