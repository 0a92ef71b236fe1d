use thiserror::Error;

#[derive(Error, Debug)]
pub enum KafkaError {
    #[error("Invalid configuration: {0}")]
    ConfigurationError(String),

    #[error("Failed to connect to broker: {0}")]
    ConnectionError(String),

    #[error("Protocol error: {0}")]
    ProtocolError(String),

    #[error("Broker error: code={code}, message={message}")]
    BrokerProtocolError {
        code: i16,
        message: String,
    },

    #[error("Timeout error: {0}")]
    TimeoutError(String),

    #[error("Authentication failed: {0}")]
    AuthenticationError(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

impl KafkaError {
    pub fn configuration<S: Into<String>>(message: S) -> Self {
        Self::ConfigurationError(message.into())
    }

    pub fn connection<S: Into<String>>(message: S) -> Self {
        Self::ConnectionError(message.into())
    }

    pub fn protocol<S: Into<String>>(message: S) -> Self {
        Self::ProtocolError(message.into())
    }

    /// Errors worth retrying on the next timer tick.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::ConnectionError(_) | Self::TimeoutError(_) | Self::IoError(_)
        )
    }
}
