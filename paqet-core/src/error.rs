use thiserror::Error;

/// Paqet error types
#[derive(Error, Debug)]
pub enum Error {
    #[error("Configuration error: {message}")]
    Config {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    #[error("Bind failed: {message}")]
    Bind {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    #[error("send queue full, packet dropped")]
    QueueFull,

    #[error("Injection failed: {message}")]
    Injection { message: String },

    #[error("Capture error: {message}")]
    Capture { message: String },

    #[error("Network error: {message}")]
    Network {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    #[error("Protocol error: {message}")]
    Protocol { message: String },

    #[error("connection lost")]
    ConnectionLost,

    #[error("failed to create stream after {attempts} attempts")]
    StreamUnavailable { attempts: usize },

    #[error("deadline exceeded")]
    DeadlineExceeded,

    #[error("operation cancelled")]
    Cancelled,

    #[error("Target dial failed: {target}: {message}")]
    TargetDial { target: String, message: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Create a new configuration error
    pub fn config<S: Into<String>>(message: S) -> Self {
        Self::Config {
            message: message.into(),
            source: None,
        }
    }

    /// Create a new configuration error with source
    pub fn config_with_source<S: Into<String>, E: std::error::Error + Send + Sync + 'static>(
        message: S,
        source: E,
    ) -> Self {
        Self::Config {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Create a new bind error
    pub fn bind<S: Into<String>>(message: S) -> Self {
        Self::Bind {
            message: message.into(),
            source: None,
        }
    }

    /// Create a new bind error with source
    pub fn bind_with_source<S: Into<String>, E: std::error::Error + Send + Sync + 'static>(
        message: S,
        source: E,
    ) -> Self {
        Self::Bind {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Create a new network error
    pub fn network<S: Into<String>>(message: S) -> Self {
        Self::Network {
            message: message.into(),
            source: None,
        }
    }

    /// Create a new network error with source
    pub fn network_with_source<S: Into<String>, E: std::error::Error + Send + Sync + 'static>(
        message: S,
        source: E,
    ) -> Self {
        Self::Network {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Create a new protocol error
    pub fn protocol<S: Into<String>>(message: S) -> Self {
        Self::Protocol {
            message: message.into(),
        }
    }

    /// Create a new injection error
    pub fn injection<S: Into<String>>(message: S) -> Self {
        Self::Injection {
            message: message.into(),
        }
    }

    /// Create a new capture error
    pub fn capture<S: Into<String>>(message: S) -> Self {
        Self::Capture {
            message: message.into(),
        }
    }

    /// Create a new target dial error
    pub fn target_dial<T: Into<String>, S: Into<String>>(target: T, message: S) -> Self {
        Self::TargetDial {
            target: target.into(),
            message: message.into(),
        }
    }

    /// Get error code/category for external use
    pub fn code(&self) -> &'static str {
        match self {
            Self::Config { .. } => "CONFIG",
            Self::Bind { .. } => "BIND",
            Self::QueueFull => "QUEUE_FULL",
            Self::Injection { .. } => "INJECTION",
            Self::Capture { .. } => "CAPTURE",
            Self::Network { .. } => "NETWORK",
            Self::Protocol { .. } => "PROTOCOL",
            Self::ConnectionLost => "CONNECTION_LOST",
            Self::StreamUnavailable { .. } => "STREAM_UNAVAILABLE",
            Self::DeadlineExceeded => "DEADLINE",
            Self::Cancelled => "CANCELLED",
            Self::TargetDial { .. } => "TARGET_DIAL",
            Self::Io(_) => "IO",
        }
    }

    /// Check if this is a recoverable error
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::Config { .. } | Self::Bind { .. } | Self::Protocol { .. } => false,
            Self::Cancelled => false,
            _ => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes() {
        assert_eq!(Error::QueueFull.code(), "QUEUE_FULL");
        assert_eq!(Error::config("bad").code(), "CONFIG");
        assert_eq!(Error::ConnectionLost.code(), "CONNECTION_LOST");
        assert_eq!(Error::StreamUnavailable { attempts: 5 }.code(), "STREAM_UNAVAILABLE");
    }

    #[test]
    fn test_recoverable() {
        assert!(Error::QueueFull.is_recoverable());
        assert!(Error::injection("pcap down").is_recoverable());
        assert!(Error::ConnectionLost.is_recoverable());
        assert!(!Error::config("bad role").is_recoverable());
        assert!(!Error::Cancelled.is_recoverable());
    }

    #[test]
    fn test_display() {
        let err = Error::StreamUnavailable { attempts: 5 };
        assert_eq!(err.to_string(), "failed to create stream after 5 attempts");
        assert_eq!(Error::QueueFull.to_string(), "send queue full, packet dropped");
    }
}
