use thiserror::Error;

#[derive(Error, Debug)]
pub enum RpcError {
    #[error("connection error: {0}")]
    Connection(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("codec error: {0}")]
    Codec(#[from] postcard::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid handshake: {0}")]
    InvalidHandshake(String),

    #[error("invalid codec type {0}")]
    UnknownCodec(String),

    #[error("frame too large: {len} bytes (max {max} bytes)")]
    FrameTooLarge { len: usize, max: usize },

    #[error("connect timeout: expect within {0}ms")]
    ConnectTimeout(u64),

    #[error("call timeout")]
    CallTimeout,

    #[error("call cancelled")]
    Cancelled,

    #[error("connection is shut down")]
    Shutdown,

    #[error("{0}")]
    Remote(String),

    #[error("service/method request ill-formed: {0}")]
    InvalidServiceMethod(String),

    #[error("can't find service {0}")]
    ServiceNotFound(String),

    #[error("can't find method {method} in service {service}")]
    MethodNotFound { service: String, method: String },

    #[error("service already registered: {0}")]
    DuplicateService(String),

    #[error("invalid service name: {0}")]
    InvalidServiceName(String),

    #[error("{0}")]
    Handler(String),

    #[error("no available servers")]
    NoAvailableServers,

    #[error("invalid address: {0}")]
    InvalidAddress(String),

    #[error("registry error: {0}")]
    Registry(String),
}

impl RpcError {
    /// Shorthand for a handler-reported failure; the message travels back to
    /// the caller verbatim in the response header.
    pub fn handler(msg: impl Into<String>) -> Self {
        RpcError::Handler(msg.into())
    }
}

pub type Result<T> = std::result::Result<T, RpcError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shutdown_message() {
        assert_eq!(RpcError::Shutdown.to_string(), "connection is shut down");
    }

    #[test]
    fn test_remote_error_is_verbatim() {
        let err = RpcError::Remote("divide by zero".to_string());
        assert_eq!(err.to_string(), "divide by zero");
    }

    #[test]
    fn test_method_lookup_errors_are_distinct() {
        let malformed = RpcError::InvalidServiceMethod("NoDot".to_string());
        let missing = RpcError::ServiceNotFound("Arith".to_string());
        let no_method = RpcError::MethodNotFound {
            service: "Arith".to_string(),
            method: "Sub".to_string(),
        };
        assert!(malformed.to_string().contains("NoDot"));
        assert!(missing.to_string().contains("Arith"));
        assert!(no_method.to_string().contains("Sub"));
    }
}
