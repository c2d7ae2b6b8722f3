use std::io;
use thiserror::Error;

use crate::protocol::{codes, WireError};

#[derive(Error, Debug)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Broker error: {0}")]
    Broker(#[from] BrokerError),

    #[error("Supervisor error: {0}")]
    Supervisor(#[from] SupervisorError),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Remote error {code}: {message}")]
    Remote { code: i64, message: String },

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Service unavailable: {0}")]
    Unavailable(String),

    #[error("Invalid params: {0}")]
    InvalidParams(String),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Supervisor stopped")]
    Stopped,

    #[error("Timeout error")]
    Timeout,

    #[error("Failed to close resources: {}", .0.join("; "))]
    Close(Vec<String>),
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Environment variable error: {0}")]
    EnvVar(String),

    #[error("Unknown capability '{requested}' (plugin serves '{served}')")]
    UnknownCapability { requested: String, served: String },
}

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Send failed: {0}")]
    SendFailed(String),

    #[error("Receive failed: {0}")]
    ReceiveFailed(String),

    #[error("Transport closed")]
    Closed,

    #[error("Invalid message format")]
    InvalidFormat,
}

#[derive(Error, Debug)]
pub enum BrokerError {
    #[error("failed to serve {name} (id {id}): {reason}")]
    Serve { name: String, id: u32, reason: String },

    #[error("failed to dial {name} (id {id}): {source}")]
    Dial {
        name: String,
        id: u32,
        #[source]
        source: Box<Error>,
    },

    #[error("service {0} not registered")]
    ServiceNotFound(u32),

    #[error("broker has no active session")]
    NoSession,
}

#[derive(Error, Debug)]
pub enum SupervisorError {
    #[error("Failed to launch plugin {name}: {reason}")]
    LaunchFailed { name: String, reason: String },

    #[error("Plugin {0} is closed")]
    Closed(String),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Errors expected while tearing things down: the peer went away or the caller gave up.
    pub fn is_cancellation(&self) -> bool {
        match self {
            Error::Cancelled | Error::Stopped => true,
            Error::Transport(TransportError::Closed) => true,
            Error::Broker(BrokerError::NoSession) => true,
            Error::Broker(BrokerError::Dial { source, .. }) => source.is_cancellation(),
            Error::Remote { code, .. } => *code == codes::CANCELLED,
            _ => false,
        }
    }

    /// Whether a fresh connection could make the same call succeed.
    pub fn is_transport(&self) -> bool {
        match self {
            Error::Transport(_) => true,
            Error::Broker(BrokerError::ServiceNotFound(_) | BrokerError::NoSession) => true,
            Error::Broker(BrokerError::Dial { source, .. }) => source.is_transport(),
            Error::Remote { code, .. } => *code == codes::SERVICE_NOT_FOUND,
            _ => false,
        }
    }

    /// Whether the request provably never reached a service, so sending it again cannot
    /// run it twice.
    pub fn is_undelivered(&self) -> bool {
        match self {
            Error::Broker(BrokerError::ServiceNotFound(_) | BrokerError::NoSession) => true,
            Error::Broker(BrokerError::Dial { source, .. }) => source.is_undelivered(),
            Error::Remote { code, .. } => *code == codes::SERVICE_NOT_FOUND,
            _ => false,
        }
    }

    pub fn to_wire(&self) -> WireError {
        let code = match self {
            Error::Remote { code, .. } => *code,
            Error::NotFound(_) => codes::NOT_FOUND,
            Error::Unavailable(_) => codes::UNAVAILABLE,
            Error::InvalidParams(_) | Error::Serialization(_) => codes::INVALID_PARAMS,
            Error::Cancelled | Error::Stopped => codes::CANCELLED,
            Error::Broker(BrokerError::ServiceNotFound(_)) => codes::SERVICE_NOT_FOUND,
            Error::Config(ConfigError::UnknownCapability { .. }) => codes::UNKNOWN_CAPABILITY,
            _ => codes::INTERNAL_ERROR,
        };
        let message = match self {
            Error::Remote { message, .. } => message.clone(),
            Error::NotFound(what) | Error::Unavailable(what) | Error::InvalidParams(what) => {
                what.clone()
            }
            other => other.to_string(),
        };
        WireError { code, message }
    }

    pub fn method_not_found(method: &str) -> Self {
        Error::from_wire(WireError::method_not_found(method))
    }

    pub fn from_wire(err: WireError) -> Self {
        match err.code {
            codes::NOT_FOUND => Error::NotFound(err.message),
            codes::UNAVAILABLE => Error::Unavailable(err.message),
            codes::INVALID_PARAMS => Error::InvalidParams(err.message),
            codes::CANCELLED => Error::Cancelled,
            code => Error::Remote {
                code,
                message: err.message,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wire_round_trip_keeps_kind() {
        let err = Error::from_wire(Error::NotFound("relayer evm:1".into()).to_wire());
        assert!(matches!(err, Error::NotFound(ref what) if what == "relayer evm:1"));

        let err = Error::from_wire(Error::Cancelled.to_wire());
        assert!(err.is_cancellation());
    }

    #[test]
    fn test_service_not_found_is_transport_class() {
        let err = Error::from_wire(Error::from(BrokerError::ServiceNotFound(7)).to_wire());
        assert!(err.is_transport());
        assert!(!err.is_cancellation());
    }

    #[test]
    fn test_dial_error_names_collaborator() {
        let err: Error = BrokerError::Dial {
            name: "KeyValueStore".into(),
            id: 4,
            source: Box::new(TransportError::Closed.into()),
        }
        .into();
        let text = err.to_string();
        assert!(text.contains("KeyValueStore"));
        assert!(text.contains("id 4"));
        assert!(err.is_cancellation());
    }

    #[test]
    fn test_missing_session_is_cancellation_class() {
        let err: Error = BrokerError::NoSession.into();
        assert!(err.is_cancellation());
        assert!(err.is_transport());

        let err: Error = BrokerError::Dial {
            name: "reporting-plugin".into(),
            id: 1,
            source: Box::new(BrokerError::NoSession.into()),
        }
        .into();
        assert!(err.is_cancellation());
    }
}
