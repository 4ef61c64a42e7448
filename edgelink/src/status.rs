use std::fmt;

use thiserror::Error;

/// Classification of everything that can go wrong inside the agent.
///
/// Every public entry point of this crate reports failures through exactly one
/// of these kinds. Component-internal errors (MQTT, HTTP, archive handling)
/// are translated into the taxonomy at the boundary of the component that
/// produced them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ErrorKind {
    #[error("invalid parameter passed to function")]
    BadParameter,
    #[error("invalid request received")]
    BadRequest,
    #[error("item not found")]
    NotFound,
    #[error("out of memory")]
    NoMemory,
    #[error("permission denied")]
    NoPermission,
    #[error("maximum number of items reached")]
    Full,
    #[error("input/output error")]
    IoError,
    #[error("error parsing message")]
    ParseError,
    #[error("operation timed out")]
    TimedOut,
    #[error("internal error")]
    Failure,
    #[error("error executing command")]
    ExecutionError,
    #[error("not initialized")]
    NotInitialized,
    #[error("failed to open file")]
    FileOpenFailed,
    #[error("value out of allowed range")]
    OutOfRange,
}

impl ErrorKind {
    /// Numeric code carried in action acknowledgements. `0` is reserved for
    /// success and never produced by an error.
    pub fn code(self) -> i32 {
        match self {
            ErrorKind::BadParameter => 1,
            ErrorKind::BadRequest => 2,
            ErrorKind::NotFound => 3,
            ErrorKind::NoMemory => 4,
            ErrorKind::NoPermission => 5,
            ErrorKind::Full => 6,
            ErrorKind::IoError => 7,
            ErrorKind::ParseError => 8,
            ErrorKind::TimedOut => 9,
            ErrorKind::Failure => 10,
            ErrorKind::ExecutionError => 11,
            ErrorKind::NotInitialized => 12,
            ErrorKind::FileOpenFailed => 13,
            ErrorKind::OutOfRange => 14,
        }
    }
}

/// An error raised by the agent, pairing a taxonomy kind with an optional
/// human-readable message. The message ends up in logs and in action
/// acknowledgements sent back to the cloud.
#[derive(Debug, Clone)]
pub struct AgentError {
    kind: ErrorKind,
    message: Option<String>,
}

impl AgentError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        AgentError {
            kind,
            message: Some(message.into()),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn message(&self) -> Option<&str> {
        self.message.as_deref()
    }
}

impl fmt::Display for AgentError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.message {
            Some(message) => write!(f, "{}: {}", self.kind, message),
            None => write!(f, "{}", self.kind),
        }
    }
}

impl std::error::Error for AgentError {}

impl From<ErrorKind> for AgentError {
    fn from(kind: ErrorKind) -> Self {
        AgentError {
            kind,
            message: None,
        }
    }
}

impl From<std::io::Error> for AgentError {
    fn from(e: std::io::Error) -> Self {
        let kind = match e.kind() {
            std::io::ErrorKind::NotFound => ErrorKind::FileOpenFailed,
            std::io::ErrorKind::PermissionDenied => ErrorKind::NoPermission,
            std::io::ErrorKind::TimedOut => ErrorKind::TimedOut,
            _ => ErrorKind::IoError,
        };
        AgentError::new(kind, e.to_string())
    }
}

impl From<serde_json::Error> for AgentError {
    fn from(e: serde_json::Error) -> Self {
        AgentError::new(ErrorKind::ParseError, e.to_string())
    }
}

impl From<rumqttc::ClientError> for AgentError {
    fn from(e: rumqttc::ClientError) -> Self {
        AgentError::new(ErrorKind::Failure, e.to_string())
    }
}

impl From<ureq::Error> for AgentError {
    fn from(e: ureq::Error) -> Self {
        match e {
            ureq::Error::Status(code, _) if code == 401 || code == 403 => {
                AgentError::new(ErrorKind::NoPermission, format!("http status {code}"))
            }
            ureq::Error::Status(code, _) if code == 404 => {
                AgentError::new(ErrorKind::NotFound, format!("http status {code}"))
            }
            ureq::Error::Status(code, _) => {
                AgentError::new(ErrorKind::Failure, format!("http status {code}"))
            }
            ureq::Error::Transport(t) => AgentError::new(ErrorKind::IoError, t.to_string()),
        }
    }
}

impl From<anyhow::Error> for AgentError {
    fn from(e: anyhow::Error) -> Self {
        match e.downcast::<AgentError>() {
            Ok(inner) => inner,
            Err(e) => AgentError::new(ErrorKind::Failure, format!("{e:#}")),
        }
    }
}

pub type Result<T> = std::result::Result<T, AgentError>;
