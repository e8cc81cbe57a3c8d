//! Shared error taxonomy (spec.md §7) and the error codes/exit codes callers observe (§6).

use thiserror::Error;

/// Stable error codes surfaced to plugin handlers and CLI callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    /// A facade call was denied by the Permission Policy.
    PermissionDenied,
    /// The resolved handler module does not expose a valid entrypoint.
    InvalidHandler,
    /// Default wrap for any non-typed failure.
    InternalError,
    /// Routing could not resolve a command name.
    CmdNotFound,
}

impl ErrorCode {
    /// Process exit code this error kind maps to (spec.md §6).
    pub fn exit_code(self) -> i32 {
        match self {
            ErrorCode::PermissionDenied => 1,
            ErrorCode::InvalidHandler => 1,
            ErrorCode::InternalError => 1,
            ErrorCode::CmdNotFound => 1,
        }
    }

    /// The `SCREAMING_SNAKE_CASE` string this code serialises to on the wire.
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorCode::PermissionDenied => "PERMISSION_DENIED",
            ErrorCode::InvalidHandler => "INVALID_HANDLER",
            ErrorCode::InternalError => "INTERNAL_ERROR",
            ErrorCode::CmdNotFound => "CMD_NOT_FOUND",
        }
    }
}

/// A denial reason, carried by `Decision::Deny` and surfaced to handlers as `PermissionError`.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct PermissionDenial {
    /// Always `PERMISSION_DENIED`; kept as a field so the JSON envelope is self-describing.
    pub code: &'static str,
    /// Human-readable reason.
    pub reason: String,
    /// Free-form details (path/url/key/command + allowed patterns, depending on facade).
    pub details: serde_json::Value,
}

impl PermissionDenial {
    /// Build a denial with the fixed `PERMISSION_DENIED` code.
    pub fn new(reason: impl Into<String>, details: serde_json::Value) -> Self {
        Self {
            code: "PERMISSION_DENIED",
            reason: reason.into(),
            details,
        }
    }
}

/// The shared error type for everything that is not a facade permission denial.
#[derive(Debug, Error)]
pub enum Error {
    #[error("io: {0}")]
    Io(#[from] std::io::Error),

    #[error("serde: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("config: {0}")]
    Config(String),

    #[error("permission denied: {0}")]
    Permission(#[from] PermissionDenial),

    #[error("invalid handler: {0}")]
    InvalidHandler(String),

    #[error("command not found: {0}")]
    CmdNotFound(String),

    #[error("internal: {0}")]
    Internal(String),
}

impl Error {
    /// Convenience constructor mirroring `kb_core::Error::config` in the teacher's style.
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// The stable error code this failure reports to callers.
    pub fn code(&self) -> ErrorCode {
        match self {
            Error::Permission(_) => ErrorCode::PermissionDenied,
            Error::InvalidHandler(_) => ErrorCode::InvalidHandler,
            Error::CmdNotFound(_) => ErrorCode::CmdNotFound,
            Error::Io(_) | Error::Serde(_) | Error::Config(_) | Error::Internal(_) => {
                ErrorCode::InternalError
            }
        }
    }
}

impl From<toml::de::Error> for Error {
    fn from(e: toml::de::Error) -> Self {
        Error::Config(e.to_string())
    }
}

/// Crate-wide result alias.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// The envelope a host sends back over the `error` control message (spec.md §4.4/§6).
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct ErrorEnvelope {
    pub name: String,
    pub message: String,
    pub code: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stack: Option<String>,
}

impl ErrorEnvelope {
    /// Wrap an arbitrary error with the default `INTERNAL_ERROR` code (spec.md §4.6 step 11).
    pub fn wrap(err: &Error) -> Self {
        match err {
            Error::Permission(denial) => ErrorEnvelope {
                name: "PermissionError".to_string(),
                message: denial.reason.clone(),
                code: "PERMISSION_DENIED".to_string(),
                details: Some(denial.details.clone()),
                stack: None,
            },
            other => ErrorEnvelope {
                name: "Error".to_string(),
                message: other.to_string(),
                code: other.code().as_str().to_string(),
                details: None,
                stack: None,
            },
        }
    }
}
