use std::sync::{Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard};

use thiserror::Error;

/// Status class of an [`ExecError`], independent of its message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    InvalidArgument,
    ResourceExhausted,
    FailedPrecondition,
    Internal,
    NotFound,
    DeadlineExceeded,
    Unavailable,
}

/// Error surfaced by every fallible operation of the execution layer.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ExecError {
    /// The caller violated a buffer-ownership contract or passed a malformed argument.
    #[error("invalid argument: {message}")]
    InvalidArgument { message: String },
    /// A device allocation could not be satisfied.
    #[error("resource exhausted: {message}")]
    ResourceExhausted { message: String },
    /// The executable or the platform is not in a state that allows the call.
    #[error("failed precondition: {message}")]
    FailedPrecondition { message: String },
    /// An invariant broke; indicates a compiler or runtime bug rather than user error.
    #[error("internal: {message}")]
    Internal { message: String },
    #[error("not found: {message}")]
    NotFound { message: String },
    /// Forwarded unmodified from the stream or collective layer.
    #[error("deadline exceeded: {message}")]
    DeadlineExceeded { message: String },
    /// Forwarded unmodified from the stream or device driver.
    #[error("unavailable: {message}")]
    Unavailable { message: String },
}

pub type ExecResult<T> = Result<T, ExecError>;

impl ExecError {
    pub fn invalid_argument(message: impl Into<String>) -> Self {
        ExecError::InvalidArgument {
            message: message.into(),
        }
    }

    pub fn resource_exhausted(message: impl Into<String>) -> Self {
        ExecError::ResourceExhausted {
            message: message.into(),
        }
    }

    /// Pairs an allocator failure with the verbose buffer-assignment description.
    pub fn resource_exhausted_with_dump(status: &ExecError, dump: &str) -> Self {
        ExecError::ResourceExhausted {
            message: format!("{}\n{}\n", status.message(), dump),
        }
    }

    pub fn failed_precondition(message: impl Into<String>) -> Self {
        ExecError::FailedPrecondition {
            message: message.into(),
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        ExecError::Internal {
            message: message.into(),
        }
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        ExecError::NotFound {
            message: message.into(),
        }
    }

    pub fn deadline_exceeded(message: impl Into<String>) -> Self {
        ExecError::DeadlineExceeded {
            message: message.into(),
        }
    }

    pub fn unavailable(message: impl Into<String>) -> Self {
        ExecError::Unavailable {
            message: message.into(),
        }
    }

    /// Prefixes the message with `context`. Deadline and stream errors keep their class;
    /// anything else becomes `Internal`.
    pub fn with_context(self, context: &str) -> Self {
        let message = format!("{context}: {}", self.message());
        match self {
            ExecError::DeadlineExceeded { .. } => ExecError::DeadlineExceeded { message },
            ExecError::Unavailable { .. } => ExecError::Unavailable { message },
            _ => ExecError::Internal {
                message: format!("{context}: {self}"),
            },
        }
    }

    pub fn code(&self) -> ErrorCode {
        match self {
            ExecError::InvalidArgument { .. } => ErrorCode::InvalidArgument,
            ExecError::ResourceExhausted { .. } => ErrorCode::ResourceExhausted,
            ExecError::FailedPrecondition { .. } => ErrorCode::FailedPrecondition,
            ExecError::Internal { .. } => ErrorCode::Internal,
            ExecError::NotFound { .. } => ErrorCode::NotFound,
            ExecError::DeadlineExceeded { .. } => ErrorCode::DeadlineExceeded,
            ExecError::Unavailable { .. } => ErrorCode::Unavailable,
        }
    }

    pub fn message(&self) -> &str {
        match self {
            ExecError::InvalidArgument { message }
            | ExecError::ResourceExhausted { message }
            | ExecError::FailedPrecondition { message }
            | ExecError::Internal { message }
            | ExecError::NotFound { message }
            | ExecError::DeadlineExceeded { message }
            | ExecError::Unavailable { message } => message,
        }
    }
}

pub(crate) fn lock_named<'a, T>(mutex: &'a Mutex<T>, name: &str) -> ExecResult<MutexGuard<'a, T>> {
    mutex
        .lock()
        .map_err(|_| ExecError::internal(format!("{name} mutex poisoned")))
}

pub(crate) fn read_named<'a, T>(
    lock: &'a RwLock<T>,
    name: &str,
) -> ExecResult<RwLockReadGuard<'a, T>> {
    lock.read()
        .map_err(|_| ExecError::internal(format!("{name} lock poisoned")))
}

pub(crate) fn write_named<'a, T>(
    lock: &'a RwLock<T>,
    name: &str,
) -> ExecResult<RwLockWriteGuard<'a, T>> {
    lock.write()
        .map_err(|_| ExecError::internal(format!("{name} lock poisoned")))
}
