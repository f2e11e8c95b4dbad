// Copyright 2025 The xrd authors
//
// SPDX-License-Identifier: MIT

use xrd_protocol::Status;

/// Everything that can go wrong while serving a client. Each kind maps
/// onto one wire status; the message becomes the reply diagnostic.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    /// Client mis-use; recoverable, returned to the caller.
    #[error("{0}")]
    Validation(String),
    /// An operation out of sequence, e.g. begin_frame without wait_frame.
    #[error("{0}")]
    CallOrder(String),
    /// A client, swapchain, or image cap was hit.
    #[error("{0}")]
    ResourceExhausted(String),
    #[error("timed out")]
    Timeout,
    /// Fatal to the session; the context is torn down afterwards.
    #[error("ipc failure: {0}")]
    Ipc(String),
    /// Internal invariant violation; fatal to the session.
    #[error("runtime error: {0}")]
    Runtime(String),
    #[error("device lost")]
    DeviceLost,
}

impl SessionError {
    pub fn validation(msg: impl Into<String>) -> Self {
        SessionError::Validation(msg.into())
    }

    pub fn call_order(msg: impl Into<String>) -> Self {
        SessionError::CallOrder(msg.into())
    }

    pub fn exhausted(msg: impl Into<String>) -> Self {
        SessionError::ResourceExhausted(msg.into())
    }

    pub fn runtime(msg: impl Into<String>) -> Self {
        SessionError::Runtime(msg.into())
    }

    pub fn status(&self) -> Status {
        match self {
            SessionError::Validation(_) => Status::Validation,
            SessionError::CallOrder(_) => Status::CallOrder,
            SessionError::ResourceExhausted(_) => Status::ResourceExhausted,
            SessionError::Timeout => Status::Timeout,
            SessionError::Ipc(_) => Status::IpcFailure,
            SessionError::Runtime(_) => Status::Runtime,
            SessionError::DeviceLost => Status::DeviceLost,
        }
    }

    /// Whether the session survives this error.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            SessionError::Ipc(_) | SessionError::Runtime(_) | SessionError::DeviceLost
        )
    }
}

impl From<std::io::Error> for SessionError {
    fn from(e: std::io::Error) -> Self {
        SessionError::Ipc(e.to_string())
    }
}
