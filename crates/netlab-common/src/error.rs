//! Device error taxonomy and its wire representation.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors raised by device and registry operations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DeviceError {
    /// No device matches after a forced reconciliation.
    #[error("device not found")]
    NotFound,
    /// The device was removed from the kernel; the reference is stale forever.
    #[error("device with if_index {if_index} was deleted")]
    Deleted { if_index: u32 },
    /// The kernel rejected the requested value.
    #[error("invalid configuration value: {0}")]
    InvalidValue(String),
    /// Any other failure while configuring the device.
    #[error("device configuration failed: {0}")]
    Config(String),
    /// The command channel failed before the operation ran.
    #[error("transport error: {0}")]
    Transport(String),
}

/// Category of a failure reported by the agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RemoteErrorKind {
    NotFound,
    Deleted,
    InvalidValue,
    Config,
    Transport,
    Job,
    Unsupported,
    Other,
}

impl fmt::Display for RemoteErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RemoteErrorKind::NotFound => "not_found",
            RemoteErrorKind::Deleted => "deleted",
            RemoteErrorKind::InvalidValue => "invalid_value",
            RemoteErrorKind::Config => "config",
            RemoteErrorKind::Transport => "transport",
            RemoteErrorKind::Job => "job",
            RemoteErrorKind::Unsupported => "unsupported",
            RemoteErrorKind::Other => "other",
        };
        f.write_str(s)
    }
}

/// An error as it travels over the command channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Error)]
#[error("{kind}: {message}")]
pub struct RemoteError {
    pub kind: RemoteErrorKind,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub if_index: Option<u32>,
}

impl RemoteError {
    pub fn new(kind: RemoteErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            if_index: None,
        }
    }

    pub fn transport(message: impl Into<String>) -> Self {
        Self::new(RemoteErrorKind::Transport, message)
    }

    pub fn other(message: impl Into<String>) -> Self {
        Self::new(RemoteErrorKind::Other, message)
    }

    /// Name the device the error is about.
    pub fn for_device(mut self, if_index: u32) -> Self {
        self.if_index = Some(if_index);
        self
    }

    /// Whether the device `if_index` itself is gone, as opposed to some
    /// other lookup failing.
    pub fn is_gone(&self, if_index: u32) -> bool {
        self.if_index == Some(if_index)
            && matches!(self.kind, RemoteErrorKind::NotFound | RemoteErrorKind::Deleted)
    }
}

impl From<DeviceError> for RemoteError {
    fn from(err: DeviceError) -> Self {
        let message = err.to_string();
        match err {
            DeviceError::NotFound => RemoteError::new(RemoteErrorKind::NotFound, message),
            DeviceError::Deleted { if_index } => RemoteError {
                kind: RemoteErrorKind::Deleted,
                message,
                if_index: Some(if_index),
            },
            DeviceError::InvalidValue(m) => RemoteError::new(RemoteErrorKind::InvalidValue, m),
            DeviceError::Config(m) => RemoteError::new(RemoteErrorKind::Config, m),
            DeviceError::Transport(m) => RemoteError::new(RemoteErrorKind::Transport, m),
        }
    }
}

impl From<RemoteError> for DeviceError {
    fn from(err: RemoteError) -> Self {
        match err.kind {
            RemoteErrorKind::NotFound => DeviceError::NotFound,
            RemoteErrorKind::Deleted => DeviceError::Deleted {
                if_index: err.if_index.unwrap_or_default(),
            },
            RemoteErrorKind::InvalidValue => DeviceError::InvalidValue(err.message),
            RemoteErrorKind::Transport => DeviceError::Transport(err.message),
            _ => DeviceError::Config(err.message),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invalid_value_survives_the_wire() {
        let remote: RemoteError = DeviceError::InvalidValue("Invalid MTU value".into()).into();
        let json = serde_json::to_string(&remote).unwrap();
        let back: RemoteError = serde_json::from_str(&json).unwrap();
        assert_eq!(
            DeviceError::from(back),
            DeviceError::InvalidValue("Invalid MTU value".into())
        );
    }

    #[test]
    fn deleted_keeps_index() {
        let remote: RemoteError = DeviceError::Deleted { if_index: 7 }.into();
        assert_eq!(remote.if_index, Some(7));
        assert_eq!(
            DeviceError::from(remote),
            DeviceError::Deleted { if_index: 7 }
        );
    }

    #[test]
    fn unknown_kinds_become_config_errors() {
        let remote = RemoteError::new(RemoteErrorKind::Job, "job 3 not found");
        assert!(matches!(DeviceError::from(remote), DeviceError::Config(_)));
    }
}
