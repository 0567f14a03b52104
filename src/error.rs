use thiserror::Error;

/// Failure while querying the platform adapter. The coordinator maps any of
/// these to `AdapterState::NotSupported`, which is terminal for the session.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AdapterError {
    #[error("adapter query failed: {0}")]
    Query(String),
}

/// Why a connect attempt did not produce a usable link. All variants are
/// recoverable: the coordinator returns to `Idle` and the operator may retry.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConnectError {
    #[error("radio adapter is not available")]
    NoAdapter,
    #[error("device `{0}` is not in the paired-device registry")]
    DeviceNotFound(String),
    #[error("connect attempt timed out")]
    Timeout,
    #[error("remote device refused the connection")]
    Refused,
}

/// Failure reported by the link channel itself.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LinkError {
    #[error("dial timed out")]
    Timeout,
    #[error("dial refused")]
    Refused,
    #[error("link i/o failed: {0}")]
    Io(String),
}

/// Usage errors on the command surface. Returned to the caller and logged,
/// never published as a `Fault`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum CommandError {
    #[error("coordinator is not attached")]
    Detached,
    #[error("command requires an open link")]
    InvalidState,
}

/// A user-visible failure, delivered on the coordinator's event channel
/// alongside state changes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Fault {
    Connect(ConnectError),
    Link(LinkError),
}

impl LinkError {
    /// Collapse a dial-phase failure into the operator-facing taxonomy.
    pub(crate) fn into_connect_error(self) -> ConnectError {
        match self {
            LinkError::Timeout => ConnectError::Timeout,
            LinkError::Refused | LinkError::Io(_) => ConnectError::Refused,
        }
    }
}
