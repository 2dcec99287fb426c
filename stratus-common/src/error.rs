use std::time::Duration;

/// Closed error taxonomy shared by every orchestrator component.
#[derive(Debug, thiserror::Error)]
pub enum CpiError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("timed out after {waited:?} waiting for {condition}")]
    Timeout { condition: String, waited: Duration },

    #[error("store busy or locked during {0}")]
    StoreContention(String),

    #[error("store failure during {0}")]
    StoreFailure(String),

    #[error("provider rejected request: {0}")]
    ProviderRejected(String),

    #[error("remote command `{command}` failed: {message}")]
    RemoteExecution { command: String, message: String },

    #[error("invalid networks: {0}")]
    InvalidNetworks(String),

    #[error("unexpected device listing at line {line}: {reason}")]
    DeviceList { line: usize, reason: String },

    #[error("invalid configuration: {0}")]
    Configuration(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    NotFound,
    Timeout,
    StoreContention,
    StoreFailure,
    ProviderRejected,
    RemoteExecution,
    InvalidNetworks,
    DeviceList,
    Configuration,
}

impl CpiError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            CpiError::NotFound(_) => ErrorKind::NotFound,
            CpiError::Timeout { .. } => ErrorKind::Timeout,
            CpiError::StoreContention(_) => ErrorKind::StoreContention,
            CpiError::StoreFailure(_) => ErrorKind::StoreFailure,
            CpiError::ProviderRejected(_) => ErrorKind::ProviderRejected,
            CpiError::RemoteExecution { .. } => ErrorKind::RemoteExecution,
            CpiError::InvalidNetworks(_) => ErrorKind::InvalidNetworks,
            CpiError::DeviceList { .. } => ErrorKind::DeviceList,
            CpiError::Configuration(_) => ErrorKind::Configuration,
        }
    }
}

/// Outermost taxonomy entry found in an error chain.
pub fn error_kind(err: &anyhow::Error) -> Option<ErrorKind> {
    err.downcast_ref::<CpiError>()
        .or_else(|| err.chain().find_map(|e| e.downcast_ref::<CpiError>()))
        .map(CpiError::kind)
}
