use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ClientError {
    #[error("session not application-authorized yet")]
    NotReady,

    #[error("account not authorized yet")]
    AccountNotReady,

    #[error("transport disconnected")]
    Disconnected,

    #[error("request cancelled")]
    Cancelled,

    #[error("authorization rejected: {0}")]
    Auth(String),

    #[error("broker error {code}: {description}")]
    Broker { code: String, description: String },

    #[error("transport error: {0}")]
    Transport(String),

    #[error("volume conversion failed: {0}")]
    VolumeConversion(String),
}

impl ClientError {
    /// True for failures the session manager recovers from by reconnecting.
    pub fn is_transient(&self) -> bool {
        matches!(self, ClientError::Disconnected | ClientError::Transport(_))
    }
}
