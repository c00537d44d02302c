use crate::backend::StatusCode;

/// Result alias that carries the custom [`PlayerError`] type.
pub type Result<T> = std::result::Result<T, PlayerError>;

/// Common error type for the engine.
///
/// Failures reported by a native backend are normally not returned from
/// command methods. They travel through the session's event queue as
/// [`crate::PlayerEvent::ErrorRaised`] and carry the value of
/// [`PlayerError::code`]. Only orchestration failures (a disposed or halted
/// session) and backend initialisation are reported synchronously.
#[derive(Debug, thiserror::Error)]
pub enum PlayerError {
    /// The native backend refused to create a session.
    #[error("backend initialisation failed with status {code}")]
    BackendInitFailure { code: i32 },
    /// A native command returned a non-zero status.
    #[error("backend command failed with status {code}")]
    BackendCommandFailure { code: i32 },
    /// The backend variant does not implement the requested operation.
    #[error("operation `{0}` is not supported by this backend")]
    UnsupportedOperation(&'static str),
    /// The native rendering surface could not be resolved.
    #[error("native window handle could not be resolved")]
    InvalidWindowHandle,
    /// The session has been disposed.
    #[error("playback session has already been disposed")]
    AlreadyDisposed,
    /// The backend reported `Halted`; only `dispose()` is meaningful now.
    #[error("playback session has halted")]
    SessionHalted,
    #[error("invalid configuration: {0}")]
    Config(#[from] serde_json::Error),
    #[error("{0}")]
    Io(#[from] std::io::Error),
    #[error("{0}")]
    Message(String),
}

impl PlayerError {
    /// Creates a new error that simply wraps the provided message.
    pub fn msg<T: Into<String>>(msg: T) -> Self {
        Self::Message(msg.into())
    }

    /// Maps a native status into the error taxonomy.
    ///
    /// `StatusCode::OK` is not an error; callers check
    /// [`StatusCode::is_ok`] first and the mapping falls back to a generic
    /// command failure if they do not.
    pub fn from_status(status: StatusCode) -> Self {
        match status {
            StatusCode::UNSUPPORTED => Self::UnsupportedOperation("native"),
            StatusCode::INVALID_WINDOW => Self::InvalidWindowHandle,
            StatusCode::DISPOSED => Self::AlreadyDisposed,
            other => Self::BackendCommandFailure { code: other.0 },
        }
    }

    /// Maps a status returned by the native `init` entry point.
    pub fn from_init_status(status: StatusCode) -> Self {
        match status {
            StatusCode::INVALID_WINDOW => Self::InvalidWindowHandle,
            other => Self::BackendInitFailure { code: other.0 },
        }
    }

    /// Integer code carried by `ErrorRaised` events for this error.
    pub fn code(&self) -> i32 {
        match self {
            Self::BackendInitFailure { code } | Self::BackendCommandFailure { code } => *code,
            Self::UnsupportedOperation(_) => StatusCode::UNSUPPORTED.0,
            Self::InvalidWindowHandle => StatusCode::INVALID_WINDOW.0,
            Self::AlreadyDisposed => StatusCode::DISPOSED.0,
            Self::SessionHalted => StatusCode::HALTED.0,
            Self::Config(_) | Self::Io(_) | Self::Message(_) => StatusCode::INTERNAL.0,
        }
    }
}

impl From<&str> for PlayerError {
    fn from(value: &str) -> Self {
        Self::msg(value)
    }
}

impl From<String> for PlayerError {
    fn from(value: String) -> Self {
        Self::Message(value)
    }
}
