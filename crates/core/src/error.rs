/// Result alias that carries the custom [`SoundTileError`] type.
pub type Result<T> = std::result::Result<T, SoundTileError>;

/// Common error type for the core crate.
#[derive(Debug, thiserror::Error)]
pub enum SoundTileError {
    /// A song references a pattern, instrument or value that cannot be
    /// resolved. Fatal for the song load: callers fall back to an empty table.
    #[error("corrupt song: invalid `{field}` ({detail})")]
    CorruptSong { field: &'static str, detail: String },
    /// Song JSON that does not match the expected export shape.
    #[error("invalid song data: {0}")]
    InvalidSong(String),
    /// The render worker stopped answering or panicked.
    #[error("render worker failure: {0}")]
    Worker(String),
    /// Shared state guarded by a mutex was poisoned by a panicking thread.
    #[error("{0} has been poisoned")]
    Poisoned(&'static str),
    /// Caller passed data the subsystem cannot work with.
    #[error("invalid input: {0}")]
    InvalidInput(&'static str),
    /// Free-form message for conditions without a dedicated variant.
    #[error("{0}")]
    Message(String),
    /// Spectrum transform rejected its buffers.
    #[error("{0}")]
    Fft(#[from] realfft::FftError),
    /// Wrapper around JSON (de)serialisation errors.
    #[error("{0}")]
    Json(#[from] serde_json::Error),
    /// Wrapper around standard IO errors.
    #[error("{0}")]
    Io(#[from] std::io::Error),
}

impl SoundTileError {
    /// Creates a new error that simply wraps the provided message.
    pub fn msg<T: Into<String>>(msg: T) -> Self {
        Self::Message(msg.into())
    }

    pub fn corrupt(field: &'static str, detail: impl Into<String>) -> Self {
        Self::CorruptSong {
            field,
            detail: detail.into(),
        }
    }

    pub fn is_corrupt_song(&self) -> bool {
        matches!(self, Self::CorruptSong { .. })
    }
}

impl From<&str> for SoundTileError {
    fn from(value: &str) -> Self {
        Self::msg(value)
    }
}

impl From<String> for SoundTileError {
    fn from(value: String) -> Self {
        Self::Message(value)
    }
}
