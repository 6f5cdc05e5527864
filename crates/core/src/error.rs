/// Result alias that carries the custom [`DomeError`] type.
pub type Result<T> = std::result::Result<T, DomeError>;

/// Common error type for the core crate.
///
/// None of these are fatal: the orchestration surface reports them as a
/// `false` return plus a log line and the main loop keeps ticking.
#[derive(Debug, thiserror::Error)]
pub enum DomeError {
    /// No free timer slot, or a duplicate timer identity.
    #[error("resource exhausted: {0}")]
    ResourceExhausted(#[from] TimerError),
    /// Player or decoder construction failed.
    #[error("allocation failed: {0}")]
    AllocationFailure(String),
    /// Wrapper around standard IO errors (source open, stream read).
    #[error("{0}")]
    Io(#[from] std::io::Error),
    /// The remote speech service answered the pre-flight probe with something
    /// other than playable audio.
    #[error("remote source rejected: {0}")]
    Remote(String),
    /// The byte source could not be decoded.
    #[error("decode failed: {0}")]
    Decode(#[from] hound::Error),
    /// The output device kept refusing samples past the retry budget.
    #[error("output buffer stalled after {attempts} attempts")]
    BufferStall { attempts: u8 },
    /// The request conflicts with the source exclusivity rules.
    #[error("request rejected: {0}")]
    PolicyRejected(&'static str),
    /// The output device has not finished initialising.
    #[error("output device is not ready")]
    DeviceNotReady,
    /// Configuration could not be parsed.
    #[error("invalid configuration: {0}")]
    Config(#[from] serde_json::Error),
    /// A request URL could not be assembled.
    #[error("invalid url: {0}")]
    Url(#[from] url::ParseError),
    /// A caller supplied an unusable value.
    #[error("invalid input: {0}")]
    InvalidInput(&'static str),
    /// Free-form diagnostic.
    #[error("{0}")]
    Message(String),
}

impl DomeError {
    /// Creates a new error that simply wraps the provided message.
    pub fn msg<T: Into<String>>(msg: T) -> Self {
        Self::Message(msg.into())
    }
}

impl From<&str> for DomeError {
    fn from(value: &str) -> Self {
        Self::msg(value)
    }
}

impl From<String> for DomeError {
    fn from(value: String) -> Self {
        Self::Message(value)
    }
}

/// Failure modes of the timer pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum TimerError {
    #[error("timer identity is already registered")]
    Duplicate,
    #[error("no free timer slot (capacity {capacity})")]
    PoolExhausted { capacity: usize },
}
