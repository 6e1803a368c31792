use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// Error kinds of the proxy and inspection services. Each variant maps to
/// one HTTP status in the inspection API; the proxy path closes the
/// connection on any of them.
#[derive(Error, Debug, Clone)]
pub enum Error {
    /// Malformed HTTP message.
    #[error("decode error: {0}")]
    Decode(String),

    /// TCP or TLS connect to the origin failed.
    #[error("dial error: {0}")]
    Dial(String),

    /// TLS handshake failed (either side).
    #[error("handshake error: {0}")]
    Handshake(String),

    /// Leaf certificate minting failed.
    #[error("mint error: {0}")]
    Mint(String),

    /// Persistence failed.
    #[error("store error: {0}")]
    Store(String),

    /// A protocol step exceeded its deadline.
    #[error("timeout: {0}")]
    Timeout(String),

    /// Unknown record ID.
    #[error("not found: {0}")]
    NotFound(String),

    /// The origin returned nothing parseable.
    #[error("upstream error: {0}")]
    Upstream(String),
}

impl Error {
    pub fn decode(err: impl std::fmt::Display) -> Self {
        Error::Decode(err.to_string())
    }

    pub fn dial(err: impl std::fmt::Display) -> Self {
        Error::Dial(err.to_string())
    }

    pub fn handshake(err: impl std::fmt::Display) -> Self {
        Error::Handshake(err.to_string())
    }

    pub fn mint(err: impl std::fmt::Display) -> Self {
        Error::Mint(err.to_string())
    }

    pub fn store(err: impl std::fmt::Display) -> Self {
        Error::Store(err.to_string())
    }

    pub fn timeout(step: &str) -> Self {
        Error::Timeout(step.to_string())
    }

    pub fn not_found(id: &str) -> Self {
        Error::NotFound(id.to_string())
    }

    pub fn upstream(err: impl std::fmt::Display) -> Self {
        Error::Upstream(err.to_string())
    }
}
