use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced by the control surface.
///
/// Nothing on the allocation hot path returns an `Error`: proxies report
/// tracking misses through outcome enums and always complete the real call.
#[derive(Error, Debug)]
pub enum Error {
    #[error("tracker not initialized")]
    NotInitialized,

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("failed to resolve real implementation of `{0}`")]
    SymbolResolution(&'static str),

    #[error("hook limit reached: {installed} stubs installed, limit is {limit}")]
    HookLimit { installed: usize, limit: usize },

    #[error("failed to hook `{symbol}` in {library}: {reason}")]
    Install {
        library: String,
        symbol: &'static str,
        reason: String,
    },

    #[error("out of memory while building report")]
    OutOfMemory,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("configuration error: {0}")]
    Config(String),
}

impl Error {
    /// Negative status code handed across the C ABI. Zero means success.
    pub fn error_code(&self) -> i32 {
        match self {
            Error::NotInitialized => -1,
            Error::InvalidArgument(_) => -2,
            Error::SymbolResolution(_) => -3,
            Error::HookLimit { .. } => -4,
            Error::Install { .. } => -5,
            Error::OutOfMemory => -6,
            Error::Io(_) => -7,
            Error::Json(_) => -8,
            Error::Config(_) => -9,
        }
    }
}
