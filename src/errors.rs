use thiserror::Error as ThisError;

#[derive(Debug, ThisError)]
pub enum Error {
    #[error("IO error. {0}")]
    Io(#[from] std::io::Error),
    #[error("Storage error. {0}")]
    Storage(String),
    #[error("Encoding error. {0}")]
    Encoding(String),
    #[error("Size limit exceeded. {0}")]
    Limit(String),
    #[error("Key not found.")]
    NotFound,
}

/// Builds a formatted `Error` variant, e.g. `err!(Storage, "bad page {}", pno)`.
macro_rules! err {
    ($variant:ident, $($arg:tt)*) => {
        crate::errors::Error::$variant(format!($($arg)*))
    };
}
