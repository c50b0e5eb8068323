use std::io;

#[derive(thiserror::Error, Debug)]
pub enum CacheError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("cache entry '{0}' not found")]
    NotFound(String),
    #[error("'{0}' resolves outside the cache root")]
    PathEscape(String),
    #[error("invalid cache entry name '{0}'")]
    InvalidName(String),
}

pub type Result<T> = std::result::Result<T, CacheError>;
