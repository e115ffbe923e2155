use std::io;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, BrumaError>;

#[derive(Debug, Error)]
pub enum BrumaError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),
    #[error("resource exhausted: {0}")]
    ResourceExhausted(&'static str),
    #[error("kernel i/o failure: errno {0}")]
    IoFailure(i32),
    #[error("corruption detected: {0}")]
    Corruption(&'static str),
}
