use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("ledger {} unavailable: {}", .0.display(), .1)]
    LedgerUnavailable(PathBuf, String),
    #[error("format error: {0}")]
    Format(String),
    #[error("ledger inconsistency: {0}")]
    LedgerInconsistency(String),
    #[error("io error")]
    Io(#[source] std::io::Error),
}

impl From<std::io::Error> for Error {
    fn from(value: std::io::Error) -> Self {
        Self::Io(value)
    }
}

impl From<bigdecimal::ParseBigDecimalError> for Error {
    fn from(value: bigdecimal::ParseBigDecimalError) -> Self {
        Self::Format(value.to_string())
    }
}
