use thiserror::Error;

use crate::peer::ErrorKind;

#[derive(Debug, Error)]
pub enum TrackerError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("bencode error: {0}")]
    Bencode(#[from] crate::bencode::BencodeError),

    /// The tracker answered with an explicit failure reason.
    #[error("tracker returned failure: {0}")]
    Failure(String),

    #[error("invalid response: {0}")]
    InvalidResponse(String),

    #[error("timeout")]
    Timeout,

    #[error("invalid url: {0}")]
    InvalidUrl(String),

    #[error("unsupported tracker protocol: {0}")]
    UnsupportedProtocol(String),

    #[error("tracker does not support scrape")]
    ScrapeUnsupported,
}

impl TrackerError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            TrackerError::InvalidUrl(_) | TrackerError::UnsupportedProtocol(_) => ErrorKind::Input,
            _ => ErrorKind::Tracker,
        }
    }
}
