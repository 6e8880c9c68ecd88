//! Error types shared across the codec, client and server.

use thiserror::Error;

/// Error type for shared-index operations.
#[derive(Error, Debug)]
pub enum Error {
    /// A binary ISO 2709 record could not be parsed.
    #[error("malformed binary record: {0}")]
    MalformedBinaryRecord(String),

    /// A MARC-XML collection wrapped more than one record element.
    #[error("can not handle multiple records")]
    MultipleRecords,

    /// Neither a record element nor a collection wrapping one was found.
    #[error("no record element found")]
    NoRecordFound,

    /// A field in the canonical JSON form had a missing or non-string tag.
    #[error("invalid field tag: {0}")]
    InvalidFieldTag(String),

    /// Input file has a suffix the client does not handle.
    #[error("unsupported file: {0}")]
    UnsupportedFile(String),

    /// Match-key configuration or extraction failed.
    #[error("match key: {0}")]
    MatchKey(String),

    /// Bad command line or request argument.
    #[error("{0}")]
    Argument(String),

    /// An inventory transform step failed.
    #[error("transform: {0}")]
    Transform(String),

    /// Malformed XML input.
    #[error("xml: {0}")]
    Xml(String),

    /// Client-side protocol failure (unexpected status, incomplete job).
    #[error("{0}")]
    Client(String),

    #[error("io: {0}")]
    Io(#[from] std::io::Error),

    #[error("storage: {0}")]
    Storage(#[from] sqlx::Error),

    #[error("http: {0}")]
    Http(#[from] reqwest::Error),
}

impl From<quick_xml::Error> for Error {
    fn from(e: quick_xml::Error) -> Self {
        Error::Xml(e.to_string())
    }
}

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;
