use std::{
    error::Error as StdError,
    fmt::{self, Display},
    io,
};

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug)]
pub enum Error {
    Io(io::Error),
    FileAccess(String),
    WrongObjectType(String),
    DataCorrupted(String),
    InvalidState(String),
    BadArgument(String),
    FileNotOpen(String),
    EntryNotFound(String),
    UniquenessViolation(String),
    VerifyAborted(String),
    Unexpected(String),
    NotSupported(String),
    Cancelled,
    OutOfMemory,
}

impl From<io::Error> for Error {
    fn from(ioe: io::Error) -> Self {
        Error::Io(ioe)
    }
}

impl StdError for Error {}

impl Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> std::result::Result<(), fmt::Error> {
        use self::Error::*;

        match *self {
            FileAccess(ref e) => write!(f, "File access error: {}", e),
            WrongObjectType(ref e) => write!(f, "Wrong object type: {}", e),
            DataCorrupted(ref e) => write!(f, "Data corrupted: {}", e),
            InvalidState(ref e) => write!(f, "Invalid state: {}", e),
            BadArgument(ref e) => write!(f, "Bad argument: {}", e),
            FileNotOpen(ref e) => write!(f, "File not open: {}", e),
            EntryNotFound(ref e) => write!(f, "Entry not found: {}", e),
            UniquenessViolation(ref e) => write!(f, "Uniqueness violation: {}", e),
            VerifyAborted(ref e) => write!(f, "Verify aborted: {}", e),
            Unexpected(ref e) => write!(f, "Unexpected: {}", e),
            NotSupported(ref e) => write!(f, "Not supported: {}", e),
            Cancelled => write!(f, "Cancelled."),
            Io(ref e) => write!(f, "IO error: {}", e),
            OutOfMemory => write!(f, "Out of memory."),
        }
    }
}
