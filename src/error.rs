//! Error types for the engine control plane.
//!
//! Every fallible operation returns [`Result`]. The numeric [`ErrorCode`] only
//! exists for the C ABI, where handle-returning calls report failure as the
//! negated code in the same return channel as the handle.

use thiserror::Error;

use crate::property::Property;

/// Error type for engine operations.
#[derive(Error, Debug)]
pub enum Error {
    #[error("Invalid handle")]
    InvalidHandle,

    #[error("Wrong object type for operation")]
    WrongType,

    #[error("Index out of range")]
    IndexRange,

    #[error("Object refused the operation")]
    Refused,

    #[error("Object not found")]
    NotFound,

    #[error("Object has no name")]
    NoName,

    #[error("Export name '{0}' already in use")]
    NameExists(String),

    #[error("Voice belongs to another engine instance")]
    ForeignVoice,

    #[error("Wrong number of arguments: expected at most {expected}, got {got}")]
    ArgCount { expected: usize, got: usize },

    #[error("Command queue full")]
    QueueFull,

    #[error("Object table full")]
    TableFull,

    #[error("Property {0:?} is read-only")]
    ReadOnly(Property),

    #[error("Failed to open driver: {0}")]
    DriverOpen(String),

    #[error("Not supported: {0}")]
    NotSupported(&'static str),

    #[error("Script error: {0}")]
    Script(String),

    #[error("Engine instance is closed")]
    Closed,

    #[error("Invalid config: {0}")]
    InvalidConfig(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias.
pub type Result<T> = std::result::Result<T, Error>;

/// Stable numeric error codes for the C ABI.
#[repr(i32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    Ok = 0,
    InvalidHandle = 1,
    WrongType = 2,
    IndexRange = 3,
    Refused = 4,
    NotFound = 5,
    NoName = 6,
    NameExists = 7,
    ForeignVoice = 8,
    ArgCount = 9,
    QueueFull = 10,
    TableFull = 11,
    ReadOnly = 12,
    DriverOpen = 13,
    NotSupported = 14,
    Script = 15,
    Closed = 16,
    InvalidConfig = 17,
    Io = 18,
}

impl Error {
    pub fn code(&self) -> ErrorCode {
        match self {
            Error::InvalidHandle => ErrorCode::InvalidHandle,
            Error::WrongType => ErrorCode::WrongType,
            Error::IndexRange => ErrorCode::IndexRange,
            Error::Refused => ErrorCode::Refused,
            Error::NotFound => ErrorCode::NotFound,
            Error::NoName => ErrorCode::NoName,
            Error::NameExists(_) => ErrorCode::NameExists,
            Error::ForeignVoice => ErrorCode::ForeignVoice,
            Error::ArgCount { .. } => ErrorCode::ArgCount,
            Error::QueueFull => ErrorCode::QueueFull,
            Error::TableFull => ErrorCode::TableFull,
            Error::ReadOnly(_) => ErrorCode::ReadOnly,
            Error::DriverOpen(_) => ErrorCode::DriverOpen,
            Error::NotSupported(_) => ErrorCode::NotSupported,
            Error::Script(_) => ErrorCode::Script,
            Error::Closed => ErrorCode::Closed,
            Error::InvalidConfig(_) => ErrorCode::InvalidConfig,
            Error::Io(_) => ErrorCode::Io,
        }
    }
}

impl ErrorCode {
    /// Short description, as returned by the C ABI.
    pub fn description(self) -> &'static str {
        match self {
            ErrorCode::Ok => "OK",
            ErrorCode::InvalidHandle => "invalid handle",
            ErrorCode::WrongType => "wrong object type",
            ErrorCode::IndexRange => "index out of range",
            ErrorCode::Refused => "refused",
            ErrorCode::NotFound => "not found",
            ErrorCode::NoName => "object has no name",
            ErrorCode::NameExists => "name already exists",
            ErrorCode::ForeignVoice => "voice belongs to another instance",
            ErrorCode::ArgCount => "wrong number of arguments",
            ErrorCode::QueueFull => "command queue full",
            ErrorCode::TableFull => "object table full",
            ErrorCode::ReadOnly => "read-only property",
            ErrorCode::DriverOpen => "driver open failed",
            ErrorCode::NotSupported => "not supported",
            ErrorCode::Script => "script error",
            ErrorCode::Closed => "instance closed",
            ErrorCode::InvalidConfig => "invalid configuration",
            ErrorCode::Io => "I/O error",
        }
    }

    pub fn from_i32(code: i32) -> Option<ErrorCode> {
        use ErrorCode::*;
        const ALL: [ErrorCode; 19] = [
            Ok,
            InvalidHandle,
            WrongType,
            IndexRange,
            Refused,
            NotFound,
            NoName,
            NameExists,
            ForeignVoice,
            ArgCount,
            QueueFull,
            TableFull,
            ReadOnly,
            DriverOpen,
            NotSupported,
            Script,
            Closed,
            InvalidConfig,
            Io,
        ];
        ALL.into_iter().find(|c| *c as i32 == code)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codes_round_trip_through_i32() {
        for code in [ErrorCode::InvalidHandle, ErrorCode::Refused, ErrorCode::Io] {
            assert_eq!(ErrorCode::from_i32(code as i32), Some(code));
        }
        assert_eq!(ErrorCode::from_i32(-1), None);
    }

    #[test]
    fn test_error_maps_to_code() {
        assert_eq!(Error::NameExists("x".into()).code(), ErrorCode::NameExists);
        assert_eq!(
            Error::ArgCount {
                expected: 1,
                got: 2
            }
            .code(),
            ErrorCode::ArgCount
        );
    }
}
