//! Error types for docbridge

use thiserror::Error;

/// Result type alias for docbridge operations
pub type Result<T> = std::result::Result<T, BridgeError>;

/// Driver status codes, numbered like the classic C driver's `mongo_error_t`.
///
/// These are the codes surfaced to callers as `ErrorCode` in failure results.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    ConnSuccess,
    ConnNoSocket,
    ConnFail,
    ConnAddrFail,
    ConnNotMaster,
    ConnBadSetName,
    ConnNoPrimary,
    IoError,
    SocketError,
    ReadSizeError,
    CommandFailed,
    WriteError,
    NsInvalid,
    BsonInvalid,
    BsonNotFinished,
    BsonTooLarge,
    WriteConcernInvalid,
    /// Anything outside the catalog; carries the raw code
    Other(i32),
}

impl ErrorCode {
    /// Numeric value reported to callers
    pub fn code(&self) -> i32 {
        match self {
            ErrorCode::ConnSuccess => 0,
            ErrorCode::ConnNoSocket => 1,
            ErrorCode::ConnFail => 2,
            ErrorCode::ConnAddrFail => 3,
            ErrorCode::ConnNotMaster => 4,
            ErrorCode::ConnBadSetName => 5,
            ErrorCode::ConnNoPrimary => 6,
            ErrorCode::IoError => 7,
            ErrorCode::SocketError => 8,
            ErrorCode::ReadSizeError => 9,
            ErrorCode::CommandFailed => 10,
            ErrorCode::WriteError => 11,
            ErrorCode::NsInvalid => 12,
            ErrorCode::BsonInvalid => 13,
            ErrorCode::BsonNotFinished => 14,
            ErrorCode::BsonTooLarge => 15,
            ErrorCode::WriteConcernInvalid => 16,
            ErrorCode::Other(code) => *code,
        }
    }

    /// Inverse of [`ErrorCode::code`]
    pub fn from_code(code: i32) -> Self {
        match code {
            0 => ErrorCode::ConnSuccess,
            1 => ErrorCode::ConnNoSocket,
            2 => ErrorCode::ConnFail,
            3 => ErrorCode::ConnAddrFail,
            4 => ErrorCode::ConnNotMaster,
            5 => ErrorCode::ConnBadSetName,
            6 => ErrorCode::ConnNoPrimary,
            7 => ErrorCode::IoError,
            8 => ErrorCode::SocketError,
            9 => ErrorCode::ReadSizeError,
            10 => ErrorCode::CommandFailed,
            11 => ErrorCode::WriteError,
            12 => ErrorCode::NsInvalid,
            13 => ErrorCode::BsonInvalid,
            14 => ErrorCode::BsonNotFinished,
            15 => ErrorCode::BsonTooLarge,
            16 => ErrorCode::WriteConcernInvalid,
            other => ErrorCode::Other(other),
        }
    }

    /// Static text used when the driver did not supply a message of its own
    pub fn default_message(&self) -> &'static str {
        match self {
            ErrorCode::ConnSuccess => "Connection completed successfully.",
            ErrorCode::ConnNoSocket => "Could not create a socket.",
            ErrorCode::ConnFail => "An error occured while calling connect()",
            ErrorCode::ConnAddrFail => "An error occured while calling getaddrinfo().",
            ErrorCode::ConnNotMaster => "Warning: connected to a non-master node (read-only).",
            ErrorCode::ConnBadSetName => "Given rs name doesn't match this replica set.",
            ErrorCode::ConnNoPrimary => "Can't find primary in replica set. Connection closed.",
            ErrorCode::IoError => "An error occurred while reading or writing on the socket.",
            ErrorCode::SocketError => "Other socket error.",
            ErrorCode::ReadSizeError => "The response is not the expected length.",
            ErrorCode::CommandFailed => "The command returned with 'ok' value of 0.",
            ErrorCode::WriteError => "Write with given write_concern returned an error.",
            ErrorCode::NsInvalid => "The name for the ns (database or collection) is invalid.",
            ErrorCode::BsonInvalid => "BSON not valid for the specified op.",
            ErrorCode::BsonNotFinished => "BSON object has not been finished.",
            ErrorCode::BsonTooLarge => "BSON object exceeds max BSON size.",
            ErrorCode::WriteConcernInvalid => "Supplied write concern object is invalid.",
            ErrorCode::Other(_) => "Unrecognized Mongo Error",
        }
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.code())
    }
}

/// Unified error type for all docbridge operations
#[derive(Error, Debug, Clone, PartialEq)]
pub enum BridgeError {
    /// Missing, empty or malformed input detected while building a task
    #[error("{0}")]
    Argument(String),

    #[error("Connection not established to Mongo Database")]
    NotConnected,

    #[error("Unable to process arguments")]
    Unprocessable,

    /// Failure reported by the database driver
    #[error("{message}")]
    Driver { code: ErrorCode, message: String },

    /// Encode/decode failure, reported with a driver-style code
    #[error("{message}")]
    Format { code: ErrorCode, message: String },

    #[error("Runtime error: {0}")]
    Runtime(String),
}

impl BridgeError {
    /// Build a driver error, falling back to the catalog text for empty messages
    pub fn driver(code: ErrorCode, message: impl Into<String>) -> Self {
        let message = message.into();
        let message = if message.is_empty() {
            code.default_message().to_string()
        } else {
            message
        };
        BridgeError::Driver { code, message }
    }

    pub fn format(code: ErrorCode, message: impl Into<String>) -> Self {
        BridgeError::Format {
            code,
            message: message.into(),
        }
    }

    /// Returns true if this error is raised at the call site instead of being
    /// returned to the caller as a failure result
    pub fn is_fault(&self) -> bool {
        matches!(
            self,
            BridgeError::Argument(_)
                | BridgeError::NotConnected
                | BridgeError::Unprocessable
                | BridgeError::Runtime(_)
        )
    }

    /// Numeric code reported in failure results
    pub fn error_code(&self) -> i32 {
        match self {
            BridgeError::Driver { code, .. } | BridgeError::Format { code, .. } => code.code(),
            _ => -1,
        }
    }
}

// MongoDB-specific error conversions (when mongodb-errors feature is enabled)
#[cfg(feature = "mongodb-errors")]
impl From<mongodb::error::Error> for BridgeError {
    fn from(err: mongodb::error::Error) -> Self {
        use mongodb::error::ErrorKind;

        // Batch writes carry the server's message on the first failed write
        let (code, detail) = match err.kind.as_ref() {
            ErrorKind::InsertMany(failure) => {
                let detail = failure
                    .write_errors
                    .as_ref()
                    .and_then(|errors| errors.iter().min_by_key(|e| e.index))
                    .map(|e| e.message.clone())
                    .or_else(|| failure.write_concern_error.as_ref().map(|e| e.message.clone()));
                (ErrorCode::WriteError, detail)
            }
            ErrorKind::BulkWrite(failure) => {
                let detail = failure
                    .write_errors
                    .iter()
                    .min_by_key(|(index, _)| **index)
                    .map(|(_, e)| e.message.clone())
                    .or_else(|| failure.write_concern_errors.first().map(|e| e.message.clone()));
                (ErrorCode::WriteError, detail)
            }
            other => (code_for_kind(other), None),
        };
        BridgeError::driver(code, detail.unwrap_or_else(|| err.to_string()))
    }
}

#[cfg(feature = "mongodb-errors")]
fn code_for_kind(kind: &mongodb::error::ErrorKind) -> ErrorCode {
    use mongodb::error::ErrorKind;

    match kind {
        ErrorKind::Io(_) => ErrorCode::IoError,
        ErrorKind::DnsResolve { .. } => ErrorCode::ConnAddrFail,
        ErrorKind::ServerSelection { .. } => ErrorCode::ConnFail,
        ErrorKind::Authentication { .. } => ErrorCode::ConnFail,
        ErrorKind::Command(_) => ErrorCode::CommandFailed,
        ErrorKind::Write(_) => ErrorCode::WriteError,
        ErrorKind::InvalidArgument { .. } => ErrorCode::NsInvalid,
        ErrorKind::BsonSerialization(_) | ErrorKind::BsonDeserialization(_) => {
            ErrorCode::BsonInvalid
        }
        _ => ErrorCode::Other(-1),
    }
}

#[cfg(feature = "mongodb-errors")]
impl From<bson::ser::Error> for BridgeError {
    fn from(err: bson::ser::Error) -> Self {
        BridgeError::format(ErrorCode::BsonInvalid, format!("BSON serialization error: {}", err))
    }
}

#[cfg(feature = "mongodb-errors")]
impl From<bson::de::Error> for BridgeError {
    fn from(err: bson::de::Error) -> Self {
        BridgeError::format(ErrorCode::BsonInvalid, format!("BSON deserialization error: {}", err))
    }
}


#[cfg(all(test, feature = "mongodb-errors"))]
mod mongodb_tests {
    use super::*;
    use bson::doc;
    use mongodb::error::{BulkWriteError, Error as MongoError, ErrorKind, InsertManyError};

    #[test]
    fn test_insert_many_duplicate_is_write_error() {
        let failure: InsertManyError = bson::from_document(doc! {
            "writeErrors": [
                { "index": 2, "code": 11000, "errmsg": "E11000 duplicate key error (second)" },
                { "index": 1, "code": 11000, "errmsg": "E11000 duplicate key error (first)" },
            ]
        })
        .unwrap();
        let err: BridgeError = MongoError::from(ErrorKind::InsertMany(failure)).into();
        assert_eq!(err.error_code(), 11);
        assert_eq!(err.to_string(), "E11000 duplicate key error (first)");
        assert!(!err.is_fault());
    }

    #[test]
    fn test_bulk_write_is_write_error() {
        let err: BridgeError = MongoError::from(ErrorKind::BulkWrite(BulkWriteError::default())).into();
        assert_eq!(err.error_code(), 11);
        assert!(!err.to_string().is_empty());
    }

    #[test]
    fn test_other_kinds_keep_their_codes() {
        let reset = std::io::Error::new(std::io::ErrorKind::ConnectionReset, "reset by peer");
        let err: BridgeError = MongoError::from(ErrorKind::Io(std::sync::Arc::new(reset))).into();
        assert_eq!(err.error_code(), 7);
        assert!(err.to_string().contains("reset by peer"));
    }
}
