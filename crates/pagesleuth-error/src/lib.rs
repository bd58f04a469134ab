use std::path::PathBuf;

use thiserror::Error;

/// Primary error type for pagesleuth operations.
///
/// The suite inspects databases that are assumed to be damaged, so most
/// conditions that would be fatal inside a database engine are survivable
/// diagnostics here. Only failures to open the file, read the header, or
/// make sense of the header at all abort a tool; everything else is
/// reported and the walk resumes at the nearest safe boundary.
#[derive(Error, Debug)]
pub enum SleuthError {
    /// File I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Cannot open the database file at all.
    #[error("unable to open database file: '{path}'")]
    CannotOpen { path: PathBuf },

    /// The file does not begin with the SQLite magic string.
    #[error("file is not a database: '{path}'")]
    NotSqlite { path: PathBuf },

    /// The 100-byte header parsed but carries absurd values.
    #[error("invalid database header: {detail}")]
    InvalidHeader { detail: String },

    /// A page read returned fewer bytes than the page size.
    #[error("short read on page {page}: expected {expected} bytes, got {actual}")]
    ShortRead {
        page: u32,
        expected: usize,
        actual: usize,
    },

    /// A page pointer fell outside `1..=max_page`.
    #[error("page {page} out of range 1..={max_page}")]
    PageOutOfRange { page: u32, max_page: u32 },

    /// A structure on a page did not decode: truncated varint, cell offset
    /// outside the page, infeasible local/overflow split, and so on.
    #[error("database disk image is malformed: {detail}")]
    Corrupt { detail: String },

    /// The same page was re-entered on a chain that must not loop.
    #[error("cycle detected at page {page}")]
    CycleDetected { page: u32 },

    /// The b-tree descent exceeded the depth cap.
    #[error("b-tree depth limit exceeded at page {page} (depth {depth})")]
    DepthExceeded { page: u32, depth: usize },

    /// A requested rowid was not present in the table b-tree.
    #[error("rowid {rowid} not found")]
    RowidNotFound { rowid: i64 },

    /// A requested table name was not present in the schema.
    #[error("no such table: {name}")]
    TableNotFound { name: String },

    /// Internal logic error (should never happen).
    #[error("internal error: {0}")]
    Internal(String),
}

impl SleuthError {
    /// Create a corruption error.
    pub fn corrupt(detail: impl Into<String>) -> Self {
        Self::Corrupt {
            detail: detail.into(),
        }
    }

    /// Create an internal error.
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Whether this error must abort the whole tool rather than one walk.
    ///
    /// Matches the failure semantics of the suite: only open/header/read
    /// failures on the file itself are fatal to the process.
    pub const fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::Io(_)
                | Self::CannotOpen { .. }
                | Self::NotSqlite { .. }
                | Self::InvalidHeader { .. }
        )
    }

    /// Process exit code for this error, mirroring SQLite's numeric result
    /// codes where one exists (IOERR=10, CORRUPT=11, CANTOPEN=14, NOTADB=26).
    pub const fn exit_code(&self) -> i32 {
        match self {
            Self::Io(_) | Self::ShortRead { .. } => 10,
            Self::Corrupt { .. }
            | Self::CycleDetected { .. }
            | Self::DepthExceeded { .. }
            | Self::PageOutOfRange { .. } => 11,
            Self::CannotOpen { .. } => 14,
            Self::NotSqlite { .. } | Self::InvalidHeader { .. } => 26,
            Self::RowidNotFound { .. } | Self::TableNotFound { .. } => 1,
            Self::Internal(_) => 2,
        }
    }
}

/// Result type alias using `SleuthError`.
pub type Result<T> = std::result::Result<T, SleuthError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_corrupt() {
        let err = SleuthError::corrupt("trunk leaf count 9999 exceeds maximum");
        assert_eq!(
            err.to_string(),
            "database disk image is malformed: trunk leaf count 9999 exceeds maximum"
        );
    }

    #[test]
    fn display_out_of_range() {
        let err = SleuthError::PageOutOfRange {
            page: 900,
            max_page: 12,
        };
        assert_eq!(err.to_string(), "page 900 out of range 1..=12");
    }

    #[test]
    fn fatal_classification() {
        assert!(
            SleuthError::NotSqlite {
                path: PathBuf::from("x.db")
            }
            .is_fatal()
        );
        assert!(
            SleuthError::InvalidHeader {
                detail: String::new()
            }
            .is_fatal()
        );
        assert!(!SleuthError::corrupt("bad cell").is_fatal());
        assert!(!SleuthError::CycleDetected { page: 3 }.is_fatal());
        assert!(!SleuthError::RowidNotFound { rowid: 42 }.is_fatal());
    }

    #[test]
    fn exit_codes() {
        assert_eq!(
            SleuthError::NotSqlite {
                path: PathBuf::from("x")
            }
            .exit_code(),
            26
        );
        assert_eq!(SleuthError::corrupt("x").exit_code(), 11);
        assert_eq!(SleuthError::RowidNotFound { rowid: 1 }.exit_code(), 1);
        assert_eq!(
            SleuthError::CannotOpen {
                path: PathBuf::from("x")
            }
            .exit_code(),
            14
        );
    }

    #[test]
    fn io_error_from() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file missing");
        let err: SleuthError = io_err.into();
        assert!(matches!(err, SleuthError::Io(_)));
        assert!(err.is_fatal());
    }
}
