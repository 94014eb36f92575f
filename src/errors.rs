use thiserror::Error;

#[derive(Debug, Error)]
pub enum UsnError {
    #[error("Read out of bounds: {size} bytes at offset {offset} exceeds buffer of {len} bytes")]
    OutOfBounds {
        offset: usize,
        size: usize,
        len: usize,
    },

    #[error(
        "Truncated record at offset {offset}: needs {declared} bytes, only {available} available"
    )]
    TruncatedRecord {
        offset: u64,
        declared: usize,
        available: usize,
    },

    #[error("Unsupported USN record version {major}.{minor} at offset {offset}")]
    UnsupportedVersion { offset: u64, major: u16, minor: u16 },

    #[error("Invalid record length {length} at offset {offset}")]
    InvalidRecordLength { offset: u64, length: u32 },

    #[error(
        "Invalid file name at offset {offset}: name offset {name_offset}, name length {name_length}"
    )]
    InvalidFileName {
        offset: u64,
        name_offset: u16,
        name_length: u16,
    },

    #[error("Timestamp cannot be represented as a FILETIME")]
    InvalidTimestamp,

    #[cfg(windows)]
    #[error("Access denied: Administrator privileges required. Please run the application as Administrator to access the USN journal.")]
    PermissionError,

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[cfg(windows)]
    #[error("Windows error: {0}")]
    WinApiError(#[from] windows::core::Error),

    #[error("Other error: {0}")]
    OtherError(String),
}

impl UsnError {
    /// Returns true for errors caused by the journal bytes themselves rather than the I/O source.
    pub fn is_corruption(&self) -> bool {
        matches!(
            self,
            UsnError::OutOfBounds { .. }
                | UsnError::TruncatedRecord { .. }
                | UsnError::UnsupportedVersion { .. }
                | UsnError::InvalidRecordLength { .. }
                | UsnError::InvalidFileName { .. }
        )
    }
}
