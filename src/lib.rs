//! # usnjrnl-rs
//!
//! A Rust library for parsing the NTFS USN change journal (`$Extend\$UsnJrnl:$J`).
//!
//! The journal is a stream of variable-length `USN_RECORD_V2` / `USN_RECORD_V3` entries. This
//! crate decodes them from raw bytes with bounds-checked reads, so it works on extracted
//! journal files and disk images on any platform.
//!
//! ## Features
//! - Decode single records, or iterate a journal held in memory or read from any `Read` source
//! - Decoding stops at the first corrupt record and reports it; nothing is skipped silently
//! - Optional skipping of the sparse, zero-filled regions of an extracted `$J` stream
//! - Rebuild directory paths from the journal itself
//! - On Windows, read the live journal of a mounted volume
//!
//! ## Example: Parse an extracted journal
//! ```rust,no_run
//! use usnjrnl_rs::journal::{JournalOptions, JournalReader};
//!
//! let options = JournalOptions {
//!     skip_padding: true,
//!     ..Default::default()
//! };
//! let reader = JournalReader::open_with_options("$UsnJrnl$J", options)?;
//! for result in reader.take(10) {
//!     match result {
//!         Ok(record) => println!("{} {} {}", record.usn, record.reason, record.file_name),
//!         Err(e) => eprintln!("Error reading record: {}", e),
//!     }
//! }
//! # Ok::<(), usnjrnl_rs::UsnError>(())
//! ```
//!
//! ## Example: Decode a buffer
//! ```rust
//! use usnjrnl_rs::journal::UsnJournal;
//!
//! let buffer: Vec<u8> = Vec::new();
//! let journal = UsnJournal::new(&buffer);
//! assert_eq!(journal.iter().count(), 0);
//! ```
//!
//! ## License
//! MIT License.

pub mod errors;
pub mod journal;
pub mod path;
pub mod reader;
pub mod reason;
pub mod record;
pub mod time;
#[cfg(windows)]
pub mod volume;

// Re-export commonly used types
pub use errors::UsnError;
pub use record::{FileReference, UsnRecord, decode};

/// A convenient type alias for Results with UsnError.
pub type UsnResult<T> = std::result::Result<T, UsnError>;


pub type Usn = i64;

pub(crate) const DEFAULT_BUFFER_SIZE: usize = 64 * 1024; // 64KB

/// Journal page size; records never straddle a page and the tail of a page is zero padding.
pub const DEFAULT_BLOCK_SIZE: usize = 4 * 1024; // 4KB
