//! Bit sets carried by USN records: change reasons, source information and file attributes.

use bitflags::bitflags;
use std::fmt;

bitflags! {
    /// Why a record was written (`USN_REASON_*`). Several reasons accumulate on
    /// one file until the handle is closed, so the bits are not exclusive.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct UsnReason: u32 {
        const DATA_OVERWRITE = 0x0000_0001;
        const DATA_EXTEND = 0x0000_0002;
        const DATA_TRUNCATION = 0x0000_0004;
        const NAMED_DATA_OVERWRITE = 0x0000_0010;
        const NAMED_DATA_EXTEND = 0x0000_0020;
        const NAMED_DATA_TRUNCATION = 0x0000_0040;
        const FILE_CREATE = 0x0000_0100;
        const FILE_DELETE = 0x0000_0200;
        const EA_CHANGE = 0x0000_0400;
        const SECURITY_CHANGE = 0x0000_0800;
        const RENAME_OLD_NAME = 0x0000_1000;
        const RENAME_NEW_NAME = 0x0000_2000;
        const INDEXABLE_CHANGE = 0x0000_4000;
        const BASIC_INFO_CHANGE = 0x0000_8000;
        const HARD_LINK_CHANGE = 0x0001_0000;
        const COMPRESSION_CHANGE = 0x0002_0000;
        const ENCRYPTION_CHANGE = 0x0004_0000;
        const OBJECT_ID_CHANGE = 0x0008_0000;
        const REPARSE_POINT_CHANGE = 0x0010_0000;
        const STREAM_CHANGE = 0x0020_0000;
        const TRANSACTED_CHANGE = 0x0040_0000;
        const INTEGRITY_CHANGE = 0x0080_0000;
        const DESIRED_STORAGE_CLASS_CHANGE = 0x0100_0000;
        const CLOSE = 0x8000_0000;
    }
}

bitflags! {
    /// Who caused the change (`USN_SOURCE_*`).
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct SourceInfo: u32 {
        const DATA_MANAGEMENT = 0x0000_0001;
        const AUXILIARY_DATA = 0x0000_0002;
        const REPLICATION_MANAGEMENT = 0x0000_0004;
        const CLIENT_REPLICATION_MANAGEMENT = 0x0000_0008;
    }
}

bitflags! {
    /// NTFS file attribute flags (`FILE_ATTRIBUTE_*`).
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct FileAttributes: u32 {
        const READONLY = 0x0000_0001;
        const HIDDEN = 0x0000_0002;
        const SYSTEM = 0x0000_0004;
        const DIRECTORY = 0x0000_0010;
        const ARCHIVE = 0x0000_0020;
        const DEVICE = 0x0000_0040;
        const NORMAL = 0x0000_0080;
        const TEMPORARY = 0x0000_0100;
        const SPARSE_FILE = 0x0000_0200;
        const REPARSE_POINT = 0x0000_0400;
        const COMPRESSED = 0x0000_0800;
        const OFFLINE = 0x0000_1000;
        const NOT_CONTENT_INDEXED = 0x0000_2000;
        const ENCRYPTED = 0x0000_4000;
        const INTEGRITY_STREAM = 0x0000_8000;
        const VIRTUAL = 0x0001_0000;
        const NO_SCRUB_DATA = 0x0002_0000;
    }
}

impl UsnReason {
    /// Every bit, including ones without a name. Used as the "no filter" reason mask.
    pub const ALL: UsnReason = UsnReason::from_bits_retain(u32::MAX);
}

macro_rules! impl_names {
    ($($name:ident),+) => {
        $(
            impl $name {
                /// Names of the known flags that are set, in bit order.
                pub fn names(self) -> impl Iterator<Item = &'static str> {
                    self.iter_names().map(|(name, _)| name)
                }
            }
        )+
    };
}

impl_names!(UsnReason, SourceInfo, FileAttributes);

fn write_names(
    f: &mut fmt::Formatter<'_>,
    mut names: impl Iterator<Item = &'static str>,
) -> fmt::Result {
    match names.next() {
        Some(first) => {
            f.write_str(first)?;
            for name in names {
                write!(f, " | {}", name)?;
            }
            Ok(())
        }
        None => f.write_str("UNKNOWN"),
    }
}

impl fmt::Display for UsnReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write_names(f, self.names())
    }
}

impl fmt::Display for SourceInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            return f.write_str("NONE");
        }
        write_names(f, self.names())
    }
}

impl fmt::Display for FileAttributes {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write_names(f, self.names())
    }
}
